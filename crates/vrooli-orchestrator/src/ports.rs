// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Port Registry
//!
//! Process-wide set of ports reserved by this supervisor. Availability is the
//! conjunction of "not reserved here" and "the OS accepts a bind on
//! localhost". The bind-probe runs while the reserved set is locked so two
//! reservers inside this process can never both win the same port.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::{Error, Result};

const LISTEN_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Registry of reserved port numbers.
#[derive(Debug, Default)]
pub struct PortRegistry {
    reserved: Mutex<BTreeSet<u16>>,
}

impl PortRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Atomically reserve `port`.
    ///
    /// Fails with [`Error::PortInUse`] if the port is already reserved or the
    /// bind-probe fails. The insert happens before the probe and is backed out
    /// when the probe fails.
    pub fn reserve(&self, port: u16) -> Result<()> {
        let mut reserved = self.lock();
        if !reserved.insert(port) {
            return Err(Error::PortInUse(port));
        }
        if !probe_bind(port) {
            reserved.remove(&port);
            return Err(Error::PortInUse(port));
        }
        debug!(port, "Reserved port");
        Ok(())
    }

    /// Reserve the first port in `range` that is available.
    pub fn reserve_first_available(&self, range: RangeInclusive<u16>) -> Option<u16> {
        let mut reserved = self.lock();
        for port in range {
            if reserved.contains(&port) || !probe_bind(port) {
                continue;
            }
            reserved.insert(port);
            debug!(port, "Reserved port from range");
            return Some(port);
        }
        None
    }

    /// Reserve `port` without probing the OS.
    ///
    /// Used for ports already held by the app's own running process, which
    /// the probe would otherwise reject. Fails only when the port is reserved
    /// by another app.
    pub fn claim(&self, port: u16) -> Result<()> {
        if self.lock().insert(port) {
            debug!(port, "Claimed port held by an adoptable process");
            Ok(())
        } else {
            Err(Error::PortInUse(port))
        }
    }

    /// Release `port`. Idempotent.
    pub fn release(&self, port: u16) {
        if self.lock().remove(&port) {
            debug!(port, "Released port");
        }
    }

    /// True iff `port` is not reserved here and a bind-probe succeeds.
    pub fn is_available(&self, port: u16) -> bool {
        let reserved = self.lock();
        !reserved.contains(&port) && probe_bind(port)
    }

    /// True iff `port` is reserved here.
    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Snapshot of every reserved port, ascending.
    pub fn allocated(&self) -> Vec<u16> {
        self.lock().iter().copied().collect()
    }
}

/// Bind a TCP socket on `(localhost, port)` and close it immediately.
///
/// Returns whether the OS accepted the bind.
pub fn probe_bind(port: u16) -> bool {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(_) => false,
    }
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub async fn is_listening(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(LISTEN_PROBE_TIMEOUT, tokio::net::TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_reserve_and_release() {
        let registry = PortRegistry::new();
        let port = free_port();

        registry.reserve(port).unwrap();
        assert!(registry.is_reserved(port));
        assert!(!registry.is_available(port));
        assert!(matches!(registry.reserve(port), Err(Error::PortInUse(p)) if p == port));

        registry.release(port);
        registry.release(port);
        assert!(!registry.is_reserved(port));
        assert!(registry.is_available(port));
    }

    #[tokio::test]
    async fn test_reserve_fails_when_os_holds_port() {
        let registry = PortRegistry::new();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(matches!(registry.reserve(port), Err(Error::PortInUse(_))));
        // The failed probe must not leave the port reserved
        assert!(!registry.is_reserved(port));
        assert!(is_listening(port).await);

        drop(listener);
        assert!(!is_listening(port).await);
    }

    #[test]
    fn test_reserve_first_available_skips_taken_ports() {
        let registry = PortRegistry::new();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        // Skip the edge of the port space so busy + 2 stays in range
        if busy > u16::MAX - 3 {
            return;
        }

        let got = registry.reserve_first_available(busy..=busy + 2);
        assert_ne!(got, Some(busy));
        assert!(!registry.is_reserved(busy));
    }

    #[test]
    fn test_claim_ignores_os_but_not_registry() {
        let registry = PortRegistry::new();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        registry.claim(port).unwrap();
        assert!(registry.is_reserved(port));
        assert!(matches!(registry.claim(port), Err(Error::PortInUse(_))));
        assert_eq!(registry.allocated(), vec![port]);
    }

    #[test]
    fn test_concurrent_reservers_never_share_a_port() {
        use std::sync::Arc;

        let registry = Arc::new(PortRegistry::new());
        let port = free_port();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.reserve(port).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
