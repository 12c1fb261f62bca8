// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fork-bomb detector.
//!
//! A sliding window over recent child-start timestamps. The supervisor asks
//! it before every spawn; once the window holds `max_starts` entries further
//! starts are refused until old entries age out.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Shared start-rate limiter.
#[derive(Debug)]
pub struct ForkBombDetector {
    window: Duration,
    max_starts: usize,
    starts: Mutex<VecDeque<Instant>>,
}

/// Point-in-time view of the detector, reported by `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct ForkBombSnapshot {
    /// Starts per second averaged over the window.
    pub rate: f64,
    /// Starts currently inside the window.
    pub recent_starts: usize,
    /// Ceiling for `recent_starts`.
    pub max_starts: usize,
    /// Window length in seconds.
    pub window_seconds: u64,
}

impl ForkBombDetector {
    /// Create a detector allowing `max_starts` starts per `window`.
    pub fn new(max_starts: usize, window: Duration) -> Self {
        Self {
            window,
            max_starts,
            starts: Mutex::new(VecDeque::with_capacity(max_starts)),
        }
    }

    fn pruned(&self, now: Instant) -> MutexGuard<'_, VecDeque<Instant>> {
        let mut starts = self.starts.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(oldest) = starts.front() {
            if now.duration_since(*oldest) >= self.window {
                starts.pop_front();
            } else {
                break;
            }
        }
        starts
    }

    /// Record a start attempt.
    ///
    /// Returns false, without recording, when the window is already full.
    pub fn record_start(&self) -> bool {
        let now = Instant::now();
        let mut starts = self.pruned(now);
        if starts.len() >= self.max_starts {
            return false;
        }
        starts.push_back(now);
        true
    }

    /// Starts currently inside the window.
    pub fn recent_starts(&self) -> usize {
        self.pruned(Instant::now()).len()
    }

    /// Starts per second averaged over the window.
    pub fn get_rate(&self) -> f64 {
        self.rate_of(self.recent_starts())
    }

    fn rate_of(&self, starts: usize) -> f64 {
        let secs = self.window.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        starts as f64 / secs
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Ceiling on starts per window.
    pub fn max_starts(&self) -> usize {
        self.max_starts
    }

    /// Snapshot for status reporting.
    pub fn snapshot(&self) -> ForkBombSnapshot {
        let recent_starts = self.recent_starts();
        ForkBombSnapshot {
            rate: self.rate_of(recent_starts),
            recent_starts,
            max_starts: self.max_starts,
            window_seconds: self.window.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ceiling_enforced() {
        let detector = ForkBombDetector::new(3, Duration::from_secs(60));

        assert!(detector.record_start());
        assert!(detector.record_start());
        assert!(detector.record_start());
        assert!(!detector.record_start());
        assert!(!detector.record_start());

        // Rejected starts are not recorded
        assert_eq!(detector.recent_starts(), 3);
    }

    #[test]
    fn test_rate_averaged_over_window() {
        let detector = ForkBombDetector::new(10, Duration::from_secs(10));
        for _ in 0..5 {
            assert!(detector.record_start());
        }
        assert!((detector.get_rate() - 0.5).abs() < f64::EPSILON);

        let snapshot = detector.snapshot();
        assert_eq!(snapshot.recent_starts, 5);
        assert_eq!(snapshot.max_starts, 10);
        assert_eq!(snapshot.window_seconds, 10);
        assert!((snapshot.rate - detector.get_rate()).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_window_reports_zero_rate() {
        let detector = ForkBombDetector::new(3, Duration::ZERO);
        detector.record_start();
        assert_eq!(detector.get_rate(), 0.0);
        assert_eq!(detector.snapshot().rate, 0.0);
    }

    #[test]
    fn test_entries_expire() {
        let detector = ForkBombDetector::new(2, Duration::from_millis(50));
        assert!(detector.record_start());
        assert!(detector.record_start());
        assert!(!detector.record_start());

        std::thread::sleep(Duration::from_millis(80));

        assert_eq!(detector.recent_starts(), 0);
        assert!(detector.record_start());
    }
}
