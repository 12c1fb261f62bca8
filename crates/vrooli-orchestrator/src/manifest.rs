// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! App manifest (`<app>/.vrooli/service.json`).
//!
//! Only `enabled` and `ports` are interpreted; every other field is kept
//! opaque. Port declarations are validated up front so discovery never
//! coerces a malformed entry into something it isn't.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

/// Manifest location relative to the app root.
pub const MANIFEST_PATH: &str = ".vrooli/service.json";

/// Path of the manifest for the app rooted at `app_root`.
pub fn manifest_path(app_root: &Path) -> PathBuf {
    app_root.join(MANIFEST_PATH)
}

/// How a port role is resolved at discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    /// Exactly this port.
    Fixed(u16),
    /// First available port in `lo..=hi`.
    Range {
        /// Lower bound, inclusive.
        lo: u16,
        /// Upper bound, inclusive.
        hi: u16,
    },
}

impl PortSpec {
    /// Candidate ports in probe order.
    pub fn candidates(&self) -> RangeInclusive<u16> {
        match *self {
            PortSpec::Fixed(port) => port..=port,
            PortSpec::Range { lo, hi } => lo..=hi,
        }
    }
}

/// Parsed manifest.
#[derive(Debug, Clone)]
pub struct ServiceManifest {
    /// Whether the app may be started.
    pub enabled: bool,
    /// Port role name to resolution rule.
    pub ports: BTreeMap<String, PortSpec>,
}

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    ports: BTreeMap<String, RawPort>,
}

#[derive(Deserialize)]
struct RawPort {
    fixed: Option<u16>,
    range: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl ServiceManifest {
    /// Parse a manifest document. `path` is only used in error messages.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let invalid = |reason: String| Error::ManifestInvalid {
            path: path.to_path_buf(),
            reason,
        };

        let raw: RawManifest = serde_json::from_str(text).map_err(|e| invalid(e.to_string()))?;

        let mut ports = BTreeMap::new();
        for (role, decl) in raw.ports {
            let spec = match (decl.fixed, decl.range) {
                (Some(port), None) => PortSpec::Fixed(port),
                (None, Some(range)) => {
                    parse_range(&range).map_err(|reason| invalid(format!("port '{role}': {reason}")))?
                }
                (Some(_), Some(_)) => {
                    return Err(invalid(format!(
                        "port '{role}' declares both 'fixed' and 'range'"
                    )));
                }
                (None, None) => {
                    return Err(invalid(format!(
                        "port '{role}' must declare 'fixed' or 'range'"
                    )));
                }
            };
            ports.insert(role, spec);
        }

        Ok(Self {
            enabled: raw.enabled,
            ports,
        })
    }

    /// Read and parse the manifest of the app rooted at `app_root`.
    pub fn load(app_root: &Path) -> Result<Self> {
        let path = manifest_path(app_root);
        let text = std::fs::read_to_string(&path).map_err(|e| Error::ManifestInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, &path)
    }
}

fn parse_range(range: &str) -> std::result::Result<PortSpec, String> {
    let (lo, hi) = range
        .split_once('-')
        .ok_or_else(|| format!("range '{range}' is not of the form <lo>-<hi>"))?;
    let lo: u16 = lo
        .trim()
        .parse()
        .map_err(|_| format!("range '{range}' has an invalid lower bound"))?;
    let hi: u16 = hi
        .trim()
        .parse()
        .map_err(|_| format!("range '{range}' has an invalid upper bound"))?;
    if lo > hi {
        return Err(format!("range '{range}' has lo > hi"));
    }
    Ok(PortSpec::Range { lo, hi })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ServiceManifest> {
        ServiceManifest::parse(text, Path::new("service.json"))
    }

    #[test]
    fn test_parse_fixed_and_range() {
        let manifest = parse(
            r#"{
                "service": {"name": "a", "version": "1.0"},
                "ports": {
                    "api": {"fixed": 18101},
                    "ui": {"range": "18110-18115", "description": "web ui"}
                }
            }"#,
        )
        .unwrap();

        assert!(manifest.enabled);
        assert_eq!(manifest.ports["api"], PortSpec::Fixed(18101));
        assert_eq!(
            manifest.ports["ui"],
            PortSpec::Range {
                lo: 18110,
                hi: 18115
            }
        );
        assert_eq!(manifest.ports["ui"].candidates().count(), 6);
    }

    #[test]
    fn test_parse_disabled_without_ports() {
        let manifest = parse(r#"{"enabled": false}"#).unwrap();
        assert!(!manifest.enabled);
        assert!(manifest.ports.is_empty());
    }

    #[test]
    fn test_single_port_range() {
        let manifest = parse(r#"{"ports": {"api": {"range": "18200-18200"}}}"#).unwrap();
        assert_eq!(
            manifest.ports["api"].candidates().collect::<Vec<_>>(),
            vec![18200]
        );
    }

    #[test]
    fn test_rejects_malformed_ports() {
        let cases = [
            r#"{"ports": {"api": {"range": "18200"}}}"#,
            r#"{"ports": {"api": {"range": "18300-18200"}}}"#,
            r#"{"ports": {"api": {"range": "a-b"}}}"#,
            r#"{"ports": {"api": {"fixed": 1, "range": "1-2"}}}"#,
            r#"{"ports": {"api": {}}}"#,
            r#"{"ports": {"api": {"fixed": 70000}}}"#,
            r#"{"ports": {"api": {"fixed": "18101"}}}"#,
            r#"{"enabled": "yes"}"#,
            "not json",
        ];

        for text in cases {
            let err = parse(text).unwrap_err();
            assert_eq!(err.kind(), "ManifestInvalid", "case: {}", text);
        }
    }

    #[test]
    fn test_load_missing_manifest() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = ServiceManifest::load(dir.path()).unwrap_err();
        assert_eq!(err.kind(), "ManifestInvalid");
    }
}
