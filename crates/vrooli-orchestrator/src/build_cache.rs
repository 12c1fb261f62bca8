// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Build Cache
//!
//! Makes sure an app has a runnable artifact before it is spawned. Apps with
//! a Go API (`<app>/api/main.go`) are compiled into
//! `<cache>/<name>-api` whenever the cached binary is missing or older than
//! the source, and the cached binary is then copied to `<app>/api/<name>-api`.
//! Apps without that layout need no preparation.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// What [`BuildCache::prepare`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    /// The app has no recognised source layout.
    NotApplicable,
    /// The cached artifact was fresh and only copied into place.
    Cached,
    /// The artifact was recompiled.
    Rebuilt,
}

/// Per-supervisor cache of compiled app artifacts.
#[derive(Debug, Clone)]
pub struct BuildCache {
    cache_dir: PathBuf,
    go_binary: String,
}

impl BuildCache {
    /// Create a cache rooted at `cache_dir` that compiles with `go_binary`.
    pub fn new(cache_dir: impl Into<PathBuf>, go_binary: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            go_binary: go_binary.into(),
        }
    }

    /// Cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path of the cached artifact for `name`.
    pub fn cached_path(&self, name: &str) -> PathBuf {
        self.cache_dir.join(artifact_name(name))
    }

    /// Ensure `<app_root>/api/<name>-api` is present and built from the
    /// current source.
    pub async fn prepare(&self, name: &str, app_root: &Path) -> Result<BuildOutcome> {
        let api_dir = app_root.join("api");
        let source = api_dir.join("main.go");
        let Some(source_mtime) = mtime(&source) else {
            debug!(app = %name, "No Go API source, nothing to build");
            return Ok(BuildOutcome::NotApplicable);
        };

        let cached = self.cached_path(name);
        let target = api_dir.join(artifact_name(name));
        let failed = |reason: String| Error::BuildFailed {
            name: name.to_string(),
            reason,
        };

        let stale = match mtime(&cached) {
            Some(cached_mtime) => cached_mtime < source_mtime,
            None => true,
        };

        if stale {
            tokio::fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(|e| failed(format!("creating {}: {}", self.cache_dir.display(), e)))?;

            info!(app = %name, cache = %cached.display(), "Building Go API");
            let output = Command::new(&self.go_binary)
                .arg("build")
                .arg("-o")
                .arg(&cached)
                .arg(".")
                .current_dir(&api_dir)
                .output()
                .await
                .map_err(|e| failed(format!("running {}: {}", self.go_binary, e)))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(app = %name, status = %output.status, "Go build failed");
                return Err(failed(format!("{}: {}", output.status, stderr.trim())));
            }
        } else {
            debug!(app = %name, "Cached build is fresh");
        }

        tokio::fs::copy(&cached, &target)
            .await
            .map_err(|e| failed(format!("copying to {}: {}", target.display(), e)))?;
        tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(0o755))
            .await
            .map_err(|e| failed(format!("chmod {}: {}", target.display(), e)))?;

        Ok(if stale {
            BuildOutcome::Rebuilt
        } else {
            BuildOutcome::Cached
        })
    }
}

fn artifact_name(name: &str) -> String {
    format!("{}-api", name)
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// A stand-in compiler: `<script> build -o <out> .` writes a marker
    /// binary and counts invocations.
    fn fake_go(dir: &Path, exit_code: i32) -> PathBuf {
        let script = dir.join("fake-go");
        let counter = dir.join("builds");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho build >> {}\necho compiler says no >&2\nprintf '#!/bin/sh\\n' > \"$3\"\nexit {}\n",
                counter.display(),
                exit_code
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn builds(dir: &Path) -> usize {
        std::fs::read_to_string(dir.join("builds"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn app_with_source(dir: &Path) -> PathBuf {
        let root = dir.join("apps/a");
        std::fs::create_dir_all(root.join("api")).unwrap();
        std::fs::write(root.join("api/main.go"), "package main\n").unwrap();
        root
    }

    #[tokio::test]
    async fn test_app_without_source_is_not_applicable() {
        let dir = tempfile::TempDir::new().unwrap();
        let cache = BuildCache::new(dir.path().join("cache"), "/nonexistent/go");
        std::fs::create_dir_all(dir.path().join("apps/a")).unwrap();

        let outcome = cache.prepare("a", &dir.path().join("apps/a")).await.unwrap();
        assert_eq!(outcome, BuildOutcome::NotApplicable);
    }

    #[tokio::test]
    async fn test_rebuilds_only_when_stale() {
        let dir = tempfile::TempDir::new().unwrap();
        let go = fake_go(dir.path(), 0);
        let cache = BuildCache::new(dir.path().join("cache"), go.to_string_lossy());
        let root = app_with_source(dir.path());

        assert_eq!(cache.prepare("a", &root).await.unwrap(), BuildOutcome::Rebuilt);
        assert_eq!(builds(dir.path()), 1);

        let target = root.join("api/a-api");
        assert!(target.exists());
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        // Fresh cache: copy only
        assert_eq!(cache.prepare("a", &root).await.unwrap(), BuildOutcome::Cached);
        assert_eq!(builds(dir.path()), 1);

        // Source newer than cache: rebuild
        let later = SystemTime::now() + Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(root.join("api/main.go"))
            .unwrap()
            .set_modified(later)
            .unwrap();
        assert_eq!(cache.prepare("a", &root).await.unwrap(), BuildOutcome::Rebuilt);
        assert_eq!(builds(dir.path()), 2);
    }

    #[tokio::test]
    async fn test_compiler_failure_is_build_failed() {
        let dir = tempfile::TempDir::new().unwrap();
        let go = fake_go(dir.path(), 2);
        let cache = BuildCache::new(dir.path().join("cache"), go.to_string_lossy());
        let root = app_with_source(dir.path());

        let err = cache.prepare("a", &root).await.unwrap_err();
        assert_eq!(err.kind(), "BuildFailed");
        assert!(err.to_string().contains("compiler says no"));
        assert!(!root.join("api/a-api").exists());
    }
}
