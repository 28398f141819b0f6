//! # Registry Store
//!
//! Owns the persisted directory file and the in-memory copy handed to
//! consumers.
//!
//! ## Write Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        persist(directory)                               │
//! │                                                                         │
//! │  1. take the write lock (one writer at a time)                         │
//! │  2. render JSON: sorted keys, 4-space indent                           │
//! │  3. write <file_name>.tmp, fsync (removed again on any failure)        │
//! │  4. chmod <mode>, chgrp <group> on the temp file                       │
//! │  5. rename over <path>   ◄── readers see old or new, never partial     │
//! │  6. swap the cached copy                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Ownership changes need privileges the agent may not have, so a failed
//! `chgrp` is logged and the write still succeeds.

use std::path::{Path, PathBuf};

use consolenet_core::RegistryDirectory;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::RegistrySettings;
use crate::error::{SyncError, SyncResult};

/// Persisted, cached node directory.
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    group: Option<String>,
    mode: u32,
    cache: RwLock<RegistryDirectory>,
}

impl RegistryStore {
    /// Creates a store for `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>, group: Option<String>, mode: u32) -> Self {
        RegistryStore {
            path: path.into(),
            group,
            mode,
            cache: RwLock::new(RegistryDirectory::new()),
        }
    }

    pub fn from_settings(settings: &RegistrySettings) -> Self {
        let group = Some(settings.group.clone()).filter(|g| !g.is_empty());
        Self::new(settings.path.clone(), group, settings.mode)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the persisted file into the cache.
    ///
    /// A missing, empty or unreadable file yields an empty directory.
    pub async fn load(&self) -> RegistryDirectory {
        let directory = read_directory(&self.path).await;
        info!(path = ?self.path, nodes = directory.len(), "Registry loaded");
        *self.cache.write().await = directory.clone();
        directory
    }

    /// Writes `directory` to disk and makes it the cached copy.
    pub async fn persist(&self, directory: RegistryDirectory) -> SyncResult<()> {
        debug_assert!(directory.check_invariants().is_ok(), "persisting inconsistent directory");

        let mut cache = self.cache.write().await;
        let bytes = directory.to_json_pretty()?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = temp_path(&self.path);
        if let Err(e) = self.replace_with(&tmp, &bytes).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                debug!(path = ?tmp, error = %cleanup, "Temp file not removed");
            }
            return Err(e);
        }

        debug!(path = ?self.path, nodes = directory.len(), bytes = bytes.len(), "Registry persisted");
        *cache = directory;
        Ok(())
    }

    /// Returns the cached copy without touching disk.
    pub async fn get(&self) -> RegistryDirectory {
        self.cache.read().await.clone()
    }

    async fn replace_with(&self, tmp: &Path, bytes: &[u8]) -> SyncResult<()> {
        tokio::fs::write(tmp, bytes).await?;
        tokio::fs::File::open(tmp).await?.sync_all().await?;
        self.apply_permissions(tmp).await?;
        tokio::fs::rename(tmp, &self.path).await?;
        Ok(())
    }

    #[cfg(unix)]
    async fn apply_permissions(&self, path: &Path) -> SyncResult<()> {
        use std::os::unix::fs::PermissionsExt;

        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(self.mode))
            .await
            .map_err(|e| SyncError::PermissionsFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        if let Some(group) = self.group.clone() {
            let target = path.to_path_buf();
            let outcome = tokio::task::spawn_blocking(move || chgrp(&target, &group))
                .await
                .map_err(|e| SyncError::Internal(format!("chgrp task: {}", e)))?;
            if let Err(e) = outcome {
                warn!(error = %e, "Could not set registry group ownership");
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn apply_permissions(&self, _path: &Path) -> SyncResult<()> {
        Ok(())
    }
}

async fn read_directory(path: &Path) -> RegistryDirectory {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(?path, "No registry file yet");
            return RegistryDirectory::new();
        }
        Err(e) => {
            warn!(?path, error = %e, "Registry file unreadable, starting empty");
            return RegistryDirectory::new();
        }
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return RegistryDirectory::new();
    }

    match RegistryDirectory::from_json_slice(&bytes) {
        Ok(directory) => match directory.check_invariants() {
            Ok(()) => directory,
            Err(e) => {
                warn!(?path, error = %e, "Registry keys out of step with records, re-keying");
                directory.records().cloned().collect()
            }
        },
        Err(e) => {
            warn!(?path, error = %e, "Registry file malformed, starting empty");
            RegistryDirectory::new()
        }
    }
}

/// `<file_name>.tmp` next to `path`.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Hands `path` to `group`, resolved through NSS. Blocking.
#[cfg(unix)]
fn chgrp(path: &Path, group: &str) -> SyncResult<()> {
    use nix::unistd::{chown, Group};

    let failed = |reason: String| SyncError::PermissionsFailed {
        path: path.display().to_string(),
        reason,
    };
    let entry = Group::from_name(group)
        .map_err(|e| failed(format!("group lookup for {}: {}", group, e)))?
        .ok_or_else(|| failed(format!("group {} not found", group)))?;
    chown(path, None, Some(entry.gid)).map_err(|e| failed(e.to_string()))
}
