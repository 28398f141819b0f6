//! # Cloud Directory Sync
//!
//! Federates nodes across sites through a shared directory blob.
//!
//! ## Sync Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CloudSync::cycle                                 │
//! │                                                                         │
//! │  local record ──► strip udev ──► stamp {update_time: now,               │
//! │                                         source: cloud}                  │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  push(record)          failure: logged, cycle continues                │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  pull() ──► batch      failure: empty batch (entries age)              │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  drop own node_id, stamp source: cloud                                 │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  merge(batch, store.get()) ──► store.persist(merged)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use consolenet_core::{merge_with_report, NodeRecord, PeerBatch, RecordSource, RegistryDirectory};
use tracing::{debug, error, info, warn};

use crate::coordinator::TaskBody;
use crate::error::{SyncError, SyncResult};
use crate::local::LocalNode;
use crate::store::{temp_path, RegistryStore};

// =============================================================================
// Cloud Collaborator
// =============================================================================

/// Opaque push/pull of the shared directory.
#[async_trait]
pub trait CloudDirectory: Send + Sync {
    /// Publishes the local record.
    async fn push(&self, record: &NodeRecord) -> SyncResult<()>;

    /// Fetches every record in the shared directory.
    async fn pull(&self) -> SyncResult<PeerBatch>;
}

// =============================================================================
// Shared-File Backend
// =============================================================================

/// [`CloudDirectory`] backed by a JSON blob on a shared volume.
#[derive(Debug, Clone)]
pub struct FileBlobCloud {
    path: PathBuf,
}

impl FileBlobCloud {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBlobCloud { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw blob contents; `None` when missing or blank.
    async fn read_raw(&self) -> SyncResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SyncError::CloudFailed(format!("read {}: {}", self.path.display(), e))),
        }
    }

    async fn read_blob(&self) -> SyncResult<RegistryDirectory> {
        match self.read_raw().await? {
            Some(bytes) => RegistryDirectory::from_json_slice(&bytes)
                .map_err(|e| SyncError::CloudFailed(format!("malformed blob: {}", e))),
            None => Ok(RegistryDirectory::new()),
        }
    }

    async fn write_blob(&self, directory: &RegistryDirectory) -> SyncResult<()> {
        let bytes = directory.to_json_pretty()?;
        let tmp = temp_path(&self.path);
        let write = async {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, &self.path).await
        };
        write
            .await
            .map_err(|e| SyncError::CloudFailed(format!("write {}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl CloudDirectory for FileBlobCloud {
    /// Read-modify-write. A malformed blob is replaced rather than left to
    /// fail every node's push.
    async fn push(&self, record: &NodeRecord) -> SyncResult<()> {
        let mut directory = match self.read_raw().await? {
            Some(bytes) => RegistryDirectory::from_json_slice(&bytes).unwrap_or_else(|e| {
                warn!(blob = ?self.path, error = %e, "Shared blob malformed, rewriting");
                RegistryDirectory::new()
            }),
            None => RegistryDirectory::new(),
        };
        directory.insert(record.clone());
        self.write_blob(&directory).await?;
        debug!(node_id = %record.node_id, blob = ?self.path, "Pushed local record");
        Ok(())
    }

    async fn pull(&self) -> SyncResult<PeerBatch> {
        Ok(self.read_blob().await?.into_batch())
    }
}

// =============================================================================
// Cloud Sync Task
// =============================================================================

/// Outcome of one cloud-sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub pushed: bool,
    pub pulled: usize,
    pub nodes: usize,
}

/// Cloud-sync task body. The only writer of the registry file.
pub struct CloudSync {
    cloud: Arc<dyn CloudDirectory>,
    local: Arc<dyn LocalNode>,
    store: Arc<RegistryStore>,
}

impl CloudSync {
    pub fn new(
        cloud: Arc<dyn CloudDirectory>,
        local: Arc<dyn LocalNode>,
        store: Arc<RegistryStore>,
    ) -> Self {
        CloudSync { cloud, local, store }
    }

    /// Push, pull, merge and persist.
    pub async fn cycle(&self) -> SyncResult<CycleReport> {
        let mut record = self.local.local_record().await?;
        record.strip_volatile_adapter_keys();
        record.source = RecordSource::Cloud;
        record.update_time = Some(now_epoch_secs());
        let own_id = record.node_id.clone();

        let pushed = match self.cloud.push(&record).await {
            Ok(()) => true,
            Err(e) => {
                warn!(node_id = %own_id, error = %e, "Cloud push failed");
                false
            }
        };

        let mut batch = match self.cloud.pull().await {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, "Cloud pull failed, merging an empty batch");
                PeerBatch::new()
            }
        };
        batch.remove(&own_id);
        for peer in batch.values_mut() {
            peer.source = RecordSource::Cloud;
        }
        let pulled = batch.len();

        let cache = self.store.get().await;
        let (merged, report) = merge_with_report(&batch, &cache);
        for (node_id, resolution) in &report {
            debug!(node_id = %node_id, ?resolution, "Merged");
        }

        let nodes = merged.len();
        if let Err(e) = self.store.persist(merged).await {
            error!(error = %e, path = ?self.store.path(), "Failed to persist registry");
            return Err(e);
        }

        info!(pushed, pulled, nodes, "Cloud sync complete");
        Ok(CycleReport { pushed, pulled, nodes })
    }
}

#[async_trait]
impl TaskBody for CloudSync {
    async fn run(&self) -> SyncResult<()> {
        self.cycle().await.map(|_| ())
    }
}

fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use consolenet_core::InterfaceInfo;
    use serde_json::json;
    use std::sync::Mutex;

    struct StaticNode(NodeRecord);

    #[async_trait]
    impl LocalNode for StaticNode {
        async fn local_record(&self) -> SyncResult<NodeRecord> {
            Ok(self.0.clone())
        }
    }

    struct DownCloud {
        pushes: Mutex<u32>,
    }

    #[async_trait]
    impl CloudDirectory for DownCloud {
        async fn push(&self, _: &NodeRecord) -> SyncResult<()> {
            *self.pushes.lock().unwrap() += 1;
            Err(SyncError::CloudFailed("offline".into()))
        }
        async fn pull(&self) -> SyncResult<PeerBatch> {
            Err(SyncError::CloudFailed("offline".into()))
        }
    }

    fn local_node() -> NodeRecord {
        NodeRecord::new("lab-a", RecordSource::Manual)
            .with_interface("eth0", InterfaceInfo::new("10.0.0.20", "aa").routable())
            .with_adapter("usb-FTDI", json!({"port": 7001, "udev": {"ID_MODEL": "FT232R"}}))
    }

    #[tokio::test]
    async fn test_file_blob_push_and_pull() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = FileBlobCloud::new(dir.path().join("shared").join("directory.json"));

        assert!(cloud.pull().await.unwrap().is_empty());

        cloud.push(&NodeRecord::new("lab-a", RecordSource::Cloud)).await.unwrap();
        cloud.push(&NodeRecord::new("lab-b", RecordSource::Cloud)).await.unwrap();
        cloud
            .push(&NodeRecord::new("lab-a", RecordSource::Cloud).with_update_time(5.0))
            .await
            .unwrap();

        let batch = cloud.pull().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch["lab-a"].update_time, Some(5.0));
    }

    #[tokio::test]
    async fn test_malformed_blob_is_cloud_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("directory.json");
        std::fs::write(&path, "[1, 2").unwrap();
        let err = FileBlobCloud::new(path).pull().await.unwrap_err();
        assert!(matches!(err, SyncError::CloudFailed(_)));
    }

    #[tokio::test]
    async fn test_push_repairs_malformed_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("directory.json");
        std::fs::write(&path, "{\"lab-b\": ").unwrap();
        let cloud = FileBlobCloud::new(&path);

        assert!(cloud.pull().await.is_err());

        cloud.push(&NodeRecord::new("lab-a", RecordSource::Cloud)).await.unwrap();
        let batch = cloud.pull().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(batch.contains_key("lab-a"));
        assert!(!dir.path().join("directory.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_cycle_pushes_stamped_record_and_excludes_self() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = Arc::new(FileBlobCloud::new(dir.path().join("directory.json")));
        cloud
            .push(&NodeRecord::new("lab-b", RecordSource::Mdns).with_update_time(10.0))
            .await
            .unwrap();

        let store = Arc::new(RegistryStore::new(dir.path().join("remotes.json"), None, 0o640));
        let sync = CloudSync::new(cloud.clone(), Arc::new(StaticNode(local_node())), store.clone());

        let report = sync.cycle().await.unwrap();
        assert_eq!(report, CycleReport { pushed: true, pulled: 1, nodes: 1 });

        let shared = cloud.pull().await.unwrap();
        let pushed = &shared["lab-a"];
        assert_eq!(pushed.source, RecordSource::Cloud);
        assert!(pushed.update_time.is_some());
        assert!(!pushed.adapters["usb-FTDI"].to_string().contains("udev"));

        let directory = store.get().await;
        assert!(!directory.contains("lab-a"));
        assert_eq!(directory.get("lab-b").unwrap().source, RecordSource::Cloud);
    }

    #[tokio::test]
    async fn test_cloud_failure_ages_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RegistryStore::new(dir.path().join("remotes.json"), None, 0o640));

        let mut cache = RegistryDirectory::new();
        cache.insert(NodeRecord::new("lab-c", RecordSource::Cloud).with_remote_ip("10.1.0.3"));
        store.persist(cache).await.unwrap();

        let cloud = Arc::new(DownCloud { pushes: Mutex::new(0) });
        let sync = CloudSync::new(cloud.clone(), Arc::new(StaticNode(local_node())), store.clone());

        let report = sync.cycle().await.unwrap();
        assert!(!report.pushed);
        assert_eq!(store.get().await.get("lab-c").unwrap().fail_count, 1);

        sync.cycle().await.unwrap();
        assert!(store.get().await.is_empty());
        assert_eq!(*cloud.pushes.lock().unwrap(), 2);
    }
}
