//! # Reconciliation
//!
//! Merges a freshly observed peer batch into the cached directory.
//!
//! ## Decision Table (per node_id)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Merge Rules                                        │
//! │                                                                         │
//! │  cache only ──► fail_count + 1; dropped once it reaches 2               │
//! │  batch only ──► adopt batch                                             │
//! │                                                                         │
//! │  both present:                                                          │
//! │    both timed ─────────────────────► larger update_time (tie: batch)    │
//! │    cache timed only ───────────────► cache                              │
//! │    batch timed only ───────────────► batch                              │
//! │    untimed, batch !mdns,                                                │
//! │      cache mdns with remote_ip ────► cache data, batch source           │
//! │    untimed, batch !mdns ───────────► batch + cache remote_ip            │
//! │                                       + cache adapters if batch empty   │
//! │    otherwise ──────────────────────► batch                              │
//! │                                                                         │
//! │  Present in batch ⇒ fail_count = 0, whichever side won.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use tracing::debug;

use crate::types::{NodeRecord, PeerBatch, RegistryDirectory};

/// Consecutive missed cycles after which a cached record is dropped.
pub const FAIL_THRESHOLD: u32 = 2;

/// Which side of a conflict supplied the merged record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Cached record aged by one missed cycle.
    Aged,
    /// Cached record dropped after missing too many cycles.
    Expired,
    /// New node, taken from the batch.
    Added,
    /// Both timed, cache was fresher.
    CacheFresher,
    /// Both timed, batch was fresher or equal.
    BatchFresher,
    /// Only the cache carried a timestamp.
    CacheTimed,
    /// Only the batch carried a timestamp.
    BatchTimed,
    /// Untimed cloud/manual observation lost to a reachable mdns entry.
    /// The cached data is kept; the provenance becomes the batch's.
    /// The protection lasts one cycle: with the source no longer mdns, the
    /// next untimed cloud batch is taken as [`Resolution::BatchEnriched`].
    CacheMdnsReachable,
    /// Untimed cloud/manual observation, enriched from the cache.
    BatchEnriched,
    /// Batch taken as-is.
    BatchVerbatim,
}

/// Merges `batch` into `cache` and returns the new directory.
///
/// Pure: neither input is modified and no I/O is performed.
pub fn merge(batch: &PeerBatch, cache: &RegistryDirectory) -> RegistryDirectory {
    merge_with_report(batch, cache).0
}

/// Same as [`merge`], also returning the per-node resolution.
pub fn merge_with_report(
    batch: &PeerBatch,
    cache: &RegistryDirectory,
) -> (RegistryDirectory, Vec<(String, Resolution)>) {
    let mut merged = RegistryDirectory::new();
    let mut report = Vec::with_capacity(batch.len() + cache.len());

    for (node_id, cached) in cache.iter() {
        if batch.contains_key(node_id) {
            continue;
        }
        let missed = cached.fail_count.saturating_add(1);
        if missed >= FAIL_THRESHOLD {
            debug!(node_id = %node_id, missed, "Dropping node absent from consecutive batches");
            report.push((node_id.clone(), Resolution::Expired));
        } else {
            let mut kept = cached.clone();
            kept.fail_count = missed;
            merged.insert(kept);
            report.push((node_id.clone(), Resolution::Aged));
        }
    }

    for (node_id, incoming) in batch {
        let (mut record, resolution) = match cache.get(node_id) {
            None => (incoming.clone(), Resolution::Added),
            Some(cached) => resolve_conflict(incoming, cached),
        };
        debug!(node_id = %node_id, ?resolution, source = %record.source, "Merged node");
        record.node_id = node_id.clone();
        record.fail_count = 0;
        merged.insert(record);
        report.push((node_id.clone(), resolution));
    }

    debug_assert!(merged.check_invariants().is_ok());
    (merged, report)
}

/// Picks the winning record for a node present on both sides.
fn resolve_conflict(incoming: &NodeRecord, cached: &NodeRecord) -> (NodeRecord, Resolution) {
    match (incoming.update_time, cached.update_time) {
        (Some(batch_time), Some(cache_time)) => {
            if cache_time > batch_time {
                (cached.clone(), Resolution::CacheFresher)
            } else {
                (incoming.clone(), Resolution::BatchFresher)
            }
        }
        (None, Some(_)) => (cached.clone(), Resolution::CacheTimed),
        (Some(_), None) => (incoming.clone(), Resolution::BatchTimed),
        (None, None) if !incoming.source.is_mdns() => {
            if cached.source.is_mdns() && cached.remote_ip.is_some() {
                let mut kept = cached.clone();
                kept.source = incoming.source;
                return (kept, Resolution::CacheMdnsReachable);
            }
            let mut enriched = incoming.clone();
            if cached.remote_ip.is_some() {
                enriched.remote_ip = cached.remote_ip.clone();
            }
            if enriched.adapters.is_empty() && !cached.adapters.is_empty() {
                enriched.adapters = cached.adapters.clone();
            }
            (enriched, Resolution::BatchEnriched)
        }
        (None, None) => (incoming.clone(), Resolution::BatchVerbatim),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InterfaceInfo, RecordSource};
    use serde_json::json;

    fn batch_of(records: Vec<NodeRecord>) -> PeerBatch {
        records.into_iter().map(|r| (r.node_id.clone(), r)).collect()
    }

    fn dir_of(records: Vec<NodeRecord>) -> RegistryDirectory {
        records.into_iter().collect()
    }

    #[test]
    fn test_mdns_reachability_survives_untimed_cloud_snapshot() {
        let cache = dir_of(vec![
            NodeRecord::new("A", RecordSource::Mdns).with_remote_ip("10.0.0.5")
        ]);
        let batch = batch_of(vec![NodeRecord::new("A", RecordSource::Cloud)]);

        let merged = merge(&batch, &cache);
        let a = merged.get("A").unwrap();

        assert_eq!(a.remote_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(a.source, RecordSource::Cloud);
        assert_eq!(a.fail_count, 0);
    }

    #[test]
    fn test_reachable_mdns_entry_keeps_its_interfaces() {
        let cache = dir_of(vec![NodeRecord::new("A", RecordSource::Mdns)
            .with_remote_ip("10.0.0.5")
            .with_interface("eth0", InterfaceInfo::new("10.0.0.5", "aa").routable())]);
        let batch = batch_of(vec![NodeRecord::new("A", RecordSource::Cloud)
            .with_interface("eth0", InterfaceInfo::new("172.16.0.5", "aa").routable())
            .with_adapter("ttyUSB0", json!({"port": 7001}))]);

        let (merged, report) = merge_with_report(&batch, &cache);
        let a = merged.get("A").unwrap();
        assert_eq!(a.interfaces["eth0"].ip, "10.0.0.5");
        assert!(a.adapters.is_empty());
        assert_eq!(report[0].1, Resolution::CacheMdnsReachable);
    }

    #[test]
    fn test_mdns_protection_lasts_one_cycle() {
        let cache = dir_of(vec![NodeRecord::new("A", RecordSource::Mdns)
            .with_remote_ip("10.0.0.5")
            .with_interface("eth0", InterfaceInfo::new("10.0.0.5", "aa").routable())]);
        let batch = batch_of(vec![NodeRecord::new("A", RecordSource::Cloud)
            .with_interface("eth0", InterfaceInfo::new("172.16.0.5", "aa").routable())]);

        let (first, report) = merge_with_report(&batch, &cache);
        assert_eq!(report, vec![("A".to_string(), Resolution::CacheMdnsReachable)]);
        assert_eq!(first.get("A").unwrap().interfaces["eth0"].ip, "10.0.0.5");

        let (second, report) = merge_with_report(&batch, &first);
        assert_eq!(report, vec![("A".to_string(), Resolution::BatchEnriched)]);
        let a = second.get("A").unwrap();
        assert_eq!(a.interfaces["eth0"].ip, "172.16.0.5");
        assert_eq!(a.remote_ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_cloud_batch_inherits_remote_ip_from_cache() {
        let cache = dir_of(vec![
            NodeRecord::new("A", RecordSource::Cloud).with_remote_ip("10.0.0.5")
        ]);
        let batch = batch_of(vec![NodeRecord::new("A", RecordSource::Cloud)]);

        let (merged, report) = merge_with_report(&batch, &cache);
        let a = merged.get("A").unwrap();
        assert_eq!(a.remote_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(a.source, RecordSource::Cloud);
        assert_eq!(a.fail_count, 0);
        assert_eq!(report, vec![("A".to_string(), Resolution::BatchEnriched)]);
    }

    #[test]
    fn test_manual_cache_with_ip_yields_cloud_source_and_cached_ip() {
        let cache = dir_of(vec![NodeRecord::new("A", RecordSource::Manual)
            .with_remote_ip("10.0.0.5")
            .with_fail_count(1)]);
        let batch = batch_of(vec![NodeRecord::new("A", RecordSource::Cloud)]);

        let a = merge(&batch, &cache).get("A").cloned().unwrap();
        assert_eq!(a.remote_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(a.source, RecordSource::Cloud);
        assert_eq!(a.fail_count, 0);
    }

    #[test]
    fn test_fresher_cache_timestamp_wins() {
        let cache = dir_of(vec![NodeRecord::new("B", RecordSource::Cloud)
            .with_update_time(100.0)
            .with_remote_ip("10.0.0.9")]);
        let batch = batch_of(vec![
            NodeRecord::new("B", RecordSource::Cloud).with_update_time(50.0)
        ]);

        let b = merge(&batch, &cache).get("B").cloned().unwrap();
        assert_eq!(b.update_time, Some(100.0));
        assert_eq!(b.remote_ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn test_equal_timestamps_prefer_batch() {
        let cache = dir_of(vec![NodeRecord::new("B", RecordSource::Mdns)
            .with_update_time(100.0)
            .with_remote_ip("10.0.0.9")]);
        let batch = batch_of(vec![
            NodeRecord::new("B", RecordSource::Cloud).with_update_time(100.0)
        ]);

        let b = merge(&batch, &cache).get("B").cloned().unwrap();
        assert_eq!(b.source, RecordSource::Cloud);
        assert_eq!(b.remote_ip, None);
    }

    #[test]
    fn test_timestamped_side_outranks_untimed_side() {
        let cache = dir_of(vec![
            NodeRecord::new("T", RecordSource::Cloud).with_update_time(10.0),
            NodeRecord::new("U", RecordSource::Mdns).with_remote_ip("10.0.0.1"),
        ]);
        let batch = batch_of(vec![
            NodeRecord::new("T", RecordSource::Mdns).with_remote_ip("10.0.0.2"),
            NodeRecord::new("U", RecordSource::Cloud).with_update_time(5.0),
        ]);

        let merged = merge(&batch, &cache);
        assert_eq!(merged.get("T").unwrap().update_time, Some(10.0));
        assert_eq!(merged.get("T").unwrap().remote_ip, None);
        assert_eq!(merged.get("U").unwrap().source, RecordSource::Cloud);
        assert_eq!(merged.get("U").unwrap().remote_ip, None);
    }

    #[test]
    fn test_adapters_preserved_when_batch_is_thinner() {
        let cache = dir_of(vec![NodeRecord::new("A", RecordSource::Cloud)
            .with_adapter("ttyUSB0", json!({"port": 7001}))]);
        let batch = batch_of(vec![NodeRecord::new("A", RecordSource::Cloud)
            .with_interface("eth0", InterfaceInfo::new("10.0.0.7", "aa"))]);

        let a = merge(&batch, &cache).get("A").cloned().unwrap();
        assert!(a.adapters.contains_key("ttyUSB0"));
        assert!(a.interfaces.contains_key("eth0"));
    }

    #[test]
    fn test_untimed_mdns_batch_is_adopted_verbatim() {
        let cache = dir_of(vec![NodeRecord::new("A", RecordSource::Cloud)
            .with_remote_ip("10.0.0.5")
            .with_adapter("ttyUSB0", json!({"port": 7001}))]);
        let batch = batch_of(vec![
            NodeRecord::new("A", RecordSource::Mdns).with_remote_ip("192.168.0.3")
        ]);

        let (merged, report) = merge_with_report(&batch, &cache);
        let a = merged.get("A").unwrap();
        assert_eq!(a.remote_ip.as_deref(), Some("192.168.0.3"));
        assert!(a.adapters.is_empty());
        assert_eq!(report[0].1, Resolution::BatchVerbatim);
    }

    #[test]
    fn test_absent_node_ages_then_expires() {
        let cache = dir_of(vec![NodeRecord::new("C", RecordSource::Cloud)]);
        let empty = PeerBatch::new();

        let first = merge(&empty, &cache);
        assert_eq!(first.get("C").unwrap().fail_count, 1);

        let second = merge(&empty, &first);
        assert!(second.get("C").is_none());
    }

    #[test]
    fn test_node_with_one_miss_is_dropped_on_next_miss() {
        let cache = dir_of(vec![NodeRecord::new("C", RecordSource::Cloud).with_fail_count(1)]);
        let merged = merge(&PeerBatch::new(), &cache);
        assert!(!merged.contains("C"));
    }

    #[test]
    fn test_reappearing_node_resets_fail_count() {
        let cache = dir_of(vec![NodeRecord::new("C", RecordSource::Cloud)
            .with_update_time(500.0)
            .with_fail_count(1)]);
        let batch = batch_of(vec![
            NodeRecord::new("C", RecordSource::Cloud).with_update_time(1.0)
        ]);

        let c = merge(&batch, &cache).get("C").cloned().unwrap();
        assert_eq!(c.update_time, Some(500.0));
        assert_eq!(c.fail_count, 0);
    }

    #[test]
    fn test_new_node_is_adopted_unchanged() {
        let record = NodeRecord::new("D", RecordSource::Mdns)
            .with_remote_ip("10.9.9.9")
            .with_interface("eth0", InterfaceInfo::new("10.9.9.9", "cc").routable());
        let batch = batch_of(vec![record.clone()]);

        let merged = merge(&batch, &RegistryDirectory::new());
        assert_eq!(merged.get("D"), Some(&record));
    }

    #[test]
    fn test_merge_with_itself_is_stable() {
        let cache = dir_of(vec![
            NodeRecord::new("a", RecordSource::Mdns).with_remote_ip("10.0.0.1"),
            NodeRecord::new("b", RecordSource::Cloud)
                .with_remote_ip("10.0.0.2")
                .with_adapter("ttyUSB0", json!({"port": 7001})),
            NodeRecord::new("c", RecordSource::Manual).with_update_time(42.0),
            NodeRecord::new("d", RecordSource::Cloud),
        ]);
        let batch = cache.clone().into_batch();

        assert_eq!(merge(&batch, &cache), cache);
    }

    #[test]
    fn test_inputs_are_not_modified() {
        let cache = dir_of(vec![NodeRecord::new("x", RecordSource::Cloud)]);
        let batch = batch_of(vec![NodeRecord::new("y", RecordSource::Cloud)]);
        let cache_before = cache.clone();
        let batch_before = batch.clone();

        let merged = merge(&batch, &cache);
        assert_eq!(merged.len(), 2);
        assert_eq!(cache, cache_before);
        assert_eq!(batch, batch_before);
    }
}
