//! Socket owner cache used to attribute flows to processes

use dashmap::DashMap;
use flowscope::process::{ProcessInfo, ProcessInfoCache, TcpStatsData, TrafficDirection};
use flowscope_common::Tuple;
use std::sync::Arc;

/// Thread-safe map from a flow and its direction to the owning process
#[derive(Clone, Default)]
pub struct ProcessCache {
    inner: Arc<DashMap<(Tuple, TrafficDirection), ProcessInfo>>,
}

impl ProcessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update the owner of `tuple` in `direction`
    pub fn insert(&self, tuple: Tuple, direction: TrafficDirection, name: &str, pid: u32, arguments: &str) {
        let mut entry = self.inner.entry((tuple, direction)).or_default();
        entry.tuple = Some(tuple);
        entry.name = name.to_string();
        entry.pid = pid;
        entry.arguments = arguments.to_string();
    }

    /// Store a fresh socket statistics sample. Returns false when the
    /// socket has no known owner.
    pub fn record_tcp_stats(&self, tuple: &Tuple, direction: TrafficDirection, mut stats: TcpStatsData) -> bool {
        match self.inner.get_mut(&(*tuple, direction)) {
            Some(mut entry) => {
                stats.is_dirty = true;
                entry.tcp_stats = stats;
                true
            }
            None => false,
        }
    }

    /// Remove both directions of `tuple`
    pub fn remove(&self, tuple: &Tuple) {
        self.inner.remove(&(*tuple, TrafficDirection::Inbound));
        self.inner.remove(&(*tuple, TrafficDirection::Outbound));
    }

    /// Remove every socket owned by `pid`
    pub fn remove_pid(&self, pid: u32) {
        self.inner.retain(|_, v| v.pid != pid);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl ProcessInfoCache for ProcessCache {
    fn lookup(&self, tuple: &Tuple, direction: TrafficDirection) -> Option<ProcessInfo> {
        self.inner.get(&(*tuple, direction)).map(|r| r.clone())
    }

    fn update(&self, tuple: &Tuple, dirty: bool) {
        for direction in [TrafficDirection::Inbound, TrafficDirection::Outbound] {
            if let Some(mut entry) = self.inner.get_mut(&(*tuple, direction)) {
                entry.tcp_stats.is_dirty = dirty;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowscope_common::protocol;

    fn tuple() -> Tuple {
        Tuple::from_ips(
            "10.0.0.1".parse().expect("ip"),
            "10.0.0.2".parse().expect("ip"),
            protocol::TCP,
            40000,
            443,
        )
    }

    #[test]
    fn test_process_cache_insert_lookup() {
        let cache = ProcessCache::new();
        cache.insert(tuple(), TrafficDirection::Outbound, "curl", 42, "curl https://example.com");

        let info = cache
            .lookup(&tuple(), TrafficDirection::Outbound)
            .expect("Should find entry");
        assert_eq!(info.name, "curl");
        assert_eq!(info.pid, 42);
        assert_eq!(info.tuple, Some(tuple()));
        assert!(cache.lookup(&tuple(), TrafficDirection::Inbound).is_none());
    }

    #[test]
    fn test_tcp_stats_dirty_flag() {
        let cache = ProcessCache::new();
        assert!(!cache.record_tcp_stats(&tuple(), TrafficDirection::Outbound, TcpStatsData::default()));

        cache.insert(tuple(), TrafficDirection::Outbound, "curl", 42, "");
        let stats = TcpStatsData {
            smooth_rtt: 120,
            mss: 1460,
            ..Default::default()
        };
        assert!(cache.record_tcp_stats(&tuple(), TrafficDirection::Outbound, stats));
        let info = cache.lookup(&tuple(), TrafficDirection::Outbound).expect("entry");
        assert!(info.tcp_stats.is_dirty);
        assert_eq!(info.tcp_stats.smooth_rtt, 120);

        cache.update(&tuple(), false);
        let info = cache.lookup(&tuple(), TrafficDirection::Outbound).expect("entry");
        assert!(!info.tcp_stats.is_dirty);
    }

    #[test]
    fn test_process_cache_remove_pid() {
        let cache = ProcessCache::new();
        cache.insert(tuple(), TrafficDirection::Outbound, "curl", 42, "");
        cache.insert(tuple(), TrafficDirection::Inbound, "nginx", 7, "");
        assert_eq!(cache.len(), 2);

        cache.remove_pid(42);
        assert_eq!(cache.len(), 1);
        cache.remove(&tuple());
        assert!(cache.is_empty());
    }
}
