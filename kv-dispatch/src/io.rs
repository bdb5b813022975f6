//! Collaborator traits through which the dispatcher reaches the outside world.
//!
//! The dispatcher never touches sockets, timers or the configuration source
//! directly. It asks an [`IoHandler`] to do so, and the event loop behind that
//! handler reports back through the `Dispatcher::on_*` entry points.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::pipeline::NodeId;
use crate::topology::TopologySnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Timeout sweep for one pipeline.
    Pipeline(NodeId),
    /// Next release from the retry queue.
    Retry,
    /// Next poll round of one durability request.
    Durability(u64),
    /// Earliest deadline among packets waiting for a map with an owner.
    MapWait,
}

pub trait IoHandler {
    /// Starts connecting `node` to `addr`; completion is reported through
    /// `on_connected` or `on_connect_failed`.
    fn connect(&mut self, node: NodeId, addr: &str);

    /// Queues `bytes` for transmission. Returns false if the transport cannot
    /// take them now, in which case the caller keeps them queued.
    fn schedule_write(&mut self, node: NodeId, bytes: Bytes) -> bool;

    /// Tears down the connection; `on_closed` follows once it is gone.
    fn close(&mut self, node: NodeId);

    /// Arms (or re-arms) `id` to fire at `deadline`.
    fn arm_timer(&mut self, id: TimerId, deadline: Instant);

    fn cancel_timer(&mut self, id: TimerId);

    /// Asks for one `flush_dirty` pass on the next loop iteration.
    fn request_flush(&mut self);

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Source of cluster maps.
pub trait ConfigProvider {
    fn current_snapshot(&self) -> Option<Arc<TopologySnapshot>>;

    /// Offers a map a node sent back with a not-my-partition reply. Returns
    /// the snapshot if it is newer than the current one.
    fn update_from_node(&mut self, host: &str, payload: &[u8]) -> Option<Arc<TopologySnapshot>>;

    /// Asks for a fresh map to be fetched in the background.
    fn request_refresh(&mut self);
}

/// Rate limit on refresh requests sent to the [`ConfigProvider`].
///
/// The first request for a given map generation always goes through. Further
/// requests against the same generation are held back until `interval` has
/// passed since the last one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshThrottle {
    interval: Duration,
    last: Option<(u64, Instant)>,
}

impl RefreshThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn permit(&mut self, generation: u64, now: Instant) -> bool {
        if let Some((seen, at)) = self.last {
            if seen == generation && now < at + self.interval {
                return false;
            }
        }
        self.last = Some((generation, now));
        true
    }
}

/// Holds whatever map it was last given; refreshes are only logged.
#[derive(Debug, Default)]
pub struct StaticConfig {
    current: Option<Arc<TopologySnapshot>>,
    refreshes: u64,
}

impl StaticConfig {
    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self {
            current: Some(Arc::new(snapshot)),
            refreshes: 0,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn refreshes_requested(&self) -> u64 {
        self.refreshes
    }
}

impl ConfigProvider for StaticConfig {
    fn current_snapshot(&self) -> Option<Arc<TopologySnapshot>> {
        self.current.clone()
    }

    fn update_from_node(&mut self, host: &str, payload: &[u8]) -> Option<Arc<TopologySnapshot>> {
        let snapshot = match TopologySnapshot::from_json(payload) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(node = %host, error = %err, "ignoring unparsable cluster map");
                return None;
            }
        };
        let current = self.current.as_ref().map_or(0, |topo| topo.generation());
        if snapshot.generation() <= current {
            debug!(node = %host, generation = snapshot.generation(), current, "cluster map not newer");
            return None;
        }
        let snapshot = Arc::new(snapshot);
        self.current = Some(Arc::clone(&snapshot));
        Some(snapshot)
    }

    fn request_refresh(&mut self) {
        self.refreshes += 1;
        debug!(requests = self.refreshes, "cluster map refresh requested");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::NodeInfo;

    #[test]
    fn static_config_accepts_only_newer_maps() {
        let nodes = vec![NodeInfo::new("127.0.0.1", 11210)];
        let v2 = TopologySnapshot::uniform(2, nodes.clone(), 4, 0).expect("topology");
        let v1 = TopologySnapshot::uniform(1, nodes.clone(), 4, 0).expect("topology");
        let v3 = TopologySnapshot::uniform(3, nodes, 4, 0).expect("topology");
        let mut config = StaticConfig::new(v2);

        let stale = v1.to_json().expect("json");
        assert!(config.update_from_node("n0", &stale).is_none());
        assert!(config.update_from_node("n0", b"not json").is_none());

        let fresh = v3.to_json().expect("json");
        let applied = config.update_from_node("n0", &fresh).expect("newer map");
        assert_eq!(applied.generation(), 3);
        assert_eq!(config.current_snapshot().map(|t| t.generation()), Some(3));
    }

    #[test]
    fn throttle_allows_one_refresh_per_generation_and_interval() {
        let start = Instant::now();
        let mut throttle = RefreshThrottle::new(Duration::from_secs(10));
        assert!(throttle.permit(4, start));
        assert!(!throttle.permit(4, start + Duration::from_millis(10)));
        assert!(!throttle.permit(4, start + Duration::from_secs(9)));
        assert!(throttle.permit(5, start + Duration::from_secs(9)));
        assert!(!throttle.permit(5, start + Duration::from_secs(10)));
        assert!(throttle.permit(5, start + Duration::from_secs(19)));
    }
}
