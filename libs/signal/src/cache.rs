use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use weft_model::NodeId;

use crate::wire::PeerAddress;

/// Bounded-lifetime mapping from node id to presence-service address.
///
/// Entries are fresh while `now - inserted_at < expiry`; a stale entry is
/// evicted on lookup, and [`scavenge`](JidCache::scavenge) sweeps the rest.
/// Shared between the transport task (writes) and the controller (reads).
pub struct JidCache {
    entries: Mutex<HashMap<NodeId, (PeerAddress, Instant)>>,
    expiry: Duration,
}

impl JidCache {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    /// Upserts an entry, returning its insertion time.
    pub fn add(&self, node_id: NodeId, address: PeerAddress, now: Instant) -> Instant {
        self.entries.lock().insert(node_id, (address, now));

        now
    }

    pub fn lookup(&self, node_id: &NodeId, now: Instant) -> Option<PeerAddress> {
        let mut entries = self.entries.lock();

        match entries.get(node_id) {
            Some((address, inserted_at)) if now.duration_since(*inserted_at) < self.expiry => {
                Some(address.clone())
            }
            Some(_) => {
                entries.remove(node_id);
                None
            }
            None => None,
        }
    }

    pub fn scavenge(&self, now: Instant) {
        self.entries
            .lock()
            .retain(|_, (_, inserted_at)| now.duration_since(*inserted_at) < self.expiry);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> JidCache {
        JidCache::new(Duration::from_secs(2))
    }

    #[test]
    fn fresh_entries_resolve_and_stale_ones_are_evicted() {
        let cache = cache();
        let t0 = Instant::now();
        let peer = NodeId::from("p1");

        cache.add(peer.clone(), PeerAddress::from("p1@signal"), t0);

        assert_eq!(
            cache.lookup(&peer, t0 + Duration::from_secs(1)),
            Some(PeerAddress::from("p1@signal"))
        );
        assert_eq!(cache.lookup(&peer, t0 + Duration::from_secs(3)), None);
        // The stale entry is gone, not just hidden.
        assert!(cache.is_empty());
    }

    #[test]
    fn add_refreshes_the_lifetime() {
        let cache = cache();
        let t0 = Instant::now();
        let peer = NodeId::from("p1");

        cache.add(peer.clone(), PeerAddress::from("p1@signal"), t0);
        cache.add(peer.clone(), PeerAddress::from("p1@signal"), t0 + Duration::from_secs(1));

        assert!(cache
            .lookup(&peer, t0 + Duration::from_secs(2))
            .is_some());
    }

    #[test]
    fn scavenge_sweeps_only_stale_entries() {
        let cache = cache();
        let t0 = Instant::now();

        cache.add(NodeId::from("old"), PeerAddress::from("old@signal"), t0);
        cache.add(
            NodeId::from("new"),
            PeerAddress::from("new@signal"),
            t0 + Duration::from_secs(3),
        );

        cache.scavenge(t0 + Duration::from_secs(4));

        assert_eq!(cache.len(), 1);
        assert!(cache
            .lookup(&NodeId::from("new"), t0 + Duration::from_secs(4))
            .is_some());
    }
}
