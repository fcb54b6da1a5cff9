//! Priority-ordered broadcast queue (spec §4.4). At most one live item per
//! logical name is retained — a fresher broadcast for the same name replaces
//! the older one outright rather than queuing both. Each item is retransmitted
//! up to `retransmit_limit = retransmit_mult * ceil(log10(n + 1))` times
//! before being dropped, `n` being the estimated cluster size at enqueue
//! time.

use parking_lot::Mutex;

/// Something that can be broadcast: carries an identity used for
/// single-live-item replacement, invalidation against a newer item, and its
/// encoded wire bytes.
pub trait Broadcast: Send + Sync {
    /// Identity used to dedupe/replace stale copies of the same logical
    /// update (e.g. a node name for `Alive`/`Suspect`/`Dead`).
    fn name(&self) -> Option<String>;
    /// Returns true if `self` obsoletes `other` (same name, newer content)
    /// and `other` should be dropped in favor of `self`.
    fn invalidates(&self, other: &dyn Broadcast) -> bool;
    fn message(&self) -> Vec<u8>;
}

struct Item {
    broadcast: Box<dyn Broadcast>,
    transmits: u32,
}

struct Inner {
    items: Vec<Item>,
}

/// Thread-safe broadcast queue. A single short-held lock guards the whole
/// vector; callers never hold it across I/O.
pub struct BroadcastQueue {
    inner: Mutex<Inner>,
    retransmit_mult: u32,
}

/// Default soft cap on queue length for [`BroadcastQueue::prune_over_cap`]
/// (spec §4.4 `Prune`). This is an internal safety valve against runaway
/// queue growth, not one of the §6 config-table knobs operators tune.
const DEFAULT_SOFT_CAP: usize = 8192;

impl BroadcastQueue {
    pub fn new(retransmit_mult: u32) -> Self {
        Self {
            inner: Mutex::new(Inner { items: Vec::new() }),
            retransmit_mult,
        }
    }

    /// `retransmit_limit = retransmit_mult * ceil(log10(n + 1))`, spec §4.4.
    pub fn retransmit_limit(&self, cluster_size: usize) -> u32 {
        let log = ((cluster_size as f64) + 1.0).log10().ceil().max(0.0) as u32;
        self.retransmit_mult * log.max(1)
    }

    /// Enqueues `broadcast`, dropping any existing item it invalidates.
    pub fn queue_broadcast(&self, broadcast: Box<dyn Broadcast>) {
        let mut inner = self.inner.lock();
        inner
            .items
            .retain(|item| !broadcast.invalidates(item.broadcast.as_ref()));
        inner.items.push(Item {
            broadcast,
            transmits: 0,
        });
    }

    /// Selects broadcasts to piggyback on an outgoing packet: fewest
    /// transmits first, skipping any that would not fit within `limit` minus
    /// `overhead`. Each selected item's transmit count is incremented and
    /// items past `retransmit_limit` are dropped from the queue afterward.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize, cluster_size: usize) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.items.sort_by_key(|item| item.transmits);

        let max_transmits = self.retransmit_limit(cluster_size);
        let mut out = Vec::new();
        let mut used = overhead;
        let mut consumed_idx = Vec::new();

        for (idx, item) in inner.items.iter_mut().enumerate() {
            let msg = item.broadcast.message();
            if used + msg.len() > limit {
                continue;
            }
            used += msg.len();
            item.transmits += 1;
            out.push(msg);
            if item.transmits >= max_transmits {
                consumed_idx.push(idx);
            }
        }

        for idx in consumed_idx.into_iter().rev() {
            inner.items.remove(idx);
        }
        out
    }

    /// Drops every queued broadcast for `name`, e.g. when a node is reaped
    /// and its pending `Alive`/`Suspect` chatter is no longer useful.
    pub fn prune_name(&self, name: &str) {
        let mut inner = self.inner.lock();
        inner
            .items
            .retain(|item| item.broadcast.name().as_deref() != Some(name));
    }

    /// `Prune()` (spec §4.4): discards items over [`DEFAULT_SOFT_CAP`],
    /// starting with the highest `transmits` count, i.e. the broadcasts that
    /// have already reached the most peers and are least likely to be missed.
    pub fn prune_over_cap(&self) {
        let mut inner = self.inner.lock();
        if inner.items.len() <= DEFAULT_SOFT_CAP {
            return;
        }
        inner.items.sort_by_key(|item| item.transmits);
        inner.items.truncate(DEFAULT_SOFT_CAP);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Msg {
        name: String,
        incarnation: u64,
        payload: Vec<u8>,
    }

    impl Broadcast for Msg {
        fn name(&self) -> Option<String> {
            Some(self.name.clone())
        }
        fn invalidates(&self, other: &dyn Broadcast) -> bool {
            other.name() == self.name()
        }
        fn message(&self) -> Vec<u8> {
            self.payload.clone()
        }
    }

    fn msg(name: &str, incarnation: u64) -> Box<dyn Broadcast> {
        Box::new(Msg {
            name: name.to_string(),
            incarnation,
            payload: vec![incarnation as u8; 4],
        })
    }

    #[test]
    fn newer_broadcast_replaces_older_same_name() {
        let q = BroadcastQueue::new(4);
        q.queue_broadcast(msg("n1", 1));
        q.queue_broadcast(msg("n1", 2));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn get_broadcasts_respects_limit() {
        let q = BroadcastQueue::new(4);
        q.queue_broadcast(msg("n1", 1));
        q.queue_broadcast(msg("n2", 1));
        let got = q.get_broadcasts(0, 4, 10);
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn retransmit_limit_scales_with_log_cluster_size() {
        let q = BroadcastQueue::new(4);
        assert_eq!(q.retransmit_limit(0), 4);
        assert_eq!(q.retransmit_limit(99), 8);
    }

    #[test]
    fn prune_name_drops_all_items_for_name() {
        let q = BroadcastQueue::new(4);
        q.queue_broadcast(msg("n1", 1));
        q.prune_name("n1");
        assert!(q.is_empty());
    }

    #[test]
    fn prune_over_cap_drops_highest_transmit_items_first() {
        let q = BroadcastQueue::new(4);
        for i in 0..(DEFAULT_SOFT_CAP + 10) {
            q.queue_broadcast(msg(&format!("n{i}"), 1));
        }
        // Each payload is 4 bytes; a 40-byte limit admits exactly the first
        // ten (insertion-order-tied) items, bumping their transmit count to 1
        // while everything else stays at 0.
        let got = q.get_broadcasts(0, 40, DEFAULT_SOFT_CAP + 10);
        assert_eq!(got.len(), 10);
        q.prune_over_cap();
        assert_eq!(q.len(), DEFAULT_SOFT_CAP);
    }
}
