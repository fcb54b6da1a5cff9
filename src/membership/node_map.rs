//! Name-indexed map of known members plus the SWIM merge rules that decide
//! whether an incoming `Alive`/`Suspect`/`Dead` update should change local
//! state (spec §3, §4.5 "membership layer" half — the intent-aware half
//! lives in [`crate::orchestration::state_machine`]).

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;

use crate::common::Name;
use crate::membership::{NodeInfo, NodeState, VersionVector};

use std::net::SocketAddr;

/// Outcome of applying an incoming update to the local node map. Callers use
/// this to decide whether to re-broadcast the update and whether to emit a
/// membership event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The update was newer than our local record and applied.
    Applied,
    /// The update referred to an unknown node and was applied as a new entry.
    NewNode,
    /// The update was stale (lower incarnation, or tried to resurrect a
    /// `Left`/`Dead` node without a strictly higher incarnation) and ignored.
    Stale,
    /// The update concerned the local node itself; handled by refutation
    /// rather than the normal merge path.
    SelfConflict,
}

struct Inner {
    nodes: HashMap<Name, NodeInfo>,
    /// Names that left or died, retained for `gossip_to_the_dead_time` so
    /// they keep propagating without being probe-eligible again (open
    /// question decision #1).
    recently_dead: HashMap<Name, Instant>,
}

/// Thread-safe index of all known cluster members.
pub struct NodeMap {
    local: Name,
    inner: RwLock<Inner>,
}

impl NodeMap {
    pub fn new(local: Name) -> Self {
        Self {
            local,
            inner: RwLock::new(Inner {
                nodes: HashMap::new(),
                recently_dead: HashMap::new(),
            }),
        }
    }

    pub fn get(&self, name: &Name) -> Option<NodeInfo> {
        self.inner.read().nodes.get(name).cloned()
    }

    pub fn contains(&self, name: &Name) -> bool {
        self.inner.read().nodes.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all members, for anti-entropy push/pull and for the
    /// random probe-target selection in the SWIM loop.
    pub fn all(&self) -> Vec<NodeInfo> {
        self.inner.read().nodes.values().cloned().collect()
    }

    /// Members currently eligible as probe targets: everyone except the
    /// local node and anyone terminal (`Dead`/`Left`).
    pub fn probe_candidates(&self) -> Vec<NodeInfo> {
        self.inner
            .read()
            .nodes
            .values()
            .filter(|n| n.name != self.local && !n.state.is_terminal())
            .cloned()
            .collect()
    }

    /// Members eligible to *receive* gossip: alive peers plus anyone
    /// `Dead`/`Left` within `gossip_to_the_dead_time` (spec §4.6, SPEC_FULL.md
    /// open-question decision #1) — broader than `probe_candidates`, which
    /// excludes terminal nodes outright since we never probe a node we
    /// already believe gone. A terminal node still present in the map is,
    /// by the invariant that `reap` always evicts `nodes` and
    /// `recently_dead` together, still inside its grace window.
    pub fn gossip_candidates(&self) -> Vec<NodeInfo> {
        let inner = self.inner.read();
        inner
            .nodes
            .values()
            .filter(|n| {
                n.name != self.local
                    && (!n.state.is_terminal() || inner.recently_dead.contains_key(&n.name))
            })
            .cloned()
            .collect()
    }

    /// Applies an `Alive` announcement (from gossip, a direct ack, or local
    /// bootstrap). Returns the merge outcome.
    pub fn merge_alive(
        &self,
        name: &Name,
        addr: SocketAddr,
        meta: Vec<u8>,
        incarnation: u64,
        vsn: VersionVector,
    ) -> MergeOutcome {
        if *name == self.local {
            return MergeOutcome::SelfConflict;
        }
        let mut inner = self.inner.write();
        match inner.nodes.get_mut(name) {
            None => {
                if inner
                    .recently_dead
                    .get(name)
                    .is_some_and(|_| incarnation == 0)
                {
                    // A zero-incarnation Alive for a name we just buried is
                    // almost certainly a stale retransmit, not a rejoin.
                    return MergeOutcome::Stale;
                }
                let mut node = NodeInfo::new(name.clone(), addr, meta, vsn);
                node.incarnation = incarnation;
                inner.nodes.insert(name.clone(), node);
                inner.recently_dead.remove(name);
                MergeOutcome::NewNode
            }
            Some(existing) => {
                let resurrection_blocked = existing.state == NodeState::Left
                    && incarnation <= existing.incarnation;
                if incarnation > existing.incarnation
                    || (incarnation == existing.incarnation && existing.state != NodeState::Alive)
                {
                    if resurrection_blocked {
                        return MergeOutcome::Stale;
                    }
                    existing.addr = addr;
                    existing.meta = meta;
                    existing.incarnation = incarnation;
                    existing.state = NodeState::Alive;
                    existing.vsn = vsn;
                    existing.state_change = None;
                    MergeOutcome::Applied
                } else {
                    MergeOutcome::Stale
                }
            }
        }
    }

    /// Applies a `Suspect` announcement. A suspicion at or below the known
    /// incarnation for an already-`Suspect`/terminal node changes nothing.
    pub fn merge_suspect(&self, name: &Name, incarnation: u64) -> MergeOutcome {
        let mut inner = self.inner.write();
        let Some(existing) = inner.nodes.get_mut(name) else {
            return MergeOutcome::Stale;
        };
        if existing.state.is_terminal() || incarnation < existing.incarnation {
            return MergeOutcome::Stale;
        }
        if existing.state == NodeState::Suspect && incarnation == existing.incarnation {
            return MergeOutcome::Stale;
        }
        existing.incarnation = incarnation;
        existing.state = NodeState::Suspect;
        existing.state_change = Some(Instant::now());
        MergeOutcome::Applied
    }

    /// Applies a `Dead` announcement (timed-out suspicion or a voluntary
    /// leave relayed as a `Dead` by the departing node's final broadcast).
    pub fn merge_dead(&self, name: &Name, incarnation: u64, as_left: bool) -> MergeOutcome {
        let mut inner = self.inner.write();
        let Some(existing) = inner.nodes.get_mut(name) else {
            return MergeOutcome::Stale;
        };
        // `Left` is the one truly terminal state here: once a departure is
        // recorded as graceful nothing downgrades it back. A prior `Dead`
        // verdict is not final against a newer graceful `Dead{from == node}`
        // — the node's own word about its own departure outranks a third
        // party's suspicion-driven verdict (spec §8 scenario 2).
        if existing.state == NodeState::Left || incarnation < existing.incarnation {
            return MergeOutcome::Stale;
        }
        existing.incarnation = incarnation;
        existing.state = if as_left {
            NodeState::Left
        } else {
            NodeState::Dead
        };
        existing.state_change = Some(Instant::now());
        inner.recently_dead.insert(name.clone(), Instant::now());
        MergeOutcome::Applied
    }

    /// Removes members whose `recently_dead` grace period has elapsed.
    pub fn reap(&self, gossip_to_the_dead_time: std::time::Duration) -> Vec<Name> {
        let mut inner = self.inner.write();
        let now = Instant::now();
        let expired: Vec<Name> = inner
            .recently_dead
            .iter()
            .filter(|(_, since)| now.duration_since(**since) > gossip_to_the_dead_time)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            inner.recently_dead.remove(name);
            inner.nodes.remove(name);
        }
        expired
    }

    /// Removes `name` immediately, bypassing the `gossip_to_the_dead_time`
    /// grace period (operator-driven force-leave with `prune`, spec §4.10).
    pub fn remove(&self, name: &Name) {
        let mut inner = self.inner.write();
        inner.nodes.remove(name);
        inner.recently_dead.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7946".parse().unwrap()
    }

    #[test]
    fn merge_alive_inserts_new_node() {
        let map = NodeMap::new(Name::new("local").unwrap());
        let n = Name::new("n1").unwrap();
        let outcome = map.merge_alive(&n, addr(), vec![], 1, [2, 2, 2, 0, 0, 0]);
        assert_eq!(outcome, MergeOutcome::NewNode);
        assert_eq!(map.get(&n).unwrap().state, NodeState::Alive);
    }

    #[test]
    fn stale_incarnation_is_ignored() {
        let map = NodeMap::new(Name::new("local").unwrap());
        let n = Name::new("n1").unwrap();
        map.merge_alive(&n, addr(), vec![], 5, [2, 2, 2, 0, 0, 0]);
        let outcome = map.merge_alive(&n, addr(), vec![], 3, [2, 2, 2, 0, 0, 0]);
        assert_eq!(outcome, MergeOutcome::Stale);
        assert_eq!(map.get(&n).unwrap().incarnation, 5);
    }

    #[test]
    fn suspect_then_higher_incarnation_alive_refutes() {
        let map = NodeMap::new(Name::new("local").unwrap());
        let n = Name::new("n1").unwrap();
        map.merge_alive(&n, addr(), vec![], 1, [2, 2, 2, 0, 0, 0]);
        assert_eq!(map.merge_suspect(&n, 1), MergeOutcome::Applied);
        assert_eq!(map.get(&n).unwrap().state, NodeState::Suspect);
        assert_eq!(
            map.merge_alive(&n, addr(), vec![], 2, [2, 2, 2, 0, 0, 0]),
            MergeOutcome::Applied
        );
        assert_eq!(map.get(&n).unwrap().state, NodeState::Alive);
    }

    #[test]
    fn left_cannot_be_resurrected_by_stale_alive() {
        let map = NodeMap::new(Name::new("local").unwrap());
        let n = Name::new("n1").unwrap();
        map.merge_alive(&n, addr(), vec![], 1, [2, 2, 2, 0, 0, 0]);
        map.merge_dead(&n, 2, true);
        assert_eq!(map.get(&n).unwrap().state, NodeState::Left);
        let outcome = map.merge_alive(&n, addr(), vec![], 2, [2, 2, 2, 0, 0, 0]);
        assert_eq!(outcome, MergeOutcome::Stale);
    }

    #[test]
    fn graceful_dead_upgrades_a_prior_suspicion_dead_to_left() {
        let map = NodeMap::new(Name::new("local").unwrap());
        let n = Name::new("n1").unwrap();
        map.merge_alive(&n, addr(), vec![], 5, [2, 2, 2, 0, 0, 0]);
        map.merge_dead(&n, 5, false);
        assert_eq!(map.get(&n).unwrap().state, NodeState::Dead);
        let outcome = map.merge_dead(&n, 6, true);
        assert_eq!(outcome, MergeOutcome::Applied);
        assert_eq!(map.get(&n).unwrap().state, NodeState::Left);
    }

    #[test]
    fn reap_removes_after_grace_period() {
        let map = NodeMap::new(Name::new("local").unwrap());
        let n = Name::new("n1").unwrap();
        map.merge_alive(&n, addr(), vec![], 1, [2, 2, 2, 0, 0, 0]);
        map.merge_dead(&n, 2, false);
        let expired = map.reap(std::time::Duration::from_secs(0));
        assert_eq!(expired, vec![n.clone()]);
        assert!(map.get(&n).is_none());
    }
}
