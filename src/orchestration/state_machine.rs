//! Member state machine: Lamport-clocked join/leave intents layered on top
//! of SWIM's authoritative membership callbacks (spec §4.5). This is the
//! orchestration-layer half of member state; [`crate::membership::node_map`]
//! owns the SWIM-layer half (incarnation, `Alive`/`Suspect`/`Dead`/`Left`).
//!
//! Two kinds of trigger apply transitions here: *limited* ones (join/leave
//! intents, gated by Lamport order) and *authoritative* ones (direct
//! memberlist notifications, which override Lamport order entirely). See the
//! table in spec §4.5.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::common::{LTime, Name};

/// Orchestration-layer status of a member, distinct from the SWIM-layer
/// [`crate::membership::NodeState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    None,
    Alive,
    Leaving,
    Left,
    Failed,
}

/// Outcome of applying a transition trigger. Callers use this to decide
/// whether to rebroadcast the intent and whether to emit an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// `status` actually changed.
    StateChanged,
    /// `status` did not change but `status_ltime` advanced (e.g. a `Left`
    /// node received a newer, still-rejected join intent).
    LTimeUpdated,
    /// Nothing changed at all.
    NoChange,
    /// The trigger was stale (`intent_ltime <= status_ltime`) and ignored.
    Rejected,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub name: Name,
    pub status: MemberStatus,
    pub status_ltime: LTime,
    pub tags: HashMap<String, String>,
}

impl Member {
    fn new(name: Name) -> Self {
        Self {
            name,
            status: MemberStatus::None,
            status_ltime: 0,
            tags: HashMap::new(),
        }
    }
}

/// Owns every known member's orchestration-layer status. A single
/// short-held lock guards the map; no caller holds it across an `.await`.
#[derive(Default)]
pub struct StateMachine {
    members: RwLock<HashMap<Name, Member>>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &Name) -> Option<Member> {
        self.members.read().get(name).cloned()
    }

    pub fn all(&self) -> Vec<Member> {
        self.members.read().values().cloned().collect()
    }

    fn entry(map: &mut HashMap<Name, Member>, name: &Name) -> &mut Member {
        map.entry(name.clone())
            .or_insert_with(|| Member::new(name.clone()))
    }

    /// Applies a join intent: `intent_ltime` must be strictly greater than
    /// the member's current `status_ltime` or the intent is rejected
    /// outright (spec §4.5, §8 testable property).
    pub fn apply_join_intent(&self, name: &Name, intent_ltime: LTime) -> TransitionResult {
        let mut map = self.members.write();
        let member = Self::entry(&mut map, name);
        if intent_ltime <= member.status_ltime {
            return TransitionResult::Rejected;
        }
        member.status_ltime = intent_ltime;
        match member.status {
            MemberStatus::Leaving => {
                member.status = MemberStatus::Alive;
                TransitionResult::StateChanged
            }
            // Left/Failed never resurrect via a gossip intent; only the
            // Lamport time advances so stale retransmits stop mattering.
            MemberStatus::Left | MemberStatus::Failed => TransitionResult::LTimeUpdated,
            MemberStatus::Alive | MemberStatus::None => TransitionResult::LTimeUpdated,
        }
    }

    /// Applies a leave intent, symmetric to `apply_join_intent`.
    pub fn apply_leave_intent(&self, name: &Name, intent_ltime: LTime) -> TransitionResult {
        let mut map = self.members.write();
        let member = Self::entry(&mut map, name);
        if intent_ltime <= member.status_ltime {
            return TransitionResult::Rejected;
        }
        member.status_ltime = intent_ltime;
        match member.status {
            MemberStatus::Alive => {
                member.status = MemberStatus::Leaving;
                TransitionResult::StateChanged
            }
            MemberStatus::Failed => {
                member.status = MemberStatus::Left;
                TransitionResult::StateChanged
            }
            MemberStatus::Left | MemberStatus::Leaving | MemberStatus::None => {
                TransitionResult::LTimeUpdated
            }
        }
    }

    /// Memberlist's `NotifyJoin`: authoritative, overrides Lamport order
    /// entirely. Always lands on `Alive`.
    pub fn notify_join(&self, name: &Name) -> TransitionResult {
        let mut map = self.members.write();
        let member = Self::entry(&mut map, name);
        if member.status == MemberStatus::Alive {
            return TransitionResult::NoChange;
        }
        member.status = MemberStatus::Alive;
        TransitionResult::StateChanged
    }

    /// Memberlist's `NotifyLeave`: authoritative. `graceful` distinguishes a
    /// voluntary leave (`Left`) from a failure detection (`Failed`).
    pub fn notify_leave(&self, name: &Name, graceful: bool) -> TransitionResult {
        let mut map = self.members.write();
        let member = Self::entry(&mut map, name);
        let next = if graceful {
            MemberStatus::Left
        } else {
            MemberStatus::Failed
        };
        if member.status == next {
            return TransitionResult::NoChange;
        }
        member.status = next;
        TransitionResult::StateChanged
    }

    /// Local "leave complete": authoritative, always lands `Leaving -> Left`.
    pub fn complete_leave(&self, name: &Name) -> TransitionResult {
        let mut map = self.members.write();
        let member = Self::entry(&mut map, name);
        if member.status != MemberStatus::Leaving {
            return TransitionResult::NoChange;
        }
        member.status = MemberStatus::Left;
        TransitionResult::StateChanged
    }

    /// Updates a member's tags in place, reporting whether they actually
    /// changed (used to decide whether to emit `MemberUpdate`).
    pub fn set_tags(&self, name: &Name, tags: HashMap<String, String>) -> TransitionResult {
        let mut map = self.members.write();
        let member = Self::entry(&mut map, name);
        if member.tags == tags {
            return TransitionResult::NoChange;
        }
        member.tags = tags;
        TransitionResult::StateChanged
    }

    /// Drops a member entirely, for reaping past `tombstone_timeout`.
    pub fn remove(&self, name: &Name) {
        self.members.write().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_intent_refutes_leaving() {
        let sm = StateMachine::new();
        let n = Name::new("a").unwrap();
        sm.apply_leave_intent(&n, 1);
        assert_eq!(sm.get(&n).unwrap().status, MemberStatus::Leaving);
        assert_eq!(sm.apply_join_intent(&n, 2), TransitionResult::StateChanged);
        assert_eq!(sm.get(&n).unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn join_intent_cannot_resurrect_left_or_failed() {
        let sm = StateMachine::new();
        let n = Name::new("a").unwrap();
        sm.notify_leave(&n, true);
        assert_eq!(sm.get(&n).unwrap().status, MemberStatus::Left);
        let result = sm.apply_join_intent(&n, 5);
        assert_eq!(result, TransitionResult::LTimeUpdated);
        let member = sm.get(&n).unwrap();
        assert_eq!(member.status, MemberStatus::Left);
        assert_eq!(member.status_ltime, 5);
    }

    #[test]
    fn stale_intent_is_rejected() {
        let sm = StateMachine::new();
        let n = Name::new("a").unwrap();
        sm.apply_join_intent(&n, 10);
        assert_eq!(sm.apply_join_intent(&n, 5), TransitionResult::Rejected);
        assert_eq!(sm.get(&n).unwrap().status_ltime, 10);
    }

    #[test]
    fn authoritative_join_overrides_lamport_order() {
        let sm = StateMachine::new();
        let n = Name::new("a").unwrap();
        sm.notify_leave(&n, true);
        assert_eq!(sm.notify_join(&n), TransitionResult::StateChanged);
        assert_eq!(sm.get(&n).unwrap().status, MemberStatus::Alive);
    }

    #[test]
    fn leave_intent_on_failed_lands_on_left() {
        let sm = StateMachine::new();
        let n = Name::new("a").unwrap();
        sm.notify_leave(&n, false);
        assert_eq!(sm.get(&n).unwrap().status, MemberStatus::Failed);
        assert_eq!(sm.apply_leave_intent(&n, 1), TransitionResult::StateChanged);
        assert_eq!(sm.get(&n).unwrap().status, MemberStatus::Left);
    }

    #[test]
    fn complete_leave_requires_leaving_state() {
        let sm = StateMachine::new();
        let n = Name::new("a").unwrap();
        assert_eq!(sm.complete_leave(&n), TransitionResult::NoChange);
        sm.apply_leave_intent(&n, 1);
        sm.notify_join(&n);
        sm.apply_leave_intent(&n, 2);
        assert_eq!(sm.get(&n).unwrap().status, MemberStatus::Leaving);
        assert_eq!(sm.complete_leave(&n), TransitionResult::StateChanged);
        assert_eq!(sm.get(&n).unwrap().status, MemberStatus::Left);
    }
}
