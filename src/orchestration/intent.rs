//! Join/leave intent broadcasts and their application against the member
//! state machine (spec §4.5). Grounded on `membership::swim::NodeBroadcast`:
//! a small `Broadcast` wrapper carrying pre-encoded wire bytes plus the
//! identity used for single-live-item replacement.

use crate::broadcast::Broadcast;
use crate::clock::Clocks;
use crate::codec::message::{self, Join, Leave, MessageType};
use crate::common::{LTime, Name};
use crate::error::Result;
use crate::orchestration::events::{Event, MemberEvent};
use crate::orchestration::state_machine::{StateMachine, TransitionResult};

/// A pre-encoded `Join`/`Leave` intent broadcast, deduped by node name like
/// `membership::swim::NodeBroadcast`: a fresher intent for the same name
/// replaces an older one outright rather than both going out.
pub struct IntentBroadcast {
    name: String,
    payload: Vec<u8>,
}

impl Broadcast for IntentBroadcast {
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

/// Builds the broadcast for this node's own join intent, bumping the member
/// clock.
pub fn build_join(clocks: &Clocks, node: Name) -> Result<(LTime, Box<dyn Broadcast>)> {
    let ltime = clocks.member.increment();
    let msg = Join {
        ltime,
        node: node.clone(),
    };
    let payload = message::encode_message(MessageType::Join, &msg)?;
    Ok((
        ltime,
        Box::new(IntentBroadcast {
            name: node.to_string(),
            payload,
        }),
    ))
}

pub fn build_leave(clocks: &Clocks, node: Name) -> Result<(LTime, Box<dyn Broadcast>)> {
    let ltime = clocks.member.increment();
    let msg = Leave {
        ltime,
        node: node.clone(),
    };
    let payload = message::encode_message(MessageType::Leave, &msg)?;
    Ok((
        ltime,
        Box::new(IntentBroadcast {
            name: node.to_string(),
            payload,
        }),
    ))
}

/// Applies a received join intent: witnesses its Lamport time, updates the
/// state machine, and returns an event to emit if the transition is
/// externally visible.
pub fn apply_join(clocks: &Clocks, sm: &StateMachine, msg: &Join) -> Option<Event> {
    clocks.member.witness(msg.ltime);
    match sm.apply_join_intent(&msg.node, msg.ltime) {
        TransitionResult::StateChanged => {
            let member = sm.get(&msg.node)?;
            Some(Event::MemberJoin(vec![MemberEvent {
                name: member.name,
                status: member.status,
                tags: member.tags,
            }]))
        }
        _ => None,
    }
}

/// Applies a received leave intent, symmetric to [`apply_join`].
pub fn apply_leave(clocks: &Clocks, sm: &StateMachine, msg: &Leave) -> Option<Event> {
    clocks.member.witness(msg.ltime);
    match sm.apply_leave_intent(&msg.node, msg.ltime) {
        TransitionResult::StateChanged => {
            let member = sm.get(&msg.node)?;
            Some(Event::MemberLeave(vec![MemberEvent {
                name: member.name,
                status: member.status,
                tags: member.tags,
            }]))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_join_bumps_member_clock() {
        let clocks = Clocks::new();
        let node = Name::new("a").unwrap();
        let (ltime, broadcast) = build_join(&clocks, node.clone()).unwrap();
        assert_eq!(ltime, 1);
        assert_eq!(broadcast.name(), Some("a".to_string()));
    }

    #[test]
    fn apply_join_emits_event_on_state_change() {
        let clocks = Clocks::new();
        let sm = StateMachine::new();
        let node = Name::new("a").unwrap();
        let msg = Join { ltime: 1, node: node.clone() };
        let event = apply_join(&clocks, &sm, &msg);
        assert!(matches!(event, Some(Event::MemberJoin(_))));
        assert_eq!(clocks.member.time(), 1);
    }

    #[test]
    fn stale_leave_intent_emits_nothing() {
        let clocks = Clocks::new();
        let sm = StateMachine::new();
        let node = Name::new("a").unwrap();
        sm.apply_leave_intent(&node, 10);
        let msg = Leave { ltime: 5, node };
        assert!(apply_leave(&clocks, &sm, &msg).is_none());
    }
}
