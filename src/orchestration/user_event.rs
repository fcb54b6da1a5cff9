//! User event origination and application (spec §4.8): Lamport-clocked,
//! size-limited, optionally coalesced. Dedup keeps a bounded recency window
//! keyed by `(ltime, name)` since, unlike queries, user events carry no
//! independent ID.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::clock::Clocks;
use crate::codec::message::{self, MessageType, UserEventMsg};
use crate::common::LTime;
use crate::config::ABSOLUTE_USER_EVENT_LIMIT;
use crate::error::{Error, Result};
use crate::orchestration::events::Event;

/// Remembers the most recent `capacity` `(ltime, name)` pairs so a
/// retransmitted duplicate doesn't reach external handlers twice.
pub struct UserEventDedup {
    recent: Mutex<VecDeque<(LTime, String)>>,
    capacity: usize,
}

impl UserEventDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Returns true if `(ltime, name)` is new and records it; false if
    /// already seen.
    pub fn witness(&self, ltime: LTime, name: &str) -> bool {
        let mut recent = self.recent.lock();
        let key = (ltime, name.to_string());
        if recent.contains(&key) {
            return false;
        }
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(key);
        true
    }
}

/// Encodes an originated user event, enforcing the configured size limit
/// (itself capped at [`ABSOLUTE_USER_EVENT_LIMIT`], spec §6).
pub fn build(
    clocks: &Clocks,
    name: String,
    payload: Vec<u8>,
    coalesce: bool,
    limit: usize,
) -> Result<(LTime, Vec<u8>)> {
    let limit = limit.min(ABSOLUTE_USER_EVENT_LIMIT);
    if payload.len() > limit {
        return Err(Error::PayloadTooLarge {
            size: payload.len(),
            limit,
        });
    }
    let ltime = clocks.event.increment();
    let msg = UserEventMsg {
        ltime,
        name,
        payload,
        coalesce,
    };
    let encoded = message::encode_message(MessageType::UserEvent, &msg)?;
    Ok((ltime, encoded))
}

/// Applies a received user event: witnesses its clock, dedupes, and produces
/// the event to hand to external handlers. Returns `None` for a dedup hit,
/// in which case the caller should not re-gossip it either.
pub fn apply(clocks: &Clocks, dedup: &UserEventDedup, msg: UserEventMsg) -> Option<Event> {
    clocks.event.witness(msg.ltime);
    if !dedup.witness(msg.ltime, &msg.name) {
        return None;
    }
    Some(Event::User {
        ltime: msg.ltime,
        name: msg.name,
        payload: msg.payload,
        coalesce: msg.coalesce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_payload_rejected() {
        let clocks = Clocks::new();
        let result = build(&clocks, "e".into(), vec![0u8; 100], false, 50);
        assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));
    }

    #[test]
    fn duplicate_event_is_dropped() {
        let clocks = Clocks::new();
        let dedup = UserEventDedup::new(8);
        let msg = UserEventMsg {
            ltime: 1,
            name: "e".into(),
            payload: vec![],
            coalesce: false,
        };
        assert!(apply(&clocks, &dedup, msg.clone()).is_some());
        assert!(apply(&clocks, &dedup, msg).is_none());
    }

    #[test]
    fn dedup_evicts_oldest_past_capacity() {
        let dedup = UserEventDedup::new(2);
        assert!(dedup.witness(1, "a"));
        assert!(dedup.witness(2, "b"));
        assert!(dedup.witness(3, "c"));
        // "a" was evicted, so it is treated as new again.
        assert!(dedup.witness(1, "a"));
    }
}
