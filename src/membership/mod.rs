//! SWIM-style failure detection and membership dissemination (spec §3, §4).
//! This is the lower layer: it knows names, addresses, incarnation numbers,
//! and state transitions, and nothing about intents, events, or queries —
//! those live in [`crate::orchestration`] and reach this layer only through
//! [`delegate::Delegate`].

pub mod delegate;
pub mod node_map;
pub mod swim;

pub use delegate::Delegate;
pub use node_map::NodeMap;

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::common::Name;

/// A member's lifecycle state, per spec §3. Ordering matters only in that
/// `Left`/`Dead` are both terminal for gossip purposes but distinguished so
/// the state machine can forbid resurrecting a voluntary `Left` via a stale
/// `Alive` (SPEC_FULL.md open-question decision #1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    Left,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Dead | NodeState::Left)
    }
}

/// The version tuple carried in `Alive` and push/pull messages:
/// `(protocol_min, protocol_max, protocol_cur, delegate_min, delegate_max, delegate_cur)`.
pub type VersionVector = [u8; 6];

/// A known cluster member as tracked by the local node map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub name: Name,
    pub addr: SocketAddr,
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub state: NodeState,
    pub vsn: VersionVector,
    /// Wall-clock of the last membership-layer state transition (spec §3).
    /// The suspicion timer itself tracks its own start time in
    /// [`crate::suspicion::SuspicionTimer`]; this field is the general
    /// "time of last transition" the spec names for diagnostics.
    #[serde(skip)]
    pub state_change: Option<std::time::Instant>,
}

impl NodeInfo {
    pub fn new(name: Name, addr: SocketAddr, meta: Vec<u8>, vsn: VersionVector) -> Self {
        Self {
            name,
            addr,
            meta,
            incarnation: 0,
            state: NodeState::Alive,
            vsn,
            state_change: None,
        }
    }
}
