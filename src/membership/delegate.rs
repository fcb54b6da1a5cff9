//! The seam between the membership layer and whatever sits above it (spec §9
//! redesign flag: decouple SWIM from orchestration concerns). The SWIM loop
//! calls into a `Delegate` at well-defined points instead of reaching
//! directly into orchestration state, the way the teacher's
//! `networking::membership` module reports up through `MembershipEvent`
//! rather than calling application code directly.

use async_trait::async_trait;

use crate::codec::message::{Join, Leave, Query, QueryResponse};
use crate::common::Name;
use crate::membership::NodeState;

/// Implemented by the orchestration layer; the membership layer holds one
/// `Arc<dyn Delegate>` and never depends on orchestration types directly.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Opaque metadata to attach to this node's `Alive` broadcasts (tags,
    /// role info). Must fit the wire's meta size limit; callers are expected
    /// to keep it well under that themselves.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// Delivers the payload of a `User` message received over gossip.
    async fn notify_msg(&self, payload: &[u8]);

    /// Pulls up to `limit` bytes of pending broadcasts (user events, join
    /// intents, query requests) to append to an outbound packet, given
    /// `overhead` bytes already consumed by the membership payload itself.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Opaque orchestration-layer state exchanged during push/pull
    /// (coalesced user event buffer, join/leave intent LTimes).
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Receives the peer's opaque state from a push/pull exchange.
    async fn merge_remote_state(&self, buf: &[u8], join: bool);

    /// A node transitioned to `Alive` (new join or refutation).
    async fn notify_alive(&self, name: &Name);

    /// Two conflicting `Alive` claims were seen for the same name at the
    /// same incarnation (rare; usually a misconfigured duplicate name).
    async fn notify_conflict(&self, name: &Name, other_addr: std::net::SocketAddr);

    /// A node's push/pull state merge completed.
    async fn notify_merge(&self, peers: &[Name]);

    /// A node transitioned state (`Suspect`, `Dead`, `Left`).
    async fn notify_state_change(&self, name: &Name, state: NodeState);

    /// We are about to ping `name`; lets the orchestration layer attach a
    /// piggy-backed payload to the ping (used for relayed queries).
    fn notify_ping(&self, name: &Name) -> Option<Vec<u8>>;

    /// A `Join` intent broadcast arrived over gossip (spec §5 join intents).
    async fn notify_join_intent(&self, msg: Join);

    /// A `Leave` intent broadcast arrived over gossip.
    async fn notify_leave_intent(&self, msg: Leave);

    /// A `Query` arrived directly (not via gossip broadcast). Returns the
    /// encoded `QueryResponse` message to send back to `query.source_addr`,
    /// or `None` if the local node does not match the query's filters.
    async fn notify_query(&self, query: Query) -> Option<Vec<u8>>;

    /// A `QueryResponse` arrived for a query we originated.
    async fn notify_query_response(&self, resp: QueryResponse);
}
