//! Orchestration layer: join/leave intents, member state derived from
//! Lamport-clocked intents plus SWIM's authoritative view, user events,
//! queries, and coalescing (spec §3–§5). This sits above
//! [`crate::membership`] and talks to it only through
//! [`crate::membership::Delegate`].

pub mod coalesce;
pub mod events;
pub mod intent;
pub mod query;
pub mod state_machine;
pub mod user_event;

pub use events::Event;
pub use state_machine::{MemberStatus, StateMachine, TransitionResult};
