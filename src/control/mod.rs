//! Control-protocol server (spec §4.10): a TCP interface for external
//! clients (CLI, tooling) to drive the agent — membership queries, join/leave,
//! user events, queries, key rotation, and streaming log/event monitoring.

pub mod backend;
pub mod protocol;
pub mod server;
pub mod session;

pub use backend::{ControlBackend, MemberInfo, QueryRequest, QueryStreamItem, StreamItem};
pub use server::ControlServer;
