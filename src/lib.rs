//! FluxSwarm: a decentralized cluster-membership and lightweight-orchestration
//! engine. A process joins a logical cluster by running an [`agent::Agent`]
//! that gossips over UDP/TCP with peers ([`membership`]), detects failures
//! with a SWIM-style protocol, and layers join/leave intents, user events,
//! and distributed queries on top ([`orchestration`]). Local clients drive
//! the agent over a framed, authenticated TCP control protocol
//! ([`control`]).
//!
//! This crate is the engine only: config-file loading, a CLI front-end,
//! mDNS discovery, and a metrics exporter are external collaborators that
//! embed [`agent::Agent`] rather than living inside it.

pub mod agent;
pub mod awareness;
pub mod broadcast;
pub mod clock;
pub mod codec;
pub mod common;
pub mod config;
pub mod control;
pub mod error;
pub mod keyring;
pub mod logging;
pub mod membership;
pub mod metrics;
pub mod orchestration;
pub mod snapshot;
pub mod suspicion;
pub mod transport;

pub use agent::{Agent, EventHandler};
pub use config::Config;
pub use error::{Error, Result};

/// Crate version, for handshake banners and the control-protocol `stats`
/// command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
