//! The seam between the control-protocol server and the agent (spec §4.10):
//! the server dispatches each command through a `ControlBackend` rather than
//! reaching into `Agent` internals directly, the same delegate shape used
//! between `membership` and `orchestration`.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::message::QueryFilter;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    pub name: String,
    pub addr: String,
    pub status: String,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub name: String,
    pub payload: Vec<u8>,
    pub filters: QueryFilter,
    pub relay_factor: u8,
    pub timeout_ms: u64,
    pub request_ack: bool,
}

/// One item of a streaming `query` response body (spec §4.10: "streaming
/// response body containing `ack`, `response`, `done`").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum QueryStreamItem {
    Ack { from: String },
    Response { from: String, payload: Vec<u8> },
    Done,
}

/// One item of a `stream` command's event feed (spec §4.10 `stream`
/// command).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum StreamItem {
    MemberEvent { kind: String, members: Vec<MemberInfo> },
    UserEvent { name: String, payload: Vec<u8> },
}

/// Implemented by [`crate::agent::Agent`]; the control server depends only on
/// this trait so it never needs to reach into agent internals.
#[async_trait]
pub trait ControlBackend: Send + Sync {
    fn local_name(&self) -> String;
    async fn members(&self) -> Vec<MemberInfo>;
    async fn join(&self, addrs: Vec<String>) -> (usize, Vec<(String, String)>);
    async fn leave(&self) -> Result<()>;
    async fn force_leave(&self, name: &str, prune: bool) -> Result<()>;
    async fn user_event(&self, name: String, payload: Vec<u8>, coalesce: bool) -> Result<()>;
    async fn query(&self, req: QueryRequest) -> Result<mpsc::UnboundedReceiver<QueryStreamItem>>;
    async fn set_tags(&self, add: HashMap<String, String>, delete: Vec<String>) -> Result<()>;
    async fn stats(&self) -> HashMap<String, String>;
    async fn get_coordinate(&self, name: Option<String>) -> Option<Vec<u8>>;
    async fn install_key(&self, key: Vec<u8>) -> Result<()>;
    async fn use_key(&self, key: Vec<u8>) -> Result<()>;
    async fn remove_key(&self, key: Vec<u8>) -> Result<()>;
    async fn list_keys(&self) -> (Vec<Vec<u8>>, Option<Vec<u8>>);
    /// Subscribes to the coalesced event feed for a `stream` command.
    fn subscribe_stream(&self) -> mpsc::UnboundedReceiver<StreamItem>;
    /// Subscribes to the process-wide log feed for a `monitor` command.
    fn subscribe_logs(&self) -> tokio::sync::broadcast::Receiver<String>;
}
