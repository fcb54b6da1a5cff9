//! Events delivered to external handlers (spec §4.8, §4.11): membership
//! transitions, user events, and queries, each self-contained enough that a
//! handler can act without calling back into the agent.

use std::collections::HashMap;

use crate::common::{LTime, Name};
use crate::orchestration::state_machine::MemberStatus;

#[derive(Debug, Clone)]
pub struct MemberEvent {
    pub name: Name,
    pub status: MemberStatus,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub ltime: LTime,
    pub id: u32,
    pub name: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Event {
    MemberJoin(Vec<MemberEvent>),
    MemberLeave(Vec<MemberEvent>),
    MemberFailed(Vec<MemberEvent>),
    MemberUpdate(Vec<MemberEvent>),
    MemberReap(Vec<MemberEvent>),
    User {
        ltime: LTime,
        name: String,
        payload: Vec<u8>,
        coalesce: bool,
    },
    Query(QueryEvent),
}
