//! Agent supervisor (spec §4.11): the single runnable unit that wires codec,
//! transport, keyring, the SWIM loop, the orchestration layer, the
//! snapshotter, and the control-protocol server together. Implements
//! [`membership::Delegate`] (via an inner type held separately from [`Swim`]
//! so the two can be constructed without a cycle) and [`control::ControlBackend`]
//! so neither layer below it ever reaches into `Agent` internals directly —
//! the same delegate-seam discipline the teacher's `networking` module uses
//! between its connection layer and application handlers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broadcast::{Broadcast, BroadcastQueue};
use crate::clock::Clocks;
use crate::codec::message::{self, MessageType, Query as QueryMsg, QueryResponse as QueryResponseMsg};
use crate::common::{LTime, Name};
use crate::config::Config;
use crate::control::backend::{ControlBackend, MemberInfo, QueryRequest, QueryStreamItem, StreamItem};
use crate::control::ControlServer;
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::membership::delegate::Delegate;
use crate::membership::swim::Swim;
use crate::membership::NodeState;
use crate::orchestration::coalesce::{self, CoalescePolicy};
use crate::orchestration::events::{Event, MemberEvent, QueryEvent};
use crate::orchestration::intent;
use crate::orchestration::query::{self, PendingQuery, QueryDedup, QueryIdGen};
use crate::orchestration::state_machine::{MemberStatus, StateMachine, TransitionResult};
use crate::orchestration::user_event::{self, UserEventDedup};
use crate::snapshot::{self, SnapshotEvent, SnapshotHandle};
use crate::transport::Transport;

/// Delivered to every registered external handler whenever a coalesced batch
/// flushes (spec §4.11).
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

/// A broadcast wrapped around already-encoded bytes under an arbitrary,
/// never-invalidated key — used for user events and queries, which unlike
/// `Alive`/`Suspect`/`Dead` never obsolete an earlier item of the same name.
struct RawBroadcast {
    key: String,
    payload: Vec<u8>,
}

impl Broadcast for RawBroadcast {
    fn name(&self) -> Option<String> {
        Some(self.key.clone())
    }
    fn invalidates(&self, other: &dyn Broadcast) -> bool {
        other.name() == self.name()
    }
    fn message(&self) -> Vec<u8> {
        self.payload.clone()
    }
}

/// Opaque push/pull state exchanged between orchestration layers (spec
/// §4.5/§4.6): the three Lamport clocks plus each known member's intent
/// status, so a freshly joining node learns pending leave intents that the
/// SWIM-layer `Alive`/`Dead` gossip alone would not convey.
#[derive(Serialize, Deserialize)]
struct OrchState {
    member_clock: LTime,
    event_clock: LTime,
    query_clock: LTime,
    members: Vec<(String, u8, LTime)>,
}

fn status_to_byte(status: MemberStatus) -> u8 {
    match status {
        MemberStatus::None => 0,
        MemberStatus::Alive => 1,
        MemberStatus::Leaving => 2,
        MemberStatus::Left => 3,
        MemberStatus::Failed => 4,
    }
}

fn byte_to_status(b: u8) -> MemberStatus {
    match b {
        1 => MemberStatus::Alive,
        2 => MemberStatus::Leaving,
        3 => MemberStatus::Left,
        4 => MemberStatus::Failed,
        _ => MemberStatus::None,
    }
}

/// The orchestration-layer half of the agent: everything the [`Delegate`]
/// seam needs, held independently of [`Swim`] so `Swim::new` can take an
/// `Arc<dyn Delegate>` before the `Agent` that owns the `Swim` exists.
struct Inner {
    local_name: Name,
    local_addr: SocketAddr,
    state_machine: StateMachine,
    clocks: Clocks,
    user_event_dedup: UserEventDedup,
    query_dedup: QueryDedup,
    query_id_gen: QueryIdGen,
    pending_queries: RwLock<HashMap<u32, PendingQuery>>,
    tags: RwLock<HashMap<String, String>>,
    event_tx: mpsc::UnboundedSender<Event>,
    orch_broadcasts: BroadcastQueue,
    cluster_size: AtomicUsize,
}

impl Inner {
    fn set_cluster_size(&self, n: usize) {
        self.cluster_size.store(n.max(1), Ordering::Relaxed);
    }

    async fn transition_leave(&self, name: &Name, graceful: bool) {
        if self.state_machine.notify_leave(name, graceful) == TransitionResult::StateChanged {
            if let Some(member) = self.state_machine.get(name) {
                let ev = MemberEvent {
                    name: member.name,
                    status: member.status,
                    tags: member.tags,
                };
                let event = if graceful {
                    Event::MemberLeave(vec![ev])
                } else {
                    Event::MemberFailed(vec![ev])
                };
                let _ = self.event_tx.send(event);
            }
        }
    }
}

#[async_trait]
impl Delegate for Inner {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        let tags = self.tags.read().clone();
        match rmp_serde::to_vec_named(&tags) {
            Ok(bytes) if bytes.len() <= limit => bytes,
            _ => Vec::new(),
        }
    }

    async fn notify_msg(&self, _payload: &[u8]) {
        // Nothing in this build sends a raw `User` message: every
        // orchestration concern has its own message type instead.
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let cluster_size = self.cluster_size.load(Ordering::Relaxed);
        self.orch_broadcasts.get_broadcasts(overhead, limit, cluster_size)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        let (member_clock, event_clock, query_clock) = self.clocks.times();
        let members = self
            .state_machine
            .all()
            .into_iter()
            .map(|m| (m.name.to_string(), status_to_byte(m.status), m.status_ltime))
            .collect();
        let state = OrchState {
            member_clock,
            event_clock,
            query_clock,
            members,
        };
        rmp_serde::to_vec_named(&state).unwrap_or_default()
    }

    async fn merge_remote_state(&self, buf: &[u8], _join: bool) {
        let Ok(state) = rmp_serde::from_slice::<OrchState>(buf) else {
            return;
        };
        self.clocks
            .witness_all(state.member_clock, state.event_clock, state.query_clock);
        for (name, status_byte, ltime) in state.members {
            let Ok(name) = Name::new(name) else { continue };
            match byte_to_status(status_byte) {
                MemberStatus::Leaving => {
                    self.state_machine.apply_leave_intent(&name, ltime);
                }
                MemberStatus::Alive => {
                    self.state_machine.apply_join_intent(&name, ltime);
                }
                _ => {}
            }
        }
    }

    async fn notify_alive(&self, name: &Name) {
        if self.state_machine.notify_join(name) == TransitionResult::StateChanged {
            if let Some(member) = self.state_machine.get(name) {
                let _ = self.event_tx.send(Event::MemberJoin(vec![MemberEvent {
                    name: member.name,
                    status: member.status,
                    tags: member.tags,
                }]));
            }
        }
    }

    async fn notify_conflict(&self, name: &Name, other_addr: SocketAddr) {
        warn!(%name, %other_addr, "name conflict detected");
    }

    async fn notify_merge(&self, _peers: &[Name]) {}

    async fn notify_state_change(&self, name: &Name, state: NodeState) {
        match state {
            NodeState::Alive => self.notify_alive(name).await,
            NodeState::Dead => self.transition_leave(name, false).await,
            NodeState::Left => self.transition_leave(name, true).await,
            NodeState::Suspect => {}
        }
    }

    fn notify_ping(&self, _name: &Name) -> Option<Vec<u8>> {
        None
    }

    async fn notify_join_intent(&self, msg: message::Join) {
        if let Some(event) = intent::apply_join(&self.clocks, &self.state_machine, &msg) {
            let _ = self.event_tx.send(event);
        }
    }

    async fn notify_leave_intent(&self, msg: message::Leave) {
        if let Some(event) = intent::apply_leave(&self.clocks, &self.state_machine, &msg) {
            let _ = self.event_tx.send(event);
        }
    }

    async fn notify_query(&self, query: QueryMsg) -> Option<Vec<u8>> {
        self.clocks.query.witness(query.ltime);
        if !self.query_dedup.witness(query.id) {
            return None;
        }
        let tags = self.tags.read().clone();
        if !query::matches_filter(&query.filters, &self.local_name, &tags) {
            return None;
        }
        let _ = self.event_tx.send(Event::Query(QueryEvent {
            ltime: query.ltime,
            id: query.id,
            name: query.name.clone(),
            payload: query.payload.clone(),
        }));
        // Answering with an application-level payload is left to the
        // embedding program reacting to `Event::Query`; here we only send
        // back the immediate ack the originator asked for.
        if query.request_ack {
            let resp = QueryResponseMsg {
                ltime: query.ltime,
                id: query.id,
                from: self.local_name.clone(),
                payload: Vec::new(),
                ack: true,
            };
            return message::encode_message(MessageType::QueryResponse, &resp).ok();
        }
        None
    }

    async fn notify_query_response(&self, resp: QueryResponseMsg) {
        self.clocks.query.witness(resp.ltime);
        if let Some(pending) = self.pending_queries.read().get(&resp.id) {
            pending.deliver(resp);
        }
    }
}

fn status_name(state: NodeState) -> String {
    match state {
        NodeState::Alive => "alive",
        NodeState::Suspect => "suspect",
        NodeState::Dead => "dead",
        NodeState::Left => "left",
    }
    .to_string()
}

/// Membership-layer status string for the local node, which never appears
/// in `NodeMap` (it only tracks peers). Derived from the orchestration
/// layer's own status instead of `NodeState`, since the local node is never
/// suspected or declared dead by itself.
fn local_status_name(status: MemberStatus) -> String {
    match status {
        MemberStatus::None | MemberStatus::Alive => "alive",
        MemberStatus::Leaving => "leaving",
        MemberStatus::Left => "left",
        MemberStatus::Failed => "failed",
    }
    .to_string()
}

/// Runs the whole agent: membership, orchestration, snapshotting, and the
/// control server, all behind one `Arc` so background tasks can hold a
/// clone without the caller juggling lifetimes.
pub struct Agent {
    config: Config,
    inner: Arc<Inner>,
    swim: Arc<Swim>,
    keyring: Arc<Keyring>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    stream_subs: RwLock<Vec<mpsc::UnboundedSender<StreamItem>>>,
    snapshot: Option<SnapshotHandle>,
    shutting_down: AtomicBool,
    tasks: SyncMutex<Vec<JoinHandle<()>>>,
    control_shutdown: SyncMutex<Option<oneshot::Sender<()>>>,
    event_rx: SyncMutex<Option<mpsc::UnboundedReceiver<Event>>>,
    /// Lets `&self` methods (the [`ControlBackend`] seam) borrow an owned
    /// `Arc<Agent>` for spawning/await-across-suspend work without an unsafe
    /// pointer reconstruction. Populated once, immediately after `new`'s
    /// `Arc::new` call, the same self-referential `Weak` pattern the
    /// teacher's allocator contexts use for parent back-references.
    self_weak: SyncMutex<Weak<Agent>>,
}

impl Agent {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let local_name = Name::new(config.name.clone())?;
        let local_addr = transport.final_advertise_addr(config.advertise_addr)?;
        let keyring = Arc::new(Keyring::new(config.secret_keys.clone())?);

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            local_name: local_name.clone(),
            local_addr,
            state_machine: StateMachine::new(),
            clocks: Clocks::new(),
            user_event_dedup: UserEventDedup::new(2048),
            query_dedup: QueryDedup::new(2048),
            query_id_gen: QueryIdGen::default(),
            pending_queries: RwLock::new(HashMap::new()),
            tags: RwLock::new(HashMap::new()),
            event_tx,
            orch_broadcasts: BroadcastQueue::new(config.timing.retransmit_mult),
            cluster_size: AtomicUsize::new(1),
        });
        // The local node is never inserted into `NodeMap` (it tracks peers
        // only; see `NodeMap::merge_alive`'s `SelfConflict`), but it still
        // owns an orchestration-layer status of its own from the moment the
        // agent exists, per spec §3 "Local node is created at startup".
        inner.state_machine.notify_join(&local_name);

        let swim = Arc::new(Swim::new(
            &config,
            local_addr,
            transport,
            inner.clone() as Arc<dyn Delegate>,
            keyring.clone(),
        )?);

        let snapshot = match &config.snapshot_path {
            Some(path) => {
                let swim_for_hint = swim.clone();
                Some(snapshot::spawn(
                    PathBuf::from(path),
                    Duration::from_secs(5),
                    move || swim_for_hint.nodes().len(),
                )?)
            }
            None => None,
        };

        let agent = Arc::new(Self {
            config,
            inner,
            swim,
            keyring,
            handlers: RwLock::new(Vec::new()),
            stream_subs: RwLock::new(Vec::new()),
            snapshot,
            shutting_down: AtomicBool::new(false),
            tasks: SyncMutex::new(Vec::new()),
            control_shutdown: SyncMutex::new(None),
            event_rx: SyncMutex::new(Some(event_rx)),
            self_weak: SyncMutex::new(Weak::new()),
        });
        *agent.self_weak.lock() = Arc::downgrade(&agent);
        Ok(agent)
    }

    fn spawn(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Upgrades the self-weak reference set in `new`. Always succeeds while
    /// any `Arc<Agent>` is alive, which holds for the whole lifetime of any
    /// `&self` call since the caller must be holding one.
    fn arc_self(&self) -> Arc<Agent> {
        self.self_weak
            .lock()
            .upgrade()
            .expect("Agent::arc_self called while no Arc<Agent> is alive")
    }

    /// Replays any existing snapshot, optionally rejoins from it, and starts
    /// every background task: the SWIM receive/accept loops, the protocol
    /// period ticker, the event coalescer, and the control server.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Some(path) = &self.config.snapshot_path {
            let replayed = snapshot::replay(Path::new(path)).await?;
            self.inner
                .clocks
                .witness_all(replayed.member_clock, replayed.event_clock, replayed.query_clock);
            if self.config.rejoin_after_leave && !replayed.left_cleanly && !replayed.alive.is_empty() {
                let addrs: Vec<SocketAddr> = replayed.alive.values().copied().collect();
                let (n, _causes) = self.swim.join(&addrs).await;
                info!(rejoined = n, "rejoined cluster from snapshot");
            }
        }

        let recv_swim = self.swim.clone();
        self.spawn(tokio::spawn(async move { recv_swim.run_receive_loop().await }));

        let accept_swim = self.swim.clone();
        self.spawn(tokio::spawn(async move { accept_swim.accept_push_pull_loop().await }));

        let this = self.clone();
        self.spawn(tokio::spawn(async move { this.protocol_loop().await }));

        let (coalesced_tx, mut coalesced_rx) = mpsc::unbounded_channel();
        let event_rx = self
            .event_rx
            .lock()
            .take()
            .expect("Agent::start must only be called once");
        let policy = CoalescePolicy {
            quiescent_period: Duration::from_millis(200),
            quiescent_max_timeout: Duration::from_secs(10),
        };
        self.spawn(tokio::spawn(coalesce::run(policy, event_rx, coalesced_tx)));

        let this = self.clone();
        self.spawn(tokio::spawn(async move {
            while let Some(batch) = coalesced_rx.recv().await {
                this.dispatch_batch(batch).await;
            }
        }));

        let backend: Arc<dyn ControlBackend> = self.clone();
        let server = ControlServer::bind(
            self.config.control_bind_addr,
            backend,
            self.config.control_auth_key.clone(),
        )
        .await?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        *self.control_shutdown.lock() = Some(shutdown_tx);
        self.spawn(tokio::spawn(server.serve(shutdown_rx)));

        info!(name = %self.inner.local_name, addr = %self.swim.local_name(), "agent started");
        Ok(())
    }

    async fn protocol_loop(self: Arc<Self>) {
        let timing = self.config.timing.clone();
        let mut probe_tick = tokio::time::interval(timing.probe_interval);
        let mut gossip_tick = tokio::time::interval(timing.gossip_interval);
        let mut push_pull_tick = tokio::time::interval(timing.push_pull_interval);
        let mut reap_tick = tokio::time::interval(timing.probe_interval * 10);
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                _ = probe_tick.tick() => {
                    self.swim.probe_once().await;
                    self.swim.reap_suspicions().await;
                }
                _ = gossip_tick.tick() => {
                    self.inner.set_cluster_size(self.swim.nodes().len());
                    self.swim.gossip_once().await;
                }
                _ = push_pull_tick.tick() => {
                    self.swim.push_pull_once().await;
                }
                _ = reap_tick.tick() => {
                    self.swim.reap_dead(timing.gossip_to_the_dead_time);
                }
            }
        }
    }

    fn member_info_of(&self, m: &MemberEvent) -> MemberInfo {
        let addr = self
            .swim
            .nodes()
            .get(&m.name)
            .map(|n| n.addr.to_string())
            .unwrap_or_default();
        MemberInfo {
            name: m.name.to_string(),
            addr,
            status: format!("{:?}", m.status),
            tags: m.tags.clone(),
        }
    }

    async fn dispatch_batch(&self, batch: Vec<Event>) {
        for event in &batch {
            self.record_snapshot(event);
            for handler in self.handlers.read().iter() {
                handler.handle(event);
            }
            self.broadcast_stream(event);
        }
    }

    fn record_snapshot(&self, event: &Event) {
        let Some(snap) = &self.snapshot else { return };
        match event {
            Event::MemberJoin(members) | Event::MemberUpdate(members) => {
                for m in members {
                    if let Some(node) = self.swim.nodes().get(&m.name) {
                        snap.record(SnapshotEvent::Alive {
                            name: m.name.clone(),
                            addr: node.addr,
                        });
                    }
                }
            }
            Event::MemberLeave(members) | Event::MemberFailed(members) | Event::MemberReap(members) => {
                for m in members {
                    snap.record(SnapshotEvent::NotAlive { name: m.name.clone() });
                }
            }
            Event::User { ltime, .. } => snap.record(SnapshotEvent::EventClock(*ltime)),
            Event::Query(q) => snap.record(SnapshotEvent::QueryClock(q.ltime)),
        }
    }

    fn broadcast_stream(&self, event: &Event) {
        let subs = self.stream_subs.read();
        if subs.is_empty() {
            return;
        }
        let item = match event {
            Event::MemberJoin(members) => Some(StreamItem::MemberEvent {
                kind: "member-join".into(),
                members: members.iter().map(|m| self.member_info_of(m)).collect(),
            }),
            Event::MemberLeave(members) => Some(StreamItem::MemberEvent {
                kind: "member-leave".into(),
                members: members.iter().map(|m| self.member_info_of(m)).collect(),
            }),
            Event::MemberFailed(members) => Some(StreamItem::MemberEvent {
                kind: "member-failed".into(),
                members: members.iter().map(|m| self.member_info_of(m)).collect(),
            }),
            Event::MemberUpdate(members) => Some(StreamItem::MemberEvent {
                kind: "member-update".into(),
                members: members.iter().map(|m| self.member_info_of(m)).collect(),
            }),
            Event::MemberReap(members) => Some(StreamItem::MemberEvent {
                kind: "member-reap".into(),
                members: members.iter().map(|m| self.member_info_of(m)).collect(),
            }),
            Event::User { name, payload, .. } => Some(StreamItem::UserEvent {
                name: name.clone(),
                payload: payload.clone(),
            }),
            Event::Query(_) => None,
        };
        if let Some(item) = item {
            for tx in subs.iter() {
                let _ = tx.send(item.clone());
            }
        }
    }

    /// Broadcasts a leave intent for the local node, waits
    /// `leave_propagate_delay` for it to disseminate, then shuts down.
    pub async fn leave(self: &Arc<Self>) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let (ltime, broadcast) = intent::build_leave(&self.inner.clocks, self.inner.local_name.clone())?;
        self.inner.state_machine.apply_leave_intent(&self.inner.local_name, ltime);
        self.inner.orch_broadcasts.queue_broadcast(broadcast);
        // Also announce at the membership layer, so peers record us as
        // `Left` (spec §8 scenario 2) rather than eventually suspecting and
        // declaring us `Dead` once we stop answering probes.
        self.swim.broadcast_leave();
        tokio::time::sleep(self.config.leave_propagate_delay).await;
        self.inner.state_machine.complete_leave(&self.inner.local_name);
        self.shutdown().await
    }

    /// Stops every background task, the control server, the transport, and
    /// (after appending a terminal `leave` record) the snapshotter. Idempotent.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(tx) = self.control_shutdown.lock().take() {
            let _ = tx.send(());
        }
        self.swim.shutdown_transport().await;
        if let Some(snap) = &self.snapshot {
            snap.shutdown().await;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    pub async fn user_event(&self, name: String, payload: Vec<u8>, coalesce: bool) -> Result<()> {
        let (ltime, encoded) = user_event::build(
            &self.inner.clocks,
            name.clone(),
            payload.clone(),
            coalesce,
            self.config.user_event_size_limit,
        )?;
        self.inner.user_event_dedup.witness(ltime, &name);
        self.inner.orch_broadcasts.queue_broadcast(Box::new(RawBroadcast {
            key: format!("user:{ltime}:{name}"),
            payload: encoded,
        }));
        let _ = self.inner.event_tx.send(Event::User {
            ltime,
            name,
            payload,
            coalesce,
        });
        Ok(())
    }

    async fn originate_query(&self, req: QueryRequest) -> Result<mpsc::UnboundedReceiver<QueryStreamItem>> {
        let id = self.inner.query_id_gen.next();
        let ltime = self.inner.clocks.query.increment();
        self.inner.query_dedup.witness(id);
        let (pending, mut responses) = query::new_pending(req.request_ack);
        self.inner.pending_queries.write().insert(id, pending);

        let msg = QueryMsg {
            ltime,
            id,
            source_node: self.inner.local_name.clone(),
            source_addr: self.inner.local_addr,
            filters: req.filters,
            relay_factor: req.relay_factor,
            timeout_ms: req.timeout_ms,
            name: req.name,
            payload: req.payload,
            request_ack: req.request_ack,
        };
        let encoded = message::encode_message(MessageType::Query, &msg)?;
        self.inner.orch_broadcasts.queue_broadcast(Box::new(RawBroadcast {
            key: format!("query:{id}"),
            payload: encoded,
        }));

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let timeout = Duration::from_millis(req.timeout_ms.max(1))
            .max(self.config.timing.probe_interval * self.config.query_timeout_mult);
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let sleep = tokio::time::sleep(timeout);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    resp = responses.recv() => {
                        match resp {
                            Some(r) => {
                                let item = if r.ack {
                                    QueryStreamItem::Ack { from: r.from.to_string() }
                                } else {
                                    QueryStreamItem::Response { from: r.from.to_string(), payload: r.payload }
                                };
                                if out_tx.send(item).is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = &mut sleep => break,
                }
            }
            let _ = out_tx.send(QueryStreamItem::Done);
            inner.pending_queries.write().remove(&id);
        });
        Ok(out_rx)
    }

    /// Replaces the set of external event handlers wholesale (spec §4.11
    /// `UpdateEventHandlers`).
    pub fn update_event_handlers(&self, handlers: Vec<Arc<dyn EventHandler>>) {
        *self.handlers.write() = handlers;
    }
}

#[async_trait]
impl ControlBackend for Agent {
    fn local_name(&self) -> String {
        self.inner.local_name.to_string()
    }

    async fn members(&self) -> Vec<MemberInfo> {
        let local_status = self
            .inner
            .state_machine
            .get(&self.inner.local_name)
            .map(|m| m.status)
            .unwrap_or(MemberStatus::Alive);
        let local = MemberInfo {
            name: self.inner.local_name.to_string(),
            addr: self.inner.local_addr.to_string(),
            status: local_status_name(local_status),
            tags: self.inner.tags.read().clone(),
        };
        std::iter::once(local)
            .chain(self.swim.nodes().all().into_iter().map(|n| {
                let tags = self
                    .inner
                    .state_machine
                    .get(&n.name)
                    .map(|m| m.tags)
                    .unwrap_or_default();
                MemberInfo {
                    name: n.name.to_string(),
                    addr: n.addr.to_string(),
                    status: status_name(n.state),
                    tags,
                }
            }))
            .collect()
    }

    async fn join(&self, addrs: Vec<String>) -> (usize, Vec<(String, String)>) {
        let mut parsed = Vec::with_capacity(addrs.len());
        let mut causes = Vec::new();
        for addr in &addrs {
            match addr.parse::<SocketAddr>() {
                Ok(a) => parsed.push(a),
                Err(e) => causes.push((addr.clone(), e.to_string())),
            }
        }
        let (succeeded, mut join_causes) = self.swim.join(&parsed).await;
        causes.append(&mut join_causes);
        (succeeded, causes)
    }

    async fn leave(&self) -> Result<()> {
        // `ControlBackend` only has `&self`; `Agent::leave` needs `Arc<Self>`
        // to hand clones to its background tasks.
        self.arc_self().leave().await
    }

    async fn force_leave(&self, name: &str, prune: bool) -> Result<()> {
        let name = Name::new(name)?;
        self.arc_self().swim.force_leave(&name).await;
        if prune {
            self.swim.nodes().remove(&name);
            self.inner.state_machine.remove(&name);
        }
        Ok(())
    }

    async fn user_event(&self, name: String, payload: Vec<u8>, coalesce: bool) -> Result<()> {
        Agent::user_event(self, name, payload, coalesce).await
    }

    async fn query(&self, req: QueryRequest) -> Result<mpsc::UnboundedReceiver<QueryStreamItem>> {
        self.originate_query(req).await
    }

    async fn set_tags(&self, add: HashMap<String, String>, delete: Vec<String>) -> Result<()> {
        let mut tags = self.inner.tags.read().clone();
        for k in &delete {
            tags.remove(k);
        }
        tags.extend(add);
        *self.inner.tags.write() = tags.clone();
        if self.inner.state_machine.set_tags(&self.inner.local_name, tags) == TransitionResult::StateChanged {
            self.arc_self().swim.refresh_metadata();
        }
        Ok(())
    }

    async fn stats(&self) -> HashMap<String, String> {
        let mut stats = HashMap::new();
        stats.insert("members".into(), self.swim.nodes().len().to_string());
        stats.insert("member_time".into(), self.inner.clocks.member.time().to_string());
        stats.insert("event_time".into(), self.inner.clocks.event.time().to_string());
        stats.insert("query_time".into(), self.inner.clocks.query.time().to_string());
        stats.insert("protocol_version".into(), self.swim.protocol_version().to_string());
        stats
    }

    async fn get_coordinate(&self, _name: Option<String>) -> Option<Vec<u8>> {
        // Network coordinates are not implemented in this build; see
        // DESIGN.md's open-question decision on `disable_coordinates`.
        None
    }

    async fn install_key(&self, key: Vec<u8>) -> Result<()> {
        self.keyring.install(key)
    }

    async fn use_key(&self, key: Vec<u8>) -> Result<()> {
        self.keyring.use_key(&key)
    }

    async fn remove_key(&self, key: Vec<u8>) -> Result<()> {
        self.keyring.remove(&key)
    }

    async fn list_keys(&self) -> (Vec<Vec<u8>>, Option<Vec<u8>>) {
        (self.keyring.keys(), self.keyring.primary())
    }

    fn subscribe_stream(&self) -> mpsc::UnboundedReceiver<StreamItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stream_subs.write().push(tx);
        rx
    }

    fn subscribe_logs(&self) -> tokio::sync::broadcast::Receiver<String> {
        crate::logging::global().subscribe()
    }
}
