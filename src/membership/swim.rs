//! The SWIM protocol loop: periodic direct probing with indirect fallback,
//! gossip dissemination, and push/pull anti-entropy (spec §4.1–§4.6).
//! Structured the way the teacher's `networking::membership::SwimMembership`
//! drives its protocol period off a `tokio::time::interval` and dispatches
//! incoming `SwimMessage` variants from one receive loop, generalized to this
//! spec's full message set and layered on [`crate::transport::Transport`]
//! plus a [`Delegate`] instead of reaching into application state directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use crate::awareness::Awareness;
use crate::broadcast::BroadcastQueue;
use crate::codec::envelope::EncodeOptions;
use crate::codec::message::{
    self, AckResp, Alive, Dead, IndirectPing, MessageType, NackResp, Ping, Suspect,
};
use crate::codec::{decode_compound, encode_compound, envelope};
use crate::common::Name;
use crate::config::{Config, TimingConfig};
use crate::error::{Error, Result};
use crate::keyring::Keyring;
use crate::membership::node_map::MergeOutcome;
use crate::membership::{Delegate, NodeInfo, NodeMap, NodeState, VersionVector};
use crate::suspicion::SuspicionTimer;
use crate::transport::{Conn, Transport};

pub const OUR_VERSION: VersionVector = [2, 2, 2, 1, 1, 1];

struct PendingAck {
    tx: Option<oneshot::Sender<Vec<u8>>>,
}

/// A pre-encoded `Alive`/`Suspect`/`Dead` broadcast, deduped by node name: a
/// fresher update for the same name always replaces an older one outright.
struct NodeBroadcast {
    name: String,
    payload: Vec<u8>,
}

impl crate::broadcast::Broadcast for NodeBroadcast {
    fn name(&self) -> Option<String> {
        Some(self.name.clone())
    }
    fn invalidates(&self, other: &dyn crate::broadcast::Broadcast) -> bool {
        other.name() == self.name()
    }
    fn message(&self) -> Vec<u8> {
        self.payload.clone()
    }
}

/// Owns the node map, broadcast queue, and awareness score, and drives the
/// probe/gossip/push-pull cycle over a [`Transport`].
pub struct Swim {
    local_name: Name,
    local_addr: SocketAddr,
    label: String,
    timing: TimingConfig,
    protocol_version: u8,

    transport: Arc<dyn Transport>,
    delegate: Arc<dyn Delegate>,
    keyring: Arc<Keyring>,

    nodes: NodeMap,
    broadcasts: BroadcastQueue,
    awareness: Arc<Awareness>,

    seq: AtomicU32,
    pending_acks: Mutex<HashMap<u32, PendingAck>>,
    incarnation: AtomicU32,

    suspicions: Mutex<HashMap<Name, SuspicionTimer>>,
}

impl Swim {
    pub fn new(
        config: &Config,
        local_addr: SocketAddr,
        transport: Arc<dyn Transport>,
        delegate: Arc<dyn Delegate>,
        keyring: Arc<Keyring>,
    ) -> Result<Self> {
        let local_name = Name::new(config.name.clone())?;
        Ok(Self {
            local_name: local_name.clone(),
            local_addr,
            label: config.label.clone(),
            timing: config.timing.clone(),
            protocol_version: config.protocol_version,
            transport,
            delegate,
            keyring,
            nodes: NodeMap::new(local_name),
            broadcasts: BroadcastQueue::new(config.timing.retransmit_mult),
            awareness: Arc::new(Awareness::default()),
            seq: AtomicU32::new(0),
            pending_acks: Mutex::new(HashMap::new()),
            incarnation: AtomicU32::new(0),
            suspicions: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_name(&self) -> &Name {
        &self.local_name
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn encode_key(&self) -> Option<Vec<u8>> {
        self.keyring.primary()
    }

    fn encode(&self, ty: MessageType, value: &impl serde::Serialize) -> Result<Vec<u8>> {
        let msg = message::encode_message(ty, value)?;
        envelope::encode_packet(
            &msg,
            self.label.as_bytes(),
            self.encode_key().as_deref(),
            EncodeOptions {
                crc: true,
                compress: false,
            },
        )
    }

    async fn send(&self, ty: MessageType, value: &impl serde::Serialize, to: SocketAddr) -> Result<()> {
        let packet = self.encode(ty, value)?;
        self.transport.write_to(&packet, to).await?;
        Ok(())
    }

    /// One iteration of the direct-probe protocol period: pick a random
    /// target, ping it, and escalate to indirect probing + suspicion on
    /// timeout.
    pub async fn probe_once(self: &Arc<Self>) {
        let candidates = self.nodes.probe_candidates();
        let Some(target) = candidates.choose(&mut rand::rng()).cloned() else {
            return;
        };
        if let Err(e) = self.probe_node(&target).await {
            warn!(node = %target.name, error = %e, "probe failed");
        }
    }

    async fn probe_node(self: &Arc<Self>, target: &NodeInfo) -> Result<()> {
        let seq = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .insert(seq, PendingAck { tx: Some(tx) });

        let ping = Ping {
            seq_no: seq,
            node: target.name.clone(),
            source_addr: None,
        };
        let timeout = self.awareness.scale_timeout(self.timing.probe_timeout);
        self.send(MessageType::Ping, &ping, target.addr).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(_)) => {
                self.awareness.apply_delta(-1);
                return Ok(());
            }
            _ => {
                self.pending_acks.lock().remove(&seq);
            }
        }

        // Direct probe timed out; fall back to indirect probes via k peers.
        self.awareness.apply_delta(1);
        if self.indirect_probe(target, seq).await {
            return Ok(());
        }

        self.mark_suspect(target).await;
        Ok(())
    }

    async fn indirect_probe(self: &Arc<Self>, target: &NodeInfo, seq: u32) -> bool {
        let helpers: Vec<NodeInfo> = {
            let mut candidates: Vec<NodeInfo> = self
                .nodes
                .probe_candidates()
                .into_iter()
                .filter(|n| n.name != target.name)
                .collect();
            candidates.shuffle(&mut rand::rng());
            candidates
                .into_iter()
                .take(self.timing.indirect_checks)
                .collect()
        };
        if helpers.is_empty() {
            return false;
        }

        let (tx, rx) = oneshot::channel();
        self.pending_acks
            .lock()
            .insert(seq, PendingAck { tx: Some(tx) });

        for helper in &helpers {
            let req = IndirectPing {
                seq_no: seq,
                target: target.addr,
                node: target.name.clone(),
                nack: true,
            };
            let _ = self.send(MessageType::IndirectPing, &req, helper.addr).await;
        }

        let timeout = self.awareness.scale_timeout(self.timing.probe_timeout);
        let ok = tokio::time::timeout(timeout, rx).await.is_ok();
        self.pending_acks.lock().remove(&seq);
        ok
    }

    async fn mark_suspect(self: &Arc<Self>, target: &NodeInfo) {
        let outcome = self.nodes.merge_suspect(&target.name, target.incarnation);
        if outcome == MergeOutcome::Applied {
            self.delegate
                .notify_state_change(&target.name, NodeState::Suspect)
                .await;
            let suspect = Suspect {
                incarnation: target.incarnation,
                node: target.name.clone(),
                from: self.local_name.clone(),
            };
            if let Ok(msg) = message::encode_message(MessageType::Suspect, &suspect) {
                self.broadcasts
                    .queue_broadcast(Box::new(NodeBroadcast {
                        name: target.name.as_str().to_string(),
                        payload: msg,
                    }));
            }
            let min = self.suspicion_min_timeout();
            let max = min.saturating_mul(self.timing.suspicion_max_timeout_mult);
            self.suspicions.lock().insert(
                target.name.clone(),
                SuspicionTimer::new(min, max, self.timing.indirect_checks as u32),
            );
        }
    }

    /// `suspicionMult · ⌈log10(N+1)⌉ · probeInterval`, the same
    /// log-scaled-by-cluster-size shape as the broadcast queue's retransmit
    /// limit (spec §4.4, §4.6).
    fn suspicion_min_timeout(&self) -> Duration {
        let n = self.nodes.len().max(1) as f64;
        let log_scale = ((n + 1.0).log10().ceil() as u32).max(1);
        self.timing
            .probe_interval
            .saturating_mul(self.timing.suspicion_mult)
            .saturating_mul(log_scale)
    }

    /// Sweeps suspicions whose self-accelerating timer (spec §4.6, Lifeguard)
    /// has elapsed and converts them to `Dead`. A suspicion's deadline
    /// shrinks toward `min` as independent peers corroborate it via
    /// `Suspect` gossip (see [`SuspicionTimer::confirm`]), so this must
    /// consult each node's own timer rather than a single fixed duration.
    pub async fn reap_suspicions(&self) {
        let now = std::time::Instant::now();
        let expired: Vec<Name> = {
            let mut suspicions = self.suspicions.lock();
            let expired: Vec<Name> = suspicions
                .iter()
                .filter(|(_, timer)| timer.is_expired(now))
                .map(|(name, _)| name.clone())
                .collect();
            for name in &expired {
                suspicions.remove(name);
            }
            expired
        };
        for name in expired {
            let Some(node) = self.nodes.get(&name) else { continue };
            if self.nodes.merge_dead(&name, node.incarnation, false) == MergeOutcome::Applied {
                self.delegate
                    .notify_state_change(&name, NodeState::Dead)
                    .await;
                let dead = Dead {
                    incarnation: node.incarnation,
                    node: name.clone(),
                    from: self.local_name.clone(),
                };
                if let Ok(msg) = message::encode_message(MessageType::Dead, &dead) {
                    self.broadcasts
                        .queue_broadcast(Box::new(NodeBroadcast {
                            name: name.as_str().to_string(),
                            payload: msg,
                        }));
                }
            }
        }
    }

    /// Reclaims members whose `gossip_to_the_dead_time` grace period has
    /// elapsed, per open-question decision #1.
    pub fn reap_dead(&self, gossip_to_the_dead_time: Duration) {
        for name in self.nodes.reap(gossip_to_the_dead_time) {
            self.broadcasts.prune_name(name.as_str());
        }
        self.broadcasts.prune_over_cap();
    }

    /// One gossip round: pick `gossip_nodes` random peers and send each a
    /// packet of piggy-backed broadcasts.
    pub async fn gossip_once(&self) {
        let mut candidates = self.nodes.gossip_candidates();
        candidates.shuffle(&mut rand::rng());
        for target in candidates.into_iter().take(self.timing.gossip_nodes) {
            let cluster_size = self.nodes.len().max(1);
            let mut msgs = self.broadcasts.get_broadcasts(0, 1400, cluster_size);
            msgs.extend(self.delegate.get_broadcasts(0, 1400));
            if msgs.is_empty() {
                continue;
            }
            if let Ok(compound) = encode_compound(&msgs) {
                let framed = envelope::encode_packet(
                    &compound,
                    self.label.as_bytes(),
                    self.encode_key().as_deref(),
                    EncodeOptions {
                        crc: true,
                        compress: false,
                    },
                );
                if let Ok(packet) = framed {
                    let _ = self.transport.write_to(&packet, target.addr).await;
                }
            }
        }
    }

    /// Dispatches one decoded inbound packet. `raw` is the envelope-decoded
    /// (label/crc/compress/encrypt already peeled) message bytes.
    pub async fn handle_packet(self: &Arc<Self>, raw: &[u8], from: SocketAddr) -> Result<()> {
        let ty = MessageType::from_byte(*raw.first().ok_or_else(|| Error::Decode("empty".into()))?)?;
        match ty {
            MessageType::Compound => {
                let decoded = decode_compound(&raw[1..])?;
                if decoded.truncated > 0 {
                    debug!(truncated = decoded.truncated, "compound packet partially truncated");
                }
                for part in decoded.parts {
                    Box::pin(self.handle_packet(&part, from)).await?;
                }
                Ok(())
            }
            MessageType::Ping => {
                let (_, ping): (_, Ping) = message::decode_message(raw)?;
                let ack = AckResp {
                    seq_no: ping.seq_no,
                    payload: Vec::new(),
                };
                self.send(MessageType::AckResp, &ack, from).await
            }
            MessageType::IndirectPing => {
                let (_, req): (_, IndirectPing) = message::decode_message(raw)?;
                let inner_seq = self.next_seq();
                let ping = Ping {
                    seq_no: inner_seq,
                    node: req.node.clone(),
                    source_addr: Some(from),
                };
                let (tx, rx) = oneshot::channel();
                self.pending_acks
                    .lock()
                    .insert(inner_seq, PendingAck { tx: Some(tx) });
                self.send(MessageType::Ping, &ping, req.target).await?;
                let timeout = self.timing.probe_timeout;
                if tokio::time::timeout(timeout, rx).await.is_ok() {
                    let ack = AckResp {
                        seq_no: req.seq_no,
                        payload: Vec::new(),
                    };
                    self.send(MessageType::AckResp, &ack, from).await?;
                } else if req.nack {
                    let nack = NackResp { seq_no: req.seq_no };
                    self.send(MessageType::NackResp, &nack, from).await?;
                }
                Ok(())
            }
            MessageType::AckResp => {
                let (_, ack): (_, AckResp) = message::decode_message(raw)?;
                if let Some(pending) = self.pending_acks.lock().get_mut(&ack.seq_no) {
                    if let Some(tx) = pending.tx.take() {
                        let _ = tx.send(ack.payload);
                    }
                }
                Ok(())
            }
            MessageType::NackResp => Ok(()),
            MessageType::Suspect => {
                let (_, suspect): (_, Suspect) = message::decode_message(raw)?;
                if suspect.node == self.local_name {
                    self.refute(suspect.incarnation);
                    return Ok(());
                }
                if self.nodes.merge_suspect(&suspect.node, suspect.incarnation) == MergeOutcome::Applied {
                    self.delegate
                        .notify_state_change(&suspect.node, NodeState::Suspect)
                        .await;
                }
                if suspect.from != suspect.node {
                    if let Some(timer) = self.suspicions.lock().get_mut(&suspect.node) {
                        timer.confirm(suspect.from.clone());
                    }
                }
                Ok(())
            }
            MessageType::Alive => {
                let (_, alive): (_, Alive) = message::decode_message(raw)?;
                if let Err(e) = self.check_version(alive.addr, alive.vsn) {
                    warn!(error = %e, "rejecting alive with incompatible protocol version");
                    return Ok(());
                }
                let outcome = self.nodes.merge_alive(
                    &alive.node,
                    alive.addr,
                    alive.meta,
                    alive.incarnation,
                    alive.vsn,
                );
                match outcome {
                    MergeOutcome::Applied | MergeOutcome::NewNode => {
                        self.delegate.notify_alive(&alive.node).await;
                        self.suspicions.lock().remove(&alive.node);
                    }
                    MergeOutcome::SelfConflict => {
                        self.delegate
                            .notify_conflict(&self.local_name, alive.addr)
                            .await;
                    }
                    MergeOutcome::Stale => {}
                }
                Ok(())
            }
            MessageType::Dead => {
                let (_, dead): (_, Dead) = message::decode_message(raw)?;
                // A node declaring its own death (`from == node`) is a
                // graceful departure, not a failure: it lands on `Left`
                // rather than `Dead` even if a third party's suspicion
                // timeout already reported it `Dead` at a lower incarnation
                // (spec §8 scenario 2).
                let as_left = dead.node == dead.from;
                if self.nodes.merge_dead(&dead.node, dead.incarnation, as_left) == MergeOutcome::Applied {
                    self.suspicions.lock().remove(&dead.node);
                    let next_state = if as_left { NodeState::Left } else { NodeState::Dead };
                    self.delegate.notify_state_change(&dead.node, next_state).await;
                }
                Ok(())
            }
            MessageType::User => {
                self.delegate.notify_msg(&raw[1..]).await;
                Ok(())
            }
            MessageType::Join => {
                let (_, join): (_, message::Join) = message::decode_message(raw)?;
                self.delegate.notify_join_intent(join).await;
                Ok(())
            }
            MessageType::Leave => {
                let (_, leave): (_, message::Leave) = message::decode_message(raw)?;
                self.delegate.notify_leave_intent(leave).await;
                Ok(())
            }
            MessageType::Query => {
                let (_, query): (_, message::Query) = message::decode_message(raw)?;
                let source = query.source_addr;
                if let Some(resp) = self.delegate.notify_query(query).await {
                    let _ = self.transport.write_to(&resp, source).await;
                }
                Ok(())
            }
            MessageType::QueryResponse => {
                let (_, resp): (_, message::QueryResponse) = message::decode_message(raw)?;
                self.delegate.notify_query_response(resp).await;
                Ok(())
            }
            MessageType::Relay => {
                let (_, relay): (_, message::Relay) = message::decode_message(raw)?;
                let _ = self.transport.write_to(&relay.payload, relay.dest).await;
                Ok(())
            }
            MessageType::KeyRequest => {
                let (_, req): (_, message::KeyRequest) = message::decode_message(raw)?;
                let resp = self.handle_key_request(req);
                self.send(MessageType::KeyResponse, &resp, from).await
            }
            other => {
                trace!(?other, "unhandled message type at swim layer");
                Ok(())
            }
        }
    }

    /// Bumps our own incarnation strictly above `observed` and broadcasts a
    /// fresh `Alive` to refute a suspicion about ourselves.
    fn refute(self: &Arc<Self>, observed: u64) {
        let current = self.incarnation.load(Ordering::SeqCst) as u64;
        let next = current.max(observed) + 1;
        self.incarnation.store(next as u32, Ordering::SeqCst);
        let alive = Alive {
            incarnation: next,
            node: self.local_name.clone(),
            addr: self.local_addr,
            meta: self.delegate.node_meta(512),
            vsn: OUR_VERSION,
        };
        if let Ok(msg) = message::encode_message(MessageType::Alive, &alive) {
            self.broadcasts
                .queue_broadcast(Box::new(NodeBroadcast {
                    name: self.local_name.as_str().to_string(),
                    payload: msg,
                }));
        }
    }

    /// Announces our own graceful departure to the cluster: a `Dead`
    /// message with `from == node`, which peers apply as `Left` rather than
    /// `Dead` (spec §4.5 refutation note, §8 scenario 2). Queued onto the
    /// broadcast queue like any other gossip item so it piggybacks on the
    /// next probe/gossip packets rather than requiring a direct send to
    /// every peer.
    pub fn broadcast_leave(self: &Arc<Self>) {
        let incarnation = self.incarnation.load(Ordering::SeqCst) as u64;
        let dead = Dead {
            incarnation,
            node: self.local_name.clone(),
            from: self.local_name.clone(),
        };
        if let Ok(msg) = message::encode_message(MessageType::Dead, &dead) {
            self.broadcasts.queue_broadcast(Box::new(NodeBroadcast {
                name: self.local_name.as_str().to_string(),
                payload: msg,
            }));
        }
    }

    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// Re-broadcasts our own `Alive` with fresh delegate metadata and a
    /// bumped incarnation, e.g. after a local tag change (spec §4.11 `tags`).
    pub fn refresh_metadata(self: &Arc<Self>) {
        let current = self.incarnation.load(Ordering::SeqCst) as u64;
        self.refute(current);
    }

    /// Forcibly marks `name` dead and gossips it, for an operator-driven
    /// force-leave (spec §4.10 `force-leave`).
    pub async fn force_leave(self: &Arc<Self>, name: &Name) {
        let Some(node) = self.nodes.get(name) else {
            return;
        };
        if self.nodes.merge_dead(name, node.incarnation, false) == MergeOutcome::Applied {
            self.suspicions.lock().remove(name);
            self.delegate.notify_state_change(name, NodeState::Dead).await;
            let dead = Dead {
                incarnation: node.incarnation,
                node: name.clone(),
                from: self.local_name.clone(),
            };
            if let Ok(msg) = message::encode_message(MessageType::Dead, &dead) {
                self.broadcasts
                    .queue_broadcast(Box::new(NodeBroadcast {
                        name: name.as_str().to_string(),
                        payload: msg,
                    }));
            }
        }
    }

    /// Stops the underlying transport's I/O, causing the receive and
    /// push/pull accept loops to exit (spec §4.11 shutdown).
    pub async fn shutdown_transport(&self) {
        let _ = self.transport.shutdown().await;
    }

    /// Rejects peers whose advertised protocol-current version falls outside
    /// the range we accept (spec §4.6 version handshake).
    fn check_version(&self, addr: SocketAddr, vsn: VersionVector) -> Result<()> {
        let (local_min, local_max, peer) = (OUR_VERSION[0], OUR_VERSION[1], vsn[2]);
        if peer < local_min || peer > local_max {
            return Err(Error::ProtocolVersionMismatch {
                addr: addr.to_string(),
                local_min,
                local_max,
                peer,
            });
        }
        Ok(())
    }

    fn handle_key_request(&self, req: message::KeyRequest) -> message::KeyResponse {
        use crate::codec::message::KeyOp;
        let result = match req.op {
            KeyOp::List => {
                return message::KeyResponse {
                    result: true,
                    message: String::new(),
                    keys: self.keyring.keys(),
                    primary: self.keyring.primary(),
                };
            }
            KeyOp::Install => self.keyring.install(req.key.unwrap_or_default()),
            KeyOp::Use => self.keyring.use_key(&req.key.unwrap_or_default()),
            KeyOp::Remove => self.keyring.remove(&req.key.unwrap_or_default()),
        };
        match result {
            Ok(()) => message::KeyResponse {
                result: true,
                message: String::new(),
                keys: Vec::new(),
                primary: None,
            },
            Err(e) => message::KeyResponse {
                result: false,
                message: e.to_string(),
                keys: Vec::new(),
                primary: None,
            },
        }
    }

    /// One push/pull anti-entropy round with a random known peer (spec §4.6).
    pub async fn push_pull_once(self: &Arc<Self>) {
        let candidates = self.nodes.probe_candidates();
        let Some(target) = candidates.choose(&mut rand::rng()).cloned() else {
            return;
        };
        if let Err(e) = self.push_pull_addr(target.addr, false).await {
            debug!(node = %target.name, error = %e, "push/pull failed");
        }
    }

    /// Joins the cluster by push/pull-ing with each given address in turn,
    /// marked `join = true` so the peer's delegate treats our opaque state as
    /// a bootstrap rather than a routine anti-entropy refresh.
    pub async fn join(self: &Arc<Self>, addrs: &[SocketAddr]) -> (usize, Vec<(String, String)>) {
        let mut succeeded = 0;
        let mut causes = Vec::new();
        for addr in addrs {
            match self.push_pull_addr(*addr, true).await {
                Ok(()) => succeeded += 1,
                Err(e) => causes.push((addr.to_string(), e.to_string())),
            }
        }
        (succeeded, causes)
    }

    async fn push_pull_addr(self: &Arc<Self>, addr: SocketAddr, join: bool) -> Result<()> {
        let mut conn = self
            .transport
            .dial_timeout(addr, self.timing.probe_timeout.max(Duration::from_secs(1)))
            .await?;
        let local = self.local_push_pull(join);
        let encoded = message::encode_message(MessageType::PushPull, &local)?;
        write_stream_frame(&mut conn, &encoded).await?;
        let remote_bytes = read_stream_frame(&mut conn).await?;
        let (_, remote): (_, message::PushPull) = message::decode_message(&remote_bytes)?;
        self.merge_push_pull(remote).await;
        Ok(())
    }

    /// Accepts incoming push/pull streams until the transport stops handing
    /// them out (shutdown).
    pub async fn accept_push_pull_loop(self: Arc<Self>) {
        loop {
            match self.transport.accept_stream().await {
                Ok((mut conn, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle_incoming_stream(&mut conn).await {
                            debug!(%peer, error = %e, "push/pull accept failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept_stream failed, stopping push/pull accept loop");
                    return;
                }
            }
        }
    }

    async fn handle_incoming_stream(self: &Arc<Self>, conn: &mut Box<dyn Conn>) -> Result<()> {
        let bytes = read_stream_frame(conn).await?;
        let (_, remote): (_, message::PushPull) = message::decode_message(&bytes)?;
        self.merge_push_pull(remote).await;
        let response = self.local_push_pull(false);
        let encoded = message::encode_message(MessageType::PushPull, &response)?;
        write_stream_frame(conn, &encoded).await?;
        Ok(())
    }

    fn local_push_pull(&self, join: bool) -> message::PushPull {
        let nodes = self
            .nodes
            .all()
            .into_iter()
            .map(|n| message::PushNodeState {
                name: n.name,
                addr: n.addr,
                meta: n.meta,
                incarnation: n.incarnation,
                state: n.state,
                vsn: n.vsn,
            })
            .collect();
        message::PushPull {
            nodes,
            user_state: self.delegate.local_state(join),
            join,
        }
    }

    async fn merge_push_pull(self: &Arc<Self>, remote: message::PushPull) {
        for node in remote.nodes {
            if node.name == self.local_name {
                continue;
            }
            if let Err(e) = self.check_version(node.addr, node.vsn) {
                warn!(error = %e, "skipping push/pull node with incompatible protocol version");
                continue;
            }
            let outcome = match node.state {
                NodeState::Alive => {
                    self.nodes
                        .merge_alive(&node.name, node.addr, node.meta, node.incarnation, node.vsn)
                }
                NodeState::Suspect => self.nodes.merge_suspect(&node.name, node.incarnation),
                NodeState::Dead => self.nodes.merge_dead(&node.name, node.incarnation, false),
                NodeState::Left => self.nodes.merge_dead(&node.name, node.incarnation, true),
            };
            if matches!(outcome, MergeOutcome::Applied | MergeOutcome::NewNode) {
                self.delegate.notify_state_change(&node.name, node.state).await;
            }
        }
        self.delegate.merge_remote_state(&remote.user_state, remote.join).await;
        self.delegate.notify_merge(&[]).await;
    }

    /// Drives the UDP receive loop: peels the envelope (label/crc/compress/
    /// encrypt) off every inbound packet and dispatches what remains, until
    /// the transport's `read_packet` starts erroring (shutdown).
    pub async fn run_receive_loop(self: Arc<Self>) {
        loop {
            let packet = match self.transport.read_packet().await {
                Ok(p) => p,
                Err(e) => {
                    debug!(error = %e, "read_packet failed, stopping receive loop");
                    return;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                let decoded = match envelope::decode_packet(&packet.buf, this.label.as_bytes(), &this.keyring) {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(from = %packet.from, error = %e, "dropping undecodable packet");
                        return;
                    }
                };
                if let Err(e) = this.handle_packet(&decoded, packet.from).await {
                    warn!(from = %packet.from, error = %e, "failed to handle inbound packet");
                }
            });
        }
    }
}

async fn write_stream_frame<W: tokio::io::AsyncWrite + Unpin>(w: &mut W, bytes: &[u8]) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    w.write_u32(bytes.len() as u32).await?;
    w.write_all(bytes).await?;
    w.flush().await?;
    Ok(())
}

async fn read_stream_frame<R: tokio::io::AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>> {
    use tokio::io::AsyncReadExt;
    const MAX_FRAME: usize = 16 * 1024 * 1024;
    let len = r.read_u32().await? as usize;
    if len > MAX_FRAME {
        return Err(Error::Decode(format!("push/pull frame too large: {len}")));
    }
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics;

    struct NullDelegate;

    #[async_trait::async_trait]
    impl Delegate for NullDelegate {
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            Vec::new()
        }
        async fn notify_msg(&self, _payload: &[u8]) {}
        fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
            Vec::new()
        }
        fn local_state(&self, _join: bool) -> Vec<u8> {
            Vec::new()
        }
        async fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
        async fn notify_alive(&self, _name: &Name) {}
        async fn notify_conflict(&self, _name: &Name, _other_addr: SocketAddr) {}
        async fn notify_merge(&self, _peers: &[Name]) {}
        async fn notify_state_change(&self, _name: &Name, _state: NodeState) {}
        fn notify_ping(&self, _name: &Name) -> Option<Vec<u8>> {
            None
        }
        async fn notify_join_intent(&self, _msg: message::Join) {}
        async fn notify_leave_intent(&self, _msg: message::Leave) {}
        async fn notify_query(&self, _query: message::Query) -> Option<Vec<u8>> {
            None
        }
        async fn notify_query_response(&self, _resp: message::QueryResponse) {}
    }

    fn test_swim(name: &str, addr: &str, transport: Arc<dyn Transport>) -> Arc<Swim> {
        let mut config = Config::default();
        config.name = name.to_string();
        Arc::new(
            Swim::new(
                &config,
                addr.parse().unwrap(),
                transport,
                Arc::new(NullDelegate),
                Arc::new(Keyring::empty()),
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn ping_is_acked() {
        use crate::transport::channel::ChannelTransport;

        let a_addr: SocketAddr = "127.0.0.1:41001".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:41002".parse().unwrap();
        let a_transport = ChannelTransport::register(a_addr);
        let b_transport = ChannelTransport::register(b_addr);

        let b = test_swim("b", "127.0.0.1:41002", b_transport.clone());
        let b_loop = b.clone();
        tokio::spawn(async move {
            loop {
                let pkt = match b_loop.transport.read_packet().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                let _ = b_loop.handle_packet(&pkt.buf, pkt.from).await;
            }
        });

        let a = test_swim("a", "127.0.0.1:41001", a_transport.clone());
        a.nodes.merge_alive(
            &Name::new("b").unwrap(),
            b_addr,
            Vec::new(),
            1,
            OUR_VERSION,
        );
        let target = a.nodes.get(&Name::new("b").unwrap()).unwrap();
        a.probe_node(&target).await.unwrap();
        assert_eq!(a.awareness.score(), 0);
        let _ = metrics::noop();
    }

    #[tokio::test]
    async fn self_declared_dead_lands_on_left_over_a_prior_suspicion_dead() {
        use crate::transport::channel::ChannelTransport;

        let a_addr: SocketAddr = "127.0.0.1:41021".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:41022".parse().unwrap();
        let a_transport = ChannelTransport::register(a_addr);
        let _b_transport = ChannelTransport::register(b_addr);

        let a = test_swim("a", "127.0.0.1:41021", a_transport.clone());
        let b_name = Name::new("b").unwrap();
        a.nodes.merge_alive(&b_name, b_addr, Vec::new(), 5, OUR_VERSION);

        let suspicion_dead = Dead {
            incarnation: 5,
            node: b_name.clone(),
            from: Name::new("c").unwrap(),
        };
        let msg = message::encode_message(MessageType::Dead, &suspicion_dead).unwrap();
        a.handle_packet(&msg, b_addr).await.unwrap();
        assert_eq!(a.nodes.get(&b_name).unwrap().state, NodeState::Dead);

        let self_declared = Dead {
            incarnation: 6,
            node: b_name.clone(),
            from: b_name.clone(),
        };
        let msg = message::encode_message(MessageType::Dead, &self_declared).unwrap();
        a.handle_packet(&msg, b_addr).await.unwrap();
        assert_eq!(a.nodes.get(&b_name).unwrap().state, NodeState::Left);
    }

    #[tokio::test]
    async fn suspect_confirmation_from_the_suspect_itself_is_ignored() {
        use crate::transport::channel::ChannelTransport;
        use crate::suspicion::SuspicionTimer;
        use std::time::Duration;

        let a_addr: SocketAddr = "127.0.0.1:41031".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:41032".parse().unwrap();
        let a_transport = ChannelTransport::register(a_addr);
        let _b_transport = ChannelTransport::register(b_addr);

        let a = test_swim("a", "127.0.0.1:41031", a_transport.clone());
        let b_name = Name::new("b").unwrap();
        a.nodes.merge_alive(&b_name, b_addr, Vec::new(), 1, OUR_VERSION);

        let max = Duration::from_secs(10);
        a.suspicions.lock().insert(
            b_name.clone(),
            SuspicionTimer::new(Duration::from_secs(1), max, 3),
        );

        // B "confirming" its own suspicion must not accelerate the timer.
        let self_confirm = Suspect {
            incarnation: 1,
            node: b_name.clone(),
            from: b_name.clone(),
        };
        let msg = message::encode_message(MessageType::Suspect, &self_confirm).unwrap();
        a.handle_packet(&msg, b_addr).await.unwrap();
        assert_eq!(a.suspicions.lock().get(&b_name).unwrap().timeout(), max);

        // A genuine third-party confirmation still accelerates it.
        let third_party_confirm = Suspect {
            incarnation: 1,
            node: b_name.clone(),
            from: Name::new("c").unwrap(),
        };
        let msg = message::encode_message(MessageType::Suspect, &third_party_confirm).unwrap();
        a.handle_packet(&msg, b_addr).await.unwrap();
        assert!(a.suspicions.lock().get(&b_name).unwrap().timeout() < max);
    }
}
