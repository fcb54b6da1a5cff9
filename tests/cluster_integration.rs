//! Root-level integration tests exercising the end-to-end scenarios from
//! spec §8 across real `Agent` instances wired together over
//! `ChannelTransport` (deterministic, no real sockets needed for gossip) and
//! a real control-protocol TCP listener (the server always binds a real
//! `TcpListener`, so the control-protocol test uses a loopback port).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fluxswarm::config::Config;
use fluxswarm::control::backend::ControlBackend;
use fluxswarm::transport::channel::ChannelTransport;
use fluxswarm::transport::Transport;
use fluxswarm::Agent;

fn agent_config(name: &str, bind: &str, control_port: u16) -> Config {
    let mut cfg = Config::default();
    cfg.name = name.to_string();
    cfg.bind_addr = bind.parse().unwrap();
    cfg.advertise_addr = Some(bind.parse().unwrap());
    cfg.timing = fluxswarm::config::TimingConfig::local();
    cfg.control_bind_addr = format!("127.0.0.1:{control_port}").parse().unwrap();
    cfg
}

async fn spawn_agent(name: &str, addr: &str, control_port: u16) -> Arc<Agent> {
    let bind: SocketAddr = addr.parse().unwrap();
    let transport: Arc<dyn Transport> = ChannelTransport::register(bind);
    let cfg = agent_config(name, addr, control_port);
    let agent = Agent::new(cfg, transport).unwrap();
    agent.start().await.unwrap();
    agent
}

/// Polls an async condition until it returns `true` or `timeout` elapses.
async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn member_count(agent: &Agent) -> usize {
    ControlBackend::members(agent).await.len()
}

async fn member_status(agent: &Agent, name: &str) -> Option<String> {
    ControlBackend::members(agent)
        .await
        .into_iter()
        .find(|m| m.name == name)
        .map(|m| m.status)
}

/// Scenario 1: two-node leave propagation (spec §8).
#[tokio::test]
async fn two_node_leave_propagation() {
    let a = spawn_agent("a", "127.0.0.1:19101", 19201).await;
    let b = spawn_agent("b", "127.0.0.1:19102", 19202).await;

    let (n, _causes) = ControlBackend::join(&*b, vec!["127.0.0.1:19101".to_string()]).await;
    assert_eq!(n, 1);

    let both_see_two = wait_until(Duration::from_secs(2), || async {
        member_count(&a).await == 2 && member_count(&b).await == 2
    })
    .await;
    assert!(both_see_two, "both nodes should see 2 members after join");

    b.leave().await.unwrap();

    let left = wait_until(Duration::from_secs(3), || async {
        member_status(&a, "b").await.as_deref() == Some("left")
    })
    .await;
    assert!(left, "a should observe b as left, not dead, after a graceful leave");

    a.shutdown().await.unwrap();
}

/// Scenario 4: a corrupt snapshot file is tolerated; the agent still starts
/// with itself as the sole member.
#[tokio::test]
async fn corrupt_snapshot_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("corrupt.snap");
    tokio::fs::write(&path, b"THIS IS NOT A VALID SNAPSHOT\n")
        .await
        .unwrap();

    let bind: SocketAddr = "127.0.0.1:19301".parse().unwrap();
    let transport: Arc<dyn Transport> = ChannelTransport::register(bind);
    let mut cfg = agent_config("corrupt", "127.0.0.1:19301", 19302);
    cfg.snapshot_path = Some(path.to_string_lossy().to_string());
    let agent = Agent::new(cfg, transport).unwrap();
    agent.start().await.unwrap();

    let members = ControlBackend::members(&*agent).await;
    assert_eq!(members.len(), 1, "a corrupt snapshot must not prevent startup");

    agent.shutdown().await.unwrap();
}

/// Scenario 3 (partial): a clean snapshot round-trip preserves the local
/// member's name across a restart.
#[tokio::test]
async fn snapshot_round_trip_preserves_local_member() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("s.db");

    let bind: SocketAddr = "127.0.0.1:19311".parse().unwrap();
    let transport: Arc<dyn Transport> = ChannelTransport::register(bind);
    let mut cfg = agent_config("snapper", "127.0.0.1:19311", 19312);
    cfg.snapshot_path = Some(path.to_string_lossy().to_string());
    let agent = Agent::new(cfg, transport).unwrap();
    agent.start().await.unwrap();
    agent.leave().await.unwrap();

    assert!(path.exists(), "snapshot file should exist after a clean leave");

    let bind2: SocketAddr = "127.0.0.1:19313".parse().unwrap();
    let transport2: Arc<dyn Transport> = ChannelTransport::register(bind2);
    let mut cfg2 = agent_config("snapper", "127.0.0.1:19313", 19314);
    cfg2.snapshot_path = Some(path.to_string_lossy().to_string());
    cfg2.rejoin_after_leave = true;
    let agent2 = Agent::new(cfg2, transport2).unwrap();
    agent2.start().await.unwrap();

    let members = ControlBackend::members(&*agent2).await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].name, "snapper");

    agent2.shutdown().await.unwrap();
}

/// Scenario 5: control-protocol handshake required before any other
/// command is accepted.
#[tokio::test]
async fn control_protocol_requires_handshake_first() {
    use fluxswarm::control::protocol;
    use serde::{Deserialize, Serialize};
    use tokio::net::TcpStream;

    let bind: SocketAddr = "127.0.0.1:19321".parse().unwrap();
    let transport: Arc<dyn Transport> = ChannelTransport::register(bind);
    let cfg = agent_config("handshake-test", "127.0.0.1:19321", 19421);
    let control_addr = cfg.control_bind_addr;
    let agent = Agent::new(cfg, transport).unwrap();
    agent.start().await.unwrap();

    // Give the control server's accept loop a moment to start listening.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut stream = TcpStream::connect(control_addr).await.unwrap();

    #[derive(Serialize)]
    struct Req {
        #[serde(rename = "Command")]
        command: String,
        #[serde(rename = "Seq")]
        seq: u64,
    }
    #[derive(Deserialize)]
    struct Resp {
        #[serde(rename = "Seq")]
        #[allow(dead_code)]
        seq: u64,
        #[serde(rename = "Error")]
        error: String,
    }

    let req = Req {
        command: "members".to_string(),
        seq: 1,
    };
    let bytes = protocol::encode(&req).unwrap();
    protocol::write_frame(&mut stream, &bytes).await.unwrap();
    let resp_bytes = protocol::read_frame(&mut stream).await.unwrap();
    let resp: Resp = protocol::decode(&resp_bytes).unwrap();
    assert_eq!(resp.error, "handshake required");

    agent.shutdown().await.unwrap();
}

/// Scenario 6: user-event fan-out reaches every other joined member exactly
/// once within a handful of gossip intervals.
#[tokio::test]
async fn user_event_fans_out_to_all_members() {
    use fluxswarm::orchestration::events::Event;
    use fluxswarm::EventHandler;
    use parking_lot::Mutex;

    struct Recorder(Arc<Mutex<Vec<(String, Vec<u8>)>>>);
    impl EventHandler for Recorder {
        fn handle(&self, event: &Event) {
            if let Event::User { name, payload, .. } = event {
                self.0.lock().push((name.clone(), payload.clone()));
            }
        }
    }

    let a = spawn_agent("a", "127.0.0.1:19501", 19601).await;
    let b = spawn_agent("b", "127.0.0.1:19502", 19602).await;
    let c = spawn_agent("c", "127.0.0.1:19503", 19603).await;

    let b_events = Arc::new(Mutex::new(Vec::new()));
    let c_events = Arc::new(Mutex::new(Vec::new()));
    b.update_event_handlers(vec![Arc::new(Recorder(b_events.clone()))]);
    c.update_event_handlers(vec![Arc::new(Recorder(c_events.clone()))]);

    ControlBackend::join(&*b, vec!["127.0.0.1:19501".to_string()]).await;
    ControlBackend::join(&*c, vec!["127.0.0.1:19501".to_string()]).await;

    let all_know_each_other = wait_until(Duration::from_secs(3), || async {
        member_count(&a).await == 3 && member_count(&b).await == 3 && member_count(&c).await == 3
    })
    .await;
    assert!(all_know_each_other, "all three nodes should converge on 3 members");

    ControlBackend::user_event(&*a, "deploy".to_string(), b"foo".to_vec(), false)
        .await
        .unwrap();

    let delivered = wait_until(Duration::from_secs(3), || async {
        b_events.lock().len() == 1 && c_events.lock().len() == 1
    })
    .await;
    assert!(delivered, "both b and c should receive exactly one deploy event");
    assert_eq!(b_events.lock()[0], ("deploy".to_string(), b"foo".to_vec()));
    assert_eq!(c_events.lock()[0], ("deploy".to_string(), b"foo".to_vec()));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}
