//! Per-connection control-protocol session (spec §4.10): gates commands
//! behind handshake/auth, serializes writes through a single mailbox task
//! (the actor-mailbox shape of `orchestration::actor`, before it was trimmed
//! down to what this spec still needs), and tracks this connection's
//! streaming subscriptions so a disconnect cancels all of them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

/// Tags a streamed line with the monitor subscription's `Seq` so session.rs
/// can route it through the same framed-response path as every other reply.
#[derive(Serialize)]
struct LogLine {
    #[serde(rename = "Log")]
    log: String,
}

use crate::common::anchored_match;
use crate::control::backend::{ControlBackend, QueryRequest, QueryStreamItem, StreamItem};
use crate::control::protocol::{
    self, RequestHeader, ResponseHeader, ERR_AUTH_REQUIRED, ERR_DUPLICATE_HANDSHAKE,
    ERR_HANDSHAKE_REQUIRED, ERR_INVALID_AUTH, ERR_UNSUPPORTED_COMMAND,
};

#[derive(Deserialize)]
struct HandshakeBody {
    #[serde(rename = "Version")]
    version: u32,
}

#[derive(Deserialize, Default)]
struct AuthBody {
    #[serde(rename = "AuthKey")]
    auth_key: String,
}

#[derive(Serialize)]
struct Frame<B: Serialize> {
    #[serde(flatten)]
    header: ResponseHeader,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<B>,
}

/// Outstanding streaming subscriptions (`query`, `stream`, `monitor`) keyed
/// by request `Seq`, shared between the read loop and the spawned stream
/// tasks so a task can deregister itself on natural completion instead of
/// leaking a finished `JoinHandle` until the connection closes.
type StreamTable = Arc<Mutex<HashMap<u64, JoinHandle<()>>>>;

/// Drives one accepted connection to completion. Returns when the socket
/// closes or an unrecoverable framing error occurs.
pub async fn run<S>(stream: S, backend: Arc<dyn ControlBackend>, auth_key: Option<String>)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if protocol::write_frame(&mut writer, &bytes).await.is_err() {
                break;
            }
        }
    });

    let mut handshaken = false;
    let mut authed = auth_key.is_none();
    let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));

    loop {
        let frame = match protocol::read_frame(&mut reader).await {
            Ok(f) => f,
            Err(_) => break,
        };
        let header: RequestHeader = match protocol::decode(&frame) {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "malformed control-protocol request header");
                break;
            }
        };
        // The body, if any, follows the same frame for simple commands; we
        // decode it permissively as a generic value and pull named fields.
        let body: Value = protocol::decode(&frame).unwrap_or(Value::Null);

        if header.command != "handshake" && !handshaken {
            send_err(&out_tx, header.seq, ERR_HANDSHAKE_REQUIRED);
            continue;
        }
        if header.command == "handshake" {
            if handshaken {
                send_err(&out_tx, header.seq, ERR_DUPLICATE_HANDSHAKE);
                break;
            }
            let _ = serde_json::from_value::<HandshakeBody>(body).unwrap_or(HandshakeBody { version: 0 });
            handshaken = true;
            send_ok(&out_tx, header.seq);
            continue;
        }
        if header.command == "auth" {
            let parsed = serde_json::from_value::<AuthBody>(body).unwrap_or_default();
            match &auth_key {
                Some(expected) if *expected == parsed.auth_key => {
                    authed = true;
                    send_ok(&out_tx, header.seq);
                }
                Some(_) => send_err(&out_tx, header.seq, ERR_INVALID_AUTH),
                None => send_ok(&out_tx, header.seq),
            }
            continue;
        }
        if !authed {
            send_err(&out_tx, header.seq, ERR_AUTH_REQUIRED);
            continue;
        }

        if header.command == "stop" {
            if let Some(handle) = streams.remove(&header.seq) {
                handle.abort();
            }
            send_ok(&out_tx, header.seq);
            continue;
        }

        dispatch(&header, body, &backend, &out_tx, &mut streams).await;
    }

    for (_, handle) in streams.drain() {
        handle.abort();
    }
    writer_task.abort();
}

fn send_ok(tx: &mpsc::UnboundedSender<Vec<u8>>, seq: u64) {
    send_body::<()>(tx, ResponseHeader::ok(seq), None);
}

fn send_err(tx: &mpsc::UnboundedSender<Vec<u8>>, seq: u64, message: &str) {
    send_body::<()>(tx, ResponseHeader::err(seq, message), None);
}

fn send_body<B: Serialize>(tx: &mpsc::UnboundedSender<Vec<u8>>, header: ResponseHeader, body: Option<B>) {
    let frame = Frame { header, body };
    if let Ok(bytes) = protocol::encode(&frame) {
        let _ = tx.send(bytes);
    }
}

async fn dispatch(
    header: &RequestHeader,
    body: Value,
    backend: &Arc<dyn ControlBackend>,
    out_tx: &mpsc::UnboundedSender<Vec<u8>>,
    streams: &mut HashMap<u64, JoinHandle<()>>,
) {
    let seq = header.seq;
    match header.command.as_str() {
        "members" => {
            let members = backend.members().await;
            send_body(out_tx, ResponseHeader::ok(seq), Some(members));
        }
        "members-filtered" => {
            #[derive(Deserialize)]
            struct Filter {
                #[serde(default)]
                name: String,
                #[serde(default)]
                status: String,
                #[serde(default)]
                tags: HashMap<String, String>,
            }
            let filter: Filter = serde_json::from_value(body).unwrap_or(Filter {
                name: String::new(),
                status: String::new(),
                tags: HashMap::new(),
            });
            let members: Vec<_> = backend
                .members()
                .await
                .into_iter()
                .filter(|m| filter.name.is_empty() || anchored_match(&filter.name, &m.name))
                .filter(|m| filter.status.is_empty() || anchored_match(&filter.status, &m.status))
                .filter(|m| {
                    filter.tags.iter().all(|(k, v)| {
                        m.tags
                            .get(k)
                            .map(|actual| anchored_match(v, actual))
                            .unwrap_or(false)
                    })
                })
                .collect();
            send_body(out_tx, ResponseHeader::ok(seq), Some(members));
        }
        "join" => {
            #[derive(Deserialize)]
            struct Req {
                #[serde(rename = "Existing")]
                existing: Vec<String>,
            }
            let req: Req = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(e) => return send_err(out_tx, seq, &e.to_string()),
            };
            let (count, causes) = backend.join(req.existing).await;
            #[derive(Serialize)]
            struct Resp {
                #[serde(rename = "Num")]
                num: usize,
                #[serde(rename = "Causes")]
                causes: Vec<(String, String)>,
            }
            send_body(out_tx, ResponseHeader::ok(seq), Some(Resp { num: count, causes }));
        }
        "leave" => match backend.leave().await {
            Ok(()) => send_ok(out_tx, seq),
            Err(e) => send_err(out_tx, seq, &e.to_string()),
        },
        "force-leave" => {
            #[derive(Deserialize)]
            struct Req {
                #[serde(rename = "Node")]
                node: String,
                #[serde(default, rename = "Prune")]
                prune: bool,
            }
            let req: Req = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(e) => return send_err(out_tx, seq, &e.to_string()),
            };
            match backend.force_leave(&req.node, req.prune).await {
                Ok(()) => send_ok(out_tx, seq),
                Err(e) => send_err(out_tx, seq, &e.to_string()),
            }
        }
        "event" => {
            #[derive(Deserialize)]
            struct Req {
                #[serde(rename = "Name")]
                name: String,
                #[serde(rename = "Payload")]
                payload: Vec<u8>,
                #[serde(default, rename = "Coalesce")]
                coalesce: bool,
            }
            let req: Req = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(e) => return send_err(out_tx, seq, &e.to_string()),
            };
            match backend.user_event(req.name, req.payload, req.coalesce).await {
                Ok(()) => send_ok(out_tx, seq),
                Err(e) => send_err(out_tx, seq, &e.to_string()),
            }
        }
        "query" => {
            let req: QueryRequest = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(e) => return send_err(out_tx, seq, &e.to_string()),
            };
            let mut responses = match backend.query(req).await {
                Ok(rx) => rx,
                Err(e) => return send_err(out_tx, seq, &e.to_string()),
            };
            send_ok(out_tx, seq);
            let tx = out_tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(item) = responses.recv().await {
                    let done = matches!(item, QueryStreamItem::Done);
                    send_body(&tx, ResponseHeader::ok(seq), Some(item));
                    if done {
                        break;
                    }
                }
            });
            streams.insert(seq, handle);
        }
        "tags" => {
            #[derive(Deserialize, Default)]
            struct Req {
                #[serde(default, rename = "Add")]
                add: HashMap<String, String>,
                #[serde(default, rename = "Delete")]
                delete: Vec<String>,
            }
            let req: Req = serde_json::from_value(body).unwrap_or_default();
            match backend.set_tags(req.add, req.delete).await {
                Ok(()) => send_ok(out_tx, seq),
                Err(e) => send_err(out_tx, seq, &e.to_string()),
            }
        }
        "stats" => {
            let stats = backend.stats().await;
            send_body(out_tx, ResponseHeader::ok(seq), Some(stats));
        }
        "get-coordinate" => {
            #[derive(Deserialize, Default)]
            struct Req {
                #[serde(default, rename = "Node")]
                node: Option<String>,
            }
            let req: Req = serde_json::from_value(body).unwrap_or_default();
            let coord = backend.get_coordinate(req.node).await;
            send_body(out_tx, ResponseHeader::ok(seq), Some(coord));
        }
        "install-key" | "use-key" | "remove-key" => {
            #[derive(Deserialize)]
            struct Req {
                #[serde(rename = "Key")]
                key: Vec<u8>,
            }
            let req: Req = match serde_json::from_value(body) {
                Ok(r) => r,
                Err(e) => return send_err(out_tx, seq, &e.to_string()),
            };
            let result = match header.command.as_str() {
                "install-key" => backend.install_key(req.key).await,
                "use-key" => backend.use_key(req.key).await,
                _ => backend.remove_key(req.key).await,
            };
            match result {
                Ok(()) => send_ok(out_tx, seq),
                Err(e) => send_err(out_tx, seq, &e.to_string()),
            }
        }
        "list-keys" => {
            let (keys, primary) = backend.list_keys().await;
            #[derive(Serialize)]
            struct Resp {
                #[serde(rename = "Keys")]
                keys: Vec<Vec<u8>>,
                #[serde(rename = "Primary")]
                primary: Option<Vec<u8>>,
            }
            send_body(out_tx, ResponseHeader::ok(seq), Some(Resp { keys, primary }));
        }
        "monitor" => {
            send_ok(out_tx, seq);
            let mut rx = backend.subscribe_logs();
            let tx = out_tx.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(line) => send_body(&tx, ResponseHeader::ok(seq), Some(LogLine { log: line })),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            streams.insert(seq, handle);
        }
        "stream" => {
            send_ok(out_tx, seq);
            let mut rx = backend.subscribe_stream();
            let tx = out_tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(item) = rx.recv().await {
                    send_body(&tx, ResponseHeader::ok(seq), Some(item));
                }
            });
            streams.insert(seq, handle);
        }
        _ => send_err(out_tx, seq, ERR_UNSUPPORTED_COMMAND),
    }
}
