//! Append-only snapshot log (spec §4.9): one dedicated writer task owns the
//! file and receives [`SnapshotEvent`]s over a channel, grounded in the
//! teacher's `replication::snapshots` append-only-log-plus-compaction shape.
//! Flushes on a timer; compaction rewrites the file via temp-file + rename
//! once it has grown past twice the estimated live size.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::common::{LTime, Name};
use crate::error::{Error, Result};

/// One line of the snapshot log (spec §4.9/§6 persisted-state layout).
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotEvent {
    Alive { name: Name, addr: SocketAddr },
    NotAlive { name: Name },
    EventClock(LTime),
    QueryClock(LTime),
    Clock(LTime),
    Leave,
    Coordinate(Vec<u8>),
}

impl SnapshotEvent {
    fn to_line(&self) -> String {
        match self {
            SnapshotEvent::Alive { name, addr } => format!("alive: {name} {addr}"),
            SnapshotEvent::NotAlive { name } => format!("not-alive: {name}"),
            SnapshotEvent::EventClock(t) => format!("event-clock: {t}"),
            SnapshotEvent::QueryClock(t) => format!("query-clock: {t}"),
            SnapshotEvent::Clock(t) => format!("clock: {t}"),
            SnapshotEvent::Leave => "leave: -".to_string(),
            SnapshotEvent::Coordinate(bytes) => format!("coordinate: {}", hex::encode(bytes)),
        }
    }

    fn parse_line(lineno: usize, line: &str) -> Result<Self> {
        let (ty, rest) = line.split_once(": ").ok_or_else(|| corrupt(lineno, "missing ':' separator"))?;
        match ty {
            "alive" => {
                let mut parts = rest.split_whitespace();
                let name = parts.next().ok_or_else(|| corrupt(lineno, "missing name"))?;
                let addr = parts.next().ok_or_else(|| corrupt(lineno, "missing addr"))?;
                Ok(SnapshotEvent::Alive {
                    name: Name::new(name).map_err(|_| corrupt(lineno, "invalid name"))?,
                    addr: addr.parse().map_err(|_| corrupt(lineno, "invalid addr"))?,
                })
            }
            "not-alive" => Ok(SnapshotEvent::NotAlive {
                name: Name::new(rest.trim()).map_err(|_| corrupt(lineno, "invalid name"))?,
            }),
            "event-clock" => Ok(SnapshotEvent::EventClock(parse_u64(lineno, rest)?)),
            "query-clock" => Ok(SnapshotEvent::QueryClock(parse_u64(lineno, rest)?)),
            "clock" => Ok(SnapshotEvent::Clock(parse_u64(lineno, rest)?)),
            "leave" => Ok(SnapshotEvent::Leave),
            "coordinate" => Ok(SnapshotEvent::Coordinate(
                hex::decode(rest.trim()).map_err(|_| corrupt(lineno, "invalid hex"))?,
            )),
            other => Err(corrupt(lineno, &format!("unknown record type {other}"))),
        }
    }
}

fn corrupt(lineno: usize, reason: &str) -> Error {
    Error::SnapshotCorrupt {
        line: lineno,
        reason: reason.to_string(),
    }
}

fn parse_u64(lineno: usize, rest: &str) -> Result<u64> {
    rest.trim()
        .parse()
        .map_err(|_| corrupt(lineno, "invalid integer"))
}

/// Reconstructed view of a replayed snapshot (spec §4.9: "replay the file,
/// reconstruct the last-known address list, last clocks, and a
/// did-we-leave-cleanly bit").
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replayed {
    pub alive: HashMap<Name, SocketAddr>,
    pub event_clock: LTime,
    pub query_clock: LTime,
    pub member_clock: LTime,
    pub coordinate: Option<Vec<u8>>,
    pub left_cleanly: bool,
}

/// Replays `path`, tolerating a truncated/corrupt tail: the last line that
/// fails to parse and everything after it is dropped rather than failing the
/// whole replay (spec §4.9 "corrupt snapshot" behaviour). Returns
/// `Replayed::default()` if the file does not exist.
pub async fn replay(path: &Path) -> Result<Replayed> {
    let file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Replayed::default()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file).lines();
    let mut out = Replayed::default();
    let mut lineno = 0usize;

    while let Some(line) = reader.next_line().await? {
        lineno += 1;
        if line.is_empty() {
            continue;
        }
        let event = match SnapshotEvent::parse_line(lineno, &line) {
            Ok(event) => event,
            Err(e) => {
                warn!(%lineno, error = %e, "truncating snapshot at first unparsable line");
                break;
            }
        };
        out.left_cleanly = matches!(event, SnapshotEvent::Leave);
        match event {
            SnapshotEvent::Alive { name, addr } => {
                out.alive.insert(name, addr);
                out.left_cleanly = false;
            }
            SnapshotEvent::NotAlive { name } => {
                out.alive.remove(&name);
            }
            SnapshotEvent::EventClock(t) => out.event_clock = t,
            SnapshotEvent::QueryClock(t) => out.query_clock = t,
            SnapshotEvent::Clock(t) => out.member_clock = t,
            SnapshotEvent::Coordinate(bytes) => out.coordinate = Some(bytes),
            SnapshotEvent::Leave => {}
        }
    }
    Ok(out)
}

/// Handle to the running writer task: send events, trigger a flush, or ask
/// for a clean shutdown (which appends a terminal `leave` record first).
#[derive(Clone)]
pub struct SnapshotHandle {
    tx: mpsc::UnboundedSender<Command>,
}

enum Command {
    Record(SnapshotEvent),
    Shutdown(tokio::sync::oneshot::Sender<()>),
}

impl SnapshotHandle {
    pub fn record(&self, event: SnapshotEvent) {
        let _ = self.tx.send(Command::Record(event));
    }

    /// Appends a terminal `leave` record, flushes, and waits for the writer
    /// task to finish so the file is durably closed before returning.
    pub async fn shutdown(&self) {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self.tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawns the dedicated writer task and returns a handle to it. `live_size_hint`
/// is a closure the compactor calls to estimate the live record count, used
/// against the `fileSize > 2 * estimatedLiveSize` compaction trigger.
pub fn spawn(
    path: PathBuf,
    flush_interval: Duration,
    live_size_hint: impl Fn() -> usize + Send + 'static,
) -> Result<SnapshotHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_writer(path, flush_interval, live_size_hint, rx));
    Ok(SnapshotHandle { tx })
}

async fn run_writer(
    path: PathBuf,
    flush_interval: Duration,
    live_size_hint: impl Fn() -> usize,
    mut rx: mpsc::UnboundedReceiver<Command>,
) {
    let file = match fs::OpenOptions::new().create(true).append(true).open(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(error = %e, path = %path.display(), "snapshot writer could not open file");
            return;
        }
    };
    let mut writer = BufWriter::new(file);
    let mut bytes_written = written_len(&path).await;
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(Command::Record(event)) => {
                        let line = event.to_line();
                        bytes_written += line.len() as u64 + 1;
                        if let Err(e) = writer.write_all(line.as_bytes()).await {
                            warn!(error = %e, "snapshot write failed");
                            continue;
                        }
                        let _ = writer.write_all(b"\n").await;
                        if bytes_written > 2 * (live_size_hint() as u64).max(1) * 64 {
                            if let Err(e) = compact(&path, &mut writer, &mut bytes_written).await {
                                warn!(error = %e, "snapshot compaction failed");
                            }
                        }
                    }
                    Some(Command::Shutdown(ack)) => {
                        let line = SnapshotEvent::Leave.to_line();
                        let _ = writer.write_all(line.as_bytes()).await;
                        let _ = writer.write_all(b"\n").await;
                        let _ = writer.flush().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => return,
                }
            }
            _ = ticker.tick() => {
                let _ = writer.flush().await;
            }
        }
    }
}

async fn written_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

/// Rewrites the snapshot keeping only the final record per name plus the
/// latest clocks, via temp-file + rename (spec §4.9/§6).
async fn compact(path: &Path, writer: &mut BufWriter<File>, bytes_written: &mut u64) -> Result<()> {
    writer.flush().await?;
    let replayed = replay(path).await?;
    let tmp_path = path.with_extension("tmp");
    let mut tmp = BufWriter::new(File::create(&tmp_path).await?);
    for (name, addr) in &replayed.alive {
        let line = SnapshotEvent::Alive { name: name.clone(), addr: *addr }.to_line();
        tmp.write_all(line.as_bytes()).await?;
        tmp.write_all(b"\n").await?;
    }
    for (clock, value) in [
        ("event-clock", replayed.event_clock),
        ("query-clock", replayed.query_clock),
        ("clock", replayed.member_clock),
    ] {
        let line = format!("{clock}: {value}");
        tmp.write_all(line.as_bytes()).await?;
        tmp.write_all(b"\n").await?;
    }
    tmp.flush().await?;
    drop(tmp);
    fs::rename(&tmp_path, path).await?;
    *writer = BufWriter::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?,
    );
    *bytes_written = written_len(path).await;
    debug!(path = %path.display(), "snapshot compacted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn round_trips_alive_and_clocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        let handle = spawn(path.clone(), Duration::from_millis(20), || 1).unwrap();
        let name = Name::new("a").unwrap();
        let addr: SocketAddr = "127.0.0.1:1000".parse().unwrap();
        handle.record(SnapshotEvent::Alive { name: name.clone(), addr });
        handle.record(SnapshotEvent::EventClock(5));
        handle.shutdown().await;

        let replayed = replay(&path).await.unwrap();
        assert_eq!(replayed.alive.get(&name), Some(&addr));
        assert_eq!(replayed.event_clock, 5);
        assert!(replayed.left_cleanly);
    }

    #[tokio::test]
    async fn corrupt_tail_is_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.db");
        fs::write(&path, "THIS IS NOT A VALID SNAPSHOT\n").await.unwrap();
        let replayed = replay(&path).await.unwrap();
        assert!(replayed.alive.is_empty());
    }

    #[tokio::test]
    async fn missing_file_replays_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let replayed = replay(&path).await.unwrap();
        assert_eq!(replayed, Replayed::default());
    }
}
