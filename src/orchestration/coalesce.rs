//! Quiescent-period event coalescing (spec §4.7): buffers member and
//! coalesce-eligible user events and only forwards them to external handlers
//! once no new event has arrived for `quiescent_period`, up to
//! `quiescent_max_timeout` after the first buffered event. Runs as its own
//! task fed by an mpsc channel, the shape the teacher's background workers
//! take throughout the networking layer.
//!
//! Merging, not just batching: within a window, later events for the same
//! member (or the same user-event name) overwrite earlier ones rather than
//! piling up, and a member whose merged state hasn't actually changed since
//! the last flush is dropped entirely. Queries and non-coalescing user
//! events bypass the window altogether and are forwarded as their own
//! single-item batch the moment they arrive — holding a query for a
//! quiescent period would just stall its response.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::common::Name;
use crate::orchestration::events::{Event, MemberEvent};

/// Coalescing policy: how long to wait for quiet before flushing, and the
/// hard ceiling past which a flush happens regardless of ongoing churn.
#[derive(Debug, Clone, Copy)]
pub struct CoalescePolicy {
    pub quiescent_period: Duration,
    pub quiescent_max_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum MemberKind {
    Join,
    Leave,
    Failed,
    Update,
    Reap,
}

impl MemberKind {
    fn of(event: &Event) -> Option<Self> {
        match event {
            Event::MemberJoin(_) => Some(Self::Join),
            Event::MemberLeave(_) => Some(Self::Leave),
            Event::MemberFailed(_) => Some(Self::Failed),
            Event::MemberUpdate(_) => Some(Self::Update),
            Event::MemberReap(_) => Some(Self::Reap),
            _ => None,
        }
    }

    fn wrap(self, members: Vec<MemberEvent>) -> Event {
        match self {
            Self::Join => Event::MemberJoin(members),
            Self::Leave => Event::MemberLeave(members),
            Self::Failed => Event::MemberFailed(members),
            Self::Update => Event::MemberUpdate(members),
            Self::Reap => Event::MemberReap(members),
        }
    }
}

fn member_events_of(event: Event) -> Vec<MemberEvent> {
    match event {
        Event::MemberJoin(m)
        | Event::MemberLeave(m)
        | Event::MemberFailed(m)
        | Event::MemberUpdate(m)
        | Event::MemberReap(m) => m,
        _ => Vec::new(),
    }
}

/// What was last actually delivered for a member, so an identical repeat
/// within a later window is suppressed rather than re-delivered.
#[derive(PartialEq, Eq, Clone)]
struct DeliveredState {
    kind: MemberKind,
    status: crate::orchestration::state_machine::MemberStatus,
}

/// Accumulates member and coalesce-eligible user events within one window,
/// merging per-member / per-name, last-write-wins.
#[derive(Default)]
struct Window {
    members: HashMap<Name, (MemberKind, MemberEvent)>,
    users: HashMap<String, Event>,
}

impl Window {
    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.users.is_empty()
    }

    fn push(&mut self, event: Event) {
        if let Some(kind) = MemberKind::of(&event) {
            for member in member_events_of(event) {
                self.members.insert(member.name.clone(), (kind, member));
            }
            return;
        }
        if let Event::User { ref name, .. } = event {
            self.users.insert(name.clone(), event);
            return;
        }
        // Queries and non-coalescing user events never reach `Window::push`;
        // `run` forwards them immediately instead.
    }

    /// Drains the window into flushable batches, suppressing members whose
    /// merged (kind, status) is unchanged from what `delivered` last recorded
    /// for them, and updating `delivered` for everything that does flush.
    fn drain(self, delivered: &mut HashMap<Name, DeliveredState>) -> Vec<Event> {
        let mut by_kind: HashMap<MemberKind, Vec<MemberEvent>> = HashMap::new();
        for (name, (kind, member)) in self.members {
            let state = DeliveredState {
                kind,
                status: member.status,
            };
            if delivered.get(&name) == Some(&state) {
                continue;
            }
            delivered.insert(name, state);
            by_kind.entry(kind).or_default().push(member);
        }

        let mut out: Vec<Event> = by_kind
            .into_iter()
            .map(|(kind, members)| kind.wrap(members))
            .collect();
        out.extend(self.users.into_values());
        out
    }
}

/// Buffers events from `inbox` and flushes the accumulated, merged batch to
/// `out` once quiescent, or once `quiescent_max_timeout` has elapsed since
/// the first buffered event, whichever comes first. Returns when `inbox`
/// closes, flushing any final partial batch first.
pub async fn run(
    policy: CoalescePolicy,
    mut inbox: mpsc::UnboundedReceiver<Event>,
    out: mpsc::UnboundedSender<Vec<Event>>,
) {
    let mut window = Window::default();
    let mut delivered: HashMap<Name, DeliveredState> = HashMap::new();
    let mut first_seen: Option<Instant> = None;

    loop {
        let wait = first_seen.map(|first| {
            let quiet_deadline = Instant::now() + policy.quiescent_period;
            let max_deadline = first + policy.quiescent_max_timeout;
            quiet_deadline
                .min(max_deadline)
                .saturating_duration_since(Instant::now())
        });

        let next = match wait {
            None => inbox.recv().await,
            Some(d) => match timeout(d, inbox.recv()).await {
                Ok(v) => v,
                Err(_) => {
                    first_seen = None;
                    let batch = std::mem::take(&mut window).drain(&mut delivered);
                    if !batch.is_empty() && out.send(batch).is_err() {
                        return;
                    }
                    continue;
                }
            },
        };

        match next {
            Some(event @ (Event::Query(_) | Event::User { coalesce: false, .. })) => {
                if out.send(vec![event]).is_err() {
                    return;
                }
            }
            Some(event) => {
                if first_seen.is_none() {
                    first_seen = Some(Instant::now());
                }
                window.push(event);
            }
            None => {
                let batch = window.drain(&mut delivered);
                if !batch.is_empty() {
                    let _ = out.send(batch);
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::state_machine::MemberStatus;

    fn sample_event() -> Event {
        Event::MemberJoin(vec![MemberEvent {
            name: Name::new("a").unwrap(),
            status: MemberStatus::Alive,
            tags: Default::default(),
        }])
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_after_quiescent_period() {
        let policy = CoalescePolicy {
            quiescent_period: Duration::from_millis(50),
            quiescent_max_timeout: Duration::from_secs(5),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(policy, rx, out_tx));

        tx.send(sample_event()).unwrap();
        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_at_max_timeout_under_continuous_churn() {
        let policy = CoalescePolicy {
            quiescent_period: Duration::from_millis(30),
            quiescent_max_timeout: Duration::from_millis(80),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(policy, rx, out_tx));

        // Different members each tick, so merging never collapses the churn
        // away; only the max timeout forces a flush.
        for i in 0..5 {
            tx.send(Event::MemberJoin(vec![MemberEvent {
                name: Name::new(&format!("m{i}")).unwrap(),
                status: MemberStatus::Alive,
                tags: Default::default(),
            }]))
            .unwrap();
            tokio::time::advance(Duration::from_millis(20)).await;
        }
        let batch = out_rx.recv().await.unwrap();
        assert!(!batch.is_empty());

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn later_update_in_same_window_overwrites_earlier_one() {
        let policy = CoalescePolicy {
            quiescent_period: Duration::from_millis(50),
            quiescent_max_timeout: Duration::from_secs(5),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(policy, rx, out_tx));

        let name = Name::new("a").unwrap();
        tx.send(Event::MemberUpdate(vec![MemberEvent {
            name: name.clone(),
            status: MemberStatus::Alive,
            tags: [("v".to_string(), "1".to_string())].into_iter().collect(),
        }]))
        .unwrap();
        tx.send(Event::MemberUpdate(vec![MemberEvent {
            name: name.clone(),
            status: MemberStatus::Alive,
            tags: [("v".to_string(), "2".to_string())].into_iter().collect(),
        }]))
        .unwrap();

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            Event::MemberUpdate(members) => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].tags.get("v").map(String::as_str), Some("2"));
            }
            other => panic!("expected a single MemberUpdate, got {other:?}"),
        }

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn same_state_repeat_is_suppressed_across_windows() {
        let policy = CoalescePolicy {
            quiescent_period: Duration::from_millis(30),
            quiescent_max_timeout: Duration::from_secs(5),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(policy, rx, out_tx));

        let name = Name::new("a").unwrap();
        let join = || {
            Event::MemberJoin(vec![MemberEvent {
                name: name.clone(),
                status: MemberStatus::Alive,
                tags: Default::default(),
            }])
        };

        tx.send(join()).unwrap();
        let first = out_rx.recv().await.unwrap();
        assert_eq!(first.len(), 1);

        // An identical join arriving in a later window should not be
        // re-delivered.
        tx.send(join()).unwrap();
        tokio::time::advance(Duration::from_millis(40)).await;
        assert!(out_rx.try_recv().is_err());

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn non_coalescing_user_event_bypasses_the_window_immediately() {
        let policy = CoalescePolicy {
            quiescent_period: Duration::from_secs(5),
            quiescent_max_timeout: Duration::from_secs(10),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(policy, rx, out_tx));

        tx.send(Event::User {
            ltime: 1,
            name: "deploy".to_string(),
            payload: b"foo".to_vec(),
            coalesce: false,
        })
        .unwrap();

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(matches!(&batch[0], Event::User { coalesce: false, .. }));

        drop(tx);
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn coalescing_user_events_merge_per_name_last_write_wins() {
        let policy = CoalescePolicy {
            quiescent_period: Duration::from_millis(50),
            quiescent_max_timeout: Duration::from_secs(5),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(policy, rx, out_tx));

        tx.send(Event::User {
            ltime: 1,
            name: "deploy".to_string(),
            payload: b"v1".to_vec(),
            coalesce: true,
        })
        .unwrap();
        tx.send(Event::User {
            ltime: 2,
            name: "deploy".to_string(),
            payload: b"v2".to_vec(),
            coalesce: true,
        })
        .unwrap();

        let batch = out_rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        match &batch[0] {
            Event::User { payload, .. } => assert_eq!(payload, b"v2"),
            other => panic!("expected a single User event, got {other:?}"),
        }

        drop(tx);
        handle.await.unwrap();
    }
}
