//! Query request/response tracking (spec §4.8): originates queries carrying
//! a relay factor and a timeout derived from `query_timeout_mult`, collects
//! streamed responses, and dedupes already-seen query IDs with an LRU so a
//! relayed duplicate isn't answered (or delivered) twice.

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::codec::message::{QueryFilter, QueryResponse};
use crate::common::{anchored_match, Name};

/// Tracks which query IDs this node has already acted on.
pub struct QueryDedup {
    seen: Mutex<LruCache<u32, ()>>,
}

impl QueryDedup {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).expect("capacity > 0"),
            )),
        }
    }

    /// Returns true the first time `id` is seen; false on any later call.
    pub fn witness(&self, id: u32) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(&id) {
            false
        } else {
            seen.put(id, ());
            true
        }
    }
}

/// Allocates outbound query IDs. A plain counter; the Lamport query clock is
/// carried separately in `Query::ltime`.
#[derive(Default)]
pub struct QueryIdGen(AtomicU32);

impl QueryIdGen {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

/// Bookkeeping for a query this node originated: where to deliver streamed
/// responses, and whether plain acks (not just payload responses) were
/// requested. Responses are deduped strictly on `from` — a relayed duplicate
/// of a response we already delivered for that node is dropped, first
/// arrival wins (SPEC_FULL.md open-question decision #3).
pub struct PendingQuery {
    tx: mpsc::UnboundedSender<QueryResponse>,
    acks_expected: bool,
    seen_from: Mutex<HashSet<Name>>,
}

impl PendingQuery {
    /// Delivers `resp` unless a response from the same `from` has already
    /// been delivered for this query.
    pub fn deliver(&self, resp: QueryResponse) {
        if !self.seen_from.lock().insert(resp.from.clone()) {
            return;
        }
        let _ = self.tx.send(resp);
    }

    pub fn wants_acks(&self) -> bool {
        self.acks_expected
    }
}

pub fn new_pending(request_ack: bool) -> (PendingQuery, mpsc::UnboundedReceiver<QueryResponse>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        PendingQuery {
            tx,
            acks_expected: request_ack,
            seen_from: Mutex::new(HashSet::new()),
        },
        rx,
    )
}

/// Evaluates whether `filter` matches this node (spec §4.8): an empty filter
/// always matches; otherwise every populated clause (names, tags) must hold.
/// Node names and tag values are anchored regexes, not literal strings.
pub fn matches_filter(
    filter: &QueryFilter,
    local: &Name,
    tags: &std::collections::HashMap<String, String>,
) -> bool {
    let name_ok = filter.node_names.is_empty()
        || filter
            .node_names
            .iter()
            .any(|n| anchored_match(n, local.as_str()));
    let tags_ok = filter.tags.is_empty()
        || filter.tags.iter().all(|(k, v)| {
            tags.get(k)
                .map(|actual| anchored_match(v, actual))
                .unwrap_or(false)
        });
    name_ok && tags_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_only_accepts_id_once() {
        let dedup = QueryDedup::new(16);
        assert!(dedup.witness(1));
        assert!(!dedup.witness(1));
        assert!(dedup.witness(2));
    }

    #[test]
    fn empty_filter_matches_everyone() {
        let filter = QueryFilter {
            node_names: vec![],
            tags: vec![],
        };
        let name = Name::new("a").unwrap();
        assert!(matches_filter(&filter, &name, &Default::default()));
    }

    #[test]
    fn tag_filter_requires_all_clauses() {
        let filter = QueryFilter {
            node_names: vec![],
            tags: vec![("role".into(), "web".into())],
        };
        let name = Name::new("a").unwrap();
        let mut tags = std::collections::HashMap::new();
        assert!(!matches_filter(&filter, &name, &tags));
        tags.insert("role".to_string(), "web".to_string());
        assert!(matches_filter(&filter, &name, &tags));
    }

    #[test]
    fn pending_query_drops_duplicate_response_from_same_node() {
        let (pending, mut rx) = new_pending(false);
        let from = Name::new("n1").unwrap();
        pending.deliver(QueryResponse {
            ltime: 1,
            id: 7,
            from: from.clone(),
            payload: b"first".to_vec(),
            ack: false,
        });
        pending.deliver(QueryResponse {
            ltime: 1,
            id: 7,
            from,
            payload: b"relayed-duplicate".to_vec(),
            ack: false,
        });
        let got = rx.try_recv().unwrap();
        assert_eq!(got.payload, b"first");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn name_filter_excludes_non_matching_node() {
        let filter = QueryFilter {
            node_names: vec!["other".into()],
            tags: vec![],
        };
        let name = Name::new("a").unwrap();
        assert!(!matches_filter(&filter, &name, &Default::default()));
    }

    #[test]
    fn name_filter_is_an_anchored_regex() {
        let filter = QueryFilter {
            node_names: vec!["web-.*".into()],
            tags: vec![],
        };
        let matching = Name::new("web-01").unwrap();
        let non_matching = Name::new("not-web-01").unwrap();
        assert!(matches_filter(&filter, &matching, &Default::default()));
        assert!(!matches_filter(&filter, &non_matching, &Default::default()));
    }
}
