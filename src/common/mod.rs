// Shared types used across the membership and orchestration layers: node
// identity, Lamport time, and small validation helpers. Kept deliberately
// thin — most domain types live in the module that owns their invariants.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum length of a node [`Name`], per spec §3.
pub const MAX_NAME_LEN: usize = 128;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9.\-]+$").expect("valid regex"));

/// A cluster-unique node identifier: 1-128 chars of `[A-Za-z0-9.-]`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Name(String);

impl Name {
    pub fn new(s: impl Into<String>) -> crate::error::Result<Self> {
        let s = s.into();
        if s.is_empty() || s.len() > MAX_NAME_LEN || !NAME_PATTERN.is_match(&s) {
            return Err(crate::error::Error::InvalidName(s));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:?})", self.0)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Compiles `pattern` as a fully-anchored regex and reports whether it
/// matches `value`. Anchored on both ends per spec §4.8/§4.10's "anchored
/// regex on name/status/tags" filters, so e.g. `alive` doesn't match
/// `not-alive` as a substring. An invalid pattern never matches anything.
pub fn anchored_match(pattern: &str, value: &str) -> bool {
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// A Lamport logical clock: a monotonically increasing counter used to
/// totally order intents, user events, and queries across nodes.
///
/// Three independent instances run per node (member, event, query clocks),
/// per spec §4.5/§4.8.
#[derive(Debug, Default)]
pub struct LamportClock(std::sync::atomic::AtomicU64);

pub type LTime = u64;

impl LamportClock {
    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicU64::new(0))
    }

    /// Current time without advancing it.
    pub fn time(&self) -> LTime {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Advance and return the new local time, as when originating an event.
    pub fn increment(&self) -> LTime {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1
    }

    /// Witness a remote time: ensures subsequent `increment()` calls produce
    /// values strictly greater than any time seen so far.
    pub fn witness(&self, time: LTime) {
        self.0
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |cur| if time >= cur { Some(time) } else { None },
            )
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_rejects_bad_chars() {
        assert!(Name::new("node_1").is_err());
        assert!(Name::new("").is_err());
        assert!(Name::new("a".repeat(129)).is_err());
        assert!(Name::new("node-1.example").is_ok());
    }

    #[test]
    fn anchored_match_requires_full_match() {
        assert!(anchored_match("web-.*", "web-01"));
        assert!(!anchored_match("web-.*", "not-web-01"));
        assert!(!anchored_match("alive", "not-alive"));
        assert!(!anchored_match("(", "anything"));
    }

    #[test]
    fn lamport_witness_only_advances() {
        let clock = LamportClock::new();
        assert_eq!(clock.increment(), 1);
        clock.witness(10);
        assert_eq!(clock.increment(), 11);
        clock.witness(5);
        assert_eq!(clock.increment(), 12);
    }
}
