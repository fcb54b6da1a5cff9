//! Log-line fan-out for the control protocol's `monitor` command (spec
//! §4.10). A [`tracing_subscriber::Layer`] formats each event onto a single
//! line and publishes it on a broadcast channel; [`global`] hands out clones
//! of the one process-wide feed so the hosting binary's subscriber and every
//! `monitor` connection see the same stream, the way `tracing`'s own global
//! default subscriber is process-wide.
//!
//! Lines published while nobody is subscribed are simply dropped — a
//! `monitor` client only ever sees log lines emitted after it connects.

use std::fmt::{self, Write as _};
use std::sync::LazyLock;

use tokio::sync::broadcast;
use tracing::field::{Field, Visit};
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const CHANNEL_CAPACITY: usize = 1024;

static FEED: LazyLock<LogFeed> = LazyLock::new(LogFeed::new);

/// Returns a handle onto the one process-wide log feed.
pub fn global() -> LogFeed {
    FEED.clone()
}

/// A cloneable handle onto the broadcast channel carrying formatted log
/// lines. Cloning is cheap; every clone publishes to and subscribes from the
/// same underlying channel.
#[derive(Clone)]
pub struct LogFeed {
    tx: broadcast::Sender<String>,
}

impl LogFeed {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Builds a [`tracing_subscriber::Layer`] that publishes every event it
    /// sees onto this feed. Composed with whatever formatting layer the
    /// hosting binary already installs.
    pub fn layer<S>(&self) -> BroadcastLayer<S> {
        BroadcastLayer {
            tx: self.tx.clone(),
            _subscriber: std::marker::PhantomData,
        }
    }
}

pub struct BroadcastLayer<S> {
    tx: broadcast::Sender<String>,
    _subscriber: std::marker::PhantomData<fn(S)>,
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={value:?}", field.name());
        }
    }
}

impl<S: Subscriber> Layer<S> for BroadcastLayer<S> {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        // No receivers yet (no `monitor` client connected): skip the
        // formatting work entirely.
        if self.tx.receiver_count() == 0 {
            return;
        }
        let meta = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let line = format!(
            "{level} {target}: {message}{fields}",
            level = meta.level(),
            target = meta.target(),
            message = visitor.message,
            fields = visitor.fields,
        );
        let _ = self.tx.send(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_receives_published_line() {
        let feed = LogFeed::new();
        let mut rx = feed.subscribe();
        feed.tx.send("hello".to_string()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "hello");
    }

    #[test]
    fn line_with_no_subscribers_is_dropped_silently() {
        let feed = LogFeed::new();
        assert!(feed.tx.send("nobody listening".to_string()).is_err());
    }
}
