// Metrics surface. The core never links a concrete sink (no Prometheus, no
// StatsD) — it only emits named counters/gauges/samples through this trait,
// the way the teacher's subsystems call into `monitoring::metrics` without
// depending on any particular exporter. `NoopSink` is the default; hosting
// code can implement `Sink` and wire it in alongside `EventHandler`s.

use std::sync::Arc;

pub trait Sink: Send + Sync {
    fn incr_counter(&self, name: &str, value: u64);
    fn set_gauge(&self, name: &str, value: f64);
    fn observe(&self, name: &str, value: f64);
}

#[derive(Default)]
pub struct NoopSink;

impl Sink for NoopSink {
    fn incr_counter(&self, _name: &str, _value: u64) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
    fn observe(&self, _name: &str, _value: f64) {}
}

pub type SharedSink = Arc<dyn Sink>;

pub fn noop() -> SharedSink {
    Arc::new(NoopSink)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use dashmap::DashMap;

    #[derive(Default)]
    pub struct RecordingSink {
        pub counters: DashMap<String, u64>,
        pub gauges: DashMap<String, f64>,
    }

    impl Sink for RecordingSink {
        fn incr_counter(&self, name: &str, value: u64) {
            *self.counters.entry(name.to_string()).or_insert(0) += value;
        }
        fn set_gauge(&self, name: &str, value: f64) {
            self.gauges.insert(name.to_string(), value);
        }
        fn observe(&self, _name: &str, _value: f64) {}
    }
}
