//! vmingest-observe: vendor-neutral observability ABI.
//!
//! Core crates depend only on these traits and event types. Backends live elsewhere.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: VizEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: VizEvent) {}
}

/// In-memory meter that keeps the latest value of every series.
///
/// Series are keyed the way Prometheus prints them, e.g.
/// `vm_protoparser_rows_read_total{type="native"}`. Histograms only keep
/// the number of observations. Mostly useful in tests and in the replay tool,
/// which dumps the collected series on exit.
#[derive(Clone, Default)]
pub struct RecordingMeter {
    series: Arc<Mutex<HashMap<String, i64>>>,
    events: Arc<Mutex<Vec<VizEvent>>>,
}

impl RecordingMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a series, or 0 if it was never touched.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = series_key(name, labels);
        self.series.lock().get(&key).copied().unwrap_or(0)
    }

    /// All series sorted by key.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let mut out: Vec<_> = self
            .series
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort();
        out
    }

    pub fn events(&self) -> Vec<VizEvent> {
        self.events.lock().clone()
    }
}

fn series_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let labels: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, v))
        .collect();
    format!("{}{{{}}}", name, labels.join(","))
}

struct RecordingSeries {
    series: Arc<Mutex<HashMap<String, i64>>>,
    key: String,
}

impl Counter for RecordingSeries {
    fn inc(&self, v: u64) {
        *self.series.lock().entry(self.key.clone()).or_insert(0) += v as i64;
    }
}
impl Gauge for RecordingSeries {
    fn set(&self, v: i64) {
        self.series.lock().insert(self.key.clone(), v);
    }
}
impl Histogram for RecordingSeries {
    fn observe(&self, _v: f64) {
        *self.series.lock().entry(self.key.clone()).or_insert(0) += 1;
    }
}

impl RecordingMeter {
    fn series(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> RecordingSeries {
        RecordingSeries {
            series: self.series.clone(),
            key: series_key(name, labels),
        }
    }
}

impl Meter for RecordingMeter {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(self.series(name, labels))
    }
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(self.series(name, labels))
    }
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(self.series(name, labels))
    }
    fn emit(&self, evt: VizEvent) {
        self.events.lock().push(evt);
    }
}

/// Typed events for live visualization (metric names and samples never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum VizEvent {
    Ingest(IngestEvt),
    Pace(PaceEvt),
}

#[derive(Clone, Debug)]
pub struct IngestEvt {
    pub protocol: &'static str,
    pub kind: IngestKind,
}
#[derive(Clone, Debug)]
pub enum IngestKind {
    /// Stream consumed up to a clean EOF; `failed` is set when a block
    /// could not be decoded or was rejected by the callback.
    Finished {
        blocks: u64,
        rows: u64,
        failed: bool,
    },
    /// Framing error; the rest of the stream was dropped.
    Aborted { blocks: u64 },
    /// Reader gave up waiting for a read-concurrency slot.
    ConcurrencyTimeout { waited_ms: u64 },
}

#[derive(Clone, Debug)]
pub struct PaceEvt {
    pub role: &'static str,
    pub delays_total: u64,
}

/// Adds `$v` to the counter `$name{$labels}`.
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
/// Sets the gauge `$name{$labels}` to `$v`.
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
