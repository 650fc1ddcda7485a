//! kombu-observe: vendor-neutral observability ABI.
//!
//! Core crates depend only on these traits and event types; concrete metric
//! backends (Prometheus, logging, ...) live outside the storage crates.

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}

pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}

pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

/// Metric and event sink handed to every component that reports telemetry.
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

    fn histogram(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;

    /// Emit a typed event for live visualization.
    fn emit(&self, evt: VizEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;

struct Noop;
impl Counter for Noop {
    fn inc(&self, _v: u64) {}
}
impl Gauge for Noop {
    fn set(&self, _v: i64) {}
}
impl Histogram for Noop {
    fn observe(&self, _v: f64) {}
}

impl Meter for NoopMeter {
    fn counter(
        &self,
        _name: &'static str,
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(Noop)
    }

    fn gauge(
        &self,
        _name: &'static str,
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(Noop)
    }

    fn histogram(
        &self,
        _name: &'static str,
        _labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(Noop)
    }

    fn emit(&self, _evt: VizEvent) {}
}

/// Typed events for live visualization (keys and values are never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum VizEvent {
    Engine(EngineEvt),
    Journal(JournalEvt),
    Partition(PartitionEvt),
}

#[derive(Clone, Debug)]
pub struct EngineEvt {
    pub partition: u32,
    pub kind: EngineKind,
}

#[derive(Clone, Debug)]
pub enum EngineKind {
    Evicted { bytes: u64 },
    Expired,
    Cleared { entries: u64 },
    OverCapacity { used: u64, budget: u64 },
}

#[derive(Clone, Debug)]
pub struct JournalEvt {
    pub partition: u32,
    pub seq: u64,
    pub kind: JournalKind,
}

#[derive(Clone, Debug)]
pub enum JournalKind {
    FileRoll { bytes: u64 },
    Fsync { ms: u32 },
    TailTruncated,
    ArchiverFailed,
}

#[derive(Clone, Debug)]
pub struct PartitionEvt {
    pub partition: u32,
    pub kind: PartitionKind,
}

#[derive(Clone, Debug)]
pub enum PartitionKind {
    Activated { replayed: u64 },
    Deactivated,
    ReadRepair,
    ReplicaDropped,
}
