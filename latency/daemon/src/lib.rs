//! connlat userspace library
//!
//! Provides the eBPF loader, the in-process handshake correlation engine
//! and the collection/export pipeline shared by both.

pub mod collector;
pub mod events;
pub mod exporter;
pub mod histogram;
pub mod loader;
pub mod pending;
pub mod tracker;
pub mod types;

pub use collector::{HistogramSource, MetricsCollector, TrackerSource};
pub use events::{EventProcessor, ProbeEvent};
pub use exporter::{ExporterType, MetricsExporter};
pub use histogram::{HistogramSnapshot, LatencyHistogram};
pub use loader::{KernelMaps, ProbeLoader};
pub use pending::PendingTable;
pub use tracker::{CompletionOutcome, HandshakeTracker, PendingOutcome};
pub use types::*;
