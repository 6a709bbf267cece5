//! Metrics collection and aggregation
//!
//! Periodically reads the histogram, the pending backlog and the probe
//! health counters from a [`HistogramSource`] and turns them into
//! interval and cumulative reports. The collector only reads; it never
//! touches correlation state beyond asking the source to purge stale
//! entries.

use crate::{
    histogram::HistogramSnapshot,
    tracker::HandshakeTracker,
    types::*,
};
use anyhow::Result;
use log::{debug, warn};
use std::{sync::Arc, time::Duration};

/// Read-only view of a running correlation engine
pub trait HistogramSource {
    /// Current histogram counters
    fn histogram(&mut self) -> Result<HistogramSnapshot>;

    /// Number of connections waiting for ESTABLISHED
    fn pending_len(&mut self) -> Result<usize>;

    /// Probe health counters
    fn stats(&mut self) -> Result<StatsSnapshot>;

    /// Reclaim pending entries older than `ttl`
    ///
    /// The default does nothing, for sources that evict on their own.
    fn purge_stale(&mut self, _ttl: Duration) -> Result<usize> {
        Ok(0)
    }

    /// Label used in reports
    fn name(&self) -> &'static str;
}

/// [`HistogramSource`] over the in-process tracker
pub struct TrackerSource {
    tracker: Arc<HandshakeTracker>,
}

impl TrackerSource {
    pub fn new(tracker: Arc<HandshakeTracker>) -> Self {
        Self { tracker }
    }
}

impl HistogramSource for TrackerSource {
    fn histogram(&mut self) -> Result<HistogramSnapshot> {
        Ok(self.tracker.histogram())
    }

    fn pending_len(&mut self) -> Result<usize> {
        Ok(self.tracker.pending_len())
    }

    fn stats(&mut self) -> Result<StatsSnapshot> {
        Ok(self.tracker.stats())
    }

    fn purge_stale(&mut self, ttl: Duration) -> Result<usize> {
        let ttl_ns = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
        Ok(self.tracker.purge_stale(ttl_ns))
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}

/// One tick of the collector loop
#[derive(Debug, Clone)]
pub struct IntervalReport {
    /// Handshakes measured since the previous tick
    pub interval: HistogramSnapshot,
    /// Handshakes measured since start
    pub cumulative: HistogramSnapshot,
    /// Pending backlog after purging
    pub pending: usize,
    /// Entries purged this tick
    pub purged: usize,
    /// Health counters
    pub stats: StatsSnapshot,
}

/// Samples a source and keeps the previous snapshot for interval deltas
pub struct MetricsCollector {
    previous: HistogramSnapshot,
    pending_ttl: Duration,
    pending_warn: usize,
    ticks: u64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    ///
    /// # Arguments
    ///
    /// * `pending_ttl` - Age after which pending entries are purged
    /// * `pending_warn` - Backlog size that triggers a warning
    pub fn new(pending_ttl: Duration, pending_warn: usize) -> Self {
        Self {
            previous: HistogramSnapshot::default(),
            pending_ttl,
            pending_warn,
            ticks: 0,
        }
    }

    /// Read the source once
    pub fn sample<S: HistogramSource + ?Sized>(&mut self, source: &mut S) -> Result<IntervalReport> {
        let purged = source.purge_stale(self.pending_ttl)?;
        if purged > 0 {
            debug!("Purged {} stale pending connections", purged);
        }

        let cumulative = source.histogram()?;
        let pending = source.pending_len()?;
        let stats = source.stats()?;

        if pending > self.pending_warn {
            warn!(
                "Pending backlog at {} connections (threshold {}): handshakes are not completing or keys are not matching",
                pending, self.pending_warn
            );
        }

        let interval = cumulative.delta_since(&self.previous);
        self.previous = cumulative;
        self.ticks += 1;

        Ok(IntervalReport {
            interval,
            cumulative,
            pending,
            purged,
            stats,
        })
    }

    /// Number of samples taken so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Generate the final report
    ///
    /// # Arguments
    ///
    /// * `source` - Where the numbers were read from
    /// * `report` - The last interval report
    /// * `elapsed_secs` - Duration of the observation window in seconds
    pub fn generate_metrics(source: &str, report: &IntervalReport, elapsed_secs: u64) -> LatencyMetrics {
        LatencyMetrics {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            source: source.to_string(),
            total_handshakes: report.cumulative.total(),
            pending_connections: report.pending,
            histogram: bucket_reports(&report.cumulative),
            percentiles: Percentiles::from_snapshot(&report.cumulative),
            stats: report.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connlat_common::{constants::*, SockCommon};

    fn handshake(tracker: &HandshakeTracker, peer_port: u16, start: u64, latency_ns: u64) {
        let sk = SockCommon::v4([127, 0, 0, 1], 8080, [127, 0, 0, 1], peer_port);
        tracker.on_connection_pending(AF_INET, &sk, start);
        tracker.on_state_transition(&sk, TCP_ESTABLISHED, start + latency_ns);
    }

    #[test]
    fn test_interval_and_cumulative() {
        let tracker = Arc::new(HandshakeTracker::default());
        let mut source = TrackerSource::new(Arc::clone(&tracker));
        let mut collector = MetricsCollector::new(Duration::from_secs(30), 100);

        handshake(&tracker, 40000, 0, 500_000);
        let first = collector.sample(&mut source).unwrap();
        assert_eq!(first.interval.count(8), 1);
        assert_eq!(first.cumulative.total(), 1);

        handshake(&tracker, 40001, 1_000_000, 2_000);
        handshake(&tracker, 40002, 2_000_000, 2_000);
        let second = collector.sample(&mut source).unwrap();
        assert_eq!(second.interval.total(), 2);
        assert_eq!(second.interval.count(1), 2);
        assert_eq!(second.cumulative.total(), 3);
        assert_eq!(second.stats.recorded, 3);
        assert_eq!(collector.ticks(), 2);
    }

    #[test]
    fn test_sample_purges_stale_pending() {
        let tracker = Arc::new(HandshakeTracker::default());
        let mut source = TrackerSource::new(Arc::clone(&tracker));
        let mut collector = MetricsCollector::new(Duration::from_secs(1), 100);

        let never_completes = SockCommon::v4([127, 0, 0, 1], 8080, [127, 0, 0, 2], 1234);
        tracker.on_connection_pending(AF_INET, &never_completes, 0);
        handshake(&tracker, 40000, 5_000_000_000, 1_000);

        let report = collector.sample(&mut source).unwrap();
        assert_eq!(report.purged, 1);
        assert_eq!(report.pending, 0);
    }

    #[test]
    fn test_generate_metrics() {
        let tracker = Arc::new(HandshakeTracker::default());
        let mut source = TrackerSource::new(Arc::clone(&tracker));
        let mut collector = MetricsCollector::new(Duration::from_secs(30), 100);

        for i in 0..10u16 {
            handshake(&tracker, 40000 + i, i as u64 * 1_000_000, 500_000);
        }
        let report = collector.sample(&mut source).unwrap();
        let metrics = MetricsCollector::generate_metrics(source.name(), &report, 5);

        assert_eq!(metrics.source, "replay");
        assert_eq!(metrics.total_handshakes, 10);
        assert_eq!(metrics.pending_connections, 0);
        assert_eq!(metrics.histogram[8].count, 10);
        assert_eq!(metrics.percentiles.p50, Some(512));
        assert_eq!(metrics.stats.recorded, 10);
    }
}
