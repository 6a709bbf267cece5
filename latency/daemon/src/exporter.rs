//! Metrics exporters
//!
//! Provides different exporters for the final report (JSON, Prometheus, InfluxDB)

use crate::types::LatencyMetrics;
use anyhow::{Context, Result};
use std::{
    fmt::Write as _,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Trait for metrics exporters
pub trait MetricsExporter {
    /// Export metrics
    ///
    /// # Arguments
    ///
    /// * `metrics` - Aggregated metrics to export
    fn export(&self, metrics: &LatencyMetrics) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus format
    Prometheus,
    /// InfluxDB line protocol
    Influx,
}

impl FromStr for ExporterType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExporterType::Json),
            "prometheus" | "prom" => Ok(ExporterType::Prometheus),
            "influx" | "influxdb" => Ok(ExporterType::Influx),
            _ => anyhow::bail!("Unsupported format: {}. Use json, prometheus, or influx", s),
        }
    }
}

impl ExporterType {
    /// Build the exporter for this format writing to `output_path`
    pub fn exporter(self, output_path: PathBuf) -> Box<dyn MetricsExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
            ExporterType::Influx => Box::new(InfluxExporter::new(output_path, "connlat".to_string())),
        }
    }
}

fn write_output(path: &Path, data: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(data.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, metrics: &LatencyMetrics) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(metrics)?
        } else {
            serde_json::to_string(metrics)?
        };

        write_output(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Convert metrics to Prometheus text format
    ///
    /// The log2 slots become a histogram with cumulative `le` buckets.
    /// Latencies are whole microseconds, so a slot ending before `high`
    /// is exactly `le="high - 1"`.
    fn to_prometheus_format(metrics: &LatencyMetrics) -> String {
        let mut output = String::new();

        output.push_str("# HELP connlat_handshake_latency_microseconds TCP handshake latency (request socket to ESTABLISHED)\n");
        output.push_str("# TYPE connlat_handshake_latency_microseconds histogram\n");
        let mut cumulative = 0u64;
        for bucket in &metrics.histogram {
            cumulative += bucket.count;
            if let Some(high) = bucket.high_us {
                let _ = writeln!(
                    output,
                    "connlat_handshake_latency_microseconds_bucket{{le=\"{}\"}} {}",
                    high - 1,
                    cumulative
                );
            }
        }
        let _ = writeln!(
            output,
            "connlat_handshake_latency_microseconds_bucket{{le=\"+Inf\"}} {}",
            cumulative
        );
        let _ = writeln!(
            output,
            "connlat_handshake_latency_microseconds_sum {}",
            metrics.stats.latency_sum_us
        );
        let _ = writeln!(
            output,
            "connlat_handshake_latency_microseconds_count {}",
            metrics.total_handshakes
        );
        output.push('\n');

        output.push_str("# HELP connlat_pending_connections Half-open connections awaiting ESTABLISHED\n");
        output.push_str("# TYPE connlat_pending_connections gauge\n");
        let _ = writeln!(output, "connlat_pending_connections {}", metrics.pending_connections);
        output.push('\n');

        output.push_str("# HELP connlat_duration_seconds Duration of collection period\n");
        output.push_str("# TYPE connlat_duration_seconds gauge\n");
        let _ = writeln!(output, "connlat_duration_seconds {}", metrics.duration_seconds);
        output.push('\n');

        let stats = &metrics.stats;
        output.push_str("# HELP connlat_probe_events_total Probe health counters\n");
        output.push_str("# TYPE connlat_probe_events_total counter\n");
        for (name, value) in [
            ("pending_inserted", stats.pending_inserted),
            ("pending_rejected", stats.pending_rejected),
            ("unsupported_family", stats.unsupported_family),
            ("established", stats.established),
            ("miss", stats.misses),
            ("clock_skew", stats.clock_skew),
            ("recorded", stats.recorded),
        ] {
            let _ = writeln!(output, "connlat_probe_events_total{{event=\"{}\"}} {}", name, value);
        }
        output.push('\n');

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, metrics: &LatencyMetrics) -> Result<()> {
        write_output(&self.output_path, &Self::to_prometheus_format(metrics))
    }
}

/// InfluxDB line protocol exporter
pub struct InfluxExporter {
    output_path: PathBuf,
    measurement: String,
}

impl InfluxExporter {
    /// Create a new InfluxDB exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `measurement` - Measurement name for InfluxDB
    pub fn new(output_path: PathBuf, measurement: String) -> Self {
        Self {
            output_path,
            measurement,
        }
    }

    /// Convert metrics to InfluxDB line protocol
    fn to_influx_format(metrics: &LatencyMetrics, measurement: &str) -> String {
        let mut output = String::new();
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);

        // Global metrics
        let _ = writeln!(
            output,
            "{},type=summary handshakes={}i,pending={}i,duration_seconds={}i {}",
            measurement,
            metrics.total_handshakes,
            metrics.pending_connections,
            metrics.duration_seconds,
            timestamp
        );

        // Percentiles, omitted when there is no data
        let p = &metrics.percentiles;
        let fields: Vec<String> = [("p50", p.p50), ("p90", p.p90), ("p99", p.p99), ("p999", p.p999)]
            .iter()
            .filter_map(|(name, v)| v.map(|v| format!("{}={}i", name, v)))
            .collect();
        if !fields.is_empty() {
            let _ = writeln!(
                output,
                "{},type=percentiles {} {}",
                measurement,
                fields.join(","),
                timestamp
            );
        }

        // Histogram, one point per non-empty slot
        for bucket in metrics.histogram.iter().filter(|b| b.count > 0) {
            let _ = writeln!(
                output,
                "{},type=histogram,slot={} low_us={}i,count={}i {}",
                measurement, bucket.slot, bucket.low_us, bucket.count, timestamp
            );
        }

        output
    }
}

impl MetricsExporter for InfluxExporter {
    fn export(&self, metrics: &LatencyMetrics) -> Result<()> {
        write_output(&self.output_path, &Self::to_influx_format(metrics, &self.measurement))
    }
}
