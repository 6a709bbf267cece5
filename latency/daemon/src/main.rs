//! connlat - Userspace Program
//!
//! Loads the eBPF handshake latency program, attaches kprobes, periodically
//! prints the log2 latency histogram and exports a final report.
//!
//! ## Usage
//!
//! ```bash
//! # Print every 5 seconds until interrupted
//! sudo ./connlat --ebpf-object path/to/connlat.o
//!
//! # Twelve 10-second intervals, then write a Prometheus report
//! sudo ./connlat --interval 10 --count 12 --format prometheus --output connlat.prom
//!
//! # Run a recorded event trace through the userspace engine
//! ./connlat --replay trace.jsonl --output report.json
//! ```

use anyhow::Result;
use clap::Parser;
use connlat::{
    collector::{HistogramSource, IntervalReport, MetricsCollector, TrackerSource},
    events::EventProcessor,
    exporter::ExporterType,
    loader::ProbeLoader,
    tracker::HandshakeTracker,
    types::{render_log2_hist, render_summary, LatencyMetrics},
};
use log::info;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    signal,
    time::{interval, Instant, MissedTickBehavior},
};

/// TCP handshake latency histogram using eBPF
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Seconds between histogram printouts
    #[clap(short, long, default_value_t = 5)]
    interval: u64,

    /// Number of intervals to run (0 = until interrupted)
    #[clap(short, long, default_value_t = 0)]
    count: u64,

    /// Output file for the final report
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Report format (json, prometheus, influx)
    #[clap(short, long, default_value = "json")]
    format: String,

    /// Path to eBPF object file (if not embedded)
    #[clap(long)]
    ebpf_object: Option<PathBuf>,

    /// Replay a JSON-lines event file through the userspace engine
    #[clap(long)]
    replay: Option<PathBuf>,

    /// Pending-table capacity for replay mode
    #[clap(long, default_value_t = connlat_common::MAX_PENDING as usize)]
    capacity: usize,

    /// Seconds after which an unmatched pending entry is purged (replay mode)
    #[clap(long, default_value_t = 30)]
    pending_ttl: u64,

    /// Warn when this many connections are pending
    #[clap(long, default_value_t = 4096)]
    pending_warn: usize,

    /// Verbose logging
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    if args.interval == 0 {
        anyhow::bail!("Interval must be >= 1 second");
    }
    if args.capacity == 0 {
        anyhow::bail!("Capacity must be >= 1");
    }
    let export_format: ExporterType = args.format.parse()?;

    let mut collector = MetricsCollector::new(Duration::from_secs(args.pending_ttl), args.pending_warn);
    let start_time = Instant::now();

    let (source_name, last) = if let Some(path) = &args.replay {
        let tracker = Arc::new(HandshakeTracker::new(args.capacity));
        info!("Pending capacity: {} connections", tracker.capacity());
        let processor = EventProcessor::new(Arc::clone(&tracker));
        processor.replay_file(path).await?;

        let mut source = TrackerSource::new(tracker);
        let report = collector.sample(&mut source)?;
        print_report(&report);
        (source.name(), report)
    } else {
        info!("Starting connlat...");
        info!("   Interval: {} seconds", args.interval);
        info!(
            "   Count: {}",
            if args.count == 0 {
                "infinite".to_string()
            } else {
                args.count.to_string()
            }
        );

        // Load eBPF program
        let mut loader = ProbeLoader::load(args.ebpf_object.clone())?;

        // Forward kernel-side log records
        loader.init_logger();

        // Attach kprobes
        loader.attach_kprobes()?;

        let mut source = loader.kernel_maps()?;
        info!("Tracing TCP handshakes... Hit Ctrl-C to end.");

        let report = run_collector(&mut collector, &mut source, &args).await?;
        (source.name(), report)
    };

    let elapsed = start_time.elapsed().as_secs();
    let metrics = MetricsCollector::generate_metrics(source_name, &last, elapsed);

    if let Some(output) = &args.output {
        export_format.exporter(output.clone()).export(&metrics)?;
        info!("Report written to {:?}", output);
    }

    print_summary(&metrics);

    Ok(())
}

/// Sample `source` every interval until the count is reached or Ctrl-C
async fn run_collector<S: HistogramSource>(
    collector: &mut MetricsCollector,
    source: &mut S,
    args: &Args,
) -> Result<IntervalReport> {
    let mut ticker = interval(Duration::from_secs(args.interval));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let report = collector.sample(source)?;
                print_report(&report);
                if args.count != 0 && collector.ticks() >= args.count {
                    info!("Count reached, shutting down...");
                    return Ok(report);
                }
            }
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down...");
                return collector.sample(source);
            }
        }
    }
}

fn print_report(report: &IntervalReport) {
    println!();
    println!(
        "{}  handshakes: {}  pending: {}",
        chrono::Local::now().format("%H:%M:%S"),
        report.interval.total(),
        report.pending
    );
    print!("{}", render_log2_hist(&report.interval, "usecs"));
}

fn print_summary(metrics: &LatencyMetrics) {
    info!("");
    for line in render_summary(metrics).lines() {
        info!("{}", line);
    }
}
