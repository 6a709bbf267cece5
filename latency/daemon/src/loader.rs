//! eBPF program loader
//!
//! Handles loading the eBPF program, attaching the handshake kprobes and
//! handing out read-only views of its maps.

use crate::{
    collector::HistogramSource,
    histogram::{HistogramSnapshot, SLOTS},
    types::{connection_key_to_string, ConnectionKey, StatsSnapshot},
};
use anyhow::{Context, Result};
use aya::{
    maps::{Array, HashMap, MapData},
    programs::KProbe,
    Ebpf,
};
use aya_log::EbpfLogger;
use connlat_common::constants::MAX_STATS;
use log::{info, trace, warn};
use std::path::PathBuf;

/// Kprobes to attach: (program name, kernel function)
const KPROBES: [(&str, &str); 3] = [
    ("inet_csk_reqsk_queue_hash_add", "inet_csk_reqsk_queue_hash_add"),
    ("inet6_csk_reqsk_queue_hash_add", "inet6_csk_reqsk_queue_hash_add"),
    ("tcp_set_state", "tcp_set_state"),
];

/// eBPF program loader and manager
pub struct ProbeLoader {
    ebpf: Ebpf,
}

impl ProbeLoader {
    /// Load eBPF program from file or embedded bytecode
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to eBPF object file. If None, uses embedded bytecode.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        info!("Loading eBPF program...");

        let ebpf = if let Some(obj_path) = path {
            info!("Loading eBPF object from: {:?}", obj_path);
            let data = std::fs::read(&obj_path)
                .with_context(|| format!("Failed to read eBPF object file: {:?}", obj_path))?;
            Ebpf::load(&data).context("Failed to load eBPF program")?
        } else {
            #[cfg(feature = "embedded")]
            {
                info!("Loading embedded eBPF program...");
                let data = include_bytes!(concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/../kernel/target/bpfel-unknown-none/release/connlat"
                ));
                Ebpf::load(data).context("Failed to load embedded eBPF program")?
            }
            #[cfg(not(feature = "embedded"))]
            {
                anyhow::bail!(
                    "No eBPF object file provided. Use --ebpf-object or compile with 'embedded' feature"
                );
            }
        };

        info!("eBPF program loaded successfully");

        Ok(Self { ebpf })
    }

    /// Forward kernel-side log records to the `log` facade
    ///
    /// Non-fatal if it fails (e.g. the object was built without logging).
    pub fn init_logger(&mut self) {
        if let Err(e) = EbpfLogger::init(&mut self.ebpf) {
            warn!("eBPF logger not initialized, kernel-side log records will be dropped: {}", e);
        }
    }

    /// Attach kprobes to kernel functions
    ///
    /// Attaches to:
    /// - inet_csk_reqsk_queue_hash_add (IPv4 request sockets)
    /// - inet6_csk_reqsk_queue_hash_add (IPv6 request sockets)
    /// - tcp_set_state (ESTABLISHED detection)
    pub fn attach_kprobes(&mut self) -> Result<()> {
        info!("Attaching kprobes for handshake tracking...");

        for (name, function) in KPROBES {
            let program: &mut KProbe = self
                .ebpf
                .program_mut(name)
                .with_context(|| format!("{} program not found in eBPF object", name))?
                .try_into()
                .with_context(|| format!("Failed to get {} as KProbe", name))?;
            program
                .load()
                .with_context(|| format!("Failed to load {}", name))?;
            program
                .attach(function, 0)
                .with_context(|| format!("Failed to attach {} kprobe", function))?;
            info!("  ✓ Attached to {}", function);
        }

        info!("All kprobes attached successfully");

        Ok(())
    }

    /// Take ownership of the maps the collector reads
    pub fn kernel_maps(&mut self) -> Result<KernelMaps> {
        let hist = self
            .ebpf
            .take_map("HIST")
            .context("HIST map not found in eBPF object")?;
        let start = self
            .ebpf
            .take_map("START")
            .context("START map not found in eBPF object")?;
        let stats = self
            .ebpf
            .take_map("STATS")
            .context("STATS map not found in eBPF object")?;

        Ok(KernelMaps {
            hist: Array::try_from(hist).context("Failed to create Array from HIST map")?,
            start: HashMap::try_from(start).context("Failed to create HashMap from START map")?,
            stats: Array::try_from(stats).context("Failed to create Array from STATS map")?,
        })
    }
}

/// Userspace handles on the kernel program's maps
pub struct KernelMaps {
    hist: Array<MapData, u64>,
    start: HashMap<MapData, ConnectionKey, u64>,
    stats: Array<MapData, u64>,
}

impl HistogramSource for KernelMaps {
    fn histogram(&mut self) -> Result<HistogramSnapshot> {
        let mut counts = [0u64; SLOTS];
        for (slot, count) in counts.iter_mut().enumerate() {
            *count = self
                .hist
                .get(&(slot as u32), 0)
                .with_context(|| format!("Failed to read HIST[{}]", slot))?;
        }
        Ok(HistogramSnapshot::from_counts(counts))
    }

    fn pending_len(&mut self) -> Result<usize> {
        // Keys can disappear while iterating; those are simply not counted
        let mut len = 0;
        for key in self.start.keys().flatten() {
            trace!("pending {}", connection_key_to_string(&key));
            len += 1;
        }
        Ok(len)
    }

    fn stats(&mut self) -> Result<StatsSnapshot> {
        let counters = (0..MAX_STATS)
            .map(|idx| {
                self.stats
                    .get(&idx, 0)
                    .with_context(|| format!("Failed to read STATS[{}]", idx))
            })
            .collect::<Result<Vec<u64>>>()?;
        Ok(StatsSnapshot::from_counters(&counters))
    }

    fn name(&self) -> &'static str {
        "kernel"
    }
}
