//! Inbound hook events and offline replay
//!
//! The kernel program consumes `ConnectionPending` and `StateTransition`
//! events directly from kprobes. This module gives the same two events a
//! JSON-lines encoding so a captured or synthetic trace can be driven
//! through the userspace [`HandshakeTracker`].
//!
//! ```text
//! {"kind":"pending","local_addr":"10.0.0.5","local_port":22,"peer_addr":"10.0.0.9","peer_port":51000,"ts_ns":1000000000}
//! {"kind":"state","local_addr":"10.0.0.5","local_port":22,"peer_addr":"10.0.0.9","peer_port":51000,"state":1,"ts_ns":1000500000}
//! ```

use crate::{
    tracker::{CompletionOutcome, HandshakeTracker, PendingOutcome},
    types::SockCommon,
};
use anyhow::{Context, Result};
use connlat_common::constants::{AF_INET, AF_INET6};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::Path,
    sync::Arc,
};
use tokio::{
    fs::File,
    io::{AsyncBufRead, AsyncBufReadExt, BufReader},
};

/// One hook firing
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeEvent {
    /// A request socket was queued (entry hook)
    Pending {
        /// Hook family; defaults to the family of `local_addr`
        #[serde(default)]
        family: Option<u16>,
        local_addr: IpAddr,
        local_port: u16,
        peer_addr: IpAddr,
        peer_port: u16,
        ts_ns: u64,
    },
    /// A socket changed state (completion hook)
    State {
        /// `skc_family`; defaults to the family of `local_addr`
        #[serde(default)]
        family: Option<u16>,
        local_addr: IpAddr,
        local_port: u16,
        peer_addr: IpAddr,
        peer_port: u16,
        state: u8,
        ts_ns: u64,
    },
}

fn widen(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(a) => a.to_ipv6_mapped(),
        IpAddr::V6(a) => a,
    }
}

fn narrow(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(a) => Some(a),
        IpAddr::V6(a) => a.to_ipv4_mapped(),
    }
}

/// Family implied by an address pair
///
/// Mixed IPv4/IPv6 pairs are IPv6, the way a dual-stack socket reports them.
fn implied_family(local: IpAddr, peer: IpAddr) -> u16 {
    match (local, peer) {
        (IpAddr::V4(_), IpAddr::V4(_)) => AF_INET,
        _ => AF_INET6,
    }
}

/// Raw socket view of an address pair as a `family` socket holds it
///
/// `None` when an address cannot be expressed in `family`, such as a
/// non-mapped IPv6 address on an IPv4 socket. Unknown families get the IPv6
/// fields filled and are left for normalization to reject.
fn sock_view(family: u16, local: IpAddr, local_port: u16, peer: IpAddr, peer_port: u16) -> Option<SockCommon> {
    let mut view = if family == AF_INET {
        SockCommon::v4(narrow(local)?.octets(), local_port, narrow(peer)?.octets(), peer_port)
    } else {
        SockCommon::v6(widen(local).octets(), local_port, widen(peer).octets(), peer_port)
    };
    view.skc_family = family;
    Some(view)
}

/// Totals for one replay run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Events parsed and dispatched
    pub events: u64,
    /// Handshakes recorded in the histogram
    pub recorded: u64,
    /// Lines that could not be parsed
    pub malformed: u64,
}

/// Feeds events into a shared tracker
pub struct EventProcessor {
    tracker: Arc<HandshakeTracker>,
}

/// Result of dispatching one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Pending(PendingOutcome),
    Completion(CompletionOutcome),
}

impl EventProcessor {
    /// Create a new event processor
    ///
    /// # Arguments
    ///
    /// * `tracker` - Shared handshake tracker
    pub fn new(tracker: Arc<HandshakeTracker>) -> Self {
        Self { tracker }
    }

    /// Run one event through the hook it stands for
    pub fn dispatch(&self, event: &ProbeEvent) -> Dispatched {
        match *event {
            ProbeEvent::Pending {
                family,
                local_addr,
                local_port,
                peer_addr,
                peer_port,
                ts_ns,
            } => {
                let hook_family = family.unwrap_or_else(|| implied_family(local_addr, peer_addr));
                match sock_view(hook_family, local_addr, local_port, peer_addr, peer_port) {
                    Some(req) => Dispatched::Pending(self.tracker.on_connection_pending(hook_family, &req, ts_ns)),
                    None => Dispatched::Pending(PendingOutcome::Unsupported),
                }
            }
            ProbeEvent::State {
                family,
                local_addr,
                local_port,
                peer_addr,
                peer_port,
                state,
                ts_ns,
            } => {
                let family = family.unwrap_or_else(|| implied_family(local_addr, peer_addr));
                match sock_view(family, local_addr, local_port, peer_addr, peer_port) {
                    Some(sk) => Dispatched::Completion(self.tracker.on_state_transition(&sk, state, ts_ns)),
                    None => Dispatched::Completion(CompletionOutcome::Unsupported),
                }
            }
        }
    }

    /// Replay JSON-lines events from `reader`
    ///
    /// Blank lines and lines starting with `#` are skipped. Malformed lines
    /// are logged and counted, they do not stop the replay.
    pub async fn replay<R: AsyncBufRead + Unpin>(&self, reader: R) -> Result<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        let mut lines = reader.lines();
        let mut line_no = 0u64;

        while let Some(line) = lines.next_line().await.context("Failed to read event stream")? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let event: ProbeEvent = match serde_json::from_str(line) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Skipping malformed event on line {}: {}", line_no, e);
                    summary.malformed += 1;
                    continue;
                }
            };

            summary.events += 1;
            match self.dispatch(&event) {
                Dispatched::Completion(CompletionOutcome::Recorded { slot, latency_us }) => {
                    debug!("line {}: handshake {}us -> slot {}", line_no, latency_us, slot);
                    summary.recorded += 1;
                }
                Dispatched::Pending(PendingOutcome::Unsupported)
                | Dispatched::Completion(CompletionOutcome::Unsupported) => {
                    warn!("line {}: addresses do not match the event's address family", line_no);
                }
                _ => {}
            }
        }

        Ok(summary)
    }

    /// Replay a JSON-lines event file
    pub async fn replay_file(&self, path: &Path) -> Result<ReplaySummary> {
        info!("Replaying events from {:?}", path);
        let file = File::open(path)
            .await
            .with_context(|| format!("Failed to open event file: {:?}", path))?;
        let summary = self.replay(BufReader::new(file)).await?;
        info!(
            "Replayed {} events, {} handshakes recorded, {} malformed lines",
            summary.events, summary.recorded, summary.malformed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connlat_common::constants::TCP_ESTABLISHED;

    const TRACE: &str = r#"
# passive open on 10.0.0.5:22
{"kind":"pending","local_addr":"10.0.0.5","local_port":22,"peer_addr":"10.0.0.9","peer_port":51000,"ts_ns":1000000000}
{"kind":"state","local_addr":"10.0.0.5","local_port":22,"peer_addr":"10.0.0.9","peer_port":51000,"state":3,"ts_ns":1000100000}
{"kind":"state","local_addr":"10.0.0.5","local_port":22,"peer_addr":"10.0.0.9","peer_port":51000,"state":1,"ts_ns":1000500000}
not json
{"kind":"state","local_addr":"10.0.0.5","local_port":22,"peer_addr":"10.0.0.9","peer_port":51001,"state":1,"ts_ns":1000600000}
"#;

    #[test]
    fn test_parse_event() {
        let line = r#"{"kind":"pending","local_addr":"::1","local_port":443,"peer_addr":"::1","peer_port":40000,"ts_ns":5}"#;
        let event: ProbeEvent = serde_json::from_str(line).unwrap();

        assert_eq!(
            event,
            ProbeEvent::Pending {
                family: None,
                local_addr: "::1".parse().unwrap(),
                local_port: 443,
                peer_addr: "::1".parse().unwrap(),
                peer_port: 40000,
                ts_ns: 5,
            }
        );
    }

    #[test]
    fn test_dual_stack_completion_matches_ipv4_entry() {
        let tracker = Arc::new(HandshakeTracker::default());
        let processor = EventProcessor::new(Arc::clone(&tracker));

        processor.dispatch(&ProbeEvent::Pending {
            family: None,
            local_addr: "192.168.1.10".parse().unwrap(),
            local_port: 8080,
            peer_addr: "192.168.1.20".parse().unwrap(),
            peer_port: 55555,
            ts_ns: 0,
        });
        let outcome = processor.dispatch(&ProbeEvent::State {
            family: None,
            local_addr: "::ffff:192.168.1.10".parse().unwrap(),
            local_port: 8080,
            peer_addr: "::ffff:192.168.1.20".parse().unwrap(),
            peer_port: 55555,
            state: TCP_ESTABLISHED,
            ts_ns: 10_000,
        });

        assert_eq!(
            outcome,
            Dispatched::Completion(CompletionOutcome::Recorded { slot: 3, latency_us: 10 })
        );
    }

    #[test]
    fn test_explicit_unsupported_family() {
        let tracker = Arc::new(HandshakeTracker::default());
        let processor = EventProcessor::new(Arc::clone(&tracker));

        let outcome = processor.dispatch(&ProbeEvent::Pending {
            family: Some(1),
            local_addr: "10.0.0.1".parse().unwrap(),
            local_port: 1,
            peer_addr: "10.0.0.2".parse().unwrap(),
            peer_port: 2,
            ts_ns: 0,
        });
        assert_eq!(outcome, Dispatched::Pending(PendingOutcome::Unsupported));
        assert_eq!(tracker.pending_len(), 0);
    }

    #[test]
    fn test_ipv4_hook_with_mapped_addresses() {
        let tracker = Arc::new(HandshakeTracker::default());
        let processor = EventProcessor::new(Arc::clone(&tracker));

        let pending = |local: &str| ProbeEvent::Pending {
            family: Some(AF_INET),
            local_addr: local.parse().unwrap(),
            local_port: 22,
            peer_addr: "::ffff:10.0.0.9".parse().unwrap(),
            peer_port: 51000,
            ts_ns: 0,
        };
        assert_eq!(
            processor.dispatch(&pending("::ffff:10.0.0.5")),
            Dispatched::Pending(PendingOutcome::Stored)
        );
        assert_eq!(
            processor.dispatch(&pending("::ffff:10.0.0.77")),
            Dispatched::Pending(PendingOutcome::Stored)
        );
        // Distinct addresses keep distinct keys
        assert_eq!(tracker.pending_len(), 2);

        let outcome = processor.dispatch(&ProbeEvent::State {
            family: None,
            local_addr: "10.0.0.5".parse().unwrap(),
            local_port: 22,
            peer_addr: "10.0.0.9".parse().unwrap(),
            peer_port: 51000,
            state: TCP_ESTABLISHED,
            ts_ns: 500_000,
        });
        assert_eq!(
            outcome,
            Dispatched::Completion(CompletionOutcome::Recorded { slot: 8, latency_us: 500 })
        );
        assert_eq!(tracker.pending_len(), 1);
    }

    #[test]
    fn test_ipv4_hook_rejects_native_ipv6_addresses() {
        let tracker = Arc::new(HandshakeTracker::default());
        let processor = EventProcessor::new(Arc::clone(&tracker));

        let outcome = processor.dispatch(&ProbeEvent::Pending {
            family: Some(AF_INET),
            local_addr: "10.0.0.5".parse().unwrap(),
            local_port: 22,
            peer_addr: "2001:db8::1".parse().unwrap(),
            peer_port: 51000,
            ts_ns: 0,
        });
        assert_eq!(outcome, Dispatched::Pending(PendingOutcome::Unsupported));
        assert_eq!(tracker.pending_len(), 0);

        let outcome = processor.dispatch(&ProbeEvent::State {
            family: Some(AF_INET),
            local_addr: "2001:db8::2".parse().unwrap(),
            local_port: 22,
            peer_addr: "2001:db8::1".parse().unwrap(),
            peer_port: 51000,
            state: TCP_ESTABLISHED,
            ts_ns: 10,
        });
        assert_eq!(outcome, Dispatched::Completion(CompletionOutcome::Unsupported));
    }

    #[tokio::test]
    async fn test_replay_mapped_ipv4_family() {
        const MAPPED: &str = r#"
{"kind":"pending","family":2,"local_addr":"::ffff:10.0.0.5","local_port":22,"peer_addr":"::ffff:10.0.0.9","peer_port":51000,"ts_ns":0}
{"kind":"pending","family":2,"local_addr":"::ffff:10.0.0.77","local_port":22,"peer_addr":"::ffff:10.0.0.9","peer_port":51000,"ts_ns":0}
{"kind":"state","local_addr":"10.0.0.5","local_port":22,"peer_addr":"10.0.0.9","peer_port":51000,"state":1,"ts_ns":2000}
"#;
        let tracker = Arc::new(HandshakeTracker::default());
        let processor = EventProcessor::new(Arc::clone(&tracker));

        let summary = processor.replay(MAPPED.as_bytes()).await.unwrap();

        assert_eq!(summary.recorded, 1);
        assert_eq!(tracker.histogram().count(1), 1);
        assert_eq!(tracker.pending_len(), 1);
        assert_eq!(tracker.stats().misses, 0);
    }

    #[tokio::test]
    async fn test_replay_trace() {
        let tracker = Arc::new(HandshakeTracker::default());
        let processor = EventProcessor::new(Arc::clone(&tracker));

        let summary = processor.replay(TRACE.as_bytes()).await.unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                events: 4,
                recorded: 1,
                malformed: 1,
            }
        );
        assert_eq!(tracker.histogram().count(8), 1);
        assert_eq!(tracker.pending_len(), 0);
        assert_eq!(tracker.stats().misses, 1);
    }
}
