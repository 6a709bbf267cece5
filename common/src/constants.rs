//! Shared constants for the connlat probes
//!
//! These constants are used by both kernel and userspace programs
//! to ensure consistency in behavior and limits.

// ============================================================================
// BPF Map Sizes
// ============================================================================

/// Maximum number of half-open connections tracked at once
pub const MAX_PENDING: u32 = 8192;

/// Number of log2 latency slots in the histogram
pub const HIST_SLOTS: u32 = 24;

// ============================================================================
// Address Families (from linux/socket.h)
// ============================================================================

/// IPv4 address family
pub const AF_INET: u16 = 2;

/// IPv6 address family
pub const AF_INET6: u16 = 10;

// ============================================================================
// TCP States (from include/net/tcp_states.h)
// ============================================================================

/// The only transition the completion hook cares about
pub const TCP_ESTABLISHED: u8 = 1;

/// Sent SYN, waiting for SYN-ACK (client side)
pub const TCP_SYN_SENT: u8 = 2;

/// Received SYN (server side, request socket)
pub const TCP_SYN_RECV: u8 = 3;

/// Socket is closed
pub const TCP_CLOSE: u8 = 7;

// ============================================================================
// Statistics Counter Indices (for STATS map)
// ============================================================================

/// Entry events stored in the pending table
pub const STAT_PENDING_INSERTED: u32 = 0;

/// Entry events dropped (table full or map update failure)
pub const STAT_PENDING_REJECTED: u32 = 1;

/// Events whose address family could not be normalized
pub const STAT_UNSUPPORTED_FAMILY: u32 = 2;

/// Transitions to ESTABLISHED observed
pub const STAT_ESTABLISHED: u32 = 3;

/// Completions with no matching pending entry
pub const STAT_MISSES: u32 = 4;

/// Completions discarded because the clock went backwards
pub const STAT_CLOCK_SKEW: u32 = 5;

/// Latencies folded into the histogram
pub const STAT_RECORDED: u32 = 6;

/// Sum of recorded latencies in microseconds
pub const STAT_LATENCY_SUM_US: u32 = 7;

/// Total number of statistics counters
pub const MAX_STATS: u32 = 8;
