//! Kprobe handlers for TCP handshake latency
//!
//! Two entry hooks record when a request socket is queued for a listener,
//! one completion hook measures the time until the socket reaches
//! ESTABLISHED and folds it into the histogram.

use aya_ebpf::{macros::kprobe, programs::ProbeContext};
use aya_log_ebpf::{debug, warn};
use connlat_common::{
    constants::*,
    hist::slot_for_interval,
    types::ConnectionKey,
};

use crate::{helpers::*, maps::START, socket_parser::*};

/// Track IPv4 half-open connections
///
/// Attached to: inet_csk_reqsk_queue_hash_add
#[kprobe]
pub fn inet_csk_reqsk_queue_hash_add(ctx: ProbeContext) -> u32 {
    match try_record_pending(&ctx, AF_INET) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

/// Track IPv6 half-open connections
///
/// Attached to: inet6_csk_reqsk_queue_hash_add
#[kprobe]
pub fn inet6_csk_reqsk_queue_hash_add(ctx: ProbeContext) -> u32 {
    match try_record_pending(&ctx, AF_INET6) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_record_pending(ctx: &ProbeContext, family: u16) -> Result<u32, i64> {
    // Request socket is the second argument
    let req = sock_arg(ctx, 1)?;
    let raw = read_sock_common(req)?;

    let key = match ConnectionKey::from_request(family, &raw) {
        Ok(k) => k,
        Err(_) => {
            increment_stat(STAT_UNSUPPORTED_FAMILY);
            return Ok(0);
        }
    };

    let ts = get_timestamp();

    // BPF_ANY: a retransmitted SYN refreshes the timestamp
    match START.insert(&key, &ts, 0) {
        Ok(()) => increment_stat(STAT_PENDING_INSERTED),
        Err(ret) => {
            increment_stat(STAT_PENDING_REJECTED);
            warn!(ctx, "failed to store pending connection: {}", ret);
        }
    }

    Ok(0)
}

/// Measure handshake completion
///
/// Attached to: tcp_set_state
///
/// Runs on every state change in the system, so the ESTABLISHED check
/// comes before any memory read.
#[kprobe]
pub fn tcp_set_state(ctx: ProbeContext) -> u32 {
    match try_tcp_set_state(&ctx) {
        Ok(ret) => ret,
        Err(_) => 1,
    }
}

fn try_tcp_set_state(ctx: &ProbeContext) -> Result<u32, i64> {
    let state: i32 = ctx.arg(1).ok_or(-1i64)?;
    if state != TCP_ESTABLISHED as i32 {
        return Ok(0);
    }
    increment_stat(STAT_ESTABLISHED);

    let sk = sock_arg(ctx, 0)?;
    let raw = read_sock_common(sk)?;

    let key = match ConnectionKey::from_sock(&raw) {
        Ok(k) => k,
        Err(_) => {
            increment_stat(STAT_UNSUPPORTED_FAMILY);
            return Ok(0);
        }
    };

    let start = match unsafe { START.get(&key) } {
        Some(ts) => *ts,
        None => {
            increment_stat(STAT_MISSES);
            return Ok(0);
        }
    };

    // Only the CPU whose delete succeeds records the sample
    if START.remove(&key).is_err() {
        increment_stat(STAT_MISSES);
        return Ok(0);
    }

    let now = get_timestamp();
    let slot = match slot_for_interval(start, now) {
        Some(slot) => slot,
        None => {
            increment_stat(STAT_CLOCK_SKEW);
            return Ok(0);
        }
    };

    record_latency(slot, (now - start) / 1000);
    increment_stat(STAT_RECORDED);

    debug!(
        ctx,
        "handshake {}:{} complete, slot {}",
        key.local_port(),
        key.peer_port(),
        slot
    );

    Ok(0)
}
