//! Socket structure parsing utilities
//!
//! Reads the fields of `struct sock_common` that make up a connection
//! 4-tuple. `struct request_sock` starts with `__req_common` and
//! `struct sock` with `__sk_common`, so one reader serves both hooks.

use aya_ebpf::{helpers::bpf_probe_read_kernel, programs::ProbeContext};
use connlat_common::sock::SockCommon;

/// Kernel struct sock_common (leading part, x86_64 with CONFIG_IPV6)
///
/// Only the fields up to the IPv6 addresses are declared; the layout
/// mirrors the kernel so the offsets line up.
#[repr(C)]
#[allow(non_camel_case_types)]
pub struct sock_common {
    skc_daddr: u32,         // Peer address (network byte order)
    skc_rcv_saddr: u32,     // Local address (network byte order)
    skc_hash: u32,
    skc_dport: u16,         // Peer port (network byte order)
    skc_num: u16,           // Local port (host byte order)
    skc_family: u16,        // Address family (AF_INET, AF_INET6)
    skc_state: u8,          // Connection state
    skc_flags: u8,          // skc_reuse / skc_reuseport / skc_ipv6only bitfield
    skc_bound_dev_if: i32,
    skc_bind_node: [u64; 2],
    skc_prot: u64,
    skc_net: u64,
    skc_v6_daddr: [u8; 16],
    skc_v6_rcv_saddr: [u8; 16],
}

/// Read a pointer argument from the kprobe context
///
/// `inet_csk_reqsk_queue_hash_add(sk, req, timeout)` carries the request
/// socket in argument 1, `tcp_set_state(sk, state)` the socket in argument 0.
#[inline(always)]
pub fn sock_arg(ctx: &ProbeContext, n: usize) -> Result<*const sock_common, i64> {
    let ptr: *const sock_common = ctx.arg(n).ok_or(-1i64)?;
    if ptr.is_null() {
        return Err(-1);
    }
    Ok(ptr)
}

/// Copy the 4-tuple fields out of kernel memory
///
/// # Safety
///
/// Uses bpf_probe_read_kernel to read from kernel memory.
/// The BPF verifier ensures this is safe.
#[inline(always)]
pub fn read_sock_common(ptr: *const sock_common) -> Result<SockCommon, i64> {
    let raw = unsafe { bpf_probe_read_kernel(ptr).map_err(|e| e as i64)? };

    Ok(SockCommon {
        // Addresses keep their in-memory (network order) bytes
        skc_daddr: raw.skc_daddr.to_ne_bytes(),
        skc_rcv_saddr: raw.skc_rcv_saddr.to_ne_bytes(),
        skc_dport: raw.skc_dport,
        skc_num: raw.skc_num,
        skc_family: raw.skc_family,
        skc_v6_daddr: raw.skc_v6_daddr,
        skc_v6_rcv_saddr: raw.skc_v6_rcv_saddr,
    })
}
