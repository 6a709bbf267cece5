//! connlat - Kernel Space Program
//!
//! This eBPF program measures TCP handshake latency on the passive side:
//! the time from a request socket being queued on a listener until the
//! resulting socket transitions to ESTABLISHED.
//!
//! ## Architecture
//!
//! ```text
//! inet_csk_reqsk_queue_hash_add()  -> normalize key, START[key] = now
//! inet6_csk_reqsk_queue_hash_add() -> normalize key, START[key] = now
//!                  |
//!                  v
//! tcp_set_state(ESTABLISHED)       -> take START[key], HIST[log2(us)] += 1
//!                  |
//!                  v
//! Userspace    -> read HIST / START / STATS periodically and render
//! ```
//!
//! ## Usage
//!
//! This program must be compiled for the bpfel-unknown-none target:
//!
//! ```bash
//! cargo build --release --target=bpfel-unknown-none -Z build-std=core
//! ```
//!
//! The compiled bytecode is then loaded by the userspace program.

#![no_std]
#![no_main]

mod handlers;
mod helpers;
mod maps;
mod socket_parser;

// Re-export kprobe functions so they're visible to the loader
pub use handlers::{inet6_csk_reqsk_queue_hash_add, inet_csk_reqsk_queue_hash_add, tcp_set_state};

// Maps are looked up by name from userspace
pub use maps::{HIST, START, STATS};

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    // Unreachable: the verifier rejects programs that could panic
    loop {}
}
