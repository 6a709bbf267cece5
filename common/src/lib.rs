//! Shared types and utilities for the connlat probes
//!
//! This crate provides the connection key, the address normalizer and the
//! histogram slot math used by both the eBPF program and the userspace daemon.
//! Keeping them in one place means the entry path and the completion path
//! always run the same normalization code.

#![cfg_attr(not(test), no_std)]

pub mod constants;
pub mod hist;
pub mod sock;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use hist::{latency_slot, log2_floor, slot_bounds_us, slot_for_interval};
pub use sock::{Endpoints, NormalizeError, SockCommon};
pub use types::ConnectionKey;
