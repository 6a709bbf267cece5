//! Shared data structures between kernel and userspace
//!
//! These structures must be repr(C) to ensure consistent memory layout
//! between eBPF programs and userspace code.

/// Canonical correlation key for one connection attempt
///
/// Used as the key of the pending-connection map. IPv4 endpoints are stored
/// in their IPv4-mapped IPv6 form, so the family is always `AF_INET6` and an
/// IPv4 connection seen through a dual-stack socket produces the same bytes
/// as one seen through an IPv4 request socket.
///
/// Ports hold the network byte order representation, the same way the
/// kernel stores `skc_dport`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// Address family, always `AF_INET6` after normalization
    pub family: u16,
    /// Local port (network byte order)
    pub local_port: u16,
    /// Peer port (network byte order)
    pub peer_port: u16,
    /// Padding, always zero so the key hashes identically in the kernel
    pub _pad: u16,
    /// Local address (16-byte, IPv4-mapped for IPv4)
    pub local_addr: [u8; 16],
    /// Peer address (16-byte, IPv4-mapped for IPv4)
    pub peer_addr: [u8; 16],
}

impl ConnectionKey {
    /// Size of the key as seen by the BPF map
    pub const SIZE: usize = 40;

    /// Local port in host byte order
    #[inline(always)]
    pub fn local_port(&self) -> u16 {
        u16::from_be(self.local_port)
    }

    /// Peer port in host byte order
    #[inline(always)]
    pub fn peer_port(&self) -> u16 {
        u16::from_be(self.peer_port)
    }

    /// Returns the embedded IPv4 address if `addr` is `::ffff:a.b.c.d`
    pub fn mapped_v4(addr: &[u8; 16]) -> Option<[u8; 4]> {
        let prefix_ok = addr[..10].iter().all(|b| *b == 0) && addr[10] == 0xff && addr[11] == 0xff;
        if prefix_ok {
            Some([addr[12], addr[13], addr[14], addr[15]])
        } else {
            None
        }
    }
}

// Compile-time layout checks
const _: () = {
    assert!(core::mem::size_of::<ConnectionKey>() == ConnectionKey::SIZE);
    assert!(core::mem::size_of::<ConnectionKey>() % core::mem::align_of::<ConnectionKey>() == 0);
};

// Implement Aya's Pod trait for userspace usage
#[cfg(feature = "userspace")]
mod userspace_impls {
    use super::*;

    // Pod implementation for reading START map keys in userspace
    unsafe impl aya::Pod for ConnectionKey {}
}
