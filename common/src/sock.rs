//! Address normalization for request sockets and full sockets
//!
//! The kernel exposes a connection through two different objects: a
//! `request_sock` while the handshake is in progress and a `sock` once the
//! connection reaches ESTABLISHED. Both embed `struct sock_common`, but the
//! entry probes learn the family from the hook that fired while the
//! completion probe has to read `skc_family`, and a dual-stack listener
//! reports IPv4 peers through the IPv6 fields. Everything funnels through
//! [`ConnectionKey::normalize`] so both paths agree byte for byte.

use crate::{
    constants::{AF_INET, AF_INET6},
    types::ConnectionKey,
};

/// The subset of `struct sock_common` the probes read
///
/// Field names follow the kernel. Byte arrays are in network order, exactly
/// as they sit in kernel memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SockCommon {
    /// Peer IPv4 address
    pub skc_daddr: [u8; 4],
    /// Local IPv4 address
    pub skc_rcv_saddr: [u8; 4],
    /// Peer port (network byte order)
    pub skc_dport: u16,
    /// Local port (host byte order)
    pub skc_num: u16,
    /// Address family (AF_INET, AF_INET6)
    pub skc_family: u16,
    /// Peer IPv6 address
    pub skc_v6_daddr: [u8; 16],
    /// Local IPv6 address
    pub skc_v6_rcv_saddr: [u8; 16],
}

impl SockCommon {
    /// Build an IPv4 view from host-order ports
    pub fn v4(local: [u8; 4], local_port: u16, peer: [u8; 4], peer_port: u16) -> Self {
        Self {
            skc_daddr: peer,
            skc_rcv_saddr: local,
            skc_dport: peer_port.to_be(),
            skc_num: local_port,
            skc_family: AF_INET,
            ..Self::default()
        }
    }

    /// Build an IPv6 view from host-order ports
    pub fn v6(local: [u8; 16], local_port: u16, peer: [u8; 16], peer_port: u16) -> Self {
        Self {
            skc_dport: peer_port.to_be(),
            skc_num: local_port,
            skc_family: AF_INET6,
            skc_v6_daddr: peer,
            skc_v6_rcv_saddr: local,
            ..Self::default()
        }
    }

    /// Resolve the raw fields into a tagged address pair for `family`
    pub fn endpoints(&self, family: u16) -> Result<Endpoints, NormalizeError> {
        match family {
            AF_INET => Ok(Endpoints::V4 {
                local: self.skc_rcv_saddr,
                peer: self.skc_daddr,
            }),
            AF_INET6 => Ok(Endpoints::V6 {
                local: self.skc_v6_rcv_saddr,
                peer: self.skc_v6_daddr,
            }),
            other => Err(NormalizeError::UnsupportedFamily(other)),
        }
    }
}

/// Local/peer address pair, resolved once per event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoints {
    V4 { local: [u8; 4], peer: [u8; 4] },
    V6 { local: [u8; 16], peer: [u8; 16] },
}

/// Why a socket could not be turned into a [`ConnectionKey`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    /// Family outside {AF_INET, AF_INET6}
    UnsupportedFamily(u16),
}

/// Write `addr` as `::ffff:a.b.c.d`
#[inline(always)]
fn map_v4(addr: [u8; 4]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[10] = 0xff;
    out[11] = 0xff;
    out[12] = addr[0];
    out[13] = addr[1];
    out[14] = addr[2];
    out[15] = addr[3];
    out
}

impl ConnectionKey {
    /// Build the canonical key
    ///
    /// `local_port_host` is the host-order `skc_num`, `peer_port_net` is the
    /// network-order `skc_dport`. The local port is swapped so that both
    /// ports end up in network order.
    #[inline(always)]
    pub fn normalize(local_port_host: u16, peer_port_net: u16, endpoints: Endpoints) -> Self {
        let (local_addr, peer_addr) = match endpoints {
            Endpoints::V4 { local, peer } => (map_v4(local), map_v4(peer)),
            Endpoints::V6 { local, peer } => (local, peer),
        };

        Self {
            family: AF_INET6,
            local_port: local_port_host.to_be(),
            peer_port: peer_port_net,
            _pad: 0,
            local_addr,
            peer_addr,
        }
    }

    /// Key for a half-open connection
    ///
    /// `family` comes from the hook that fired (IPv4 or IPv6 request queue),
    /// not from the request socket.
    #[inline(always)]
    pub fn from_request(family: u16, req: &SockCommon) -> Result<Self, NormalizeError> {
        let endpoints = req.endpoints(family)?;
        Ok(Self::normalize(req.skc_num, req.skc_dport, endpoints))
    }

    /// Key for a full socket at the ESTABLISHED transition
    #[inline(always)]
    pub fn from_sock(sk: &SockCommon) -> Result<Self, NormalizeError> {
        let endpoints = sk.endpoints(sk.skc_family)?;
        Ok(Self::normalize(sk.skc_num, sk.skc_dport, endpoints))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_mapped_layout() {
        let req = SockCommon::v4([10, 0, 0, 5], 22, [10, 0, 0, 9], 51000);
        let key = ConnectionKey::from_request(AF_INET, &req).unwrap();

        assert_eq!(
            key.local_addr,
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0x0a, 0x00, 0x00, 0x05]
        );
        assert_eq!(
            key.peer_addr,
            [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xff, 0x0a, 0x00, 0x00, 0x09]
        );
        assert_eq!(key.family, AF_INET6);
        assert_eq!(key.local_port(), 22);
        assert_eq!(key.peer_port(), 51000);
        assert_eq!(key._pad, 0);
    }

    #[test]
    fn test_request_and_established_paths_agree_ipv4() {
        let req = SockCommon::v4([10, 0, 0, 5], 22, [10, 0, 0, 9], 51000);
        let sk = SockCommon::v4([10, 0, 0, 5], 22, [10, 0, 0, 9], 51000);

        let entry = ConnectionKey::from_request(AF_INET, &req).unwrap();
        let completion = ConnectionKey::from_sock(&sk).unwrap();
        assert_eq!(entry, completion);
    }

    #[test]
    fn test_ports_stored_in_network_order() {
        let sk = SockCommon::v4([127, 0, 0, 1], 80, [127, 0, 0, 1], 40000);
        let key = ConnectionKey::from_sock(&sk).unwrap();

        assert_eq!(key.local_port.to_ne_bytes(), 80u16.to_be_bytes());
        assert_eq!(key.peer_port.to_ne_bytes(), 40000u16.to_be_bytes());
    }

    #[test]
    fn test_ipv6_copied_verbatim() {
        let local = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let peer = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        let sk = SockCommon::v6(local, 443, peer, 33000);

        let key = ConnectionKey::from_sock(&sk).unwrap();
        assert_eq!(key.local_addr, local);
        assert_eq!(key.peer_addr, peer);
        assert_eq!(key, ConnectionKey::from_request(AF_INET6, &sk).unwrap());
    }

    #[test]
    fn test_request_family_comes_from_hook() {
        // Request sockets are keyed by the hook's family even if skc_family is stale
        let mut req = SockCommon::v4([192, 168, 1, 1], 8080, [192, 168, 1, 2], 50000);
        req.skc_family = 0;

        let key = ConnectionKey::from_request(AF_INET, &req).unwrap();
        assert_eq!(ConnectionKey::mapped_v4(&key.local_addr), Some([192, 168, 1, 1]));
    }

    #[test]
    fn test_unknown_family_rejected() {
        let mut sk = SockCommon::v4([1, 2, 3, 4], 1, [5, 6, 7, 8], 2);
        sk.skc_family = 1; // AF_UNIX

        assert_eq!(
            ConnectionKey::from_sock(&sk),
            Err(NormalizeError::UnsupportedFamily(1))
        );
        assert_eq!(
            ConnectionKey::from_request(17, &sk),
            Err(NormalizeError::UnsupportedFamily(17))
        );
    }

    #[test]
    fn test_mapped_v4_rejects_native_ipv6() {
        let mut addr = [0u8; 16];
        addr[15] = 1; // ::1
        assert_eq!(ConnectionKey::mapped_v4(&addr), None);
    }
}
