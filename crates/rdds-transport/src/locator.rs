// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Locator blobs: serialized remote-endpoint addresses.
//!
//! A locator blob is the transport-specific byte sequence a peer publishes
//! to describe how to reach one of its endpoints. Blobs travel inside
//! `AssociationData` and are decoded by the receiving transport; a transport
//! must ignore blobs whose kind it does not recognize, which is what makes
//! heterogeneous multi-transport negotiation work.
//!
//! # Wire Format
//!
//! Every blob starts with a 4-byte big-endian kind:
//!
//! ```text
//! IP kinds (UDPV4/TCPV4/MULTICASTV4/RTPSUDPV4):
//! +----------+-----------+---------------------+
//! | kind (4) | port (4)  | address (16 bytes)  |
//! +----------+-----------+---------------------+
//! ```
//!
//! IPv4 addresses occupy the last 4 bytes of the 16-byte address field
//! (RTPS `Locator_t` convention); a nonzero prefix marks an IPv6 address.
//!
//! ```text
//! SHMEM:
//! +----------+----------------------------+
//! | kind (4) | hostname \0 poolname (utf8)|
//! +----------+----------------------------+
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

// ============================================================================
// Kind constants
// ============================================================================

/// Locator kind: invalid.
pub const LOCATOR_KIND_INVALID: i32 = -1;

/// Locator kind: plain UDP unicast over IPv4.
pub const LOCATOR_KIND_UDPV4: i32 = 1;

/// Locator kind: TCP over IPv4.
pub const LOCATOR_KIND_TCPV4: i32 = 4;

/// Locator kind: UDP multicast group over IPv4.
pub const LOCATOR_KIND_MULTICASTV4: i32 = 5;

/// Locator kind: RTPS-framed UDP over IPv4.
pub const LOCATOR_KIND_RTPSUDPV4: i32 = 6;

/// Locator kind: same-host shared memory pool.
pub const LOCATOR_KIND_SHMEM: i32 = 16;

/// Size of the fixed-layout IP locator payload (port + address).
const IP_PAYLOAD_LEN: usize = 4 + 16;

// ============================================================================
// RemoteAddress
// ============================================================================

/// Decoded remote-endpoint key.
///
/// This is the key a transport uses for its link map: one `DataLink` exists
/// per `(local instance, RemoteAddress)` pair.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RemoteAddress {
    /// UDP unicast endpoint.
    Udp(SocketAddr),

    /// TCP endpoint (the peer's listen address).
    Tcp(SocketAddr),

    /// Multicast group endpoint.
    Multicast(SocketAddr),

    /// RTPS-framed UDP endpoint.
    RtpsUdp(SocketAddr),

    /// Shared-memory pool on a specific host.
    Shmem {
        /// Hostname the pool lives on.
        hostname: String,
        /// Pool name within that host.
        pool: String,
    },
}

impl RemoteAddress {
    /// Locator kind constant for this address.
    pub fn kind(&self) -> i32 {
        match self {
            RemoteAddress::Udp(_) => LOCATOR_KIND_UDPV4,
            RemoteAddress::Tcp(_) => LOCATOR_KIND_TCPV4,
            RemoteAddress::Multicast(_) => LOCATOR_KIND_MULTICASTV4,
            RemoteAddress::RtpsUdp(_) => LOCATOR_KIND_RTPSUDPV4,
            RemoteAddress::Shmem { .. } => LOCATOR_KIND_SHMEM,
        }
    }

    /// Encode this address into its wire blob.
    pub fn to_blob(&self) -> LocatorBlob {
        let mut bytes = Vec::with_capacity(4 + IP_PAYLOAD_LEN);
        bytes.extend_from_slice(&self.kind().to_be_bytes());
        match self {
            RemoteAddress::Udp(addr)
            | RemoteAddress::Tcp(addr)
            | RemoteAddress::Multicast(addr)
            | RemoteAddress::RtpsUdp(addr) => {
                bytes.extend_from_slice(&u32::from(addr.port()).to_be_bytes());
                bytes.extend_from_slice(&encode_ip(addr.ip()));
            }
            RemoteAddress::Shmem { hostname, pool } => {
                bytes.extend_from_slice(hostname.as_bytes());
                bytes.push(0);
                bytes.extend_from_slice(pool.as_bytes());
            }
        }
        LocatorBlob(bytes)
    }

    /// Socket address for IP-based kinds.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            RemoteAddress::Udp(addr)
            | RemoteAddress::Tcp(addr)
            | RemoteAddress::Multicast(addr)
            | RemoteAddress::RtpsUdp(addr) => Some(*addr),
            RemoteAddress::Shmem { .. } => None,
        }
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddress::Udp(addr) => write!(f, "udp:{}", addr),
            RemoteAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
            RemoteAddress::Multicast(addr) => write!(f, "mcast:{}", addr),
            RemoteAddress::RtpsUdp(addr) => write!(f, "rtps-udp:{}", addr),
            RemoteAddress::Shmem { hostname, pool } => write!(f, "shmem:{}/{}", hostname, pool),
        }
    }
}

// ============================================================================
// LocatorBlob
// ============================================================================

/// Opaque serialized locator, as carried in `AssociationData.remote_data`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocatorBlob(Vec<u8>);

impl LocatorBlob {
    /// Wrap raw blob bytes received from a peer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        LocatorBlob(bytes)
    }

    /// Raw blob bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Locator kind, if the blob is at least long enough to carry one.
    pub fn kind(&self) -> i32 {
        if self.0.len() < 4 {
            return LOCATOR_KIND_INVALID;
        }
        i32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Decode the blob into a remote-address key.
    ///
    /// Returns `None` for unknown kinds or malformed payloads; callers skip
    /// such blobs rather than failing the whole association.
    pub fn decode(&self) -> Option<RemoteAddress> {
        if self.0.len() < 4 {
            return None;
        }
        let kind = self.kind();
        let payload = &self.0[4..];
        match kind {
            LOCATOR_KIND_UDPV4 => decode_ip_payload(payload).map(RemoteAddress::Udp),
            LOCATOR_KIND_TCPV4 => decode_ip_payload(payload).map(RemoteAddress::Tcp),
            LOCATOR_KIND_MULTICASTV4 => decode_ip_payload(payload).map(RemoteAddress::Multicast),
            LOCATOR_KIND_RTPSUDPV4 => decode_ip_payload(payload).map(RemoteAddress::RtpsUdp),
            LOCATOR_KIND_SHMEM => {
                let sep = payload.iter().position(|&b| b == 0)?;
                let hostname = std::str::from_utf8(&payload[..sep]).ok()?;
                let pool = std::str::from_utf8(&payload[sep + 1..]).ok()?;
                if hostname.is_empty() || pool.is_empty() {
                    return None;
                }
                Some(RemoteAddress::Shmem {
                    hostname: hostname.to_string(),
                    pool: pool.to_string(),
                })
            }
            _ => None,
        }
    }

    /// Decode only if the blob carries one of the given kinds.
    ///
    /// This is the entry point transports use for `blob_to_key`: a blob of
    /// a foreign kind decodes to `None` and the transport stays out of the
    /// negotiation.
    pub fn decode_expecting(&self, kinds: &[i32]) -> Option<RemoteAddress> {
        if !kinds.contains(&self.kind()) {
            return None;
        }
        self.decode()
    }
}

// ============================================================================
// IP encoding helpers
// ============================================================================

/// Pack an IP address into the 16-byte locator address field.
fn encode_ip(ip: IpAddr) -> [u8; 16] {
    let mut out = [0u8; 16];
    match ip {
        IpAddr::V4(v4) => out[12..16].copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => out.copy_from_slice(&v6.octets()),
    }
    out
}

/// Decode a `port + address` IP payload.
fn decode_ip_payload(payload: &[u8]) -> Option<SocketAddr> {
    if payload.len() != IP_PAYLOAD_LEN {
        return None;
    }
    let port = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
    if port > u32::from(u16::MAX) {
        return None;
    }
    let mut address = [0u8; 16];
    address.copy_from_slice(&payload[4..20]);

    // All-zero prefix means IPv4 in the last 4 bytes.
    let ip = if address[..12].iter().all(|&b| b == 0) {
        IpAddr::V4(Ipv4Addr::new(
            address[12],
            address[13],
            address[14],
            address[15],
        ))
    } else {
        IpAddr::V6(Ipv6Addr::from(address))
    };
    Some(SocketAddr::new(ip, port as u16))
}

// ============================================================================
// Tests
// ============================================================================
