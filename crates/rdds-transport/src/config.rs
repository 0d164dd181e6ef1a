// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Per-instance transport configuration.
//!
//! A [`TransportInst`] is a named, immutable description of one transport
//! instance ("tcp1", "shmem_local", ...). The generic instance carries a
//! kind-specific configuration variant; each concrete transport accepts only
//! its own variant and reports a configuration conflict for anything else,
//! mirroring the failed-downcast rule of the framework design.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Result, TransportError};

// ============================================================================
// Kinds
// ============================================================================

/// The five supported transport kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Connection-oriented TCP with length-prefix framing.
    Tcp,
    /// Connectionless UDP unicast.
    Udp,
    /// UDP multicast group.
    Multicast,
    /// Same-host shared-memory pool.
    Shmem,
    /// RTPS-framed UDP.
    RtpsUdp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Multicast => "multicast",
            TransportKind::Shmem => "shmem",
            TransportKind::RtpsUdp => "rtps_udp",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Per-kind configuration
// ============================================================================

/// TCP instance configuration.
#[derive(Clone, Debug)]
pub struct TcpInst {
    /// Address the acceptor binds to. Port 0 picks an ephemeral port.
    pub listen_addr: SocketAddr,

    /// Address advertised to peers in locators, when it differs from the
    /// bound address (NAT, 0.0.0.0 binds). `None` advertises the bound one.
    pub public_addr: Option<SocketAddr>,

    /// Bound on active connection establishment.
    pub connect_timeout: Duration,

    /// Bound on passive-side waits in `accept_datalink`.
    pub accept_timeout: Duration,

    /// How long a link may stay in backpressure before it is declared lost.
    /// `None` waits indefinitely for the socket to drain.
    pub max_output_pause_period: Option<Duration>,

    /// TCP_NODELAY on every connection.
    pub nodelay: bool,

    /// Upper bound on a single framed message.
    pub max_message_size: usize,
}

impl Default for TcpInst {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            public_addr: None,
            connect_timeout: Duration::from_secs(5),
            accept_timeout: Duration::from_secs(5),
            max_output_pause_period: Some(Duration::from_secs(5)),
            nodelay: true,
            max_message_size: 16 * 1024 * 1024,
        }
    }
}

/// UDP unicast instance configuration.
#[derive(Clone, Debug)]
pub struct UdpInst {
    /// Local bind address. This address doubles as the advertised locator,
    /// so real deployments bind an explicit port.
    pub local_addr: SocketAddr,

    /// Receive buffer size hint (SO_RCVBUF), if any.
    pub rcvbuf_bytes: Option<usize>,

    /// Upper bound on a single datagram.
    pub max_message_size: usize,
}

impl Default for UdpInst {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            rcvbuf_bytes: None,
            max_message_size: 64 * 1024,
        }
    }
}

/// Multicast instance configuration.
#[derive(Clone, Debug)]
pub struct MulticastInst {
    /// Group address and port this instance joins and sends to.
    pub group: SocketAddr,

    /// Multicast TTL (hop limit). 1 keeps traffic on the local segment.
    pub ttl: u8,

    /// Loop sent datagrams back to local readers (intra-host pub/sub).
    pub loopback: bool,

    /// Interface to join on; `None` joins on all non-loopback interfaces.
    pub iface: Option<Ipv4Addr>,

    /// Upper bound on a single datagram.
    pub max_message_size: usize,
}

impl Default for MulticastInst {
    fn default() -> Self {
        Self {
            group: SocketAddr::from(([239, 255, 0, 2], 7401)),
            ttl: 1,
            loopback: true,
            iface: None,
            max_message_size: 64 * 1024,
        }
    }
}

/// Shared-memory instance configuration.
#[derive(Clone, Debug)]
pub struct ShmemInst {
    /// Pool name. Combined with the hostname this forms the instance's
    /// shared-memory locator; peers on other hosts are structurally
    /// unreachable.
    pub pool_name: String,

    /// Size of the receive pool in bytes.
    pub pool_size: usize,

    /// Upper bound on a single record written into a pool.
    pub max_message_size: usize,
}

impl Default for ShmemInst {
    fn default() -> Self {
        Self {
            pool_name: "rdds_pool".to_string(),
            pool_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024,
        }
    }
}

/// RTPS-framed UDP instance configuration.
#[derive(Clone, Debug)]
pub struct RtpsUdpInst {
    /// DDS domain, used for the default port mapping.
    pub domain_id: u32,

    /// Participant index within the domain, used for the default port
    /// mapping.
    pub participant_id: u8,

    /// Explicit local bind address; `None` derives the port from
    /// `domain_id`/`participant_id` per the RTPS user-unicast formula.
    pub local_addr: Option<SocketAddr>,

    /// GUID prefix stamped into every outgoing RTPS message header.
    pub guid_prefix: [u8; 12],

    /// Upper bound on a single datagram (header included).
    pub max_message_size: usize,
}

impl Default for RtpsUdpInst {
    fn default() -> Self {
        Self {
            domain_id: 0,
            participant_id: 0,
            local_addr: None,
            guid_prefix: [0u8; 12],
            max_message_size: 64 * 1024,
        }
    }
}

// ============================================================================
// Generic instance
// ============================================================================

/// Kind-specific configuration payload of a [`TransportInst`].
#[derive(Clone, Debug)]
pub enum InstConfig {
    /// TCP configuration.
    Tcp(TcpInst),
    /// UDP configuration.
    Udp(UdpInst),
    /// Multicast configuration.
    Multicast(MulticastInst),
    /// Shared-memory configuration.
    Shmem(ShmemInst),
    /// RTPS/UDP configuration.
    RtpsUdp(RtpsUdpInst),
}

/// A named transport instance description.
#[derive(Clone, Debug)]
pub struct TransportInst {
    /// Registry-unique instance name.
    pub name: String,

    /// Kind-specific configuration.
    pub config: InstConfig,
}

impl TransportInst {
    /// Create a named instance.
    pub fn new(name: impl Into<String>, config: InstConfig) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    /// Transport kind of this instance.
    pub fn kind(&self) -> TransportKind {
        match self.config {
            InstConfig::Tcp(_) => TransportKind::Tcp,
            InstConfig::Udp(_) => TransportKind::Udp,
            InstConfig::Multicast(_) => TransportKind::Multicast,
            InstConfig::Shmem(_) => TransportKind::Shmem,
            InstConfig::RtpsUdp(_) => TransportKind::RtpsUdp,
        }
    }

    /// TCP configuration, or a configuration conflict for other kinds.
    pub fn tcp(&self) -> Result<&TcpInst> {
        match &self.config {
            InstConfig::Tcp(cfg) => Ok(cfg),
            _ => Err(self.conflict(TransportKind::Tcp)),
        }
    }

    /// UDP configuration, or a configuration conflict for other kinds.
    pub fn udp(&self) -> Result<&UdpInst> {
        match &self.config {
            InstConfig::Udp(cfg) => Ok(cfg),
            _ => Err(self.conflict(TransportKind::Udp)),
        }
    }

    /// Multicast configuration, or a configuration conflict for other kinds.
    pub fn multicast(&self) -> Result<&MulticastInst> {
        match &self.config {
            InstConfig::Multicast(cfg) => Ok(cfg),
            _ => Err(self.conflict(TransportKind::Multicast)),
        }
    }

    /// Shared-memory configuration, or a configuration conflict for other
    /// kinds.
    pub fn shmem(&self) -> Result<&ShmemInst> {
        match &self.config {
            InstConfig::Shmem(cfg) => Ok(cfg),
            _ => Err(self.conflict(TransportKind::Shmem)),
        }
    }

    /// RTPS/UDP configuration, or a configuration conflict for other kinds.
    pub fn rtps_udp(&self) -> Result<&RtpsUdpInst> {
        match &self.config {
            InstConfig::RtpsUdp(cfg) => Ok(cfg),
            _ => Err(self.conflict(TransportKind::RtpsUdp)),
        }
    }

    fn conflict(&self, wanted: TransportKind) -> TransportError {
        TransportError::ConfigurationConflict(format!(
            "instance '{}' is {}, not {}",
            self.name,
            self.kind(),
            wanted
        ))
    }
}

// ============================================================================
// RTPS port mapping
// ============================================================================

/// RTPS v2 port mapping (RTPS Sec.9.6.1 defaults).
///
/// `PB + DG * domain + offset + PG * participant` with the standard
/// constants. Only the user-unicast port is needed here; discovery traffic
/// belongs to the control plane, which is outside this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortMapping {
    /// User-data unicast port for this participant.
    pub user_unicast: u16,
}

impl PortMapping {
    const PB: u32 = 7400;
    const DG: u32 = 250;
    const PG: u32 = 2;
    const D3: u32 = 11;

    /// Calculate ports for a domain/participant pair.
    ///
    /// Fails when the computed port exceeds the 16-bit range.
    pub fn calculate(domain_id: u32, participant_id: u8) -> Result<Self> {
        let port =
            Self::PB + Self::DG * domain_id + Self::D3 + Self::PG * u32::from(participant_id);
        if port > u32::from(u16::MAX) {
            return Err(TransportError::UnableToCreate(format!(
                "RTPS port {} out of range for domain {} participant {}",
                port, domain_id, participant_id
            )));
        }
        Ok(Self {
            user_unicast: port as u16,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
