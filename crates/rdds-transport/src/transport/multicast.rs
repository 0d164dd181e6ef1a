// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Multicast group transport and interface discovery helpers.
//!
//! One instance joins one group; the group address is the link key, so all
//! traffic on the group flows over a single `DataLink`. Joining happens on
//! every non-loopback interface (the behavior vendors converge on), with
//! loopback delivery enabled by default for intra-host pub/sub.
//!
//! Backpressure is structurally impossible here: a full socket buffer
//! drops the datagram, which is the best-effort contract of multicast.

use std::io;
use std::io::IoSlice;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{TransportInst, TransportKind};
use crate::error::{Result, TransportError};
use crate::link::DataLink;
use crate::locator::{LocatorBlob, RemoteAddress, LOCATOR_KIND_MULTICASTV4};
use crate::strategy::recv::ReceivedDataSample;
use crate::strategy::send::WireSender;

use super::{key_or_not_found, mark_all_lost, release_link, LinkTable, Transport};

/// Receive slice so the reader observes shutdown promptly.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Interface discovery
// ============================================================================

/// All non-loopback IPv4 interfaces suitable for multicast.
///
/// Honors the `RDDS_MULTICAST_IF` override for testing and multi-homed
/// hosts.
pub fn get_multicast_interfaces() -> Vec<Ipv4Addr> {
    if let Ok(var) = std::env::var("RDDS_MULTICAST_IF") {
        if let Ok(addr) = var.parse::<Ipv4Addr>() {
            log::debug!("[MCAST] using RDDS_MULTICAST_IF override: {}", addr);
            return vec![addr];
        }
        log::warn!("[MCAST] invalid RDDS_MULTICAST_IF='{}', auto-detecting", var);
    }

    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(err) => {
            log::debug!("[MCAST] interface enumeration failed: {}", err);
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .collect()
}

/// Primary interface IP: the first usable non-loopback interface, or
/// UNSPECIFIED when the host has none.
pub fn get_primary_interface_ip() -> Ipv4Addr {
    get_multicast_interfaces()
        .first()
        .copied()
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Join a multicast group on the given interface, or on all discovered
/// interfaces when `iface` is `None`. Returns the interface used for sends.
pub fn join_multicast_group(
    socket: &UdpSocket,
    group: Ipv4Addr,
    iface: Option<Ipv4Addr>,
) -> io::Result<Ipv4Addr> {
    let interfaces = match iface {
        Some(addr) => vec![addr],
        None => get_multicast_interfaces(),
    };

    if interfaces.is_empty() {
        match socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
            Ok(()) => log::debug!("[MCAST] joined {} on UNSPECIFIED", group),
            // Hosts without a multicast route can still loop back locally.
            Err(err) => log::warn!("[MCAST] join {} on UNSPECIFIED failed: {}", group, err),
        }
        return Ok(Ipv4Addr::UNSPECIFIED);
    }

    for addr in &interfaces {
        match socket.join_multicast_v4(&group, addr) {
            Ok(()) => log::debug!("[MCAST] joined {} on {}", group, addr),
            // Already joined on the same physical NIC: harmless.
            Err(err) if err.raw_os_error() == Some(libc::EADDRINUSE) => {
                log::debug!("[MCAST] {} already joined on {}", group, addr);
            }
            Err(err) => {
                log::debug!("[MCAST] join {} on {} failed (non-fatal): {}", group, addr, err);
            }
        }
    }

    Ok(interfaces[0])
}

// ============================================================================
// Wire sender
// ============================================================================

struct MulticastWireSender {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
    max_message_size: usize,
}

impl WireSender for MulticastWireSender {
    fn send_bytes(&self, bufs: &[IoSlice<'_>], _backpressure: &mut bool) -> io::Result<usize> {
        send_datagram(&self.socket, bufs, self.group, self.max_message_size, "MCAST")
    }
}

/// Datagram send shared by the connectionless transports.
///
/// Never reports backpressure: a transiently full buffer or an oversized
/// payload drops the datagram with a log, and only hard socket failures
/// take the link down.
pub(crate) fn send_datagram(
    socket: &UdpSocket,
    bufs: &[IoSlice<'_>],
    dest: SocketAddr,
    max_message_size: usize,
    tag: &str,
) -> io::Result<usize> {
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    if total > max_message_size {
        log::warn!(
            "[{}] dropping {}-byte datagram to {} (max {})",
            tag,
            total,
            dest,
            max_message_size
        );
        return Ok(total);
    }

    let flat;
    let payload: &[u8] = if bufs.len() == 1 {
        &bufs[0]
    } else {
        flat = bufs.iter().flat_map(|b| b.iter().copied()).collect::<Vec<u8>>();
        &flat
    };

    match socket.send_to(payload, dest) {
        Ok(n) => Ok(n),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
            log::debug!("[{}] socket full, dropping {} bytes to {}", tag, total, dest);
            Ok(total)
        }
        Err(err) => Err(err),
    }
}

// ============================================================================
// MulticastTransport
// ============================================================================

/// Multicast group connection manager.
pub struct MulticastTransport {
    inst: TransportInst,
    group: SocketAddr,
    max_message_size: usize,
    socket: Arc<UdpSocket>,
    links: LinkTable,
    shutdown_flag: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for MulticastTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MulticastTransport")
            .field("inst", &self.inst.name)
            .field("group", &self.group)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

impl MulticastTransport {
    /// Open the group socket and start the receiver.
    ///
    /// Any failure rolls back everything acquired so far (the socket closes
    /// on drop); partial state never persists.
    pub fn new(inst: &TransportInst) -> Result<Arc<Self>> {
        let cfg = inst.multicast()?.clone();
        let group_ip = match cfg.group.ip() {
            IpAddr::V4(v4) if v4.is_multicast() => v4,
            other => {
                return Err(TransportError::ConfigurationConflict(format!(
                    "'{}': {} is not an IPv4 multicast group",
                    inst.name, other
                )));
            }
        };

        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], cfg.group.port()));
        raw.bind(&bind_addr.into())?;
        let socket: UdpSocket = raw.into();

        join_multicast_group(&socket, group_ip, cfg.iface)?;
        socket.set_multicast_loop_v4(cfg.loopback)?;
        socket.set_multicast_ttl_v4(u32::from(cfg.ttl))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        let transport = Arc::new(Self {
            inst: inst.clone(),
            group: cfg.group,
            max_message_size: cfg.max_message_size,
            socket: Arc::new(socket),
            links: LinkTable::new(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let handle = spawn_receiver(&transport)?;
        *transport.receiver.lock() = Some(handle);

        log::debug!("[MCAST] '{}' joined group {}", inst.name, cfg.group);
        Ok(transport)
    }

    fn group_key(&self) -> RemoteAddress {
        RemoteAddress::Multicast(self.group)
    }
}

fn spawn_receiver(transport: &Arc<MulticastTransport>) -> Result<JoinHandle<()>> {
    let weak = Arc::downgrade(transport);
    let socket = Arc::clone(&transport.socket);
    let shutdown = Arc::clone(&transport.shutdown_flag);
    let max = transport.max_message_size;

    thread::Builder::new()
        .name("rdds-mcast-recv".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; max];
            while !shutdown.load(Ordering::Acquire) {
                match socket.recv_from(&mut buf) {
                    Ok((n, _src)) => {
                        let Some(transport) = weak.upgrade() else { break };
                        let key = transport.group_key();
                        if let Some(link) = transport.links.get(&key) {
                            link.receive_strategy().deliver(&ReceivedDataSample {
                                remote: key,
                                source_prefix: None,
                                payload: buf[..n].to_vec(),
                            });
                        } else {
                            log::debug!("[MCAST] {} bytes on {} with no link bound", n, key);
                        }
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::TimedOut => {}
                    Err(err) => {
                        if !shutdown.load(Ordering::Acquire) {
                            log::warn!("[MCAST] receive failed: {}", err);
                        }
                        break;
                    }
                }
            }
        })
        .map_err(|err| TransportError::UnableToCreate(format!("multicast receiver: {}", err)))
}

impl Transport for MulticastTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Multicast
    }

    fn inst(&self) -> &TransportInst {
        &self.inst
    }

    fn blob_to_key(&self, blob: &LocatorBlob) -> Option<RemoteAddress> {
        match blob.decode_expecting(&[LOCATOR_KIND_MULTICASTV4])? {
            // Only the configured group is reachable through this instance.
            RemoteAddress::Multicast(addr) if addr == self.group => {
                Some(RemoteAddress::Multicast(addr))
            }
            other => {
                log::debug!("[MCAST] ignoring locator {} (group is {})", other, self.group);
                None
            }
        }
    }

    fn find_or_create_datalink(
        &self,
        blob: &LocatorBlob,
        _connect_as_publisher: bool,
    ) -> Result<Arc<DataLink>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::MiscProblem("transport is shut down".into()));
        }
        let key = key_or_not_found(self.kind(), self.blob_to_key(blob))?;

        let (link, created) = self.links.find_or_bind(key.clone(), || DataLink::new(key.clone()));
        if created {
            let wire = Arc::new(MulticastWireSender {
                socket: Arc::clone(&self.socket),
                group: self.group,
                max_message_size: self.max_message_size,
            });
            // Connectionless: no handshake, no pause period.
            if let Err(err) = link.connect(wire, None) {
                release_link(&self.links, &link);
                return Err(err);
            }
        }
        Ok(link)
    }

    fn accept_datalink(&self, blob: &LocatorBlob, _timeout: Duration) -> Result<Arc<DataLink>> {
        // Group membership is symmetric; the passive side joins the same way.
        self.find_or_create_datalink(blob, false)
    }

    fn release_datalink(&self, link: &Arc<DataLink>) {
        release_link(&self.links, link);
    }

    fn notify_lost_on_backpressure_timeout(&self) {
        mark_all_lost(&self.links);
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_flag.store(true, Ordering::Release);
        if let Some(handle) = self.receiver.lock().take() {
            let _ = handle.join();
        }
        for link in self.links.drain() {
            link.transport_shutdown();
        }
        log::debug!("[MCAST] '{}' shut down", self.inst.name);
    }

    fn local_locator(&self) -> LocatorBlob {
        self.group_key().to_blob()
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstConfig, MulticastInst};

    fn inst(group: SocketAddr) -> TransportInst {
        TransportInst::new(
            "mcast_test",
            InstConfig::Multicast(MulticastInst {
                group,
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_rejects_non_multicast_group() {
        let inst = inst(SocketAddr::from(([10, 0, 0, 1], 7401)));
        let err = MulticastTransport::new(&inst).unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationConflict(_)));
    }

    #[test]
    fn test_rejects_wrong_kind_inst() {
        let inst = TransportInst::new("u", InstConfig::Udp(crate::config::UdpInst::default()));
        assert!(MulticastTransport::new(&inst).is_err());
    }

    #[test]
    fn test_blob_to_key_filters_foreign_groups() {
        let group = SocketAddr::from(([239, 255, 0, 77], 17401));
        let transport = MulticastTransport::new(&inst(group)).unwrap();

        let ours = RemoteAddress::Multicast(group).to_blob();
        assert!(transport.blob_to_key(&ours).is_some());

        let other = RemoteAddress::Multicast(SocketAddr::from(([239, 255, 0, 78], 17401))).to_blob();
        assert!(transport.blob_to_key(&other).is_none());

        let udp = RemoteAddress::Udp(SocketAddr::from(([127, 0, 0, 1], 1))).to_blob();
        assert!(transport.blob_to_key(&udp).is_none());

        transport.shutdown();
    }

    #[test]
    fn test_group_link_dedup_and_release() {
        let group = SocketAddr::from(([239, 255, 0, 79], 17403));
        let transport = MulticastTransport::new(&inst(group)).unwrap();
        let blob = RemoteAddress::Multicast(group).to_blob();

        let a = transport.find_or_create_datalink(&blob, true).unwrap();
        let b = transport.find_or_create_datalink(&blob, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.attachments(), 2);

        transport.release_datalink(&b);
        assert_eq!(a.attachments(), 1);
        transport.release_datalink(&a);
        assert_eq!(a.state(), crate::link::LinkState::Shutdown);

        transport.shutdown();
    }

    #[test]
    fn test_shutdown_idempotent() {
        let group = SocketAddr::from(([239, 255, 0, 80], 17405));
        let transport = MulticastTransport::new(&inst(group)).unwrap();
        transport.shutdown();
        transport.shutdown();
    }
}
