// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! RTPS-framed UDP transport.
//!
//! Same datagram mechanics as the plain UDP transport, but every message
//! carries the 20-byte RTPS message header so peers can attribute traffic
//! to a source participant:
//!
//! ```text
//! +------+---------+----------+---------------------+
//! | RTPS | version | vendorId | guidPrefix (12 B)   |  20 bytes
//! +------+---------+----------+---------------------+
//! | payload ...                                     |
//! +-------------------------------------------------+
//! ```
//!
//! Datagrams without a valid header are dropped before demux. Default
//! ports follow the RTPS user-unicast formula from [`PortMapping`].
//!
//! The RTPS control plane (discovery, heartbeats, reliability) lives above
//! this crate; only the framing belongs to the transport.

use std::io;
use std::io::IoSlice;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{PortMapping, TransportInst, TransportKind};
use crate::error::{Result, TransportError};
use crate::link::DataLink;
use crate::locator::{LocatorBlob, RemoteAddress, LOCATOR_KIND_RTPSUDPV4};
use crate::strategy::recv::ReceivedDataSample;
use crate::strategy::send::WireSender;

use super::multicast::{get_primary_interface_ip, send_datagram};
use super::udp::bind_udp_socket;
use super::{key_or_not_found, mark_all_lost, release_link, LinkTable, Transport};

/// Receive slice so the reader observes shutdown promptly.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// RTPS message header length.
pub const RTPS_HEADER_LEN: usize = 20;

/// Protocol magic.
const RTPS_MAGIC: [u8; 4] = *b"RTPS";

/// Protocol version advertised in outgoing headers (RTPS 2.5).
const RTPS_VERSION: [u8; 2] = [2, 5];

/// Vendor id stamped into outgoing headers.
const RTPS_VENDOR_ID: [u8; 2] = [0x01, 0x42];

// ============================================================================
// Header codec
// ============================================================================

/// Prepend the RTPS message header to a payload.
fn encode_header(guid_prefix: &[u8; 12], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RTPS_HEADER_LEN + payload.len());
    out.extend_from_slice(&RTPS_MAGIC);
    out.extend_from_slice(&RTPS_VERSION);
    out.extend_from_slice(&RTPS_VENDOR_ID);
    out.extend_from_slice(guid_prefix);
    out.extend_from_slice(payload);
    out
}

/// Validate an inbound datagram and split off the source GUID prefix.
fn decode_header(datagram: &[u8]) -> Option<([u8; 12], &[u8])> {
    if datagram.len() < RTPS_HEADER_LEN || datagram[0..4] != RTPS_MAGIC {
        return None;
    }
    let mut prefix = [0u8; 12];
    prefix.copy_from_slice(&datagram[8..20]);
    Some((prefix, &datagram[RTPS_HEADER_LEN..]))
}

// ============================================================================
// Wire sender
// ============================================================================

struct RtpsUdpWireSender {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    guid_prefix: [u8; 12],
    max_message_size: usize,
}

impl WireSender for RtpsUdpWireSender {
    fn send_bytes(&self, bufs: &[IoSlice<'_>], _backpressure: &mut bool) -> io::Result<usize> {
        send_datagram(&self.socket, bufs, self.dest, self.max_message_size, "RTPS")
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        encode_header(&self.guid_prefix, payload)
    }
}

// ============================================================================
// RtpsUdpTransport
// ============================================================================

/// RTPS/UDP connection manager.
pub struct RtpsUdpTransport {
    inst: TransportInst,
    local_addr: SocketAddr,
    guid_prefix: [u8; 12],
    max_message_size: usize,
    socket: Arc<UdpSocket>,
    links: LinkTable,
    shutdown_flag: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl RtpsUdpTransport {
    /// Open the socket (RTPS port mapping by default) and start the
    /// receiver.
    pub fn new(inst: &TransportInst) -> Result<Arc<Self>> {
        let cfg = inst.rtps_udp()?.clone();

        let bind_addr = match cfg.local_addr {
            Some(addr) => addr,
            None => {
                let mapping = PortMapping::calculate(cfg.domain_id, cfg.participant_id)?;
                SocketAddr::from(([0, 0, 0, 0], mapping.user_unicast))
            }
        };
        let socket = bind_udp_socket(bind_addr)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        let mut local_addr = socket.local_addr()?;
        if local_addr.ip().is_unspecified() {
            local_addr.set_ip(get_primary_interface_ip().into());
        }

        let transport = Arc::new(Self {
            inst: inst.clone(),
            local_addr,
            guid_prefix: cfg.guid_prefix,
            max_message_size: cfg.max_message_size,
            socket: Arc::new(socket),
            links: LinkTable::new(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let handle = spawn_receiver(&transport)?;
        *transport.receiver.lock() = Some(handle);

        log::debug!(
            "[RTPS] '{}' bound to {} prefix={:02x?}",
            inst.name,
            transport.local_addr,
            &cfg.guid_prefix[..4]
        );
        Ok(transport)
    }

    /// Address this instance advertises in locators.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn spawn_receiver(transport: &Arc<RtpsUdpTransport>) -> Result<JoinHandle<()>> {
    let weak = Arc::downgrade(transport);
    let socket = Arc::clone(&transport.socket);
    let shutdown = Arc::clone(&transport.shutdown_flag);
    let max = transport.max_message_size;

    thread::Builder::new()
        .name("rdds-rtps-recv".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; max];
            while !shutdown.load(Ordering::Acquire) {
                match socket.recv_from(&mut buf) {
                    Ok((n, src)) => {
                        let Some((prefix, payload)) = decode_header(&buf[..n]) else {
                            log::debug!("[RTPS] {} bytes from {} without RTPS header", n, src);
                            continue;
                        };
                        let Some(transport) = weak.upgrade() else { break };
                        let key = RemoteAddress::RtpsUdp(src);
                        if let Some(link) = transport.links.get(&key) {
                            link.receive_strategy().deliver(&ReceivedDataSample {
                                remote: key,
                                source_prefix: Some(prefix),
                                payload: payload.to_vec(),
                            });
                        } else {
                            log::debug!(
                                "[RTPS] message from unassociated peer {} prefix={:02x?}",
                                src,
                                &prefix[..4]
                            );
                        }
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::TimedOut => {}
                    Err(err) => {
                        if !shutdown.load(Ordering::Acquire) {
                            log::warn!("[RTPS] receive failed: {}", err);
                        }
                        break;
                    }
                }
            }
        })
        .map_err(|err| TransportError::UnableToCreate(format!("rtps receiver: {}", err)))
}

impl Transport for RtpsUdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::RtpsUdp
    }

    fn inst(&self) -> &TransportInst {
        &self.inst
    }

    fn blob_to_key(&self, blob: &LocatorBlob) -> Option<RemoteAddress> {
        blob.decode_expecting(&[LOCATOR_KIND_RTPSUDPV4])
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
        let dest = match key.socket_addr() {
            Some(addr) => addr,
            None => {
                return Err(TransportError::MiscProblem(format!(
                    "rtps key {} has no socket address",
                    key
                )));
            }
        };

        let (link, created) = self.links.find_or_bind(key.clone(), || DataLink::new(key.clone()));
        if created {
            let wire = Arc::new(RtpsUdpWireSender {
                socket: Arc::clone(&self.socket),
                dest,
                guid_prefix: self.guid_prefix,
                max_message_size: self.max_message_size,
            });
            if let Err(err) = link.connect(wire, None) {
                release_link(&self.links, &link);
                return Err(err);
            }
        }
        Ok(link)
    }

    fn accept_datalink(&self, blob: &LocatorBlob, _timeout: Duration) -> Result<Arc<DataLink>> {
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
        log::debug!("[RTPS] '{}' shut down", self.inst.name);
    }

    fn local_locator(&self) -> LocatorBlob {
        RemoteAddress::RtpsUdp(self.local_addr).to_blob()
    }
}

impl Drop for RtpsUdpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Tests
// ============================================================================
