// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Connectionless UDP unicast transport.
//!
//! One socket per instance, shared by sends and the receiver thread.
//! Inbound datagrams demux to links by source address, so the socket binds
//! the configured local address and every send leaves from it -- the
//! address a peer observes is the address this instance advertises.
//!
//! Backpressure is structurally impossible on this transport: the wire
//! sender never sets the flag and no pause timeout is ever armed.

use std::io;
use std::io::IoSlice;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{TransportInst, TransportKind};
use crate::error::{Result, TransportError};
use crate::link::DataLink;
use crate::locator::{LocatorBlob, RemoteAddress, LOCATOR_KIND_UDPV4};
use crate::strategy::recv::ReceivedDataSample;
use crate::strategy::send::WireSender;

use super::multicast::{get_primary_interface_ip, send_datagram};
use super::{key_or_not_found, mark_all_lost, release_link, LinkTable, Transport};

/// Receive slice so the reader observes shutdown promptly.
const RECV_TIMEOUT: Duration = Duration::from_millis(100);

// ============================================================================
// Socket construction
// ============================================================================

/// Build a bound, reuse-enabled UDP socket.
///
/// `RDDS_REUSEPORT=1` additionally sets SO_REUSEPORT for multi-process
/// setups sharing a port on one machine.
pub(crate) fn bind_udp_socket(local_addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = if local_addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let raw = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    raw.set_reuse_address(true)?;

    #[cfg(unix)]
    if std::env::var("RDDS_REUSEPORT").map(|v| v == "1").unwrap_or(false) {
        set_reuseport(&raw)?;
        log::info!("[UDP] SO_REUSEPORT enabled via RDDS_REUSEPORT=1");
    }

    raw.bind(&local_addr.into())?;
    Ok(raw.into())
}

/// Set SO_REUSEPORT for multi-process port sharing.
#[cfg(unix)]
fn set_reuseport(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with a valid fd, standard socket option, and a
    // correctly sized optval pointer.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            std::ptr::addr_of!(optval).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

// ============================================================================
// Wire sender
// ============================================================================

struct UdpWireSender {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    max_message_size: usize,
}

impl WireSender for UdpWireSender {
    fn send_bytes(&self, bufs: &[IoSlice<'_>], _backpressure: &mut bool) -> io::Result<usize> {
        send_datagram(&self.socket, bufs, self.dest, self.max_message_size, "UDP")
    }
}

// ============================================================================
// UdpTransport
// ============================================================================

/// UDP unicast connection manager.
pub struct UdpTransport {
    inst: TransportInst,
    local_addr: SocketAddr,
    max_message_size: usize,
    socket: Arc<UdpSocket>,
    links: LinkTable,
    shutdown_flag: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("inst", &self.inst.name)
            .field("local_addr", &self.local_addr)
            .field("max_message_size", &self.max_message_size)
            .finish_non_exhaustive()
    }
}

impl UdpTransport {
    /// Open the socket and start the receiver.
    ///
    /// Failures roll back automatically (the socket closes on drop);
    /// partial state never persists.
    pub fn new(inst: &TransportInst) -> Result<Arc<Self>> {
        let cfg = inst.udp()?.clone();

        let socket = bind_udp_socket(cfg.local_addr)?;
        if let Some(bytes) = cfg.rcvbuf_bytes {
            let raw = socket2::SockRef::from(&socket);
            if let Err(err) = raw.set_recv_buffer_size(bytes) {
                log::debug!("[UDP] SO_RCVBUF {} not applied: {}", bytes, err);
            }
        }
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        let mut local_addr = socket.local_addr()?;
        if local_addr.ip().is_unspecified() {
            // Advertise a routable address instead of 0.0.0.0.
            local_addr.set_ip(get_primary_interface_ip().into());
        }

        let transport = Arc::new(Self {
            inst: inst.clone(),
            local_addr,
            max_message_size: cfg.max_message_size,
            socket: Arc::new(socket),
            links: LinkTable::new(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let handle = spawn_receiver(&transport)?;
        *transport.receiver.lock() = Some(handle);

        log::debug!("[UDP] '{}' bound to {}", inst.name, transport.local_addr);
        Ok(transport)
    }

    /// Address this instance advertises in locators.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn spawn_receiver(transport: &Arc<UdpTransport>) -> Result<JoinHandle<()>> {
    let weak = Arc::downgrade(transport);
    let socket = Arc::clone(&transport.socket);
    let shutdown = Arc::clone(&transport.shutdown_flag);
    let max = transport.max_message_size;

    thread::Builder::new()
        .name("rdds-udp-recv".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; max];
            while !shutdown.load(Ordering::Acquire) {
                match socket.recv_from(&mut buf) {
                    Ok((n, src)) => {
                        let Some(transport) = weak.upgrade() else { break };
                        let key = RemoteAddress::Udp(src);
                        if let Some(link) = transport.links.get(&key) {
                            link.receive_strategy().deliver(&ReceivedDataSample {
                                remote: key,
                                source_prefix: None,
                                payload: buf[..n].to_vec(),
                            });
                        } else {
                            log::debug!("[UDP] {} bytes from unassociated peer {}", n, src);
                        }
                    }
                    Err(err)
                        if err.kind() == io::ErrorKind::WouldBlock
                            || err.kind() == io::ErrorKind::TimedOut => {}
                    Err(err) => {
                        if !shutdown.load(Ordering::Acquire) {
                            log::warn!("[UDP] receive failed: {}", err);
                        }
                        break;
                    }
                }
            }
        })
        .map_err(|err| TransportError::UnableToCreate(format!("udp receiver: {}", err)))
}

impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn inst(&self) -> &TransportInst {
        &self.inst
    }

    fn blob_to_key(&self, blob: &LocatorBlob) -> Option<RemoteAddress> {
        blob.decode_expecting(&[LOCATOR_KIND_UDPV4])
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
                    "udp key {} has no socket address",
                    key
                )));
            }
        };

        let (link, created) = self.links.find_or_bind(key.clone(), || DataLink::new(key.clone()));
        if created {
            let wire = Arc::new(UdpWireSender {
                socket: Arc::clone(&self.socket),
                dest,
                max_message_size: self.max_message_size,
            });
            // Connectionless: no handshake, straight to Connected, and no
            // pause period because backpressure cannot happen.
            if let Err(err) = link.connect(wire, None) {
                release_link(&self.links, &link);
                return Err(err);
            }
        }
        Ok(link)
    }

    fn accept_datalink(&self, blob: &LocatorBlob, _timeout: Duration) -> Result<Arc<DataLink>> {
        // No passive side on a connectionless transport.
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
        log::debug!("[UDP] '{}' shut down", self.inst.name);
    }

    fn local_locator(&self) -> LocatorBlob {
        RemoteAddress::Udp(self.local_addr).to_blob()
    }
}

impl Drop for UdpTransport {
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
    use crate::config::{InstConfig, UdpInst};
    use crate::link::LinkState;

    fn loopback_inst(name: &str) -> TransportInst {
        TransportInst::new(
            name,
            InstConfig::Udp(UdpInst {
                local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn test_rejects_wrong_kind_inst() {
        let inst = TransportInst::new("t", InstConfig::Tcp(crate::config::TcpInst::default()));
        let err = UdpTransport::new(&inst).unwrap_err();
        assert!(matches!(err, TransportError::ConfigurationConflict(_)));
    }

    #[test]
    fn test_find_or_create_dedups_and_counts() {
        let transport = UdpTransport::new(&loopback_inst("udp_a")).unwrap();
        let peer = RemoteAddress::Udp(SocketAddr::from(([127, 0, 0, 1], 34567))).to_blob();

        let a = transport.find_or_create_datalink(&peer, true).unwrap();
        assert_eq!(a.state(), LinkState::Connected);
        assert_eq!(a.attachments(), 1);

        let b = transport.find_or_create_datalink(&peer, true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.attachments(), 2);

        transport.release_datalink(&b);
        transport.release_datalink(&a);
        assert_eq!(a.state(), LinkState::Shutdown);
        transport.shutdown();
    }

    #[test]
    fn test_foreign_blob_not_found() {
        let transport = UdpTransport::new(&loopback_inst("udp_b")).unwrap();
        let tcp_blob = RemoteAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], 1))).to_blob();

        assert!(transport.blob_to_key(&tcp_blob).is_none());
        let err = transport.find_or_create_datalink(&tcp_blob, true).unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
        transport.shutdown();
    }

    #[test]
    fn test_two_instances_round_trip() {
        use std::sync::mpsc;
        use crate::strategy::recv::{ReceiveListener, ReceivedDataSample};

        let a = UdpTransport::new(&loopback_inst("udp_rt_a")).unwrap();
        let b = UdpTransport::new(&loopback_inst("udp_rt_b")).unwrap();

        // a associates toward b and vice versa, by advertised locator.
        let link_ab = a.find_or_create_datalink(&b.local_locator(), true).unwrap();
        let link_ba = b
            .find_or_create_datalink(&a.local_locator(), false)
            .unwrap();

        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        struct Tx(std::sync::Mutex<mpsc::Sender<Vec<u8>>>);
        impl ReceiveListener for Tx {
            fn deliver_sample(&self, sample: &ReceivedDataSample) {
                let _ = self.0.lock().unwrap().send(sample.payload.clone());
            }
        }
        link_ba
            .receive_strategy()
            .add_listener([9u8; 16], Arc::new(Tx(std::sync::Mutex::new(tx))));

        let element = crate::sample::DataSampleElement::new(1, 0, b"ping".to_vec());
        assert_eq!(link_ab.send(&element, None), crate::link::SendStatus::Sent);

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, b"ping");

        a.shutdown();
        b.shutdown();
        let _ = link_ba;
    }

    #[test]
    fn test_shutdown_idempotent_and_blocks_creates() {
        let transport = UdpTransport::new(&loopback_inst("udp_c")).unwrap();
        transport.shutdown();
        transport.shutdown();

        let peer = RemoteAddress::Udp(SocketAddr::from(([127, 0, 0, 1], 9))).to_blob();
        assert!(transport.find_or_create_datalink(&peer, true).is_err());
    }
}
