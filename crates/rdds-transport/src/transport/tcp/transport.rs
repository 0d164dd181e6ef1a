// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Connection-oriented TCP transport.
//!
//! The only transport in this crate with real backpressure: the wire
//! sender writes its non-blocking socket directly, reports `WouldBlock`
//! upward, and the link's drain worker polls the fd for writability
//! bounded by `max_output_pause_period`.
//!
//! Establishment is symmetric by advertised listen address: the active
//! side connects and sends its own locator blob as the first frame; the
//! passive side parks the identified connection until `accept_datalink`
//! claims it. Both sides therefore key the same link by the same address.

use std::io::{self, IoSlice, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{unbounded, Sender};
use mio::Waker;
use parking_lot::Mutex;

use crate::config::{TcpInst, TransportInst, TransportKind};
use crate::error::{Result, TransportError};
use crate::link::DataLink;
use crate::locator::{LocatorBlob, RemoteAddress, LOCATOR_KIND_TCPV4};
use crate::strategy::send::WireSender;

use super::super::multicast::get_primary_interface_ip;
use super::super::{key_or_not_found, mark_all_lost, release_link, LinkTable, Transport};
use super::frame::FrameCodec;
use super::reactor::{PendingPool, Reactor, ReactorCmd};

// ============================================================================
// Wire sender
// ============================================================================

struct TcpWireSender {
    stream: Arc<TcpStream>,
}

impl WireSender for TcpWireSender {
    fn send_bytes(&self, bufs: &[IoSlice<'_>], backpressure: &mut bool) -> io::Result<usize> {
        match (&*self.stream).write_vectored(bufs) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                *backpressure = true;
                Ok(0)
            }
            Err(err) => Err(err),
        }
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        FrameCodec::encode(payload)
    }

    fn handle(&self) -> Option<i32> {
        Some(self.stream.as_raw_fd())
    }
}

// ============================================================================
// TcpTransport
// ============================================================================

/// TCP connection manager.
pub struct TcpTransport {
    inst: TransportInst,
    cfg: TcpInst,
    public_addr: SocketAddr,
    links: LinkTable,
    pending: Arc<PendingPool>,
    cmd_tx: Sender<ReactorCmd>,
    waker: Arc<Waker>,
    reactor: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl TcpTransport {
    /// Bind the acceptor, start the reactor, and advertise the public
    /// address.
    ///
    /// Failures roll back automatically: the listener and poll close on
    /// drop and no thread outlives an error return.
    pub fn new(inst: &TransportInst) -> Result<Arc<Self>> {
        let cfg = inst.tcp()?.clone();

        let listener = TcpListener::bind(cfg.listen_addr)?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;

        let public_addr = match cfg.public_addr {
            Some(addr) => addr,
            None => {
                let mut addr = bound;
                if addr.ip().is_unspecified() {
                    addr.set_ip(get_primary_interface_ip().into());
                }
                addr
            }
        };

        let pending = Arc::new(PendingPool::new());
        let (cmd_tx, cmd_rx) = unbounded();
        let (reactor, waker) =
            Reactor::new(listener, cmd_rx, Arc::clone(&pending), cfg.max_message_size)?;

        let handle = thread::Builder::new()
            .name("rdds-tcp-reactor".to_string())
            .spawn(move || reactor.run())
            .map_err(|err| TransportError::UnableToCreate(format!("tcp reactor: {}", err)))?;

        log::debug!(
            "[TCP] '{}' listening on {} (public {})",
            inst.name,
            bound,
            public_addr
        );

        Ok(Arc::new(Self {
            inst: inst.clone(),
            cfg,
            public_addr,
            links: LinkTable::new(),
            pending,
            cmd_tx,
            waker,
            reactor: Mutex::new(Some(handle)),
            shut_down: AtomicBool::new(false),
        }))
    }

    /// Address peers dial and see in locators.
    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Identified inbound connections not yet claimed.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn send_cmd(&self, cmd: ReactorCmd) {
        if self.cmd_tx.send(cmd).is_ok() {
            let _ = self.waker.wake();
        }
    }

    /// Active-side establishment: dial, identify, hand the socket to the
    /// reactor.
    fn connect_datalink(&self, link: &Arc<DataLink>, key: &RemoteAddress) -> Result<()> {
        let dest = key.socket_addr().ok_or_else(|| {
            TransportError::MiscProblem(format!("tcp key {} has no socket address", key))
        })?;

        link.mark_connecting();
        let mut stream = TcpStream::connect_timeout(&dest, self.cfg.connect_timeout)
            .map_err(|err| {
                TransportError::UnableToCreate(format!("connect to {} failed: {}", dest, err))
            })?;
        let _ = stream.set_nodelay(self.cfg.nodelay);

        // Identity frame first, while the socket is still blocking: the
        // peer keys the link by our advertised listen address.
        let identity = RemoteAddress::Tcp(self.public_addr).to_blob();
        stream
            .write_all(&FrameCodec::encode(identity.as_bytes()))
            .map_err(|err| {
                TransportError::UnableToCreate(format!("identity to {} failed: {}", dest, err))
            })?;
        stream.set_nonblocking(true)?;

        let stream = Arc::new(stream);
        let wire = Arc::new(TcpWireSender {
            stream: Arc::clone(&stream),
        });
        link.connect(wire, self.cfg.max_output_pause_period)?;

        self.send_cmd(ReactorCmd::Register {
            stream,
            remote: key.clone(),
            link: Arc::clone(link),
        });
        Ok(())
    }
}

impl Transport for TcpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn inst(&self) -> &TransportInst {
        &self.inst
    }

    fn blob_to_key(&self, blob: &LocatorBlob) -> Option<RemoteAddress> {
        blob.decode_expecting(&[LOCATOR_KIND_TCPV4])
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
            if let Err(err) = self.connect_datalink(&link, &key) {
                link.mark_lost();
                release_link(&self.links, &link);
                return Err(err);
            }
        } else if let Err(err) = link.wait_connected(self.cfg.connect_timeout) {
            // Found a link mid-handshake that never came up.
            release_link(&self.links, &link);
            return Err(err);
        }
        Ok(link)
    }

    fn accept_datalink(&self, blob: &LocatorBlob, timeout: Duration) -> Result<Arc<DataLink>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::MiscProblem("transport is shut down".into()));
        }
        // The instance's own bound caps the caller's patience.
        let timeout = timeout.min(self.cfg.accept_timeout);
        let key = key_or_not_found(self.kind(), self.blob_to_key(blob))?;

        // Already established (either side)?
        if let Some(link) = self.links.find(&key) {
            if let Err(err) = link.wait_connected(timeout) {
                release_link(&self.links, &link);
                return Err(err);
            }
            return Ok(link);
        }

        let Some(conn) = self.pending.claim(&key, timeout) else {
            return Err(TransportError::UnableToCreate(format!(
                "no inbound connection from {} within {:?}",
                key, timeout
            )));
        };
        log::debug!(
            "[TCP] claiming inbound conn {} from {} for {}",
            conn.conn_id,
            conn.peer_addr,
            key
        );

        let (link, created) = self.links.find_or_bind(key.clone(), || DataLink::new(key.clone()));
        if !created {
            // Lost a race against an active-side connect; keep the winner.
            self.send_cmd(ReactorCmd::CloseConn {
                conn_id: conn.conn_id,
            });
            if let Err(err) = link.wait_connected(timeout) {
                release_link(&self.links, &link);
                return Err(err);
            }
            return Ok(link);
        }

        let wire = Arc::new(TcpWireSender {
            stream: Arc::clone(&conn.stream),
        });
        if let Err(err) = link.connect(wire, self.cfg.max_output_pause_period) {
            self.send_cmd(ReactorCmd::CloseConn {
                conn_id: conn.conn_id,
            });
            link.mark_lost();
            release_link(&self.links, &link);
            return Err(err);
        }
        self.send_cmd(ReactorCmd::Bind {
            conn_id: conn.conn_id,
            link: Arc::clone(&link),
        });
        Ok(link)
    }

    fn release_datalink(&self, link: &Arc<DataLink>) {
        let remote = link.remote().clone();
        let before = self.links.len();
        release_link(&self.links, link);
        if self.links.len() < before {
            self.send_cmd(ReactorCmd::Deregister { remote });
        }
    }

    fn notify_lost_on_backpressure_timeout(&self) {
        mark_all_lost(&self.links);
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.send_cmd(ReactorCmd::Shutdown);
        if let Some(handle) = self.reactor.lock().take() {
            let _ = handle.join();
        }
        for link in self.links.drain() {
            link.transport_shutdown();
        }
        log::debug!("[TCP] '{}' shut down", self.inst.name);
    }

    fn local_locator(&self) -> LocatorBlob {
        RemoteAddress::Tcp(self.public_addr).to_blob()
    }
}

impl Drop for TcpTransport {
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
    use crate::config::InstConfig;
    use crate::link::{LinkState, SendStatus};
    use crate::sample::DataSampleElement;
    use crate::strategy::recv::{ReceiveListener, ReceivedDataSample};
    use std::sync::mpsc;

    fn inst(name: &str) -> TransportInst {
        TransportInst::new(
            name,
            InstConfig::Tcp(TcpInst {
                listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                connect_timeout: Duration::from_secs(2),
                accept_timeout: Duration::from_secs(2),
                ..Default::default()
            }),
        )
    }

    struct Tx(std::sync::Mutex<mpsc::Sender<Vec<u8>>>);
    impl ReceiveListener for Tx {
        fn deliver_sample(&self, sample: &ReceivedDataSample) {
            let _ = self.0.lock().unwrap().send(sample.payload.clone());
        }
    }

    #[test]
    fn test_connect_to_dead_peer_fails_bounded() {
        let transport = TcpTransport::new(&inst("tcp_dead")).unwrap();

        // A listener that is immediately dropped leaves a dead port.
        let dead_port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let blob = RemoteAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], dead_port))).to_blob();

        let start = std::time::Instant::now();
        let err = transport.find_or_create_datalink(&blob, true).unwrap_err();
        assert!(matches!(err, TransportError::UnableToCreate(_)));
        assert!(start.elapsed() < Duration::from_secs(5), "must not hang");

        // The failed link must not linger in the table.
        assert_eq!(transport.links.len(), 0);
        transport.shutdown();
    }

    #[test]
    fn test_active_passive_round_trip() {
        let a = TcpTransport::new(&inst("tcp_a")).unwrap();
        let b = TcpTransport::new(&inst("tcp_b")).unwrap();

        // Active side: a dials b.
        let link_ab = a.find_or_create_datalink(&b.local_locator(), true).unwrap();
        assert_eq!(link_ab.state(), LinkState::Connected);

        // Passive side: b claims the identified inbound connection.
        let link_ba = b
            .accept_datalink(&a.local_locator(), Duration::from_secs(2))
            .unwrap();
        assert_eq!(link_ba.state(), LinkState::Connected);

        let (tx, rx) = mpsc::channel();
        link_ba
            .receive_strategy()
            .add_listener([1u8; 16], Arc::new(Tx(std::sync::Mutex::new(tx))));

        let element = DataSampleElement::new(1, 0, b"over-tcp".to_vec());
        let status = link_ab.send(&element, None);
        assert!(matches!(status, SendStatus::Sent | SendStatus::Queued));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"over-tcp");

        // And the reverse direction over the same socket pair.
        let (tx2, rx2) = mpsc::channel();
        link_ab
            .receive_strategy()
            .add_listener([2u8; 16], Arc::new(Tx(std::sync::Mutex::new(tx2))));
        let element = DataSampleElement::new(2, 0, b"reply".to_vec());
        let status = link_ba.send(&element, None);
        assert!(matches!(status, SendStatus::Sent | SendStatus::Queued));
        assert_eq!(rx2.recv_timeout(Duration::from_secs(2)).unwrap(), b"reply");

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn test_accept_with_no_connector_times_out() {
        let transport = TcpTransport::new(&inst("tcp_lonely")).unwrap();
        let ghost = RemoteAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], 1))).to_blob();

        let start = std::time::Instant::now();
        let err = transport
            .accept_datalink(&ghost, Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, TransportError::UnableToCreate(_)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(5));
        transport.shutdown();
    }

    #[test]
    fn test_find_or_create_dedups() {
        let a = TcpTransport::new(&inst("tcp_dedup_a")).unwrap();
        let b = TcpTransport::new(&inst("tcp_dedup_b")).unwrap();

        let first = a.find_or_create_datalink(&b.local_locator(), true).unwrap();
        let second = a.find_or_create_datalink(&b.local_locator(), true).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.attachments(), 2);

        a.release_datalink(&second);
        a.release_datalink(&first);
        assert_eq!(first.state(), LinkState::Shutdown);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn test_peer_shutdown_marks_link_lost() {
        let a = TcpTransport::new(&inst("tcp_loss_a")).unwrap();
        let b = TcpTransport::new(&inst("tcp_loss_b")).unwrap();

        let link = a.find_or_create_datalink(&b.local_locator(), true).unwrap();
        assert_eq!(link.state(), LinkState::Connected);

        // Take b down; a's reactor sees EOF and declares the link lost.
        b.shutdown();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while link.state() != LinkState::Lost && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(link.state(), LinkState::Lost);

        let element = DataSampleElement::new(9, 0, b"x".to_vec());
        assert_eq!(link.send(&element, None), SendStatus::Rejected);

        a.shutdown();
    }
}
