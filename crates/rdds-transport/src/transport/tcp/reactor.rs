// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! mio poll loop for the TCP transport.
//!
//! The reactor owns every inbound byte: it accepts connections, reads and
//! reassembles frames, and routes them to the bound link's receive
//! strategy. Writes stay out of the reactor -- each link's send strategy
//! writes its (non-blocking) socket directly and handles backpressure via
//! fd polling, so the reactor registers sockets for readability only.
//!
//! # Inbound identity handshake
//!
//! The first frame on every accepted connection is the initiator's own
//! advertised locator blob. Once it arrives, the connection parks in the
//! shared [`PendingPool`] until a passive-side `accept_datalink` claims it
//! (frames arriving in between are buffered in order). Outbound
//! connections send that frame right after `connect`, so both sides key
//! the link by the same address.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, TryRecvError};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::{Condvar, Mutex};

use crate::link::DataLink;
use crate::locator::{LocatorBlob, RemoteAddress, LOCATOR_KIND_TCPV4};
use crate::strategy::recv::ReceivedDataSample;

use super::frame::FrameCodec;

/// Token for the listener.
pub(super) const LISTENER_TOKEN: Token = Token(0);

/// Token for the waker (command channel).
pub(super) const WAKER_TOKEN: Token = Token(1);

/// First token handed to connections.
const CONNECTION_TOKEN_START: usize = 2;

/// Poll timeout; bounds shutdown latency.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Events processed per poll.
const MAX_EVENTS: usize = 128;

/// Frames buffered on an unclaimed inbound connection before it is
/// declared abusive and dropped.
const MAX_PENDING_FRAMES: usize = 1024;

/// Read chunk size.
const READ_BUF_LEN: usize = 64 * 1024;

// ============================================================================
// Commands
// ============================================================================

/// Commands sent from the transport to the reactor.
pub(super) enum ReactorCmd {
    /// Watch an established outbound connection for inbound frames.
    Register {
        stream: Arc<TcpStream>,
        remote: RemoteAddress,
        link: Arc<DataLink>,
    },

    /// Attach a claimed pending connection to its new link.
    Bind {
        conn_id: u64,
        link: Arc<DataLink>,
    },

    /// Discard a pending connection that lost a claim race.
    CloseConn { conn_id: u64 },

    /// Stop watching the connection bound to this remote.
    Deregister { remote: RemoteAddress },

    /// Stop the reactor.
    Shutdown,
}

// ============================================================================
// Pending pool
// ============================================================================

/// An accepted connection whose initiator identified itself, waiting for a
/// passive-side claim.
pub(super) struct PendingConn {
    pub conn_id: u64,
    pub stream: Arc<TcpStream>,
    pub peer_addr: SocketAddr,
}

/// Shared pool of identified-but-unclaimed inbound connections.
#[derive(Default)]
pub(super) struct PendingPool {
    pool: Mutex<HashMap<RemoteAddress, PendingConn>>,
    arrived: Condvar,
}

impl PendingPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an identified connection; wakes any `accept_datalink` waiter.
    fn insert(&self, remote: RemoteAddress, conn: PendingConn) {
        let mut pool = self.pool.lock();
        if let Some(stale) = pool.insert(remote.clone(), conn) {
            log::debug!(
                "[TCP] replacing stale pending connection {} for {}",
                stale.conn_id,
                remote
            );
        }
        self.arrived.notify_all();
    }

    /// Drop a parked connection (reactor saw EOF before any claim).
    fn remove_by_id(&self, conn_id: u64) {
        self.pool.lock().retain(|_, conn| conn.conn_id != conn_id);
    }

    /// Claim the parked connection for `remote`, waiting up to `timeout`.
    pub fn claim(&self, remote: &RemoteAddress, timeout: Duration) -> Option<PendingConn> {
        let deadline = Instant::now() + timeout;
        let mut pool = self.pool.lock();
        loop {
            if let Some(conn) = pool.remove(remote) {
                return Some(conn);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.arrived.wait_for(&mut pool, deadline - now);
        }
    }

    /// Parked connection count.
    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }
}

// ============================================================================
// Reactor
// ============================================================================

enum ConnPhase {
    /// Inbound, first (identity) frame not yet received.
    AwaitIdentity,

    /// Identified, parked in the pending pool, buffering data frames.
    Pending {
        remote: RemoteAddress,
        buffered: Vec<Vec<u8>>,
    },

    /// Routed to a link.
    Bound {
        remote: RemoteAddress,
        link: Arc<DataLink>,
    },
}

struct Conn {
    stream: Arc<TcpStream>,
    codec: FrameCodec,
    peer_addr: SocketAddr,
    conn_id: u64,
    phase: ConnPhase,
}

/// The poll loop state. Runs on a dedicated thread until `Shutdown`.
pub(super) struct Reactor {
    poll: Poll,
    listener: TcpListener,
    cmd_rx: Receiver<ReactorCmd>,
    pending: Arc<PendingPool>,
    conns: HashMap<Token, Conn>,
    conn_tokens: HashMap<u64, Token>,
    next_token: usize,
    max_message_size: usize,
    running: bool,
}

impl Reactor {
    /// Build the reactor and its waker. The listener must already be
    /// non-blocking.
    pub fn new(
        listener: TcpListener,
        cmd_rx: Receiver<ReactorCmd>,
        pending: Arc<PendingPool>,
        max_message_size: usize,
    ) -> io::Result<(Self, Arc<Waker>)> {
        let poll = Poll::new()?;
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok((
            Self {
                poll,
                listener,
                cmd_rx,
                pending,
                conns: HashMap::new(),
                conn_tokens: HashMap::new(),
                next_token: CONNECTION_TOKEN_START,
                max_message_size,
                running: true,
            },
            waker,
        ))
    }

    /// Run until shutdown.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        let mut read_buf = vec![0u8; READ_BUF_LEN];

        while self.running {
            if let Err(err) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("[TCP] reactor poll failed: {}", err);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.handle_accept(),
                    WAKER_TOKEN => self.handle_commands(),
                    token => {
                        if event.is_readable() || event.is_read_closed() {
                            self.handle_readable(token, &mut read_buf);
                        }
                    }
                }
            }
            // Commands may arrive without a wake racing the poll timeout.
            self.handle_commands();
        }

        // Teardown: drop every watched connection.
        let tokens: Vec<Token> = self.conns.keys().copied().collect();
        for token in tokens {
            self.drop_conn(token, "reactor shutdown");
        }
        log::debug!("[TCP] reactor stopped");
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    // ========================================================================
    // Accept
    // ========================================================================

    fn handle_accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        log::warn!("[TCP] accepted {} unusable: {}", peer_addr, err);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);

                    let token = self.alloc_token();
                    let conn_id = token.0 as u64;
                    let stream = Arc::new(stream);

                    if let Err(err) = self.poll.registry().register(
                        &mut SourceFd(&stream.as_raw_fd()),
                        token,
                        Interest::READABLE,
                    ) {
                        log::warn!("[TCP] register accepted {} failed: {}", peer_addr, err);
                        continue;
                    }

                    log::debug!("[TCP] accepted {} (conn {})", peer_addr, conn_id);
                    self.conn_tokens.insert(conn_id, token);
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            codec: FrameCodec::new(self.max_message_size),
                            peer_addr,
                            conn_id,
                            phase: ConnPhase::AwaitIdentity,
                        },
                    );
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("[TCP] accept failed: {}", err);
                    break;
                }
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    fn handle_commands(&mut self) {
        loop {
            match self.cmd_rx.try_recv() {
                Ok(ReactorCmd::Register {
                    stream,
                    remote,
                    link,
                }) => self.handle_register(stream, remote, link),
                Ok(ReactorCmd::Bind { conn_id, link }) => self.handle_bind(conn_id, link),
                Ok(ReactorCmd::CloseConn { conn_id }) => {
                    if let Some(token) = self.conn_tokens.get(&conn_id).copied() {
                        self.drop_conn(token, "claim race loser");
                    }
                }
                Ok(ReactorCmd::Deregister { remote }) => self.handle_deregister(&remote),
                Ok(ReactorCmd::Shutdown) | Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    return;
                }
                Err(TryRecvError::Empty) => return,
            }
        }
    }

    fn handle_register(
        &mut self,
        stream: Arc<TcpStream>,
        remote: RemoteAddress,
        link: Arc<DataLink>,
    ) {
        let token = self.alloc_token();
        let conn_id = token.0 as u64;
        let peer_addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(err) => {
                // The connection died between establishment and
                // registration; the link goes lost right away.
                log::debug!("[TCP] outbound {} dead before watch: {}", remote, err);
                link.mark_lost();
                return;
            }
        };

        if let Err(err) = self.poll.registry().register(
            &mut SourceFd(&stream.as_raw_fd()),
            token,
            Interest::READABLE,
        ) {
            log::warn!("[TCP] register outbound {} failed: {}", remote, err);
            link.mark_lost();
            return;
        }

        self.conn_tokens.insert(conn_id, token);
        self.conns.insert(
            token,
            Conn {
                stream,
                codec: FrameCodec::new(self.max_message_size),
                peer_addr,
                conn_id,
                phase: ConnPhase::Bound { remote, link },
            },
        );
    }

    fn handle_bind(&mut self, conn_id: u64, link: Arc<DataLink>) {
        let Some(token) = self.conn_tokens.get(&conn_id).copied() else {
            // EOF beat the claim; the link will see loss on first send.
            log::debug!("[TCP] bind for vanished conn {}", conn_id);
            link.mark_lost();
            return;
        };
        let Some(conn) = self.conns.get_mut(&token) else {
            link.mark_lost();
            return;
        };

        let old = std::mem::replace(
            &mut conn.phase,
            ConnPhase::AwaitIdentity, // placeholder, replaced below
        );
        match old {
            ConnPhase::Pending { remote, buffered } => {
                // Flush frames that arrived between identity and claim,
                // preserving order ahead of anything still unread.
                for payload in buffered {
                    link.receive_strategy().deliver(&ReceivedDataSample {
                        remote: remote.clone(),
                        source_prefix: None,
                        payload,
                    });
                }
                conn.phase = ConnPhase::Bound { remote, link };
            }
            other => {
                log::warn!("[TCP] bind for conn {} in unexpected phase", conn_id);
                conn.phase = other;
            }
        }
    }

    fn handle_deregister(&mut self, remote: &RemoteAddress) {
        let found = self.conns.iter().find_map(|(token, conn)| match &conn.phase {
            ConnPhase::Bound { remote: bound, .. } if bound == remote => Some(*token),
            _ => None,
        });
        if let Some(token) = found {
            self.drop_conn(token, "link released");
        }
    }

    // ========================================================================
    // Read path
    // ========================================================================

    fn handle_readable(&mut self, token: Token, read_buf: &mut [u8]) {
        // Read everything available into the codec, remembering whether the
        // wire died; teardown runs after the connection borrow ends.
        let lost: Option<String> = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return;
            };
            let mut lost = None;
            loop {
                match (&*conn.stream).read(read_buf) {
                    Ok(0) => {
                        lost = Some("closed by peer".to_string());
                        break;
                    }
                    Ok(n) => conn.codec.feed(&read_buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        lost = Some(format!("read error: {}", err));
                        break;
                    }
                }
            }
            lost
        };

        loop {
            let decoded = match self.conns.get_mut(&token) {
                Some(conn) => conn.codec.decode_buffered(),
                None => return,
            };
            match decoded {
                Ok(Some(frame)) => {
                    if !self.route_frame(token, frame) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.conn_lost(token, &format!("protocol error: {}", err));
                    return;
                }
            }
        }

        if let Some(reason) = lost {
            self.conn_lost(token, &reason);
        }
    }

    /// Route one decoded frame according to the connection phase.
    ///
    /// Returns false when the connection was dropped.
    fn route_frame(&mut self, token: Token, frame: Vec<u8>) -> bool {
        let drop_reason: Option<String> = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return false;
            };
            match &mut conn.phase {
                ConnPhase::AwaitIdentity => {
                    let blob = LocatorBlob::from_bytes(frame);
                    match blob.decode_expecting(&[LOCATOR_KIND_TCPV4]) {
                        Some(remote) => {
                            log::debug!(
                                "[TCP] conn {} from {} identified as {}",
                                conn.conn_id,
                                conn.peer_addr,
                                remote
                            );
                            self.pending.insert(
                                remote.clone(),
                                PendingConn {
                                    conn_id: conn.conn_id,
                                    stream: Arc::clone(&conn.stream),
                                    peer_addr: conn.peer_addr,
                                },
                            );
                            conn.phase = ConnPhase::Pending {
                                remote,
                                buffered: Vec::new(),
                            };
                            None
                        }
                        None => Some(format!("invalid identity frame from {}", conn.peer_addr)),
                    }
                }
                ConnPhase::Pending { buffered, .. } => {
                    if buffered.len() >= MAX_PENDING_FRAMES {
                        Some(format!("pending buffer overflow from {}", conn.peer_addr))
                    } else {
                        buffered.push(frame);
                        None
                    }
                }
                ConnPhase::Bound { remote, link } => {
                    link.receive_strategy().deliver(&ReceivedDataSample {
                        remote: remote.clone(),
                        source_prefix: None,
                        payload: frame,
                    });
                    None
                }
            }
        };

        match drop_reason {
            Some(reason) => {
                self.drop_conn(token, &reason);
                false
            }
            None => true,
        }
    }

    // ========================================================================
    // Teardown helpers
    // ========================================================================

    /// Wire-level loss: drop the connection and take the bound link down.
    fn conn_lost(&mut self, token: Token, reason: &str) {
        let link = match self.conns.get(&token) {
            Some(Conn {
                phase: ConnPhase::Bound { link, .. },
                ..
            }) => Some(Arc::clone(link)),
            _ => None,
        };
        self.drop_conn(token, reason);
        if let Some(link) = link {
            link.mark_lost();
        }
    }

    /// Remove a connection from the poll and every index.
    fn drop_conn(&mut self, token: Token, reason: &str) {
        if let Some(conn) = self.conns.remove(&token) {
            let _ = self
                .poll
                .registry()
                .deregister(&mut SourceFd(&conn.stream.as_raw_fd()));
            self.conn_tokens.remove(&conn.conn_id);
            if matches!(conn.phase, ConnPhase::Pending { .. } | ConnPhase::AwaitIdentity) {
                self.pending.remove_by_id(conn.conn_id);
            }
            log::debug!(
                "[TCP] conn {} to {} dropped: {}",
                conn.conn_id,
                conn.peer_addr,
                reason
            );
        }
    }
}
