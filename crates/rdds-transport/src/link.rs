// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! DataLink: one logical connection to one remote peer.
//!
//! A link is owned by its transport's link table and borrowed (attachment
//! counted) by every client association that uses it. The state machine:
//!
//! ```text
//!      +---------+
//!      | Created |
//!      +----+----+
//!           | mark_connecting() (connection-oriented handshake)
//!           v
//!     +------------+
//!     | Connecting |
//!     +----+-------+
//!           | connect()              (connectionless: Created -> Connected)
//!           v
//!     +-----------+  partial write  +--------------+
//!     | Connected |<--------------->| Backpressure |
//!     +----+------+   drain done    +------+-------+
//!          | transport_shutdown()          | pause period expired
//!          v                               v
//!     +----------+                      +------+
//!     | Shutdown |<---------------------| Lost |
//!     +----------+  transport_shutdown  +------+
//! ```
//!
//! Shutdown nulls the owned strategy under the state lock, so an in-flight
//! send observes a defined rejection instead of touching freed resources.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TransportError};
use crate::locator::RemoteAddress;
use crate::sample::{DataSampleElement, Guid};
use crate::strategy::recv::ReceiveStrategy;
use crate::strategy::send::{
    SendListener, SendOutcome, SendStrategy, SendStrategyEvents, WireSender,
};
use crate::synch::ThreadSynchResource;

// ============================================================================
// State
// ============================================================================

/// Link lifecycle states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LinkState {
    /// Allocated, not yet wired to a strategy.
    #[default]
    Created,

    /// Connection-oriented handshake in progress.
    Connecting,

    /// Operational.
    Connected,

    /// Transiently unable to accept more outbound data.
    Backpressure,

    /// Declared dead (backpressure timeout or wire failure).
    Lost,

    /// Terminal: resources released.
    Shutdown,
}

impl LinkState {
    /// True when sends may be handed to the strategy.
    pub fn can_send(&self) -> bool {
        matches!(self, LinkState::Connected | LinkState::Backpressure)
    }

    /// True for terminal states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Lost | LinkState::Shutdown)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkState::Created => "Created",
            LinkState::Connecting => "Connecting",
            LinkState::Connected => "Connected",
            LinkState::Backpressure => "Backpressure",
            LinkState::Lost => "Lost",
            LinkState::Shutdown => "Shutdown",
        };
        write!(f, "{}", s)
    }
}

/// Result of handing one sample to a link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    /// Transmitted synchronously.
    Sent,

    /// Queued behind backpressure.
    Queued,

    /// Refused: the link is lost, shut down, or not yet connected.
    Rejected,
}

/// Observer registered by a client association; notified when the link is
/// declared lost.
pub trait LinkObserver: Send + Sync {
    /// The link to `remote` is gone; associations over it are dead.
    fn on_link_lost(&self, remote: &RemoteAddress);
}

// ============================================================================
// DataLink
// ============================================================================

struct LinkCore {
    state: LinkState,
    strategy: Option<Arc<SendStrategy>>,
}

/// One logical connection between a local transport instance and a remote
/// peer.
pub struct DataLink {
    remote: RemoteAddress,
    attachments: AtomicUsize,
    core: Mutex<LinkCore>,
    state_changed: Condvar,
    receive: ReceiveStrategy,
    observers: Mutex<Vec<(Guid, Arc<dyn LinkObserver>)>>,
}

impl DataLink {
    /// Allocate a link in `Created` state.
    pub fn new(remote: RemoteAddress) -> Arc<Self> {
        Arc::new(Self {
            remote,
            attachments: AtomicUsize::new(0),
            core: Mutex::new(LinkCore {
                state: LinkState::Created,
                strategy: None,
            }),
            state_changed: Condvar::new(),
            receive: ReceiveStrategy::new(),
            observers: Mutex::new(Vec::new()),
        })
    }

    /// Remote endpoint key.
    pub fn remote(&self) -> &RemoteAddress {
        &self.remote
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LinkState {
        self.core.lock().state
    }

    /// Inbound side of the link.
    pub fn receive_strategy(&self) -> &ReceiveStrategy {
        &self.receive
    }

    // ========================================================================
    // Attachment counting
    // ========================================================================

    /// Record one more borrower (map bind or client association).
    pub fn attach(&self) -> usize {
        self.attachments.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release one borrower; returns the remaining count.
    ///
    /// An underflow is a logic error: it is logged and the count stays at
    /// zero rather than wrapping.
    pub fn release(&self) -> usize {
        let mut current = self.attachments.load(Ordering::Acquire);
        loop {
            if current == 0 {
                log::warn!("[LINK] release() on {} with zero attachments", self.remote);
                return 0;
            }
            match self.attachments.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current borrower count.
    pub fn attachments(&self) -> usize {
        self.attachments.load(Ordering::Acquire)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Enter `Connecting` while a connection-oriented handshake runs.
    pub fn mark_connecting(&self) {
        let mut core = self.core.lock();
        if core.state == LinkState::Created {
            core.state = LinkState::Connecting;
            self.state_changed.notify_all();
        }
    }

    /// Wire the link to its transport-specific sender and go operational.
    ///
    /// Connectionless transports call this straight from `Created`;
    /// connection-oriented ones after their handshake, from `Connecting`.
    pub fn connect(
        self: &Arc<Self>,
        wire: Arc<dyn WireSender>,
        max_output_pause_period: Option<Duration>,
    ) -> Result<()> {
        let synch = Arc::new(ThreadSynchResource::new(
            wire.handle(),
            max_output_pause_period,
        ));
        let events: Arc<dyn SendStrategyEvents> = Arc::new(LinkSendEvents {
            link: Arc::downgrade(self),
        });
        let strategy = Arc::new(SendStrategy::new(wire, synch, events));

        let mut core = self.core.lock();
        match core.state {
            LinkState::Created | LinkState::Connecting => {
                core.strategy = Some(strategy);
                core.state = LinkState::Connected;
                self.state_changed.notify_all();
            }
            other => {
                return Err(TransportError::MiscProblem(format!(
                    "connect() on {} in state {}",
                    self.remote, other
                )));
            }
        }
        drop(core);

        self.receive.start();
        log::debug!("[LINK] {} connected", self.remote);
        Ok(())
    }

    /// Block until the link leaves the connecting states.
    ///
    /// Used by a second caller that found a link mid-handshake; bounded so
    /// association can never hang.
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut core = self.core.lock();
        loop {
            match core.state {
                LinkState::Connected | LinkState::Backpressure => return Ok(()),
                LinkState::Lost | LinkState::Shutdown => {
                    return Err(TransportError::UnableToCreate(format!(
                        "link {} failed during establishment",
                        self.remote
                    )));
                }
                LinkState::Created | LinkState::Connecting => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::UnableToCreate(format!(
                            "timed out waiting for link {}",
                            self.remote
                        )));
                    }
                    self.state_changed.wait_for(&mut core, deadline - now);
                }
            }
        }
    }

    /// Tear the link down from any state. Idempotent.
    pub fn transport_shutdown(&self) {
        let strategy = {
            let mut core = self.core.lock();
            if core.state == LinkState::Shutdown {
                return;
            }
            core.state = LinkState::Shutdown;
            self.state_changed.notify_all();
            // Null the owned reference under the state lock: a concurrent
            // send that already cloned it still hits Terminated mode.
            core.strategy.take()
        };

        if let Some(strategy) = strategy {
            strategy.terminate_send();
        }
        self.receive.stop();
        self.observers.lock().clear();
        log::debug!("[LINK] {} shut down", self.remote);
    }

    /// Abandon queued output. Callable from `Lost` without double-freeing:
    /// the strategy drains its queue exactly once.
    pub fn terminate_send(&self) {
        let strategy = self.core.lock().strategy.clone();
        if let Some(strategy) = strategy {
            strategy.terminate_send();
        }
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Hand one sample to the link.
    pub fn send(
        &self,
        element: &DataSampleElement,
        listener: Option<Arc<dyn SendListener>>,
    ) -> SendStatus {
        self.send_bytes(Some(element.sample_id), &element.payload, listener)
    }

    /// Hand a control message to the link (no delivery accounting).
    pub fn send_control(&self, payload: &[u8]) -> SendStatus {
        self.send_bytes(None, payload, None)
    }

    fn send_bytes(
        &self,
        sample_id: Option<u64>,
        payload: &[u8],
        listener: Option<Arc<dyn SendListener>>,
    ) -> SendStatus {
        let strategy = {
            let core = self.core.lock();
            if !core.state.can_send() {
                drop(core);
                log::debug!("[LINK] {} rejecting send in terminal/early state", self.remote);
                if let (Some(id), Some(listener)) = (sample_id, listener.as_deref()) {
                    listener.data_dropped(id, true);
                }
                return SendStatus::Rejected;
            }
            match core.strategy.clone() {
                Some(strategy) => strategy,
                None => {
                    drop(core);
                    return SendStatus::Rejected;
                }
            }
        };

        match strategy.send(sample_id, payload, listener.clone()) {
            Ok(SendOutcome::Delivered) => SendStatus::Sent,
            Ok(SendOutcome::Queued) => SendStatus::Queued,
            Ok(SendOutcome::Dropped) => SendStatus::Rejected,
            Err(err) => {
                log::warn!("[LINK] {} wire failure on send: {}", self.remote, err);
                self.mark_lost();
                if let (Some(id), Some(listener)) = (sample_id, listener.as_deref()) {
                    listener.data_dropped(id, true);
                }
                SendStatus::Rejected
            }
        }
    }

    // ========================================================================
    // Loss path
    // ========================================================================

    /// Declare the link lost and notify every observer.
    ///
    /// No-op when the link is already terminal.
    pub fn mark_lost(&self) {
        {
            let mut core = self.core.lock();
            if core.state.is_terminal() {
                return;
            }
            core.state = LinkState::Lost;
            self.state_changed.notify_all();
        }
        self.terminate_send();
        self.notify_lost();
    }

    fn notify_lost(&self) {
        // Snapshot first: observer callbacks must run without the lock.
        let observers: Vec<Arc<dyn LinkObserver>> = self
            .observers
            .lock()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer.on_link_lost(&self.remote);
        }
    }

    // ========================================================================
    // Observers
    // ========================================================================

    /// Register a loss observer under a client id.
    pub fn add_observer(&self, id: Guid, observer: Arc<dyn LinkObserver>) {
        let mut observers = self.observers.lock();
        observers.retain(|(existing, _)| *existing != id);
        observers.push((id, observer));
    }

    /// Deregister a loss observer.
    pub fn remove_observer(&self, id: &Guid) {
        self.observers.lock().retain(|(existing, _)| existing != id);
    }
}

impl std::fmt::Debug for DataLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLink")
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("attachments", &self.attachments())
            .finish()
    }
}

// ============================================================================
// Strategy event adapter
// ============================================================================

/// Routes strategy notifications back into the owning link without a
/// reference cycle.
struct LinkSendEvents {
    link: Weak<DataLink>,
}

impl SendStrategyEvents for LinkSendEvents {
    fn backpressure_changed(&self, entered: bool) {
        let Some(link) = self.link.upgrade() else {
            return;
        };
        let mut core = link.core.lock();
        match (core.state, entered) {
            (LinkState::Connected, true) => {
                core.state = LinkState::Backpressure;
                link.state_changed.notify_all();
            }
            (LinkState::Backpressure, false) => {
                core.state = LinkState::Connected;
                link.state_changed.notify_all();
            }
            _ => {}
        }
    }

    fn backpressure_timeout(&self) {
        if let Some(link) = self.link.upgrade() {
            log::warn!("[LINK] {} lost: output pause period exceeded", link.remote);
            link.mark_lost();
        }
    }

    fn wire_failed(&self, error: &std::io::Error) {
        if let Some(link) = self.link.upgrade() {
            log::warn!("[LINK] {} lost: wire failure: {}", link.remote, error);
            link.mark_lost();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, IoSlice};
    use std::sync::atomic::AtomicUsize;

    /// Wire with a switchable budget, as in the strategy tests.
    struct ThrottledWire {
        budget: Mutex<usize>,
    }

    impl WireSender for ThrottledWire {
        fn send_bytes(&self, bufs: &[IoSlice<'_>], backpressure: &mut bool) -> io::Result<usize> {
            let mut budget = self.budget.lock();
            let want: usize = bufs.iter().map(|b| b.len()).sum();
            let take = want.min(*budget);
            *budget -= take;
            if take < want {
                *backpressure = true;
            }
            Ok(take)
        }
    }

    struct CountingObserver {
        lost: AtomicUsize,
    }

    impl LinkObserver for CountingObserver {
        fn on_link_lost(&self, _remote: &RemoteAddress) {
            self.lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn remote() -> RemoteAddress {
        RemoteAddress::Udp("127.0.0.1:9000".parse().unwrap())
    }

    fn connected_link(budget: usize, pause: Option<Duration>) -> Arc<DataLink> {
        let link = DataLink::new(remote());
        let wire = Arc::new(ThrottledWire {
            budget: Mutex::new(budget),
        });
        link.connect(wire, pause).unwrap();
        link
    }

    #[test]
    fn test_connect_transitions_to_connected() {
        let link = DataLink::new(remote());
        assert_eq!(link.state(), LinkState::Created);

        let link = connected_link(1024, None);
        assert_eq!(link.state(), LinkState::Connected);
        assert!(link.receive_strategy().is_active());
    }

    #[test]
    fn test_connect_twice_fails() {
        let link = connected_link(1024, None);
        let wire = Arc::new(ThrottledWire {
            budget: Mutex::new(0),
        });
        assert!(link.connect(wire, None).is_err());
    }

    #[test]
    fn test_attach_release_balance() {
        let link = DataLink::new(remote());
        assert_eq!(link.attach(), 1);
        assert_eq!(link.attach(), 2);
        assert_eq!(link.release(), 1);
        assert_eq!(link.release(), 0);
        // Underflow is clamped, not wrapped.
        assert_eq!(link.release(), 0);
        assert_eq!(link.attachments(), 0);
    }

    #[test]
    fn test_send_on_connected_link() {
        let link = connected_link(1024, None);
        let element = DataSampleElement::new(1, 0, b"payload".to_vec());
        assert_eq!(link.send(&element, None), SendStatus::Sent);
    }

    #[test]
    fn test_send_before_connect_rejected() {
        let link = DataLink::new(remote());
        let element = DataSampleElement::new(1, 0, b"payload".to_vec());
        assert_eq!(link.send(&element, None), SendStatus::Rejected);
    }

    #[test]
    fn test_backpressure_transition_and_recovery() {
        let link = DataLink::new(remote());
        let wire = Arc::new(ThrottledWire {
            budget: Mutex::new(2),
        });
        link.connect(Arc::clone(&wire) as Arc<dyn WireSender>, Some(Duration::from_secs(5)))
            .unwrap();

        let element = DataSampleElement::new(1, 0, b"0123456789".to_vec());
        assert_eq!(link.send(&element, None), SendStatus::Queued);
        assert_eq!(link.state(), LinkState::Backpressure);

        // Refill the wire and wake the drain worker: the link must recover.
        *wire.budget.lock() = 1024;
        let strategy = link.core.lock().strategy.clone().unwrap();
        strategy.synch().notify_unclogged();

        let deadline = Instant::now() + Duration::from_secs(2);
        while link.state() != LinkState::Connected && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(link.state(), LinkState::Connected);
    }

    #[test]
    fn test_backpressure_timeout_notifies_observers_once() {
        let link = connected_link(1, Some(Duration::from_millis(40)));
        let observer = Arc::new(CountingObserver {
            lost: AtomicUsize::new(0),
        });
        link.add_observer([7u8; 16], Arc::clone(&observer) as Arc<dyn LinkObserver>);

        let element = DataSampleElement::new(1, 0, b"abcdef".to_vec());
        assert_eq!(link.send(&element, None), SendStatus::Queued);

        let deadline = Instant::now() + Duration::from_secs(2);
        while link.state() != LinkState::Lost && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(link.state(), LinkState::Lost);
        assert_eq!(observer.lost.load(Ordering::Relaxed), 1);

        // Lost link rejects new sends.
        let element = DataSampleElement::new(2, 0, b"x".to_vec());
        assert_eq!(link.send(&element, None), SendStatus::Rejected);
    }

    #[test]
    fn test_shutdown_idempotent_and_rejects_sends() {
        let link = connected_link(1024, None);
        link.transport_shutdown();
        link.transport_shutdown();
        assert_eq!(link.state(), LinkState::Shutdown);

        let element = DataSampleElement::new(1, 0, b"x".to_vec());
        assert_eq!(link.send(&element, None), SendStatus::Rejected);
    }

    #[test]
    fn test_concurrent_shutdown_with_sends() {
        // Hammer sends while shutting down: every send must resolve to a
        // defined status, never panic.
        let link = connected_link(usize::MAX, None);
        let sender = {
            let link = Arc::clone(&link);
            std::thread::spawn(move || {
                for id in 0..1000u64 {
                    let element = DataSampleElement::new(id, 0, vec![0u8; 16]);
                    let status = link.send(&element, None);
                    assert!(matches!(
                        status,
                        SendStatus::Sent | SendStatus::Queued | SendStatus::Rejected
                    ));
                }
            })
        };

        std::thread::sleep(Duration::from_millis(1));
        link.transport_shutdown();
        sender.join().unwrap();
        assert_eq!(link.state(), LinkState::Shutdown);
    }

    #[test]
    fn test_wait_connected_times_out() {
        let link = DataLink::new(remote());
        link.mark_connecting();

        let start = Instant::now();
        let err = link.wait_connected(Duration::from_millis(30)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(matches!(err, TransportError::UnableToCreate(_)));
    }
}
