// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Outbound send pipeline with backpressure handling.
//!
//! The strategy serializes wire framing, attempts a non-blocking
//! transmission, and -- for connection-oriented wires -- queues the
//! remainder when the OS send buffer fills instead of blocking the caller.
//! A drain worker then waits on the link's [`ThreadSynchResource`] for the
//! socket to drain, bounded by `max_output_pause_period`; expiry fires the
//! lost path exactly once for the episode.
//!
//! # Modes
//!
//! ```text
//!        send() completes synchronously
//!   +--> Direct -----------------------------+
//!   |      | partial write / WouldBlock      |
//!   |      v                                 |
//!   +-- Queue  --(drain worker empties)------+
//!          | terminate_send() / wire failure
//!          v
//!      Terminated        (Suspended: queue-only parking for relink)
//! ```
//!
//! Connectionless wires never set the backpressure flag, so their links
//! never leave Direct mode: a full socket buffer drops the datagram with a
//! debug log, which is the best-effort contract of those transports.

use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use crate::synch::{ThreadSynchResource, UnclogOutcome};

// ============================================================================
// Traits
// ============================================================================

/// Transport-specific byte sink for one link.
pub trait WireSender: Send + Sync {
    /// Attempt a non-blocking transmission of the given buffers.
    ///
    /// Contract: a full OS buffer on a connection-oriented wire returns
    /// `Ok(n)` (possibly 0) with `backpressure` set; connectionless wires
    /// never set the flag. `Err` is reserved for hard failures that should
    /// take the link down.
    fn send_bytes(&self, bufs: &[IoSlice<'_>], backpressure: &mut bool) -> io::Result<usize>;

    /// Apply wire framing to one sample payload.
    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        payload.to_vec()
    }

    /// Raw fd backing this wire, for writability polling during
    /// backpressure. `None` waits on the synch condvar instead.
    fn handle(&self) -> Option<i32> {
        None
    }
}

/// Delivery/drop confirmation callbacks for one queued sample.
pub trait SendListener: Send + Sync {
    /// The sample left the local process (or was accepted by the wire).
    fn data_delivered(&self, sample_id: u64);

    /// The sample will never be sent on this link.
    fn data_dropped(&self, sample_id: u64, dropped_by_transport: bool);
}

/// Upward notifications from the strategy to its owning link.
pub trait SendStrategyEvents: Send + Sync {
    /// Entered (`true`) or cleared (`false`) backpressure.
    fn backpressure_changed(&self, entered: bool);

    /// `max_output_pause_period` expired; the link must go lost.
    fn backpressure_timeout(&self);

    /// A hard wire failure occurred while draining.
    fn wire_failed(&self, error: &io::Error);
}

// ============================================================================
// Types
// ============================================================================

/// Strategy mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMode {
    /// Transmit synchronously from the calling thread.
    Direct,

    /// Backpressure: samples queue behind a partial write.
    Queue,

    /// Parked for relink; samples queue, nothing drains.
    Suspended,

    /// Terminal: every send is dropped.
    Terminated,
}

impl std::fmt::Display for SendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SendMode::Direct => "Direct",
            SendMode::Queue => "Queue",
            SendMode::Suspended => "Suspended",
            SendMode::Terminated => "Terminated",
        };
        write!(f, "{}", s)
    }
}

/// Result of handing one sample to the strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Transmitted synchronously.
    Delivered,

    /// Queued behind backpressure (or suspension).
    Queued,

    /// Dropped: the strategy is terminated.
    Dropped,
}

/// One framed message waiting in the backpressure queue.
struct QueuedElement {
    sample_id: Option<u64>,
    buf: Vec<u8>,
    offset: usize,
    listener: Option<Arc<dyn SendListener>>,
}

struct QueueState {
    mode: SendMode,
    queue: VecDeque<QueuedElement>,
    drainer_running: bool,
}

/// Outcome of one `perform_work` pass.
enum WorkOutcome {
    Drained,
    Clogged,
    Failed(io::Error),
    Terminated,
}

// ============================================================================
// SendStrategy
// ============================================================================

/// Per-link outbound state machine.
pub struct SendStrategy {
    wire: Arc<dyn WireSender>,
    synch: Arc<ThreadSynchResource>,
    events: Arc<dyn SendStrategyEvents>,
    inner: Mutex<QueueState>,
}

impl SendStrategy {
    /// Create a strategy in Direct mode.
    pub fn new(
        wire: Arc<dyn WireSender>,
        synch: Arc<ThreadSynchResource>,
        events: Arc<dyn SendStrategyEvents>,
    ) -> Self {
        Self {
            wire,
            synch,
            events,
            inner: Mutex::new(QueueState {
                mode: SendMode::Direct,
                queue: VecDeque::new(),
                drainer_running: false,
            }),
        }
    }

    /// Current mode.
    pub fn mode(&self) -> SendMode {
        self.inner.lock().mode
    }

    /// Queued messages awaiting drain.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// The synch resource governing this strategy's backpressure waits.
    pub fn synch(&self) -> &Arc<ThreadSynchResource> {
        &self.synch
    }

    /// Hand one sample payload to the wire.
    ///
    /// Never blocks beyond a non-blocking socket write. `Err` means a hard
    /// wire failure the caller must translate into a lost link; the sample
    /// was not delivered and its listener has not been notified.
    pub fn send(
        self: &Arc<Self>,
        sample_id: Option<u64>,
        payload: &[u8],
        listener: Option<Arc<dyn SendListener>>,
    ) -> io::Result<SendOutcome> {
        let buf = self.wire.frame(payload);
        let mut inner = self.inner.lock();

        match inner.mode {
            SendMode::Terminated => {
                drop(inner);
                notify_dropped(sample_id, listener.as_deref());
                Ok(SendOutcome::Dropped)
            }
            SendMode::Queue | SendMode::Suspended => {
                inner.queue.push_back(QueuedElement {
                    sample_id,
                    buf,
                    offset: 0,
                    listener,
                });
                Ok(SendOutcome::Queued)
            }
            SendMode::Direct => {
                let mut offset = 0;
                loop {
                    let mut backpressure = false;
                    let slice = IoSlice::new(&buf[offset..]);
                    match self.wire.send_bytes(&[slice], &mut backpressure) {
                        Ok(n) => {
                            offset += n;
                            if offset >= buf.len() {
                                drop(inner);
                                notify_delivered(sample_id, listener.as_deref());
                                return Ok(SendOutcome::Delivered);
                            }
                            if backpressure {
                                self.enter_queue_mode(
                                    &mut inner,
                                    QueuedElement {
                                        sample_id,
                                        buf,
                                        offset,
                                        listener,
                                    },
                                );
                                return Ok(SendOutcome::Queued);
                            }
                            // Short write without backpressure: keep pushing.
                        }
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    /// Switch to Queue mode and arm the drain worker.
    ///
    /// Must be called with the queue lock held; the caller's element goes
    /// to the back (it is the only one, transitions happen from Direct).
    fn enter_queue_mode(self: &Arc<Self>, inner: &mut QueueState, element: QueuedElement) {
        inner.queue.push_back(element);
        inner.mode = SendMode::Queue;
        self.synch.enter_backpressure();

        // The flag flips under the queue lock so only one worker ever runs;
        // an already-running worker gets a nudge in case it is mid-exit.
        if inner.drainer_running {
            self.synch.notify_unclogged();
        } else {
            inner.drainer_running = true;
            let strategy = Arc::clone(self);
            let spawned = thread::Builder::new()
                .name("rdds-send-drain".to_string())
                .spawn(move || strategy.drain_loop());
            if let Err(err) = spawned {
                log::error!("[SEND] failed to spawn drain worker: {}", err);
                inner.drainer_running = false;
            }
        }
        self.events.backpressure_changed(true);
    }

    /// Drain worker body: wait for the wire to unclog, flush, repeat.
    fn drain_loop(self: Arc<Self>) {
        loop {
            match self.synch.wait_to_unclog() {
                UnclogOutcome::Shutdown => break,
                UnclogOutcome::TimedOut => {
                    if self.synch.try_fire_lost() {
                        log::warn!("[SEND] backpressure timeout, declaring link lost");
                        self.events.backpressure_timeout();
                    }
                    break;
                }
                UnclogOutcome::Unclogged => match self.perform_work() {
                    WorkOutcome::Drained => {
                        self.events.backpressure_changed(false);
                        // A send may have queued new work between the drain
                        // and this re-check; keep the worker alive for it.
                        let mut inner = self.inner.lock();
                        if inner.mode == SendMode::Queue {
                            drop(inner);
                            continue;
                        }
                        inner.drainer_running = false;
                        return;
                    }
                    WorkOutcome::Clogged => {}
                    WorkOutcome::Failed(err) => {
                        self.events.wire_failed(&err);
                        break;
                    }
                    WorkOutcome::Terminated => break,
                },
            }
        }
        self.inner.lock().drainer_running = false;
    }

    /// Flush queued messages until empty or the wire clogs again.
    fn perform_work(&self) -> WorkOutcome {
        loop {
            let mut delivered: Option<(Option<u64>, Option<Arc<dyn SendListener>>)> = None;
            {
                let mut inner = self.inner.lock();
                if inner.mode == SendMode::Terminated {
                    return WorkOutcome::Terminated;
                }
                let Some(front) = inner.queue.front_mut() else {
                    inner.mode = SendMode::Direct;
                    self.synch.clear_backpressure();
                    return WorkOutcome::Drained;
                };

                let mut backpressure = false;
                let slice = IoSlice::new(&front.buf[front.offset..]);
                match self.wire.send_bytes(&[slice], &mut backpressure) {
                    Ok(n) => {
                        front.offset += n;
                        if front.offset >= front.buf.len() {
                            if let Some(done) = inner.queue.pop_front() {
                                delivered = Some((done.sample_id, done.listener));
                            }
                        } else if backpressure {
                            return WorkOutcome::Clogged;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => return WorkOutcome::Failed(err),
                }
            }
            if let Some((sample_id, listener)) = delivered {
                notify_delivered(sample_id, listener.as_deref());
            }
        }
    }

    /// Park the queue for relink: nothing drains until `resume_send`.
    pub fn suspend_send(&self) {
        let mut inner = self.inner.lock();
        if inner.mode == SendMode::Terminated {
            return;
        }
        inner.mode = SendMode::Suspended;
    }

    /// Resume after relink; drains inline and re-arms backpressure if the
    /// wire clogs immediately.
    pub fn resume_send(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            if inner.mode != SendMode::Suspended {
                return;
            }
            inner.mode = SendMode::Queue;
        }
        match self.perform_work() {
            WorkOutcome::Clogged => {
                let mut inner = self.inner.lock();
                self.synch.enter_backpressure();
                if !inner.drainer_running {
                    inner.drainer_running = true;
                    let strategy = Arc::clone(self);
                    let spawned = thread::Builder::new()
                        .name("rdds-send-drain".to_string())
                        .spawn(move || strategy.drain_loop());
                    if let Err(err) = spawned {
                        log::error!("[SEND] failed to spawn drain worker: {}", err);
                        inner.drainer_running = false;
                    }
                }
            }
            WorkOutcome::Failed(err) => self.events.wire_failed(&err),
            WorkOutcome::Drained | WorkOutcome::Terminated => {}
        }
    }

    /// Abandon the queue and refuse all further sends.
    ///
    /// Safe to call repeatedly (including from the lost path): the queue is
    /// drained exactly once, so listeners see exactly one drop
    /// notification.
    pub fn terminate_send(&self) {
        let abandoned: Vec<QueuedElement> = {
            let mut inner = self.inner.lock();
            if inner.mode == SendMode::Terminated {
                return;
            }
            inner.mode = SendMode::Terminated;
            inner.queue.drain(..).collect()
        };
        self.synch.shutdown();
        for element in &abandoned {
            notify_dropped(element.sample_id, element.listener.as_deref());
        }
        if !abandoned.is_empty() {
            log::debug!("[SEND] terminate_send dropped {} queued messages", abandoned.len());
        }
    }
}

fn notify_delivered(sample_id: Option<u64>, listener: Option<&dyn SendListener>) {
    if let (Some(id), Some(listener)) = (sample_id, listener) {
        listener.data_delivered(id);
    }
}

fn notify_dropped(sample_id: Option<u64>, listener: Option<&dyn SendListener>) {
    if let (Some(id), Some(listener)) = (sample_id, listener) {
        listener.data_dropped(id, true);
    }
}

// ============================================================================
// Tests
// ============================================================================
