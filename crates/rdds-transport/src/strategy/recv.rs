// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Inbound sample dispatch.
//!
//! Transport receiver threads (reactor, datagram readers, shmem poller)
//! decode wire bytes into a [`ReceivedDataSample`] and hand it to the owning
//! link's [`ReceiveStrategy`], which fans it out to every registered
//! receive listener -- typically a reader that demuxes by publication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::locator::RemoteAddress;
use crate::sample::Guid;

// ============================================================================
// ReceivedDataSample
// ============================================================================

/// One inbound sample, already stripped of transport framing.
#[derive(Clone, Debug)]
pub struct ReceivedDataSample {
    /// Remote endpoint the sample arrived from (link key).
    pub remote: RemoteAddress,

    /// Source participant prefix, when the wire format carries one
    /// (RTPS-framed transports).
    pub source_prefix: Option<[u8; 12]>,

    /// Sample payload.
    pub payload: Vec<u8>,
}

/// Consumer of inbound samples (a reader-side demux, usually).
pub trait ReceiveListener: Send + Sync {
    /// Called once per inbound sample, on the transport's receive thread.
    fn deliver_sample(&self, sample: &ReceivedDataSample);
}

// ============================================================================
// ReceiveStrategy
// ============================================================================

/// Listener registration and fan-out for one link.
///
/// `start`/`stop` are idempotent; delivery after `stop` (or before `start`)
/// drops the sample with a debug log instead of touching released
/// listeners.
pub struct ReceiveStrategy {
    listeners: Mutex<Vec<(Guid, Arc<dyn ReceiveListener>)>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Default for ReceiveStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveStrategy {
    /// Create a strategy with no listeners, not yet started.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    /// Begin accepting deliveries. Safe to call more than once.
    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    /// Stop accepting deliveries and release listener references.
    ///
    /// The second and later calls are no-ops.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.listeners.lock().clear();
    }

    /// True when started and not stopped.
    pub fn is_active(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.stopped.load(Ordering::Acquire)
    }

    /// Register a listener under a subscription id.
    pub fn add_listener(&self, id: Guid, listener: Arc<dyn ReceiveListener>) {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|(existing, _)| *existing == id) {
            log::warn!("[RECV] listener {:02x?} already registered", &id[..4]);
            return;
        }
        listeners.push((id, listener));
    }

    /// Deregister a listener.
    pub fn remove_listener(&self, id: &Guid) {
        self.listeners.lock().retain(|(existing, _)| existing != id);
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Fan a sample out to every registered listener.
    pub fn deliver(&self, sample: &ReceivedDataSample) {
        if !self.is_active() {
            log::debug!(
                "[RECV] dropping {} bytes from {}: strategy not active",
                sample.payload.len(),
                sample.remote
            );
            return;
        }

        // Snapshot so listener callbacks run without the lock held.
        let listeners: Vec<Arc<dyn ReceiveListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener.deliver_sample(sample);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
