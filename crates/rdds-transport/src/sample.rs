// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Outbound sample bookkeeping.
//!
//! [`SendStateDataSampleList`] tracks every queued sample in exactly one of
//! three FIFO lists (`unsent`, `sending`, `sent`); the element is owned by
//! the list it currently sits in, so the one-list-at-a-time invariant is a
//! property of ownership rather than of careful pointer surgery.
//! [`WriteDataContainer`] layers bounded admission on top: writers blocked
//! on `max_samples`/`max_samples_per_instance` wait up to
//! `max_blocking_time` for delivery to free capacity, then fail with a
//! timeout-class error.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TransportError};

/// 16-byte entity GUID (publication/subscription id).
pub type Guid = [u8; 16];

/// Opaque instance handle for per-instance resource limits.
pub type InstanceHandle = u64;

// ============================================================================
// DataSampleElement
// ============================================================================

/// One outbound sample awaiting send, delivery, or retransmission.
///
/// The payload is shared (`Arc`) so the container can keep tracking the
/// element while a clone travels through a link's send strategy.
#[derive(Clone, Debug)]
pub struct DataSampleElement {
    /// Writer-scoped monotonically increasing sample id.
    pub sample_id: u64,

    /// Instance the sample belongs to.
    pub instance: InstanceHandle,

    /// Publication the sample originates from.
    pub publication: Guid,

    /// Serialized sample payload.
    pub payload: Arc<[u8]>,

    /// Transport priority carried from the association.
    pub priority: i32,
}

impl DataSampleElement {
    /// Create an element from a serialized payload.
    pub fn new(sample_id: u64, instance: InstanceHandle, payload: Vec<u8>) -> Self {
        Self {
            sample_id,
            instance,
            publication: [0u8; 16],
            payload: Arc::from(payload),
            priority: 0,
        }
    }

    /// Set the publication id.
    pub fn with_publication(mut self, publication: Guid) -> Self {
        self.publication = publication;
        self
    }
}

/// Which list an element currently sits in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendState {
    /// Queued, not yet handed to any link.
    Unsent,
    /// Handed to at least one link, delivery not yet confirmed.
    Sending,
    /// Delivery confirmed, retained until acknowledged/released.
    Sent,
}

// ============================================================================
// SendStateDataSampleList
// ============================================================================

/// Three owning FIFO lists with single-membership per element.
#[derive(Debug, Default)]
pub struct SendStateDataSampleList {
    unsent: VecDeque<DataSampleElement>,
    sending: VecDeque<DataSampleElement>,
    sent: VecDeque<DataSampleElement>,
}

impl SendStateDataSampleList {
    /// Empty list set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fresh element to the unsent list.
    pub fn queue_unsent(&mut self, element: DataSampleElement) {
        self.unsent.push_back(element);
    }

    /// Move the oldest unsent element to the sending list, returning a
    /// clone for transmission.
    pub fn begin_send(&mut self) -> Option<DataSampleElement> {
        let element = self.unsent.pop_front()?;
        let clone = element.clone();
        self.sending.push_back(element);
        Some(clone)
    }

    /// Move a sending element to the sent list once delivery is confirmed.
    ///
    /// Returns false when the id is not in the sending list (already
    /// released or never sent).
    pub fn mark_sent(&mut self, sample_id: u64) -> bool {
        match self.sending.iter().position(|e| e.sample_id == sample_id) {
            Some(idx) => {
                // VecDeque::remove preserves FIFO order of the remainder.
                if let Some(element) = self.sending.remove(idx) {
                    self.sent.push_back(element);
                    return true;
                }
                false
            }
            None => false,
        }
    }

    /// Remove an element from whichever list holds it.
    pub fn release(&mut self, sample_id: u64) -> Option<DataSampleElement> {
        for list in [&mut self.unsent, &mut self.sending, &mut self.sent] {
            if let Some(idx) = list.iter().position(|e| e.sample_id == sample_id) {
                return list.remove(idx);
            }
        }
        None
    }

    /// Which list a sample currently sits in.
    pub fn state_of(&self, sample_id: u64) -> Option<SendState> {
        if self.unsent.iter().any(|e| e.sample_id == sample_id) {
            return Some(SendState::Unsent);
        }
        if self.sending.iter().any(|e| e.sample_id == sample_id) {
            return Some(SendState::Sending);
        }
        if self.sent.iter().any(|e| e.sample_id == sample_id) {
            return Some(SendState::Sent);
        }
        None
    }

    /// Number of unsent elements.
    pub fn unsent_len(&self) -> usize {
        self.unsent.len()
    }

    /// Number of elements awaiting delivery confirmation.
    pub fn sending_len(&self) -> usize {
        self.sending.len()
    }

    /// Number of delivered-but-retained elements.
    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    /// Total elements across all three lists.
    pub fn len(&self) -> usize {
        self.unsent.len() + self.sending.len() + self.sent.len()
    }

    /// True when all three lists are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// WriteDataContainer
// ============================================================================

/// Resource limits governing container admission.
#[derive(Clone, Copy, Debug)]
pub struct ResourceLimits {
    /// Total samples the container may hold across all instances.
    pub max_samples: usize,

    /// Samples the container may hold per instance.
    pub max_samples_per_instance: usize,

    /// How long a write may block waiting for capacity.
    pub max_blocking_time: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_samples: usize::MAX,
            max_samples_per_instance: usize::MAX,
            max_blocking_time: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default)]
struct ContainerState {
    list: SendStateDataSampleList,
    per_instance: HashMap<InstanceHandle, usize>,
}

impl ContainerState {
    fn has_capacity(&self, limits: &ResourceLimits, instance: InstanceHandle) -> bool {
        if self.list.len() >= limits.max_samples {
            return false;
        }
        let used = self.per_instance.get(&instance).copied().unwrap_or(0);
        used < limits.max_samples_per_instance
    }

    fn release_slot(&mut self, instance: InstanceHandle) {
        match self.per_instance.get_mut(&instance) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.per_instance.remove(&instance);
            }
            None => {
                log::warn!(
                    "[CONTAINER] released sample for untracked instance {}",
                    instance
                );
            }
        }
    }
}

/// Bounded outbound sample container for one writer.
///
/// Admission blocks (bounded) when either limit is reached; delivery and
/// drop notifications free capacity and wake blocked writers.
pub struct WriteDataContainer {
    limits: ResourceLimits,
    state: Mutex<ContainerState>,
    capacity_freed: Condvar,
}

impl WriteDataContainer {
    /// Create a container with the given limits.
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(ContainerState::default()),
            capacity_freed: Condvar::new(),
        }
    }

    /// Admit a sample into the unsent list.
    ///
    /// Blocks up to `max_blocking_time` when a resource limit is hit;
    /// expiry fails with [`TransportError::WriteTimeout`].
    pub fn enqueue(&self, element: DataSampleElement) -> Result<()> {
        let deadline = Instant::now() + self.limits.max_blocking_time;
        let mut state = self.state.lock();

        while !state.has_capacity(&self.limits, element.instance) {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::WriteTimeout);
            }
            let timed_out = self
                .capacity_freed
                .wait_for(&mut state, deadline - now)
                .timed_out();
            if timed_out && !state.has_capacity(&self.limits, element.instance) {
                return Err(TransportError::WriteTimeout);
            }
        }

        *state.per_instance.entry(element.instance).or_insert(0) += 1;
        state.list.queue_unsent(element);
        Ok(())
    }

    /// Pull the oldest unsent sample for transmission (moves it to the
    /// sending list).
    pub fn begin_send(&self) -> Option<DataSampleElement> {
        self.state.lock().list.begin_send()
    }

    /// Drain every unsent sample for transmission in FIFO order.
    pub fn take_unsent(&self) -> Vec<DataSampleElement> {
        let mut state = self.state.lock();
        let mut out = Vec::with_capacity(state.list.unsent_len());
        while let Some(element) = state.list.begin_send() {
            out.push(element);
        }
        out
    }

    /// Delivery confirmation: releases the sample and frees its slot.
    pub fn data_delivered(&self, sample_id: u64) {
        let mut state = self.state.lock();
        state.list.mark_sent(sample_id);
        if let Some(element) = state.list.release(sample_id) {
            state.release_slot(element.instance);
            self.capacity_freed.notify_all();
        }
    }

    /// Drop notification: releases the sample and frees its slot.
    pub fn data_dropped(&self, sample_id: u64, dropped_by_transport: bool) {
        let mut state = self.state.lock();
        if let Some(element) = state.list.release(sample_id) {
            log::debug!(
                "[CONTAINER] sample {} dropped (by_transport={})",
                sample_id,
                dropped_by_transport
            );
            state.release_slot(element.instance);
            self.capacity_freed.notify_all();
        }
    }

    /// Samples currently tracked (all states).
    pub fn len(&self) -> usize {
        self.state.lock().list.len()
    }

    /// True when no samples are tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured limits.
    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn elem(id: u64, instance: InstanceHandle) -> DataSampleElement {
        DataSampleElement::new(id, instance, vec![id as u8; 4])
    }

    #[test]
    fn test_list_fifo_and_single_membership() {
        let mut list = SendStateDataSampleList::new();
        list.queue_unsent(elem(1, 0));
        list.queue_unsent(elem(2, 0));
        list.queue_unsent(elem(3, 0));

        assert_eq!(list.state_of(1), Some(SendState::Unsent));

        let first = list.begin_send().unwrap();
        assert_eq!(first.sample_id, 1);
        assert_eq!(list.state_of(1), Some(SendState::Sending));
        assert_eq!(list.unsent_len(), 2);
        assert_eq!(list.sending_len(), 1);

        assert!(list.mark_sent(1));
        assert_eq!(list.state_of(1), Some(SendState::Sent));
        assert_eq!(list.sending_len(), 0);

        // Second mark is a no-op: the element is no longer sending.
        assert!(!list.mark_sent(1));

        assert!(list.release(1).is_some());
        assert_eq!(list.state_of(1), None);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_list_begin_send_preserves_order() {
        let mut list = SendStateDataSampleList::new();
        for id in 1..=5 {
            list.queue_unsent(elem(id, 0));
        }
        let ids: Vec<u64> = std::iter::from_fn(|| list.begin_send())
            .map(|e| e.sample_id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_container_admits_within_limits() {
        let container = WriteDataContainer::new(ResourceLimits {
            max_samples: 3,
            max_samples_per_instance: 2,
            max_blocking_time: Duration::from_millis(10),
        });

        container.enqueue(elem(1, 7)).unwrap();
        container.enqueue(elem(2, 7)).unwrap();
        assert_eq!(container.len(), 2);
    }

    #[test]
    fn test_container_third_write_times_out() {
        // max_samples_per_instance=2, max_samples=3: the third write on the
        // same instance must block, then fail with the timeout error.
        let container = WriteDataContainer::new(ResourceLimits {
            max_samples: 3,
            max_samples_per_instance: 2,
            max_blocking_time: Duration::from_millis(50),
        });

        container.enqueue(elem(1, 1)).unwrap();
        container.enqueue(elem(2, 1)).unwrap();

        let start = Instant::now();
        let err = container.enqueue(elem(3, 1)).unwrap_err();
        assert!(matches!(err, TransportError::WriteTimeout));
        assert!(start.elapsed() >= Duration::from_millis(50));

        // A different instance still fits under max_samples.
        container.enqueue(elem(4, 2)).unwrap();
        let err = container.enqueue(elem(5, 3)).unwrap_err();
        assert!(matches!(err, TransportError::WriteTimeout));
    }

    #[test]
    fn test_container_delivery_unblocks_writer() {
        let container = Arc::new(WriteDataContainer::new(ResourceLimits {
            max_samples: 2,
            max_samples_per_instance: 2,
            max_blocking_time: Duration::from_secs(5),
        }));

        container.enqueue(elem(1, 1)).unwrap();
        container.enqueue(elem(2, 1)).unwrap();

        let writer = {
            let container = Arc::clone(&container);
            thread::spawn(move || container.enqueue(elem(3, 1)))
        };

        // Let the writer block, then free a slot.
        thread::sleep(Duration::from_millis(50));
        container.take_unsent();
        container.data_delivered(1);

        writer.join().unwrap().unwrap();
        assert_eq!(container.len(), 2);
    }

    #[test]
    fn test_container_drop_frees_capacity() {
        let container = WriteDataContainer::new(ResourceLimits {
            max_samples: 1,
            max_samples_per_instance: 1,
            max_blocking_time: Duration::from_millis(10),
        });

        container.enqueue(elem(1, 1)).unwrap();
        assert!(container.enqueue(elem(2, 1)).is_err());

        container.data_dropped(1, true);
        container.enqueue(elem(2, 1)).unwrap();
    }

    #[test]
    fn test_container_take_unsent_moves_to_sending() {
        let container = WriteDataContainer::new(ResourceLimits::default());
        container.enqueue(elem(1, 1)).unwrap();
        container.enqueue(elem(2, 1)).unwrap();

        let taken = container.take_unsent();
        assert_eq!(taken.len(), 2);
        // Still tracked until delivered.
        assert_eq!(container.len(), 2);

        container.data_delivered(1);
        container.data_delivered(2);
        assert!(container.is_empty());
    }
}
