// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Concrete transport implementations and the trait they share.
//!
//! A transport instance owns the mapping from remote address to `DataLink`
//! for one configuration, creates links on demand, and tears everything
//! down on shutdown. Five kinds are provided:
//!
//! - `udp` - connectionless unicast datagrams
//! - `multicast` - UDP multicast groups
//! - `rtps_udp` - RTPS-framed UDP
//! - `tcp` - connection-oriented, length-prefix framed, real backpressure
//! - `shmem` - same-host shared-memory pools (Linux)

pub mod multicast;
pub mod rtps_udp;
pub mod shmem;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::{TransportInst, TransportKind};
use crate::error::{Result, TransportError};
use crate::link::DataLink;
use crate::locator::{LocatorBlob, RemoteAddress};

pub use multicast::MulticastTransport;
pub use rtps_udp::RtpsUdpTransport;
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

#[cfg(target_os = "linux")]
pub use shmem::ShmemTransport;

// ============================================================================
// Transport trait
// ============================================================================

/// One configured transport instance's connection manager.
pub trait Transport: Send + Sync {
    /// Transport kind.
    fn kind(&self) -> TransportKind;

    /// The instance configuration this transport was created from.
    fn inst(&self) -> &TransportInst;

    /// Decode a peer locator blob into this transport's link-map key.
    ///
    /// `None` when the blob belongs to a different transport kind (or is
    /// structurally unreachable, e.g. a shared-memory pool on another
    /// host); the caller then tries its next transport.
    fn blob_to_key(&self, blob: &LocatorBlob) -> Option<RemoteAddress>;

    /// Return the existing link for the peer, or create and connect one.
    ///
    /// Every success adds one attachment that must be balanced by
    /// [`Transport::release_datalink`].
    fn find_or_create_datalink(
        &self,
        blob: &LocatorBlob,
        connect_as_publisher: bool,
    ) -> Result<Arc<DataLink>>;

    /// Passive-side association: wait (bounded) for the peer to establish
    /// the link. Connectionless transports treat this as
    /// `find_or_create_datalink`; only connection-oriented ones have a true
    /// passive side.
    fn accept_datalink(&self, blob: &LocatorBlob, timeout: Duration) -> Result<Arc<DataLink>>;

    /// Release one attachment; the link is unbound and shut down exactly
    /// when the count reaches zero.
    fn release_datalink(&self, link: &Arc<DataLink>);

    /// Backpressure timeout escalation across the whole instance: mark
    /// every tracked link lost and abandon its queued output.
    fn notify_lost_on_backpressure_timeout(&self);

    /// Tear the instance down: stop receivers, close sockets, shut every
    /// link down, clear the map. Idempotent.
    fn shutdown(&self);

    /// The locator blob peers should use to reach this instance.
    fn local_locator(&self) -> LocatorBlob;
}

// ============================================================================
// LinkTable
// ============================================================================

/// Per-instance link map with the lock discipline shared by all transports.
pub struct LinkTable {
    links: Mutex<HashMap<RemoteAddress, Arc<DataLink>>>,
}

impl Default for LinkTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkTable {
    /// Empty table.
    pub fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
        }
    }

    /// Look up an existing link, adding an attachment on hit.
    pub fn find(&self, key: &RemoteAddress) -> Option<Arc<DataLink>> {
        let links = self.links.lock();
        let link = links.get(key)?;
        link.attach();
        Some(Arc::clone(link))
    }

    /// Peek at a link without taking an attachment (receive-path demux).
    pub fn get(&self, key: &RemoteAddress) -> Option<Arc<DataLink>> {
        self.links.lock().get(key).cloned()
    }

    /// Find an existing link (attaching) or bind a freshly allocated one.
    ///
    /// Returns `(link, created)`. A newly bound link already carries the
    /// caller's attachment. Bind conflicts lose the race and return the
    /// winner's link instead; the caller must then discard its own.
    pub fn find_or_bind(
        &self,
        key: RemoteAddress,
        make: impl FnOnce() -> Arc<DataLink>,
    ) -> (Arc<DataLink>, bool) {
        let mut links = self.links.lock();
        if let Some(existing) = links.get(&key) {
            existing.attach();
            return (Arc::clone(existing), false);
        }
        let link = make();
        link.attach();
        links.insert(key, Arc::clone(&link));
        (link, true)
    }

    /// Unbind a link by its remote key.
    ///
    /// A missing key is a logic error (the resource was already released
    /// elsewhere): reported, non-fatal.
    pub fn unbind(&self, key: &RemoteAddress) -> Option<Arc<DataLink>> {
        let removed = self.links.lock().remove(key);
        if removed.is_none() {
            log::warn!("[TRANSPORT] release of unbound link {}", key);
        }
        removed
    }

    /// Copy the current links while holding the lock, so callers can
    /// invoke link callbacks after releasing it.
    pub fn snapshot(&self) -> Vec<Arc<DataLink>> {
        self.links.lock().values().cloned().collect()
    }

    /// Remove and return every link (shutdown path).
    pub fn drain(&self) -> Vec<Arc<DataLink>> {
        self.links.lock().drain().map(|(_, link)| link).collect()
    }

    /// Number of bound links.
    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    /// True when no links are bound.
    pub fn is_empty(&self) -> bool {
        self.links.lock().is_empty()
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Standard release path: drop one attachment, unbind and shut the link
/// down when the count hits zero.
pub(crate) fn release_link(table: &LinkTable, link: &Arc<DataLink>) {
    let remaining = link.release();
    if remaining == 0 {
        if table.unbind(link.remote()).is_some() {
            link.transport_shutdown();
        }
    } else {
        log::debug!(
            "[TRANSPORT] link {} released, {} attachments remain",
            link.remote(),
            remaining
        );
    }
}

/// Standard backpressure-timeout escalation: snapshot under the lock, then
/// mark lost outside it to avoid re-entrant deadlock.
pub(crate) fn mark_all_lost(table: &LinkTable) {
    for link in table.snapshot() {
        link.mark_lost();
        link.terminate_send();
    }
}

/// Decode failure helper shared by `find_or_create_datalink` impls.
pub(crate) fn key_or_not_found(
    kind: TransportKind,
    key: Option<RemoteAddress>,
) -> Result<RemoteAddress> {
    key.ok_or_else(|| {
        TransportError::NotFound(format!("locator blob not addressable by {} transport", kind))
    })
}

// ============================================================================
// Tests
// ============================================================================
