// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Association and fan-out: what a DataWriter/DataReader needs from the
//! transport layer.
//!
//! `TransportClient` is a component the entity holds, not a base class it
//! inherits: the entity injects a small capability set ([`ClientEndpoint`])
//! and the client does the rest -- resolving a configuration, filtering
//! instances by QoS compatibility, establishing one link per remote peer,
//! and fanning samples out to every associated link.
//!
//! Runtime loss arrives through `ClientEndpoint::on_link_lost`, never as a
//! return value of `send`: the failure happens on a transport thread long
//! after the original call returned.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::TransportInst;
use crate::error::{Result, TransportError};
use crate::link::{DataLink, LinkObserver, SendStatus};
use crate::locator::{LocatorBlob, RemoteAddress};
use crate::registry::TransportRegistry;
use crate::sample::{DataSampleElement, Guid};
use crate::strategy::send::SendListener;
use crate::transport::Transport;

/// Default bound for passive-side association waits.
const DEFAULT_PASSIVE_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Association inputs
// ============================================================================

/// One remote peer endpoint, as delivered by discovery.
#[derive(Clone, Debug)]
pub struct AssociationData {
    /// Remote entity GUID.
    pub remote_id: Guid,

    /// Serialized locator describing how to reach the peer.
    pub remote_data: LocatorBlob,

    /// Transport priority requested for this association.
    pub priority: i32,
}

impl AssociationData {
    /// Plain association with default priority.
    pub fn new(remote_id: Guid, remote_data: LocatorBlob) -> Self {
        Self {
            remote_id,
            remote_data,
            priority: 0,
        }
    }
}

/// Capabilities the owning entity injects into its transport client.
pub trait ClientEndpoint: Send + Sync {
    /// GUID of the owning entity.
    fn repo_id(&self) -> Guid;

    /// Transport priority of the owning entity.
    fn priority(&self) -> i32 {
        0
    }

    /// QoS compatibility filter over candidate instances.
    fn check_transport_qos(&self, _inst: &TransportInst) -> bool {
        true
    }

    /// A link this entity depends on was declared lost.
    fn on_link_lost(&self, _remote: &RemoteAddress) {}
}

// ============================================================================
// TransportClient
// ============================================================================

struct Association {
    link: Arc<DataLink>,
    transport: Arc<dyn Transport>,
}

/// Per-entity association index and send fan-out.
pub struct TransportClient {
    endpoint: Arc<dyn ClientEndpoint>,
    impls: Mutex<Vec<Arc<dyn Transport>>>,
    links: Mutex<HashMap<Guid, Association>>,
    passive_timeout: Duration,
}

impl TransportClient {
    /// Create a client for the given entity capabilities.
    pub fn new(endpoint: Arc<dyn ClientEndpoint>) -> Self {
        Self {
            endpoint,
            impls: Mutex::new(Vec::new()),
            links: Mutex::new(HashMap::new()),
            passive_timeout: DEFAULT_PASSIVE_TIMEOUT,
        }
    }

    /// Adjust the passive-side association bound.
    pub fn with_passive_timeout(mut self, timeout: Duration) -> Self {
        self.passive_timeout = timeout;
        self
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Resolve this entity's transport configuration and retain the
    /// QoS-compatible instances.
    ///
    /// `chain` lists entity names nearest-first (writer, publisher,
    /// participant); the registry's global config is the last resort.
    /// Fails with `NotConfigured` when nothing resolves.
    pub fn enable_transport(
        &self,
        chain: &[&str],
        registry: &TransportRegistry,
    ) -> Result<usize> {
        let config = registry.resolve(chain).ok_or_else(|| {
            TransportError::NotConfigured(format!("entity chain {:?}", chain))
        })?;

        let mut retained = Vec::new();
        for inst in &config.insts {
            if !self.endpoint.check_transport_qos(inst) {
                log::debug!(
                    "[CLIENT] instance '{}' filtered by transport QoS",
                    inst.name
                );
                continue;
            }
            retained.push(registry.instance(inst)?);
        }

        log::debug!(
            "[CLIENT] enabled config '{}': {}/{} instances retained",
            config.name,
            retained.len(),
            config.insts.len()
        );
        let count = retained.len();
        *self.impls.lock() = retained;
        Ok(count)
    }

    /// Retained transport count (post-filter).
    pub fn transport_count(&self) -> usize {
        self.impls.lock().len()
    }

    // ========================================================================
    // Association
    // ========================================================================

    /// Establish a link to one remote peer.
    ///
    /// Tries each retained transport in preference order, skipping those
    /// that do not recognize the peer's locator. The first usable link is
    /// indexed by peer GUID. `Ok(false)` means no transport produced a
    /// link -- the caller surfaces that as an attach/QoS failure, never a
    /// silent drop.
    pub fn associate(&self, peer: &AssociationData, active: bool) -> Result<bool> {
        if self.links.lock().contains_key(&peer.remote_id) {
            log::debug!("[CLIENT] peer {:02x?} already associated", &peer.remote_id[..4]);
            return Ok(true);
        }

        let transports: Vec<Arc<dyn Transport>> = self.impls.lock().clone();
        if transports.is_empty() {
            return Err(TransportError::NotConfigured(
                "associate() before enable_transport()".to_string(),
            ));
        }

        for transport in transports {
            if transport.blob_to_key(&peer.remote_data).is_none() {
                continue;
            }
            let attempt = if active {
                transport.find_or_create_datalink(&peer.remote_data, true)
            } else {
                transport.accept_datalink(&peer.remote_data, self.passive_timeout)
            };
            match attempt {
                Ok(link) => {
                    link.add_observer(
                        self.endpoint.repo_id(),
                        Arc::new(LossForwarder {
                            endpoint: Arc::clone(&self.endpoint),
                        }),
                    );
                    log::debug!(
                        "[CLIENT] peer {:02x?} associated via {} ({})",
                        &peer.remote_id[..4],
                        transport.inst().name,
                        link.remote()
                    );
                    self.links.lock().insert(
                        peer.remote_id,
                        Association { link, transport },
                    );
                    return Ok(true);
                }
                Err(err) => {
                    log::debug!(
                        "[CLIENT] instance '{}' failed for peer {:02x?}: {}",
                        transport.inst().name,
                        &peer.remote_id[..4],
                        err
                    );
                }
            }
        }
        Ok(false)
    }

    /// Drop the association with a peer, releasing the underlying link.
    ///
    /// Returns false when the peer was not associated.
    pub fn disassociate(&self, peer_id: &Guid) -> bool {
        let Some(association) = self.links.lock().remove(peer_id) else {
            return false;
        };
        association.link.remove_observer(&self.endpoint.repo_id());
        association.transport.release_datalink(&association.link);
        log::debug!("[CLIENT] peer {:02x?} disassociated", &peer_id[..4]);
        true
    }

    /// Release every association (entity teardown).
    pub fn detach_all(&self) {
        let drained: Vec<(Guid, Association)> = self.links.lock().drain().collect();
        for (peer_id, association) in drained {
            association.link.remove_observer(&self.endpoint.repo_id());
            association.transport.release_datalink(&association.link);
            log::debug!("[CLIENT] peer {:02x?} detached", &peer_id[..4]);
        }
    }

    /// Currently associated peer GUIDs.
    pub fn associated_peers(&self) -> Vec<Guid> {
        self.links.lock().keys().copied().collect()
    }

    /// Number of active associations.
    pub fn association_count(&self) -> usize {
        self.links.lock().len()
    }

    // ========================================================================
    // Outbound fan-out
    // ========================================================================

    /// Hand a sample list to every associated link, in list order.
    ///
    /// Never blocks: each link's backpressure state decides whether data
    /// transmits now or queues. Per-sample delivery lands on `listener`.
    pub fn send(
        &self,
        elements: &[DataSampleElement],
        listener: Option<Arc<dyn SendListener>>,
    ) {
        let links: Vec<Arc<DataLink>> = self
            .links
            .lock()
            .values()
            .map(|a| Arc::clone(&a.link))
            .collect();

        for element in elements {
            for link in &links {
                let status = link.send(element, listener.clone());
                if status == SendStatus::Rejected {
                    log::debug!(
                        "[CLIENT] sample {} rejected by {}",
                        element.sample_id,
                        link.remote()
                    );
                }
            }
        }
    }

    /// Hand a control message to every associated link.
    ///
    /// Returns how many links accepted (sent or queued) it.
    pub fn send_control(&self, payload: &[u8]) -> usize {
        let links: Vec<Arc<DataLink>> = self
            .links
            .lock()
            .values()
            .map(|a| Arc::clone(&a.link))
            .collect();

        links
            .iter()
            .filter(|link| link.send_control(payload) != SendStatus::Rejected)
            .count()
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.detach_all();
    }
}

/// Routes link loss into the owning entity's callback.
struct LossForwarder {
    endpoint: Arc<dyn ClientEndpoint>,
}

impl LinkObserver for LossForwarder {
    fn on_link_lost(&self, remote: &RemoteAddress) {
        self.endpoint.on_link_lost(remote);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstConfig, TcpInst, TransportKind, UdpInst};
    use crate::strategy::recv::{ReceiveListener, ReceivedDataSample};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    struct TestEndpoint {
        id: Guid,
        reject_kind: Option<TransportKind>,
        lost: AtomicUsize,
    }

    impl TestEndpoint {
        fn new(seed: u8) -> Arc<Self> {
            Arc::new(Self {
                id: [seed; 16],
                reject_kind: None,
                lost: AtomicUsize::new(0),
            })
        }
    }

    impl ClientEndpoint for TestEndpoint {
        fn repo_id(&self) -> Guid {
            self.id
        }
        fn check_transport_qos(&self, inst: &TransportInst) -> bool {
            Some(inst.kind()) != self.reject_kind
        }
        fn on_link_lost(&self, _remote: &RemoteAddress) {
            self.lost.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn udp_registry(inst_name: &str, config_name: &str) -> TransportRegistry {
        let registry = TransportRegistry::new();
        registry
            .register_inst(TransportInst::new(
                inst_name,
                InstConfig::Udp(UdpInst {
                    local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                    ..Default::default()
                }),
            ))
            .unwrap();
        registry.create_config(config_name, &[inst_name]).unwrap();
        registry.set_global_config(config_name).unwrap();
        registry
    }

    #[test]
    fn test_enable_transport_requires_config() {
        let registry = TransportRegistry::new();
        let client = TransportClient::new(TestEndpoint::new(1));

        let err = client.enable_transport(&["w1", "p1"], &registry).unwrap_err();
        assert!(matches!(err, TransportError::NotConfigured(_)));
    }

    #[test]
    fn test_enable_transport_applies_qos_filter() {
        let registry = udp_registry("u_filter", "c_filter");
        let endpoint = Arc::new(TestEndpoint {
            id: [2u8; 16],
            reject_kind: Some(TransportKind::Udp),
            lost: AtomicUsize::new(0),
        });
        let client = TransportClient::new(endpoint);

        let retained = client.enable_transport(&["w1"], &registry).unwrap();
        assert_eq!(retained, 0);

        registry.shutdown_all();
    }

    #[test]
    fn test_associate_and_send_over_udp() {
        let registry = udp_registry("u_assoc", "c_assoc");

        // Peer side: a plain UDP transport we can attach a listener to.
        let peer_inst = registry
            .register_inst(TransportInst::new(
                "u_peer",
                InstConfig::Udp(UdpInst {
                    local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                    ..Default::default()
                }),
            ))
            .unwrap();
        let peer_transport = registry.instance(&peer_inst).unwrap();

        let client = TransportClient::new(TestEndpoint::new(3));
        client.enable_transport(&["w1"], &registry).unwrap();

        let peer = AssociationData::new([9u8; 16], peer_transport.local_locator());
        assert!(client.associate(&peer, true).unwrap());
        assert_eq!(client.association_count(), 1);

        // Duplicate association is a no-op success.
        assert!(client.associate(&peer, true).unwrap());
        assert_eq!(client.association_count(), 1);

        // Wire a listener on the peer's side of the link and send.
        let client_transport = {
            let inst = registry.get_inst("u_assoc").unwrap();
            registry.instance(&inst).unwrap()
        };
        let back_link = peer_transport
            .find_or_create_datalink(&client_transport.local_locator(), false)
            .unwrap();

        let (tx, rx) = mpsc::channel();
        struct Tx(std::sync::Mutex<mpsc::Sender<Vec<u8>>>);
        impl ReceiveListener for Tx {
            fn deliver_sample(&self, sample: &ReceivedDataSample) {
                let _ = self.0.lock().unwrap().send(sample.payload.clone());
            }
        }
        back_link
            .receive_strategy()
            .add_listener([5u8; 16], Arc::new(Tx(std::sync::Mutex::new(tx))));

        let samples = [
            DataSampleElement::new(1, 0, b"one".to_vec()),
            DataSampleElement::new(2, 0, b"two".to_vec()),
        ];
        client.send(&samples, None);

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"one");
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"two");

        assert!(client.disassociate(&peer.remote_id));
        assert!(!client.disassociate(&peer.remote_id));
        assert_eq!(client.association_count(), 0);

        peer_transport.release_datalink(&back_link);
        registry.shutdown_all();
    }

    #[test]
    fn test_associate_unrecognized_blob_returns_false() {
        let registry = udp_registry("u_blob", "c_blob");
        let client = TransportClient::new(TestEndpoint::new(4));
        client.enable_transport(&["w1"], &registry).unwrap();

        // A TCP locator is invisible to a UDP-only config.
        let peer = AssociationData::new(
            [8u8; 16],
            RemoteAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], 4000))).to_blob(),
        );
        assert!(!client.associate(&peer, true).unwrap());
        assert_eq!(client.association_count(), 0);

        registry.shutdown_all();
    }

    #[test]
    fn test_associate_dead_tcp_peer_returns_false_bounded() {
        let registry = TransportRegistry::new();
        registry
            .register_inst(TransportInst::new(
                "t_dead",
                InstConfig::Tcp(TcpInst {
                    listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                    connect_timeout: Duration::from_millis(500),
                    ..Default::default()
                }),
            ))
            .unwrap();
        registry.create_config("c_dead", &["t_dead"]).unwrap();
        registry.set_global_config("c_dead").unwrap();

        let client = TransportClient::new(TestEndpoint::new(5));
        client.enable_transport(&["w1"], &registry).unwrap();

        // Nobody listens on this port.
        let dead_port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let peer = AssociationData::new(
            [7u8; 16],
            RemoteAddress::Tcp(SocketAddr::from(([127, 0, 0, 1], dead_port))).to_blob(),
        );

        let start = std::time::Instant::now();
        assert!(!client.associate(&peer, true).unwrap());
        assert!(start.elapsed() < Duration::from_secs(5), "must not hang");

        registry.shutdown_all();
    }
}
