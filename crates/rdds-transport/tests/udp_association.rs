// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! End-to-end association over UDP through the public API.
//!
//! Covers the full path: registry setup, transport resolution, peer
//! association by locator blob, sample fan-out, delivery callbacks, and
//! teardown accounting.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use rdds_transport::{
    AssociationData, ClientEndpoint, DataSampleElement, Guid, InstConfig, ReceiveListener,
    ReceivedDataSample, RemoteAddress, SendListener, TransportClient, TransportInst,
    TransportRegistry, UdpInst,
};

struct Endpoint {
    id: Guid,
    lost: AtomicUsize,
}

impl Endpoint {
    fn new(seed: u8) -> Arc<Self> {
        Arc::new(Self {
            id: [seed; 16],
            lost: AtomicUsize::new(0),
        })
    }
}

impl ClientEndpoint for Endpoint {
    fn repo_id(&self) -> Guid {
        self.id
    }
    fn on_link_lost(&self, _remote: &RemoteAddress) {
        self.lost.fetch_add(1, Ordering::Relaxed);
    }
}

struct Collector(Mutex<mpsc::Sender<Vec<u8>>>);

impl ReceiveListener for Collector {
    fn deliver_sample(&self, sample: &ReceivedDataSample) {
        let _ = self
            .0
            .lock()
            .expect("collector lock poisoned")
            .send(sample.payload.clone());
    }
}

struct DeliveryCounter {
    delivered: AtomicUsize,
}

impl SendListener for DeliveryCounter {
    fn data_delivered(&self, _sample_id: u64) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }
    fn data_dropped(&self, _sample_id: u64, _dropped_by_transport: bool) {}
}

fn udp_registry(inst: &str, config: &str) -> TransportRegistry {
    let registry = TransportRegistry::new();
    registry
        .register_inst(TransportInst::new(
            inst,
            InstConfig::Udp(UdpInst {
                local_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..Default::default()
            }),
        ))
        .expect("register inst");
    registry.create_config(config, &[inst]).expect("create config");
    registry.set_global_config(config).expect("set global");
    registry
}

#[test]
fn test_two_clients_exchange_samples() {
    let registry_a = udp_registry("udp_a", "cfg_a");
    let registry_b = udp_registry("udp_b", "cfg_b");

    let writer = TransportClient::new(Endpoint::new(1));
    writer
        .enable_transport(&["writer1", "pub1", "part1"], &registry_a)
        .expect("enable writer transport");

    let reader = TransportClient::new(Endpoint::new(2));
    reader
        .enable_transport(&["reader1", "sub1", "part2"], &registry_b)
        .expect("enable reader transport");

    // Exchange locators the way discovery would.
    let inst_a = registry_a.get_inst("udp_a").expect("inst a");
    let transport_a = registry_a.instance(&inst_a).expect("live a");
    let inst_b = registry_b.get_inst("udp_b").expect("inst b");
    let transport_b = registry_b.instance(&inst_b).expect("live b");

    assert!(writer
        .associate(
            &AssociationData::new([0xB; 16], transport_b.local_locator()),
            true,
        )
        .expect("writer associate"));
    assert!(reader
        .associate(
            &AssociationData::new([0xA; 16], transport_a.local_locator()),
            false,
        )
        .expect("reader associate"));

    // Attach a listener on the reader's side of its link back to the
    // writer, then push samples with delivery accounting.
    let reader_link = transport_b
        .find_or_create_datalink(&transport_a.local_locator(), false)
        .expect("reader link");
    let (tx, rx) = mpsc::channel();
    reader_link
        .receive_strategy()
        .add_listener([3u8; 16], Arc::new(Collector(Mutex::new(tx))));

    let counter = Arc::new(DeliveryCounter {
        delivered: AtomicUsize::new(0),
    });
    let samples = [
        DataSampleElement::new(1, 0, b"alpha".to_vec()),
        DataSampleElement::new(2, 0, b"beta".to_vec()),
        DataSampleElement::new(3, 0, b"gamma".to_vec()),
    ];
    writer.send(&samples, Some(counter.clone() as Arc<dyn SendListener>));

    // FIFO per link.
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("alpha"), b"alpha");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("beta"), b"beta");
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("gamma"), b"gamma");
    assert_eq!(counter.delivered.load(Ordering::Relaxed), 3);

    // Control messages share the link path.
    assert_eq!(writer.send_control(b"ctrl"), 1);
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).expect("ctrl"), b"ctrl");

    transport_b.release_datalink(&reader_link);
    writer.detach_all();
    reader.detach_all();
    registry_a.shutdown_all();
    registry_b.shutdown_all();
}

#[test]
fn test_associate_completes_promptly_without_peer() {
    // Connectionless transport: association toward a silent address must
    // complete immediately, never hang.
    let registry = udp_registry("udp_lonely", "cfg_lonely");
    let client = TransportClient::new(Endpoint::new(7));
    client
        .enable_transport(&["w", "p"], &registry)
        .expect("enable transport");

    let silent = RemoteAddress::Udp(SocketAddr::from(([127, 0, 0, 1], 49_999))).to_blob();
    let start = Instant::now();
    let associated = client
        .associate(&AssociationData::new([0xC; 16], silent), true)
        .expect("associate");
    assert!(associated, "connectionless association is structural");
    assert!(start.elapsed() < Duration::from_secs(1), "must not block");

    client.detach_all();
    registry.shutdown_all();
}

#[test]
fn test_release_balances_attachments() {
    let registry = udp_registry("udp_bal", "cfg_bal");
    let inst = registry.get_inst("udp_bal").expect("inst");
    let transport = registry.instance(&inst).expect("live");

    let peer = RemoteAddress::Udp(SocketAddr::from(([127, 0, 0, 1], 48_100))).to_blob();
    let a = transport.find_or_create_datalink(&peer, true).expect("first");
    let b = transport.find_or_create_datalink(&peer, true).expect("second");
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.attachments(), 2);

    transport.release_datalink(&b);
    assert_eq!(a.attachments(), 1);
    assert_eq!(a.state(), rdds_transport::LinkState::Connected);

    transport.release_datalink(&a);
    assert_eq!(a.state(), rdds_transport::LinkState::Shutdown);

    registry.shutdown_all();
}
