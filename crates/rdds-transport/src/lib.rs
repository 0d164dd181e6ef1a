// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! # rdds-transport - Pluggable transport core for a DDS-like middleware
//!
//! The framework that turns "send these samples to that set of readers"
//! into concrete per-link connection establishment, send/receive strategy
//! pipelines, backpressure-bounded queuing, and reference-counted link
//! lifetime management -- over TCP, UDP unicast, UDP multicast, shared
//! memory, and RTPS-framed UDP.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rdds_transport::{
//!     AssociationData, ClientEndpoint, InstConfig, TransportClient, TransportInst,
//!     TransportRegistry, UdpInst,
//! };
//!
//! struct Writer;
//! impl ClientEndpoint for Writer {
//!     fn repo_id(&self) -> [u8; 16] {
//!         [1; 16]
//!     }
//! }
//!
//! fn main() -> rdds_transport::Result<()> {
//!     let registry = TransportRegistry::new();
//!     registry.register_inst(TransportInst::new("udp1", InstConfig::Udp(UdpInst::default())))?;
//!     registry.create_config("local", &["udp1"])?;
//!     registry.set_global_config("local")?;
//!
//!     let client = TransportClient::new(Arc::new(Writer));
//!     client.enable_transport(&["writer1", "publisher1", "participant1"], &registry)?;
//!
//!     let peer_blob = /* from discovery */
//! #       rdds_transport::RemoteAddress::Udp("127.0.0.1:7400".parse().unwrap()).to_blob();
//!     let connected = client.associate(&AssociationData::new([2; 16], peer_blob), true)?;
//!     assert!(connected);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |  Entity layer (external): DataWriter / DataReader                  |
//! +--------------------------------+-----------------------------------+
//!                                  | ClientEndpoint callbacks
//! +--------------------------------v-----------------------------------+
//! |  TransportClient   associate / disassociate / send fan-out         |
//! +--------------------------------+-----------------------------------+
//!                                  | find_or_create / accept / release
//! +--------------------------------v-----------------------------------+
//! |  Transport (one per configured instance)                           |
//! |  TcpTransport | UdpTransport | MulticastTransport                  |
//! |  ShmemTransport | RtpsUdpTransport                                 |
//! +--------------------------------+-----------------------------------+
//!                                  | link table: RemoteAddress -> link
//! +--------------------------------v-----------------------------------+
//! |  DataLink   SendStrategy (backpressure) + ReceiveStrategy (demux)  |
//! |             ThreadSynchResource (bounded unclog wait)              |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Modules Overview
//!
//! - [`client`] - association and fan-out (start here)
//! - [`registry`] - named instances, configs, and bindings
//! - [`transport`] - the five concrete transports
//! - [`link`] - the per-peer link state machine
//! - [`strategy`] - send/receive pipelines
//! - [`sample`] - outbound sample bookkeeping and resource limits
//! - [`locator`] - locator blob wire formats

pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod locator;
pub mod registry;
pub mod sample;
pub mod strategy;
pub mod synch;
pub mod transport;

// Re-export the main types.
pub use client::{AssociationData, ClientEndpoint, TransportClient};
pub use config::{
    InstConfig, MulticastInst, PortMapping, RtpsUdpInst, ShmemInst, TcpInst, TransportInst,
    TransportKind, UdpInst,
};
pub use error::{Result, TransportError};
pub use link::{DataLink, LinkObserver, LinkState, SendStatus};
pub use locator::{LocatorBlob, RemoteAddress};
pub use registry::{TransportConfig, TransportRegistry};
pub use sample::{
    DataSampleElement, Guid, InstanceHandle, ResourceLimits, SendState, SendStateDataSampleList,
    WriteDataContainer,
};
pub use strategy::{
    ReceiveListener, ReceiveStrategy, ReceivedDataSample, SendListener, SendMode, SendOutcome,
    SendStrategy, WireSender,
};
pub use synch::{ThreadSynchResource, UnclogOutcome};
pub use transport::{
    LinkTable, MulticastTransport, RtpsUdpTransport, TcpTransport, Transport, UdpTransport,
};

#[cfg(target_os = "linux")]
pub use transport::ShmemTransport;
