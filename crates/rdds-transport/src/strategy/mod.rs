// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! Per-link send and receive pipelines.
//!
//! Every `DataLink` owns one send strategy (outbound queuing and
//! backpressure) and one receive strategy (inbound listener fan-out). The
//! strategies are transport-agnostic; the transport-specific part is the
//! [`send::WireSender`] each transport wires in.

pub mod recv;
pub mod send;

pub use recv::{ReceiveListener, ReceiveStrategy, ReceivedDataSample};
pub use send::{
    SendListener, SendMode, SendOutcome, SendStrategy, SendStrategyEvents, WireSender,
};
