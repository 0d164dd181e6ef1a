// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 rdds contributors

//! TCP transport: framing, reactor, and the connection manager.
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                        TcpTransport                           |
//! |  links: LinkTable<RemoteAddress -> DataLink>                  |
//! |  pending: PendingPool (identified, unclaimed inbound conns)   |
//! +------------------------------+-------------------------------+
//!                                |
//!            +-------------------+--------------------+
//!            v                                        v
//!   +-----------------+                    +---------------------+
//!   |  send strategy  |  writes socket     |      Reactor        |
//!   |  (per link)     |  directly, polls   |  mio poll loop:     |
//!   |                 |  fd on WouldBlock  |  accept + read +    |
//!   +-----------------+                    |  frame reassembly   |
//!                                          +---------------------+
//! ```
//!
//! # Modules
//!
//! - `frame` - length-prefix frame codec
//! - `reactor` - mio poll loop (accept, read, identity handshake)
//! - `transport` - the [`TcpTransport`] connection manager

pub mod frame;
mod reactor;
mod transport;

pub use frame::{FrameCodec, FRAME_HEADER_LEN};
pub use transport::TcpTransport;
