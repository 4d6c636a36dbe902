// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DLEP radio-side session engine.
//!
//! Dynamic Link Exchange Protocol (RFC 8175) between this radio and a
//! router peer: UDP discovery, a TCP-framed TLV signal stream, per-peer
//! session state machines, heartbeat liveness and destination
//! announcements synchronized with the layer-2 database.

pub mod framing;
pub mod iana;
pub mod radio;
pub mod session;
pub mod tlv;
pub mod transport;

pub use framing::SignalFramer;
pub use iana::{Signal, Status, TlvType};
pub use radio::{DlepRadio, RadioCfg};
pub use session::{
    DlepSession, LocalNeighbor, NeighborState, SessionCfg, SessionId, SessionInfo, SessionPhase,
};
pub use tlv::{parse_signal, DlepError, SignalWriter, TlvMap};
pub use transport::RadioTransport;
