// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DLEP session state.
//!
//! One session per TCP-connected router peer. The session owns the local
//! neighbor table mirroring which layer-2 destinations have been announced
//! to this peer, the heartbeat intervals of both sides and the queue of
//! emitted frames awaiting the transport. Signal processing lives in the
//! radio engine; this module is the data model.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use crate::config::DLEP_HEARTBEAT_INTERVAL;
use crate::layer2::MacAddr;
use crate::runtime::TimerId;

use super::iana::Signal;

/// Identifier of a radio session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub u64);

/// Per-session configuration.
#[derive(Debug, Clone)]
pub struct SessionCfg {
    /// Local heartbeat interval announced to the router.
    pub heartbeat_interval: Duration,
    /// Announce plain layer-2 neighbors.
    pub send_neighbors: bool,
    /// Announce proxied destinations.
    pub send_proxied: bool,
    /// Optional peer-type string for the initialization ack.
    pub peer_type: Option<String>,
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            heartbeat_interval: DLEP_HEARTBEAT_INTERVAL,
            send_neighbors: true,
            send_proxied: false,
            peer_type: None,
        }
    }
}

/// Announcement state of one local neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    Idle,
    UpSent,
    UpAcked,
    DownSent,
    DownAcked,
}

impl NeighborState {
    pub fn name(self) -> &'static str {
        match self {
            NeighborState::Idle => "idle",
            NeighborState::UpSent => "up_sent",
            NeighborState::UpAcked => "up_acked",
            NeighborState::DownSent => "down_sent",
            NeighborState::DownAcked => "down_acked",
        }
    }
}

/// A destination announced (or being announced) to the peer.
#[derive(Debug)]
pub struct LocalNeighbor {
    pub mac: MacAddr,
    /// Parent neighbor MAC when this entry is a proxied destination.
    pub proxied_parent: Option<MacAddr>,
    pub state: NeighborState,
    /// Set when the neighbor changed while an UP was unacknowledged.
    pub changed: bool,
    /// Ack-timeout timer, armed at 2x heartbeat on every UP/DOWN send.
    pub(crate) ack_timer: TimerId,
}

/// Session teardown phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Normal operation.
    Running,
    /// PEER_TERMINATION sent, waiting for the ack.
    TerminationSent,
    /// Session is dead and awaits release by its owner.
    Closed,
}

/// Per-peer radio session.
pub struct DlepSession {
    pub id: SessionId,
    /// Layer-2 network (interface) this session serves.
    pub network: String,
    pub cfg: SessionCfg,
    /// Gate for inbound signals; `None` accepts any signal and implies the
    /// session completed initialization.
    pub next_expected: Option<Signal>,
    /// Heartbeat interval announced by the router.
    pub remote_heartbeat: Duration,
    /// Extension ids negotiated with the peer.
    pub extensions: Vec<u16>,
    pub phase: SessionPhase,
    pub(crate) neighbors: BTreeMap<MacAddr, LocalNeighbor>,
    out: VecDeque<Vec<u8>>,
    pub(crate) heartbeat_timer: TimerId,
    pub(crate) watchdog_timer: TimerId,
}

impl DlepSession {
    pub(crate) fn new(
        id: SessionId,
        network: String,
        cfg: SessionCfg,
        heartbeat_timer: TimerId,
        watchdog_timer: TimerId,
    ) -> Self {
        let remote_heartbeat = cfg.heartbeat_interval;
        Self {
            id,
            network,
            cfg,
            next_expected: Some(Signal::PeerInitialization),
            remote_heartbeat,
            extensions: Vec::new(),
            phase: SessionPhase::Running,
            neighbors: BTreeMap::new(),
            out: VecDeque::new(),
            heartbeat_timer,
            watchdog_timer,
        }
    }

    /// True once initialization completed.
    pub fn initialized(&self) -> bool {
        self.next_expected.is_none()
    }

    /// Queue an emitted frame for the transport.
    pub(crate) fn queue_frame(&mut self, frame: Vec<u8>) {
        self.out.push_back(frame);
    }

    /// Pop every queued frame.
    pub fn take_output(&mut self) -> Vec<Vec<u8>> {
        self.out.drain(..).collect()
    }

    pub fn has_output(&self) -> bool {
        !self.out.is_empty()
    }

    pub fn neighbor(&self, mac: MacAddr) -> Option<&LocalNeighbor> {
        self.neighbors.get(&mac)
    }

    pub(crate) fn neighbor_mut(&mut self, mac: MacAddr) -> Option<&mut LocalNeighbor> {
        self.neighbors.get_mut(&mac)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.len()
    }

    /// Snapshot for the admin surface.
    pub fn neighbor_summaries(&self) -> Vec<(MacAddr, &'static str, bool)> {
        self.neighbors
            .values()
            .map(|n| (n.mac, n.state.name(), n.changed))
            .collect()
    }
}

/// Session snapshot for the external admin surface.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub network: String,
    pub initialized: bool,
    pub phase: SessionPhase,
    pub remote_heartbeat: Duration,
    pub neighbors: Vec<(MacAddr, &'static str, bool)>,
}
