// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Radio-side DLEP signal processing.
//!
//! The engine owns every session of the radio, feeds inbound signal
//! frames through the per-session state machine and mirrors layer-2
//! database events into DESTINATION_UP/UPDATE/DOWN announcements with
//! acknowledgement tracking. Layer-2 events arrive through the class
//! registry's extension hooks, so the engine never polls the database.

use std::any::Any;
use std::cell::RefCell;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::config::DLEP_DEFAULT_LATENCY_US;
use crate::layer2::{
    L2DestinationEvent, L2NeighMetric, L2NeighborEvent, Layer2Db, MacAddr, L2_CLASS_DESTINATION,
    L2_CLASS_NEIGHBOR,
};
use crate::runtime::class::ClassObserver;
use crate::runtime::{ClassError, Core, ExtensionSpec};

use super::iana::{Signal, Status, TlvType};
use super::session::{
    DlepSession, LocalNeighbor, NeighborState, SessionCfg, SessionId, SessionInfo, SessionPhase,
};
use super::tlv::{parse_signal, DlepError, SignalWriter, TlvMap};

/// Metric-to-TLV mapping used for destination announcements and the
/// initialization ack.
const METRIC_TLVS: [(L2NeighMetric, TlvType); 3] = [
    (L2NeighMetric::TxMaxBitrate, TlvType::MaxDataRateTx),
    (L2NeighMetric::RxBitrate, TlvType::CurrentDataRateRx),
    (L2NeighMetric::Latency, TlvType::Latency),
];

/// Defaults filled into the layer-2 network before the init ack.
const MANDATORY_DEFAULTS: [(L2NeighMetric, i64); 3] = [
    (L2NeighMetric::TxMaxBitrate, 0),
    (L2NeighMetric::RxBitrate, 0),
    (L2NeighMetric::Latency, DLEP_DEFAULT_LATENCY_US),
];

/// Radio-wide configuration.
#[derive(Debug, Clone, Default)]
pub struct RadioCfg {
    /// Configuration applied to each new session.
    pub session: SessionCfg,
    /// Extension ids this radio implements.
    pub extensions: Vec<u16>,
    /// IPv4 connection point announced in PEER_OFFER.
    pub local_ipv4: Option<(Ipv4Addr, u16)>,
    /// IPv6 connection point announced in PEER_OFFER.
    pub local_ipv6: Option<(Ipv6Addr, u16)>,
}

struct RadioState {
    core: Core,
    l2: Layer2Db,
    cfg: RadioCfg,
    sessions: std::collections::BTreeMap<SessionId, DlepSession>,
    next_session: u64,
    on_output: Option<Rc<dyn Fn(SessionId)>>,
    on_closed: Option<Rc<dyn Fn(SessionId)>>,
    weak_self: Weak<RefCell<RadioState>>,
}

/// Deferred hook invocations collected while the state is borrowed.
#[derive(Default)]
struct Notices {
    output: Vec<SessionId>,
    closed: Vec<SessionId>,
}

impl Notices {
    fn output(&mut self, id: SessionId) {
        if !self.output.contains(&id) {
            self.output.push(id);
        }
    }

    fn closed(&mut self, id: SessionId) {
        if !self.closed.contains(&id) {
            self.closed.push(id);
        }
    }
}

/// Handle to the radio engine.
#[derive(Clone)]
pub struct DlepRadio {
    state: Rc<RefCell<RadioState>>,
}

impl DlepRadio {
    pub fn new(core: Core, l2: Layer2Db, cfg: RadioCfg) -> Self {
        let state = Rc::new(RefCell::new(RadioState {
            core,
            l2,
            cfg,
            sessions: std::collections::BTreeMap::new(),
            next_session: 1,
            on_output: None,
            on_closed: None,
            weak_self: Weak::new(),
        }));
        state.borrow_mut().weak_self = Rc::downgrade(&state);
        Self { state }
    }

    /// Hook invoked whenever a session has frames ready for the wire.
    pub fn set_output_hook(&self, hook: Rc<dyn Fn(SessionId)>) {
        self.state.borrow_mut().on_output = Some(hook);
    }

    /// Hook invoked when the engine closes a session on its own.
    pub fn set_closed_hook(&self, hook: Rc<dyn Fn(SessionId)>) {
        self.state.borrow_mut().on_closed = Some(hook);
    }

    /// Subscribe to layer-2 neighbor and destination events.
    pub fn register_observers(&self) -> Result<(), ClassError> {
        let classes = self.state.borrow().core.classes.clone();
        let mut classes = classes.borrow_mut();
        classes.extension_register(ExtensionSpec {
            ext_name: "dlep radio",
            class_name: L2_CLASS_NEIGHBOR,
            size: 0,
            observer: Some(Rc::new(NeighborListener {
                radio: Rc::downgrade(&self.state),
            })),
        })?;
        classes.extension_register(ExtensionSpec {
            ext_name: "dlep radio",
            class_name: L2_CLASS_DESTINATION,
            size: 0,
            observer: Some(Rc::new(DestinationListener {
                radio: Rc::downgrade(&self.state),
            })),
        })?;
        Ok(())
    }

    /// Create a session for a router peer on a layer-2 network.
    ///
    /// The session waits for PEER_INITIALIZATION; the remote-heartbeat
    /// watchdog already runs so a silent peer is dropped.
    pub fn session_add(&self, network: &str) -> SessionId {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let id = SessionId(state.next_session);
        state.next_session += 1;

        let weak = Rc::downgrade(&self.state);
        let heartbeat_timer = state.core.timers.borrow_mut().add("dlep local heartbeat", {
            let weak = weak.clone();
            Rc::new(move |_| {
                if let Some(radio) = upgrade(&weak) {
                    radio.on_local_heartbeat(id);
                }
            })
        });
        let watchdog_timer = state.core.timers.borrow_mut().add("dlep heartbeat watchdog", {
            let weak = weak.clone();
            Rc::new(move |_| {
                if let Some(radio) = upgrade(&weak) {
                    radio.on_watchdog(id);
                }
            })
        });

        let session = DlepSession::new(
            id,
            network.to_string(),
            state.cfg.session.clone(),
            heartbeat_timer,
            watchdog_timer,
        );
        state
            .core
            .timers
            .borrow_mut()
            .set(watchdog_timer, session.remote_heartbeat * 2);
        log::info!("[DLEP] session {:?} created on '{}'", id, network);
        state.sessions.insert(id, session);
        id
    }

    /// Release a session (transport closed it or gave up).
    pub fn session_remove(&self, id: SessionId) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        release_session(state, id);
    }

    /// Feed one inbound signal frame into a session.
    ///
    /// An error means the session is unusable (malformed signal or a
    /// failed initialization); the caller should tear it down.
    pub fn handle_frame(&self, id: SessionId, frame: &[u8]) -> Result<(), DlepError> {
        let mut notices = Notices::default();
        let result = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            handle_frame_inner(state, id, frame, &mut notices)
        };
        self.dispatch(notices);
        result
    }

    /// Build the PEER_OFFER answer for a discovery signal.
    pub fn peer_offer_frame(&self) -> Result<Vec<u8>, DlepError> {
        let state = self.state.borrow();
        let mut writer = SignalWriter::new(Signal::PeerOffer);
        if let Some((addr, port)) = state.cfg.local_ipv4 {
            writer.add_ipv4_connection_point(addr, port);
        }
        if let Some((addr, port)) = state.cfg.local_ipv6 {
            writer.add_ipv6_connection_point(addr, port);
        }
        writer.finish()
    }

    /// Answer a UDP discovery datagram; `None` for anything else.
    pub fn handle_discovery(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        match parse_signal(datagram) {
            Ok((Signal::PeerDiscovery, _)) => self.peer_offer_frame().ok(),
            Ok(_) => None,
            Err(err) => {
                log::warn!("[DLEP] malformed discovery datagram: {}", err);
                None
            }
        }
    }

    /// Pop queued outbound frames of a session.
    pub fn take_output(&self, id: SessionId) -> Vec<Vec<u8>> {
        self.state
            .borrow_mut()
            .sessions
            .get_mut(&id)
            .map(DlepSession::take_output)
            .unwrap_or_default()
    }

    /// Snapshot of every session for the admin surface.
    pub fn session_info(&self) -> Vec<SessionInfo> {
        self.state
            .borrow()
            .sessions
            .values()
            .map(|s| SessionInfo {
                id: s.id,
                network: s.network.clone(),
                initialized: s.initialized(),
                phase: s.phase,
                remote_heartbeat: s.remote_heartbeat,
                neighbors: s.neighbor_summaries(),
            })
            .collect()
    }

    /// Begin termination of every session (admin `dlepinfo terminate`).
    pub fn terminate_all(&self) {
        let mut notices = Notices::default();
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let ids: Vec<SessionId> = state.sessions.keys().copied().collect();
            for id in ids {
                begin_termination(state, id, Status::Okay, &mut notices);
            }
        }
        self.dispatch(notices);
    }

    fn on_local_heartbeat(&self, id: SessionId) {
        let mut notices = Notices::default();
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            if state.sessions.contains_key(&id) {
                log::debug!("[DLEP] session {:?}: heartbeat", id);
                if let Ok(frame) = SignalWriter::new(Signal::Heartbeat).finish() {
                    emit(state, id, frame, &mut notices);
                }
            }
        }
        self.dispatch(notices);
    }

    fn on_watchdog(&self, id: SessionId) {
        let mut notices = Notices::default();
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            match state.sessions.get(&id).map(|s| s.phase) {
                Some(SessionPhase::Running) => {
                    log::warn!("[DLEP] session {:?}: remote heartbeat timeout", id);
                    begin_termination(state, id, Status::TimedOut, &mut notices);
                }
                Some(SessionPhase::TerminationSent) => {
                    // termination ack never arrived, close anyway
                    close_session(state, id, &mut notices);
                }
                Some(SessionPhase::Closed) | None => {}
            }
        }
        self.dispatch(notices);
    }

    fn on_destination_timeout(&self, id: SessionId, mac: MacAddr) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        // peer is assumed unreachable for this destination
        log::debug!("[DLEP] session {:?}: destination {} timed out", id, mac);
        remove_local_neighbor(state, id, mac);
    }

    fn l2_neighbor_event(&self, event: &L2NeighborEvent, kind: L2EventKind) {
        let mut notices = Notices::default();
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let ids: Vec<SessionId> = state
                .sessions
                .values()
                .filter(|s| s.network == event.network && s.initialized())
                .filter(|s| s.phase == SessionPhase::Running)
                .filter(|s| s.cfg.send_neighbors)
                .map(|s| s.id)
                .collect();
            for id in ids {
                match kind {
                    L2EventKind::Added => {
                        neighbor_up(state, id, event.mac, None, &mut notices);
                    }
                    L2EventKind::Changed => {
                        neighbor_changed(state, id, event.mac, None, &mut notices);
                    }
                    L2EventKind::Removed => {
                        neighbor_down(state, id, event.mac, None, &mut notices);
                    }
                }
            }

            // a changed neighbor also refreshes its proxied destinations
            if matches!(kind, L2EventKind::Changed) {
                let destinations = state.l2.destinations(&event.network, event.mac);
                let proxied_ids: Vec<SessionId> = state
                    .sessions
                    .values()
                    .filter(|s| s.network == event.network && s.initialized())
                    .filter(|s| s.phase == SessionPhase::Running)
                    .filter(|s| s.cfg.send_proxied)
                    .map(|s| s.id)
                    .collect();
                for id in proxied_ids {
                    for dest in &destinations {
                        neighbor_changed(state, id, *dest, Some(event.mac), &mut notices);
                    }
                }
            }
        }
        self.dispatch(notices);
    }

    fn l2_destination_event(&self, event: &L2DestinationEvent, kind: L2EventKind) {
        let mut notices = Notices::default();
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let ids: Vec<SessionId> = state
                .sessions
                .values()
                .filter(|s| s.network == event.network && s.initialized())
                .filter(|s| s.phase == SessionPhase::Running)
                .filter(|s| s.cfg.send_proxied)
                .map(|s| s.id)
                .collect();
            for id in ids {
                match kind {
                    L2EventKind::Added => neighbor_up(
                        state,
                        id,
                        event.destination,
                        Some(event.neighbor),
                        &mut notices,
                    ),
                    L2EventKind::Changed => neighbor_changed(
                        state,
                        id,
                        event.destination,
                        Some(event.neighbor),
                        &mut notices,
                    ),
                    L2EventKind::Removed => neighbor_down(
                        state,
                        id,
                        event.destination,
                        Some(event.neighbor),
                        &mut notices,
                    ),
                }
            }
        }
        self.dispatch(notices);
    }

    fn dispatch(&self, notices: Notices) {
        let (on_output, on_closed) = {
            let state = self.state.borrow();
            (state.on_output.clone(), state.on_closed.clone())
        };
        if let Some(hook) = on_output {
            for id in &notices.output {
                hook(*id);
            }
        }
        match on_closed {
            Some(hook) => {
                for id in &notices.closed {
                    hook(*id);
                }
            }
            // no transport owner: release closed sessions directly
            None => {
                for id in &notices.closed {
                    self.session_remove(*id);
                }
            }
        }
    }
}

#[derive(Clone, Copy)]
enum L2EventKind {
    Added,
    Changed,
    Removed,
}

fn upgrade(weak: &Weak<RefCell<RadioState>>) -> Option<DlepRadio> {
    weak.upgrade().map(|state| DlepRadio { state })
}

struct NeighborListener {
    radio: Weak<RefCell<RadioState>>,
}

impl ClassObserver for NeighborListener {
    fn on_added(&self, subject: &dyn Any) {
        if let (Some(radio), Some(event)) =
            (upgrade(&self.radio), subject.downcast_ref::<L2NeighborEvent>())
        {
            radio.l2_neighbor_event(event, L2EventKind::Added);
        }
    }

    fn on_changed(&self, subject: &dyn Any) {
        if let (Some(radio), Some(event)) =
            (upgrade(&self.radio), subject.downcast_ref::<L2NeighborEvent>())
        {
            radio.l2_neighbor_event(event, L2EventKind::Changed);
        }
    }

    fn on_removed(&self, subject: &dyn Any) {
        if let (Some(radio), Some(event)) =
            (upgrade(&self.radio), subject.downcast_ref::<L2NeighborEvent>())
        {
            radio.l2_neighbor_event(event, L2EventKind::Removed);
        }
    }
}

struct DestinationListener {
    radio: Weak<RefCell<RadioState>>,
}

impl ClassObserver for DestinationListener {
    fn on_added(&self, subject: &dyn Any) {
        if let (Some(radio), Some(event)) = (
            upgrade(&self.radio),
            subject.downcast_ref::<L2DestinationEvent>(),
        ) {
            radio.l2_destination_event(event, L2EventKind::Added);
        }
    }

    fn on_removed(&self, subject: &dyn Any) {
        if let (Some(radio), Some(event)) = (
            upgrade(&self.radio),
            subject.downcast_ref::<L2DestinationEvent>(),
        ) {
            radio.l2_destination_event(event, L2EventKind::Removed);
        }
    }
}

// ---------------------------------------------------------------------------
// signal processing
// ---------------------------------------------------------------------------

fn handle_frame_inner(
    state: &mut RadioState,
    id: SessionId,
    frame: &[u8],
    notices: &mut Notices,
) -> Result<(), DlepError> {
    let (signal, tlvs) = parse_signal(frame)?;

    let Some(session) = state.sessions.get(&id) else {
        return Ok(());
    };
    if session.phase == SessionPhase::Closed {
        return Ok(());
    }

    // any inbound traffic proves the peer is alive
    let watchdog = session.watchdog_timer;
    let remote = session.remote_heartbeat;
    if session.phase == SessionPhase::Running {
        state.core.timers.borrow_mut().set(watchdog, remote * 2);
    }

    log::debug!("[DLEP] session {:?}: received {}", id, signal.name());

    // signals outside the expected one are ignored until initialization,
    // except termination handling and liveness
    if let Some(expected) = session.next_expected {
        let always_allowed = matches!(
            signal,
            Signal::PeerTermination | Signal::PeerTerminationAck | Signal::Heartbeat
        );
        if signal != expected && !always_allowed {
            log::debug!(
                "[DLEP] session {:?}: ignoring {} while waiting for {}",
                id,
                signal.name(),
                expected.name()
            );
            return Ok(());
        }
    }

    match signal {
        Signal::PeerDiscovery => {
            let offer = write_peer_offer(state)?;
            emit(state, id, offer, notices);
        }
        Signal::PeerInitialization => {
            process_peer_init(state, id, &tlvs, notices)?;
        }
        Signal::PeerUpdate => {
            // IP address exchange with the router is not supported
            let mut writer = SignalWriter::new(Signal::PeerUpdateAck);
            writer.add_status(Status::Okay);
            emit(state, id, writer.finish()?, notices);
        }
        Signal::PeerUpdateAck => {
            log::debug!(
                "[DLEP] session {:?}: peer update status {:?}",
                id,
                tlvs.status()?
            );
        }
        Signal::PeerTermination => {
            let mut writer = SignalWriter::new(Signal::PeerTerminationAck);
            writer.add_status(Status::Okay);
            emit(state, id, writer.finish()?, notices);
            close_session(state, id, notices);
        }
        Signal::PeerTerminationAck => {
            if state.sessions.get(&id).is_some_and(|s| s.phase == SessionPhase::TerminationSent)
            {
                close_session(state, id, notices);
            }
        }
        Signal::DestinationUp => {
            // echo the ack; address exchange is not supported
            let mac = tlvs.mac()?;
            let mut writer = SignalWriter::new(Signal::DestinationUpAck);
            writer.add_mac(mac);
            writer.add_status(Status::Okay);
            emit(state, id, writer.finish()?, notices);
        }
        Signal::DestinationUpAck => {
            process_destination_up_ack(state, id, &tlvs, notices)?;
        }
        Signal::DestinationDown => {
            let mac = tlvs.mac()?;
            let mut writer = SignalWriter::new(Signal::DestinationDownAck);
            writer.add_mac(mac);
            writer.add_status(Status::Okay);
            emit(state, id, writer.finish()?, notices);
        }
        Signal::DestinationDownAck => {
            let mac = tlvs.mac()?;
            if tlvs.status()? == Status::Okay {
                let mut acked = false;
                if let Some(local) = state
                    .sessions
                    .get_mut(&id)
                    .and_then(|s| s.neighbor_mut(mac))
                {
                    if local.state == NeighborState::DownSent {
                        local.state = NeighborState::DownAcked;
                        acked = true;
                    }
                }
                // a neighbor that reached DOWN_ACKED leaves the table
                if acked {
                    remove_local_neighbor(state, id, mac);
                }
            }
        }
        Signal::DestinationUpdate | Signal::LinkCharacteristicsRequest => {}
        Signal::Heartbeat => {
            log::trace!("[DLEP] session {:?}: heartbeat from peer", id);
        }
        Signal::PeerOffer
        | Signal::PeerInitializationAck
        | Signal::LinkCharacteristicsAck => {
            // router-side signals, nothing for the radio to do
        }
    }
    Ok(())
}

fn process_peer_init(
    state: &mut RadioState,
    id: SessionId,
    tlvs: &TlvMap<'_>,
    notices: &mut Notices,
) -> Result<(), DlepError> {
    let remote_heartbeat = tlvs.heartbeat_interval().map_err(|err| {
        log::warn!("[DLEP] session {:?}: no heartbeat tlv, should not happen", id);
        err
    })?;

    if let Some(peer_type) = tlvs.peer_type() {
        log::info!("[DLEP] session {:?}: peer type '{}'", id, peer_type);
    }

    let offered = tlvs.extensions_supported();
    let (network, heartbeat_interval, heartbeat_timer, watchdog_timer) = {
        let session = state.sessions.get_mut(&id).expect("session exists");
        session.remote_heartbeat = remote_heartbeat;
        session.extensions = offered
            .iter()
            .copied()
            .filter(|ext| state.cfg.extensions.contains(ext))
            .collect();
        (
            session.network.clone(),
            session.cfg.heartbeat_interval,
            session.heartbeat_timer,
            session.watchdog_timer,
        )
    };
    log::debug!(
        "[DLEP] session {:?}: remote heartbeat interval {:?}",
        id,
        remote_heartbeat
    );

    {
        let mut timers = state.core.timers.borrow_mut();
        timers.set_periodic(heartbeat_timer, heartbeat_interval);
        timers.set(watchdog_timer, remote_heartbeat * 2);
    }

    let ack = write_peer_init_ack(state, &network, heartbeat_interval)?;
    emit(state, id, ack, notices);

    // announce everything already in the layer-2 database
    let (send_neighbors, send_proxied) = {
        let session = state.sessions.get(&id).expect("session exists");
        (session.cfg.send_neighbors, session.cfg.send_proxied)
    };
    for mac in state.l2.neighbors(&network) {
        if send_neighbors {
            neighbor_up(state, id, mac, None, notices);
        }
        if send_proxied {
            for dest in state.l2.destinations(&network, mac) {
                neighbor_up(state, id, dest, Some(mac), notices);
            }
        }
    }

    if let Some(session) = state.sessions.get_mut(&id) {
        session.next_expected = None;
    }
    Ok(())
}

fn process_destination_up_ack(
    state: &mut RadioState,
    id: SessionId,
    tlvs: &TlvMap<'_>,
    notices: &mut Notices,
) -> Result<(), DlepError> {
    let mac = tlvs.mac()?;
    if tlvs.status()? != Status::Okay {
        log::warn!(
            "[DLEP] session {:?}: destination {} refused by peer",
            id,
            mac
        );
        return Ok(());
    }

    let (ack_timer, was_changed) = {
        let Some(session) = state.sessions.get_mut(&id) else {
            return Ok(());
        };
        let Some(local) = session.neighbor_mut(mac) else {
            return Ok(());
        };
        if local.state != NeighborState::UpSent {
            return Ok(());
        }
        local.state = NeighborState::UpAcked;
        let was_changed = local.changed;
        local.changed = false;
        (local.ack_timer, was_changed)
    };

    state.core.timers.borrow_mut().stop(ack_timer);
    if was_changed {
        let update = write_destination_signal(state, id, Signal::DestinationUpdate, mac)?;
        emit(state, id, update, notices);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// signal writers
// ---------------------------------------------------------------------------

fn write_peer_offer(state: &RadioState) -> Result<Vec<u8>, DlepError> {
    let mut writer = SignalWriter::new(Signal::PeerOffer);
    if let Some((addr, port)) = state.cfg.local_ipv4 {
        writer.add_ipv4_connection_point(addr, port);
    }
    if let Some((addr, port)) = state.cfg.local_ipv6 {
        writer.add_ipv6_connection_point(addr, port);
    }
    writer.finish()
}

fn write_peer_init_ack(
    state: &mut RadioState,
    network: &str,
    heartbeat: Duration,
) -> Result<Vec<u8>, DlepError> {
    // make sure the mandatory metric defaults are present
    state.l2.net_add(network);
    for (metric, value) in MANDATORY_DEFAULTS {
        state.l2.net_default_if_unset(network, metric, value);
    }

    let mut writer = SignalWriter::new(Signal::PeerInitializationAck);
    writer.add_status(Status::Okay);
    writer.add_heartbeat_interval(heartbeat);
    for (metric, tlv) in METRIC_TLVS {
        if let Some(value) = state.l2.net_default(network, metric) {
            writer.add_metric(tlv, value as u64);
        }
    }
    if !state.cfg.extensions.is_empty() {
        writer.add_extensions_supported(&state.cfg.extensions);
    }
    if let Some(peer_type) = &state.cfg.session.peer_type {
        writer.add_peer_type(peer_type);
    }
    writer.finish()
}

fn write_destination_signal(
    state: &RadioState,
    id: SessionId,
    signal: Signal,
    mac: MacAddr,
) -> Result<Vec<u8>, DlepError> {
    let network = state
        .sessions
        .get(&id)
        .map(|s| s.network.clone())
        .unwrap_or_default();
    let mut writer = SignalWriter::new(signal);
    writer.add_mac(mac);
    for (metric, tlv) in METRIC_TLVS {
        if let Some(value) = state.l2.neigh_metric(&network, mac, metric) {
            writer.add_metric(tlv, value as u64);
        }
    }
    writer.finish()
}

// ---------------------------------------------------------------------------
// local neighbor lifecycle
// ---------------------------------------------------------------------------

fn neighbor_up(
    state: &mut RadioState,
    id: SessionId,
    mac: MacAddr,
    proxied_parent: Option<MacAddr>,
    notices: &mut Notices,
) {
    ensure_local_neighbor(state, id, mac, proxied_parent);
    let Ok(frame) = write_destination_signal(state, id, Signal::DestinationUp, mac) else {
        return;
    };
    emit(state, id, frame, notices);
    arm_up_sent(state, id, mac);
}

fn neighbor_changed(
    state: &mut RadioState,
    id: SessionId,
    mac: MacAddr,
    proxied_parent: Option<MacAddr>,
    notices: &mut Notices,
) {
    ensure_local_neighbor(state, id, mac, proxied_parent);
    let current = state
        .sessions
        .get(&id)
        .and_then(|s| s.neighbor(mac))
        .map(|n| n.state);
    match current {
        Some(NeighborState::UpSent) => {
            // avoid racing the pending ack; remembered for later
            if let Some(local) = state
                .sessions
                .get_mut(&id)
                .and_then(|s| s.neighbor_mut(mac))
            {
                local.changed = true;
            }
        }
        Some(NeighborState::UpAcked) => {
            if let Ok(frame) = write_destination_signal(state, id, Signal::DestinationUpdate, mac)
            {
                emit(state, id, frame, notices);
            }
            if let Some(local) = state
                .sessions
                .get_mut(&id)
                .and_then(|s| s.neighbor_mut(mac))
            {
                local.changed = false;
            }
        }
        Some(NeighborState::Idle)
        | Some(NeighborState::DownSent)
        | Some(NeighborState::DownAcked) => {
            if let Ok(frame) = write_destination_signal(state, id, Signal::DestinationUp, mac) {
                emit(state, id, frame, notices);
            }
            if let Some(local) = state
                .sessions
                .get_mut(&id)
                .and_then(|s| s.neighbor_mut(mac))
            {
                local.changed = false;
            }
            arm_up_sent(state, id, mac);
        }
        None => {}
    }
}

fn neighbor_down(
    state: &mut RadioState,
    id: SessionId,
    mac: MacAddr,
    proxied_parent: Option<MacAddr>,
    notices: &mut Notices,
) {
    let matches = state
        .sessions
        .get(&id)
        .and_then(|s| s.neighbor(mac))
        .is_some_and(|n| n.proxied_parent == proxied_parent);
    if !matches {
        return;
    }

    let mut writer = SignalWriter::new(Signal::DestinationDown);
    writer.add_mac(mac);
    let Ok(frame) = writer.finish() else {
        return;
    };
    emit(state, id, frame, notices);

    let (ack_timer, heartbeat) = {
        let session = state.sessions.get_mut(&id).expect("session exists");
        let heartbeat = session.cfg.heartbeat_interval;
        let local = session.neighbor_mut(mac).expect("checked above");
        local.state = NeighborState::DownSent;
        (local.ack_timer, heartbeat)
    };
    state.core.timers.borrow_mut().set(ack_timer, heartbeat * 2);
}

fn ensure_local_neighbor(
    state: &mut RadioState,
    id: SessionId,
    mac: MacAddr,
    proxied_parent: Option<MacAddr>,
) {
    let exists = state
        .sessions
        .get(&id)
        .is_some_and(|s| s.neighbor(mac).is_some());
    if exists {
        return;
    }
    if !state.sessions.contains_key(&id) {
        return;
    }

    let weak = state.weak_self.clone();
    let ack_timer = state.core.timers.borrow_mut().add("dlep destination ack", {
        Rc::new(move |_| {
            if let Some(radio) = upgrade(&weak) {
                radio.on_destination_timeout(id, mac);
            }
        })
    });
    let session = state.sessions.get_mut(&id).expect("checked above");
    session.neighbors.insert(
        mac,
        LocalNeighbor {
            mac,
            proxied_parent,
            state: NeighborState::Idle,
            changed: false,
            ack_timer,
        },
    );
}

fn arm_up_sent(state: &mut RadioState, id: SessionId, mac: MacAddr) {
    let (ack_timer, heartbeat) = {
        let Some(session) = state.sessions.get_mut(&id) else {
            return;
        };
        let heartbeat = session.cfg.heartbeat_interval;
        let Some(local) = session.neighbor_mut(mac) else {
            return;
        };
        local.state = NeighborState::UpSent;
        (local.ack_timer, heartbeat)
    };
    state.core.timers.borrow_mut().set(ack_timer, heartbeat * 2);
}

fn remove_local_neighbor(state: &mut RadioState, id: SessionId, mac: MacAddr) {
    let removed = state
        .sessions
        .get_mut(&id)
        .and_then(|s| s.neighbors.remove(&mac));
    if let Some(local) = removed {
        state.core.timers.borrow_mut().remove(local.ack_timer);
    }
}

fn begin_termination(
    state: &mut RadioState,
    id: SessionId,
    status: Status,
    notices: &mut Notices,
) {
    let Some(session) = state.sessions.get_mut(&id) else {
        return;
    };
    if session.phase != SessionPhase::Running {
        return;
    }
    session.phase = SessionPhase::TerminationSent;
    let watchdog = session.watchdog_timer;
    let remote = session.remote_heartbeat;

    let mut writer = SignalWriter::new(Signal::PeerTermination);
    writer.add_status(status);
    if let Ok(frame) = writer.finish() {
        emit(state, id, frame, notices);
    }
    // one more watchdog period as ack grace
    state.core.timers.borrow_mut().set(watchdog, remote * 2);
}

/// Mark a session dead and notify its owner; the owner flushes remaining
/// output and then calls `session_remove`.
fn close_session(state: &mut RadioState, id: SessionId, notices: &mut Notices) {
    if let Some(session) = state.sessions.get_mut(&id) {
        session.phase = SessionPhase::Closed;
        session.next_expected = None;
        notices.closed(id);
    }
}

fn release_session(state: &mut RadioState, id: SessionId) {
    let Some(session) = state.sessions.remove(&id) else {
        return;
    };
    let mut timers = state.core.timers.borrow_mut();
    timers.remove(session.heartbeat_timer);
    timers.remove(session.watchdog_timer);
    for local in session.neighbors.values() {
        timers.remove(local.ack_timer);
    }
    log::info!("[DLEP] session {:?} released", id);
}

fn emit(state: &mut RadioState, id: SessionId, frame: Vec<u8>, notices: &mut Notices) {
    if let Some(session) = state.sessions.get_mut(&id) {
        session.queue_frame(frame);
        notices.output(id);
    }
}

// ============================================================================
// Tests
// ============================================================================
