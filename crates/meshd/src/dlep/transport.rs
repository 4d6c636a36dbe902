// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket wiring for the radio engine.
//!
//! One TCP listener accepts router connections and creates a session per
//! stream; one optional UDP socket answers PEER_DISCOVERY datagrams with
//! PEER_OFFER. Frames emitted by the engine queue per session and drain
//! on write-readiness; inbound bytes run through the incremental
//! deframer and into the session state machine.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};

use mio::net::{TcpListener, TcpStream};

use crate::config::DLEP_MULTICAST_V4;
use crate::runtime::{Core, SocketId};

use super::framing::SignalFramer;
use super::radio::DlepRadio;
use super::session::SessionId;

struct SessionLink {
    stream: TcpStream,
    socket_id: SocketId,
    framer: SignalFramer,
    pending: Vec<u8>,
    closing: bool,
}

struct TransportState {
    core: Core,
    radio: DlepRadio,
    network: String,
    listener: TcpListener,
    discovery: Option<UdpSocket>,
    links: HashMap<SessionId, SessionLink>,
}

/// TCP/UDP endpoint of one radio interface.
#[derive(Clone)]
pub struct RadioTransport {
    state: Rc<RefCell<TransportState>>,
}

impl RadioTransport {
    /// Bind the listener (and optionally the discovery socket) and hook
    /// everything into the socket registrar.
    pub fn new(
        core: Core,
        radio: DlepRadio,
        network: &str,
        tcp_bind: SocketAddr,
        udp_bind: Option<SocketAddr>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(tcp_bind)?;

        let discovery = match udp_bind {
            Some(addr) => {
                let socket = socket2::Socket::new(
                    socket2::Domain::IPV4,
                    socket2::Type::DGRAM,
                    Some(socket2::Protocol::UDP),
                )?;
                socket.set_reuse_address(true)?;
                socket.set_nonblocking(true)?;
                socket.bind(&addr.into())?;
                let socket: UdpSocket = socket.into();
                let group = Ipv4Addr::from(DLEP_MULTICAST_V4);
                if let Err(err) = socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
                    log::warn!("[DLEP] cannot join discovery group {}: {}", group, err);
                }
                Some(socket)
            }
            None => None,
        };

        let transport = Self {
            state: Rc::new(RefCell::new(TransportState {
                core: core.clone(),
                radio: radio.clone(),
                network: network.to_string(),
                listener,
                discovery,
                links: HashMap::new(),
            })),
        };

        // listener readiness -> accept loop
        {
            let state = transport.state.borrow();
            let weak = Rc::downgrade(&transport.state);
            let listener_id = core.poller.borrow_mut().register(
                state.listener.as_raw_fd(),
                "dlep tcp listener",
                Rc::new(move |_| {
                    if let Some(transport) = upgrade(&weak) {
                        transport.on_accept();
                    }
                }),
            );
            core.poller.borrow_mut().set_read(listener_id, true)?;

            if let Some(discovery) = &state.discovery {
                let weak = Rc::downgrade(&transport.state);
                let discovery_id = core.poller.borrow_mut().register(
                    discovery.as_raw_fd(),
                    "dlep discovery",
                    Rc::new(move |_| {
                        if let Some(transport) = upgrade(&weak) {
                            transport.on_discovery();
                        }
                    }),
                );
                core.poller.borrow_mut().set_read(discovery_id, true)?;
            }
        }

        // engine output/teardown feed back into the socket layer
        {
            let weak = Rc::downgrade(&transport.state);
            radio.set_output_hook(Rc::new(move |id| {
                if let Some(transport) = upgrade(&weak) {
                    transport.flush_session(id);
                }
            }));
            let weak = Rc::downgrade(&transport.state);
            radio.set_closed_hook(Rc::new(move |id| {
                if let Some(transport) = upgrade(&weak) {
                    transport.on_session_closed(id);
                }
            }));
        }

        Ok(transport)
    }

    /// Local address of the TCP listener.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.state.borrow().listener.local_addr()
    }

    /// Number of live TCP sessions.
    pub fn session_count(&self) -> usize {
        self.state.borrow().links.len()
    }

    fn on_accept(&self) {
        loop {
            let accepted = self.state.borrow().listener.accept();
            match accepted {
                Ok((stream, peer)) => {
                    log::info!("[DLEP] router connection from {}", peer);
                    self.add_session_link(stream);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("[DLEP] accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn add_session_link(&self, stream: TcpStream) {
        let (radio, network, core) = {
            let state = self.state.borrow();
            (
                state.radio.clone(),
                state.network.clone(),
                state.core.clone(),
            )
        };
        let id = radio.session_add(&network);

        let weak = Rc::downgrade(&self.state);
        let socket_id = core.poller.borrow_mut().register(
            stream.as_raw_fd(),
            "dlep session",
            Rc::new(move |event| {
                if let Some(transport) = upgrade(&weak) {
                    if event.writable {
                        transport.on_writable(id);
                    }
                    if event.readable {
                        transport.on_readable(id);
                    }
                }
            }),
        );
        if let Err(err) = core.poller.borrow_mut().set_read(socket_id, true) {
            log::warn!("[DLEP] session {:?}: cannot arm read: {}", id, err);
        }

        self.state.borrow_mut().links.insert(
            id,
            SessionLink {
                stream,
                socket_id,
                framer: SignalFramer::new(),
                pending: Vec::new(),
                closing: false,
            },
        );
    }

    fn on_readable(&self, id: SessionId) {
        let radio = self.state.borrow().radio.clone();
        loop {
            // decode under the borrow, dispatch outside it: the engine's
            // output hook re-enters this transport
            let frame = {
                let mut state = self.state.borrow_mut();
                let Some(link) = state.links.get_mut(&id) else {
                    return;
                };
                match link.framer.decode(&mut link.stream) {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::info!("[DLEP] session {:?}: connection lost: {}", id, err);
                        drop(state);
                        self.teardown(id);
                        return;
                    }
                }
            };

            let Some(frame) = frame else {
                return;
            };
            if let Err(err) = radio.handle_frame(id, &frame) {
                crate::logging::warn_with_dump(
                    "[DLEP]",
                    &format!("session {:?}: protocol error: {}", id, err),
                    &frame,
                );
                self.teardown(id);
                return;
            }
            if !self.state.borrow().links.contains_key(&id) {
                // engine closed the session while handling the frame
                return;
            }
        }
    }

    fn on_writable(&self, id: SessionId) {
        self.try_flush(id);
    }

    /// Engine output hook: queue the emitted frames and try to write.
    fn flush_session(&self, id: SessionId) {
        let frames = self.state.borrow().radio.clone().take_output(id);
        if !frames.is_empty() {
            let mut state = self.state.borrow_mut();
            if let Some(link) = state.links.get_mut(&id) {
                for frame in frames {
                    link.pending.extend_from_slice(&frame);
                }
            }
        }
        self.try_flush(id);
    }

    fn try_flush(&self, id: SessionId) {
        let close_now = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(link) = state.links.get_mut(&id) else {
                return;
            };

            while !link.pending.is_empty() {
                match link.stream.write(&link.pending) {
                    Ok(0) => break,
                    Ok(n) => {
                        link.pending.drain(..n);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::warn!("[DLEP] session {:?}: write failed: {}", id, err);
                        link.pending.clear();
                        link.closing = true;
                        break;
                    }
                }
            }

            let backlog = !link.pending.is_empty();
            let socket_id = link.socket_id;
            if let Err(err) = state.core.poller.borrow_mut().set_write(socket_id, backlog) {
                log::warn!("[DLEP] session {:?}: cannot toggle write: {}", id, err);
            }
            link.closing && link.pending.is_empty()
        };

        if close_now {
            self.teardown(id);
        }
    }

    /// Engine closed the session: flush what is queued, then drop the link.
    fn on_session_closed(&self, id: SessionId) {
        if let Some(link) = self.state.borrow_mut().links.get_mut(&id) {
            link.closing = true;
        }
        self.flush_session(id);
        // teardown happens in try_flush once the backlog is written; make
        // sure the engine side is released even if the link vanished early
        if !self.state.borrow().links.contains_key(&id) {
            self.state.borrow().radio.clone().session_remove(id);
        }
    }

    fn teardown(&self, id: SessionId) {
        let link = {
            let mut state = self.state.borrow_mut();
            state.links.remove(&id)
        };
        if let Some(link) = link {
            let poller = self.state.borrow().core.poller.clone();
            if let Err(err) = poller.borrow_mut().unregister(link.socket_id) {
                log::warn!("[DLEP] session {:?}: unregister failed: {}", id, err);
            }
            log::info!("[DLEP] session {:?}: link closed", id);
        }
        self.state.borrow().radio.clone().session_remove(id);
    }

    fn on_discovery(&self) {
        let radio = self.state.borrow().radio.clone();
        loop {
            let mut buf = [0u8; 1500];
            let received = {
                let state = self.state.borrow();
                let Some(discovery) = &state.discovery else {
                    return;
                };
                discovery.recv_from(&mut buf)
            };
            match received {
                Ok((len, peer)) => {
                    if let Some(reply) = radio.handle_discovery(&buf[..len]) {
                        let state = self.state.borrow();
                        if let Some(discovery) = &state.discovery {
                            if let Err(err) = discovery.send_to(&reply, peer) {
                                log::warn!("[DLEP] peer offer to {} failed: {}", peer, err);
                            }
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("[DLEP] discovery recv failed: {}", err);
                    break;
                }
            }
        }
    }
}

fn upgrade(weak: &Weak<RefCell<TransportState>>) -> Option<RadioTransport> {
    weak.upgrade().map(|state| RadioTransport { state })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlep::iana::{Signal, Status};
    use crate::dlep::radio::RadioCfg;
    use crate::dlep::tlv::{parse_signal, SignalWriter};
    use crate::layer2::Layer2Db;
    use crate::runtime::event_loop;
    use std::io::Write as _;
    use std::time::Duration;

    fn spin(core: &Core, until: impl Fn() -> bool) {
        event_loop::run_while(core, Duration::from_secs(2), || !until()).unwrap();
    }

    #[test]
    fn test_tcp_session_end_to_end() {
        let core = Core::new(false).unwrap();
        let l2 = Layer2Db::new(core.clone()).unwrap();
        l2.net_add("wlan0");
        let radio = DlepRadio::new(core.clone(), l2.clone(), RadioCfg::default());
        radio.register_observers().unwrap();

        let transport = RadioTransport::new(
            core.clone(),
            radio.clone(),
            "wlan0",
            "127.0.0.1:0".parse().unwrap(),
            None,
        )
        .unwrap();
        let addr = transport.local_addr().unwrap();

        // router side connects and sends its initialization
        let mut router = std::net::TcpStream::connect(addr).unwrap();
        router.set_nonblocking(false).unwrap();
        router
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        spin(&core, || transport.session_count() == 1);

        let mut init = SignalWriter::new(Signal::PeerInitialization);
        init.add_heartbeat_interval(Duration::from_millis(1000));
        router.write_all(&init.finish().unwrap()).unwrap();

        spin(&core, || {
            radio.session_info().first().is_some_and(|s| s.initialized)
        });

        // the initialization ack arrives on the router socket
        let mut framer = SignalFramer::new();
        let frame = loop {
            event_loop::run_once(&core).unwrap();
            match framer.decode(&mut router) {
                Ok(Some(frame)) => break frame,
                Ok(None) => continue,
                Err(err) => panic!("router read failed: {}", err),
            }
        };
        let (signal, tlvs) = parse_signal(&frame).unwrap();
        assert_eq!(signal, Signal::PeerInitializationAck);
        assert_eq!(tlvs.status().unwrap(), Status::Okay);

        // dropping the router connection tears the session down
        drop(router);
        spin(&core, || transport.session_count() == 0);
        assert!(radio.session_info().is_empty());
    }

    #[test]
    fn test_discovery_round_trip() {
        let core = Core::new(false).unwrap();
        let l2 = Layer2Db::new(core.clone()).unwrap();
        let radio = DlepRadio::new(
            core.clone(),
            l2,
            RadioCfg {
                local_ipv4: Some(("127.0.0.1".parse().unwrap(), 854)),
                ..RadioCfg::default()
            },
        );

        let transport = RadioTransport::new(
            core.clone(),
            radio,
            "wlan0",
            "127.0.0.1:0".parse().unwrap(),
            Some("127.0.0.1:0".parse().unwrap()),
        )
        .unwrap();

        let udp_addr = {
            let state = transport.state.borrow();
            state.discovery.as_ref().unwrap().local_addr().unwrap()
        };

        let router = UdpSocket::bind("127.0.0.1:0").unwrap();
        router
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let discovery = SignalWriter::new(Signal::PeerDiscovery).finish().unwrap();
        router.send_to(&discovery, udp_addr).unwrap();

        let mut buf = [0u8; 1500];
        let len = loop {
            event_loop::run_once(&core).unwrap();
            match router.recv(&mut buf) {
                Ok(len) => break len,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                Err(err) => panic!("recv failed: {}", err),
            }
        };
        let (signal, _) = parse_signal(&buf[..len]).unwrap();
        assert_eq!(signal, Signal::PeerOffer);
    }
}
