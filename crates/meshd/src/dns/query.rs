// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-shot DNS query driver.
//!
//! One [`DnsQuery`] drives at most one query at a time: it opens a
//! non-blocking UDP socket bound to the caller-chosen source address,
//! sends the packet, waits for read-readiness and parses the matching
//! response. Every answer record is delivered through the sink in packet
//! order, then `on_done(timeout=false)` closes the query. The per-query
//! timeout fires `on_done(timeout=true)` instead. Results always arrive
//! after the sink callbacks so the sink may release the query object's
//! owner from `on_done`.

use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use rand::Rng;

use crate::config::DNS_PACKET_SIZE;
use crate::logging::warn_with_dump;
use crate::runtime::{Core, SocketId, TimerId};

use super::packet::{build_query, parse_response, QType, RecordData};

/// Typed result callbacks of a DNS query.
///
/// `qtype` is always the type of the *query* in flight, not of the
/// individual record, so a sink can attach harvested A/AAAA records to
/// the right pending result.
pub trait DnsResponseSink {
    fn on_a(&self, _qtype: QType, _addr: Ipv4Addr) {}
    fn on_aaaa(&self, _qtype: QType, _addr: Ipv6Addr) {}
    fn on_ptr(&self, _qtype: QType, _host: &str) {}
    fn on_srv(&self, _qtype: QType, _priority: u16, _weight: u16, _port: u16, _target: &str) {}

    /// Query concluded; exactly once per started query.
    fn on_done(&self, qtype: QType, timeout: bool);
}

struct ActiveQuery {
    socket: UdpSocket,
    socket_id: SocketId,
    id: u16,
    qtype: QType,
    qname: String,
}

struct QueryState {
    core: Core,
    timeout: Duration,
    sink: Rc<dyn DnsResponseSink>,
    timer: TimerId,
    active: Option<ActiveQuery>,
}

/// Handle to the query driver.
#[derive(Clone)]
pub struct DnsQuery {
    state: Rc<RefCell<QueryState>>,
}

impl DnsQuery {
    pub fn new(core: Core, sink: Rc<dyn DnsResponseSink>, timeout: Duration) -> Self {
        let state = Rc::new(RefCell::new(QueryState {
            core: core.clone(),
            timeout,
            sink,
            timer: core.timers.borrow_mut().add("dns query timeout", Rc::new(|_| {})),
            active: None,
        }));

        // now that the state cell exists, point the timer hook at it
        let weak = Rc::downgrade(&state);
        let timer = state.borrow().timer;
        core.timers.borrow_mut().remove(timer);
        let timer = core.timers.borrow_mut().add(
            "dns query timeout",
            Rc::new(move |_| {
                if let Some(query) = upgrade(&weak) {
                    query.on_timeout();
                }
            }),
        );
        state.borrow_mut().timer = timer;

        Self { state }
    }

    /// Change the default per-query timeout (`dns_query.timeout`).
    pub fn set_timeout(&self, timeout: Duration) {
        self.state.borrow_mut().timeout = timeout;
    }

    /// True while a query is outstanding.
    pub fn is_busy(&self) -> bool {
        self.state.borrow().active.is_some()
    }

    /// Start a query against `server`, binding the client socket to
    /// `source` when given.
    pub fn start(
        &self,
        qname: &str,
        qtype: QType,
        server: SocketAddr,
        source: Option<IpAddr>,
    ) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if state.active.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "dns query already in flight",
            ));
        }

        let id: u16 = rand::thread_rng().gen();
        let packet = build_query(id, qname, qtype)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;

        let domain = if server.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, None)?;
        socket.set_nonblocking(true)?;
        let bind_addr: SocketAddr = match source {
            Some(ip) => SocketAddr::new(ip, 0),
            None if server.is_ipv4() => "0.0.0.0:0".parse().unwrap(),
            None => "[::]:0".parse().unwrap(),
        };
        socket.bind(&bind_addr.into())?;
        let socket: UdpSocket = socket.into();
        socket.connect(server)?;
        socket.send(&packet)?;

        log::debug!("[DNS] query {} {} -> {}", qtype.name(), qname, server);

        let weak = Rc::downgrade(&self.state);
        let socket_id = state.core.poller.borrow_mut().register(
            socket.as_raw_fd(),
            qname,
            Rc::new(move |_| {
                if let Some(query) = upgrade(&weak) {
                    query.on_readable();
                }
            }),
        );
        state.core.poller.borrow_mut().set_read(socket_id, true)?;

        let timer = state.timer;
        let timeout = state.timeout;
        state.core.timers.borrow_mut().set(timer, timeout);

        state.active = Some(ActiveQuery {
            socket,
            socket_id,
            id,
            qtype,
            qname: qname.to_string(),
        });
        Ok(())
    }

    fn on_readable(&self) {
        let (sink, qtype, records) = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(active) = &state.active else {
                return;
            };

            let mut buf = [0u8; DNS_PACKET_SIZE];
            let response = loop {
                match active.socket.recv(&mut buf) {
                    Ok(len) => {
                        match parse_response(&buf[..len]) {
                            Ok(response) if response.id == active.id => break response,
                            Ok(response) => {
                                log::debug!(
                                    "[DNS] ignoring response with foreign id {:#06x}",
                                    response.id
                                );
                            }
                            Err(err) => {
                                warn_with_dump(
                                    "[DNS]",
                                    &format!("malformed response for '{}': {}", active.qname, err),
                                    &buf[..len],
                                );
                            }
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(err) => {
                        log::warn!("[DNS] recv failed for '{}': {}", active.qname, err);
                        return;
                    }
                }
            };

            let active = state.active.take().expect("checked above");
            finish_query(state, &active);
            (state.sink.clone(), active.qtype, response.records)
        };

        // deliver outside the borrow; the sink usually starts the next query
        for record in &records {
            match &record.data {
                RecordData::A(addr) => sink.on_a(qtype, *addr),
                RecordData::Aaaa(addr) => sink.on_aaaa(qtype, *addr),
                RecordData::Ptr(host) => sink.on_ptr(qtype, host),
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                } => sink.on_srv(qtype, *priority, *weight, *port, target),
                RecordData::Other(rtype) => {
                    log::debug!("[DNS] ignoring record type {}", rtype);
                }
            }
        }
        log::debug!("[DNS] query done");
        sink.on_done(qtype, false);
    }

    fn on_timeout(&self) {
        let finished = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            match state.active.take() {
                Some(active) => {
                    log::warn!("[DNS] query '{}' timed out", active.qname);
                    finish_query(state, &active);
                    Some((state.sink.clone(), active.qtype))
                }
                None => None,
            }
        };
        if let Some((sink, qtype)) = finished {
            sink.on_done(qtype, true);
        }
    }
}

/// Unhook socket and timer; the socket closes when `active` drops.
fn finish_query(state: &mut QueryState, active: &ActiveQuery) {
    if let Err(err) = state.core.poller.borrow_mut().unregister(active.socket_id) {
        log::warn!("[DNS] unregister failed: {}", err);
    }
    let timer = state.timer;
    state.core.timers.borrow_mut().stop(timer);
}

fn upgrade(weak: &Weak<RefCell<QueryState>>) -> Option<DnsQuery> {
    weak.upgrade().map(|state| DnsQuery { state })
}

// ============================================================================
// Tests
// ============================================================================
