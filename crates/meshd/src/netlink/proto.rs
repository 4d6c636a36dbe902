// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Netlink multiplexer.
//!
//! One socket is opened per kernel protocol and shared by every attached
//! handler. Requests are correlated with kernel feedback by sequence
//! number; each submitted message leaves through exactly one of three
//! completion paths:
//!
//! - `on_done`: end of a multipart dump, or a kernel ack with errno 0
//! - `on_error`: transport failure, kernel nack, or ack timeout
//! - responses of a running dump arrive through `on_response` while the
//!   message stays in flight until its DONE
//!
//! Messages wait in a `buffered` queue and move to `in_flight` when a
//! batch is written to the kernel. One batch is outstanding at a time; a
//! dump request never shares a batch with any other message. Kernel
//! messages that match no in-flight sequence number are fanned out to the
//! handlers subscribed to their multicast type.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::rc::{Rc, Weak};

use crate::config::{NETLINK_ACK_TIMEOUT, NETLINK_BLOCK_SIZE, NETLINK_SEND_SLOTS};
use crate::logging::warn_with_dump;
use crate::runtime::{Core, SocketEvent, SocketId, TimerId};

use super::attr::{
    MessageIter, NlMsgHdr, NLMSG_DONE, NLMSG_ERROR, NLMSG_HDRLEN, NLMSG_NOOP, NLM_F_MULTI,
};
use super::link::{KernelLink, NetlinkLink};
use super::message::{HandlerId, NetlinkMessage};

/// Callbacks of a netlink handler.
///
/// Implementations keep their mutable state behind `RefCell`; hooks may
/// re-enter the multiplexer (typically to send follow-up requests).
pub trait NetlinkHandler {
    /// One response chunk of a running dump. The message stays in flight.
    fn on_response(&self, _msg: &NetlinkMessage, _hdr: &NlMsgHdr, _payload: &[u8]) {}

    /// Completion with an error; `msg.result` holds the positive errno.
    fn on_error(&self, _msg: NetlinkMessage) {}

    /// Successful completion; `msg.result` is zero.
    fn on_done(&self, _msg: NetlinkMessage) {}

    /// A multicast message of a subscribed type.
    fn on_multicast(&self, _hdr: &NlMsgHdr, _payload: &[u8]) {}
}

/// Registration parameters of a handler.
pub struct NetlinkHandlerSpec {
    /// Handler name for log lines.
    pub name: &'static str,
    /// Multicast groups to join on the protocol socket.
    pub multicast_groups: Vec<u32>,
    /// Message types delivered through `on_multicast`.
    pub multicast_types: Vec<u16>,
    /// Callback sink.
    pub hooks: Rc<dyn NetlinkHandler>,
}

struct HandlerRec {
    id: HandlerId,
    name: &'static str,
    multicast_types: Vec<u16>,
    hooks: Rc<dyn NetlinkHandler>,
}

struct ProtocolSocket {
    protocol: i32,
    link: Box<dyn NetlinkLink>,
    socket_id: Option<SocketId>,
    ack_timer: TimerId,
    buffered: VecDeque<NetlinkMessage>,
    in_flight: VecDeque<NetlinkMessage>,
    handlers: Vec<HandlerRec>,
    rx_buf: Vec<u8>,
    write_armed: bool,
}

impl ProtocolSocket {
    fn hooks_of(&self, id: HandlerId) -> Option<(&'static str, Rc<dyn NetlinkHandler>)> {
        self.handlers
            .iter()
            .find(|rec| rec.id == id)
            .map(|rec| (rec.name, rec.hooks.clone()))
    }

    fn find_in_flight(&self, seq: u32) -> Option<usize> {
        self.in_flight.iter().position(|msg| msg.seq() == seq)
    }
}

struct NetlinkState {
    core: Core,
    protocols: HashMap<i32, ProtocolSocket>,
    handler_proto: HashMap<u64, i32>,
    seq: u32,
    next_instance: u32,
    next_handler: u64,
}

/// Handle to the netlink multiplexer.
#[derive(Clone)]
pub struct NetlinkCore {
    state: Rc<RefCell<NetlinkState>>,
}

enum Dispatch {
    Done {
        name: &'static str,
        hooks: Rc<dyn NetlinkHandler>,
        msg: NetlinkMessage,
    },
    Error {
        name: &'static str,
        hooks: Rc<dyn NetlinkHandler>,
        msg: NetlinkMessage,
    },
    Response {
        hooks: Rc<dyn NetlinkHandler>,
        msg: NetlinkMessage,
        index: usize,
    },
    Multicast {
        hooks: Vec<Rc<dyn NetlinkHandler>>,
    },
    Nothing,
}

impl NetlinkCore {
    pub fn new(core: Core) -> Self {
        Self {
            state: Rc::new(RefCell::new(NetlinkState {
                core,
                protocols: HashMap::new(),
                handler_proto: HashMap::new(),
                seq: 0,
                next_instance: 0,
                next_handler: 1,
            })),
        }
    }

    /// Attach a handler, opening the kernel socket for `protocol` when it
    /// is the first one.
    pub fn attach(&self, spec: NetlinkHandlerSpec, protocol: i32) -> io::Result<HandlerId> {
        let needs_link = !self.state.borrow().protocols.contains_key(&protocol);
        let link: Option<Box<dyn NetlinkLink>> = if needs_link {
            let instance = {
                let mut state = self.state.borrow_mut();
                let instance = state.next_instance;
                state.next_instance += 1;
                instance
            };
            Some(Box::new(KernelLink::open(protocol, instance)?))
        } else {
            None
        };
        self.attach_link(spec, protocol, link)
    }

    /// Attach a handler over a caller-provided link (used by tests and
    /// alternate transports). `link` must be `Some` when the protocol
    /// socket does not exist yet.
    pub fn attach_link(
        &self,
        spec: NetlinkHandlerSpec,
        protocol: i32,
        link: Option<Box<dyn NetlinkLink>>,
    ) -> io::Result<HandlerId> {
        let handler_id = {
            let mut state = self.state.borrow_mut();

            if !state.protocols.contains_key(&protocol) {
                let link = link.ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "no link for new protocol")
                })?;
                let socket = self.new_protocol_socket(&mut state, protocol, link);
                state.protocols.insert(protocol, socket);
            }

            let id = HandlerId(state.next_handler);
            state.next_handler += 1;
            id
        };

        // join the requested multicast groups; failure is fatal for this
        // handler and tears the socket down again when it has no users
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            for group in &spec.multicast_groups {
                let joined = state
                    .protocols
                    .get_mut(&protocol)
                    .expect("just inserted")
                    .link
                    .join_group(*group);
                if let Err(err) = joined {
                    log::warn!(
                        "[NL] '{}': could not join mc group {}: {}",
                        spec.name,
                        group,
                        err
                    );
                    let unused = state
                        .protocols
                        .get(&protocol)
                        .is_some_and(|s| s.handlers.is_empty());
                    if unused {
                        self.destroy_protocol(state, protocol);
                    }
                    return Err(err);
                }
            }

            let socket = state.protocols.get_mut(&protocol).expect("still there");
            socket.handlers.push(HandlerRec {
                id: handler_id,
                name: spec.name,
                multicast_types: spec.multicast_types,
                hooks: spec.hooks,
            });
            state.handler_proto.insert(handler_id.0, protocol);
        }

        Ok(handler_id)
    }

    /// Detach a handler; the protocol socket closes with its last handler.
    pub fn detach(&self, handler: HandlerId) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(protocol) = state.handler_proto.remove(&handler.0) else {
            return;
        };
        let Some(socket) = state.protocols.get_mut(&protocol) else {
            return;
        };
        socket.handlers.retain(|rec| rec.id != handler);
        if socket.handlers.is_empty() {
            self.destroy_protocol(state, protocol);
        }
    }

    /// Queue a message for transmission.
    ///
    /// Assigns the next global sequence number, stamps the socket's port
    /// id, requests a kernel ack and enables write-readiness when the
    /// socket was idle.
    pub fn send(&self, handler: HandlerId, mut msg: NetlinkMessage) {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(&protocol) = state.handler_proto.get(&handler.0) else {
            debug_assert!(false, "send from unknown handler");
            log::warn!("[NL] send from detached handler, message dropped");
            return;
        };

        state.seq = (state.seq + 1) & i32::MAX as u32;
        if state.seq == 0 {
            state.seq = 1;
        }
        let seq = state.seq;

        let socket = state.protocols.get_mut(&protocol).expect("handler maps to socket");
        msg.stamp_for_send(seq, socket.link.port_id(), handler);

        let hdr = msg.header();
        log::debug!(
            "[NL] protocol {}: append message (type={}, len={}, seq={}, pid={}, flags={:#06x})",
            protocol,
            hdr.msg_type,
            hdr.len,
            hdr.seq,
            hdr.pid,
            hdr.flags
        );

        let idle = socket.buffered.is_empty() && socket.in_flight.is_empty();
        socket.buffered.push_back(msg);
        if idle {
            Self::set_write(state, protocol, true);
        }
    }

    /// Queue depths `(buffered, in_flight)` of a protocol socket.
    pub fn queue_depths(&self, protocol: i32) -> Option<(usize, usize)> {
        self.state
            .borrow()
            .protocols
            .get(&protocol)
            .map(|s| (s.buffered.len(), s.in_flight.len()))
    }

    /// Current write-readiness interest of a protocol socket.
    pub fn write_armed(&self, protocol: i32) -> bool {
        self.state
            .borrow()
            .protocols
            .get(&protocol)
            .is_some_and(|s| s.write_armed)
    }

    fn new_protocol_socket(
        &self,
        state: &mut NetlinkState,
        protocol: i32,
        link: Box<dyn NetlinkLink>,
    ) -> ProtocolSocket {
        let weak = Rc::downgrade(&self.state);
        let timer_hook = move |_: TimerId| {
            if let Some(nc) = NetlinkCore::upgrade(&weak) {
                nc.on_ack_timeout(protocol);
            }
        };
        let ack_timer = state
            .core
            .timers
            .borrow_mut()
            .add("netlink feedback timer", Rc::new(timer_hook));

        let socket_id = link.raw_fd().map(|fd| {
            let weak = Rc::downgrade(&self.state);
            let hook = move |event: SocketEvent| {
                if let Some(nc) = NetlinkCore::upgrade(&weak) {
                    if event.writable {
                        nc.flush(protocol);
                    }
                    if event.readable {
                        nc.process_read(protocol);
                    }
                }
            };
            let id = state
                .core
                .poller
                .borrow_mut()
                .register(fd, "os_system_netlink", Rc::new(hook));
            if let Err(err) = state.core.poller.borrow_mut().set_read(id, true) {
                log::warn!("[NL] protocol {}: cannot arm read interest: {}", protocol, err);
            }
            id
        });

        ProtocolSocket {
            protocol,
            link,
            socket_id,
            ack_timer,
            buffered: VecDeque::new(),
            in_flight: VecDeque::new(),
            handlers: Vec::new(),
            rx_buf: vec![0u8; NETLINK_BLOCK_SIZE],
            write_armed: false,
        }
    }

    fn destroy_protocol(&self, state: &mut NetlinkState, protocol: i32) {
        if let Some(socket) = state.protocols.remove(&protocol) {
            state.core.timers.borrow_mut().remove(socket.ack_timer);
            if let Some(id) = socket.socket_id {
                if let Err(err) = state.core.poller.borrow_mut().unregister(id) {
                    log::warn!("[NL] protocol {}: unregister failed: {}", protocol, err);
                }
            }
            log::debug!("[NL] protocol {}: socket destroyed", protocol);
        }
    }

    fn upgrade(weak: &Weak<RefCell<NetlinkState>>) -> Option<NetlinkCore> {
        weak.upgrade().map(|state| NetlinkCore { state })
    }

    fn set_write(state: &mut NetlinkState, protocol: i32, on: bool) {
        let Some(socket) = state.protocols.get_mut(&protocol) else {
            return;
        };
        socket.write_armed = on;
        if let Some(id) = socket.socket_id {
            if let Err(err) = state.core.poller.borrow_mut().set_write(id, on) {
                log::warn!(
                    "[NL] protocol {}: cannot toggle write interest: {}",
                    protocol,
                    err
                );
            }
        }
    }

    /// Collect a block of non-dump messages (or a single dump) and send
    /// them to the kernel as one vectored datagram.
    ///
    /// Driven by write-readiness in production; public so tests and
    /// fd-less links can pump the queue directly.
    pub fn flush(&self, protocol: i32) {
        let mut errors: Vec<(Rc<dyn NetlinkHandler>, NetlinkMessage)> = Vec::new();
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(socket) = state.protocols.get_mut(&protocol) else {
                return;
            };
            if !socket.in_flight.is_empty() {
                // still messages in transit, one batch at a time
                return;
            }
            if socket.buffered.is_empty() {
                Self::set_write(state, protocol, false);
                return;
            }

            let done_hdr = NlMsgHdr {
                len: NLMSG_HDRLEN as u32,
                msg_type: NLMSG_DONE,
                flags: 0,
                seq: 0,
                pid: 0,
            }
            .to_bytes();

            let mut batch: Vec<NetlinkMessage> = Vec::new();
            let mut size = done_hdr.len();
            let first = socket.buffered.pop_front().expect("checked non-empty");
            size += first.len();
            let first_is_dump = first.is_dump();
            batch.push(first);

            if !first_is_dump {
                while let Some(next) = socket.buffered.front() {
                    if batch.len() >= NETLINK_SEND_SLOTS - 1
                        || next.is_dump()
                        || size + next.len() >= NETLINK_BLOCK_SIZE
                    {
                        break;
                    }
                    let next = socket.buffered.pop_front().expect("front checked");
                    size += next.len();
                    batch.push(next);
                }
            }

            if batch.len() > 1 {
                for msg in &mut batch {
                    msg.or_flags(NLM_F_MULTI);
                }
            }

            let mut parts: Vec<&[u8]> = batch.iter().map(NetlinkMessage::bytes).collect();
            if batch.len() > 1 {
                parts.push(&done_hdr);
            }

            for msg in &batch {
                log::info!(
                    "[NL] protocol {}: sending message seq {}",
                    protocol,
                    msg.seq()
                );
            }

            match socket.link.send_batch(&parts) {
                Ok(sent) => {
                    log::debug!(
                        "[NL] protocol {}: sent {} bytes ({} messages in transit)",
                        protocol,
                        sent,
                        batch.len()
                    );
                    socket.in_flight.extend(batch);
                    let timer = socket.ack_timer;
                    state
                        .core
                        .timers
                        .borrow_mut()
                        .set(timer, NETLINK_ACK_TIMEOUT);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // try again later, shuffle messages back in order
                    for msg in batch.into_iter().rev() {
                        socket.buffered.push_front(msg);
                    }
                }
                Err(err) => {
                    let errno = err.raw_os_error().unwrap_or(libc::EIO);
                    log::warn!(
                        "[NL] protocol {}: cannot send data ({} bytes): {}",
                        protocol,
                        size,
                        err
                    );
                    for mut msg in batch {
                        msg.result = errno;
                        let originator = msg.originator.expect("stamped at send");
                        if let Some((_, hooks)) = socket.hooks_of(originator) {
                            errors.push((hooks, msg));
                        }
                    }
                }
            }
        }

        for (hooks, msg) in errors {
            hooks.on_error(msg);
        }
    }

    /// Drain pending datagrams from the kernel socket.
    ///
    /// Driven by read-readiness in production; public so tests and
    /// fd-less links can push received data through the state machine.
    pub fn process_read(&self, protocol: i32) {
        loop {
            let datagram: Option<Vec<u8>> = {
                let mut state = self.state.borrow_mut();
                let Some(socket) = state.protocols.get_mut(&protocol) else {
                    return;
                };

                match socket.link.peek_len() {
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
                    Err(err) => {
                        log::warn!("[NL] protocol {}: recv error: {}", protocol, err);
                        None
                    }
                    Ok(len) => {
                        if len > socket.rx_buf.len() {
                            let grown = len.div_ceil(NETLINK_BLOCK_SIZE) * NETLINK_BLOCK_SIZE;
                            log::info!(
                                "[NL] protocol {}: increased input buffer to {}",
                                protocol,
                                grown
                            );
                            socket.rx_buf.resize(grown, 0);
                        }
                        match socket.link.recv(&mut socket.rx_buf) {
                            Ok(n) => Some(socket.rx_buf[..n].to_vec()),
                            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
                            Err(err) => {
                                log::warn!("[NL] protocol {}: recv error: {}", protocol, err);
                                None
                            }
                        }
                    }
                }
            };

            let Some(datagram) = datagram else {
                break;
            };
            self.handle_datagram(protocol, &datagram);
        }
    }

    /// Parse one datagram and dispatch every contained message.
    fn handle_datagram(&self, protocol: i32, data: &[u8]) {
        let items: Vec<(NlMsgHdr, Vec<u8>)> = MessageIter::new(data)
            .map(|(hdr, payload)| (hdr, payload.to_vec()))
            .collect();
        if items.is_empty() && !data.is_empty() {
            warn_with_dump("[NL]", "datagram without a valid message header", data);
        }

        for (hdr, payload) in items {
            log::debug!(
                "[NL] protocol {}: recv msg (type={}, len={}, seq={}, pid={}, flags={:#06x})",
                protocol,
                hdr.msg_type,
                hdr.len,
                hdr.seq,
                hdr.pid,
                hdr.flags
            );
            self.handle_item(protocol, hdr, &payload);
        }

        // reset the feedback timer and re-evaluate write readiness
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        let Some(socket) = state.protocols.get_mut(&protocol) else {
            return;
        };
        let timer = socket.ack_timer;
        let want_write = socket.in_flight.is_empty() && !socket.buffered.is_empty();
        if socket.in_flight.is_empty() {
            state.core.timers.borrow_mut().stop(timer);
        }
        Self::set_write(state, protocol, want_write);
    }

    fn handle_item(&self, protocol: i32, hdr: NlMsgHdr, payload: &[u8]) {
        let dispatch = {
            let mut state = self.state.borrow_mut();
            let Some(socket) = state.protocols.get_mut(&protocol) else {
                return;
            };

            match hdr.msg_type {
                t if t == NLMSG_NOOP => Dispatch::Nothing,

                t if t == NLMSG_DONE => {
                    // end of a multipart message
                    match socket.find_in_flight(hdr.seq) {
                        Some(index) if socket.in_flight[index].is_dump() => {
                            let mut msg = socket.in_flight.remove(index).expect("index valid");
                            msg.result = 0;
                            let originator = msg.originator.expect("stamped");
                            match socket.hooks_of(originator) {
                                Some((name, hooks)) => Dispatch::Done { name, hooks, msg },
                                None => Dispatch::Nothing,
                            }
                        }
                        _ => Dispatch::Nothing,
                    }
                }

                t if t == NLMSG_ERROR => {
                    // feedback for an async request: i32 errno, then the
                    // echoed request header carrying the sequence number
                    if payload.len() < 4 + NLMSG_HDRLEN {
                        warn_with_dump("[NL]", "truncated error message", payload);
                        return;
                    }
                    let errno = i32::from_ne_bytes(payload[0..4].try_into().unwrap());
                    let echoed =
                        NlMsgHdr::parse(&payload[4..]).expect("length checked above");
                    match socket.find_in_flight(echoed.seq) {
                        Some(index) => {
                            let mut msg = socket.in_flight.remove(index).expect("index valid");
                            msg.result = errno.abs();
                            let originator = msg.originator.expect("stamped");
                            match socket.hooks_of(originator) {
                                Some((name, hooks)) if errno == 0 => {
                                    Dispatch::Done { name, hooks, msg }
                                }
                                Some((name, hooks)) => Dispatch::Error { name, hooks, msg },
                                None => Dispatch::Nothing,
                            }
                        }
                        None => Dispatch::Nothing,
                    }
                }

                _ => {
                    let response = socket.find_in_flight(hdr.seq).filter(|&index| {
                        let msg = &socket.in_flight[index];
                        msg.is_dump() && hdr.pid == socket.link.port_id()
                    });
                    match response {
                        Some(index) => {
                            // response chunk of a netlink dump; the message
                            // leaves the queue only for the callback's
                            // duration and returns afterwards
                            let msg = socket.in_flight.remove(index).expect("index valid");
                            let originator = msg.originator.expect("stamped");
                            match socket.hooks_of(originator) {
                                Some((_, hooks)) => Dispatch::Response { hooks, msg, index },
                                None => Dispatch::Nothing,
                            }
                        }
                        None => {
                            // no matching request, treat as multicast
                            let hooks: Vec<Rc<dyn NetlinkHandler>> = socket
                                .handlers
                                .iter()
                                .filter(|rec| rec.multicast_types.contains(&hdr.msg_type))
                                .map(|rec| rec.hooks.clone())
                                .collect();
                            Dispatch::Multicast { hooks }
                        }
                    }
                }
            }
        };

        match dispatch {
            Dispatch::Nothing => {}
            Dispatch::Done { name, hooks, msg } => {
                log::debug!("[NL] '{}': done for seq {}", name, msg.seq());
                hooks.on_done(msg);
            }
            Dispatch::Error { name, hooks, msg } => {
                log::debug!(
                    "[NL] '{}': error {} for seq {}",
                    name,
                    msg.result,
                    msg.seq()
                );
                hooks.on_error(msg);
            }
            Dispatch::Response { hooks, msg, index } => {
                hooks.on_response(&msg, &hdr, payload);
                let mut state = self.state.borrow_mut();
                if let Some(socket) = state.protocols.get_mut(&protocol) {
                    let at = index.min(socket.in_flight.len());
                    socket.in_flight.insert(at, msg);
                }
            }
            Dispatch::Multicast { hooks } => {
                for hook in hooks {
                    hook.on_multicast(&hdr, payload);
                }
            }
        }
    }

    /// Ack-timeout expiry: every in-flight message completes through the
    /// error path and transmission resumes with the buffered backlog.
    fn on_ack_timeout(&self, protocol: i32) {
        let mut errors: Vec<(Rc<dyn NetlinkHandler>, NetlinkMessage)> = Vec::new();
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(socket) = state.protocols.get_mut(&protocol) else {
                return;
            };
            while let Some(mut msg) = socket.in_flight.pop_front() {
                msg.result = libc::ETIMEDOUT;
                let originator = msg.originator.expect("stamped");
                if let Some((name, hooks)) = socket.hooks_of(originator) {
                    log::warn!(
                        "[NL] protocol {} '{}': ack timeout for seq {}",
                        protocol,
                        name,
                        msg.seq()
                    );
                    errors.push((hooks, msg));
                }
            }
            let want_write = !socket.buffered.is_empty();
            Self::set_write(state, protocol, want_write);
        }

        for (hooks, msg) in errors {
            hooks.on_error(msg);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
