// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Netlink multiplexer conformance against an in-memory kernel.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::time::Duration;

use meshd::netlink::{
    NetlinkCore, NetlinkHandler, NetlinkHandlerSpec, NetlinkLink, NetlinkMessage, NlMsgHdr,
    NLMSG_DONE, NLMSG_ERROR, NLMSG_HDRLEN, NLM_F_DUMP,
};
use meshd::runtime::{timer, Core};

const PROTO: i32 = 0;
const PORT_ID: u32 = 0x40_0007;

#[derive(Clone, Default)]
struct Kernel {
    incoming: Rc<RefCell<VecDeque<Vec<u8>>>>,
    sent: Rc<RefCell<Vec<Vec<Vec<u8>>>>>,
}

struct MemoryLink {
    kernel: Kernel,
}

impl NetlinkLink for MemoryLink {
    fn send_batch(&mut self, parts: &[&[u8]]) -> io::Result<usize> {
        let batch: Vec<Vec<u8>> = parts.iter().map(|p| p.to_vec()).collect();
        let total = batch.iter().map(Vec::len).sum();
        self.kernel.sent.borrow_mut().push(batch);
        Ok(total)
    }

    fn peek_len(&mut self) -> io::Result<usize> {
        self.kernel
            .incoming
            .borrow()
            .front()
            .map(Vec::len)
            .ok_or_else(|| io::ErrorKind::WouldBlock.into())
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.kernel.incoming.borrow_mut().pop_front() {
            Some(datagram) => {
                let n = datagram.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram[..n]);
                Ok(n)
            }
            None => Err(io::ErrorKind::WouldBlock.into()),
        }
    }

    fn join_group(&mut self, _group: u32) -> io::Result<()> {
        Ok(())
    }

    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        None
    }

    fn port_id(&self) -> u32 {
        PORT_ID
    }
}

#[derive(Default)]
struct Recorder {
    responses: RefCell<Vec<(u32, usize)>>,
    done: RefCell<Vec<i32>>,
    errors: RefCell<Vec<i32>>,
}

impl NetlinkHandler for Recorder {
    fn on_response(&self, _msg: &NetlinkMessage, hdr: &NlMsgHdr, payload: &[u8]) {
        self.responses.borrow_mut().push((hdr.seq, payload.len()));
    }
    fn on_done(&self, msg: NetlinkMessage) {
        self.done.borrow_mut().push(msg.result);
    }
    fn on_error(&self, msg: NetlinkMessage) {
        self.errors.borrow_mut().push(msg.result);
    }
}

struct Rig {
    core: Core,
    netlink: NetlinkCore,
    kernel: Kernel,
    recorder: Rc<Recorder>,
    handler: meshd::netlink::HandlerId,
}

fn rig() -> Rig {
    let core = Core::new(false).unwrap();
    let netlink = NetlinkCore::new(core.clone());
    let kernel = Kernel::default();
    let recorder = Rc::new(Recorder::default());
    let handler = netlink
        .attach_link(
            NetlinkHandlerSpec {
                name: "flow test",
                multicast_groups: Vec::new(),
                multicast_types: Vec::new(),
                hooks: recorder.clone(),
            },
            PROTO,
            Some(Box::new(MemoryLink {
                kernel: kernel.clone(),
            })),
        )
        .unwrap();
    Rig {
        core,
        netlink,
        kernel,
        recorder,
        handler,
    }
}

fn kernel_reply(seq: u32, msg_type: u16, pid: u32, payload: &[u8]) -> Vec<u8> {
    let hdr = NlMsgHdr {
        len: (NLMSG_HDRLEN + payload.len()) as u32,
        msg_type,
        flags: 0,
        seq,
        pid,
    };
    let mut out = hdr.to_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

fn kernel_ack(seq: u32, errno: i32) -> Vec<u8> {
    let echoed = NlMsgHdr {
        len: NLMSG_HDRLEN as u32,
        msg_type: 18,
        flags: 0,
        seq,
        pid: PORT_ID,
    };
    let mut payload = errno.to_ne_bytes().to_vec();
    payload.extend_from_slice(&echoed.to_bytes());
    kernel_reply(seq, NLMSG_ERROR, 0, &payload)
}

fn sent_seq(rig: &Rig, batch: usize, part: usize) -> u32 {
    NlMsgHdr::parse(&rig.kernel.sent.borrow()[batch][part])
        .unwrap()
        .seq
}

/// Scenario: dump request, three response chunks, DONE.
#[test]
fn dump_round_trip() {
    let r = rig();
    r.netlink
        .send(r.handler, NetlinkMessage::new(18, NLM_F_DUMP, 4096));
    r.netlink.flush(PROTO);
    let seq = sent_seq(&r, 0, 0);

    let sizes: Vec<usize> = (0..3).map(|_| fastrand::usize(8..=64)).collect();
    for &size in &sizes {
        r.kernel
            .incoming
            .borrow_mut()
            .push_back(kernel_reply(seq, 16, PORT_ID, &vec![0u8; size]));
    }
    r.kernel
        .incoming
        .borrow_mut()
        .push_back(kernel_reply(seq, NLMSG_DONE, PORT_ID, &[]));
    r.netlink.process_read(PROTO);

    let expected: Vec<(u32, usize)> = sizes.iter().map(|&size| (seq, size)).collect();
    assert_eq!(*r.recorder.responses.borrow(), expected);
    assert_eq!(*r.recorder.done.borrow(), vec![0]);
    assert!(r.recorder.errors.borrow().is_empty());
    assert_eq!(r.netlink.queue_depths(PROTO), Some((0, 0)));
    assert!(!r.netlink.write_armed(PROTO));
}

/// Scenario: single non-dump message, kernel nacks with EEXIST.
#[test]
fn ack_error_reports_errno() {
    let r = rig();
    r.netlink.send(r.handler, NetlinkMessage::new(18, 0, 4096));
    r.netlink.flush(PROTO);
    let seq = sent_seq(&r, 0, 0);

    r.kernel
        .incoming
        .borrow_mut()
        .push_back(kernel_ack(seq, -17));
    r.netlink.process_read(PROTO);

    assert_eq!(*r.recorder.errors.borrow(), vec![17]);
    assert!(r.recorder.done.borrow().is_empty());
    assert_eq!(r.netlink.queue_depths(PROTO), Some((0, 0)));
}

/// Every submitted message is accounted for in the two queues until it
/// completes, and completes exactly once.
#[test]
fn queue_accounting_and_timeout() {
    let r = rig();
    for _ in 0..5 {
        r.netlink.send(r.handler, NetlinkMessage::new(18, 0, 4096));
    }
    let (buffered, in_flight) = r.netlink.queue_depths(PROTO).unwrap();
    assert_eq!(buffered + in_flight, 5);

    r.netlink.flush(PROTO);
    let (buffered, in_flight) = r.netlink.queue_depths(PROTO).unwrap();
    assert_eq!(buffered + in_flight, 5);
    assert_eq!(in_flight, 5);

    // lost acks: the shared timer completes everything via the error path
    r.core
        .timers
        .borrow_mut()
        .advance(Duration::from_millis(1100));
    timer::process(&r.core.timers);

    assert_eq!(r.recorder.errors.borrow().len(), 5);
    assert_eq!(r.netlink.queue_depths(PROTO), Some((0, 0)));
}

/// Later messages keep flowing after a timeout recovered the socket.
#[test]
fn timeout_recovery_resumes_backlog() {
    let r = rig();
    // a dump occupies the wire alone, the second message stays buffered
    r.netlink
        .send(r.handler, NetlinkMessage::new(18, NLM_F_DUMP, 4096));
    r.netlink.send(r.handler, NetlinkMessage::new(20, 0, 4096));
    r.netlink.flush(PROTO);
    assert_eq!(r.netlink.queue_depths(PROTO), Some((1, 1)));

    r.core
        .timers
        .borrow_mut()
        .advance(Duration::from_millis(1100));
    timer::process(&r.core.timers);

    // the dump died, write-readiness is armed for the backlog
    assert_eq!(*r.recorder.errors.borrow(), vec![libc::ETIMEDOUT]);
    assert!(r.netlink.write_armed(PROTO));

    r.netlink.flush(PROTO);
    let seq = sent_seq(&r, 1, 0);
    r.kernel.incoming.borrow_mut().push_back(kernel_ack(seq, 0));
    r.netlink.process_read(PROTO);
    assert_eq!(*r.recorder.done.borrow(), vec![0]);
}
