// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Owned netlink request message.
//!
//! A message is created by a handler, filled with a family header and
//! attributes, and submitted through the multiplexer. It then moves from
//! the protocol socket's buffered queue to the in-flight queue at send
//! time and leaves through exactly one of the done, error or timeout
//! completion paths.

use super::attr::{nlmsg_align, push_attr, NlMsgHdr, NLMSG_HDRLEN, NLM_F_DUMP};

/// Result value before any completion arrived.
pub const RESULT_PENDING: i32 = -1;

/// Identifier of the handler that created a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// Error raised when a message outgrows its length cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTooLarge {
    pub max_len: usize,
}

impl std::fmt::Display for MessageTooLarge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "netlink message got too large (cap {} bytes)", self.max_len)
    }
}

impl std::error::Error for MessageTooLarge {}

/// A complete netlink request owned by its originating handler.
#[derive(Debug)]
pub struct NetlinkMessage {
    buf: Vec<u8>,
    max_len: usize,
    /// True when the request flags ask for a table dump.
    pub(crate) dump: bool,
    /// Completion code: [`RESULT_PENDING`], `0` for success or a positive
    /// errno.
    pub result: i32,
    pub(crate) originator: Option<HandlerId>,
}

impl NetlinkMessage {
    /// Create a request with the given type and flags.
    ///
    /// `NLM_F_REQUEST` is implied; `NLM_F_ACK` is stamped at send time.
    pub fn new(msg_type: u16, flags: u16, max_len: usize) -> Self {
        let hdr = NlMsgHdr {
            len: NLMSG_HDRLEN as u32,
            msg_type,
            flags: flags | super::attr::NLM_F_REQUEST,
            seq: 0,
            pid: 0,
        };
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&hdr.to_bytes());
        Self {
            buf,
            max_len,
            dump: false,
            result: RESULT_PENDING,
            originator: None,
        }
    }

    /// Append raw family-header bytes (e.g. `ifinfomsg`) after the netlink
    /// header, padded to the alignment unit.
    pub fn push_payload(&mut self, data: &[u8]) -> Result<(), MessageTooLarge> {
        let aligned = nlmsg_align(self.buf.len()) + nlmsg_align(data.len());
        if aligned > self.max_len {
            return Err(MessageTooLarge { max_len: self.max_len });
        }
        self.buf.extend_from_slice(data);
        self.buf.resize(nlmsg_align(self.buf.len()), 0);
        self.sync_len();
        Ok(())
    }

    /// Append one attribute, respecting the length cap.
    pub fn add_attr(&mut self, attr_type: u16, value: &[u8]) -> Result<(), MessageTooLarge> {
        let aligned_msg = nlmsg_align(self.buf.len());
        let aligned_attr = nlmsg_align(super::attr::NLA_HDRLEN + value.len());
        if aligned_msg + aligned_attr > self.max_len {
            log::warn!("[NL] message got too large (cap {} bytes)", self.max_len);
            return Err(MessageTooLarge { max_len: self.max_len });
        }
        self.buf.resize(aligned_msg, 0);
        push_attr(&mut self.buf, attr_type, value);
        self.sync_len();
        Ok(())
    }

    fn sync_len(&mut self) {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
    }

    /// Parsed view of the wire header.
    pub fn header(&self) -> NlMsgHdr {
        NlMsgHdr::parse(&self.buf).expect("message always holds a header")
    }

    /// Complete wire bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Wire length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True while the message carries nothing beyond its header.
    pub fn is_empty(&self) -> bool {
        self.buf.len() == NLMSG_HDRLEN
    }

    /// Sequence number assigned at send time (zero beforehand).
    pub fn seq(&self) -> u32 {
        self.header().seq
    }

    /// True when this request asks for a dump.
    pub fn is_dump(&self) -> bool {
        self.dump
    }

    pub(crate) fn stamp_for_send(&mut self, seq: u32, pid: u32, handler: HandlerId) {
        let mut hdr = self.header();
        hdr.seq = seq;
        hdr.pid = pid;
        hdr.flags |= super::attr::NLM_F_ACK;
        hdr.write(&mut self.buf);

        self.dump = hdr.flags & NLM_F_DUMP == NLM_F_DUMP;
        self.originator = Some(handler);
        self.result = RESULT_PENDING;
    }

    pub(crate) fn or_flags(&mut self, flags: u16) {
        let mut hdr = self.header();
        hdr.flags |= flags;
        hdr.write(&mut self.buf);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::attr::{AttrIter, NLM_F_REQUEST};

    #[test]
    fn test_new_message_has_request_header() {
        let msg = NetlinkMessage::new(18, NLM_F_DUMP, 4096);
        let hdr = msg.header();
        assert_eq!(hdr.len as usize, NLMSG_HDRLEN);
        assert_eq!(hdr.msg_type, 18);
        assert!(hdr.flags & NLM_F_REQUEST != 0);
        assert_eq!(msg.result, RESULT_PENDING);
    }

    #[test]
    fn test_attrs_update_length() {
        let mut msg = NetlinkMessage::new(16, 0, 4096);
        msg.push_payload(&[0u8; 16]).unwrap();
        msg.add_attr(3, b"eth0\0").unwrap();
        msg.add_attr(5, &7u32.to_ne_bytes()).unwrap();

        let hdr = msg.header();
        assert_eq!(hdr.len as usize, msg.len());

        let attrs: Vec<u16> = AttrIter::new(&msg.bytes()[NLMSG_HDRLEN + 16..])
            .map(|a| a.attr_type)
            .collect();
        assert_eq!(attrs, vec![3, 5]);
    }

    #[test]
    fn test_length_cap_enforced() {
        let mut msg = NetlinkMessage::new(16, 0, 32);
        assert!(msg.add_attr(1, &[0u8; 8]).is_ok());
        assert!(msg.add_attr(2, &[0u8; 8]).is_err());
    }

    #[test]
    fn test_stamp_marks_dump_and_ack() {
        let mut msg = NetlinkMessage::new(18, NLM_F_DUMP, 4096);
        msg.stamp_for_send(42, 0x40_0001, HandlerId(9));

        let hdr = msg.header();
        assert_eq!(hdr.seq, 42);
        assert_eq!(hdr.pid, 0x40_0001);
        assert!(hdr.flags & super::super::attr::NLM_F_ACK != 0);
        assert!(msg.is_dump());
        assert_eq!(msg.originator, Some(HandlerId(9)));
    }
}
