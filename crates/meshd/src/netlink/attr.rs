// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Netlink wire framing: message headers and attributes.
//!
//! The kernel's raw framing is consumed verbatim. Each message begins with
//! a 16-byte header in host byte order:
//!
//! ```text
//! +----------------+--------+--------+----------------+----------------+
//! | Length (u32)   | Type   | Flags  | Sequence (u32) | Port id (u32)  |
//! +----------------+--------+--------+----------------+----------------+
//! ```
//!
//! Attributes follow as `(u16 length, u16 type, value)` units padded to a
//! 4-byte boundary. No schema is imposed beyond the header; higher-level
//! subsystems layer their own attribute sets.

/// Wire size of a netlink message header.
pub const NLMSG_HDRLEN: usize = 16;

/// Wire size of an attribute header.
pub const NLA_HDRLEN: usize = 4;

/// Alignment unit for messages and attributes.
pub const NLMSG_ALIGNTO: usize = 4;

/// End of a multipart message.
pub const NLMSG_DONE: u16 = libc::NLMSG_DONE as u16;
/// Kernel acknowledgement / negative acknowledgement.
pub const NLMSG_ERROR: u16 = libc::NLMSG_ERROR as u16;
/// Padding message, skipped.
pub const NLMSG_NOOP: u16 = libc::NLMSG_NOOP as u16;

/// Request flag.
pub const NLM_F_REQUEST: u16 = libc::NLM_F_REQUEST as u16;
/// Part of a multi-message batch.
pub const NLM_F_MULTI: u16 = libc::NLM_F_MULTI as u16;
/// Acknowledgement requested.
pub const NLM_F_ACK: u16 = libc::NLM_F_ACK as u16;
/// Table dump requested (streamed multipart response).
pub const NLM_F_DUMP: u16 = libc::NLM_F_DUMP as u16;

/// Round a length up to the netlink alignment unit.
pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// Parsed netlink message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlMsgHdr {
    pub len: u32,
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHdr {
    /// Parse a header from the front of `buf`; `None` when truncated.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < NLMSG_HDRLEN {
            return None;
        }
        Some(Self {
            len: u32::from_ne_bytes(buf[0..4].try_into().unwrap()),
            msg_type: u16::from_ne_bytes(buf[4..6].try_into().unwrap()),
            flags: u16::from_ne_bytes(buf[6..8].try_into().unwrap()),
            seq: u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
            pid: u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    /// Write the header to the front of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.len.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.msg_type.to_ne_bytes());
        buf[6..8].copy_from_slice(&self.flags.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.seq.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.pid.to_ne_bytes());
    }

    /// Serialize to a standalone 16-byte buffer.
    pub fn to_bytes(&self) -> [u8; NLMSG_HDRLEN] {
        let mut buf = [0u8; NLMSG_HDRLEN];
        self.write(&mut buf);
        buf
    }
}

/// One attribute inside a message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NlAttr<'a> {
    pub attr_type: u16,
    pub value: &'a [u8],
}

/// Append an attribute (header, value, alignment padding) to a buffer.
pub fn push_attr(buf: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    // message payloads are kept aligned, so only the tail needs padding
    let attr_len = (NLA_HDRLEN + value.len()) as u16;
    buf.extend_from_slice(&attr_len.to_ne_bytes());
    buf.extend_from_slice(&attr_type.to_ne_bytes());
    buf.extend_from_slice(value);
    let padded = nlmsg_align(NLA_HDRLEN + value.len());
    buf.resize(buf.len() + padded - (NLA_HDRLEN + value.len()), 0);
}

/// Iterator over the attributes of a message payload.
pub struct AttrIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AttrIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = NlAttr<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        if rest.len() < NLA_HDRLEN {
            return None;
        }
        let attr_len = u16::from_ne_bytes(rest[0..2].try_into().unwrap()) as usize;
        let attr_type = u16::from_ne_bytes(rest[2..4].try_into().unwrap());
        if attr_len < NLA_HDRLEN || attr_len > rest.len() {
            return None;
        }
        let value = &rest[NLA_HDRLEN..attr_len];
        self.pos += nlmsg_align(attr_len);
        Some(NlAttr { attr_type, value })
    }
}

/// Iterator over the contiguous message headers of one datagram.
///
/// Follows the kernel's `NLMSG_OK`/`NLMSG_NEXT` semantics: iteration stops
/// on the first header whose length field is shorter than a header or
/// longer than the remaining stream.
pub struct MessageIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MessageIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for MessageIter<'a> {
    /// `(header, payload)` where the payload excludes the header bytes.
    type Item = (NlMsgHdr, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let hdr = NlMsgHdr::parse(rest)?;
        let total = hdr.len as usize;
        if total < NLMSG_HDRLEN || total > rest.len() {
            return None;
        }
        let payload = &rest[NLMSG_HDRLEN..total];
        self.pos += nlmsg_align(total);
        Some((hdr, payload))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let hdr = NlMsgHdr {
            len: 32,
            msg_type: 18,
            flags: NLM_F_REQUEST | NLM_F_DUMP,
            seq: 0x1234_5678,
            pid: 0x0040_0123,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(NlMsgHdr::parse(&bytes), Some(hdr));
    }

    #[test]
    fn test_header_truncated() {
        assert_eq!(NlMsgHdr::parse(&[0u8; 15]), None);
    }

    #[test]
    fn test_attr_round_trip_with_padding() {
        // lengths chosen so one attribute needs padding and one does not
        let cases: &[(u16, &[u8])] = &[
            (1, b"eth0\0"),
            (2, b""),
            (3, &[0xde, 0xad, 0xbe, 0xef]),
            (4, &[1, 2, 3, 4, 5, 6]),
        ];

        let mut buf = Vec::new();
        for (ty, value) in cases {
            push_attr(&mut buf, *ty, value);
        }
        assert_eq!(buf.len() % NLMSG_ALIGNTO, 0);

        let parsed: Vec<(u16, Vec<u8>)> = AttrIter::new(&buf)
            .map(|a| (a.attr_type, a.value.to_vec()))
            .collect();
        let expected: Vec<(u16, Vec<u8>)> =
            cases.iter().map(|(t, v)| (*t, v.to_vec())).collect();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_attr_iter_stops_on_garbage() {
        let mut buf = Vec::new();
        push_attr(&mut buf, 7, b"ok");
        // attribute with a length shorter than its own header
        buf.extend_from_slice(&2u16.to_ne_bytes());
        buf.extend_from_slice(&9u16.to_ne_bytes());

        let parsed: Vec<u16> = AttrIter::new(&buf).map(|a| a.attr_type).collect();
        assert_eq!(parsed, vec![7]);
    }

    #[test]
    fn test_message_iter_walks_stream() {
        let mut stream = Vec::new();
        for (seq, payload_len) in [(1u32, 4usize), (2, 0), (3, 7)] {
            let hdr = NlMsgHdr {
                len: (NLMSG_HDRLEN + payload_len) as u32,
                msg_type: 16,
                flags: 0,
                seq,
                pid: 0,
            };
            stream.extend_from_slice(&hdr.to_bytes());
            stream.extend(std::iter::repeat(0xAB).take(payload_len));
            let aligned = nlmsg_align(NLMSG_HDRLEN + payload_len);
            stream.extend(std::iter::repeat(0).take(aligned - (NLMSG_HDRLEN + payload_len)));
        }

        let items: Vec<(u32, usize)> = MessageIter::new(&stream)
            .map(|(hdr, payload)| (hdr.seq, payload.len()))
            .collect();
        assert_eq!(items, vec![(1, 4), (2, 0), (3, 7)]);
    }

    #[test]
    fn test_message_iter_stops_on_truncated_length() {
        let hdr = NlMsgHdr {
            len: 64, // claims more than the stream holds
            msg_type: 16,
            flags: 0,
            seq: 1,
            pid: 0,
        };
        let stream = hdr.to_bytes();
        assert_eq!(MessageIter::new(&stream).count(), 0);
    }
}
