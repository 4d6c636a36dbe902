// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RFC 1035 wire codec.
//!
//! Covers exactly what the resolver needs: building a one-question query
//! and parsing the response records of type PTR, SRV, A and AAAA at the
//! 512-byte UDP packet size. Compressed names are followed with a bounded
//! hop count; unknown record types are skipped by their declared length.

use std::net::{Ipv4Addr, Ipv6Addr};

use byteorder::{BigEndian, ByteOrder};

use crate::config::DNS_PACKET_SIZE;

/// Query/record types used by the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum QType {
    A = 1,
    Ptr = 12,
    Aaaa = 28,
    Srv = 33,
}

impl QType {
    pub fn name(self) -> &'static str {
        match self {
            QType::A => "A",
            QType::Ptr => "PTR",
            QType::Aaaa => "AAAA",
            QType::Srv => "SRV",
        }
    }
}

/// Internet class.
const CLASS_IN: u16 = 1;

/// Response codes the resolver distinguishes.
pub const RCODE_NO_ERROR: u8 = 0;
pub const RCODE_NXDOMAIN: u8 = 3;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// A label exceeds 63 bytes or the name exceeds 255.
    NameTooLong(String),
    /// Packet ends inside a field.
    Truncated,
    /// Compression pointers loop or nest too deep.
    PointerLoop,
    /// Query would exceed the UDP packet size.
    PacketTooLarge,
    /// Header says response but the QR bit is missing.
    NotAResponse,
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NameTooLong(name) => write!(f, "name too long: {}", name),
            Self::Truncated => write!(f, "truncated packet"),
            Self::PointerLoop => write!(f, "compression pointer loop"),
            Self::PacketTooLarge => write!(f, "packet exceeds 512 bytes"),
            Self::NotAResponse => write!(f, "not a response packet"),
        }
    }
}

impl std::error::Error for DnsError {}

/// Record payload of the types the resolver consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    /// Unknown type, kept only for diagnostics.
    Other(u16),
}

/// One parsed resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRecord {
    pub name: String,
    pub rtype: u16,
    pub ttl: u32,
    pub data: RecordData,
}

/// Parsed response: header fields plus every non-question record in
/// packet order (answer, authority and additional sections merged, the
/// way the resolver harvests them).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponse {
    pub id: u16,
    pub rcode: u8,
    pub records: Vec<ResourceRecord>,
}

/// Build a one-question recursive query.
pub fn build_query(id: u16, qname: &str, qtype: QType) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(DNS_PACKET_SIZE);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // RD set
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // AN/NS/AR counts

    write_qname(&mut packet, qname)?;
    packet.extend_from_slice(&(qtype as u16).to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    if packet.len() > DNS_PACKET_SIZE {
        return Err(DnsError::PacketTooLarge);
    }
    Ok(packet)
}

/// Parse a response packet.
pub fn parse_response(packet: &[u8]) -> Result<DnsResponse, DnsError> {
    if packet.len() < 12 {
        return Err(DnsError::Truncated);
    }
    let id = BigEndian::read_u16(&packet[0..2]);
    let flags = BigEndian::read_u16(&packet[2..4]);
    if flags & 0x8000 == 0 {
        return Err(DnsError::NotAResponse);
    }
    let rcode = (flags & 0x000f) as u8;
    let qd_count = BigEndian::read_u16(&packet[4..6]);
    let an_count = BigEndian::read_u16(&packet[6..8]);
    let ns_count = BigEndian::read_u16(&packet[8..10]);
    let ar_count = BigEndian::read_u16(&packet[10..12]);

    let mut pos = 12;
    for _ in 0..qd_count {
        let (_, next) = read_name(packet, pos)?;
        pos = next + 4; // qtype + qclass
        if pos > packet.len() {
            return Err(DnsError::Truncated);
        }
    }

    let total = u32::from(an_count) + u32::from(ns_count) + u32::from(ar_count);
    let mut records = Vec::new();
    for _ in 0..total {
        let (name, next) = read_name(packet, pos)?;
        pos = next;
        if pos + 10 > packet.len() {
            return Err(DnsError::Truncated);
        }
        let rtype = BigEndian::read_u16(&packet[pos..]);
        let ttl = BigEndian::read_u32(&packet[pos + 4..]);
        let rdlength = BigEndian::read_u16(&packet[pos + 8..]) as usize;
        pos += 10;
        if pos + rdlength > packet.len() {
            return Err(DnsError::Truncated);
        }
        let rdata = &packet[pos..pos + rdlength];

        let data = match rtype {
            t if t == QType::A as u16 && rdlength == 4 => {
                RecordData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))
            }
            t if t == QType::Aaaa as u16 && rdlength == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                RecordData::Aaaa(Ipv6Addr::from(octets))
            }
            t if t == QType::Ptr as u16 => {
                let (target, _) = read_name(packet, pos)?;
                RecordData::Ptr(target)
            }
            t if t == QType::Srv as u16 && rdlength >= 6 => {
                let priority = BigEndian::read_u16(rdata);
                let weight = BigEndian::read_u16(&rdata[2..]);
                let port = BigEndian::read_u16(&rdata[4..]);
                let (target, _) = read_name(packet, pos + 6)?;
                RecordData::Srv {
                    priority,
                    weight,
                    port,
                    target,
                }
            }
            other => RecordData::Other(other),
        };

        pos += rdlength;
        records.push(ResourceRecord {
            name,
            rtype,
            ttl,
            data,
        });
    }

    Ok(DnsResponse { id, rcode, records })
}

/// Append a dotted name as length-prefixed labels.
fn write_qname(packet: &mut Vec<u8>, qname: &str) -> Result<(), DnsError> {
    let mut total = 0;
    for label in qname.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        if bytes.len() > 63 {
            return Err(DnsError::NameTooLong(qname.to_string()));
        }
        total += bytes.len() + 1;
        if total > 255 {
            return Err(DnsError::NameTooLong(qname.to_string()));
        }
        packet.push(bytes.len() as u8);
        packet.extend_from_slice(bytes);
    }
    packet.push(0);
    Ok(())
}

/// Read a possibly compressed name; returns the dotted name (with a
/// trailing dot) and the position after the name in the original stream.
fn read_name(packet: &[u8], start: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut pos = start;
    let mut next = None; // resume position once the first pointer is taken
    let mut hops = 0;

    loop {
        let len = *packet.get(pos).ok_or(DnsError::Truncated)? as usize;
        if len == 0 {
            pos += 1;
            break;
        }
        if len & 0xc0 == 0xc0 {
            let second = *packet.get(pos + 1).ok_or(DnsError::Truncated)?;
            let target = ((len & 0x3f) << 8) | second as usize;
            if next.is_none() {
                next = Some(pos + 2);
            }
            hops += 1;
            if hops > 32 {
                return Err(DnsError::PointerLoop);
            }
            pos = target;
            continue;
        }
        if len > 63 {
            return Err(DnsError::Truncated);
        }
        let label = packet
            .get(pos + 1..pos + 1 + len)
            .ok_or(DnsError::Truncated)?;
        name.push_str(&String::from_utf8_lossy(label));
        name.push('.');
        pos += 1 + len;
        if name.len() > 255 {
            return Err(DnsError::NameTooLong(name));
        }
    }

    Ok((name, next.unwrap_or(pos)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_query_layout() {
        let packet = build_query(0x1234, "_http._tcp.node1.local.", QType::Srv).unwrap();
        assert_eq!(&packet[0..2], &[0x12, 0x34]);
        assert_eq!(&packet[2..4], &[0x01, 0x00]); // RD
        assert_eq!(&packet[4..6], &[0, 1]); // one question

        // labels: 5"_http" 4"_tcp" 5"node1" 5"local" 0
        assert_eq!(packet[12] as usize, 5);
        assert_eq!(&packet[13..18], b"_http");
        let qtype_off = packet.len() - 4;
        assert_eq!(BigEndian::read_u16(&packet[qtype_off..]), QType::Srv as u16);
    }

    #[test]
    fn test_query_name_limits() {
        let long_label = "a".repeat(64);
        assert!(matches!(
            build_query(1, &long_label, QType::A),
            Err(DnsError::NameTooLong(_))
        ));
        let long_name = vec!["abcdefgh"; 40].join(".");
        assert!(matches!(
            build_query(1, &long_name, QType::A),
            Err(DnsError::NameTooLong(_))
        ));
    }

    /// Hand-built response: question + one PTR answer using compression.
    fn ptr_response() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&[0xbe, 0xef]); // id
        p.extend_from_slice(&[0x81, 0x80]); // QR, RD, RA
        p.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);

        // question: 1.0.0.10.in-addr.arpa PTR
        let qname_off = p.len();
        for label in ["1", "0", "0", "10", "in-addr", "arpa"] {
            p.push(label.len() as u8);
            p.extend_from_slice(label.as_bytes());
        }
        p.push(0);
        p.extend_from_slice(&(QType::Ptr as u16).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());

        // answer: pointer back to the question name
        p.extend_from_slice(&[0xc0, qname_off as u8]);
        p.extend_from_slice(&(QType::Ptr as u16).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&300u32.to_be_bytes());
        let rdata_start = p.len();
        p.extend_from_slice(&[0, 0]); // rdlength patched below
        for label in ["node1", "local"] {
            p.push(label.len() as u8);
            p.extend_from_slice(label.as_bytes());
        }
        p.push(0);
        let rdlength = (p.len() - rdata_start - 2) as u16;
        p[rdata_start..rdata_start + 2].copy_from_slice(&rdlength.to_be_bytes());
        p
    }

    #[test]
    fn test_parse_ptr_with_compression() {
        let response = parse_response(&ptr_response()).unwrap();
        assert_eq!(response.id, 0xbeef);
        assert_eq!(response.rcode, RCODE_NO_ERROR);
        assert_eq!(response.records.len(), 1);
        assert_eq!(response.records[0].name, "1.0.0.10.in-addr.arpa.");
        assert_eq!(
            response.records[0].data,
            RecordData::Ptr("node1.local.".to_string())
        );
    }

    /// SRV answer plus an AAAA additional record.
    fn srv_response() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&[0x00, 0x42]);
        p.extend_from_slice(&[0x81, 0x80]);
        p.extend_from_slice(&[0, 0, 0, 1, 0, 0, 0, 1]); // no question, 1 an, 1 ar

        // answer: SRV 10 20 80 node1.local.
        p.push(0); // root name
        p.extend_from_slice(&(QType::Srv as u16).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&60u32.to_be_bytes());
        let target_labels: &[&str] = &["node1", "local"];
        let target_len: usize = target_labels.iter().map(|l| l.len() + 1).sum::<usize>() + 1;
        p.extend_from_slice(&((6 + target_len) as u16).to_be_bytes());
        p.extend_from_slice(&10u16.to_be_bytes());
        p.extend_from_slice(&20u16.to_be_bytes());
        p.extend_from_slice(&80u16.to_be_bytes());
        for label in target_labels {
            p.push(label.len() as u8);
            p.extend_from_slice(label.as_bytes());
        }
        p.push(0);

        // additional: AAAA for node1.local.
        for label in target_labels {
            p.push(label.len() as u8);
            p.extend_from_slice(label.as_bytes());
        }
        p.push(0);
        p.extend_from_slice(&(QType::Aaaa as u16).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&60u32.to_be_bytes());
        p.extend_from_slice(&16u16.to_be_bytes());
        p.extend_from_slice(&"2001:db8::1".parse::<Ipv6Addr>().unwrap().octets());
        p
    }

    #[test]
    fn test_parse_srv_with_additional_aaaa() {
        let response = parse_response(&srv_response()).unwrap();
        assert_eq!(response.records.len(), 2);
        assert_eq!(
            response.records[0].data,
            RecordData::Srv {
                priority: 10,
                weight: 20,
                port: 80,
                target: "node1.local.".to_string()
            }
        );
        assert_eq!(
            response.records[1].data,
            RecordData::Aaaa("2001:db8::1".parse().unwrap())
        );
    }

    #[test]
    fn test_nxdomain_rcode() {
        let mut p = vec![0u8, 7, 0x81, 0x83];
        p.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
        let response = parse_response(&p).unwrap();
        assert_eq!(response.rcode, RCODE_NXDOMAIN);
        assert!(response.records.is_empty());
    }

    #[test]
    fn test_query_packet_rejected() {
        let query = build_query(9, "example.com", QType::A).unwrap();
        assert!(matches!(parse_response(&query), Err(DnsError::NotAResponse)));
    }

    #[test]
    fn test_pointer_loop_detected() {
        let mut p = vec![0u8, 8, 0x81, 0x80];
        p.extend_from_slice(&[0, 1, 0, 0, 0, 0, 0, 0]);
        // question name is a pointer to itself
        p.extend_from_slice(&[0xc0, 12]);
        p.extend_from_slice(&[0, 1, 0, 1]);
        assert_eq!(parse_response(&p), Err(DnsError::PointerLoop));
    }

    #[test]
    fn test_unknown_type_skipped_by_length() {
        let mut p = vec![0u8, 9, 0x81, 0x80];
        p.extend_from_slice(&[0, 0, 0, 2, 0, 0, 0, 0]);
        // TXT-ish record with opaque rdata
        p.push(0);
        p.extend_from_slice(&16u16.to_be_bytes()); // TXT
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&0u32.to_be_bytes());
        p.extend_from_slice(&3u16.to_be_bytes());
        p.extend_from_slice(b"abc");
        // then a normal A record
        p.push(0);
        p.extend_from_slice(&(QType::A as u16).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&0u32.to_be_bytes());
        p.extend_from_slice(&4u16.to_be_bytes());
        p.extend_from_slice(&[192, 0, 2, 9]);

        let response = parse_response(&p).unwrap();
        assert_eq!(response.records[0].data, RecordData::Other(16));
        assert_eq!(
            response.records[1].data,
            RecordData::A("192.0.2.9".parse().unwrap())
        );
    }
}
