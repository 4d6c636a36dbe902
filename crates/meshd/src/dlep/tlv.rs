// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DLEP TLV codec.
//!
//! A signal frame is a 16-bit signal id, a 16-bit payload length, then a
//! run of TLVs, each a 16-bit type, 16-bit length and value. All integers
//! are big-endian:
//!
//! ```text
//! +-----------+-----------+----------------------------------+
//! | Signal id | Length    | TLVs ...                         |
//! +-----------+-----------+----------------------------------+
//! | Type      | Length    | Value (length bytes)             |
//! +-----------+-----------+----------------------------------+
//! ```
//!
//! [`SignalWriter`] builds outbound frames; [`TlvMap`] is the bounds-
//! checked scratch index a session keeps while processing one inbound
//! signal.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};

use crate::config::DLEP_MAX_SIGNAL_SIZE;
use crate::layer2::MacAddr;

use super::iana::{Signal, Status, TlvType};

/// Wire size of the signal header.
pub const SIGNAL_HDRLEN: usize = 4;

/// Wire size of a TLV header.
pub const TLV_HDRLEN: usize = 4;

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlepError {
    /// Frame shorter than its header or its declared length.
    Truncated,
    /// A TLV overruns the signal payload.
    TlvOverrun,
    /// Signal would exceed the 16-bit length field.
    SignalTooLarge,
    /// A mandatory TLV is missing.
    MissingTlv(&'static str),
    /// Signal id outside the known table.
    UnknownSignal(u16),
    /// A TLV value has the wrong shape.
    InvalidTlv(&'static str),
}

impl std::fmt::Display for DlepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated signal"),
            Self::TlvOverrun => write!(f, "tlv overruns signal payload"),
            Self::SignalTooLarge => write!(f, "signal exceeds length field"),
            Self::MissingTlv(name) => write!(f, "mandatory tlv {} missing", name),
            Self::UnknownSignal(id) => write!(f, "unknown signal id {}", id),
            Self::InvalidTlv(name) => write!(f, "malformed tlv {}", name),
        }
    }
}

impl std::error::Error for DlepError {}

/// Outbound signal builder.
pub struct SignalWriter {
    buf: Vec<u8>,
}

impl SignalWriter {
    pub fn new(signal: Signal) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&(signal as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0]); // length patched in finish()
        Self { buf }
    }

    /// Append a raw TLV.
    pub fn add_tlv(&mut self, tlv: TlvType, value: &[u8]) {
        debug_assert!(value.len() <= u16::MAX as usize);
        self.buf.extend_from_slice(&(tlv as u16).to_be_bytes());
        self.buf
            .extend_from_slice(&(value.len() as u16).to_be_bytes());
        self.buf.extend_from_slice(value);
    }

    pub fn add_status(&mut self, status: Status) {
        self.add_tlv(TlvType::Status, &[status as u8]);
    }

    /// Heartbeat interval in milliseconds.
    pub fn add_heartbeat_interval(&mut self, interval: Duration) {
        let ms = interval.as_millis().min(u128::from(u32::MAX)) as u32;
        self.add_tlv(TlvType::HeartbeatInterval, &ms.to_be_bytes());
    }

    pub fn add_mac(&mut self, mac: MacAddr) {
        self.add_tlv(TlvType::MacAddress, mac.as_bytes());
    }

    pub fn add_peer_type(&mut self, peer_type: &str) {
        self.add_tlv(TlvType::PeerType, peer_type.as_bytes());
    }

    /// Packed array of 16-bit extension ids.
    pub fn add_extensions_supported(&mut self, ids: &[u16]) {
        let mut value = Vec::with_capacity(ids.len() * 2);
        for id in ids {
            value.extend_from_slice(&id.to_be_bytes());
        }
        self.add_tlv(TlvType::ExtensionsSupported, &value);
    }

    pub fn add_ipv4_connection_point(&mut self, addr: Ipv4Addr, port: u16) {
        let mut value = Vec::with_capacity(7);
        value.push(0); // no TLS
        value.extend_from_slice(&addr.octets());
        value.extend_from_slice(&port.to_be_bytes());
        self.add_tlv(TlvType::Ipv4ConnectionPoint, &value);
    }

    pub fn add_ipv6_connection_point(&mut self, addr: Ipv6Addr, port: u16) {
        let mut value = Vec::with_capacity(19);
        value.push(0);
        value.extend_from_slice(&addr.octets());
        value.extend_from_slice(&port.to_be_bytes());
        self.add_tlv(TlvType::Ipv6ConnectionPoint, &value);
    }

    /// 64-bit metric value (data rates, latency).
    pub fn add_metric(&mut self, tlv: TlvType, value: u64) {
        self.add_tlv(tlv, &value.to_be_bytes());
    }

    /// Patch the length field and return the wire frame.
    pub fn finish(mut self) -> Result<Vec<u8>, DlepError> {
        let payload = self.buf.len() - SIGNAL_HDRLEN;
        if payload > u16::MAX as usize || self.buf.len() > DLEP_MAX_SIGNAL_SIZE {
            return Err(DlepError::SignalTooLarge);
        }
        BigEndian::write_u16(&mut self.buf[2..4], payload as u16);
        Ok(self.buf)
    }
}

/// Bounds-checked index over the TLVs of one inbound signal.
pub struct TlvMap<'a> {
    payload: &'a [u8],
    entries: Vec<(u16, usize, usize)>, // type, offset, length
}

impl<'a> TlvMap<'a> {
    fn index(payload: &'a [u8]) -> Result<Self, DlepError> {
        let mut entries = Vec::new();
        let mut pos = 0;
        while pos < payload.len() {
            if pos + TLV_HDRLEN > payload.len() {
                return Err(DlepError::TlvOverrun);
            }
            let tlv_type = BigEndian::read_u16(&payload[pos..]);
            let len = BigEndian::read_u16(&payload[pos + 2..]) as usize;
            if pos + TLV_HDRLEN + len > payload.len() {
                return Err(DlepError::TlvOverrun);
            }
            entries.push((tlv_type, pos + TLV_HDRLEN, len));
            pos += TLV_HDRLEN + len;
        }
        Ok(Self { payload, entries })
    }

    /// First TLV of a type.
    pub fn get(&self, tlv: TlvType) -> Option<&'a [u8]> {
        self.entries
            .iter()
            .find(|(t, _, _)| *t == tlv as u16)
            .map(|(_, off, len)| &self.payload[*off..*off + *len])
    }

    /// Every TLV of a type, in wire order.
    pub fn get_all(&self, tlv: TlvType) -> Vec<&'a [u8]> {
        self.entries
            .iter()
            .filter(|(t, _, _)| *t == tlv as u16)
            .map(|(_, off, len)| &self.payload[*off..*off + *len])
            .collect()
    }

    /// Mandatory heartbeat interval TLV (u32 milliseconds).
    pub fn heartbeat_interval(&self) -> Result<Duration, DlepError> {
        let value = self
            .get(TlvType::HeartbeatInterval)
            .ok_or(DlepError::MissingTlv("heartbeat interval"))?;
        if value.len() != 4 {
            return Err(DlepError::InvalidTlv("heartbeat interval"));
        }
        Ok(Duration::from_millis(u64::from(BigEndian::read_u32(value))))
    }

    /// Mandatory MAC address TLV (EUI-48 or EUI-64).
    pub fn mac(&self) -> Result<MacAddr, DlepError> {
        let value = self
            .get(TlvType::MacAddress)
            .ok_or(DlepError::MissingTlv("mac address"))?;
        MacAddr::from_slice(value).ok_or(DlepError::InvalidTlv("mac address"))
    }

    /// Optional status TLV; missing defaults to okay per protocol.
    pub fn status(&self) -> Result<Status, DlepError> {
        match self.get(TlvType::Status) {
            None => Ok(Status::Okay),
            Some([code, ..]) => {
                Status::from_u8(*code).ok_or(DlepError::InvalidTlv("status"))
            }
            Some(_) => Err(DlepError::InvalidTlv("status")),
        }
    }

    /// Optional peer-type TLV.
    pub fn peer_type(&self) -> Option<String> {
        self.get(TlvType::PeerType)
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Optional extensions-supported TLV: packed 16-bit ids.
    pub fn extensions_supported(&self) -> Vec<u16> {
        match self.get(TlvType::ExtensionsSupported) {
            Some(value) => value
                .chunks_exact(2)
                .map(|c| BigEndian::read_u16(c))
                .collect(),
            None => Vec::new(),
        }
    }

    /// 64-bit metric value.
    pub fn metric(&self, tlv: TlvType) -> Option<u64> {
        self.get(tlv).and_then(|v| {
            if v.len() == 8 {
                Some(BigEndian::read_u64(v))
            } else {
                None
            }
        })
    }
}

/// Parse a complete signal frame into its id and TLV index.
pub fn parse_signal(frame: &[u8]) -> Result<(Signal, TlvMap<'_>), DlepError> {
    if frame.len() < SIGNAL_HDRLEN {
        return Err(DlepError::Truncated);
    }
    let id = BigEndian::read_u16(&frame[0..2]);
    let len = BigEndian::read_u16(&frame[2..4]) as usize;
    if frame.len() < SIGNAL_HDRLEN + len {
        return Err(DlepError::Truncated);
    }
    let signal = Signal::from_u16(id).ok_or(DlepError::UnknownSignal(id))?;
    let map = TlvMap::index(&frame[SIGNAL_HDRLEN..SIGNAL_HDRLEN + len])?;
    Ok((signal, map))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mac1() -> MacAddr {
        MacAddr::eui48([0x02, 0, 0, 0, 0, 1])
    }

    #[test]
    fn test_signal_round_trip() {
        let mut writer = SignalWriter::new(Signal::DestinationUp);
        writer.add_mac(mac1());
        writer.add_metric(TlvType::MaxDataRateTx, 54_000_000);
        writer.add_metric(TlvType::Latency, 1_000_000);
        let frame = writer.finish().unwrap();

        let (signal, tlvs) = parse_signal(&frame).unwrap();
        assert_eq!(signal, Signal::DestinationUp);
        assert_eq!(tlvs.mac().unwrap(), mac1());
        assert_eq!(tlvs.metric(TlvType::MaxDataRateTx), Some(54_000_000));
        assert_eq!(tlvs.metric(TlvType::Latency), Some(1_000_000));
        assert_eq!(tlvs.metric(TlvType::CurrentDataRateRx), None);
    }

    #[test]
    fn test_heartbeat_and_status() {
        let mut writer = SignalWriter::new(Signal::PeerInitializationAck);
        writer.add_heartbeat_interval(Duration::from_millis(1500));
        writer.add_status(Status::Okay);
        let frame = writer.finish().unwrap();

        let (_, tlvs) = parse_signal(&frame).unwrap();
        assert_eq!(
            tlvs.heartbeat_interval().unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(tlvs.status().unwrap(), Status::Okay);
    }

    #[test]
    fn test_status_defaults_to_okay() {
        let frame = SignalWriter::new(Signal::Heartbeat).finish().unwrap();
        let (_, tlvs) = parse_signal(&frame).unwrap();
        assert_eq!(tlvs.status().unwrap(), Status::Okay);
    }

    #[test]
    fn test_eui64_mac() {
        let mut writer = SignalWriter::new(Signal::DestinationUp);
        writer.add_mac(MacAddr::eui64([1, 2, 3, 4, 5, 6, 7, 8]));
        let frame = writer.finish().unwrap();
        let (_, tlvs) = parse_signal(&frame).unwrap();
        assert_eq!(tlvs.mac().unwrap().len(), 8);
    }

    #[test]
    fn test_extensions_supported_packing() {
        let mut writer = SignalWriter::new(Signal::PeerInitializationAck);
        writer.add_extensions_supported(&[1, 2, 0x0102]);
        let frame = writer.finish().unwrap();
        let (_, tlvs) = parse_signal(&frame).unwrap();
        assert_eq!(tlvs.extensions_supported(), vec![1, 2, 0x0102]);
    }

    #[test]
    fn test_connection_points() {
        let mut writer = SignalWriter::new(Signal::PeerOffer);
        writer.add_ipv4_connection_point("192.0.2.1".parse().unwrap(), 854);
        writer.add_ipv6_connection_point("2001:db8::1".parse().unwrap(), 854);
        let frame = writer.finish().unwrap();

        let (_, tlvs) = parse_signal(&frame).unwrap();
        let v4 = tlvs.get(TlvType::Ipv4ConnectionPoint).unwrap();
        assert_eq!(v4.len(), 7);
        assert_eq!(&v4[1..5], &[192, 0, 2, 1]);
        assert_eq!(BigEndian::read_u16(&v4[5..7]), 854);
        let v6 = tlvs.get(TlvType::Ipv6ConnectionPoint).unwrap();
        assert_eq!(v6.len(), 19);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let mut writer = SignalWriter::new(Signal::Heartbeat);
        writer.add_status(Status::Okay);
        let mut frame = writer.finish().unwrap();
        frame.truncate(frame.len() - 1);
        assert!(matches!(parse_signal(&frame), Err(DlepError::Truncated)));
    }

    #[test]
    fn test_tlv_overrun_rejected() {
        // claim a TLV longer than the payload
        let frame = [0u8, 13, 0, 4, 0, 1, 0, 200];
        assert!(matches!(parse_signal(&frame), Err(DlepError::TlvOverrun)));
    }

    #[test]
    fn test_unknown_signal_rejected() {
        let frame = [0xff, 0xff, 0, 0];
        assert!(matches!(
            parse_signal(&frame),
            Err(DlepError::UnknownSignal(0xffff))
        ));
    }
}
