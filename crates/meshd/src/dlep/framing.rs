// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Incremental signal deframer for the DLEP TCP stream.
//!
//! TCP is a stream protocol without message boundaries; DLEP delimits its
//! own frames with the 4-byte signal header (id + payload length). The
//! codec accumulates partial reads so it works against non-blocking
//! sockets: call [`SignalFramer::decode`] repeatedly while the socket is
//! readable until it returns `Ok(None)`.

use std::io::{self, Read};

use byteorder::{BigEndian, ByteOrder};

use crate::config::DLEP_MAX_SIGNAL_SIZE;

use super::tlv::SIGNAL_HDRLEN;

#[derive(Debug, Clone, Copy)]
enum ReadState {
    Header { bytes_read: usize },
    Body { frame_len: usize, bytes_read: usize },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::Header { bytes_read: 0 }
    }
}

/// Stream-to-frame codec maintaining partial read state.
#[derive(Debug)]
pub struct SignalFramer {
    state: ReadState,
    buffer: Vec<u8>,
    frames_decoded: u64,
}

impl SignalFramer {
    pub fn new() -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; SIGNAL_HDRLEN],
            frames_decoded: 0,
        }
    }

    /// Number of complete frames decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// True while a partial frame sits in the buffer.
    pub fn is_partial(&self) -> bool {
        match self.state {
            ReadState::Header { bytes_read } => bytes_read > 0,
            ReadState::Body { .. } => true,
        }
    }

    /// Reset after a connection reset.
    pub fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer.resize(SIGNAL_HDRLEN, 0);
    }

    /// Try to decode one complete frame (header included) from the reader.
    ///
    /// - `Ok(Some(frame))`: a complete signal frame
    /// - `Ok(None)`: need more data (would block)
    /// - `Err(_)`: I/O error, oversized frame, or connection close
    pub fn decode<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<Option<Vec<u8>>> {
        loop {
            match self.state {
                ReadState::Header { bytes_read } => {
                    match reader.read(&mut self.buffer[bytes_read..SIGNAL_HDRLEN]) {
                        Ok(0) => {
                            return Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                if bytes_read == 0 {
                                    "connection closed"
                                } else {
                                    "incomplete signal header"
                                },
                            ));
                        }
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < SIGNAL_HDRLEN {
                                self.state = ReadState::Header { bytes_read: total };
                                continue;
                            }
                            let payload = BigEndian::read_u16(&self.buffer[2..4]) as usize;
                            let frame_len = SIGNAL_HDRLEN + payload;
                            if frame_len > DLEP_MAX_SIGNAL_SIZE {
                                self.state = ReadState::default();
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "signal frame too large",
                                ));
                            }
                            if payload == 0 {
                                let frame = self.buffer[..SIGNAL_HDRLEN].to_vec();
                                self.frames_decoded += 1;
                                self.state = ReadState::default();
                                return Ok(Some(frame));
                            }
                            self.buffer.resize(frame_len, 0);
                            self.state = ReadState::Body {
                                frame_len,
                                bytes_read: SIGNAL_HDRLEN,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            self.state = ReadState::Header { bytes_read };
                            return Ok(None);
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }

                ReadState::Body {
                    frame_len,
                    bytes_read,
                } => match reader.read(&mut self.buffer[bytes_read..frame_len]) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "incomplete signal body",
                        ));
                    }
                    Ok(n) => {
                        let total = bytes_read + n;
                        if total < frame_len {
                            self.state = ReadState::Body {
                                frame_len,
                                bytes_read: total,
                            };
                            continue;
                        }
                        let frame = self.buffer[..frame_len].to_vec();
                        self.frames_decoded += 1;
                        self.buffer.resize(SIGNAL_HDRLEN, 0);
                        self.state = ReadState::default();
                        return Ok(Some(frame));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.state = ReadState::Body {
                            frame_len,
                            bytes_read,
                        };
                        return Ok(None);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                },
            }
        }
    }
}

impl Default for SignalFramer {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
