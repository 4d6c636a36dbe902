// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! This module centralizes the compile-time constants of the daemon core and
//! the flat key/value configuration overlay. **NEVER hardcode elsewhere!**
//!
//! # Architecture
//!
//! - **Level 1 (Static)**: compile-time constants (wire budgets, timeouts)
//! - **Level 2 (Dynamic)**: [`Config`] built from flat `section.key = value`
//!   pairs produced by an external configuration parser
//!
//! Recognized sections/keys:
//!
//! | Section     | Key       | Effect                                        |
//! |-------------|-----------|-----------------------------------------------|
//! | `class`     | `debug`   | Guard prefix/suffix + validation on free      |
//! | `dns_query` | `timeout` | Default per-query timeout in milliseconds     |
//! | `dns_sd`    | `prefix`  | Service prefix to query (repeatable)          |

use std::time::Duration;

// =======================================================================
// Netlink transport budgets
// =======================================================================

/// Netlink receive/send block granularity in bytes.
///
/// Receive buffers grow in multiples of this value; a send batch never
/// exceeds one block.
pub const NETLINK_BLOCK_SIZE: usize = 4096;

/// Number of I/O vector slots available for one netlink send batch.
///
/// One slot is reserved for the trailing DONE header of a multi-message
/// batch, so at most `NETLINK_SEND_SLOTS - 1` messages ride together.
pub const NETLINK_SEND_SLOTS: usize = 32;

/// Kernel socket receive buffer size requested via `SO_RCVBUF`.
pub const NETLINK_SOCKET_RCVBUF: usize = 65536;

/// Timeout for a kernel acknowledgement of sent netlink messages.
pub const NETLINK_ACK_TIMEOUT: Duration = Duration::from_millis(1000);

// =======================================================================
// DLEP defaults (RFC 8175 wire values)
// =======================================================================

/// IANA-assigned DLEP TCP/UDP port.
pub const DLEP_PORT: u16 = 854;

/// IANA-assigned DLEP IPv4 discovery multicast group.
pub const DLEP_MULTICAST_V4: [u8; 4] = [224, 0, 0, 117];

/// Default session heartbeat interval.
pub const DLEP_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default latency metric written into the session ack, in microseconds.
pub const DLEP_DEFAULT_LATENCY_US: i64 = 1_000_000;

/// Upper bound for a single DLEP signal including its header.
pub const DLEP_MAX_SIGNAL_SIZE: usize = 65535 + 4;

// =======================================================================
// DNS defaults
// =======================================================================

/// DNS packet buffer size for UDP transport (RFC 1035).
pub const DNS_PACKET_SIZE: usize = 512;

/// Default per-query timeout, overridable via `dns_query.timeout`.
pub const DNS_QUERY_TIMEOUT: Duration = Duration::from_millis(1000);

// =======================================================================
// Event loop
// =======================================================================

/// Upper bound for one poll wait when no timer is armed.
pub const LOOP_IDLE_CAP: Duration = Duration::from_millis(100);

/// Maximum readiness events drained per poll turn.
pub const LOOP_MAX_EVENTS: usize = 64;

// =======================================================================
// Dynamic configuration overlay
// =======================================================================

/// Parsed key/value configuration for the core subsystems.
///
/// Built from flat `section.key` pairs; unknown keys are reported but do not
/// abort, so a newer configuration file keeps working against an older core.
#[derive(Debug, Clone)]
pub struct Config {
    /// `class.debug`: enable allocation guards and validation on free.
    pub class_debug: bool,
    /// `dns_query.timeout`: default DNS query timeout.
    pub dns_timeout: Duration,
    /// `dns_sd.prefix`: service prefixes to query per discovered neighbor.
    pub sd_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            class_debug: false,
            dns_timeout: DNS_QUERY_TIMEOUT,
            sd_prefixes: Vec::new(),
        }
    }
}

/// Error raised for a key that is known but carries an unparsable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    /// Full `section.key` name.
    pub key: String,
    /// Offending value.
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value '{}' for key '{}'", self.value, self.key)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    /// Build a configuration from flat `section.key = value` pairs.
    ///
    /// The `dns_sd.prefix` key is repeatable; every occurrence appends.
    pub fn from_pairs<'a, I>(pairs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut cfg = Config::default();
        for (key, value) in pairs {
            match key {
                "class.debug" => {
                    cfg.class_debug = parse_bool(value).ok_or_else(|| ConfigError {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
                }
                "dns_query.timeout" => {
                    let ms: u64 = value.parse().map_err(|_| ConfigError {
                        key: key.to_string(),
                        value: value.to_string(),
                    })?;
                    cfg.dns_timeout = Duration::from_millis(ms);
                }
                "dns_sd.prefix" => {
                    cfg.sd_prefixes.push(value.to_string());
                }
                other => {
                    log::warn!("[CFG] ignoring unknown configuration key '{}'", other);
                }
            }
        }
        Ok(cfg)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Tests
// ============================================================================
