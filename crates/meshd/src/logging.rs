// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Logging helpers shared by the subsystems.
//!
//! All modules log through the `log` facade with a `[TAG]` prefix per
//! subsystem (`[NL]`, `[DLEP]`, `[DNS-SD]`, `[CLASS]`). This module only
//! carries the hex-dump diagnostic attached to warnings about malformed
//! wire input; it renders lazily so the formatting cost is paid when the
//! corresponding log level is active.

use std::fmt;

/// Lazily formatted hex dump of a byte slice.
///
/// Renders 16 bytes per line with an offset column, matching the usual
/// `hexdump -C` layout minus the ASCII gutter:
///
/// ```text
/// 0000: 4c 00 00 00 10 00 02 00 01 00 00 00 8a 33 00 00
/// 0010: 00 00 01 00 ...
/// ```
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (line, chunk) in self.0.chunks(16).enumerate() {
            if line > 0 {
                writeln!(f)?;
            }
            write!(f, "{:04x}:", line * 16)?;
            for byte in chunk {
                write!(f, " {:02x}", byte)?;
            }
        }
        Ok(())
    }
}

/// Log a warning with a debug-build hex dump of the offending bytes.
///
/// Release builds emit only the message; debug builds append the dump at
/// debug level so protocol breakage can be diagnosed from the log alone.
pub fn warn_with_dump(tag: &str, message: &str, bytes: &[u8]) {
    log::warn!("{} {}", tag, message);
    #[cfg(debug_assertions)]
    log::debug!("{} offending bytes ({}):\n{}", tag, bytes.len(), HexDump(bytes));
    #[cfg(not(debug_assertions))]
    let _ = bytes;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_single_line() {
        let out = format!("{}", HexDump(&[0x4c, 0x00, 0xff]));
        assert_eq!(out, "0000: 4c 00 ff");
    }

    #[test]
    fn test_hexdump_multi_line() {
        let bytes: Vec<u8> = (0..18).collect();
        let out = format!("{}", HexDump(&bytes));
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000:"));
        assert!(lines[1].starts_with("0010:"));
        assert!(lines[1].ends_with("10 11"));
    }

    #[test]
    fn test_hexdump_empty() {
        assert_eq!(format!("{}", HexDump(&[])), "");
    }
}
