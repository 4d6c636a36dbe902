// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Interface address table.
//!
//! Interface discovery itself is a collaborator outside this crate; the
//! table is populated externally and consumed by the DNS-SD resolver to
//! pick a source address routable to a given DNS server.

use std::collections::BTreeMap;
use std::net::IpAddr;

/// One address assigned to an interface, with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfaceAddr {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl IfaceAddr {
    /// True when `dst` falls into this address's prefix.
    fn covers(&self, dst: IpAddr) -> bool {
        match (self.addr, dst) {
            (IpAddr::V4(addr), IpAddr::V4(dst)) => {
                let bits = u32::from(self.prefix_len.min(32));
                let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
                u32::from(addr) & mask == u32::from(dst) & mask
            }
            (IpAddr::V6(addr), IpAddr::V6(dst)) => {
                let bits = u32::from(self.prefix_len.min(128));
                let mask = if bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - bits)
                };
                u128::from(addr) & mask == u128::from(dst) & mask
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct IfaceInfo {
    index: u32,
    addresses: Vec<IfaceAddr>,
}

/// Externally populated map of interface name to address data.
#[derive(Debug, Default)]
pub struct OsInterfaceTable {
    interfaces: BTreeMap<String, IfaceInfo>,
}

impl OsInterfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh an interface.
    pub fn set_interface(&mut self, name: &str, index: u32) {
        let info = self.interfaces.entry(name.to_string()).or_default();
        info.index = index;
    }

    /// Add an address to an interface, creating the entry when needed.
    pub fn add_address(&mut self, name: &str, addr: IpAddr, prefix_len: u8) {
        let info = self.interfaces.entry(name.to_string()).or_default();
        let entry = IfaceAddr { addr, prefix_len };
        if !info.addresses.contains(&entry) {
            info.addresses.push(entry);
        }
    }

    pub fn remove_address(&mut self, name: &str, addr: IpAddr) {
        if let Some(info) = self.interfaces.get_mut(name) {
            info.addresses.retain(|a| a.addr != addr);
        }
    }

    pub fn remove_interface(&mut self, name: &str) {
        self.interfaces.remove(name);
    }

    pub fn index(&self, name: &str) -> Option<u32> {
        self.interfaces.get(name).map(|i| i.index)
    }

    /// Pick a source address on `name` for reaching `dst`.
    ///
    /// Prefers the address whose prefix covers the destination; falls
    /// back to any address of the same family.
    pub fn source_for(&self, name: &str, dst: IpAddr) -> Option<IpAddr> {
        let info = self.interfaces.get(name)?;
        fn same_family(a: &IfaceAddr, dst: IpAddr) -> bool {
            matches!(
                (a.addr, dst),
                (IpAddr::V4(_), IpAddr::V4(_)) | (IpAddr::V6(_), IpAddr::V6(_))
            )
        }
        info.addresses
            .iter()
            .filter(|a| same_family(a, dst))
            .find(|a| a.covers(dst))
            .or_else(|| info.addresses.iter().find(|a| same_family(a, dst)))
            .map(|a| a.addr)
    }
}

// ============================================================================
// Tests
// ============================================================================
