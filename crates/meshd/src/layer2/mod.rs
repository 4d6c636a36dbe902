// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal layer-2 database.
//!
//! The schema here is the slice the session engines consume: networks
//! keyed by interface name, neighbors keyed by MAC, proxied destinations
//! hanging off their neighbor, and per-neighbor IP addresses. Neighbor,
//! destination and address records are allocated from the object-class
//! registry; every mutation fires the matching class event so subscribed
//! extensions (DLEP, DNS-SD) observe the database without being wired to
//! it directly.
//!
//! Record payloads are flat byte images with explicit accessors, which is
//! what keeps the allocation guards of debug mode meaningful.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;

use crate::runtime::class::{fire_event, ClassEvent, ClassSpec};
use crate::runtime::{ClassBlock, ClassError, Core};

/// Class name of neighbor records.
pub const L2_CLASS_NEIGHBOR: &str = "l2 neighbor";
/// Class name of proxied-destination records.
pub const L2_CLASS_DESTINATION: &str = "l2 destination";
/// Class name of neighbor-address records.
pub const L2_CLASS_NEIGHBOR_ADDRESS: &str = "l2 neighbor address";

/// MAC address, EUI-48 or EUI-64.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddr {
    len: u8,
    bytes: [u8; 8],
}

impl MacAddr {
    pub fn eui48(bytes: [u8; 6]) -> Self {
        let mut buf = [0u8; 8];
        buf[..6].copy_from_slice(&bytes);
        Self { len: 6, bytes: buf }
    }

    pub fn eui64(bytes: [u8; 8]) -> Self {
        Self { len: 8, bytes }
    }

    /// Build from a wire slice of 6 or 8 bytes.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        match data.len() {
            6 => Some(Self::eui48(data.try_into().unwrap())),
            8 => Some(Self::eui64(data.try_into().unwrap())),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Neighbor metrics consumed by the session engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2NeighMetric {
    /// Maximum transmit bitrate in bit/s.
    TxMaxBitrate = 0,
    /// Current receive bitrate in bit/s.
    RxBitrate = 1,
    /// Latency in microseconds.
    Latency = 2,
}

impl L2NeighMetric {
    pub const COUNT: usize = 3;
    pub const ALL: [L2NeighMetric; Self::COUNT] = [
        L2NeighMetric::TxMaxBitrate,
        L2NeighMetric::RxBitrate,
        L2NeighMetric::Latency,
    ];
}

// record layouts inside class payloads
const MAC_FIELD: usize = 9; // length byte + up to 8 address bytes
const METRIC_FIELD: usize = 9; // presence byte + i64 value
const NEIGHBOR_RECORD: usize = MAC_FIELD + L2NeighMetric::COUNT * METRIC_FIELD;
const DESTINATION_RECORD: usize = 2 * MAC_FIELD;
const ADDRESS_RECORD: usize = 17; // family tag + 16 address bytes

fn write_mac(buf: &mut [u8], offset: usize, mac: MacAddr) {
    buf[offset] = mac.len;
    buf[offset + 1..offset + 1 + 8].copy_from_slice(&mac.bytes);
}

fn read_mac(buf: &[u8], offset: usize) -> Option<MacAddr> {
    let len = buf[offset];
    if len != 6 && len != 8 {
        return None;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset + 1..offset + 1 + 8]);
    Some(MacAddr { len, bytes })
}

fn write_metric(buf: &mut [u8], index: usize, value: Option<i64>) {
    let offset = MAC_FIELD + index * METRIC_FIELD;
    match value {
        Some(value) => {
            buf[offset] = 1;
            buf[offset + 1..offset + 9].copy_from_slice(&value.to_le_bytes());
        }
        None => {
            buf[offset..offset + 9].fill(0);
        }
    }
}

fn read_metric(buf: &[u8], index: usize) -> Option<i64> {
    let offset = MAC_FIELD + index * METRIC_FIELD;
    if buf[offset] == 0 {
        return None;
    }
    Some(i64::from_le_bytes(
        buf[offset + 1..offset + 9].try_into().unwrap(),
    ))
}

fn write_ip(buf: &mut [u8], ip: IpAddr) {
    match ip {
        IpAddr::V4(v4) => {
            buf[0] = 4;
            buf[1..5].copy_from_slice(&v4.octets());
            buf[5..17].fill(0);
        }
        IpAddr::V6(v6) => {
            buf[0] = 6;
            buf[1..17].copy_from_slice(&v6.octets());
        }
    }
}

/// Event subject for neighbor add/change/remove.
#[derive(Debug, Clone)]
pub struct L2NeighborEvent {
    pub network: String,
    pub mac: MacAddr,
}

/// Event subject for proxied-destination add/remove.
#[derive(Debug, Clone)]
pub struct L2DestinationEvent {
    pub network: String,
    pub destination: MacAddr,
    pub neighbor: MacAddr,
}

/// Event subject for neighbor-address add/remove.
#[derive(Debug, Clone)]
pub struct L2NeighborAddressEvent {
    pub network: String,
    pub neighbor: MacAddr,
    pub ip: IpAddr,
}

struct L2Neighbor {
    block: ClassBlock,
    destinations: BTreeMap<MacAddr, ClassBlock>,
    addresses: BTreeMap<IpAddr, ClassBlock>,
}

struct L2Network {
    if_index: u32,
    defaults: [Option<i64>; L2NeighMetric::COUNT],
    remote_dns_v4: Option<SocketAddr>,
    remote_dns_v6: Option<SocketAddr>,
    neighbors: BTreeMap<MacAddr, L2Neighbor>,
}

struct L2State {
    core: Core,
    networks: BTreeMap<String, L2Network>,
}

/// Handle to the layer-2 database.
#[derive(Clone)]
pub struct Layer2Db {
    state: Rc<RefCell<L2State>>,
}

impl Layer2Db {
    /// Create the database and register its object classes.
    pub fn new(core: Core) -> Result<Self, ClassError> {
        {
            let mut classes = core.classes.borrow_mut();
            classes.register(ClassSpec::new(L2_CLASS_NEIGHBOR, NEIGHBOR_RECORD))?;
            classes.register(ClassSpec::new(L2_CLASS_DESTINATION, DESTINATION_RECORD))?;
            classes.register(ClassSpec::new(
                L2_CLASS_NEIGHBOR_ADDRESS,
                ADDRESS_RECORD,
            ))?;
        }
        Ok(Self {
            state: Rc::new(RefCell::new(L2State {
                core,
                networks: BTreeMap::new(),
            })),
        })
    }

    /// Add (or fetch) a network for an interface name.
    pub fn net_add(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        state.networks.entry(name.to_string()).or_insert(L2Network {
            if_index: 0,
            defaults: [None; L2NeighMetric::COUNT],
            remote_dns_v4: None,
            remote_dns_v6: None,
            neighbors: BTreeMap::new(),
        });
    }

    pub fn net_exists(&self, name: &str) -> bool {
        self.state.borrow().networks.contains_key(name)
    }

    /// Interface index used for IPv6 scope selection.
    pub fn net_set_if_index(&self, name: &str, index: u32) {
        if let Some(net) = self.state.borrow_mut().networks.get_mut(name) {
            net.if_index = index;
        }
    }

    pub fn net_if_index(&self, name: &str) -> Option<u32> {
        self.state.borrow().networks.get(name).map(|n| n.if_index)
    }

    /// Record the DNS servers learned for this network.
    pub fn net_set_remote_dns(
        &self,
        name: &str,
        v4: Option<SocketAddr>,
        v6: Option<SocketAddr>,
    ) {
        if let Some(net) = self.state.borrow_mut().networks.get_mut(name) {
            net.remote_dns_v4 = v4;
            net.remote_dns_v6 = v6;
        }
    }

    /// DNS server of a network; IPv6 preferred over IPv4.
    pub fn net_remote_dns(&self, name: &str) -> Option<SocketAddr> {
        let state = self.state.borrow();
        let net = state.networks.get(name)?;
        net.remote_dns_v6.or(net.remote_dns_v4)
    }

    /// Set a network-wide neighbor default unless one is already present.
    pub fn net_default_if_unset(&self, name: &str, metric: L2NeighMetric, value: i64) {
        if let Some(net) = self.state.borrow_mut().networks.get_mut(name) {
            let slot = &mut net.defaults[metric as usize];
            if slot.is_none() {
                *slot = Some(value);
            }
        }
    }

    /// Network-wide neighbor default value.
    pub fn net_default(&self, name: &str, metric: L2NeighMetric) -> Option<i64> {
        self.state
            .borrow()
            .networks
            .get(name)
            .and_then(|n| n.defaults[metric as usize])
    }

    /// Add a neighbor and fire the neighbor-added event.
    ///
    /// Adding an existing MAC is a no-op (no event).
    pub fn neigh_add(&self, network: &str, mac: MacAddr) -> Result<(), ClassError> {
        let added = {
            let mut state = self.state.borrow_mut();
            let Some(net) = state.networks.get_mut(network) else {
                return Ok(());
            };
            if net.neighbors.contains_key(&mac) {
                false
            } else {
                let mut block = {
                    let mut classes = state.core.classes.borrow_mut();
                    classes.alloc(L2_CLASS_NEIGHBOR)?
                };
                write_mac(block.payload_mut(), 0, mac);
                state.networks.get_mut(network).expect("still there").neighbors.insert(
                    mac,
                    L2Neighbor {
                        block,
                        destinations: BTreeMap::new(),
                        addresses: BTreeMap::new(),
                    },
                );
                true
            }
        };
        if added {
            log::debug!("[L2] {}: neighbor {} added", network, mac);
            self.fire_neighbor(network, mac, ClassEvent::Added);
        }
        Ok(())
    }

    /// True when the neighbor exists.
    pub fn neigh_exists(&self, network: &str, mac: MacAddr) -> bool {
        self.state
            .borrow()
            .networks
            .get(network)
            .is_some_and(|n| n.neighbors.contains_key(&mac))
    }

    /// Write a neighbor metric. Does not fire an event by itself; call
    /// [`Layer2Db::neigh_commit`] once a batch of values is in place.
    pub fn neigh_set_metric(
        &self,
        network: &str,
        mac: MacAddr,
        metric: L2NeighMetric,
        value: i64,
    ) {
        let mut state = self.state.borrow_mut();
        if let Some(neigh) = state
            .networks
            .get_mut(network)
            .and_then(|n| n.neighbors.get_mut(&mac))
        {
            write_metric(neigh.block.payload_mut(), metric as usize, Some(value));
        }
    }

    /// Read a neighbor metric, falling back to the network default.
    pub fn neigh_metric(
        &self,
        network: &str,
        mac: MacAddr,
        metric: L2NeighMetric,
    ) -> Option<i64> {
        let state = self.state.borrow();
        let net = state.networks.get(network)?;
        match net.neighbors.get(&mac) {
            Some(neigh) => read_metric(neigh.block.payload(), metric as usize)
                .or(net.defaults[metric as usize]),
            None => net.defaults[metric as usize],
        }
    }

    /// Fire the neighbor-changed event after a batch of metric writes.
    pub fn neigh_commit(&self, network: &str, mac: MacAddr) {
        if self.neigh_exists(network, mac) {
            self.fire_neighbor(network, mac, ClassEvent::Changed);
        }
    }

    /// Remove a neighbor with its destinations and addresses, firing
    /// removal events for each record.
    pub fn neigh_remove(&self, network: &str, mac: MacAddr) -> Result<(), ClassError> {
        let Some(neigh) = ({
            let mut state = self.state.borrow_mut();
            state
                .networks
                .get_mut(network)
                .and_then(|n| n.neighbors.remove(&mac))
        }) else {
            return Ok(());
        };

        for (dest_mac, block) in neigh.destinations {
            self.fire_destination(network, dest_mac, mac, ClassEvent::Removed);
            self.free_block(L2_CLASS_DESTINATION, block)?;
        }
        for (ip, block) in neigh.addresses {
            self.fire_address(network, mac, ip, ClassEvent::Removed);
            self.free_block(L2_CLASS_NEIGHBOR_ADDRESS, block)?;
        }

        log::debug!("[L2] {}: neighbor {} removed", network, mac);
        self.fire_neighbor(network, mac, ClassEvent::Removed);
        self.free_block(L2_CLASS_NEIGHBOR, neigh.block)?;
        Ok(())
    }

    /// Add a proxied destination under a neighbor.
    pub fn dest_add(
        &self,
        network: &str,
        neighbor: MacAddr,
        destination: MacAddr,
    ) -> Result<(), ClassError> {
        let added = {
            let mut state = self.state.borrow_mut();
            let Some(neigh) = state
                .networks
                .get_mut(network)
                .and_then(|n| n.neighbors.get_mut(&neighbor))
            else {
                return Ok(());
            };
            if neigh.destinations.contains_key(&destination) {
                false
            } else {
                let mut block = state.core.classes.borrow_mut().alloc(L2_CLASS_DESTINATION)?;
                write_mac(block.payload_mut(), 0, destination);
                write_mac(block.payload_mut(), MAC_FIELD, neighbor);
                state
                    .networks
                    .get_mut(network)
                    .expect("still there")
                    .neighbors
                    .get_mut(&neighbor)
                    .expect("still there")
                    .destinations
                    .insert(destination, block);
                true
            }
        };
        if added {
            self.fire_destination(network, destination, neighbor, ClassEvent::Added);
        }
        Ok(())
    }

    /// Remove a proxied destination.
    pub fn dest_remove(
        &self,
        network: &str,
        neighbor: MacAddr,
        destination: MacAddr,
    ) -> Result<(), ClassError> {
        let block = {
            let mut state = self.state.borrow_mut();
            state
                .networks
                .get_mut(network)
                .and_then(|n| n.neighbors.get_mut(&neighbor))
                .and_then(|n| n.destinations.remove(&destination))
        };
        if let Some(block) = block {
            self.fire_destination(network, destination, neighbor, ClassEvent::Removed);
            self.free_block(L2_CLASS_DESTINATION, block)?;
        }
        Ok(())
    }

    /// Add an IP address under a neighbor.
    pub fn addr_add(&self, network: &str, neighbor: MacAddr, ip: IpAddr) -> Result<(), ClassError> {
        let added = {
            let mut state = self.state.borrow_mut();
            let Some(neigh) = state
                .networks
                .get_mut(network)
                .and_then(|n| n.neighbors.get_mut(&neighbor))
            else {
                return Ok(());
            };
            if neigh.addresses.contains_key(&ip) {
                false
            } else {
                let mut block = state
                    .core
                    .classes
                    .borrow_mut()
                    .alloc(L2_CLASS_NEIGHBOR_ADDRESS)?;
                write_ip(block.payload_mut(), ip);
                state
                    .networks
                    .get_mut(network)
                    .expect("still there")
                    .neighbors
                    .get_mut(&neighbor)
                    .expect("still there")
                    .addresses
                    .insert(ip, block);
                true
            }
        };
        if added {
            log::debug!("[L2] {}: neighbor {} address {} added", network, neighbor, ip);
            self.fire_address(network, neighbor, ip, ClassEvent::Added);
        }
        Ok(())
    }

    /// Remove an IP address from a neighbor.
    pub fn addr_remove(
        &self,
        network: &str,
        neighbor: MacAddr,
        ip: IpAddr,
    ) -> Result<(), ClassError> {
        let block = {
            let mut state = self.state.borrow_mut();
            state
                .networks
                .get_mut(network)
                .and_then(|n| n.neighbors.get_mut(&neighbor))
                .and_then(|n| n.addresses.remove(&ip))
        };
        if let Some(block) = block {
            self.fire_address(network, neighbor, ip, ClassEvent::Removed);
            self.free_block(L2_CLASS_NEIGHBOR_ADDRESS, block)?;
        }
        Ok(())
    }

    /// Neighbors of a network.
    pub fn neighbors(&self, network: &str) -> Vec<MacAddr> {
        self.state
            .borrow()
            .networks
            .get(network)
            .map(|n| n.neighbors.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Proxied destinations of one neighbor.
    pub fn destinations(&self, network: &str, neighbor: MacAddr) -> Vec<MacAddr> {
        self.state
            .borrow()
            .networks
            .get(network)
            .and_then(|n| n.neighbors.get(&neighbor))
            .map(|n| n.destinations.keys().copied().collect())
            .unwrap_or_default()
    }

    /// IP addresses of one neighbor.
    pub fn addresses(&self, network: &str, neighbor: MacAddr) -> Vec<IpAddr> {
        self.state
            .borrow()
            .networks
            .get(network)
            .and_then(|n| n.neighbors.get(&neighbor))
            .map(|n| n.addresses.keys().copied().collect())
            .unwrap_or_default()
    }

    fn fire_neighbor(&self, network: &str, mac: MacAddr, event: ClassEvent) {
        let classes = self.state.borrow().core.classes.clone();
        let subject = L2NeighborEvent {
            network: network.to_string(),
            mac,
        };
        fire_event(&classes, L2_CLASS_NEIGHBOR, &subject, event);
    }

    fn fire_destination(
        &self,
        network: &str,
        destination: MacAddr,
        neighbor: MacAddr,
        event: ClassEvent,
    ) {
        let classes = self.state.borrow().core.classes.clone();
        let subject = L2DestinationEvent {
            network: network.to_string(),
            destination,
            neighbor,
        };
        fire_event(&classes, L2_CLASS_DESTINATION, &subject, event);
    }

    fn fire_address(&self, network: &str, neighbor: MacAddr, ip: IpAddr, event: ClassEvent) {
        let classes = self.state.borrow().core.classes.clone();
        let subject = L2NeighborAddressEvent {
            network: network.to_string(),
            neighbor,
            ip,
        };
        fire_event(&classes, L2_CLASS_NEIGHBOR_ADDRESS, &subject, event);
    }

    fn free_block(&self, class: &str, block: ClassBlock) -> Result<(), ClassError> {
        let classes = self.state.borrow().core.classes.clone();
        let result = classes.borrow_mut().free(class, block);
        result
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::ClassObserver;
    use crate::runtime::ExtensionSpec;
    use std::any::Any;

    fn db() -> (Core, Layer2Db) {
        let core = Core::new(false).unwrap();
        let db = Layer2Db::new(core.clone()).unwrap();
        (core, db)
    }

    fn mac(last: u8) -> MacAddr {
        MacAddr::eui48([0x02, 0, 0, 0, 0, last])
    }

    #[test]
    fn test_mac_display() {
        assert_eq!(mac(1).to_string(), "02:00:00:00:00:01");
        assert_eq!(MacAddr::eui64([1, 2, 3, 4, 5, 6, 7, 8]).len(), 8);
    }

    #[test]
    fn test_mac_from_slice_rejects_odd_lengths() {
        assert!(MacAddr::from_slice(&[1, 2, 3]).is_none());
        assert!(MacAddr::from_slice(&[0; 6]).is_some());
        assert!(MacAddr::from_slice(&[0; 8]).is_some());
    }

    #[test]
    fn test_neighbor_metrics_round_trip() {
        let (_core, db) = db();
        db.net_add("wlan0");
        db.neigh_add("wlan0", mac(1)).unwrap();

        db.neigh_set_metric("wlan0", mac(1), L2NeighMetric::TxMaxBitrate, 54_000_000);
        assert_eq!(
            db.neigh_metric("wlan0", mac(1), L2NeighMetric::TxMaxBitrate),
            Some(54_000_000)
        );
        assert_eq!(db.neigh_metric("wlan0", mac(1), L2NeighMetric::Latency), None);

        // unset metrics fall back to the network default
        db.net_default_if_unset("wlan0", L2NeighMetric::Latency, 1_000_000);
        assert_eq!(
            db.neigh_metric("wlan0", mac(1), L2NeighMetric::Latency),
            Some(1_000_000)
        );
    }

    #[test]
    fn test_default_if_unset_keeps_existing() {
        let (_core, db) = db();
        db.net_add("eth0");
        db.net_default_if_unset("eth0", L2NeighMetric::RxBitrate, 100);
        db.net_default_if_unset("eth0", L2NeighMetric::RxBitrate, 999);
        assert_eq!(db.net_default("eth0", L2NeighMetric::RxBitrate), Some(100));
    }

    struct Counter {
        added: std::cell::Cell<u32>,
        removed: std::cell::Cell<u32>,
    }

    impl ClassObserver for Counter {
        fn on_added(&self, subject: &dyn Any) {
            assert!(subject.downcast_ref::<L2NeighborEvent>().is_some());
            self.added.set(self.added.get() + 1);
        }
        fn on_removed(&self, _subject: &dyn Any) {
            self.removed.set(self.removed.get() + 1);
        }
    }

    #[test]
    fn test_neighbor_events_fire() {
        let (core, db) = db();
        let counter = Rc::new(Counter {
            added: std::cell::Cell::new(0),
            removed: std::cell::Cell::new(0),
        });
        core.classes
            .borrow_mut()
            .extension_register(ExtensionSpec {
                ext_name: "counter",
                class_name: L2_CLASS_NEIGHBOR,
                size: 0,
                observer: Some(counter.clone()),
            })
            .unwrap();

        db.net_add("wlan0");
        db.neigh_add("wlan0", mac(1)).unwrap();
        db.neigh_add("wlan0", mac(1)).unwrap(); // duplicate, no event
        db.neigh_remove("wlan0", mac(1)).unwrap();

        assert_eq!(counter.added.get(), 1);
        assert_eq!(counter.removed.get(), 1);
    }

    #[test]
    fn test_destinations_and_addresses_follow_neighbor() {
        let (core, db) = db();
        db.net_add("wlan0");
        db.neigh_add("wlan0", mac(1)).unwrap();
        db.dest_add("wlan0", mac(1), mac(9)).unwrap();
        db.addr_add("wlan0", mac(1), "10.0.0.5".parse().unwrap())
            .unwrap();

        assert_eq!(db.destinations("wlan0", mac(1)), vec![mac(9)]);
        assert_eq!(db.addresses("wlan0", mac(1)).len(), 1);

        db.neigh_remove("wlan0", mac(1)).unwrap();
        assert!(db.neighbors("wlan0").is_empty());

        // every record went back to its class
        let stats = core.classes.borrow().stats(L2_CLASS_DESTINATION).unwrap();
        assert_eq!(stats.in_use, 0);
        let stats = core.classes.borrow().stats(L2_CLASS_NEIGHBOR).unwrap();
        assert_eq!(stats.in_use, 0);
    }

    #[test]
    fn test_remote_dns_prefers_v6() {
        let (_core, db) = db();
        db.net_add("wlan0");
        let v4: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();

        db.net_set_remote_dns("wlan0", Some(v4), None);
        assert_eq!(db.net_remote_dns("wlan0"), Some(v4));
        db.net_set_remote_dns("wlan0", Some(v4), Some(v6));
        assert_eq!(db.net_remote_dns("wlan0"), Some(v6));
    }
}
