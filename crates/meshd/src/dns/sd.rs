// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DNS service discovery over unicast DNS.
//!
//! For every discovered layer-2 neighbor address the resolver runs a
//! serial query pipeline: a reverse-PTR lookup resolves the address to a
//! hostname, then one SRV query per registered service prefix probes
//! `prefix || hostname`, harvesting any A/AAAA records riding in the same
//! response. At most one DNS query is outstanding process-wide; contexts
//! wait in a FIFO working queue.
//!
//! Each prefix owns a one-hot bit in a 64-bit word; a context caches
//! which prefixes answered (`available`) and which did not
//! (`unavailable`), and the two masks stay disjoint.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::config::Config;
use crate::iface::OsInterfaceTable;
use crate::layer2::{L2NeighborAddressEvent, Layer2Db, L2_CLASS_NEIGHBOR_ADDRESS};
use crate::runtime::class::ClassObserver;
use crate::runtime::{ClassError, Core, ExtensionSpec};

use super::packet::QType;
use super::query::{DnsQuery, DnsResponseSink};

/// Capacity of the prefix flag word.
pub const MAX_PREFIXES: usize = 64;

/// Availability of one prefix within a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixStatus {
    Unknown,
    Available,
    Unavailable,
}

/// Context key: the (interface, neighbor IP) scope of cached results.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContextKey {
    pub interface: String,
    pub ip: IpAddr,
}

/// Service key inside a context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServiceKey {
    pub hostname: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Default)]
struct SdService {
    port: u16,
    weight: u16,
    priority: u16,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
}

struct SdContext {
    hostname: Option<String>,
    available: u64,
    unavailable: u64,
    services: BTreeMap<ServiceKey, SdService>,
    queued: bool,
}

struct SdPrefix {
    flag: u64,
    usage: u32,
}

/// Scratch for the SRV query in flight: addresses harvested before the
/// SRV record arrives attach to the service afterwards.
#[derive(Default)]
struct SrvScratch {
    service: Option<ServiceKey>,
    ipv4: Option<Ipv4Addr>,
    ipv6: Option<Ipv6Addr>,
}

struct PendingQuery {
    key: ContextKey,
    prefix: Option<String>,
    srv: SrvScratch,
}

struct SdState {
    core: Core,
    l2: Layer2Db,
    ifaces: Rc<RefCell<OsInterfaceTable>>,
    prefixes: BTreeMap<String, SdPrefix>,
    used_flags: u64,
    contexts: BTreeMap<ContextKey, SdContext>,
    queue: VecDeque<ContextKey>,
    query: Option<DnsQuery>,
    pending: Option<PendingQuery>,
}

/// Handle to the resolver.
#[derive(Clone)]
pub struct DnsSd {
    state: Rc<RefCell<SdState>>,
}

/// Context snapshot for the admin surface.
#[derive(Debug, Clone)]
pub struct ContextInfo {
    pub interface: String,
    pub ip: IpAddr,
    pub hostname: Option<String>,
    pub available: u64,
    pub unavailable: u64,
}

/// Service snapshot for the admin surface.
#[derive(Debug, Clone)]
pub struct ServiceInfo {
    pub interface: String,
    pub ip: IpAddr,
    pub hostname: String,
    pub prefix: String,
    pub port: u16,
    pub weight: u16,
    pub priority: u16,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
}

impl DnsSd {
    /// Create the resolver and its single-slot query driver.
    pub fn new(
        core: Core,
        l2: Layer2Db,
        ifaces: Rc<RefCell<OsInterfaceTable>>,
        timeout: Duration,
    ) -> Self {
        let sd = Self {
            state: Rc::new(RefCell::new(SdState {
                core: core.clone(),
                l2,
                ifaces,
                prefixes: BTreeMap::new(),
                used_flags: 0,
                contexts: BTreeMap::new(),
                queue: VecDeque::new(),
                query: None,
                pending: None,
            })),
        };
        let sink = Rc::new(SdSink {
            sd: Rc::downgrade(&sd.state),
        });
        let query = DnsQuery::new(core, sink, timeout);
        sd.state.borrow_mut().query = Some(query);
        sd
    }

    /// Subscribe to new layer-2 neighbor addresses.
    pub fn register_observer(&self) -> Result<(), ClassError> {
        let classes = self.state.borrow().core.classes.clone();
        let result = classes
            .borrow_mut()
            .extension_register(ExtensionSpec {
                ext_name: "dns sd",
                class_name: L2_CLASS_NEIGHBOR_ADDRESS,
                size: 0,
                observer: Some(Rc::new(AddrListener {
                    sd: Rc::downgrade(&self.state),
                })),
            })
            .map(|_| ());
        result
    }

    /// Apply `dns_sd.prefix` and `dns_query.timeout` configuration.
    pub fn apply_config(&self, config: &Config) {
        if let Some(query) = self.state.borrow().query.clone() {
            query.set_timeout(config.dns_timeout);
        }
        for prefix in &config.sd_prefixes {
            self.prefix_add(prefix);
        }
    }

    /// Register a prefix (e.g. `_http._tcp.`), returning its flag bit.
    ///
    /// Re-registering bumps the usage count. `None` when all 64 flag bits
    /// are taken; callers treat that as fatal at startup only.
    pub fn prefix_add(&self, name: &str) -> Option<u64> {
        let mut state = self.state.borrow_mut();
        if let Some(prefix) = state.prefixes.get_mut(name) {
            prefix.usage += 1;
            return Some(prefix.flag);
        }
        if state.used_flags == u64::MAX {
            log::warn!("[DNS-SD] maximum number of active service discovery strings reached");
            return None;
        }
        let mut flag = 0;
        for bit in 0..MAX_PREFIXES {
            if state.used_flags & (1u64 << bit) == 0 {
                flag = 1u64 << bit;
                break;
            }
        }
        state.used_flags |= flag;
        state
            .prefixes
            .insert(name.to_string(), SdPrefix { flag, usage: 1 });
        log::debug!("[DNS-SD] prefix '{}' registered", name);
        Some(flag)
    }

    /// Drop one usage of a prefix; the last usage scrubs its results from
    /// every context and releases the flag bit.
    pub fn prefix_remove(&self, name: &str) {
        let mut state = self.state.borrow_mut();
        let Some(prefix) = state.prefixes.get_mut(name) else {
            return;
        };
        if prefix.usage > 1 {
            prefix.usage -= 1;
            return;
        }
        let flag = prefix.flag;
        state.prefixes.remove(name);
        state.used_flags &= !flag;

        // scrub every context and garbage-collect the emptied ones
        let mut empty = Vec::new();
        for (key, context) in &mut state.contexts {
            context.available &= !flag;
            context.unavailable &= !flag;
            context.services.retain(|k, _| k.prefix != name);
            if context.services.is_empty() && !context.queued {
                empty.push(key.clone());
            }
        }
        for key in empty {
            state.contexts.remove(&key);
        }
        log::debug!("[DNS-SD] prefix '{}' removed", name);
    }

    /// Queue a (interface, address) context for resolution; starts the
    /// pump when the queue was idle.
    pub fn enqueue(&self, interface: &str, ip: IpAddr) {
        let start = {
            let mut state = self.state.borrow_mut();
            let key = ContextKey {
                interface: interface.to_string(),
                ip,
            };
            let context = state.contexts.entry(key.clone()).or_insert_with(|| SdContext {
                hostname: None,
                available: 0,
                unavailable: 0,
                services: BTreeMap::new(),
                queued: false,
            });
            if context.queued {
                return;
            }
            context.queued = true;
            let was_idle = state.queue.is_empty();
            state.queue.push_back(key);
            was_idle
        };
        if start {
            self.pump();
        }
    }

    /// Availability of a prefix within a context.
    pub fn prefix_status(&self, interface: &str, ip: IpAddr, prefix: &str) -> PrefixStatus {
        let state = self.state.borrow();
        let key = ContextKey {
            interface: interface.to_string(),
            ip,
        };
        let (Some(context), Some(prefix)) =
            (state.contexts.get(&key), state.prefixes.get(prefix))
        else {
            return PrefixStatus::Unknown;
        };
        if context.available & prefix.flag != 0 {
            return PrefixStatus::Available;
        }
        if context.unavailable & prefix.flag != 0 {
            return PrefixStatus::Unavailable;
        }
        PrefixStatus::Unknown
    }

    /// Registered prefixes, for the admin surface.
    pub fn prefixes(&self) -> Vec<String> {
        self.state.borrow().prefixes.keys().cloned().collect()
    }

    /// Context snapshots, for the admin surface.
    pub fn contexts(&self) -> Vec<ContextInfo> {
        self.state
            .borrow()
            .contexts
            .iter()
            .map(|(key, c)| ContextInfo {
                interface: key.interface.clone(),
                ip: key.ip,
                hostname: c.hostname.clone(),
                available: c.available,
                unavailable: c.unavailable,
            })
            .collect()
    }

    /// Service snapshots, for the admin surface.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.state
            .borrow()
            .contexts
            .iter()
            .flat_map(|(key, c)| {
                c.services.iter().map(move |(sk, s)| ServiceInfo {
                    interface: key.interface.clone(),
                    ip: key.ip,
                    hostname: sk.hostname.clone(),
                    prefix: sk.prefix.clone(),
                    port: s.port,
                    weight: s.weight,
                    priority: s.priority,
                    ipv4: s.ipv4,
                    ipv6: s.ipv6,
                })
            })
            .collect()
    }

    /// True while a query is in flight or contexts wait in the queue.
    pub fn busy(&self) -> bool {
        let state = self.state.borrow();
        state.pending.is_some() || !state.queue.is_empty()
    }

    /// Work through the queue until a query is in flight or it is empty.
    fn pump(&self) {
        loop {
            let work = {
                let mut guard = self.state.borrow_mut();
                let state = &mut *guard;
                next_work(state)
            };
            let Some(work) = work else {
                return;
            };

            let query = self.state.borrow().query.clone().expect("created in new");
            let started = query.start(&work.qname, work.qtype, work.server, work.source);
            match started {
                Ok(()) => {
                    self.state.borrow_mut().pending = Some(PendingQuery {
                        key: work.key,
                        prefix: work.prefix,
                        srv: SrvScratch::default(),
                    });
                    return;
                }
                Err(err) => {
                    log::warn!("[DNS-SD] cannot start query '{}': {}", work.qname, err);
                    let mut guard = self.state.borrow_mut();
                    let state = &mut *guard;
                    pop_context(state, &work.key);
                }
            }
        }
    }

    fn on_query_done(&self, qtype: QType, timeout: bool) {
        {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let Some(pending) = state.pending.take() else {
                return;
            };

            if timeout {
                // do not retry immediately
                pop_context(state, &pending.key);
            } else if qtype == QType::Ptr {
                let unresolved = state
                    .contexts
                    .get(&pending.key)
                    .is_some_and(|c| c.hostname.is_none());
                if unresolved {
                    pop_context(state, &pending.key);
                }
            } else if qtype == QType::Srv && pending.srv.service.is_none() {
                // no service behind this prefix
                if let (Some(context), Some(prefix_name)) =
                    (state.contexts.get_mut(&pending.key), &pending.prefix)
                {
                    if let Some(prefix) = state.prefixes.get(prefix_name) {
                        context.unavailable |= prefix.flag;
                    }
                }
            }
        }
        self.pump();
    }
}

struct Work {
    key: ContextKey,
    qname: String,
    qtype: QType,
    prefix: Option<String>,
    server: SocketAddr,
    source: Option<IpAddr>,
}

/// Select the next query for the queue front, popping contexts that have
/// no server, no source address or no work left.
fn next_work(state: &mut SdState) -> Option<Work> {
    loop {
        let key = state.queue.front()?.clone();

        let Some(server) = state.l2.net_remote_dns(&key.interface) else {
            log::warn!(
                "[DNS-SD] no DNS server available for l2 interface '{}'",
                key.interface
            );
            pop_context(state, &key);
            continue;
        };
        let server = with_scope(server, state, &key.interface);

        let Some(source) = state.ifaces.borrow().source_for(&key.interface, server.ip()) else {
            log::warn!(
                "[DNS-SD] no fitting IP address for DNS server on interface {}",
                key.interface
            );
            pop_context(state, &key);
            continue;
        };

        let context = state.contexts.get(&key).expect("queued context exists");
        match &context.hostname {
            None => {
                return Some(Work {
                    qname: reverse_name(key.ip),
                    qtype: QType::Ptr,
                    prefix: None,
                    server,
                    source: Some(source),
                    key,
                });
            }
            Some(hostname) => {
                let done = context.available | context.unavailable;
                let next = state
                    .prefixes
                    .iter()
                    .find(|(_, p)| done & p.flag == 0)
                    .map(|(name, _)| name.clone());
                match next {
                    Some(prefix) => {
                        let qname = format!("{}{}", prefix, hostname);
                        return Some(Work {
                            qname,
                            qtype: QType::Srv,
                            prefix: Some(prefix),
                            server,
                            source: Some(source),
                            key,
                        });
                    }
                    None => {
                        // every prefix resolved one way or the other
                        pop_context(state, &key);
                        continue;
                    }
                }
            }
        }
    }
}

/// IPv6 servers bound to an interface need the scope id filled in.
fn with_scope(server: SocketAddr, state: &SdState, interface: &str) -> SocketAddr {
    match server {
        SocketAddr::V6(mut v6) if v6.scope_id() == 0 => {
            let link_local = v6.ip().segments()[0] & 0xffc0 == 0xfe80;
            if link_local {
                let index = state
                    .l2
                    .net_if_index(interface)
                    .or_else(|| state.ifaces.borrow().index(interface))
                    .unwrap_or(0);
                v6.set_scope_id(index);
            }
            SocketAddr::V6(v6)
        }
        other => other,
    }
}

fn pop_context(state: &mut SdState, key: &ContextKey) {
    if let Some(context) = state.contexts.get_mut(key) {
        context.queued = false;
    }
    state.queue.retain(|k| k != key);
}

/// Reverse-DNS name of an address: dotted-quad `.in-addr.arpa` for IPv4,
/// nibble-reversed `.ip6.arpa` for IPv6.
pub fn reverse_name(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}.in-addr.arpa", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            const HEX: &[u8; 16] = b"0123456789abcdef";
            let mut name = String::with_capacity(72);
            for byte in v6.octets().iter().rev() {
                name.push(HEX[(byte & 0x0f) as usize] as char);
                name.push('.');
                name.push(HEX[(byte >> 4) as usize] as char);
                name.push('.');
            }
            name.push_str("ip6.arpa");
            name
        }
    }
}

/// Result sink bridging the query driver back into the resolver.
struct SdSink {
    sd: Weak<RefCell<SdState>>,
}

impl SdSink {
    fn with_state<R>(&self, f: impl FnOnce(&mut SdState) -> R) -> Option<R> {
        let state = self.sd.upgrade()?;
        let mut guard = state.borrow_mut();
        Some(f(&mut guard))
    }
}

impl DnsResponseSink for SdSink {
    fn on_a(&self, qtype: QType, addr: Ipv4Addr) {
        if qtype != QType::Srv {
            return;
        }
        self.with_state(|state| {
            let Some(pending) = &mut state.pending else {
                return;
            };
            match &pending.srv.service {
                Some(service_key) => {
                    if let Some(service) = state
                        .contexts
                        .get_mut(&pending.key)
                        .and_then(|c| c.services.get_mut(service_key))
                    {
                        service.ipv4 = Some(addr);
                    }
                }
                None => pending.srv.ipv4 = Some(addr),
            }
        });
    }

    fn on_aaaa(&self, qtype: QType, addr: Ipv6Addr) {
        if qtype != QType::Srv {
            return;
        }
        self.with_state(|state| {
            let Some(pending) = &mut state.pending else {
                return;
            };
            match &pending.srv.service {
                Some(service_key) => {
                    if let Some(service) = state
                        .contexts
                        .get_mut(&pending.key)
                        .and_then(|c| c.services.get_mut(service_key))
                    {
                        service.ipv6 = Some(addr);
                    }
                }
                None => pending.srv.ipv6 = Some(addr),
            }
        });
    }

    fn on_ptr(&self, _qtype: QType, host: &str) {
        self.with_state(|state| {
            let Some(pending) = &state.pending else {
                return;
            };
            if let Some(context) = state.contexts.get_mut(&pending.key) {
                if context.hostname.is_none() {
                    log::info!(
                        "[DNS-SD] {} resolves to '{}'",
                        pending.key.ip,
                        host
                    );
                    context.hostname = Some(host.to_string());
                }
            }
        });
    }

    fn on_srv(&self, _qtype: QType, priority: u16, weight: u16, port: u16, target: &str) {
        self.with_state(|state| {
            let Some(pending) = &mut state.pending else {
                return;
            };
            let Some(prefix_name) = pending.prefix.clone() else {
                return;
            };
            let Some(flag) = state.prefixes.get(&prefix_name).map(|p| p.flag) else {
                return;
            };
            let Some(context) = state.contexts.get_mut(&pending.key) else {
                return;
            };

            context.available |= flag;
            let service_key = ServiceKey {
                hostname: target.to_string(),
                prefix: prefix_name,
            };
            let service = context.services.entry(service_key.clone()).or_default();
            service.port = port;
            service.weight = weight;
            service.priority = priority;
            if let Some(addr) = pending.srv.ipv4 {
                service.ipv4 = Some(addr);
            }
            if let Some(addr) = pending.srv.ipv6 {
                service.ipv6 = Some(addr);
            }
            log::info!(
                "[DNS-SD] SRV result for {}: {}:{} w={} p={}",
                pending.key.ip,
                service_key.hostname,
                port,
                weight,
                priority
            );
            pending.srv.service = Some(service_key);
        });
    }

    fn on_done(&self, qtype: QType, timeout: bool) {
        if let Some(state) = self.sd.upgrade() {
            DnsSd { state }.on_query_done(qtype, timeout);
        }
    }
}

/// Layer-2 address observer feeding the working queue.
struct AddrListener {
    sd: Weak<RefCell<SdState>>,
}

impl ClassObserver for AddrListener {
    fn on_added(&self, subject: &dyn Any) {
        let Some(event) = subject.downcast_ref::<L2NeighborAddressEvent>() else {
            return;
        };
        let usable = match event.ip {
            IpAddr::V4(v4) => !v4.is_unspecified() && !v4.is_multicast(),
            IpAddr::V6(v6) => !v6.is_unspecified() && !v6.is_multicast(),
        };
        if !usable {
            return;
        }
        if let Some(state) = self.sd.upgrade() {
            DnsSd { state }.enqueue(&event.network, event.ip);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::event_loop;
    use byteorder::{BigEndian, ByteOrder};
    use std::net::UdpSocket;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_reverse_names() {
        assert_eq!(
            reverse_name("10.0.0.1".parse().unwrap()),
            "1.0.0.10.in-addr.arpa"
        );
        let v6 = reverse_name("2001:db8::567:89ab".parse().unwrap());
        assert!(v6.starts_with("b.a.9.8.7.6.5.0."));
        assert!(v6.ends_with("8.b.d.0.1.0.0.2.ip6.arpa"));
        assert_eq!(v6.len(), 32 * 2 + "ip6.arpa".len());
    }

    #[test]
    fn test_prefix_flags_exhaust_at_64() {
        let core = Core::new(false).unwrap();
        let l2 = Layer2Db::new(core.clone()).unwrap();
        let ifaces = Rc::new(RefCell::new(OsInterfaceTable::new()));
        let sd = DnsSd::new(core, l2, ifaces, Duration::from_secs(1));

        let mut flags = 0u64;
        for i in 0..MAX_PREFIXES {
            let flag = sd.prefix_add(&format!("_svc{}._tcp.", i)).unwrap();
            assert_eq!(flag.count_ones(), 1);
            assert_eq!(flags & flag, 0);
            flags |= flag;
        }
        assert_eq!(flags, u64::MAX);
        assert!(sd.prefix_add("_one-too-many._tcp.").is_none());

        // re-registering an existing prefix still works (usage count)
        assert!(sd.prefix_add("_svc0._tcp.").is_some());
    }

    #[test]
    fn test_prefix_remove_scrubs_contexts() {
        let core = Core::new(false).unwrap();
        let l2 = Layer2Db::new(core.clone()).unwrap();
        let ifaces = Rc::new(RefCell::new(OsInterfaceTable::new()));
        let sd = DnsSd::new(core, l2, ifaces, Duration::from_secs(1));

        let flag = sd.prefix_add("_http._tcp.").unwrap();

        // hand-craft a resolved context
        {
            let mut state = sd.state.borrow_mut();
            let key = ContextKey {
                interface: "eth0".to_string(),
                ip: "10.0.0.1".parse().unwrap(),
            };
            let mut services = BTreeMap::new();
            services.insert(
                ServiceKey {
                    hostname: "node1.local.".to_string(),
                    prefix: "_http._tcp.".to_string(),
                },
                SdService {
                    port: 80,
                    ..SdService::default()
                },
            );
            state.contexts.insert(
                key,
                SdContext {
                    hostname: Some("node1.local.".to_string()),
                    available: flag,
                    unavailable: 0,
                    services,
                    queued: false,
                },
            );
        }
        assert_eq!(sd.services().len(), 1);

        sd.prefix_remove("_http._tcp.");
        assert!(sd.services().is_empty());
        // emptied context was garbage-collected
        assert!(sd.contexts().is_empty());
        // the flag is free again
        assert_eq!(sd.prefix_add("_other._udp.").unwrap(), flag);
    }

    // ------------------------------------------------------------------
    // fake DNS server for the pipeline test
    // ------------------------------------------------------------------

    fn read_query_name(packet: &[u8]) -> (String, u16) {
        let mut pos = 12;
        let mut name = String::new();
        loop {
            let len = packet[pos] as usize;
            pos += 1;
            if len == 0 {
                break;
            }
            name.push_str(std::str::from_utf8(&packet[pos..pos + len]).unwrap());
            name.push('.');
            pos += len;
        }
        (name, BigEndian::read_u16(&packet[pos..]))
    }

    fn encode_name(out: &mut Vec<u8>, name: &str) {
        for label in name.split('.').filter(|l| !l.is_empty()) {
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
        out.push(0);
    }

    fn reply_header(id: u16, rcode: u8, an: u16, ar: u16) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&id.to_be_bytes());
        p.extend_from_slice(&[0x81, 0x80 | rcode]);
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(&an.to_be_bytes());
        p.extend_from_slice(&[0, 0]);
        p.extend_from_slice(&ar.to_be_bytes());
        p
    }

    fn ptr_answer(id: u16, host: &str) -> Vec<u8> {
        let mut p = reply_header(id, 0, 1, 0);
        p.push(0);
        p.extend_from_slice(&(QType::Ptr as u16).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&60u32.to_be_bytes());
        let mut name = Vec::new();
        encode_name(&mut name, host);
        p.extend_from_slice(&(name.len() as u16).to_be_bytes());
        p.extend_from_slice(&name);
        p
    }

    fn srv_answer(id: u16, target: &str, port: u16, a: Ipv4Addr) -> Vec<u8> {
        let mut p = reply_header(id, 0, 1, 1);
        // SRV answer
        p.push(0);
        p.extend_from_slice(&(QType::Srv as u16).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&60u32.to_be_bytes());
        let mut target_name = Vec::new();
        encode_name(&mut target_name, target);
        p.extend_from_slice(&((6 + target_name.len()) as u16).to_be_bytes());
        p.extend_from_slice(&10u16.to_be_bytes());
        p.extend_from_slice(&20u16.to_be_bytes());
        p.extend_from_slice(&port.to_be_bytes());
        p.extend_from_slice(&target_name);
        // harvested A record in the additional section
        encode_name(&mut p, target);
        p.extend_from_slice(&(QType::A as u16).to_be_bytes());
        p.extend_from_slice(&1u16.to_be_bytes());
        p.extend_from_slice(&60u32.to_be_bytes());
        p.extend_from_slice(&4u16.to_be_bytes());
        p.extend_from_slice(&a.octets());
        p
    }

    /// DNS server answering PTR for 10.0.0.1, SRV for _http, NXDOMAIN
    /// for everything else.
    fn pipeline_server(stop: Arc<AtomicBool>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let addr = socket.local_addr().unwrap();
        std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            while !stop.load(Ordering::Relaxed) {
                let Ok((len, peer)) = socket.recv_from(&mut buf) else {
                    continue;
                };
                let id = BigEndian::read_u16(&buf[0..2]);
                let (qname, qtype) = read_query_name(&buf[..len]);
                let reply = if qtype == QType::Ptr as u16 {
                    assert_eq!(qname, "1.0.0.10.in-addr.arpa.");
                    ptr_answer(id, "node1.local.")
                } else if qname == "_http._tcp.node1.local." {
                    srv_answer(id, "node1.local.", 80, "192.0.2.80".parse().unwrap())
                } else {
                    reply_header(id, 3, 0, 0) // NXDOMAIN
                };
                socket.send_to(&reply, peer).unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_discovery_pipeline_end_to_end() {
        let core = Core::new(false).unwrap();
        let l2 = Layer2Db::new(core.clone()).unwrap();
        let ifaces = Rc::new(RefCell::new(OsInterfaceTable::new()));
        let sd = DnsSd::new(core.clone(), l2.clone(), ifaces.clone(), Duration::from_secs(1));
        sd.register_observer().unwrap();

        sd.prefix_add("_http._tcp.").unwrap();
        sd.prefix_add("_ssh._tcp.").unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let server = pipeline_server(stop.clone());

        l2.net_add("eth0");
        l2.net_set_remote_dns("eth0", Some(server), None);
        ifaces
            .borrow_mut()
            .add_address("eth0", "127.0.0.1".parse().unwrap(), 8);

        // a discovered neighbor address kicks the pipeline off
        let neigh = crate::layer2::MacAddr::eui48([2, 0, 0, 0, 0, 1]);
        l2.neigh_add("eth0", neigh).unwrap();
        l2.addr_add("eth0", neigh, "10.0.0.1".parse().unwrap())
            .unwrap();

        event_loop::run_while(&core, Duration::from_secs(5), || sd.busy()).unwrap();
        stop.store(true, Ordering::Relaxed);

        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let contexts = sd.contexts();
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].hostname.as_deref(), Some("node1.local."));

        assert_eq!(
            sd.prefix_status("eth0", ip, "_http._tcp."),
            PrefixStatus::Available
        );
        assert_eq!(
            sd.prefix_status("eth0", ip, "_ssh._tcp."),
            PrefixStatus::Unavailable
        );

        let services = sd.services();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].hostname, "node1.local.");
        assert_eq!(services[0].prefix, "_http._tcp.");
        assert_eq!(services[0].port, 80);
        assert_eq!(services[0].ipv4, Some("192.0.2.80".parse().unwrap()));

        // masks stay disjoint
        assert_eq!(contexts[0].available & contexts[0].unavailable, 0);
    }

    #[test]
    fn test_context_without_server_is_dropped_from_queue() {
        let core = Core::new(false).unwrap();
        let l2 = Layer2Db::new(core.clone()).unwrap();
        let ifaces = Rc::new(RefCell::new(OsInterfaceTable::new()));
        let sd = DnsSd::new(core, l2.clone(), ifaces, Duration::from_secs(1));

        l2.net_add("eth0"); // no DNS server configured
        sd.enqueue("eth0", "10.0.0.9".parse().unwrap());

        assert!(!sd.busy());
        // the context itself survives for a later retry
        assert_eq!(sd.contexts().len(), 1);
    }
}
