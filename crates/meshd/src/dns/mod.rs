// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Unicast DNS client and service discovery.

pub mod packet;
pub mod query;
pub mod sd;

pub use packet::{
    build_query, parse_response, DnsError, DnsResponse, QType, RecordData, ResourceRecord,
};
pub use query::{DnsQuery, DnsResponseSink};
pub use sd::{reverse_name, ContextInfo, DnsSd, PrefixStatus, ServiceInfo, MAX_PREFIXES};
