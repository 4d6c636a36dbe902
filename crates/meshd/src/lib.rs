// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # meshd - reactive core of a mesh routing daemon
//!
//! A single-threaded cooperative event runtime with the three engines a
//! radio-side mesh node needs:
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Event loop (poll)                           |
//! |   socket registrar | timer service | deferred callbacks | classes  |
//! +--------------------------------------------------------------------+
//! |  Netlink multiplexer  |  DLEP radio engine  |  DNS-SD resolver     |
//! |  seq correlation,     |  TLV sessions,      |  PTR/SRV pipeline,   |
//! |  dumps, multicast     |  destination acks   |  one query slot      |
//! +--------------------------------------------------------------------+
//! |            Layer-2 database (class-allocated records)              |
//! +--------------------------------------------------------------------+
//! ```
//!
//! Everything runs on one thread; state is shared through
//! [`runtime::Core`] and `Rc<RefCell<_>>` handles, and subsystems talk
//! through the object-class event hooks instead of referencing each
//! other directly.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use meshd::dlep::{DlepRadio, RadioCfg, RadioTransport};
//! use meshd::layer2::Layer2Db;
//! use meshd::runtime::{event_loop, Core};
//!
//! fn main() -> std::io::Result<()> {
//!     let core = Core::new(false)?;
//!     let l2 = Layer2Db::new(core.clone()).expect("class registration");
//!     l2.net_add("wlan0");
//!
//!     let radio = DlepRadio::new(core.clone(), l2.clone(), RadioCfg::default());
//!     radio.register_observers().expect("observer registration");
//!     let _transport = RadioTransport::new(
//!         core.clone(),
//!         radio,
//!         "wlan0",
//!         "0.0.0.0:854".parse().unwrap(),
//!         Some("0.0.0.0:854".parse().unwrap()),
//!     )?;
//!
//!     loop {
//!         event_loop::run_once(&core)?;
//!     }
//! }
//! ```

pub mod config;
pub mod dlep;
pub mod dns;
pub mod iface;
pub mod layer2;
pub mod logging;
pub mod netlink;
pub mod runtime;

pub use config::Config;
pub use runtime::Core;
