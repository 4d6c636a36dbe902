// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reactive event runtime.
//!
//! The runtime is single-threaded and cooperative: one logical event loop
//! owns all state, callbacks run to completion, and there is no locking
//! because there is no preemption. [`Core`] is the runtime handle carrying
//! the shared services; it is passed explicitly instead of living in
//! file-scope singletons.

pub mod callback;
pub mod class;
pub mod event_loop;
pub mod socket;
pub mod timer;

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

pub use callback::CallbackQueue;
pub use class::{
    ClassBlock, ClassError, ClassEvent, ClassObserver, ClassRegistry, ClassSpec, Extension,
    ExtensionSpec,
};
pub use socket::{Poller, SocketEvent, SocketHook, SocketId};
pub use timer::{TimerHook, TimerId, TimerService};

/// Shared single-threaded handle.
pub type Shared<T> = Rc<RefCell<T>>;

/// Runtime handle bundling the shared services.
///
/// Cloning is cheap (reference-counted); every subsystem receives a clone
/// at construction time.
#[derive(Clone)]
pub struct Core {
    /// Timer service.
    pub timers: Shared<TimerService>,
    /// Deferred-callback queue, drained once per loop turn.
    pub callbacks: Shared<CallbackQueue>,
    /// Object-class registry.
    pub classes: Shared<ClassRegistry>,
    /// Socket registrar.
    pub poller: Shared<Poller>,
}

impl Core {
    /// Create a fresh runtime. `class_debug` enables allocation guards
    /// (configuration key `class.debug`).
    pub fn new(class_debug: bool) -> io::Result<Self> {
        Ok(Self {
            timers: Rc::new(RefCell::new(TimerService::new())),
            callbacks: Rc::new(RefCell::new(CallbackQueue::new())),
            classes: Rc::new(RefCell::new(ClassRegistry::new(class_debug))),
            poller: Rc::new(RefCell::new(Poller::new()?)),
        })
    }

    /// Re-apply the runtime-relevant configuration keys.
    ///
    /// `class.debug` only switches classes that have never allocated.
    pub fn apply_config(&self, config: &crate::config::Config) {
        self.classes.borrow_mut().apply_debug(config.class_debug);
    }
}
