// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket registrar: readiness-driven callbacks on file descriptors.
//!
//! Wraps `mio::Poll` behind the registrar contract the subsystems consume:
//! register a raw fd with a hook, then toggle read/write interest as the
//! protocol state machine requires. A descriptor with no interest is
//! deregistered from the poll set until an interest returns.
//!
//! All descriptors registered here must be non-blocking; hooks run to
//! completion on the event thread and must not block.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::config::LOOP_MAX_EVENTS;

/// Identifier of a registered socket entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(usize);

/// Readiness notification delivered to a socket hook.
#[derive(Debug, Clone, Copy)]
pub struct SocketEvent {
    pub id: SocketId,
    pub readable: bool,
    pub writable: bool,
}

/// Hook invoked on readiness.
pub type SocketHook = Rc<dyn Fn(SocketEvent)>;

struct SocketEntry {
    name: String,
    fd: RawFd,
    read: bool,
    write: bool,
    registered: bool,
    hook: SocketHook,
}

impl SocketEntry {
    fn interest(&self) -> Option<Interest> {
        match (self.read, self.write) {
            (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Poll-backed registrar of readiness callbacks.
pub struct Poller {
    poll: Poll,
    events: Events,
    entries: HashMap<usize, SocketEntry>,
    next_token: usize,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(LOOP_MAX_EVENTS),
            entries: HashMap::new(),
            next_token: 1,
        })
    }

    /// Register a non-blocking descriptor. Interest starts fully disabled.
    pub fn register(&mut self, fd: RawFd, name: &str, hook: SocketHook) -> SocketId {
        let token = self.next_token;
        self.next_token += 1;
        self.entries.insert(
            token,
            SocketEntry {
                name: name.to_string(),
                fd,
                read: false,
                write: false,
                registered: false,
                hook,
            },
        );
        log::debug!("[SOCK] registered '{}' fd={}", name, fd);
        SocketId(token)
    }

    /// Drop a descriptor from the registrar. The fd itself stays open;
    /// closing it is the owner's business.
    pub fn unregister(&mut self, id: SocketId) -> io::Result<()> {
        if let Some(entry) = self.entries.remove(&id.0) {
            if entry.registered {
                self.poll.registry().deregister(&mut SourceFd(&entry.fd))?;
            }
            log::debug!("[SOCK] unregistered '{}' fd={}", entry.name, entry.fd);
        }
        Ok(())
    }

    /// Toggle read interest.
    pub fn set_read(&mut self, id: SocketId, on: bool) -> io::Result<()> {
        self.set_interest(id, Some(on), None)
    }

    /// Toggle write interest.
    pub fn set_write(&mut self, id: SocketId, on: bool) -> io::Result<()> {
        self.set_interest(id, None, Some(on))
    }

    /// Current write interest, for state re-evaluation by owners.
    pub fn is_write(&self, id: SocketId) -> bool {
        self.entries.get(&id.0).is_some_and(|e| e.write)
    }

    /// Current read interest.
    pub fn is_read(&self, id: SocketId) -> bool {
        self.entries.get(&id.0).is_some_and(|e| e.read)
    }

    fn set_interest(
        &mut self,
        id: SocketId,
        read: Option<bool>,
        write: Option<bool>,
    ) -> io::Result<()> {
        let Some(entry) = self.entries.get_mut(&id.0) else {
            return Ok(());
        };
        if let Some(read) = read {
            entry.read = read;
        }
        if let Some(write) = write {
            entry.write = write;
        }

        let registry = self.poll.registry();
        match (entry.interest(), entry.registered) {
            (Some(interest), true) => {
                registry.reregister(&mut SourceFd(&entry.fd), Token(id.0), interest)?;
            }
            (Some(interest), false) => {
                registry.register(&mut SourceFd(&entry.fd), Token(id.0), interest)?;
                entry.registered = true;
            }
            (None, true) => {
                registry.deregister(&mut SourceFd(&entry.fd))?;
                entry.registered = false;
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Wait for readiness and collect `(event, hook)` pairs for dispatch.
    ///
    /// The hooks are cloned out so the caller invokes them without holding
    /// the registrar borrow; hooks may re-enter the registrar freely.
    pub fn poll(
        &mut self,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<(SocketEvent, SocketHook)>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(err) => return Err(err),
        }

        let mut out = Vec::new();
        for event in &self.events {
            let token = event.token().0;
            if let Some(entry) = self.entries.get(&token) {
                out.push((
                    SocketEvent {
                        id: SocketId(token),
                        readable: event.is_readable(),
                        writable: event.is_writable(),
                    },
                    entry.hook.clone(),
                ));
            }
        }
        Ok(out)
    }
}

// ============================================================================
// Tests
// ============================================================================
