// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Timer service for the cooperative event loop.
//!
//! Timer instances are registered once with a trigger hook and then armed,
//! rearmed or stopped any number of times from any callback. The service
//! clock only moves when the event loop calls [`TimerService::advance_to`],
//! which keeps expiry fully deterministic under test.
//!
//! Dispatch is collect-then-invoke: due entries are gathered and disarmed
//! under the service borrow, then their hooks run without any borrow held,
//! so a hook may freely arm, stop or remove timers. A generation counter
//! guards the cancellation race: if an earlier hook of the same batch stops
//! or rearms a collected timer, its pending invocation is suppressed.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Identifier of a registered timer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// Trigger hook invoked when a timer fires.
pub type TimerHook = Rc<dyn Fn(TimerId)>;

struct TimerEntry {
    name: &'static str,
    hook: TimerHook,
    deadline: Option<Instant>,
    period: Option<Duration>,
    generation: u64,
}

/// Registry of timer instances plus the service clock.
pub struct TimerService {
    now: Instant,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Current service clock.
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Move the service clock forward. Never moves backwards.
    pub fn advance_to(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    /// Move the service clock forward by a delta (test convenience).
    pub fn advance(&mut self, delta: Duration) {
        self.now += delta;
    }

    /// Register a timer instance. The timer starts disarmed.
    pub fn add(&mut self, name: &'static str, hook: TimerHook) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            TimerEntry {
                name,
                hook,
                deadline: None,
                period: None,
                generation: 0,
            },
        );
        TimerId(id)
    }

    /// Arm or rearm a one-shot timer relative to the service clock.
    pub fn set(&mut self, id: TimerId, after: Duration) {
        let now = self.now;
        if let Some(entry) = self.entries.get_mut(&id.0) {
            entry.deadline = Some(now + after);
            entry.period = None;
            entry.generation += 1;
        }
    }

    /// Arm a periodic timer; it rearms itself with `period` on every fire.
    pub fn set_periodic(&mut self, id: TimerId, period: Duration) {
        let now = self.now;
        if let Some(entry) = self.entries.get_mut(&id.0) {
            entry.deadline = Some(now + period);
            entry.period = Some(period);
            entry.generation += 1;
        }
    }

    /// Disarm a timer. The registration stays valid for later `set` calls.
    pub fn stop(&mut self, id: TimerId) {
        if let Some(entry) = self.entries.get_mut(&id.0) {
            entry.deadline = None;
            entry.period = None;
            entry.generation += 1;
        }
    }

    /// Drop a timer registration entirely.
    pub fn remove(&mut self, id: TimerId) {
        self.entries.remove(&id.0);
    }

    /// True while the timer is armed.
    pub fn is_running(&self, id: TimerId) -> bool {
        self.entries
            .get(&id.0)
            .is_some_and(|e| e.deadline.is_some())
    }

    /// Name of a registered timer, for diagnostics.
    pub fn name(&self, id: TimerId) -> Option<&'static str> {
        self.entries.get(&id.0).map(|e| e.name)
    }

    /// Earliest armed deadline, feeding the event-loop poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.deadline).min()
    }

    /// Collect every due entry, disarming one-shots and rearming periodic
    /// timers. Returns `(id, generation, hook)` triples for dispatch.
    fn collect_due(&mut self) -> Vec<(TimerId, u64, TimerHook)> {
        let now = self.now;
        let mut due: Vec<(Instant, TimerId, u64, TimerHook)> = Vec::new();
        for (raw, entry) in &mut self.entries {
            let Some(deadline) = entry.deadline else {
                continue;
            };
            if deadline > now {
                continue;
            }
            match entry.period {
                Some(period) => entry.deadline = Some(now + period),
                None => entry.deadline = None,
            }
            due.push((deadline, TimerId(*raw), entry.generation, entry.hook.clone()));
        }
        // fire in deadline order so interdependent timers behave predictably
        due.sort_by_key(|(deadline, id, _, _)| (*deadline, id.0));
        due.into_iter().map(|(_, id, gen, hook)| (id, gen, hook)).collect()
    }

    fn generation_matches(&self, id: TimerId, generation: u64) -> bool {
        self.entries
            .get(&id.0)
            .is_some_and(|e| e.generation == generation)
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire all due timers. Returns the number of hooks invoked.
pub fn process(service: &Rc<RefCell<TimerService>>) -> usize {
    let due = service.borrow_mut().collect_due();
    let mut fired = 0;
    for (id, generation, hook) in due {
        if !service.borrow().generation_matches(id, generation) {
            // stopped or rearmed by an earlier hook of this batch
            continue;
        }
        log::trace!("[TIMER] fire {:?}", id);
        hook(id);
        fired += 1;
    }
    fired
}

// ============================================================================
// Tests
// ============================================================================
