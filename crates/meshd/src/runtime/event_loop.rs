// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cooperative mainloop.
//!
//! One turn of the loop:
//!
//! 1. wait for fd readiness, the earliest timer deadline or a bounded idle
//! 2. dispatch the ready socket hooks
//! 3. advance the timer clock and fire due timers
//! 4. drain the deferred-callback queue
//!
//! Hooks and timer triggers run to completion without yielding; all state
//! lives behind the [`Core`](super::Core) handle and no borrow is held
//! across a dispatch.

use std::io;
use std::time::{Duration, Instant};

use crate::config::LOOP_IDLE_CAP;
use crate::runtime::{callback, timer, Core};

/// Statistics of one loop turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnStats {
    pub sockets_dispatched: usize,
    pub timers_fired: usize,
    pub callbacks_drained: usize,
}

/// Run a single loop turn.
pub fn run_once(core: &Core) -> io::Result<TurnStats> {
    let now = Instant::now();
    let timeout = match core.timers.borrow().next_deadline() {
        Some(deadline) => deadline
            .saturating_duration_since(now)
            .min(LOOP_IDLE_CAP),
        None => LOOP_IDLE_CAP,
    };

    let dispatches = core.poller.borrow_mut().poll(Some(timeout))?;
    let sockets_dispatched = dispatches.len();
    for (event, hook) in dispatches {
        hook(event);
    }

    core.timers.borrow_mut().advance_to(Instant::now());
    let timers_fired = timer::process(&core.timers);
    let callbacks_drained = callback::drain(&core.callbacks);

    Ok(TurnStats {
        sockets_dispatched,
        timers_fired,
        callbacks_drained,
    })
}

/// Run turns until `keep_going` returns false or `limit` elapses.
pub fn run_while<F>(core: &Core, limit: Duration, mut keep_going: F) -> io::Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    while keep_going() && Instant::now() < deadline {
        run_once(core)?;
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn test_turn_fires_timers_then_drains_callbacks() {
        let core = Core::new(false).unwrap();

        let order = Rc::new(std::cell::RefCell::new(Vec::new()));
        let order_cb = order.clone();
        let callbacks = core.callbacks.clone();
        let order_timer = order.clone();

        let id = core.timers.borrow_mut().add(
            "t",
            Rc::new(move |_| {
                order_timer.borrow_mut().push("timer");
                let order_inner = order_cb.clone();
                callbacks.borrow_mut().enqueue(
                    "after-timer",
                    Box::new(move || order_inner.borrow_mut().push("callback")),
                );
            }),
        );
        core.timers.borrow_mut().set(id, Duration::from_millis(1));

        let stats = run_once(&core).unwrap();
        assert_eq!(stats.timers_fired, 1);
        assert_eq!(stats.callbacks_drained, 1);
        assert_eq!(*order.borrow(), vec!["timer", "callback"]);
    }

    #[test]
    fn test_idle_turn_is_bounded() {
        let core = Core::new(false).unwrap();
        let start = Instant::now();
        run_once(&core).unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_run_while_stops_on_predicate() {
        let core = Core::new(false).unwrap();
        let turns = Rc::new(Cell::new(0));
        let turns2 = turns.clone();
        run_while(&core, Duration::from_secs(5), move || {
            turns2.set(turns2.get() + 1);
            turns2.get() < 2
        })
        .unwrap();
        assert_eq!(turns.get(), 2);
    }
}
