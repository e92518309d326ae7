//! Installable fake-timer wheel.
//!
//! Entries are ordered by (expiry, id), so two timers due at the same instant
//! run in scheduling order. The reference environment has no event loop: in
//! real-timer mode callbacks belong to the host scheduler and are simply
//! retained, never fired, during synchronous execution.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};

use crate::interp::call_function;
use crate::script::EvalError;
use crate::value::Value;

// Bail out instead of spinning forever on self-rescheduling timers.
const MAX_TIMER_LOOPS: usize = 100_000;

struct TimerEntry {
    callback: Value,
    interval: Option<u64>,
}

#[derive(Default)]
pub struct FakeTimers {
    installed: Cell<bool>,
    now: Cell<u64>,
    next_id: Cell<u64>,
    timers: RefCell<BTreeMap<(u64, u64), TimerEntry>>,
    ticks: RefCell<VecDeque<Value>>,
    immediates: RefCell<VecDeque<Value>>,
    real_queue: RefCell<Vec<Value>>,
}

impl FakeTimers {
    pub fn new() -> FakeTimers {
        FakeTimers::default()
    }

    pub fn use_fake(&self) {
        self.installed.set(true);
    }

    pub fn use_real(&self) {
        self.installed.set(false);
    }

    pub fn is_installed(&self) -> bool {
        self.installed.get()
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }

    pub fn schedule_timeout(&self, callback: Value, delay: u64) -> u64 {
        self.schedule(callback, delay, None)
    }

    pub fn schedule_interval(&self, callback: Value, delay: u64) -> u64 {
        self.schedule(callback, delay.max(1), Some(delay.max(1)))
    }

    fn schedule(&self, callback: Value, delay: u64, interval: Option<u64>) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        if self.installed.get() {
            self.timers.borrow_mut().insert(
                (self.now.get() + delay, id),
                TimerEntry { callback, interval },
            );
        } else {
            self.real_queue.borrow_mut().push(callback);
        }
        id
    }

    pub fn cancel(&self, id: u64) {
        let mut timers = self.timers.borrow_mut();
        let key = timers.keys().find(|(_, tid)| *tid == id).copied();
        if let Some(key) = key {
            timers.remove(&key);
        }
    }

    pub fn schedule_tick(&self, callback: Value) {
        self.ticks.borrow_mut().push_back(callback);
    }

    pub fn schedule_immediate(&self, callback: Value) {
        self.immediates.borrow_mut().push_back(callback);
    }

    /// Move the clock forward, firing everything that falls due in order.
    pub fn advance_by(&self, ms: u64) -> Result<(), EvalError> {
        let target = self.now.get() + ms;
        let mut loops = 0;
        loop {
            let next = self
                .timers
                .borrow()
                .keys()
                .next()
                .copied()
                .filter(|(expiry, _)| *expiry <= target);
            let Some(key) = next else { break };
            self.guard_loops(&mut loops)?;
            self.now.set(key.0);
            self.fire(key)?;
        }
        self.now.set(target);
        Ok(())
    }

    /// Run until no timers remain.
    pub fn run_all(&self) -> Result<(), EvalError> {
        self.run_all_ticks()?;
        self.run_all_immediates()?;
        let mut loops = 0;
        loop {
            let next = self.timers.borrow().keys().next().copied();
            let Some(key) = next else { break };
            self.guard_loops(&mut loops)?;
            self.now.set(key.0);
            self.fire(key)?;
        }
        Ok(())
    }

    /// Run only the timers pending right now; anything they schedule waits.
    pub fn run_only_pending(&self) -> Result<(), EvalError> {
        let pending: Vec<(u64, u64)> = self.timers.borrow().keys().copied().collect();
        for key in pending {
            if self.timers.borrow().contains_key(&key) {
                self.now.set(key.0);
                self.fire(key)?;
            }
        }
        Ok(())
    }

    pub fn run_all_ticks(&self) -> Result<(), EvalError> {
        let mut loops = 0;
        loop {
            let next = self.ticks.borrow_mut().pop_front();
            let Some(callback) = next else { break };
            self.guard_loops(&mut loops)?;
            call_function(&callback, &[])?;
        }
        Ok(())
    }

    pub fn run_all_immediates(&self) -> Result<(), EvalError> {
        let mut loops = 0;
        loop {
            let next = self.immediates.borrow_mut().pop_front();
            let Some(callback) = next else { break };
            self.guard_loops(&mut loops)?;
            call_function(&callback, &[])?;
        }
        Ok(())
    }

    pub fn clear_all(&self) {
        self.timers.borrow_mut().clear();
        self.ticks.borrow_mut().clear();
        self.immediates.borrow_mut().clear();
        self.real_queue.borrow_mut().clear();
    }

    pub fn count(&self) -> usize {
        self.timers.borrow().len()
            + self.ticks.borrow().len()
            + self.immediates.borrow().len()
    }

    /// Fresh clock and no pending work; mode is left as-is.
    pub fn reset(&self) {
        self.clear_all();
        self.now.set(0);
    }

    fn fire(&self, key: (u64, u64)) -> Result<(), EvalError> {
        let entry = self.timers.borrow_mut().remove(&key);
        let Some(entry) = entry else { return Ok(()) };
        if let Some(interval) = entry.interval {
            self.timers.borrow_mut().insert(
                (key.0 + interval, key.1),
                TimerEntry {
                    callback: entry.callback.clone(),
                    interval: Some(interval),
                },
            );
        }
        call_function(&entry.callback, &[])?;
        Ok(())
    }

    fn guard_loops(&self, loops: &mut usize) -> Result<(), EvalError> {
        *loops += 1;
        if *loops > MAX_TIMER_LOOPS {
            return Err(EvalError::script(format!(
                "Aborting after running {} timers; a timer keeps rescheduling itself",
                MAX_TIMER_LOOPS
            )));
        }
        Ok(())
    }
}
