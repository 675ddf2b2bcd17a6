use crate::error::SoftDeadlineExceeded;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

type Clock = Box<dyn Fn() -> DateTime<Utc>>;

/// Execution backend shared (via `Rc`) between a client and the model clients
/// derived from it. Carries the soft deadline, the deadline-exemption
/// counter, and the command-timing histogram dumped to
/// `juju_command_times.json`.
///
/// Single-threaded by design; interior mutability instead of locks.
pub struct ExecBackend {
    soft_deadline: Cell<Option<DateTime<Utc>>>,
    ignored_deadlines: Cell<u32>,
    timings: RefCell<BTreeMap<String, Vec<f64>>>,
    clock: RefCell<Clock>,
}

impl std::fmt::Debug for ExecBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecBackend")
            .field("soft_deadline", &self.soft_deadline.get())
            .field("ignored_deadlines", &self.ignored_deadlines.get())
            .finish()
    }
}

impl ExecBackend {
    pub fn new() -> Rc<Self> {
        Self::with_deadline(None)
    }

    pub fn with_deadline(soft_deadline: Option<DateTime<Utc>>) -> Rc<Self> {
        Rc::new(Self {
            soft_deadline: Cell::new(soft_deadline),
            ignored_deadlines: Cell::new(0),
            timings: RefCell::new(BTreeMap::new()),
            clock: RefCell::new(Box::new(Utc::now)),
        })
    }

    pub fn soft_deadline(&self) -> Option<DateTime<Utc>> {
        self.soft_deadline.get()
    }

    pub fn set_soft_deadline(&self, deadline: Option<DateTime<Utc>>) {
        self.soft_deadline.set(deadline);
    }

    /// Pin the "now" source, for tests that need a deterministic clock.
    pub fn set_clock(&self, clock: impl Fn() -> DateTime<Utc> + 'static) {
        *self.clock.borrow_mut() = Box::new(clock);
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock.borrow())()
    }

    fn past_deadline(&self) -> bool {
        match self.soft_deadline.get() {
            Some(deadline) => self.now() > deadline,
            None => false,
        }
    }

    /// Scoped deadline check around a blocking call: run `f` to completion,
    /// then raise `SoftDeadlineExceeded` if the budget has expired and no
    /// exemption region is active. Errors from `f` pass through unchecked.
    pub fn check_timeouts<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let value = f()?;
        if self.ignored_deadlines.get() == 0 && self.past_deadline() {
            return Err(SoftDeadlineExceeded.into());
        }
        Ok(value)
    }

    /// Deadline-exemption region: while active, `check_timeouts` never
    /// raises. Teardown, log harvesting and failure diagnostics run inside
    /// this region so cleanup is never short-circuited by the budget it
    /// protects.
    pub fn ignore_soft_deadline<T>(&self, f: impl FnOnce() -> T) -> T {
        self.ignored_deadlines.set(self.ignored_deadlines.get() + 1);
        let value = f();
        self.ignored_deadlines.set(self.ignored_deadlines.get() - 1);
        value
    }

    pub fn record_timing(&self, namespace: &str, op: &str, seconds: f64) {
        self.timings
            .borrow_mut()
            .entry(format!("{namespace} {op}"))
            .or_default()
            .push(seconds);
    }

    pub fn timings(&self) -> BTreeMap<String, Vec<f64>> {
        self.timings.borrow().clone()
    }
}
