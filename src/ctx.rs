//! The init context: every piece of process-wide mutable state, owned by
//! the event loop and passed explicitly to the components that need it.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    path::PathBuf,
    time::{Duration, Instant},
};

use crate::{
    cond::CondStore,
    error::InitError,
    runtime,
    sm::Sm,
    svc::{Svc, SvcId, SvcTable},
};

/// What the event loop should do after draining to idle at a terminal
/// runlevel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownIntent {
    /// Halt the machine.
    Halt,
    /// Reboot.
    Reboot,
    /// Power off.
    Poweroff,
    /// Suspend to RAM; services keep running.
    Suspend,
}

/// Which callback a pending per-service timer runs on expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Crash-restart retry tick.
    Retry,
    /// Termination watchdog: escalate SIGTERM to SIGKILL.
    Kill,
}

#[derive(Debug, PartialEq, Eq)]
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    id: SvcId,
    kind: TimerKind,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// One-shot timer queue. At most one timer per service may be pending;
/// arming a second returns busy, matching the supervision code's habit of
/// letting an earlier timer finish its job.
#[derive(Debug, Default)]
pub struct Timers {
    heap: BinaryHeap<Reverse<TimerEntry>>,
    armed: HashMap<SvcId, u64>,
    seq: u64,
}

impl Timers {
    /// Arms a one-shot timer for `id`. Fails when one is already pending.
    pub fn arm(&mut self, id: SvcId, kind: TimerKind, after: Duration) -> Result<(), ()> {
        if self.armed.contains_key(&id) {
            return Err(());
        }
        self.seq += 1;
        self.armed.insert(id, self.seq);
        self.heap.push(Reverse(TimerEntry {
            deadline: Instant::now() + after,
            seq: self.seq,
            id,
            kind,
        }));
        Ok(())
    }

    /// Cancels any pending timer for `id`.
    pub fn cancel(&mut self, id: SvcId) {
        self.armed.remove(&id);
    }

    /// True when a timer is pending for `id`.
    pub fn is_armed(&self, id: SvcId) -> bool {
        self.armed.contains_key(&id)
    }

    fn prune_stale(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.armed.get(&head.id) == Some(&head.seq) {
                break;
            }
            self.heap.pop();
        }
    }

    /// Time until the next live deadline, or `None` when nothing is armed.
    pub fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        self.prune_stale();
        self.heap
            .peek()
            .map(|Reverse(head)| head.deadline.saturating_duration_since(now))
    }

    /// Pops the next expired timer, if any.
    pub fn pop_due(&mut self, now: Instant) -> Option<(SvcId, TimerKind)> {
        loop {
            self.prune_stale();
            let Reverse(head) = self.heap.peek()?;
            if head.deadline > now {
                return None;
            }
            let Reverse(entry) = self.heap.pop()?;
            if self.armed.get(&entry.id) == Some(&entry.seq) {
                self.armed.remove(&entry.id);
                return Some((entry.id, entry.kind));
            }
        }
    }
}

/// Process-wide state of the init core.
#[derive(Debug)]
pub struct InitCtx {
    /// Condition store; single writer, owned here.
    pub cond: CondStore,
    /// Service table.
    pub table: SvcTable,
    /// Global reconfiguration state machine.
    pub sm: Sm,
    /// Pending per-service one-shot timers.
    pub timers: Timers,
    /// Verbose-diagnostics toggle, flipped by the control protocol.
    pub debug: bool,
    /// Inhibits all service starts while set.
    pub norespawn: bool,
    /// A state change happened; a table-wide re-step is due.
    pub step_pending: bool,
    /// Set once the machine should leave the event loop.
    pub shutdown: Option<ShutdownIntent>,
    /// Directory the loader re-reads on reload, when configured.
    pub conf_dir: Option<PathBuf>,
}

impl InitCtx {
    /// Builds a context rooted at the current runtime directories.
    pub fn new() -> Result<Self, InitError> {
        std::fs::create_dir_all(runtime::run_dir()).map_err(std::io::Error::from)?;
        std::fs::create_dir_all(runtime::pidfile_dir()).map_err(std::io::Error::from)?;
        std::fs::create_dir_all(runtime::state_dir()).map_err(std::io::Error::from)?;
        let cond = CondStore::new(runtime::cond_dir())?;

        Ok(Self {
            cond,
            table: SvcTable::new(),
            sm: Sm::new(),
            timers: Timers::default(),
            debug: false,
            norespawn: false,
            step_pending: false,
            shutdown: None,
            conf_dir: None,
        })
    }

    /// Registers a descriptor directly (no backing file); such services are
    /// exempt from removal sweeps.
    pub fn register(&mut self, mut svc: Svc) -> SvcId {
        svc.protected = true;
        let id = self.table.insert(svc);
        self.schedule_step();
        id
    }

    /// Records that a table-wide re-step is due this event-loop turn.
    pub fn schedule_step(&mut self) {
        self.step_pending = true;
    }
}
