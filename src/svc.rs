//! Service model and associative table.
//!
//! A [`Svc`] is one supervised unit: a respawned daemon, a parallel one-shot
//! task, or a sequential run command. Descriptors are created by the loader
//! and inserted into the [`SvcTable`] before the first transition. The table
//! is an arena keyed by stable integer handles; cross-references hold a
//! [`SvcId`], never a reference, so removal simply invalidates the handle.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum_macros::AsRefStr;

use crate::{
    cond::CondExpr,
    constants::{DEFAULT_INSTANCE_ID, DEFAULT_RUNLEVELS},
    privilege::{Rlimits, UserPlan},
};

/// Stable handle to a service in the table.
pub type SvcId = u32;

/// Supervision state of a service.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SvcState {
    /// Not eligible to run; the resting state.
    #[default]
    Halted,
    /// Eligible, waiting for its conditions to come ON.
    Ready,
    /// Process is alive (or a start is in flight).
    Running,
    /// SIGTERM sent, waiting for the PID to be collected.
    Stopping,
    /// SIGSTOP'ed while its conditions are in FLUX.
    Waiting,
    /// One-shot unit has completed.
    Done,
}

/// What kind of unit a descriptor supervises. Each kind carries a small
/// behavior table instead of runtime flag testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SvcKind {
    /// Long-running daemon, respawned on crash.
    Service,
    /// One-shot command run in parallel with other transitions.
    Task,
    /// One-shot command that blocks further transitions until it exits.
    Run,
    /// On-demand listener; connections spawn `InetdConn` children.
    Inetd,
    /// A single accepted connection of an inetd listener.
    InetdConn,
}

impl SvcKind {
    /// Daemons are respawned and keep pidfiles; one-shots are not.
    pub fn is_daemon(self) -> bool {
        matches!(self, SvcKind::Service | SvcKind::Inetd)
    }

    /// Run-once kinds: their exit is completion, not a crash.
    pub fn is_runtask(self) -> bool {
        matches!(self, SvcKind::Task | SvcKind::Run)
    }

    /// State entered from STOPPING once the PID has been collected.
    pub fn on_exit_state(self) -> SvcState {
        match self {
            SvcKind::Service | SvcKind::Inetd => SvcState::Halted,
            SvcKind::Task | SvcKind::Run | SvcKind::InetdConn => SvcState::Done,
        }
    }

    /// Whether starting this kind blocks the step loop until it exits.
    pub fn blocks_transitions(self) -> bool {
        matches!(self, SvcKind::Run)
    }
}

/// Why a service is currently blocked from being enabled.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, AsRefStr, Serialize, Deserialize, Default,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BlockReason {
    /// Not blocked.
    #[default]
    None,
    /// Command missing from the filesystem.
    Missing,
    /// Exceeded the respawn budget; requires explicit restart or reload.
    Crashing,
    /// In a crash-restart backoff window.
    Restarting,
    /// An inetd listener blocked while a wait-style connection is active.
    Busy,
}

/// Dirty state of a descriptor across configuration reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dirty {
    /// Matches the settled configuration.
    #[default]
    Clean,
    /// Source line changed since the last settled reload.
    Changed,
    /// Absent from the new configuration; swept once halted.
    Removal,
}

/// Where a service's stdout/stderr go.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogSink {
    /// Leave stdio alone.
    #[default]
    Disabled,
    /// Redirect to `/dev/null`.
    Null,
    /// Keep the console.
    Console,
    /// Ship lines to a file via the log shipper.
    File(PathBuf),
    /// Ship lines to syslog with the given tag and priority.
    Syslog {
        /// Syslog tag; defaults to the command basename.
        tag: String,
        /// Priority, e.g. `daemon.info`.
        prio: String,
    },
}

/// Recorded wait status of the most recent process exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    /// Exit code when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal number, when signalled.
    pub signal: Option<i32>,
}

/// A service descriptor plus its runtime bookkeeping.
#[derive(Debug, Clone)]
pub struct Svc {
    /// Absolute command path.
    pub cmd: PathBuf,
    /// Argument vector, including argv\[0\].
    pub args: Vec<String>,
    /// Instance id; `"1"` unless the line carried `:id`.
    pub id: String,
    /// Short name; defaults to the command basename.
    pub name: String,
    /// Human-readable description from the `--` suffix.
    pub desc: String,
    /// Unit kind.
    pub kind: SvcKind,
    /// Allowed runlevels, bits 0..=9 (bit 0 is bootstrap `S`).
    pub runlevels: u16,
    /// Condition expression gating start/stop.
    pub cond: CondExpr,
    /// Whether the service re-reads its config on SIGHUP.
    pub sighup: bool,
    /// Optional externally-maintained pidfile path.
    pub pidfile: Option<PathBuf>,
    /// Stdio routing policy.
    pub log: LogSink,
    /// Resolved user/group switch plan for the child.
    pub user: Option<UserPlan>,
    /// Resource limit overrides applied before exec.
    pub rlimits: Rlimits,
    /// Registered via API rather than a file; exempt from removal sweeps.
    pub protected: bool,
    /// Hash of the source line, for dirty detection.
    pub conf_hash: String,

    // Runtime bookkeeping; reset around fork and reap.
    /// Current supervision state.
    pub state: SvcState,
    /// Live PID, if any.
    pub pid: Option<i32>,
    /// Monotonic start timestamp of the current incarnation.
    pub started_at: Option<std::time::Instant>,
    /// Respawn attempts in the current crash episode.
    pub restart_cnt: u8,
    /// Lifetime respawn total, for status output.
    pub total_restarts: u32,
    /// Most recent collected exit status.
    pub last_exit: Option<ExitInfo>,
    /// Why the service is blocked, if it is.
    pub block: BlockReason,
    /// Reload dirty flag.
    pub dirty: Dirty,
    /// Stopped by an explicit client request.
    pub manual: bool,
    /// Completed runs in the current runlevel (run/task kinds).
    pub once: u32,
}

impl Svc {
    /// Creates a descriptor with default runtime state.
    pub fn new(cmd: impl Into<PathBuf>, id: &str, kind: SvcKind) -> Self {
        let cmd = cmd.into();
        let name = cmd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let args = vec![cmd.to_string_lossy().into_owned()];
        Self {
            cmd,
            args,
            id: if id.is_empty() {
                DEFAULT_INSTANCE_ID.to_string()
            } else {
                id.to_string()
            },
            name,
            desc: String::new(),
            kind,
            runlevels: DEFAULT_RUNLEVELS,
            cond: CondExpr::default(),
            sighup: false,
            pidfile: None,
            log: LogSink::default(),
            user: None,
            rlimits: Rlimits::default(),
            protected: false,
            conf_hash: String::new(),
            state: SvcState::Halted,
            pid: None,
            started_at: None,
            restart_cnt: 0,
            total_restarts: 0,
            last_exit: None,
            block: BlockReason::None,
            dirty: Dirty::Clean,
            manual: false,
            once: 0,
        }
    }

    /// `name` or `name:id` when the instance id is not the default.
    pub fn ident(&self) -> String {
        if self.id == DEFAULT_INSTANCE_ID {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.id)
        }
    }

    /// Condition other services use to depend on this one.
    pub fn pid_cond(&self) -> String {
        format!("pid/{}", self.ident())
    }

    /// True when this service may run in `runlevel`.
    pub fn in_runlevel(&self, runlevel: u8) -> bool {
        runlevel <= 9 && (self.runlevels & (1 << runlevel)) != 0
    }

    /// A service is enabled when the current runlevel allows it, it is not
    /// blocked, not manually stopped, and not marked for removal.
    pub fn enabled(&self, runlevel: u8) -> bool {
        self.in_runlevel(runlevel)
            && self.block == BlockReason::None
            && !self.manual
            && self.dirty != Dirty::Removal
    }

    /// Case-insensitive match against `name` or `name:id`; the id part,
    /// when present, must match exactly.
    pub fn matches(&self, query: &str) -> bool {
        let (qname, qid) = match query.split_once(':') {
            Some((n, i)) => (n, Some(i)),
            None => (query, None),
        };

        if let Some(qid) = qid
            && qid != self.id
        {
            return false;
        }

        let basename = self
            .cmd
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        qname.eq_ignore_ascii_case(&self.name) || qname.eq_ignore_ascii_case(&basename)
    }

    /// Clears per-incarnation runtime fields ahead of a fork.
    pub fn reset_runtime(&mut self) {
        self.pid = None;
        self.started_at = None;
        self.last_exit = None;
    }
}

/// Arena of service descriptors keyed by stable handles.
#[derive(Debug, Default)]
pub struct SvcTable {
    next: SvcId,
    entries: std::collections::BTreeMap<SvcId, Svc>,
}

impl SvcTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a descriptor, returning its handle.
    pub fn insert(&mut self, svc: Svc) -> SvcId {
        self.next += 1;
        let id = self.next;
        self.entries.insert(id, svc);
        id
    }

    /// Removes and returns a descriptor; the handle becomes invalid.
    pub fn remove(&mut self, id: SvcId) -> Option<Svc> {
        self.entries.remove(&id)
    }

    /// Immutable lookup by handle.
    pub fn get(&self, id: SvcId) -> Option<&Svc> {
        self.entries.get(&id)
    }

    /// Mutable lookup by handle.
    pub fn get_mut(&mut self, id: SvcId) -> Option<&mut Svc> {
        self.entries.get_mut(&id)
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no service is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the descriptor registered under `(cmd, id)`.
    pub fn find(&self, cmd: &Path, id: &str) -> Option<SvcId> {
        self.entries
            .iter()
            .find(|(_, svc)| svc.cmd == cmd && svc.id == id)
            .map(|(id, _)| *id)
    }

    /// Finds the descriptor owning a live PID.
    pub fn find_by_pid(&self, pid: i32) -> Option<SvcId> {
        self.entries
            .iter()
            .find(|(_, svc)| svc.pid == Some(pid))
            .map(|(id, _)| *id)
    }

    /// Maps a `pid/<ident>` condition name back to the owning descriptor.
    pub fn find_by_cond(&self, cond: &str) -> Option<SvcId> {
        let ident = cond.strip_prefix("pid/")?;
        self.entries
            .iter()
            .find(|(_, svc)| svc.ident() == ident)
            .map(|(id, _)| *id)
    }

    /// All descriptors matching a client query string.
    pub fn find_matching(&self, query: &str) -> Vec<SvcId> {
        self.entries
            .iter()
            .filter(|(_, svc)| svc.matches(query))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Snapshot of all handles, in stable order. Taken before stepping so
    /// the table can be mutated while iterating.
    pub fn ids(&self) -> Vec<SvcId> {
        self.entries.keys().copied().collect()
    }

    /// Iterates over `(handle, descriptor)` pairs in stable order.
    pub fn iter(&self) -> impl Iterator<Item = (SvcId, &Svc)> {
        self.entries.iter().map(|(id, svc)| (*id, svc))
    }

    /// Iterates over services whose kind is in `kinds`.
    pub fn iter_kind<'a>(
        &'a self,
        kinds: &'a [SvcKind],
    ) -> impl Iterator<Item = (SvcId, &'a Svc)> {
        self.iter().filter(|(_, svc)| kinds.contains(&svc.kind))
    }

    /// True when any service is in the given state.
    pub fn any_in_state(&self, state: SvcState) -> bool {
        self.entries.values().any(|svc| svc.state == state)
    }
}
