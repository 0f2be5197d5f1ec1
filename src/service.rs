//! Per-service supervision: the state machine, process lifecycle and
//! crash-restart policy.
//!
//! `step` applies transitions for one service until it stops moving;
//! `step_all` re-runs the whole table until a pass changes nothing, so
//! transitive condition effects settle within a single event-loop turn.
//! Timers (termination watchdog, restart backoff) are armed here and fired
//! by the event loop through [`retry`] and [`kill_timeout`].

use std::{
    env,
    ffi::CString,
    fs,
    path::PathBuf,
    time::Instant,
};

use nix::{
    errno::Errno,
    sys::{
        signal::{SigSet, SigmaskHow, Signal, kill, sigprocmask},
        wait::{WaitStatus, waitpid},
    },
    unistd::{ForkResult, Pid, execve, fork},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    cond::CondState,
    constants::{
        NORESPAWN_FILES, RESPAWN_BACKOFF_LONG, RESPAWN_BACKOFF_SHORT, RESPAWN_MAX,
        RESTART_ARM_DELAY, STEP_MAX_PASSES, SVC_TERM_TIMEOUT,
    },
    ctx::{InitCtx, TimerKind},
    error::InitError,
    logs, runtime, sm,
    svc::{BlockReason, Dirty, ExitInfo, Svc, SvcId, SvcKind, SvcState},
};

/// Outcome of stepping one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// At least one transition was applied.
    Progressed,
    /// Stable; nothing to do.
    StableOk,
    /// The descriptor was unregistered during the step.
    Removed,
}

/// Restores the default signal dispositions; used in children before exec.
pub fn unblock_all_signals() {
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&SigSet::all()), None);
}

/// True while service starts are inhibited (init is SIGSTOP'ed or a
/// norespawn file exists).
fn is_norespawn(ctx: &InitCtx) -> bool {
    ctx.norespawn
        || NORESPAWN_FILES
            .iter()
            .any(|path| std::path::Path::new(path).exists())
}

fn pidfile_path(svc: &Svc) -> PathBuf {
    svc.pidfile
        .clone()
        .unwrap_or_else(|| runtime::pidfile_dir().join(format!("{}.pid", svc.ident())))
}

fn pidfile_create(svc: &Svc, pid: i32) {
    let path = pidfile_path(svc);
    if let Err(err) = fs::write(&path, format!("{pid}\n")) {
        warn!("{}: failed writing pidfile {:?}: {err}", svc.ident(), path);
    }
}

fn pidfile_remove(svc: &Svc) {
    let path = pidfile_path(svc);
    if let Err(err) = fs::remove_file(&path)
        && err.kind() != std::io::ErrorKind::NotFound
    {
        warn!("{}: failed removing pidfile {:?}: {err}", svc.ident(), path);
    }
}

/// Touches the pidfile after a SIGHUP so dependents re-observe the service.
fn pidfile_touch(svc: &Svc) {
    if let Some(pid) = svc.pid {
        pidfile_create(svc, pid);
    }
}

fn exit_info(status: WaitStatus) -> Option<ExitInfo> {
    match status {
        WaitStatus::Exited(_, code) => Some(ExitInfo {
            code: Some(code),
            signal: None,
        }),
        WaitStatus::Signaled(_, sig, _) => Some(ExitInfo {
            code: None,
            signal: Some(sig as i32),
        }),
        _ => None,
    }
}

fn collect_env(svc: &Svc) -> Vec<CString> {
    let mut pairs: Vec<(String, String)> = env::vars().collect();
    if let Some(plan) = &svc.user {
        for (key, value) in plan.env_overrides() {
            pairs.retain(|(k, _)| *k != key);
            pairs.push((key, value));
        }
    }
    pairs
        .into_iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect()
}

/// Forks and execs the service command.
///
/// The caller has already checked `enabled` and the aggregate condition.
/// SIGCHLD is blocked across the fork so child registration is serialized
/// with PID recording. For `run` kind units the call waits synchronously
/// for the child to exit, blocking all other transitions.
fn start(ctx: &mut InitCtx, id: SvcId) -> Result<(), InitError> {
    let Some(svc) = ctx.table.get(id).cloned() else {
        return Ok(());
    };

    if !svc.cmd.is_file() {
        warn!("service {} does not exist!", svc.cmd.display());
        if let Some(entry) = ctx.table.get_mut(id) {
            entry.block = BlockReason::Missing;
        }
        return Err(InitError::ServiceStart {
            service: svc.ident(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        });
    }

    let path = CString::new(svc.cmd.to_string_lossy().into_owned())
        .map_err(|_| Errno::EINVAL)?;
    let argv: Vec<CString> = svc
        .args
        .iter()
        .filter_map(|arg| CString::new(arg.as_str()).ok())
        .collect();
    let envp = collect_env(&svc);

    let mut chld = SigSet::empty();
    chld.add(Signal::SIGCHLD);
    let mut old_mask = SigSet::empty();
    let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&chld), Some(&mut old_mask));

    let fork_result = unsafe { fork() };
    let child = match fork_result {
        Ok(ForkResult::Child) => {
            let _ = svc.rlimits.apply();
            if let Some(plan) = &svc.user
                && unsafe { plan.apply() }.is_err()
            {
                unsafe { libc::_exit(71) }
            }
            logs::route_child_stdio(&svc.log, &svc.name);
            unblock_all_signals();
            let _ = execve(&path, &argv, &envp);
            unsafe { libc::_exit(127) }
        }
        Ok(ForkResult::Parent { child }) => child,
        Err(err) => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
            return Err(InitError::ServiceStart {
                service: svc.ident(),
                source: std::io::Error::from_raw_os_error(err as i32),
            });
        }
    };

    debug!("starting {}: pid {}", svc.ident(), child.as_raw());
    if let Some(entry) = ctx.table.get_mut(id) {
        entry.reset_runtime();
        entry.pid = Some(child.as_raw());
        entry.started_at = Some(Instant::now());
    }

    match svc.kind {
        SvcKind::Run => {
            // A run command blocks the step loop until it exits.
            let status = loop {
                match waitpid(child, None) {
                    Ok(status @ WaitStatus::Exited(..))
                    | Ok(status @ WaitStatus::Signaled(..)) => break exit_info(status),
                    Ok(_) => continue,
                    Err(Errno::EINTR) => continue,
                    Err(_) => break None,
                }
            };
            if let Some(entry) = ctx.table.get_mut(id) {
                entry.last_exit = status;
                entry.pid = None;
                entry.started_at = None;
            }
        }
        SvcKind::Service => {
            if let Some(entry) = ctx.table.get(id) {
                pidfile_create(entry, child.as_raw());
            }
        }
        _ => {}
    }

    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&old_mask), None);
    Ok(())
}

fn set_stopping(ctx: &mut InitCtx, id: SvcId) {
    let Some(svc) = ctx.table.get_mut(id) else {
        return;
    };
    svc.state = SvcState::Stopping;
    let cond = svc.pid_cond();
    let kind = svc.kind;
    ctx.cond.flux(&cond);

    // If the PID isn't collected within the grace period, kill it.
    if kind != SvcKind::Inetd {
        ctx.timers.cancel(id);
        let _ = ctx.timers.arm(id, TimerKind::Kill, SVC_TERM_TIMEOUT);
    }
}

/// Stops a service: SIGTERM now, SIGKILL from the watchdog if the PID is
/// not collected in time.
pub fn stop(ctx: &mut InitCtx, id: SvcId) {
    let Some(svc) = ctx.table.get(id) else {
        return;
    };
    if matches!(
        svc.state,
        SvcState::Stopping | SvcState::Halted | SvcState::Done
    ) {
        return;
    }

    let ident = svc.ident();
    let pid = svc.pid;
    ctx.timers.cancel(id);
    set_stopping(ctx, id);

    if let Some(pid) = pid
        && pid > 1
    {
        debug!("sending SIGTERM to {ident} (pid {pid})");
        let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    }
}

/// Termination watchdog callback: the service ignored SIGTERM.
pub fn kill_timeout(ctx: &mut InitCtx, id: SvcId) {
    ctx.timers.cancel(id);
    let Some(svc) = ctx.table.get(id) else {
        return;
    };
    let Some(pid) = svc.pid else {
        return;
    };
    if pid <= 1 {
        debug!("{}: aborting SIGKILL, already terminated", svc.ident());
        return;
    }

    warn!("{}: ungraceful stop, sending SIGKILL to {pid}", svc.ident());
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

/// Books a failed start or a death outside RUNNING against the respawn
/// budget, under the same contract as [`retry`]: past `RESPAWN_MAX` the
/// service is abandoned as crashing.
fn charge_restart(ctx: &mut InitCtx, id: SvcId) {
    let Some(svc) = ctx.table.get_mut(id) else {
        return;
    };
    if svc.restart_cnt >= RESPAWN_MAX {
        let ident = svc.ident();
        svc.block = BlockReason::Crashing;
        svc.restart_cnt = 0;
        error!("{ident} keeps failing, not restarting");
    } else {
        svc.restart_cnt += 1;
    }
}

/// Crash-restart retry tick.
///
/// The counter grows monotonically within a crash episode and is reset only
/// here, when the tick finds the service outside HALTED+RESTARTING.
pub fn retry(ctx: &mut InitCtx, id: SvcId) {
    ctx.timers.cancel(id);
    let Some(svc) = ctx.table.get(id) else {
        return;
    };
    let ident = svc.ident();

    if svc.state != SvcState::Halted || svc.block != BlockReason::Restarting {
        debug!("{ident} not crashing anymore");
        if let Some(entry) = ctx.table.get_mut(id) {
            entry.restart_cnt = 0;
        }
        return;
    }

    if svc.restart_cnt >= RESPAWN_MAX {
        error!("{ident} keeps crashing, not restarting");
        if let Some(entry) = ctx.table.get_mut(id) {
            entry.block = BlockReason::Crashing;
            entry.restart_cnt = 0;
        }
        step(ctx, id);
        return;
    }

    let attempt = {
        let entry = ctx.table.get_mut(id).expect("checked above");
        entry.restart_cnt += 1;
        entry.total_restarts += 1;
        entry.block = BlockReason::None;
        entry.restart_cnt
    };
    debug!("{ident} crashed, restart attempt {attempt}");

    // Arm the next tick before stepping so the ladder owns the timer slot.
    let backoff = if attempt <= RESPAWN_MAX / 2 {
        RESPAWN_BACKOFF_SHORT
    } else {
        RESPAWN_BACKOFF_LONG
    };
    let _ = ctx.timers.arm(id, TimerKind::Retry, backoff);
    step(ctx, id);
}

/// Forwards SIGHUP to a reloadable service instead of restarting it.
fn sighup_reload(ctx: &mut InitCtx, id: SvcId) {
    if is_norespawn(ctx) {
        return;
    }
    let Some(svc) = ctx.table.get(id) else {
        return;
    };
    let Some(pid) = svc.pid.filter(|p| *p > 1) else {
        debug!("{}: bad PID for SIGHUP", svc.ident());
        if let Some(entry) = ctx.table.get_mut(id) {
            entry.pid = None;
            entry.started_at = None;
        }
        return;
    };

    info!("reloading {} (SIGHUP to {pid})", svc.ident());
    let _ = kill(Pid::from_raw(pid), Signal::SIGHUP);
    pidfile_touch(svc);
    let cond = svc.pid_cond();
    ctx.cond.set(&cond);
}

/// Sends an arbitrary signal to a service's process.
pub fn signal_service(ctx: &InitCtx, id: SvcId, signo: i32) -> Result<(), InitError> {
    let Some(svc) = ctx.table.get(id) else {
        return Err(Errno::ESRCH.into());
    };
    let ident = svc.ident();
    let pid = svc.pid.filter(|p| *p > 1).ok_or(Errno::ESRCH)?;
    let signal = Signal::try_from(signo)?;
    kill(Pid::from_raw(pid), signal).map_err(|source| InitError::ServiceSignal {
        service: ident,
        source,
    })
}

fn send_signal(pid: Option<i32>, signal: Signal) {
    if let Some(pid) = pid
        && pid > 1
    {
        let _ = kill(Pid::from_raw(pid), signal);
    }
}

/// Re-evaluates one service until it stops moving.
pub fn step(ctx: &mut InitCtx, id: SvcId) -> StepResult {
    let mut progressed = false;

    loop {
        let Some(svc) = ctx.table.get(id) else {
            break;
        };

        let old_state = svc.state;
        let kind = svc.kind;
        let pid = svc.pid;
        let dirty = svc.dirty;
        let sighup = svc.sighup;
        let pid_cond = svc.pid_cond();
        let enabled = svc.enabled(ctx.sm.runlevel());
        let agg = ctx.cond.get_agg(&svc.cond);

        trace!(
            "{:>16}({}): {} {}abled cond:{}",
            svc.ident(),
            pid.unwrap_or(0),
            old_state.as_ref(),
            if enabled { "en" } else { "dis" },
            agg.as_str(),
        );

        match old_state {
            SvcState::Halted => {
                if enabled
                    && let Some(entry) = ctx.table.get_mut(id)
                {
                    entry.state = SvcState::Ready;
                }
            }

            SvcState::Done => {
                if kind == SvcKind::InetdConn {
                    unregister(ctx, id);
                    ctx.schedule_step();
                    return StepResult::Removed;
                }
                if dirty == Dirty::Changed
                    && let Some(entry) = ctx.table.get_mut(id)
                {
                    entry.state = SvcState::Halted;
                }
            }

            SvcState::Stopping => {
                if pid.is_none() {
                    // PID was collected normally; stand the watchdog down.
                    ctx.timers.cancel(id);
                    let next = kind.on_exit_state();
                    let block = svc.block;
                    if let Some(entry) = ctx.table.get_mut(id) {
                        entry.state = next;
                    }
                    if block != BlockReason::Restarting {
                        ctx.cond.clear(&pid_cond);
                    }
                }
            }

            SvcState::Ready => {
                if !enabled {
                    if let Some(entry) = ctx.table.get_mut(id) {
                        entry.state = SvcState::Halted;
                    }
                } else if agg == CondState::On {
                    // Wait until the old runlevel has finished stopping.
                    if sm::in_teardown(ctx) {
                        break;
                    }
                    // A global pause is not a start failure; stay READY and
                    // retry once starts are allowed again.
                    if is_norespawn(ctx) {
                        break;
                    }

                    match start(ctx, id) {
                        Ok(()) => {
                            let mut recovered = false;
                            if let Some(entry) = ctx.table.get_mut(id) {
                                entry.dirty = Dirty::Clean;
                                entry.state = SvcState::Running;
                                recovered = entry.restart_cnt > 0;
                            }
                            ctx.cond.set(&pid_cond);
                            // A pending crash tick keeps the slot; otherwise
                            // arm one so the counter resets once the service
                            // proves stable.
                            if recovered {
                                let _ = ctx.timers.arm(
                                    id,
                                    TimerKind::Retry,
                                    RESPAWN_BACKOFF_SHORT,
                                );
                            }
                        }
                        Err(err) => {
                            warn!("start failed: {err}");
                            charge_restart(ctx, id);
                            if kind != SvcKind::InetdConn {
                                break;
                            }
                            // Terminal for an accepted connection: let the
                            // running-without-pid path retire it.
                            if let Some(entry) = ctx.table.get_mut(id) {
                                entry.dirty = Dirty::Clean;
                                entry.state = SvcState::Running;
                            }
                        }
                    }
                }
            }

            SvcState::Running => {
                if !enabled {
                    stop(ctx, id);
                } else if pid.is_none() {
                    if kind.is_daemon() {
                        if let Some(entry) = ctx.table.get_mut(id) {
                            entry.block = BlockReason::Restarting;
                            entry.state = SvcState::Halted;
                        }
                        ctx.cond.flux(&pid_cond);
                        debug!("delayed restart of {pid_cond}");
                        let _ = ctx.timers.arm(id, TimerKind::Retry, RESTART_ARM_DELAY);
                    } else {
                        if kind.is_runtask()
                            && let Some(entry) = ctx.table.get_mut(id)
                        {
                            entry.once += 1;
                        }
                        set_stopping(ctx, id);
                    }
                } else {
                    match agg {
                        CondState::Off => stop(ctx, id),
                        CondState::Flux => {
                            send_signal(pid, Signal::SIGSTOP);
                            if let Some(entry) = ctx.table.get_mut(id) {
                                entry.state = SvcState::Waiting;
                            }
                        }
                        CondState::On => {
                            if dirty == Dirty::Changed {
                                if sighup {
                                    if sm::in_teardown(ctx) {
                                        break;
                                    }
                                    sighup_reload(ctx, id);
                                } else {
                                    stop(ctx, id);
                                }
                                if let Some(entry) = ctx.table.get_mut(id) {
                                    entry.dirty = Dirty::Clean;
                                }
                            }
                        }
                    }
                }
            }

            SvcState::Waiting => {
                if !enabled {
                    send_signal(pid, Signal::SIGCONT);
                    stop(ctx, id);
                } else if pid.is_none() {
                    // Died while paused; counts against the budget.
                    charge_restart(ctx, id);
                    if let Some(entry) = ctx.table.get_mut(id) {
                        entry.state = SvcState::Ready;
                    }
                } else {
                    match agg {
                        CondState::On => {
                            send_signal(pid, Signal::SIGCONT);
                            if let Some(entry) = ctx.table.get_mut(id) {
                                entry.state = SvcState::Running;
                            }
                            // Reassert our own condition when unchanged so
                            // dependents leave FLUX too.
                            if dirty == Dirty::Clean {
                                ctx.cond.set(&pid_cond);
                            }
                        }
                        CondState::Off => {
                            send_signal(pid, Signal::SIGCONT);
                            stop(ctx, id);
                        }
                        CondState::Flux => {}
                    }
                }
            }
        }

        match ctx.table.get(id).map(|svc| svc.state) {
            Some(new_state) if new_state != old_state => {
                trace!("{pid_cond}: -> {}", new_state.as_ref());
                progressed = true;
            }
            _ => break,
        }
    }

    if progressed {
        // Other services may depend on this state change.
        ctx.schedule_step();
        StepResult::Progressed
    } else {
        StepResult::StableOk
    }
}

/// Re-evaluates every service until a full pass changes nothing.
pub fn step_all(ctx: &mut InitCtx) {
    for pass in 0..STEP_MAX_PASSES {
        let mut progressed = false;
        for id in ctx.table.ids() {
            match step(ctx, id) {
                StepResult::Progressed | StepResult::Removed => progressed = true,
                StepResult::StableOk => {}
            }
        }
        if !progressed {
            trace!("step-all converged after {} pass(es)", pass + 1);
            break;
        }
    }
    ctx.step_pending = false;
}

/// SIGCHLD handler tail: books the exit and steps the owning service.
pub fn monitor(ctx: &mut InitCtx, pid: i32, status: Option<ExitInfo>) {
    if pid <= 1 {
        return;
    }

    let Some(id) = ctx.table.find_by_pid(pid) else {
        debug!("collected unknown PID {pid}");
        return;
    };

    let (ident, is_daemon, runlevels, kind) = {
        let svc = ctx.table.get_mut(id).expect("found above");
        svc.last_exit = status;
        svc.pid = None;
        svc.started_at = None;
        (svc.ident(), svc.kind.is_daemon(), svc.runlevels, svc.kind)
    };
    debug!("collected {ident}({pid})");

    if is_daemon
        && let Some(svc) = ctx.table.get(id)
    {
        pidfile_remove(svc);
    }

    if step(ctx, id) != StepResult::Removed {
        // Bootstrap-only run/tasks have had their time in the sun.
        let done = ctx
            .table
            .get(id)
            .map(|svc| svc.state == SvcState::Done)
            .unwrap_or(false);
        if kind.is_runtask() && runlevels == 1 && done {
            debug!("collected bootstrap task {ident}, removing");
            unregister(ctx, id);
        }
    }

    sm::step(ctx);
}

/// Stops, detaches and removes a descriptor. Pending timers are cancelled
/// and the handle becomes invalid.
pub fn unregister(ctx: &mut InitCtx, id: SvcId) {
    let Some(svc) = ctx.table.get(id) else {
        return;
    };

    // Never try to stop an accepted connection from here; it only arrives
    // once already stopped.
    if svc.kind != SvcKind::InetdConn {
        stop(ctx, id);
    }

    ctx.timers.cancel(id);
    if let Some(svc) = ctx.table.remove(id) {
        ctx.cond.clear(&svc.pid_cond());
        if svc.kind.is_daemon() {
            pidfile_remove(&svc);
        }
    }
}

/// Clears once-counters so run/tasks may fire again in the new runlevel.
pub fn runtask_clean(ctx: &mut InitCtx) {
    for id in ctx.table.ids() {
        if let Some(svc) = ctx.table.get_mut(id)
            && svc.kind.is_runtask()
        {
            svc.once = 0;
            if svc.state == SvcState::Done {
                svc.state = SvcState::Halted;
            }
        }
    }
}

/// True once every enabled run/task has completed in the current runlevel.
/// Tasks gated on `hook/` conditions are skipped; they cannot run until the
/// system is finalized.
pub fn completed(ctx: &InitCtx) -> bool {
    let runlevel = ctx.sm.runlevel();
    for (_, svc) in ctx.table.iter_kind(&[SvcKind::Task, SvcKind::Run]) {
        if !svc.enabled(runlevel) {
            continue;
        }
        if svc.cond.0.iter().any(|term| term.name.starts_with("hook/")) {
            continue;
        }
        if svc.once == 0 {
            debug!("{} has not yet completed ...", svc.ident());
            return false;
        }
    }
    true
}

/// Drains every collectable child, booking each exit. Returns the number of
/// PIDs reaped.
pub fn reap(ctx: &mut InitCtx) -> usize {
    use nix::sys::wait::WaitPidFlag;

    let mut reaped = 0;
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status @ WaitStatus::Exited(pid, _))
            | Ok(status @ WaitStatus::Signaled(pid, _, _)) => {
                reaped += 1;
                monitor(ctx, pid.as_raw(), exit_info(status));
            }
            Ok(_) => continue,
            Err(Errno::ECHILD) => break,
            Err(Errno::EINTR) => continue,
            Err(err) => {
                warn!("waitpid failed: {err}");
                break;
            }
        }
    }
    reaped
}
