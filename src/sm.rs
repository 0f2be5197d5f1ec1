//! Global reconfiguration state machine.
//!
//! An outer machine sequences runlevel changes and configuration reloads
//! across the whole service table. Inputs are latched
//! (`request_reload`, `request_runlevel`) and the machine is driven to a
//! fixed point in the same event-loop turn; teardown phases park it until
//! the remaining PIDs are collected.

use tracing::{debug, info};

use crate::{
    conf,
    ctx::{InitCtx, ShutdownIntent},
    service,
    svc::{Dirty, SvcState},
};

/// Phase of the global machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmState {
    /// Nothing in flight.
    #[default]
    Idle,
    /// Applying a configuration reload across the table.
    Reload,
    /// Stopping services not allowed in the new runlevel.
    RunlevelTeardown,
    /// Starting services of the new runlevel.
    RunlevelStartup,
}

/// Runlevel bookkeeping plus latched inputs.
#[derive(Debug, Default)]
pub struct Sm {
    state: SmState,
    current: u8,
    previous: u8,
    reload_pending: bool,
    runlevel_pending: Option<u8>,
    shutdown_hint: Option<ShutdownIntent>,
}

impl Sm {
    /// A machine at bootstrap: runlevel S (0), idle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn state(&self) -> SmState {
        self.state
    }

    /// Active runlevel.
    pub fn runlevel(&self) -> u8 {
        self.current
    }

    /// Runlevel before the most recent change.
    pub fn previous_runlevel(&self) -> u8 {
        self.previous
    }

    /// Latches a configuration reload.
    pub fn request_reload(&mut self) {
        self.reload_pending = true;
    }

    /// Latches a runlevel change. Values above 9 are ignored.
    pub fn request_runlevel(&mut self, runlevel: u8) {
        if runlevel <= 9 {
            self.runlevel_pending = Some(runlevel);
        }
    }

    /// Records what reaching a terminal runlevel should do to the machine.
    pub fn set_shutdown_hint(&mut self, intent: ShutdownIntent) {
        self.shutdown_hint = Some(intent);
    }
}

/// True while services stopped by a teardown have not yet been collected;
/// READY -> RUNNING transitions are inhibited for its duration.
pub fn in_teardown(ctx: &InitCtx) -> bool {
    match ctx.sm.state() {
        SmState::RunlevelTeardown => true,
        SmState::Reload => ctx.table.any_in_state(SvcState::Stopping),
        _ => false,
    }
}

/// Drives the machine as far as it can go this turn.
pub fn step(ctx: &mut InitCtx) {
    loop {
        match ctx.sm.state {
            SmState::Idle => {
                if ctx.sm.reload_pending {
                    ctx.sm.reload_pending = false;
                    begin_reload(ctx);
                    ctx.sm.state = SmState::Reload;
                    service::step_all(ctx);
                    continue;
                }

                if let Some(next) = ctx.sm.runlevel_pending.take() {
                    if next == ctx.sm.current {
                        continue;
                    }
                    info!(
                        "runlevel change {} -> {}",
                        ctx.sm.current, next
                    );
                    ctx.sm.previous = ctx.sm.current;
                    ctx.sm.current = next;
                    ctx.sm.state = SmState::RunlevelTeardown;
                    service::step_all(ctx);
                    continue;
                }

                break;
            }

            SmState::Reload => {
                if ctx.table.any_in_state(SvcState::Stopping) {
                    break;
                }
                debug!("reload settled; reasserting hooks");
                ctx.cond.reassert("hook/");
                sweep_removals(ctx);
                ctx.sm.state = SmState::Idle;
                service::step_all(ctx);
                continue;
            }

            SmState::RunlevelTeardown => {
                if ctx.table.any_in_state(SvcState::Stopping) {
                    break;
                }
                service::runtask_clean(ctx);
                ctx.sm.state = SmState::RunlevelStartup;
                service::step_all(ctx);
                continue;
            }

            SmState::RunlevelStartup => {
                ctx.sm.state = SmState::Idle;
                let level = ctx.sm.current;
                if level == 0 || level == 6 {
                    let intent = ctx.sm.shutdown_hint.take().unwrap_or(if level == 6 {
                        ShutdownIntent::Reboot
                    } else {
                        ShutdownIntent::Halt
                    });
                    info!("runlevel {level} reached, shutting down: {intent:?}");
                    ctx.shutdown = Some(intent);
                }
                continue;
            }
        }
    }
}

/// Sequences the front half of a reload: re-read descriptors, advance the
/// reconfiguration marker so dependents enter FLUX, then re-stamp the
/// conditions whose ground truth is unchanged.
fn begin_reload(ctx: &mut InitCtx) {
    info!("reloading configuration");

    if let Some(dir) = ctx.conf_dir.clone() {
        conf::reload_dir(ctx, &dir);
    }

    ctx.cond.bump_generation();
    ctx.cond.sync_usr();
    ctx.cond.reassert("usr/");
    ctx.cond.reassert("net/");

    // Clean services still running keep their pid condition observable.
    let keep: Vec<String> = ctx
        .table
        .iter()
        .filter(|(_, svc)| svc.state == SvcState::Running && svc.dirty == Dirty::Clean)
        .map(|(_, svc)| svc.pid_cond())
        .collect();
    for cond in keep {
        ctx.cond.reassert(&cond);
    }
}

/// Removes descriptors absent from the settled configuration.
fn sweep_removals(ctx: &mut InitCtx) {
    let doomed: Vec<_> = ctx
        .table
        .iter()
        .filter(|(_, svc)| {
            svc.dirty == Dirty::Removal
                && !svc.protected
                && matches!(svc.state, SvcState::Halted | SvcState::Done)
        })
        .map(|(id, svc)| (id, svc.ident()))
        .collect();

    for (id, ident) in doomed {
        info!("removing service '{ident}' dropped by reload");
        service::unregister(ctx, id);
    }
}
