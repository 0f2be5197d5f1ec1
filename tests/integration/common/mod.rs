#![allow(dead_code)]

use std::{
    env,
    path::Path,
    thread,
    time::{Duration, Instant},
};

use initg::{
    ctx::{InitCtx, TimerKind},
    runtime, service, sm,
    svc::{Svc, SvcKind, SvcState},
};

pub struct HomeEnvGuard {
    previous: Option<String>,
    _lock: std::sync::MutexGuard<'static, ()>,
}

impl HomeEnvGuard {
    pub fn set(home: &Path) -> Self {
        let lock = initg::test_utils::env_lock();
        let previous = env::var("HOME").ok();
        unsafe {
            env::set_var("HOME", home);
        }
        initg::runtime::init(runtime::RuntimeMode::User);
        Self {
            previous,
            _lock: lock,
        }
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => unsafe {
                env::set_var("HOME", value);
            },
            None => unsafe {
                env::remove_var("HOME");
            },
        }
        initg::runtime::init(runtime::RuntimeMode::User);
    }
}

/// One manual event-loop turn: fire due timers, reap exits, settle the
/// table and the global machine.
pub fn turn(ctx: &mut InitCtx) {
    let now = Instant::now();
    while let Some((id, kind)) = ctx.timers.pop_due(now) {
        match kind {
            TimerKind::Retry => service::retry(ctx, id),
            TimerKind::Kill => service::kill_timeout(ctx, id),
        }
    }

    service::reap(ctx);

    if ctx.step_pending {
        service::step_all(ctx);
        sm::step(ctx);
    }
}

/// Turns the loop until `predicate` holds or `timeout` expires.
pub fn wait_until<F>(ctx: &mut InitCtx, timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut(&InitCtx) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        turn(ctx);
        if predicate(ctx) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// A daemon descriptor wrapping `/bin/sleep`.
pub fn sleeper(name: &str, runlevels: u16) -> Svc {
    let mut svc = Svc::new("/bin/sleep", "1", SvcKind::Service);
    svc.args = vec!["/bin/sleep".into(), "3600".into()];
    svc.name = name.into();
    svc.runlevels = runlevels;
    svc
}

/// A daemon running an inline shell script, for signal-trapping fixtures.
pub fn shell_daemon(name: &str, runlevels: u16, script: &str) -> Svc {
    let mut svc = Svc::new("/bin/sh", "1", SvcKind::Service);
    svc.args = vec!["/bin/sh".into(), "-c".into(), script.into()];
    svc.name = name.into();
    svc.runlevels = runlevels;
    svc
}

/// Enters `runlevel` and settles.
pub fn enter_runlevel(ctx: &mut InitCtx, runlevel: u8) {
    ctx.sm.request_runlevel(runlevel);
    sm::step(ctx);
}

/// Tears every fixture process down so tests leave no orphans behind.
pub fn shutdown(ctx: &mut InitCtx) {
    enter_runlevel(ctx, 9);
    wait_until(ctx, Duration::from_secs(10), |ctx| {
        ctx.table.iter().all(|(_, svc)| {
            !matches!(
                svc.state,
                SvcState::Running | SvcState::Stopping | SvcState::Waiting
            )
        })
    });
}
