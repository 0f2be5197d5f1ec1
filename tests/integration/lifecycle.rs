//! Service lifecycle scenarios: runlevel gating, one-shot completion,
//! crash-restart backoff and stop escalation.

#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::{HomeEnvGuard, enter_runlevel, shell_daemon, sleeper, turn, wait_until};
use initg::{
    constants::RESPAWN_MAX,
    ctx::InitCtx,
    service,
    svc::{BlockReason, Svc, SvcKind, SvcState},
};
use tempfile::tempdir;

fn svc_state(ctx: &InitCtx, id: initg::svc::SvcId) -> SvcState {
    ctx.table.get(id).expect("service registered").state
}

#[test]
fn runlevel_gates_a_daemon_through_its_lifecycle() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    // service /bin/sleep 3600 -- nap, allowed in [2345]
    let id = ctx.register(sleeper("nap", 0b0011_1100));
    turn(&mut ctx);
    assert_eq!(svc_state(&ctx, id), SvcState::Halted, "nothing runs at bootstrap");

    enter_runlevel(&mut ctx, 2);
    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            let svc = ctx.table.get(id).unwrap();
            svc.state == SvcState::Running && svc.pid.is_some()
        }),
        "service should reach RUNNING with a live PID in runlevel 2"
    );
    let pid = ctx.table.get(id).unwrap().pid.unwrap();

    // Still allowed in runlevel 3: keeps running, same incarnation.
    enter_runlevel(&mut ctx, 3);
    turn(&mut ctx);
    assert_eq!(svc_state(&ctx, id), SvcState::Running);
    assert_eq!(ctx.table.get(id).unwrap().pid, Some(pid));

    // Runlevel 1 excludes it: the service is torn down.
    enter_runlevel(&mut ctx, 1);
    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            ctx.table.get(id).unwrap().state == SvcState::Halted
        }),
        "service should reach HALTED after leaving its runlevels"
    );
    assert_eq!(ctx.table.get(id).unwrap().pid, None);
}

#[test]
fn run_kind_completes_with_recorded_status() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    // run /bin/false -- fail, at bootstrap.
    let mut svc = Svc::new("/bin/false", "1", SvcKind::Run);
    svc.runlevels = 0b1;
    let id = ctx.register(svc);

    assert!(!service::completed(&ctx));
    turn(&mut ctx);

    let svc = ctx.table.get(id).expect("still registered");
    assert_eq!(svc.state, SvcState::Done);
    assert_eq!(svc.once, 1);
    let exit = svc.last_exit.expect("exit status recorded");
    assert_eq!(exit.code, Some(1));
    assert!(service::completed(&ctx));
}

#[test]
fn task_kind_runs_in_parallel_and_reaches_done() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let mut svc = Svc::new("/bin/true", "1", SvcKind::Task);
    svc.runlevels = 0b1;
    let id = ctx.register(svc);

    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            ctx.table.get(id).is_none_or(|svc| svc.state == SvcState::Done)
        }),
        "task should complete"
    );
    if let Some(svc) = ctx.table.get(id) {
        assert_eq!(svc.last_exit.and_then(|e| e.code), Some(0));
    }
}

#[test]
fn crashed_daemon_is_restarted_and_counter_resets() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let id = ctx.register(sleeper("crashy", 0b100));
    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(id).unwrap().pid.is_some()
    }));
    let first_pid = ctx.table.get(id).unwrap().pid.unwrap();

    // Kill it from outside; the supervisor must notice and restart it.
    unsafe {
        libc::kill(first_pid, libc::SIGKILL);
    }
    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            let svc = ctx.table.get(id).unwrap();
            svc.state == SvcState::Running && svc.pid.is_some() && svc.pid != Some(first_pid)
        }),
        "service should be respawned with a fresh PID"
    );
    assert_eq!(ctx.table.get(id).unwrap().restart_cnt, 1);

    // The pending backoff tick observes a healthy service and resets the
    // counter.
    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            ctx.table.get(id).unwrap().restart_cnt == 0
        }),
        "restart counter should reset once the service survives"
    );
    assert_eq!(svc_state(&ctx, id), SvcState::Running);

    common::shutdown(&mut ctx);
}

#[test]
fn exceeding_the_respawn_budget_abandons_the_service() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let id = ctx.register(sleeper("doomed", 0b100));
    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(id).unwrap().pid.is_some()
    }));
    let pid = ctx.table.get(id).unwrap().pid.unwrap();

    // Simulate a crash storm that already burned the whole budget.
    {
        let svc = ctx.table.get_mut(id).unwrap();
        svc.restart_cnt = RESPAWN_MAX;
    }
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        let svc = ctx.table.get(id).unwrap();
        svc.state == SvcState::Halted && svc.block == BlockReason::Restarting
    }));

    // The armed retry tick sees the exhausted budget and gives up.
    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            ctx.table.get(id).unwrap().block == BlockReason::Crashing
        }),
        "service should be marked crashing after the budget is exhausted"
    );
    assert_eq!(svc_state(&ctx, id), SvcState::Halted);
    assert_eq!(ctx.table.get(id).unwrap().pid, None);
}

#[test]
fn sigterm_ignorers_are_escalated_to_sigkill() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let id = ctx.register(shell_daemon(
        "stubborn",
        0b100,
        "trap '' TERM; while :; do sleep 0.2; done",
    ));
    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(id).unwrap().pid.is_some()
    }));

    // Leaving the runlevel sends SIGTERM, which the child ignores; the
    // watchdog must finish the job within the grace period.
    enter_runlevel(&mut ctx, 1);
    turn(&mut ctx);
    assert_eq!(svc_state(&ctx, id), SvcState::Stopping);

    assert!(
        wait_until(&mut ctx, Duration::from_secs(8), |ctx| {
            ctx.table.get(id).unwrap().state == SvcState::Halted
        }),
        "service should reach HALTED within the termination timeout"
    );
    let exit = ctx.table.get(id).unwrap().last_exit.expect("exit recorded");
    assert_eq!(exit.signal, Some(libc::SIGKILL));
}

#[test]
fn missing_binary_marks_the_service_instead_of_spinning() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let mut svc = Svc::new("/no/such/binary", "1", SvcKind::Service);
    svc.runlevels = 0b100;
    svc.name = "ghost".into();
    let id = ctx.register(svc);

    enter_runlevel(&mut ctx, 2);
    turn(&mut ctx);

    let svc = ctx.table.get(id).unwrap();
    assert_eq!(svc.block, BlockReason::Missing);
    assert_eq!(svc.state, SvcState::Halted);
    assert_eq!(svc.pid, None);
}

#[test]
fn manual_services_wait_for_an_explicit_start() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let mut svc = sleeper("standby", 0b100);
    svc.manual = true;
    let id = ctx.register(svc);

    enter_runlevel(&mut ctx, 2);
    turn(&mut ctx);
    assert_eq!(svc_state(&ctx, id), SvcState::Halted);

    // An explicit start clears the manual latch.
    ctx.table.get_mut(id).unwrap().manual = false;
    ctx.schedule_step();
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(id).unwrap().state == SvcState::Running
    }));

    enter_runlevel(&mut ctx, 1);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(id).unwrap().state == SvcState::Halted
    }));
}
