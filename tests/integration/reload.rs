//! Reload scenarios: SIGHUP-reloadable services, stop/start restarts,
//! removal sweeps and the reconfiguration marker.

#[path = "common/mod.rs"]
mod common;

use std::{fs, time::Duration};

use common::{HomeEnvGuard, enter_runlevel, shell_daemon, sleeper, turn, wait_until};
use initg::{
    cond::CondExpr,
    conf,
    ctx::InitCtx,
    sm,
    svc::{Dirty, SvcState},
};
use tempfile::tempdir;

#[test]
fn dirty_sighup_service_gets_exactly_one_sighup() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let hup_log = temp.path().join("hups");
    let script = format!(
        "trap 'echo hup >> {}' HUP; while :; do sleep 0.1; done",
        hup_log.display()
    );
    let mut svc = shell_daemon("foo", 0b100, &script);
    svc.sighup = true;
    let id = ctx.register(svc);

    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(id).unwrap().state == SvcState::Running
    }));
    let pid = ctx.table.get(id).unwrap().pid.unwrap();

    // Mark it dirty, then reload.
    ctx.table.get_mut(id).unwrap().dirty = Dirty::Changed;
    ctx.sm.request_reload();
    sm::step(&mut ctx);

    // The descriptor is clean again, the PID unchanged, and exactly one
    // SIGHUP was delivered.
    assert_eq!(ctx.table.get(id).unwrap().dirty, Dirty::Clean);
    assert_eq!(ctx.table.get(id).unwrap().pid, Some(pid));
    assert_eq!(ctx.table.get(id).unwrap().state, SvcState::Running);

    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |_| hup_log.exists()),
        "the trap should have logged the SIGHUP"
    );
    // Give a straggler a moment to prove it doesn't exist.
    std::thread::sleep(Duration::from_millis(300));
    turn(&mut ctx);
    let hups = fs::read_to_string(&hup_log).expect("hup log");
    assert_eq!(hups.lines().count(), 1, "exactly one SIGHUP per dirty->clean");
    assert_eq!(ctx.table.get(id).unwrap().pid, Some(pid));

    common::shutdown(&mut ctx);
}

#[test]
fn dirty_non_reloadable_service_is_restarted() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let id = ctx.register(sleeper("plain", 0b100));
    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(id).unwrap().state == SvcState::Running
    }));
    let old_pid = ctx.table.get(id).unwrap().pid.unwrap();

    ctx.table.get_mut(id).unwrap().dirty = Dirty::Changed;
    ctx.sm.request_reload();
    sm::step(&mut ctx);

    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            let svc = ctx.table.get(id).unwrap();
            svc.state == SvcState::Running && svc.pid.is_some() && svc.pid != Some(old_pid)
        }),
        "non-reloadable dirty service should be stopped and started"
    );
    assert_eq!(ctx.table.get(id).unwrap().dirty, Dirty::Clean);

    common::shutdown(&mut ctx);
}

#[test]
fn clean_running_services_survive_a_reload_untouched() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    // A is clean; B depends on A through pid/a.
    let a = ctx.register(sleeper("a", 0b100));
    let mut b = sleeper("b", 0b100);
    b.cond = CondExpr::parse("pid/a");
    let b = ctx.register(b);

    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(a).unwrap().state == SvcState::Running
            && ctx.table.get(b).unwrap().state == SvcState::Running
    }));
    let a_pid = ctx.table.get(a).unwrap().pid.unwrap();
    let b_pid = ctx.table.get(b).unwrap().pid.unwrap();

    ctx.sm.request_reload();
    sm::step(&mut ctx);
    turn(&mut ctx);

    // Neither service was disturbed: the marker bump put pid/a into FLUX
    // but the reload path reasserted it for the clean, running service.
    assert_eq!(ctx.table.get(a).unwrap().pid, Some(a_pid));
    assert_eq!(ctx.table.get(b).unwrap().pid, Some(b_pid));
    assert_eq!(ctx.table.get(a).unwrap().state, SvcState::Running);
    assert_eq!(ctx.table.get(b).unwrap().state, SvcState::Running);

    common::shutdown(&mut ctx);
}

#[test]
fn services_dropped_from_config_are_swept_after_reload() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let conf_dir = temp.path().join("conf");
    fs::create_dir_all(&conf_dir).expect("conf dir");
    fs::write(
        conf_dir.join("init.conf"),
        "service [2345] :1 name:keeper /bin/sleep 3600 -- stays\n\
         service [2345] :2 name:goner /bin/sleep 3600 -- goes away\n",
    )
    .expect("write conf");
    ctx.conf_dir = Some(conf_dir.clone());

    conf::load_dir(&mut ctx, &conf_dir);
    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.len() == 2
            && ctx.table.iter().all(|(_, svc)| svc.state == SvcState::Running)
    }));

    fs::write(
        conf_dir.join("init.conf"),
        "service [2345] :1 name:keeper /bin/sleep 3600 -- stays\n",
    )
    .expect("rewrite conf");
    ctx.sm.request_reload();
    sm::step(&mut ctx);

    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            ctx.table.len() == 1
        }),
        "the dropped service should be stopped and unregistered"
    );
    let (_, survivor) = ctx.table.iter().next().expect("one survivor");
    assert_eq!(survivor.name, "keeper");
    assert_eq!(survivor.state, SvcState::Running);

    common::shutdown(&mut ctx);
}

#[test]
fn reload_starts_services_added_to_config() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let conf_dir = temp.path().join("conf");
    fs::create_dir_all(&conf_dir).expect("conf dir");
    fs::write(
        conf_dir.join("init.conf"),
        "service [2345] :1 name:first /bin/sleep 3600 -- first\n",
    )
    .expect("write conf");
    ctx.conf_dir = Some(conf_dir.clone());

    conf::load_dir(&mut ctx, &conf_dir);
    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.len() == 1
            && ctx.table.iter().all(|(_, svc)| svc.state == SvcState::Running)
    }));

    fs::write(
        conf_dir.join("init.conf"),
        "service [2345] :1 name:first /bin/sleep 3600 -- first\n\
         service [2345] :2 name:second /bin/sleep 3600 -- second\n",
    )
    .expect("rewrite conf");
    ctx.sm.request_reload();
    sm::step(&mut ctx);

    assert!(
        wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
            ctx.table.len() == 2
                && ctx.table.iter().all(|(_, svc)| svc.state == SvcState::Running)
        }),
        "the new service should be registered and started"
    );

    common::shutdown(&mut ctx);
}

#[test]
fn runlevel_change_reruns_tasks() {
    let temp = tempdir().expect("tempdir");
    let _home = HomeEnvGuard::set(temp.path());
    let mut ctx = InitCtx::new().expect("ctx");

    let mut svc = initg::svc::Svc::new("/bin/true", "1", initg::svc::SvcKind::Task);
    svc.runlevels = 0b1100; // runlevels 2 and 3
    let id = ctx.register(svc);

    enter_runlevel(&mut ctx, 2);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        ctx.table.get(id).unwrap().state == SvcState::Done
    }));
    assert_eq!(ctx.table.get(id).unwrap().once, 1);

    // Changing runlevel clears the once counter and re-runs the task.
    enter_runlevel(&mut ctx, 3);
    assert!(wait_until(&mut ctx, Duration::from_secs(5), |ctx| {
        let svc = ctx.table.get(id).unwrap();
        svc.state == SvcState::Done && svc.once == 1
    }));
}
