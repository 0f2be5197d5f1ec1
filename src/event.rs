//! Single-threaded cooperative event loop.
//!
//! Every mutation of the service table, the condition store and the global
//! state machine happens on this loop. Registered sources: a signalfd
//! (SIGCHLD and the operator signals), the netlink socket, the control
//! listener, and the per-service timer queue. SIGCHLD is drained before
//! the table steps so PID-based decisions always see the latest exit.

use std::{
    fs, io,
    os::fd::AsFd,
    os::unix::net::{UnixListener, UnixStream},
    time::Instant,
};

use chrono::{DateTime, Utc};
use nix::{
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::{
        signal::{SigSet, Signal},
        signalfd::{SfdFlags, SignalFd},
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    conf,
    constants::SNAPSHOT_FILE_NAME,
    ctx::{InitCtx, ShutdownIntent, TimerKind},
    error::{ControlError, InitError},
    ipc::{self, InitRequest, ReqCmd},
    netlink::Netlink,
    runtime, service, sm,
    svc::{BlockReason, Dirty, ExitInfo, SvcKind, SvcState},
};

/// Snapshot of one service, persisted for the status client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvcSnapshot {
    /// `name` or `name:id`.
    pub ident: String,
    /// Command path.
    pub cmd: String,
    /// Unit kind.
    pub kind: SvcKind,
    /// Supervision state.
    pub state: SvcState,
    /// Live PID, if any.
    pub pid: Option<i32>,
    /// Seconds since the current incarnation started.
    pub uptime_secs: Option<u64>,
    /// Respawns in the current crash episode.
    pub restart_cnt: u8,
    /// Lifetime respawn total.
    pub total_restarts: u32,
    /// Abandoned after exceeding the respawn budget.
    pub crashed: bool,
    /// Most recent collected exit.
    pub last_exit: Option<ExitInfo>,
    /// Description from the configuration.
    pub desc: String,
}

/// Persisted table snapshot, written after every settle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Active runlevel.
    pub runlevel: u8,
    /// Runlevel before the most recent change.
    pub previous: u8,
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
    /// Per-service rows.
    pub services: Vec<SvcSnapshot>,
}

/// Builds the current snapshot from the live table.
pub fn collect_snapshot(ctx: &InitCtx) -> Snapshot {
    let services = ctx
        .table
        .iter()
        .map(|(_, svc)| SvcSnapshot {
            ident: svc.ident(),
            cmd: svc.cmd.display().to_string(),
            kind: svc.kind,
            state: svc.state,
            pid: svc.pid,
            uptime_secs: svc.started_at.map(|at| at.elapsed().as_secs()),
            restart_cnt: svc.restart_cnt,
            total_restarts: svc.total_restarts,
            crashed: svc.block == BlockReason::Crashing,
            last_exit: svc.last_exit,
            desc: svc.desc.clone(),
        })
        .collect();

    Snapshot {
        runlevel: ctx.sm.runlevel(),
        previous: ctx.sm.previous_runlevel(),
        generated_at: Utc::now(),
        services,
    }
}

/// Writes the snapshot where the status client looks for it.
pub fn write_snapshot(ctx: &InitCtx) -> io::Result<()> {
    let path = runtime::state_dir().join(SNAPSHOT_FILE_NAME);
    let snapshot = collect_snapshot(ctx);
    let payload = serde_json::to_vec_pretty(&snapshot)?;
    fs::write(path, payload)
}

/// Reads the persisted snapshot; used by the status client.
pub fn read_snapshot() -> io::Result<Snapshot> {
    let path = runtime::state_dir().join(SNAPSHOT_FILE_NAME);
    let contents = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

/// Handles one control request against the core state. Pure with respect to
/// I/O: the caller owns the socket.
pub fn handle_request(ctx: &mut InitCtx, request: &InitRequest) -> InitRequest {
    debug!("control request: {:?} '{}'", request.cmd, request.data);

    match request.cmd {
        ReqCmd::GetRunlevel => {
            let mut reply = request.ack();
            reply.runlevel = ctx.sm.runlevel();
            reply.sleeptime = ctx.sm.previous_runlevel();
            reply
        }

        ReqCmd::SetRunlevel => {
            if request.runlevel > 9 {
                return request.nack(format!("invalid runlevel {}", request.runlevel));
            }
            match request.runlevel {
                0 => ctx.sm.set_shutdown_hint(ShutdownIntent::Halt),
                6 => ctx.sm.set_shutdown_hint(ShutdownIntent::Reboot),
                _ => {}
            }
            ctx.sm.request_runlevel(request.runlevel);
            sm::step(ctx);
            let mut reply = request.ack();
            reply.runlevel = ctx.sm.runlevel();
            reply.sleeptime = ctx.sm.previous_runlevel();
            reply
        }

        ReqCmd::Reload => {
            ctx.sm.request_reload();
            sm::step(ctx);
            request.ack()
        }

        ReqCmd::DebugToggle => {
            ctx.debug = !ctx.debug;
            info!("debug {}", if ctx.debug { "enabled" } else { "disabled" });
            let mut reply = request.ack();
            reply.data = if ctx.debug { "on" } else { "off" }.to_string();
            reply
        }

        ReqCmd::SvcQuery => {
            if ctx.table.find_matching(&request.data).is_empty() {
                request.nack("no such service")
            } else {
                request.ack()
            }
        }

        ReqCmd::StartSvc => {
            let matches = ctx.table.find_matching(&request.data);
            if matches.is_empty() {
                return request.nack("no such service");
            }
            for id in matches {
                if let Some(svc) = ctx.table.get_mut(id) {
                    svc.manual = false;
                    if matches!(svc.block, BlockReason::Crashing | BlockReason::Missing) {
                        svc.block = BlockReason::None;
                        svc.restart_cnt = 0;
                    }
                }
                service::step(ctx, id);
            }
            request.ack()
        }

        ReqCmd::StopSvc => {
            let matches = ctx.table.find_matching(&request.data);
            if matches.is_empty() {
                return request.nack("no such service");
            }
            for id in matches {
                if let Some(svc) = ctx.table.get_mut(id) {
                    svc.manual = true;
                }
                service::step(ctx, id);
            }
            request.ack()
        }

        ReqCmd::RestartSvc => {
            let matches = ctx.table.find_matching(&request.data);
            if matches.is_empty() {
                return request.nack("no such service");
            }
            for id in matches {
                if let Some(svc) = ctx.table.get_mut(id) {
                    svc.manual = false;
                    if matches!(svc.block, BlockReason::Crashing | BlockReason::Missing) {
                        svc.block = BlockReason::None;
                    }
                    svc.restart_cnt = 0;
                }
                service::stop(ctx, id);
                service::step(ctx, id);
            }
            request.ack()
        }

        ReqCmd::ReloadSvc => {
            let matches = ctx.table.find_matching(&request.data);
            if matches.is_empty() {
                return request.nack("no such service");
            }
            for id in matches {
                if let Some(svc) = ctx.table.get_mut(id) {
                    svc.dirty = Dirty::Changed;
                }
                service::step(ctx, id);
            }
            request.ack()
        }

        ReqCmd::Signal => {
            let matches = ctx.table.find_matching(&request.data);
            if matches.is_empty() {
                return request.nack("no such service");
            }
            for id in matches {
                if let Err(err) = service::signal_service(ctx, id, request.runlevel as i32)
                {
                    return request.nack(err.to_string());
                }
            }
            request.ack()
        }

        ReqCmd::Halt => {
            ctx.sm.set_shutdown_hint(ShutdownIntent::Halt);
            ctx.sm.request_runlevel(0);
            sm::step(ctx);
            request.ack()
        }

        ReqCmd::Poweroff => {
            ctx.sm.set_shutdown_hint(ShutdownIntent::Poweroff);
            ctx.sm.request_runlevel(0);
            sm::step(ctx);
            request.ack()
        }

        ReqCmd::Reboot => {
            ctx.sm.set_shutdown_hint(ShutdownIntent::Reboot);
            ctx.sm.request_runlevel(6);
            sm::step(ctx);
            request.ack()
        }

        ReqCmd::Suspend => {
            ctx.shutdown = Some(ShutdownIntent::Suspend);
            request.ack()
        }

        ReqCmd::Ack | ReqCmd::Nack => request.nack("unknown command"),
    }
}

/// The resident event loop.
pub struct EventLoop {
    /// The init context; public so the binary can seed descriptors.
    pub ctx: InitCtx,
    sigfd: SignalFd,
    listener: UnixListener,
    netlink: Option<Netlink>,
    target_runlevel: u8,
    bootstrap_done: bool,
}

impl EventLoop {
    /// Binds the control socket, routes signals into a signalfd and
    /// subscribes to kernel events.
    pub fn new(ctx: InitCtx, target_runlevel: u8) -> Result<Self, InitError> {
        ipc::cleanup_runtime()?;
        let socket_path = ipc::socket_path()?;
        if socket_path.exists() {
            fs::remove_file(&socket_path).map_err(ControlError::Io)?;
        }
        let listener = UnixListener::bind(&socket_path).map_err(ControlError::Io)?;
        listener.set_nonblocking(true).map_err(ControlError::Io)?;
        ipc::write_supervisor_pid(unsafe { libc::getpid() })?;

        let mut mask = SigSet::empty();
        for signal in [
            Signal::SIGCHLD,
            Signal::SIGHUP,
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGUSR1,
            Signal::SIGUSR2,
            Signal::SIGPWR,
        ] {
            mask.add(signal);
        }
        mask.thread_block()?;
        let sigfd = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;

        let netlink = match Netlink::open() {
            Ok(netlink) => Some(netlink),
            Err(err) => {
                warn!("netlink unavailable, network conditions disabled: {err}");
                None
            }
        };

        info!("initg listening on {:?}", socket_path);
        Ok(Self {
            ctx,
            sigfd,
            listener,
            netlink,
            target_runlevel,
            bootstrap_done: false,
        })
    }

    /// Runs until a shutdown intent is reached. Seeds network conditions,
    /// steps the table to its first fixed point, then multiplexes events.
    pub fn run(&mut self) -> Result<ShutdownIntent, InitError> {
        if let Some(netlink) = &mut self.netlink {
            netlink.resync(&mut self.ctx, true);
        }
        if let Some(dir) = self.ctx.conf_dir.clone() {
            conf::load_dir(&mut self.ctx, &dir);
        }
        service::step_all(&mut self.ctx);
        sm::step(&mut self.ctx);
        self.settle();

        let intent = loop {
            if let Some(intent) = self.ctx.shutdown {
                break intent;
            }
            self.maybe_leave_bootstrap();

            let timeout = match self.ctx.timers.next_timeout(Instant::now()) {
                Some(delta) => PollTimeout::try_from(delta.as_millis().min(60_000) as i32)
                    .unwrap_or(PollTimeout::MAX),
                None => PollTimeout::NONE,
            };

            let (sig_ready, ctl_ready, net_ready) = {
                let mut fds = Vec::with_capacity(3);
                fds.push(PollFd::new(self.sigfd.as_fd(), PollFlags::POLLIN));
                fds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
                if let Some(netlink) = &self.netlink {
                    fds.push(PollFd::new(netlink.fd(), PollFlags::POLLIN));
                }

                match poll(&mut fds, timeout) {
                    Ok(_) => (
                        fds[0].any().unwrap_or(false),
                        fds[1].any().unwrap_or(false),
                        fds.get(2).map(|fd| fd.any().unwrap_or(false)).unwrap_or(false),
                    ),
                    Err(nix::errno::Errno::EINTR) => (false, false, false),
                    Err(err) => return Err(err.into()),
                }
            };

            if sig_ready {
                self.drain_signals();
            }
            if net_ready
                && let Some(netlink) = &mut self.netlink
            {
                netlink.handle_ready(&mut self.ctx);
            }
            if ctl_ready {
                self.drain_control();
            }
            self.fire_timers();

            if self.ctx.step_pending {
                service::step_all(&mut self.ctx);
                sm::step(&mut self.ctx);
            }
            self.settle();
        };

        ipc::cleanup_runtime()?;
        Ok(intent)
    }

    /// Switches from bootstrap to the configured runlevel once all
    /// bootstrap run/tasks have completed.
    fn maybe_leave_bootstrap(&mut self) {
        if self.bootstrap_done
            || self.ctx.sm.runlevel() != 0
            || self.ctx.sm.state() != sm::SmState::Idle
        {
            return;
        }
        // Daemons allowed in S keep running across the switch; only the
        // bootstrap run/tasks gate the promotion.
        if !service::completed(&self.ctx) {
            return;
        }

        self.bootstrap_done = true;
        info!("bootstrap complete, entering runlevel {}", self.target_runlevel);
        self.ctx.sm.request_runlevel(self.target_runlevel);
        sm::step(&mut self.ctx);
    }

    fn drain_signals(&mut self) {
        loop {
            match self.sigfd.read_signal() {
                Ok(Some(siginfo)) => {
                    let signal = Signal::try_from(siginfo.ssi_signo as i32);
                    match signal {
                        Ok(Signal::SIGCHLD) => {
                            service::reap(&mut self.ctx);
                        }
                        Ok(Signal::SIGHUP) => {
                            info!("SIGHUP: reloading configuration");
                            self.ctx.sm.request_reload();
                            sm::step(&mut self.ctx);
                        }
                        Ok(Signal::SIGTERM) | Ok(Signal::SIGUSR1) => {
                            self.ctx.sm.set_shutdown_hint(ShutdownIntent::Halt);
                            self.ctx.sm.request_runlevel(0);
                            sm::step(&mut self.ctx);
                        }
                        Ok(Signal::SIGUSR2) | Ok(Signal::SIGPWR) => {
                            self.ctx.sm.set_shutdown_hint(ShutdownIntent::Poweroff);
                            self.ctx.sm.request_runlevel(0);
                            sm::step(&mut self.ctx);
                        }
                        Ok(Signal::SIGINT) => {
                            self.ctx.sm.set_shutdown_hint(ShutdownIntent::Reboot);
                            self.ctx.sm.request_runlevel(6);
                            sm::step(&mut self.ctx);
                        }
                        Ok(other) => debug!("ignoring signal {other:?}"),
                        Err(_) => {}
                    }
                }
                Ok(None) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => {
                    warn!("signalfd read failed: {err}");
                    break;
                }
            }
        }
    }

    fn drain_control(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.serve_client(stream),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("control listener error: {err}");
                    break;
                }
            }
        }
    }

    fn serve_client(&mut self, mut stream: UnixStream) {
        let _ = stream.set_nonblocking(false);
        match ipc::read_request(&mut stream) {
            Ok(request) => {
                let reply = handle_request(&mut self.ctx, &request);
                if let Err(err) = ipc::write_reply(&mut stream, &reply) {
                    error!("failed to write control reply: {err}");
                }
            }
            Err(err) => {
                warn!("invalid control request: {err}");
                let nack = InitRequest {
                    data: err.to_string(),
                    ..InitRequest::new(ReqCmd::Nack)
                };
                let _ = ipc::write_reply(&mut stream, &nack);
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some((id, kind)) = self.ctx.timers.pop_due(now) {
            match kind {
                TimerKind::Retry => service::retry(&mut self.ctx, id),
                TimerKind::Kill => service::kill_timeout(&mut self.ctx, id),
            }
        }
    }

    fn settle(&mut self) {
        if let Err(err) = write_snapshot(&self.ctx) {
            warn!("failed writing status snapshot: {err}");
        }
    }
}
