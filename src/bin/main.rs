use std::{fs, path::PathBuf, process, str::FromStr};

use nix::{sys::signal::Signal, unistd::Uid};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use initg::{
    cli::{Cli, Commands, CondCommands, parse_args},
    constants::{
        COND_ASSERTED_DIR, COND_USR_DIR, EX_FAIL, EX_NOSUCHSVC, EX_OK, EX_SIGNAL,
        EX_USAGE,
    },
    ctx::{InitCtx, ShutdownIntent},
    error::ControlError,
    event::{self, EventLoop},
    ipc::{self, InitRequest, ReqCmd},
    runtime::{self, RuntimeMode},
};

fn init_tracing(cli: &Cli) {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::new(level.as_str()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn exit_for(err: &ControlError) -> i32 {
    match err {
        ControlError::Nack(message) if message.contains("no such service") => EX_NOSUCHSVC,
        ControlError::NotAvailable => {
            eprintln!("initg is not running");
            EX_FAIL
        }
        _ => EX_FAIL,
    }
}

fn send(request: InitRequest) -> i32 {
    match ipc::send_request(&request) {
        Ok(_) => EX_OK,
        Err(err) => {
            let code = exit_for(&err);
            if !matches!(err, ControlError::NotAvailable) {
                eprintln!("{err}");
            }
            code
        }
    }
}

fn parse_signal(raw: &str) -> Option<i32> {
    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number).ok().map(|s| s as i32);
    }
    let mut name = raw.to_ascii_uppercase();
    if !name.starts_with("SIG") {
        name = format!("SIG{name}");
    }
    Signal::from_str(&name).ok().map(|s| s as i32)
}

fn format_uptime(secs: u64) -> String {
    if secs >= 3600 {
        format!("{}h{}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

fn show_status(json: bool, filter: Option<&str>) -> i32 {
    let snapshot = match event::read_snapshot() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            eprintln!("no status available ({err}); is initg running?");
            return EX_FAIL;
        }
    };

    if json {
        match serde_json::to_string_pretty(&snapshot) {
            Ok(payload) => println!("{payload}"),
            Err(err) => {
                eprintln!("{err}");
                return EX_FAIL;
            }
        }
        return EX_OK;
    }

    println!("runlevel {} (previous {})", snapshot.runlevel, snapshot.previous);
    println!(
        "{:<20} {:<9} {:>7} {:>8} {:>8}  {}",
        "IDENT", "STATE", "PID", "UPTIME", "RESTARTS", "COMMAND"
    );
    let mut shown = 0;
    for svc in &snapshot.services {
        if let Some(filter) = filter
            && !svc.ident.eq_ignore_ascii_case(filter)
        {
            continue;
        }
        shown += 1;
        let state = if svc.crashed {
            "crashed"
        } else {
            svc.state.as_ref()
        };
        println!(
            "{:<20} {:<9} {:>7} {:>8} {:>8}  {}",
            svc.ident,
            state,
            svc.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            svc.uptime_secs
                .map(format_uptime)
                .unwrap_or_else(|| "-".into()),
            svc.total_restarts,
            svc.cmd,
        );
    }

    if filter.is_some() && shown == 0 {
        eprintln!("no such service");
        return EX_NOSUCHSVC;
    }
    EX_OK
}

fn show_ident(filter: Option<&str>) -> i32 {
    let snapshot = match event::read_snapshot() {
        Ok(snapshot) => snapshot,
        Err(err) => {
            eprintln!("no status available ({err}); is initg running?");
            return EX_FAIL;
        }
    };

    for svc in &snapshot.services {
        if let Some(filter) = filter
            && !svc.ident.to_lowercase().contains(&filter.to_lowercase())
        {
            continue;
        }
        println!("{}", svc.ident);
    }
    EX_OK
}

fn cond_path(name: &str) -> PathBuf {
    match name.strip_prefix("usr/") {
        Some(rest) => runtime::cond_dir().join(COND_USR_DIR).join(rest),
        None => runtime::cond_dir().join(COND_ASSERTED_DIR).join(name),
    }
}

fn usr_cond_path(name: &str) -> PathBuf {
    let trimmed = name.strip_prefix("usr/").unwrap_or(name);
    runtime::cond_dir().join(COND_USR_DIR).join(trimmed)
}

fn list_conds(dir: &PathBuf, prefix: &str, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if path.is_dir() {
            list_conds(&path, &format!("{prefix}{name}/"), out);
        } else {
            out.push(format!("{prefix}{name}"));
        }
    }
}

fn run_cond(command: CondCommands) -> i32 {
    match command {
        CondCommands::Show | CondCommands::Dump => {
            let mut names = Vec::new();
            list_conds(
                &runtime::cond_dir().join(COND_ASSERTED_DIR),
                "",
                &mut names,
            );
            list_conds(&runtime::cond_dir().join(COND_USR_DIR), "usr/", &mut names);
            names.sort();
            for name in names {
                println!("on\t{name}");
            }
            EX_OK
        }
        CondCommands::Get { name } => {
            if cond_path(&name).exists() {
                println!("on");
                EX_OK
            } else {
                println!("off");
                EX_FAIL
            }
        }
        CondCommands::Set { name } => {
            let path = usr_cond_path(&name);
            if let Some(parent) = path.parent()
                && let Err(err) = fs::create_dir_all(parent)
            {
                eprintln!("{err}");
                return EX_FAIL;
            }
            if let Err(err) = fs::write(&path, b"") {
                eprintln!("{err}");
                return EX_FAIL;
            }
            // Poke the supervisor so dependents re-evaluate.
            let _ = ipc::send_request(&InitRequest::new(ReqCmd::Reload));
            EX_OK
        }
        CondCommands::Clear { name } => {
            let path = usr_cond_path(&name);
            if let Err(err) = fs::remove_file(&path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                eprintln!("{err}");
                return EX_FAIL;
            }
            let _ = ipc::send_request(&InitRequest::new(ReqCmd::Reload));
            EX_OK
        }
    }
}

fn run_supervisor(conf_dir: Option<PathBuf>, runlevel: u8) -> i32 {
    let mut ctx = match InitCtx::new() {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("cannot initialize runtime state: {err}");
            return EX_FAIL;
        }
    };

    let conf_dir = conf_dir.unwrap_or_else(runtime::conf_dir);
    if conf_dir.is_dir() {
        ctx.conf_dir = Some(conf_dir);
    } else {
        warn!("configuration directory {:?} missing; starting empty", conf_dir);
    }

    let mut event_loop = match EventLoop::new(ctx, runlevel) {
        Ok(event_loop) => event_loop,
        Err(err) => {
            error!("cannot start event loop: {err}");
            return EX_FAIL;
        }
    };

    match event_loop.run() {
        Ok(intent) => {
            match intent {
                ShutdownIntent::Halt => info!("system halt requested"),
                ShutdownIntent::Reboot => info!("system reboot requested"),
                ShutdownIntent::Poweroff => info!("system poweroff requested"),
                ShutdownIntent::Suspend => info!("system suspend requested"),
            }
            if runtime::mode() == RuntimeMode::System {
                // The actual reboot(2) call is left to the surrounding
                // system integration; PID 1 exiting here would panic the
                // kernel, so log loudly instead.
                warn!("running as system init; shutdown hand-off not implemented");
            }
            EX_OK
        }
        Err(err) => {
            error!("event loop failed: {err}");
            EX_FAIL
        }
    }
}

fn main() {
    let cli = parse_args();
    init_tracing(&cli);

    if cli.sys {
        if !Uid::effective().is_root() {
            eprintln!("--sys requires root privileges");
            process::exit(EX_USAGE);
        }
        runtime::init(RuntimeMode::System);
    } else {
        runtime::init(RuntimeMode::User);
    }

    let code = match cli.command {
        Commands::Up { conf_dir, runlevel } => {
            if runlevel > 9 {
                eprintln!("invalid runlevel {runlevel}");
                process::exit(EX_USAGE);
            }
            run_supervisor(conf_dir, runlevel)
        }

        Commands::Status { json, service } => show_status(json, service.as_deref()),

        Commands::Start { name } => send(InitRequest::for_service(ReqCmd::StartSvc, &name)),
        Commands::Stop { name } => send(InitRequest::for_service(ReqCmd::StopSvc, &name)),
        Commands::Restart { name } => {
            send(InitRequest::for_service(ReqCmd::RestartSvc, &name))
        }

        Commands::Reload { name } => match name {
            Some(name) => send(InitRequest::for_service(ReqCmd::ReloadSvc, &name)),
            None => send(InitRequest::new(ReqCmd::Reload)),
        },

        Commands::Signal { name, signal } => match parse_signal(&signal) {
            Some(signo) => {
                let mut request = InitRequest::for_service(ReqCmd::Signal, &name);
                request.runlevel = signo as u8;
                send(request)
            }
            None => {
                eprintln!("invalid signal '{signal}'");
                EX_SIGNAL
            }
        },

        Commands::Query { name } => send(InitRequest::for_service(ReqCmd::SvcQuery, &name)),

        Commands::Runlevel { level } => match level {
            Some(level) if level > 9 => {
                eprintln!("invalid runlevel {level}");
                EX_USAGE
            }
            Some(level) => {
                let mut request = InitRequest::new(ReqCmd::SetRunlevel);
                request.runlevel = level;
                send(request)
            }
            None => match ipc::send_request(&InitRequest::new(ReqCmd::GetRunlevel)) {
                Ok(reply) => {
                    // No previous level recorded yet (still 0/S) prints N.
                    let previous = if reply.sleeptime == 0 || reply.sleeptime > 9 {
                        "N".to_string()
                    } else {
                        reply.sleeptime.to_string()
                    };
                    println!("{previous} {}", reply.runlevel);
                    EX_OK
                }
                Err(err) => exit_for(&err),
            },
        },

        Commands::Cond { command } => run_cond(command),
        Commands::Ident { name } => show_ident(name.as_deref()),

        Commands::Halt => send(InitRequest::new(ReqCmd::Halt)),
        Commands::Reboot => send(InitRequest::new(ReqCmd::Reboot)),
        Commands::Poweroff => send(InitRequest::new(ReqCmd::Poweroff)),
        Commands::Suspend => send(InitRequest::new(ReqCmd::Suspend)),
        Commands::Debug => send(InitRequest::new(ReqCmd::DebugToggle)),
    };

    process::exit(code);
}
