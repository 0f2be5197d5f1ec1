//! Child stdio routing.
//!
//! Services may run silent (`null`), on the console, or with their output
//! shipped line-by-line to a file or syslog. The file/syslog sinks open a
//! pseudo-terminal and fork a grandchild that execs the log shipper reading
//! the slave side; the service gets the master duped over stdout/stderr. A
//! PTY (not a pipe) keeps the stream line-flushed without the child opting
//! in to unbuffered output.

use std::{
    ffi::CString,
    fs::{File, OpenOptions},
    os::fd::{AsRawFd, IntoRawFd, RawFd},
    path::PathBuf,
};

use nix::{
    fcntl::OFlag,
    pty::{grantpt, posix_openpt, ptsname_r, unlockpt},
    unistd::{ForkResult, dup2, execvp, fork},
};

use crate::{constants::LOG_SHIPPER, runtime, svc::LogSink};

const STDIN_FILENO: RawFd = 0;
const STDOUT_FILENO: RawFd = 1;
const STDERR_FILENO: RawFd = 2;

/// Canonical log file path for a service routed to `log:file` without an
/// explicit path.
pub fn default_log_path(ident: &str) -> PathBuf {
    runtime::log_dir().join(format!("{ident}.log"))
}

fn redirect_null() {
    if let Ok(file) = OpenOptions::new().write(true).open("/dev/null") {
        let raw = file.into_raw_fd();
        let _ = dup2(raw, STDOUT_FILENO);
        let _ = dup2(raw, STDERR_FILENO);
    }
}

fn shipper_args(sink: &LogSink, tag_default: &str) -> Vec<CString> {
    let mut args: Vec<String> = vec![LOG_SHIPPER.to_string()];
    match sink {
        LogSink::File(path) => {
            args.push("-f".into());
            args.push(path.display().to_string());
        }
        LogSink::Syslog { tag, prio } => {
            args.push("-t".into());
            args.push(if tag.is_empty() {
                tag_default.to_string()
            } else {
                tag.clone()
            });
            args.push("-p".into());
            args.push(if prio.is_empty() {
                "daemon.info".to_string()
            } else {
                prio.clone()
            });
        }
        _ => {}
    }
    args.into_iter()
        .filter_map(|a| CString::new(a).ok())
        .collect()
}

fn route_via_pty(sink: &LogSink, tag_default: &str) {
    let Ok(master) = posix_openpt(OFlag::O_RDWR) else {
        redirect_null();
        return;
    };
    if grantpt(&master).is_err() || unlockpt(&master).is_err() {
        redirect_null();
        return;
    }
    let Ok(slave_path) = ptsname_r(&master) else {
        redirect_null();
        return;
    };

    let args = shipper_args(sink, tag_default);
    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            // Grandchild: read the slave side, feed the shipper.
            match File::open(&slave_path) {
                Ok(slave) => {
                    let _ = dup2(slave.into_raw_fd(), STDIN_FILENO);
                }
                Err(_) => unsafe { libc::_exit(0) },
            }
            crate::service::unblock_all_signals();
            if !args.is_empty() {
                let _ = execvp(&args[0], &args);
            }
            unsafe { libc::_exit(0) }
        }
        Ok(ForkResult::Parent { .. }) => {
            let raw = master.as_raw_fd();
            let _ = dup2(raw, STDOUT_FILENO);
            let _ = dup2(raw, STDERR_FILENO);
        }
        Err(_) => redirect_null(),
    }
}

/// Applies the stdio policy inside the forked service child, before exec.
pub fn route_child_stdio(sink: &LogSink, tag_default: &str) {
    match sink {
        LogSink::Disabled | LogSink::Console => {}
        LogSink::Null => redirect_null(),
        LogSink::File(_) | LogSink::Syslog { .. } => route_via_pty(sink, tag_default),
    }
}

/// Parses a `log[:...]` service option into a sink.
///
/// Accepted forms mirror the configuration syntax: `log` alone routes to
/// syslog with defaults, `log:null`, `log:console`, `log:/path/to/file`,
/// and `log:tag:<ident>,prio:<facility.level>`.
pub fn parse_log_option(raw: &str) -> LogSink {
    let Some(rest) = raw.strip_prefix("log") else {
        return LogSink::Disabled;
    };
    let rest = rest.strip_prefix(':').unwrap_or(rest);
    if rest.is_empty() {
        return LogSink::Syslog {
            tag: String::new(),
            prio: String::new(),
        };
    }

    match rest {
        "null" | "/dev/null" => LogSink::Null,
        "console" | "/dev/console" => LogSink::Console,
        _ if rest.starts_with('/') => LogSink::File(PathBuf::from(rest)),
        _ => {
            let mut tag = String::new();
            let mut prio = String::new();
            for part in rest.split(',') {
                if let Some(value) = part.strip_prefix("tag:") {
                    tag = value.to_string();
                } else if let Some(value) = part.strip_prefix("prio:") {
                    prio = value.to_string();
                } else if let Some(value) = part.strip_prefix("priority:") {
                    prio = value.to_string();
                }
            }
            LogSink::Syslog { tag, prio }
        }
    }
}
