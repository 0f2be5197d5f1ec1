//! Helpers for resolving runtime paths based on the current privilege mode.
use std::{
    env,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(test)]
use std::path::Path;

use crate::constants::{COND_DIR_NAME, PIDFILE_DIR_NAME};

/// Runtime mode that determines where state and the condition tree live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Standard userspace mode; state lives under the invoking user's home directory.
    User,
    /// System mode; the process expects to run as PID 1 or a privileged supervisor.
    System,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    mode: RuntimeMode,
    state_dir: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
    conf_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<RuntimeContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<RuntimeContext> {
    CONTEXT.get_or_init(|| RwLock::new(RuntimeContext::from_mode(RuntimeMode::User)))
}

impl RuntimeContext {
    fn from_mode(mode: RuntimeMode) -> Self {
        match mode {
            RuntimeMode::User => Self::user_directories(),
            RuntimeMode::System => Self::system_directories(),
        }
    }

    fn user_directories() -> Self {
        let home = env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        Self::from_user_home(home)
    }

    fn from_user_home(home: PathBuf) -> Self {
        let state_dir = home.join(".local/share/initg");
        let run_dir = state_dir.join("run");
        let log_dir = state_dir.join("logs");
        let conf_dir = home.join(".config/initg");

        Self {
            mode: RuntimeMode::User,
            state_dir,
            run_dir,
            log_dir,
            conf_dir,
        }
    }

    fn system_directories() -> Self {
        Self {
            mode: RuntimeMode::System,
            state_dir: PathBuf::from("/var/lib/initg"),
            run_dir: PathBuf::from("/run/initg"),
            log_dir: PathBuf::from("/var/log/initg"),
            conf_dir: PathBuf::from("/etc/initg.d"),
        }
    }
}

/// Updates the global runtime directories for the provided mode. Subsequent
/// calls overwrite the active configuration so forks and tests can re-point
/// the process at the correct tree.
pub fn init(mode: RuntimeMode) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_mode(mode);
}

#[cfg(test)]
pub fn init_with_test_home(home: &Path) {
    let mut guard = context_lock().write().expect("runtime context poisoned");
    *guard = RuntimeContext::from_user_home(home.to_path_buf());
}

/// Returns the current runtime mode.
pub fn mode() -> RuntimeMode {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .mode
}

/// Returns the root directory for persistent state (snapshots, logs).
pub fn state_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .state_dir
        .clone()
}

/// Returns the volatile runtime directory (control socket, conditions, pidfiles).
pub fn run_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .run_dir
        .clone()
}

/// Returns the directory where supervisor and service logs reside.
pub fn log_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .log_dir
        .clone()
}

/// Returns the configuration directory searched for service files.
pub fn conf_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("runtime context poisoned")
        .conf_dir
        .clone()
}

/// Root of the condition tree.
pub fn cond_dir() -> PathBuf {
    run_dir().join(COND_DIR_NAME)
}

/// Directory where service pidfiles are created.
pub fn pidfile_dir() -> PathBuf {
    run_dir().join(PIDFILE_DIR_NAME)
}
