//! Constants and tunables for the initg core.
//!
//! This module centralizes magic numbers, file names and timing values used
//! throughout the supervisor so they are documented in one place.

use std::time::Duration;

// ============================================================================
// Supervision Timing
// ============================================================================

/// Maximum number of crash respawns before a service is abandoned as crashed.
pub const RESPAWN_MAX: u8 = 10;

/// Grace period between SIGTERM and SIGKILL when stopping a service.
pub const SVC_TERM_TIMEOUT: Duration = Duration::from_millis(3000);

/// Delay before the first retry tick after an unexpected daemon exit.
pub const RESTART_ARM_DELAY: Duration = Duration::from_millis(1);

/// Backoff between respawn attempts for the first half of the budget.
pub const RESPAWN_BACKOFF_SHORT: Duration = Duration::from_millis(2000);

/// Backoff between respawn attempts once half the budget is spent.
pub const RESPAWN_BACKOFF_LONG: Duration = Duration::from_millis(5000);

/// Upper bound on step-all passes; a correct table converges far earlier.
pub const STEP_MAX_PASSES: usize = 128;

// ============================================================================
// File System Names
// ============================================================================

/// Name of the control socket inside the runtime directory.
pub const CONTROL_SOCKET_NAME: &str = "control.sock";

/// File recording the supervisor PID.
pub const SUPERVISOR_PID_FILE: &str = "initg.pid";

/// Persisted service state snapshot, read by the status client.
pub const SNAPSHOT_FILE_NAME: &str = "services.json";

/// Directory below the runtime dir holding the condition tree.
pub const COND_DIR_NAME: &str = "cond";

/// Subdirectory for conditions asserted by the supervisor itself.
pub const COND_ASSERTED_DIR: &str = "asserted";

/// Subdirectory for user-asserted conditions, writable by the client.
pub const COND_USR_DIR: &str = "usr";

/// Reconfiguration marker file; its generation defines the FLUX threshold.
pub const COND_RECONF_FILE: &str = "reconf";

/// Directory below the runtime dir for service pidfiles.
pub const PIDFILE_DIR_NAME: &str = "pids";

/// Paths that, when present, inhibit all service starts.
pub const NORESPAWN_FILES: [&str; 2] = ["/mnt/norespawn", "/tmp/norespawn"];

// ============================================================================
// Service Defaults
// ============================================================================

/// Runlevel bitmask used when a service declares none (runlevels 2-5).
pub const DEFAULT_RUNLEVELS: u16 = 0b0000_0011_1100;

/// Instance id used when a service declares none.
pub const DEFAULT_INSTANCE_ID: &str = "1";

/// Runlevel entered once bootstrap run/tasks have completed.
pub const DEFAULT_RUNLEVEL: u8 = 2;

/// `PATH` handed to children after dropping to a non-root user.
pub const USER_DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Log shipper executed as the grandchild for file/syslog routed services.
pub const LOG_SHIPPER: &str = "logit";

// ============================================================================
// Client Exit Codes
// ============================================================================

/// Success.
pub const EX_OK: i32 = 0;

/// Generic failure.
pub const EX_FAIL: i32 = 1;

/// Bad command line arguments.
pub const EX_USAGE: i32 = 2;

/// No such client command.
pub const EX_NOCOMMAND: i32 = 3;

/// Refused: built-in service.
pub const EX_BUILTIN: i32 = 4;

/// Service exists but is not enabled in the current runlevel.
pub const EX_NOTENABLED: i32 = 6;

/// Signal name/number conversion failed.
pub const EX_SIGNAL: i32 = 65;

/// No such service.
pub const EX_NOSUCHSVC: i32 = 69;

/// Failed marking configuration for reload.
pub const EX_MARKFAIL: i32 = 71;

/// Configuration directory missing.
pub const EX_NOCONFDIR: i32 = 72;

/// Failed creating a configuration entry.
pub const EX_CREATEFAIL: i32 = 73;
