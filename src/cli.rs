//! Command-line interface for initg.
use clap::{Parser, Subcommand};
use std::{path::PathBuf, str::FromStr};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for initg.
#[derive(Parser)]
#[command(name = "initg", version, author)]
#[command(about = "A small service manager / init core", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Opt into privileged system mode. Requires running as root.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the resident init core (event loop, supervisor, control socket).
    Up {
        /// Directory of service `*.conf` files; defaults to the runtime
        /// configuration directory.
        #[arg(short, long)]
        conf_dir: Option<PathBuf>,

        /// Runlevel to enter once bootstrap completes.
        #[arg(short, long, default_value_t = crate::constants::DEFAULT_RUNLEVEL)]
        runlevel: u8,
    },

    /// Show the status of supervised services.
    Status {
        /// Emit machine-readable JSON instead of a table.
        #[arg(long)]
        json: bool,

        /// Only show services matching this name.
        service: Option<String>,
    },

    /// Start a stopped service.
    Start {
        /// Service name or `name:id`.
        name: String,
    },

    /// Stop a running service.
    Stop {
        /// Service name or `name:id`.
        name: String,
    },

    /// Restart a service.
    Restart {
        /// Service name or `name:id`.
        name: String,
    },

    /// Reload the configuration, or one service's configuration.
    Reload {
        /// Service name; reloads everything when omitted.
        name: Option<String>,
    },

    /// Send a signal to a service.
    Signal {
        /// Service name or `name:id`.
        name: String,

        /// Signal name (`TERM`, `SIGHUP`) or number.
        signal: String,
    },

    /// Check whether a service exists.
    Query {
        /// Service name or `name:id`.
        name: String,
    },

    /// Show or set the runlevel.
    Runlevel {
        /// Runlevel 0-9; prints `previous current` when omitted.
        level: Option<u8>,
    },

    /// Inspect or manipulate conditions.
    Cond {
        /// Condition subcommand.
        #[command(subcommand)]
        command: CondCommands,
    },

    /// List known service identities.
    Ident {
        /// Only list identities matching this name.
        name: Option<String>,
    },

    /// Halt the system.
    Halt,

    /// Reboot the system.
    Reboot,

    /// Power off the system.
    Poweroff,

    /// Suspend the system.
    Suspend,

    /// Toggle supervisor debug diagnostics.
    Debug,
}

/// Condition subcommands; `set`/`clear` operate on the user-writable
/// `usr/` namespace.
#[derive(Subcommand)]
pub enum CondCommands {
    /// List currently asserted conditions.
    Show,
    /// Dump the whole condition tree with states.
    Dump,
    /// Print the state of one condition.
    Get {
        /// Condition name, e.g. `net/eth0/up`.
        name: String,
    },
    /// Assert a user condition.
    Set {
        /// Condition name below `usr/`.
        name: String,
    },
    /// Clear a user condition.
    Clear {
        /// Condition name below `usr/`.
        name: String,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
