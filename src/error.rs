//! Error handling for initg.
use thiserror::Error;

/// Defines all possible errors that can occur in the init core.
#[derive(Debug, Error)]
pub enum InitError {
    /// Error reading a configuration file or directory.
    #[error("Failed to read configuration: {0}")]
    ConfRead(#[from] std::io::Error),

    /// Error forking or executing a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStart {
        /// The service that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error delivering a signal to a service process.
    #[error("Failed to signal service '{service}': {source}")]
    ServiceSignal {
        /// The service that could not be signalled.
        service: String,
        /// The underlying errno.
        #[source]
        source: nix::errno::Errno,
    },

    /// A per-service timer was armed while another was still pending.
    #[error("Service '{0}' already has a pending timer")]
    TimerBusy(String),

    /// Error from the condition store.
    #[error("Condition store error: {0}")]
    Cond(#[from] CondError),

    /// Error from the control channel.
    #[error("Control channel error: {0}")]
    Control(#[from] ControlError),

    /// Error from the netlink ingestor.
    #[error("Netlink error: {0}")]
    Netlink(#[from] NetlinkError),

    /// Low-level Unix error.
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

/// Error type for the condition store.
#[derive(Debug, Error)]
pub enum CondError {
    /// Condition name failed validation.
    #[error("Invalid condition name '{0}'")]
    InvalidName(String),

    /// Error maintaining the filesystem mirror.
    #[error("Failed to mirror condition state: {0}")]
    Mirror(#[from] std::io::Error),
}

/// Error type for the service line loader.
#[derive(Debug, Error)]
pub enum ConfError {
    /// Error reading a configuration file.
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    /// A service line was missing its command or otherwise unusable.
    #[error("Incomplete service line '{0}', cannot register")]
    Incomplete(String),

    /// The command path was not absolute.
    #[error("Service command '{0}' is not an absolute path")]
    RelativeCommand(String),

    /// The runlevel bracket could not be parsed.
    #[error("Invalid runlevels '{0}'")]
    BadRunlevels(String),

    /// The declared user or group does not exist.
    #[error("Unknown user or group '{0}'")]
    UnknownAccount(String),
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Control socket I/O error.
    #[error("control socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Error serializing or deserializing control records.
    #[error("failed to serialise control record: {0}")]
    Serde(#[from] serde_json::Error),

    /// Request carried the wrong protocol magic.
    #[error("bad protocol magic {0:#x}")]
    BadMagic(u32),

    /// The supervisor refused the request.
    #[error("request refused: {0}")]
    Nack(String),

    /// Control socket not available or supervisor not running.
    #[error("control socket not available")]
    NotAvailable,
}

/// Error type for the netlink ingestor.
#[derive(Debug, Error)]
pub enum NetlinkError {
    /// Error creating or binding the netlink socket.
    #[error("netlink socket setup failed: {0}")]
    Socket(nix::errno::Errno),

    /// The kernel reported an error message on the socket.
    #[error("kernel netlink error: {0}")]
    Kernel(nix::errno::Errno),

    /// Error sending a dump request during resync.
    #[error("netlink resync request failed: {0}")]
    Resync(nix::errno::Errno),
}
