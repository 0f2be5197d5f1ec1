//! Control protocol between the init core and its clients.
//!
//! Clients exchange a single fixed-shape record per connection over a
//! local Unix socket. The record carries a protocol magic, an operation
//! code, a runlevel byte (reused as a signal number for `Signal`), a
//! `sleeptime` byte (reused for the previous runlevel in replies) and a
//! variable-width `data` field holding a service name or `name:id`.
//! Replies overlay the request record: the op code becomes `Ack` or
//! `Nack`, with a human-readable refusal in `data`.

use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
};

use serde::{Deserialize, Serialize};

use crate::{
    constants::{CONTROL_SOCKET_NAME, SUPERVISOR_PID_FILE},
    error::ControlError,
    runtime,
};

/// Protocol identifier; guards against version skew between client and
/// supervisor.
pub const INIT_MAGIC: u32 = 0x0309_4711;

/// Operation codes understood by the control endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReqCmd {
    /// Query the current (and previous) runlevel.
    GetRunlevel,
    /// Change runlevel to the value in `runlevel`.
    SetRunlevel,
    /// Reload the configuration.
    Reload,
    /// Toggle verbose diagnostics.
    DebugToggle,
    /// Start the service named in `data`.
    StartSvc,
    /// Stop the service named in `data`.
    StopSvc,
    /// Restart the service named in `data`.
    RestartSvc,
    /// SIGHUP (or stop/start) the service named in `data`.
    ReloadSvc,
    /// Send signal `runlevel` to the service named in `data`.
    Signal,
    /// Pre-flight existence check for `data`.
    SvcQuery,
    /// Bring the system down.
    Halt,
    /// Reboot.
    Reboot,
    /// Power off.
    Poweroff,
    /// Suspend to RAM.
    Suspend,
    /// Positive reply.
    Ack,
    /// Negative reply; `data` carries the reason.
    Nack,
}

/// The request/reply record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    /// Must equal [`INIT_MAGIC`].
    pub magic: u32,
    /// Operation code.
    pub cmd: ReqCmd,
    /// Runlevel operand, or a signal number for [`ReqCmd::Signal`].
    #[serde(default)]
    pub runlevel: u8,
    /// Unused in requests; replies return the previous runlevel here.
    #[serde(default)]
    pub sleeptime: u8,
    /// Service name, `name:id`, or a refusal message in replies.
    #[serde(default)]
    pub data: String,
}

impl InitRequest {
    /// A request with defaulted operands.
    pub fn new(cmd: ReqCmd) -> Self {
        Self {
            magic: INIT_MAGIC,
            cmd,
            runlevel: 0,
            sleeptime: 0,
            data: String::new(),
        }
    }

    /// A request naming a service.
    pub fn for_service(cmd: ReqCmd, name: &str) -> Self {
        Self {
            data: name.to_string(),
            ..Self::new(cmd)
        }
    }

    /// The positive reply to this request.
    pub fn ack(&self) -> Self {
        Self {
            cmd: ReqCmd::Ack,
            ..self.clone()
        }
    }

    /// The negative reply to this request, with a reason.
    pub fn nack(&self, reason: impl Into<String>) -> Self {
        Self {
            cmd: ReqCmd::Nack,
            data: reason.into(),
            ..self.clone()
        }
    }
}

/// Returns the Unix socket path used to reach the resident supervisor.
pub fn socket_path() -> Result<PathBuf, ControlError> {
    let dir = runtime::run_dir();
    fs::create_dir_all(&dir)?;
    Ok(dir.join(CONTROL_SOCKET_NAME))
}

/// Returns the path where the supervisor PID is recorded.
pub fn supervisor_pid_path() -> Result<PathBuf, ControlError> {
    Ok(runtime::run_dir().join(SUPERVISOR_PID_FILE))
}

/// Sends a request and waits for the overlaid reply. A `Nack` reply is
/// surfaced as [`ControlError::Nack`].
pub fn send_request(request: &InitRequest) -> Result<InitRequest, ControlError> {
    let path = socket_path()?;
    if !path.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(path)?;
    let payload = serde_json::to_vec(request)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    let reply: InitRequest = serde_json::from_str(line.trim())?;
    if reply.cmd == ReqCmd::Nack {
        return Err(ControlError::Nack(reply.data));
    }
    Ok(reply)
}

/// Reads one request from a connected client. Used by the event loop.
pub fn read_request(stream: &mut UnixStream) -> Result<InitRequest, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty control request",
        )));
    }

    let request: InitRequest = serde_json::from_str(line.trim())?;
    if request.magic != INIT_MAGIC {
        return Err(ControlError::BadMagic(request.magic));
    }
    Ok(request)
}

/// Writes the reply record back to the client.
pub fn write_reply(
    stream: &mut UnixStream,
    reply: &InitRequest,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(reply)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}

/// Persists the supervisor PID for later client detection.
pub fn write_supervisor_pid(pid: libc::pid_t) -> Result<(), ControlError> {
    let path = supervisor_pid_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pid.to_string())?;
    Ok(())
}

/// Reads the supervisor PID if present.
pub fn read_supervisor_pid() -> Result<Option<libc::pid_t>, ControlError> {
    let path = supervisor_pid_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    contents
        .trim()
        .parse::<libc::pid_t>()
        .map(Some)
        .map_err(|e| ControlError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// Removes the socket and PID file left by a previous incarnation.
pub fn cleanup_runtime() -> Result<(), ControlError> {
    if let Ok(path) = socket_path()
        && path.exists()
    {
        let _ = fs::remove_file(path);
    }

    if let Ok(pid_path) = supervisor_pid_path()
        && pid_path.exists()
    {
        let _ = fs::remove_file(pid_path);
    }

    Ok(())
}
