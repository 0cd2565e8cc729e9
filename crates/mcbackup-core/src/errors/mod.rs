use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures of a single stage of a backup run.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("remote connection to {host} failed: {source}")]
    Connection {
        host: String,
        #[source]
        source: RemoteError,
    },

    #[error("console channel: {0}")]
    Channel(#[from] ChannelError),

    #[error("service still online after waiting {waited:?} for shutdown")]
    ShutdownTimeout { waited: Duration },

    #[error("archiving {} failed: {source}", .source_dir.display())]
    Archive {
        source_dir: PathBuf,
        #[source]
        source: ArchiveError,
    },

    #[error("upload of {name} failed: {source}")]
    Upload {
        name: String,
        #[source]
        source: RemoteError,
    },

    #[error("listing {location} archives failed: {reason}")]
    Listing { location: Location, reason: String },

    #[error("deleting {name} from {location} failed: {reason}")]
    Deletion {
        location: Location,
        name: String,
        reason: String,
    },

    #[error("service control: {0}")]
    Control(#[from] ControlError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Which side of the retention pass an operation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Local,
    Remote,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local => f.write_str("local"),
            Location::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("host key rejected: {0}")]
    HostKey(String),

    #[error("no such remote path: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("transport error during {operation}: {reason}")]
    Transport {
        operation: &'static str,
        reason: String,
    },

    #[error("local I/O error while {context}: {source}")]
    LocalIo {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    pub fn transport(operation: &'static str, reason: impl fmt::Display) -> Self {
        Self::Transport {
            operation,
            reason: reason.to_string(),
        }
    }

    /// Only transport failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transport { .. })
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{address} unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{address} did not answer within {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("malformed status response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot open console at {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("console authentication rejected")]
    Auth,

    #[error("console closed by the server")]
    Closed,

    #[error("command `{command}` failed: {reason}")]
    Command { command: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("source directory {} does not exist or is not a directory", .0.display())]
    SourceMissing(PathBuf),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("walking source tree failed: {0}")]
    Walk(String),

    #[error("archive task failed: {0}")]
    Task(String),
}

impl ArchiveError {
    pub fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("start command is empty")]
    EmptyCommand,

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no pid recorded at {}", .0.display())]
    NoPid(PathBuf),

    #[error("I/O error while {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
