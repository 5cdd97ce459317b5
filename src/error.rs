//! Error taxonomy: six kinds, each carrying the fields a caller
//! needs to decide whether to retry, drop the connection, or surface the
//! failure to a user.

use std::io;
use thiserror::Error;
use uba_proto::CasKey;

/// Recoverable by reconnect: dial timeout, broken pipe, idle timeout.
/// Local policy is retry-with-backoff up to a ceiling; once retries are
/// exhausted the in-flight message completes with `peer-disconnected`.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("dial to {host}:{port} timed out after {timeout_ms}ms")]
    DialTimeout { host: String, port: u16, timeout_ms: u64 },

    #[error("connection to {host}:{port} failed: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("broken pipe on connection {connection_id}")]
    BrokenPipe { connection_id: u64 },

    #[error("idle timeout on connection {connection_id} after {idle_seconds}s")]
    IdleTimeout { connection_id: u64, idle_seconds: u64 },

    #[error("peer disconnected")]
    PeerDisconnected,

    #[error("message id pool exhausted, retry later")]
    MessageIdPoolExhausted,

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::PeerDisconnected)
    }
}

/// Fatal per connection: version mismatch, encryption mismatch, unknown
/// service/message. The connection is closed; there is no retry.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("encryption handshake failed")]
    EncryptionMismatch,

    #[error("unknown service id {0}")]
    UnknownService(u8),

    #[error("unknown message type {message_type} for service {service_id}")]
    UnknownMessage { service_id: u8, message_type: u8 },

    #[error("bad client guid")]
    BadClientGuid,

    #[error("server sent zero guid")]
    ZeroServerGuid,

    #[error("wrong server guid for retry client")]
    WrongServerGuid,
}

/// Missing blob, hash mismatch, disallowed key. Missing/hash-mismatch
/// trigger an eviction and one retry; disallowed surfaces to the caller.
#[derive(Error, Debug)]
pub enum CasError {
    #[error("cas blob {0:?} not found")]
    Missing(CasKey),

    #[error("cas blob {0:?} failed hash verification")]
    HashMismatch(CasKey),

    #[error("cas key {0:?} is disallowed by policy")]
    Disallowed(CasKey),

    #[error("cas capacity exceeded: {used} bytes used of {capacity}")]
    CapacityExceeded { used: u64, capacity: u64 },

    #[error("i/o error accessing cas store: {0}")]
    Io(#[from] io::Error),

    #[error("compression error: {0}")]
    Compression(String),
}

impl CasError {
    pub fn triggers_retry(&self) -> bool {
        matches!(self, CasError::Missing(_) | CasError::HashMismatch(_))
    }
}

/// Non-zero exit, crash, cancel, or returned. Non-zero exit is reported to
/// the caller; cancel is silent; returned re-enters the scheduler queue.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process {process_id} exited with code {code}")]
    NonZeroExit { process_id: u64, code: i32 },

    #[error("process {process_id} crashed: {reason}")]
    Crashed { process_id: u64, reason: String },

    #[error("process {process_id} cancelled")]
    Cancelled { process_id: u64 },

    #[error("process {process_id} returned by helper: {reason}")]
    Returned { process_id: u64, reason: String },
}

/// Out-of-memory (wait-or-kill) or out-of-disk (fail the insert). Never
/// panics; resource exhaustion is always reported through this type.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("memory load {load_percent}% above kill threshold {kill_threshold}%")]
    OutOfMemory { load_percent: f32, kill_threshold: f32 },

    #[error("insufficient disk space: need {needed} bytes, have {available}")]
    OutOfDisk { needed: u64, available: u64 },
}

/// Bad CLI flags or bad config; surfaces as a log line plus a non-zero
/// process exit code.
#[derive(Error, Debug)]
pub enum UsageError {
    #[error("invalid flag {flag}: {reason}")]
    BadFlag { flag: String, reason: String },

    #[error("invalid config at {path}: {reason}")]
    BadConfig { path: String, reason: String },
}

/// Umbrella type for call sites that can fail in more than one of the
/// above ways (e.g. the scheduler, which touches transport, CAS and
/// process errors in the same loop iteration).
#[derive(Error, Debug)]
pub enum UbaError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cas(#[from] CasError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Usage(#[from] UsageError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

pub type UbaResult<T> = Result<T, UbaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Cas,
    Process,
    Resource,
    Usage,
    Internal,
}

impl UbaError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            UbaError::Transport(_) => ErrorCategory::Transport,
            UbaError::Protocol(_) => ErrorCategory::Protocol,
            UbaError::Cas(_) => ErrorCategory::Cas,
            UbaError::Process(_) => ErrorCategory::Process,
            UbaError::Resource(_) => ErrorCategory::Resource,
            UbaError::Usage(_) => ErrorCategory::Usage,
            UbaError::Io(_) => ErrorCategory::Internal,
        }
    }

    /// Network/storage/CAS errors are recovered locally where possible;
    /// the scheduler surfaces only `ProcessError` to its finished
    /// callback.
    pub fn is_retryable(&self) -> bool {
        match self {
            UbaError::Transport(e) => e.is_retryable(),
            UbaError::Cas(e) => e.triggers_retry(),
            UbaError::Protocol(_) | UbaError::Process(_) | UbaError::Usage(_) => false,
            UbaError::Resource(_) | UbaError::Io(_) => true,
        }
    }

    /// Structured reason text used verbatim in the trace and visualizer
    /// tooltip.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}
