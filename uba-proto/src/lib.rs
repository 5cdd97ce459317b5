//! Shared wire types for the UBA core: the message/service id enums, the
//! `CasKey`/`StringKey` identifiers, the framing constants, and a small
//! binary reader/writer pair used by every message handler.
//!
//! This crate has no async runtime dependency so the scheduler CLI can
//! depend on it without pulling in tokio.

pub mod keys;
pub mod messages;
pub mod wire;

pub use keys::{CasFlags, CasKey, StringKey};
pub use messages::{
    CacheMessageType, ServiceId, SessionMessageType, StorageMessageType, SystemMessageType,
};
pub use wire::{BinaryReader, BinaryWriter, WireError};

/// Maximum body size for a single send frame.
pub const SEND_MAX_SIZE: u32 = 256 * 1024;

pub const SYSTEM_NETWORK_VERSION: u32 = 1339;
pub const STORAGE_NETWORK_VERSION: u32 = 4;
pub const SESSION_NETWORK_VERSION: u32 = 46;
pub const CACHE_NETWORK_VERSION: u32 = 5;
pub const CACHE_BUCKET_VERSION: u32 = 3;

pub const KEEP_ALIVE_IDLE_SECONDS: u64 = 60;
pub const KEEP_ALIVE_INTERVAL_SECONDS: u64 = 1;
pub const KEEP_ALIVE_PROBE_COUNT: u32 = 10;

/// Reserved body-size sentinels carried in the 5-byte receive-frame header.
pub const MESSAGE_ERROR_SIZE: u32 = 0x00FF_FFFF;
pub const MESSAGE_KEEP_ALIVE_SIZE: u32 = 0x00FF_FFFE;

/// Reserved fetch-id sentinels used by the storage proxy.
pub const FETCH_CAS_ID_DONE: u16 = u16::MAX;
pub const FETCH_CAS_ID_DISALLOWED: u16 = u16::MAX - 1;

/// 128-byte fixed plaintext exchanged during the crypto handshake; kept
/// byte-for-byte fixed so both sides always validate against the same
/// string regardless of crate version.
pub const ENCRYPTION_HANDSHAKE_STRING: &[u8; 128] =
    b"This is a test string used to check so encryption keys matches between client and server. This string is 128 characters long...";

/// Response sentinels for `SessionMessageType::ProcessAvailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAvailableResponse {
    None,
    Disconnect,
    RemoteExecutionDisabled,
}

impl ProcessAvailableResponse {
    pub const NONE: u32 = 0;
    pub const DISCONNECT: u32 = u32::MAX;
    pub const REMOTE_EXECUTION_DISABLED: u32 = u32::MAX - 1;

    pub fn from_u32(value: u32) -> Self {
        match value {
            Self::DISCONNECT => Self::Disconnect,
            Self::REMOTE_EXECUTION_DISABLED => Self::RemoteExecutionDisabled,
            _ => Self::None,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => Self::NONE,
            Self::Disconnect => Self::DISCONNECT,
            Self::RemoteExecutionDisabled => Self::REMOTE_EXECUTION_DISABLED,
        }
    }
}

/// Handshake error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeError {
    Ok = 0,
    VersionMismatch = 1,
    BadClientGuid = 2,
    NewClientsDisallowed = 3,
    ServerDisconnectedEarly = 4,
    ZeroServerGuid = 5,
    WrongServerGuid = 6,
}

impl HandshakeError {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::VersionMismatch,
            2 => Self::BadClientGuid,
            3 => Self::NewClientsDisallowed,
            4 => Self::ServerDisconnectedEarly,
            5 => Self::ZeroServerGuid,
            6 => Self::WrongServerGuid,
            _ => return None,
        })
    }

    /// Cases 3 and 4 are surfaced to the retry loop as a plain timeout so a
    /// simple reconnect keeps trying without the peer thinking we gave up.
    pub fn is_retry_as_timeout(self) -> bool {
        matches!(self, Self::NewClientsDisallowed | Self::ServerDisconnectedEarly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_available_response_round_trips() {
        for r in [
            ProcessAvailableResponse::None,
            ProcessAvailableResponse::Disconnect,
            ProcessAvailableResponse::RemoteExecutionDisabled,
        ] {
            assert_eq!(ProcessAvailableResponse::from_u32(r.as_u32()), r);
        }
    }

    #[test]
    fn handshake_error_retry_classification() {
        assert!(HandshakeError::NewClientsDisallowed.is_retry_as_timeout());
        assert!(HandshakeError::ServerDisconnectedEarly.is_retry_as_timeout());
        assert!(!HandshakeError::VersionMismatch.is_retry_as_timeout());
    }
}
