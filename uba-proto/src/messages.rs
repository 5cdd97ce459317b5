//! The closed set of services and message types. Each
//! service gets its own 6-bit message-type space; the 2-bit service id
//! and the message type are packed together into the send-frame header
//! byte.

/// 2-bit service id packed into the top bits of the send-frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ServiceId {
    System = 0,
    Storage = 1,
    Session = 2,
    Cache = 3,
}

impl ServiceId {
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits & 0b11 {
            0 => Self::System,
            1 => Self::Storage,
            2 => Self::Session,
            3 => Self::Cache,
            _ => return None,
        })
    }
}

macro_rules! message_enum {
    ($name:ident { $($variant:ident),* $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$(Self::$variant),*];

            pub fn from_bits(bits: u8) -> Option<Self> {
                let mut i = 0u8;
                $(
                    if bits == i { return Some(Self::$variant); }
                    i += 1;
                )*
                let _ = i;
                None
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($variant)),*
                }
            }
        }
    };
}

message_enum!(SystemMessageType {
    SetConnectionCount,
    KeepAlive,
    FetchConfig,
});

message_enum!(StorageMessageType {
    FetchBegin,
    FetchSegment,
    FetchEnd,
    ExistsOnServer,
    StoreBegin,
    StoreSegment,
    StoreEnd,
    Connect,
    ProxyFetchBegin,
    ProxyFetchEnd,
    ReportBadProxy,
});

message_enum!(SessionMessageType {
    Connect,
    EnsureBinaryFile,
    GetApplication,
    GetFileFromServer,
    GetLongPathName,
    SendFileToServer,
    DeleteFile,
    CopyFile,
    CreateDirectory,
    RemoveDirectory,
    ListDirectory,
    GetDirectoriesFromServer,
    GetNameToHashFromServer,
    ProcessAvailable,
    ProcessInputs,
    ProcessFinished,
    ProcessReturned,
    GetRoots,
    VirtualAllocFailed,
    GetTraceInformation,
    Ping,
    Notification,
    GetNextProcess,
    Custom,
    UpdateEnvironment,
    Summary,
    Command,
    ShGetKnownFolderPath,
    DebugFileNotFoundError,
    HostRun,
    GetSymbols,
});

message_enum!(CacheMessageType {
    Connect,
    StorePathTable,
    StoreCasTable,
    StoreEntry,
    StoreEntryDone,
    FetchPathTable,
    FetchCasTable,
    FetchEntries,
    ExecuteCommand,
    RequestShutdown,
    ReportUsedEntry,
    FetchPathTable2,
    FetchCasTable2,
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_message_round_trips() {
        for m in StorageMessageType::ALL {
            assert_eq!(StorageMessageType::from_bits(*m as u8), Some(*m));
        }
    }

    #[test]
    fn service_id_round_trips() {
        for id in [ServiceId::System, ServiceId::Storage, ServiceId::Session, ServiceId::Cache] {
            assert_eq!(ServiceId::from_bits(id as u8), Some(id));
        }
    }
}
