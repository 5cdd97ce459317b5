//! Session: the host's directory table, name-to-hash table
//! and process registry, plus the helper-side mirror tables and roots
//! (path virtualization).
//!
//! The directory/name-to-hash tables are append-only `memmap2`-backed
//! segments with a published high-watermark offset, following
//! `manager/memory_map.rs`'s `MappedFile::write_at` pattern generalized
//! from a fixed-size single-writer file to an append cursor a second
//! process can read while the first keeps writing. The process registry
//! reuses `manager/core.rs`'s `DashMap<Id, Entry>` plus broadcast-event
//! shape (`active_files` / `ManagerEvent`), generalized to a process
//! lifecycle with queued, running, and finished states.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use memmap2::MmapMut;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use uba_proto::wire::{BinaryReader, BinaryWriter};
use uba_proto::{CasKey, StringKey};

use crate::error::{CasError, UbaResult};

/// Ordered set of (virtual prefix, local prefix, flags) used to
/// devirtualize paths across machines with different filesystem layouts
///.
#[derive(Debug, Clone, Default)]
pub struct RootPaths {
    entries: Vec<(String, String, u32)>,
}

impl RootPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, virtual_prefix: &str, local_prefix: &str, flags: u32) {
        self.entries.push((virtual_prefix.to_string(), local_prefix.to_string(), flags));
    }

    /// Rewrites a virtual path to its local equivalent using the first
    /// matching prefix, longest-prefix first.
    pub fn devirtualize(&self, path: &str) -> String {
        let mut best: Option<&(String, String, u32)> = None;
        for entry in &self.entries {
            if path.starts_with(entry.0.as_str())
                && best.map(|b| entry.0.len() > b.0.len()).unwrap_or(true)
            {
                best = Some(entry);
            }
        }
        match best {
            Some((virt, local, _)) => format!("{}{}", local, &path[virt.len()..]),
            None => path.to_string(),
        }
    }

    /// The reverse of [`RootPaths::devirtualize`], used when serializing
    /// a host-local path to send to a helper.
    pub fn virtualize(&self, path: &str) -> String {
        let mut best: Option<&(String, String, u32)> = None;
        for entry in &self.entries {
            if path.starts_with(entry.1.as_str())
                && best.map(|b| entry.1.len() > b.1.len()).unwrap_or(true)
            {
                best = Some(entry);
            }
        }
        match best {
            Some((virt, local, _)) => format!("{}{}", virt, &path[local.len()..]),
            None => path.to_string(),
        }
    }
}

/// Opaque handle selecting a registered `RootPaths` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootsHandle(pub u32);

/// Registry of `RootPaths` sets, keyed by `RootsHandle`.
#[derive(Default)]
pub struct RootsRegistry {
    roots: DashMap<RootsHandle, RootPaths>,
    next: AtomicU64,
}

impl RootsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, roots: RootPaths) -> RootsHandle {
        let handle = RootsHandle(self.next.fetch_add(1, Ordering::Relaxed) as u32);
        self.roots.insert(handle, roots);
        handle
    }

    pub fn get(&self, handle: RootsHandle) -> Option<RootPaths> {
        self.roots.get(&handle).map(|r| r.clone())
    }
}

/// A fixed-capacity append-only segment. Real cross-process sharing is
/// backed by `memmap2::MmapMut` over a preallocated file; the first 8
/// bytes of the mapping are the published high-watermark a second
/// process polls, so the host can keep appending rows while a helper
/// parses them incrementally.
struct AppendSegment {
    mmap: Mutex<MmapMut>,
    watermark: AtomicU64,
    capacity: u64,
}

const SEGMENT_HEADER: u64 = 8;

impl AppendSegment {
    fn create(path: &PathBuf, capacity: u64) -> UbaResult<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(CasError::Io)?;
        file.set_len(capacity + SEGMENT_HEADER).map_err(CasError::Io)?;
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(CasError::Io)?;
        Ok(Self {
            mmap: Mutex::new(mmap),
            watermark: AtomicU64::new(0),
            capacity,
        })
    }

    /// Appends `bytes` past the current watermark, then publishes the
    /// new watermark so readers can observe it.
    fn append(&self, bytes: &[u8]) -> UbaResult<u64> {
        let offset = self.watermark.load(Ordering::Acquire);
        if offset + bytes.len() as u64 > self.capacity {
            return Err(CasError::Compression("append segment capacity exceeded".to_string()).into());
        }
        {
            let mut mmap = self.mmap.lock();
            let start = (SEGMENT_HEADER + offset) as usize;
            mmap[start..start + bytes.len()].copy_from_slice(bytes);
        }
        let new_watermark = offset + bytes.len() as u64;
        self.watermark.store(new_watermark, Ordering::Release);
        Ok(offset)
    }

    fn read_since(&self, since: u64) -> Vec<u8> {
        let watermark = self.watermark.load(Ordering::Acquire);
        if since >= watermark {
            return Vec::new();
        }
        let mmap = self.mmap.lock();
        let start = (SEGMENT_HEADER + since) as usize;
        let end = (SEGMENT_HEADER + watermark) as usize;
        mmap[start..end].to_vec()
    }

    fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }
}

/// One row of the directory table. `children` is empty for a
/// leaf file entry.
#[derive(Debug, Clone, Default)]
pub struct DirectoryRow {
    pub exists: bool,
    pub attributes: u32,
    pub size: u64,
    pub mtime: u64,
    pub children: Vec<StringKey>,
    pub tombstone: bool,
}

fn encode_directory_row(key: &StringKey, row: &DirectoryRow) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_string_key(key);
    w.write_bool(row.exists);
    w.write_u32(row.attributes);
    w.write_u64(row.size);
    w.write_u64(row.mtime);
    w.write_bool(row.tombstone);
    w.write_u32(row.children.len() as u32);
    for child in &row.children {
        w.write_string_key(child);
    }
    w.into_bytes()
}

fn decode_directory_row(buf: &[u8]) -> UbaResult<(StringKey, DirectoryRow, usize)> {
    let mut r = BinaryReader::new(buf);
    let key = r.read_string_key().map_err(|_| eof_err())?;
    let exists = r.read_bool().map_err(|_| eof_err())?;
    let attributes = r.read_u32().map_err(|_| eof_err())?;
    let size = r.read_u64().map_err(|_| eof_err())?;
    let mtime = r.read_u64().map_err(|_| eof_err())?;
    let tombstone = r.read_bool().map_err(|_| eof_err())?;
    let child_count = r.read_u32().map_err(|_| eof_err())?;
    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        children.push(r.read_string_key().map_err(|_| eof_err())?);
    }
    let consumed = buf.len() - r.remaining();
    Ok((
        key,
        DirectoryRow {
            exists,
            attributes,
            size,
            mtime,
            children,
            tombstone,
        },
        consumed,
    ))
}

fn eof_err() -> crate::error::UbaError {
    CasError::Compression("truncated directory table row".to_string()).into()
}

/// Host-owned directory table: `StringKey -> DirectoryRow`, append-only
/// within a session. The host appends rows;
/// helpers parse the growing byte stream incrementally via
/// [`DirectoryTable::parse_new_rows`].
pub struct DirectoryTable {
    segment: AppendSegment,
    index: DashMap<StringKey, DirectoryRow>,
    parsed_offset: AtomicU64,
}

impl DirectoryTable {
    pub fn create(path: &PathBuf, capacity: u64) -> UbaResult<Arc<Self>> {
        Ok(Arc::new(Self {
            segment: AppendSegment::create(path, capacity)?,
            index: DashMap::new(),
            parsed_offset: AtomicU64::new(0),
        }))
    }

    pub fn insert(&self, key: StringKey, row: DirectoryRow) -> UbaResult<()> {
        let encoded = encode_directory_row(&key, &row);
        self.segment.append(&encoded)?;
        self.index.insert(key, row);
        Ok(())
    }

    /// A "delete" is a tombstone row, not a removal.
    pub fn tombstone(&self, key: StringKey) -> UbaResult<()> {
        let row = DirectoryRow {
            tombstone: true,
            ..Default::default()
        };
        self.insert(key, row)
    }

    pub fn get(&self, key: &StringKey) -> Option<DirectoryRow> {
        self.index.get(key).map(|r| r.clone())
    }

    /// Incrementally parses bytes appended since this table was last
    /// read, updating the local mirror index. Used by helpers mirroring
    /// the host's table.
    pub fn parse_new_rows(&self) {
        let since = self.parsed_offset.load(Ordering::Acquire);
        let bytes = self.segment.read_since(since);
        let mut pos = 0usize;
        while pos < bytes.len() {
            match decode_directory_row(&bytes[pos..]) {
                Ok((key, row, consumed)) => {
                    self.index.insert(key, row);
                    pos += consumed;
                }
                Err(_) => break,
            }
        }
        self.parsed_offset.store(since + pos as u64, Ordering::Release);
    }

    pub fn watermark(&self) -> u64 {
        self.segment.watermark()
    }
}

/// Host-owned name-to-hash table: `StringKey -> (CasKey, last_seen)`,
/// also append-only.
pub struct NameToHashTable {
    segment: AppendSegment,
    index: DashMap<StringKey, (CasKey, u64)>,
    parsed_offset: AtomicU64,
}

impl NameToHashTable {
    pub fn create(path: &PathBuf, capacity: u64) -> UbaResult<Arc<Self>> {
        Ok(Arc::new(Self {
            segment: AppendSegment::create(path, capacity)?,
            index: DashMap::new(),
            parsed_offset: AtomicU64::new(0),
        }))
    }

    pub fn insert(&self, name: StringKey, hash: CasKey, last_seen: u64) -> UbaResult<()> {
        let mut w = BinaryWriter::new();
        w.write_string_key(&name);
        w.write_cas_key(&hash);
        w.write_u64(last_seen);
        self.segment.append(w.as_bytes())?;
        self.index.insert(name, (hash, last_seen));
        Ok(())
    }

    pub fn get(&self, name: &StringKey) -> Option<(CasKey, u64)> {
        self.index.get(name).map(|v| *v)
    }

    pub fn parse_new_rows(&self) {
        let since = self.parsed_offset.load(Ordering::Acquire);
        let bytes = self.segment.read_since(since);
        const ROW_SIZE: usize = 16 + 20 + 8;
        let mut pos = 0usize;
        while pos + ROW_SIZE <= bytes.len() {
            let mut r = BinaryReader::new(&bytes[pos..pos + ROW_SIZE]);
            if let (Ok(name), Ok(hash), Ok(last_seen)) =
                (r.read_string_key(), r.read_cas_key(), r.read_u64())
            {
                self.index.insert(name, (hash, last_seen));
            }
            pos += ROW_SIZE;
        }
        self.parsed_offset.store(since + pos as u64, Ordering::Release);
    }
}

/// Process lifecycle. `Running` and `Finished` carry where and
/// how the process concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Queued,
    Running(RunningKind),
    Finished(FinishedKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningKind {
    Local,
    Remote,
    CacheHit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishedKind {
    Success,
    Error(i32),
    Cancelled,
    Returned(String),
}

/// A single process in the build graph: its command line, dependencies,
/// and the scheduling/caching metadata attached to it.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: u64,
    pub argv: Vec<String>,
    pub working_dir: String,
    pub roots: Option<RootsHandle>,
    pub weight: f32,
    pub dependencies: Vec<u64>,
    pub cache_bucket_id: Option<u32>,
    pub exit_code: Option<i32>,
    pub log_lines: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum ProcessEvent {
    StateChanged { id: u64, state: ProcessState },
}

/// The host's process registry: `DashMap<Id, Entry>` plus a broadcast of
/// lifecycle transitions, reusing `manager/core.rs`'s `active_files`/
/// `ManagerEvent` shape.
pub struct ProcessRegistry {
    processes: DashMap<u64, (ProcessInfo, ProcessState)>,
    events: broadcast::Sender<ProcessEvent>,
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self {
            processes: DashMap::new(),
            events: tx,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    pub fn enqueue(&self, info: ProcessInfo) {
        let id = info.id;
        self.processes.insert(id, (info, ProcessState::Queued));
        let _ = self.events.send(ProcessEvent::StateChanged {
            id,
            state: ProcessState::Queued,
        });
    }

    pub fn set_state(&self, id: u64, state: ProcessState) {
        if let Some(mut entry) = self.processes.get_mut(&id) {
            entry.1 = state.clone();
            debug!(id, ?state, "process state changed");
        }
        let _ = self.events.send(ProcessEvent::StateChanged { id, state });
    }

    pub fn state(&self, id: u64) -> Option<ProcessState> {
        self.processes.get(&id).map(|e| e.1.clone())
    }

    pub fn info(&self, id: u64) -> Option<ProcessInfo> {
        self.processes.get(&id).map(|e| e.0.clone())
    }

    /// Scheduler dependency law: a process may
    /// transition to `Running` only once every dependency has reached a
    /// terminal success/cache-hit state.
    pub fn dependencies_satisfied(&self, id: u64) -> bool {
        let Some(info) = self.info(id) else { return false };
        info.dependencies.iter().all(|dep| {
            matches!(
                self.state(*dep),
                Some(ProcessState::Finished(FinishedKind::Success)) | Some(ProcessState::Running(RunningKind::CacheHit))
            )
        })
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Claims the next `Queued` process whose dependencies are satisfied
    /// for remote execution, moving it to `Running(Remote)` so a second
    /// helper asking `GetNextProcess` doesn't race for the same work.
    pub fn take_next_ready(&self) -> Option<ProcessInfo> {
        let queued_ids: Vec<u64> = self
            .processes
            .iter()
            .filter(|e| matches!(e.value().1, ProcessState::Queued))
            .map(|e| *e.key())
            .collect();
        let ready_id = queued_ids.into_iter().find(|id| self.dependencies_satisfied(*id))?;
        let info = self.info(ready_id)?;
        self.set_state(ready_id, ProcessState::Running(RunningKind::Remote));
        Some(info)
    }

    /// True once every enqueued process has reached a terminal state (or
    /// none were ever enqueued), the signal a helper's `GetNextProcess`
    /// uses to tell the difference between "nothing ready yet" and
    /// "disconnect, the build is done".
    pub fn all_finished(&self) -> bool {
        self.processes.iter().all(|e| matches!(e.value().1, ProcessState::Finished(_)))
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        // `new()` returns an `Arc`; `Default` is provided for ergonomics
        // in tests that don't need shared ownership.
        Self {
            processes: DashMap::new(),
            events: broadcast::channel(16).0,
        }
    }
}

/// `EnsureBinaryFile`/`GetFileFromServer`/`GetDirectoriesFromServer`/
/// `GetNameToHashFromServer` round trips: a helper's
/// request for a mirror-table row it doesn't yet have.
#[derive(Debug, Clone)]
pub enum HelperRequest {
    GetFileFromServer(StringKey),
    GetDirectoriesFromServer(StringKey),
    GetNameToHashFromServer(StringKey),
}

/// Sentinels a helper gets back when it asks for its next process.
#[derive(Debug, Clone)]
pub enum NextProcessResponse {
    None,
    Disconnect,
    RemoteExecutionDisabled,
    Process(ProcessInfo),
}

impl NextProcessResponse {
    pub fn as_wire_value(&self) -> u32 {
        match self {
            NextProcessResponse::None => uba_proto::ProcessAvailableResponse::None.as_u32(),
            NextProcessResponse::Disconnect => uba_proto::ProcessAvailableResponse::Disconnect.as_u32(),
            NextProcessResponse::RemoteExecutionDisabled => {
                uba_proto::ProcessAvailableResponse::RemoteExecutionDisabled.as_u32()
            }
            NextProcessResponse::Process(_) => uba_proto::ProcessAvailableResponse::None.as_u32(),
        }
    }
}

/// A `GetFileFromServer`/`GetDirectoriesFromServer`/`GetNameToHashFromServer`
/// request body is just the `StringKey` being looked up; which table to
/// consult is carried by the message type, not the body, so decoding
/// needs both.
pub fn decode_helper_request(message_type: u8, body: &[u8]) -> UbaResult<HelperRequest> {
    let mut r = BinaryReader::new(body);
    let key = r.read_string_key().map_err(|_| eof_err())?;
    match uba_proto::SessionMessageType::from_bits(message_type) {
        Some(uba_proto::SessionMessageType::GetFileFromServer) => Ok(HelperRequest::GetFileFromServer(key)),
        Some(uba_proto::SessionMessageType::GetDirectoriesFromServer) => {
            Ok(HelperRequest::GetDirectoriesFromServer(key))
        }
        Some(uba_proto::SessionMessageType::GetNameToHashFromServer) => {
            Ok(HelperRequest::GetNameToHashFromServer(key))
        }
        _ => Err(crate::error::ProtocolError::UnknownMessage {
            service_id: uba_proto::ServiceId::Session as u8,
            message_type,
        }
        .into()),
    }
}

pub fn encode_helper_request_key(key: &StringKey) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_string_key(key);
    w.into_bytes()
}

/// `[found: bool][CasKey if found]`, the reply to `GetFileFromServer`.
pub fn encode_file_response(found: Option<CasKey>) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    match found {
        Some(key) => {
            w.write_bool(true);
            w.write_cas_key(&key);
        }
        None => {
            w.write_bool(false);
        }
    }
    w.into_bytes()
}

pub fn decode_file_response(body: &[u8]) -> UbaResult<Option<CasKey>> {
    let mut r = BinaryReader::new(body);
    if !r.read_bool().map_err(|_| eof_err())? {
        return Ok(None);
    }
    Ok(Some(r.read_cas_key().map_err(|_| eof_err())?))
}

/// `[found: bool][CasKey][last_seen: u64]`, the reply to
/// `GetNameToHashFromServer`.
pub fn encode_name_to_hash_response(found: Option<(CasKey, u64)>) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    match found {
        Some((hash, last_seen)) => {
            w.write_bool(true);
            w.write_cas_key(&hash);
            w.write_u64(last_seen);
        }
        None => {
            w.write_bool(false);
        }
    }
    w.into_bytes()
}

pub fn decode_name_to_hash_response(body: &[u8]) -> UbaResult<Option<(CasKey, u64)>> {
    let mut r = BinaryReader::new(body);
    if !r.read_bool().map_err(|_| eof_err())? {
        return Ok(None);
    }
    let hash = r.read_cas_key().map_err(|_| eof_err())?;
    let last_seen = r.read_u64().map_err(|_| eof_err())?;
    Ok(Some((hash, last_seen)))
}

/// `[found: bool][DirectoryRow fields, no key]`, the reply to
/// `GetDirectoriesFromServer`.
pub fn encode_directory_response(found: Option<&DirectoryRow>) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    match found {
        Some(row) => {
            w.write_bool(true);
            w.write_bool(row.exists);
            w.write_u32(row.attributes);
            w.write_u64(row.size);
            w.write_u64(row.mtime);
            w.write_bool(row.tombstone);
            w.write_u32(row.children.len() as u32);
            for child in &row.children {
                w.write_string_key(child);
            }
        }
        None => {
            w.write_bool(false);
        }
    }
    w.into_bytes()
}

pub fn decode_directory_response(body: &[u8]) -> UbaResult<Option<DirectoryRow>> {
    let mut r = BinaryReader::new(body);
    if !r.read_bool().map_err(|_| eof_err())? {
        return Ok(None);
    }
    let exists = r.read_bool().map_err(|_| eof_err())?;
    let attributes = r.read_u32().map_err(|_| eof_err())?;
    let size = r.read_u64().map_err(|_| eof_err())?;
    let mtime = r.read_u64().map_err(|_| eof_err())?;
    let tombstone = r.read_bool().map_err(|_| eof_err())?;
    let child_count = r.read_u32().map_err(|_| eof_err())?;
    let mut children = Vec::with_capacity(child_count as usize);
    for _ in 0..child_count {
        children.push(r.read_string_key().map_err(|_| eof_err())?);
    }
    Ok(Some(DirectoryRow {
        exists,
        attributes,
        size,
        mtime,
        children,
        tombstone,
    }))
}

/// `[u32 wire code][process body if Process]`, the reply to
/// `GetNextProcess`.
pub fn encode_next_process_response(response: &NextProcessResponse) -> Vec<u8> {
    let mut w = BinaryWriter::new();
    w.write_u32(response.as_wire_value());
    if let NextProcessResponse::Process(info) = response {
        w.write_u64(info.id);
        w.write_u32(info.argv.len() as u32);
        for arg in &info.argv {
            w.write_string(arg);
        }
        w.write_string(&info.working_dir);
        w.write_u32(info.dependencies.len() as u32);
        for dep in &info.dependencies {
            w.write_u64(*dep);
        }
        w.write_bool(info.cache_bucket_id.is_some());
        if let Some(bucket) = info.cache_bucket_id {
            w.write_u32(bucket);
        }
    }
    w.into_bytes()
}

pub fn decode_next_process_response(body: &[u8]) -> UbaResult<NextProcessResponse> {
    let mut r = BinaryReader::new(body);
    let code = r.read_u32().map_err(|_| eof_err())?;
    if code == uba_proto::ProcessAvailableResponse::Disconnect.as_u32() {
        return Ok(NextProcessResponse::Disconnect);
    }
    if code == uba_proto::ProcessAvailableResponse::RemoteExecutionDisabled.as_u32() {
        return Ok(NextProcessResponse::RemoteExecutionDisabled);
    }
    if r.remaining() == 0 {
        return Ok(NextProcessResponse::None);
    }

    let id = r.read_u64().map_err(|_| eof_err())?;
    let argc = r.read_u32().map_err(|_| eof_err())?;
    let mut argv = Vec::with_capacity(argc as usize);
    for _ in 0..argc {
        argv.push(r.read_string().map_err(|_| eof_err())?);
    }
    let working_dir = r.read_string().map_err(|_| eof_err())?;
    let dep_count = r.read_u32().map_err(|_| eof_err())?;
    let mut dependencies = Vec::with_capacity(dep_count as usize);
    for _ in 0..dep_count {
        dependencies.push(r.read_u64().map_err(|_| eof_err())?);
    }
    let has_bucket = r.read_bool().map_err(|_| eof_err())?;
    let cache_bucket_id = if has_bucket {
        Some(r.read_u32().map_err(|_| eof_err())?)
    } else {
        None
    };

    Ok(NextProcessResponse::Process(ProcessInfo {
        id,
        argv,
        working_dir,
        roots: None,
        weight: 1.0,
        dependencies,
        cache_bucket_id,
        exit_code: None,
        log_lines: Vec::new(),
    }))
}

/// Derives an output's custom CasKey from the tracked-inputs trace
/// rather than its natural content hash, so non-deterministic outputs
/// remain reusable across runs with identical inputs. The input-trace format is versioned so
/// it stays stable across crate versions.
pub const TRACKED_INPUT_TRACE_VERSION: u32 = 1;

pub fn custom_cas_key_from_tracked_inputs(tracked_inputs: &[u8]) -> CasKey {
    let mut buf = Vec::with_capacity(tracked_inputs.len() + 4);
    buf.extend_from_slice(&TRACKED_INPUT_TRACE_VERSION.to_le_bytes());
    buf.extend_from_slice(tracked_inputs);
    CasKey::hash_content(&buf, uba_proto::CasFlags::empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roots_devirtualize_and_virtualize_round_trip() {
        let mut roots = RootPaths::new();
        roots.add("V:/src", "/home/build/src", 0);
        let local = roots.devirtualize("V:/src/main.cpp");
        assert_eq!(local, "/home/build/src/main.cpp");
        let virt = roots.virtualize(&local);
        assert_eq!(virt, "V:/src/main.cpp");
    }

    #[test]
    fn roots_registry_round_trips_handle() {
        let registry = RootsRegistry::new();
        let mut roots = RootPaths::new();
        roots.add("V:/", "/root/", 0);
        let handle = registry.register(roots);
        assert!(registry.get(handle).is_some());
    }

    #[test]
    fn directory_table_append_then_parse_new_rows() {
        let dir = tempdir().unwrap();
        let table = DirectoryTable::create(&dir.path().join("dirtable.bin"), 1 << 20).unwrap();
        let key = StringKey::from_path("a.cpp", true);
        table
            .insert(
                key,
                DirectoryRow {
                    exists: true,
                    attributes: 0,
                    size: 10,
                    mtime: 1,
                    children: vec![],
                    tombstone: false,
                },
            )
            .unwrap();

        table.parse_new_rows();
        let row = table.get(&key).unwrap();
        assert!(row.exists);
        assert_eq!(row.size, 10);
    }

    #[test]
    fn directory_table_tombstone_marks_deleted() {
        let dir = tempdir().unwrap();
        let table = DirectoryTable::create(&dir.path().join("dirtable.bin"), 1 << 20).unwrap();
        let key = StringKey::from_path("b.cpp", true);
        table.tombstone(key).unwrap();
        table.parse_new_rows();
        assert!(table.get(&key).unwrap().tombstone);
    }

    #[test]
    fn name_to_hash_table_round_trips() {
        let dir = tempdir().unwrap();
        let table = NameToHashTable::create(&dir.path().join("n2h.bin"), 1 << 20).unwrap();
        let name = StringKey::from_path("out.o", true);
        let hash = CasKey::hash_content(b"object file bytes", uba_proto::CasFlags::empty());
        table.insert(name, hash, 42).unwrap();
        table.parse_new_rows();
        assert_eq!(table.get(&name), Some((hash, 42)));
    }

    #[test]
    fn dependency_law_blocks_running_until_deps_finish() {
        let registry = ProcessRegistry::new();
        registry.enqueue(ProcessInfo {
            id: 1,
            argv: vec!["cc".into()],
            working_dir: ".".into(),
            roots: None,
            weight: 1.0,
            dependencies: vec![],
            cache_bucket_id: None,
            exit_code: None,
            log_lines: vec![],
        });
        registry.enqueue(ProcessInfo {
            id: 2,
            argv: vec!["link".into()],
            working_dir: ".".into(),
            roots: None,
            weight: 1.0,
            dependencies: vec![1],
            cache_bucket_id: None,
            exit_code: None,
            log_lines: vec![],
        });

        assert!(!registry.dependencies_satisfied(2));
        registry.set_state(1, ProcessState::Finished(FinishedKind::Success));
        assert!(registry.dependencies_satisfied(2));
    }

    #[test]
    fn custom_cas_key_is_deterministic_for_same_tracked_inputs() {
        let a = custom_cas_key_from_tracked_inputs(b"trace-bytes");
        let b = custom_cas_key_from_tracked_inputs(b"trace-bytes");
        assert!(a.content_eq(&b));
    }

    fn sample_process(id: u64, dependencies: Vec<u64>) -> ProcessInfo {
        ProcessInfo {
            id,
            argv: vec!["cc".into()],
            working_dir: ".".into(),
            roots: None,
            weight: 1.0,
            dependencies,
            cache_bucket_id: None,
            exit_code: None,
            log_lines: vec![],
        }
    }

    #[test]
    fn take_next_ready_skips_unsatisfied_dependencies() {
        let registry = ProcessRegistry::new();
        registry.enqueue(sample_process(1, vec![]));
        registry.enqueue(sample_process(2, vec![1]));

        let claimed = registry.take_next_ready().unwrap();
        assert_eq!(claimed.id, 1);
        assert_eq!(registry.state(1), Some(ProcessState::Running(RunningKind::Remote)));
        assert!(registry.take_next_ready().is_none());

        registry.set_state(1, ProcessState::Finished(FinishedKind::Success));
        let claimed = registry.take_next_ready().unwrap();
        assert_eq!(claimed.id, 2);
    }

    #[test]
    fn all_finished_tracks_terminal_states() {
        let registry = ProcessRegistry::new();
        assert!(registry.all_finished());
        registry.enqueue(sample_process(1, vec![]));
        assert!(!registry.all_finished());
        registry.set_state(1, ProcessState::Finished(FinishedKind::Success));
        assert!(registry.all_finished());
    }

    #[test]
    fn helper_request_round_trips_by_message_type() {
        let key = StringKey::from_path("a.cpp", true);
        let body = encode_helper_request_key(&key);
        let decoded =
            decode_helper_request(uba_proto::SessionMessageType::GetDirectoriesFromServer as u8, &body).unwrap();
        assert!(matches!(decoded, HelperRequest::GetDirectoriesFromServer(k) if k == key));
    }

    #[test]
    fn file_response_round_trips() {
        let hash = CasKey::hash_content(b"bytes", uba_proto::CasFlags::empty());
        let encoded = encode_file_response(Some(hash));
        assert_eq!(decode_file_response(&encoded).unwrap(), Some(hash));
        assert_eq!(decode_file_response(&encode_file_response(None)).unwrap(), None);
    }

    #[test]
    fn name_to_hash_response_round_trips() {
        let hash = CasKey::hash_content(b"bytes", uba_proto::CasFlags::empty());
        let encoded = encode_name_to_hash_response(Some((hash, 7)));
        assert_eq!(decode_name_to_hash_response(&encoded).unwrap(), Some((hash, 7)));
        assert_eq!(
            decode_name_to_hash_response(&encode_name_to_hash_response(None)).unwrap(),
            None
        );
    }

    #[test]
    fn directory_response_round_trips() {
        let row = DirectoryRow {
            exists: true,
            attributes: 1,
            size: 99,
            mtime: 2,
            children: vec![StringKey::from_path("child", true)],
            tombstone: false,
        };
        let encoded = encode_directory_response(Some(&row));
        let decoded = decode_directory_response(&encoded).unwrap().unwrap();
        assert_eq!(decoded.size, 99);
        assert_eq!(decoded.children, row.children);
        assert!(decode_directory_response(&encode_directory_response(None)).unwrap().is_none());
    }

    #[test]
    fn next_process_response_round_trips() {
        let process = sample_process(5, vec![1, 2]);
        let encoded = encode_next_process_response(&NextProcessResponse::Process(process));
        match decode_next_process_response(&encoded).unwrap() {
            NextProcessResponse::Process(info) => {
                assert_eq!(info.id, 5);
                assert_eq!(info.dependencies, vec![1, 2]);
            }
            other => panic!("expected Process, got {other:?}"),
        }

        let encoded_disconnect = encode_next_process_response(&NextProcessResponse::Disconnect);
        assert!(matches!(
            decode_next_process_response(&encoded_disconnect).unwrap(),
            NextProcessResponse::Disconnect
        ));
    }
}
