//! Network Client/Server: the handshake, the 16-bit message
//! id pool, request/response matching, keep-alive, and the config-fetch
//! exchange on top of the framing layer.
//!
//! Builds on `manager/transport.rs`'s `TransportManager` connection
//! bookkeeping, generalized from "one active transport" to "a pool of
//! connections to one peer, round-robin dispatched" plus a
//! request/response future matched by message id, which this protocol
//! needs and a single-shot RPC style does not.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use uba_proto::wire::{BinaryReader, BinaryWriter, RecvFrameHeader, SendFrameHeader};
use uba_proto::{
    HandshakeError, ServiceId, SessionMessageType, CACHE_NETWORK_VERSION, KEEP_ALIVE_IDLE_SECONDS,
    SESSION_NETWORK_VERSION, STORAGE_NETWORK_VERSION, SYSTEM_NETWORK_VERSION,
};

use crate::crypto::{client_handshake_blob, verify_handshake_blob, CryptoKey};
use crate::error::{ProtocolError, TransportError, UbaResult};
use crate::framing::{ConnectionHandle, ConnectionPool, RecvFrame, TcpTransport};
use crate::session::{
    decode_helper_request, encode_directory_response, encode_file_response, encode_name_to_hash_response,
    encode_next_process_response, DirectoryTable, HelperRequest, NameToHashTable, NextProcessResponse,
    ProcessRegistry,
};

/// Picks the version constant for a service id.
pub fn network_version_for(service: ServiceId) -> u32 {
    match service {
        ServiceId::System => SYSTEM_NETWORK_VERSION,
        ServiceId::Storage => STORAGE_NETWORK_VERSION,
        ServiceId::Session => SESSION_NETWORK_VERSION,
        ServiceId::Cache => CACHE_NETWORK_VERSION,
    }
}

/// 16-bit message id, pool-allocated per client and reused once its
/// in-flight exchange completes.
struct MessageIdPool {
    next: AtomicU16,
    in_flight: DashMap<u16, ()>,
}

impl MessageIdPool {
    const MAX_IN_FLIGHT: usize = 65534;

    fn new() -> Self {
        Self {
            next: AtomicU16::new(1),
            in_flight: DashMap::new(),
        }
    }

    /// Allocates the next free id, sleeping 100-1000ms and retrying if
    /// the pool is saturated.
    async fn allocate(&self) -> UbaResult<u16> {
        let mut backoff_ms = 100u64;
        loop {
            if self.in_flight.len() >= Self::MAX_IN_FLIGHT {
                warn!("message id pool saturated, backing off {backoff_ms}ms");
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(1000);
                continue;
            }
            for _ in 0..u16::MAX as u32 + 1 {
                let id = self.next.fetch_add(1, Ordering::Relaxed);
                if id == 0 {
                    continue; // id 0 reserved for unsolicited/system frames
                }
                if self.in_flight.insert(id, ()).is_none() {
                    return Ok(id);
                }
            }
            return Err(TransportError::MessageIdPoolExhausted.into());
        }
    }

    fn release(&self, id: u16) {
        self.in_flight.remove(&id);
    }
}

/// A pending request awaiting its response frame.
struct PendingRequest {
    responder: oneshot::Sender<UbaResult<Vec<u8>>>,
}

/// Client side of one logical peer connection: a pool of transport
/// handles, the message id allocator, pending-request table, and
/// optional encryption.
pub struct NetworkClient {
    transport: Arc<TcpTransport>,
    pool: Mutex<ConnectionPool>,
    ids: MessageIdPool,
    pending: DashMap<u16, PendingRequest>,
    crypto_key: Option<CryptoKey>,
    client_guid: Uuid,
    server_guid: Mutex<Option<Uuid>>,
}

impl NetworkClient {
    pub async fn connect(
        host: &str,
        port: u16,
        connection_count: u32,
        crypto_key: Option<CryptoKey>,
    ) -> UbaResult<Arc<Self>> {
        let transport = TcpTransport::new();
        let mut handles = Vec::new();
        for _ in 0..connection_count.max(1) {
            handles.push(transport.connect(host, port).await?);
        }

        let client = Arc::new(Self {
            transport: Arc::clone(&transport),
            pool: Mutex::new(ConnectionPool::new(handles.clone())),
            ids: MessageIdPool::new(),
            pending: DashMap::new(),
            crypto_key,
            client_guid: Uuid::new_v4(),
            server_guid: Mutex::new(None),
        });

        for handle in &handles {
            client.handshake(*handle).await?;
        }

        let dispatch = Arc::clone(&client);
        tokio::spawn(async move { dispatch.dispatch_loop().await });

        info!(%client.client_guid, connections = handles.len(), "network client connected");
        Ok(client)
    }

    /// `[optional encrypted blob][u32 version][16-byte client GUID]` sent,
    /// `[1 byte error][16-byte server GUID]` received.
    async fn handshake(&self, handle: ConnectionHandle) -> UbaResult<()> {
        let mut writer = BinaryWriter::new();
        if let Some(key) = &self.crypto_key {
            let blob = client_handshake_blob(key);
            writer.write_bytes(&blob);
        }
        writer.write_u32(SYSTEM_NETWORK_VERSION);
        writer.write_guid(self.client_guid.as_bytes());

        let header = SendFrameHeader {
            service_id: ServiceId::System as u8,
            message_type: 0,
            message_id: 0,
            body_size: writer.len() as u32,
        };
        self.transport.send(handle, header, writer.as_bytes()).await?;

        let (_, frame) = tokio::time::timeout(Duration::from_secs(20), self.recv_handshake_reply(handle))
            .await
            .map_err(|_| TransportError::DialTimeout {
                host: String::new(),
                port: 0,
                timeout_ms: 20_000,
            })?;

        let mut reader = BinaryReader::new(&frame.body);
        let error_byte = reader.read_u8().map_err(|_| ProtocolError::UnknownMessage {
            service_id: 0,
            message_type: 0,
        })?;
        let server_guid_bytes = reader.read_guid().map_err(|_| ProtocolError::UnknownMessage {
            service_id: 0,
            message_type: 0,
        })?;

        match HandshakeError::from_u8(error_byte) {
            Some(HandshakeError::Ok) => {
                *self.server_guid.lock().await = Some(Uuid::from_bytes(server_guid_bytes));
                Ok(())
            }
            Some(HandshakeError::VersionMismatch) => Err(ProtocolError::VersionMismatch {
                expected: SYSTEM_NETWORK_VERSION,
                actual: 0,
            }
            .into()),
            Some(HandshakeError::BadClientGuid) => Err(ProtocolError::BadClientGuid.into()),
            Some(HandshakeError::ZeroServerGuid) => Err(ProtocolError::ZeroServerGuid.into()),
            Some(HandshakeError::WrongServerGuid) => Err(ProtocolError::WrongServerGuid.into()),
            // Cases 3/4 surface as a plain retryable timeout.
            Some(HandshakeError::NewClientsDisallowed)
            | Some(HandshakeError::ServerDisconnectedEarly) => Err(TransportError::DialTimeout {
                host: String::new(),
                port: 0,
                timeout_ms: 0,
            }
            .into()),
            None => Err(ProtocolError::UnknownMessage {
                service_id: 0,
                message_type: 0,
            }
            .into()),
        }
    }

    async fn recv_handshake_reply(&self, expect: ConnectionHandle) -> (ConnectionHandle, RecvFrame) {
        loop {
            if let Some((from, frame)) = self.transport.recv().await {
                if from == expect {
                    return (from, frame);
                }
            }
        }
    }

    /// Background task: demultiplexes response frames to whichever
    /// pending request matches the 16-bit message id.
    async fn dispatch_loop(self: Arc<Self>) {
        while let Some((_, frame)) = self.transport.recv().await {
            let id = frame.message_id;
            if let Some((_, pending)) = self.pending.remove(&id) {
                self.ids.release(id);
                let result = if frame.is_error() {
                    Err(TransportError::PeerDisconnected.into())
                } else {
                    Ok(frame.body)
                };
                let _ = pending.responder.send(result);
            }
        }
    }

    /// Sends a request and awaits its matched response.
    pub async fn request(
        &self,
        service: ServiceId,
        message_type: u8,
        body: &[u8],
    ) -> UbaResult<Vec<u8>> {
        let handle = {
            let pool = self.pool.lock().await;
            pool.next(&self.transport).ok_or(TransportError::PeerDisconnected)?
        };

        let id = self.ids.allocate().await?;
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, PendingRequest { responder: tx });

        let header = SendFrameHeader {
            service_id: service as u8,
            message_type,
            message_id: id,
            body_size: body.len() as u32,
        };

        if let Err(e) = self.transport.send(handle, header, body).await {
            self.pending.remove(&id);
            self.ids.release(id);
            return Err(e);
        }

        rx.await.unwrap_or(Err(TransportError::PeerDisconnected.into()))
    }

    /// Fails every in-flight request with `PeerDisconnected`.
    pub fn fail_all_pending(&self) {
        let ids: Vec<u16> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.responder.send(Err(TransportError::PeerDisconnected.into()));
            }
        }
    }

    pub fn client_guid(&self) -> Uuid {
        self.client_guid
    }
}

/// Server-side handshake responder: validates version, optional crypto,
/// and issues a server GUID. Holds the closed set of
/// currently-connected client GUIDs to detect a zero/duplicate GUID.
pub struct HandshakeServer {
    server_guid: Uuid,
    crypto_key: Option<CryptoKey>,
    allow_new_clients: bool,
    known_clients: DashMap<Uuid, ()>,
}

impl HandshakeServer {
    pub fn new(crypto_key: Option<CryptoKey>) -> Self {
        Self {
            server_guid: Uuid::new_v4(),
            crypto_key,
            allow_new_clients: true,
            known_clients: DashMap::new(),
        }
    }

    pub fn set_allow_new_clients(&mut self, allow: bool) {
        self.allow_new_clients = allow;
    }

    /// Parses the client's handshake body and produces the reply body to
    /// send back, or the wire error code to send back on failure.
    pub fn handle_handshake(&self, body: &[u8]) -> (HandshakeError, Vec<u8>) {
        if !self.allow_new_clients {
            return (HandshakeError::NewClientsDisallowed, Vec::new());
        }

        let mut reader = BinaryReader::new(body);
        let has_crypto = self.crypto_key.is_some();
        let expected_len = if has_crypto {
            uba_proto::ENCRYPTION_HANDSHAKE_STRING.len() + 4 + 16
        } else {
            4 + 16
        };
        if body.len() != expected_len {
            return (HandshakeError::BadClientGuid, Vec::new());
        }

        if let Some(key) = &self.crypto_key {
            let blob = match reader.read_bytes(uba_proto::ENCRYPTION_HANDSHAKE_STRING.len()) {
                Ok(b) => b,
                Err(_) => return (HandshakeError::BadClientGuid, Vec::new()),
            };
            if verify_handshake_blob(key, blob).is_err() {
                // encryption failures close the connection before any
                // message id is assigned; reuse BadClientGuid on the wire
                // since there's no dedicated code for it in the closed set.
                return (HandshakeError::BadClientGuid, Vec::new());
            }
        }

        let version = match reader.read_u32() {
            Ok(v) => v,
            Err(_) => return (HandshakeError::BadClientGuid, Vec::new()),
        };
        if version != SYSTEM_NETWORK_VERSION {
            return (
                HandshakeError::VersionMismatch,
                self.server_guid.as_bytes().to_vec(),
            );
        }

        let client_guid = match reader.read_guid() {
            Ok(g) => Uuid::from_bytes(g),
            Err(_) => return (HandshakeError::BadClientGuid, Vec::new()),
        };
        if client_guid.is_nil() {
            return (HandshakeError::BadClientGuid, Vec::new());
        }

        self.known_clients.insert(client_guid, ());
        let mut reply = Vec::new();
        reply.extend_from_slice(self.server_guid.as_bytes());
        (HandshakeError::Ok, reply)
    }

    pub fn server_guid(&self) -> Uuid {
        self.server_guid
    }
}

/// Keep-alive tracker: if no traffic for
/// `KeepAliveIdleSeconds`, the client should emit a probe; if the probe
/// goes unanswered the connection is torn down.
pub struct KeepAlive {
    idle_timeout: Duration,
    last_activity: Mutex<tokio::time::Instant>,
}

impl KeepAlive {
    pub fn new() -> Self {
        Self {
            idle_timeout: Duration::from_secs(KEEP_ALIVE_IDLE_SECONDS),
            last_activity: Mutex::new(tokio::time::Instant::now()),
        }
    }

    pub async fn record_activity(&self) {
        *self.last_activity.lock().await = tokio::time::Instant::now();
    }

    pub async fn is_idle(&self) -> bool {
        self.last_activity.lock().await.elapsed() >= self.idle_timeout
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

/// `FetchConfig`: the server's global config table, streamed
/// as text and overlaid on the client's own config.
pub fn encode_fetch_config_response(text: &str) -> Vec<u8> {
    let mut writer = BinaryWriter::new();
    writer.write_string(text);
    writer.into_bytes()
}

pub fn decode_fetch_config_response(body: &[u8]) -> UbaResult<String> {
    let mut reader = BinaryReader::new(body);
    reader
        .read_string()
        .map_err(|_| ProtocolError::UnknownMessage {
            service_id: ServiceId::System as u8,
            message_type: 2,
        }
        .into())
}

/// Tracks per-connection-id recv-side state the handshake server needs
/// when wiring frames to [`HandshakeServer::handle_handshake`] from a
/// generic dispatcher loop.
pub struct ServerConnections {
    pub handshaken: DashMap<ConnectionHandle, Uuid>,
    pub retry_map: Mutex<HashMap<Uuid, ConnectionHandle>>,
}

impl ServerConnections {
    pub fn new() -> Self {
        Self {
            handshaken: DashMap::new(),
            retry_map: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ServerConnections {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept/dispatch loop that drives [`HandshakeServer`] over the wire
/// and then serves the `GetNextProcess`/`GetFileFromServer`/
/// `GetDirectoriesFromServer`/`GetNameToHashFromServer` round trips for
/// every handshaken connection. One instance per listening port.
pub struct SessionServer {
    transport: Arc<TcpTransport>,
    handshake: HandshakeServer,
    connections: ServerConnections,
    registry: Arc<ProcessRegistry>,
    directories: Arc<DirectoryTable>,
    name_to_hash: Arc<NameToHashTable>,
}

impl SessionServer {
    pub fn new(
        crypto_key: Option<CryptoKey>,
        registry: Arc<ProcessRegistry>,
        directories: Arc<DirectoryTable>,
        name_to_hash: Arc<NameToHashTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport: TcpTransport::new(),
            handshake: HandshakeServer::new(crypto_key),
            connections: ServerConnections::new(),
            registry,
            directories,
            name_to_hash,
        })
    }

    /// Binds `bind_addr:port` and spawns the dispatch loop driving every
    /// accepted connection.
    pub async fn listen(self: &Arc<Self>, bind_addr: &str, port: u16) -> UbaResult<()> {
        // `start_listen` only pushes accepted handles onto this channel for
        // callers that care which connection is which; the dispatch loop
        // below reads frames from every connection regardless, so this side
        // just has to stay drained or the accept loop sees a dropped
        // receiver and stops after the first connection.
        let mut accepted = self.transport.start_listen(bind_addr, port).await?;
        tokio::spawn(async move { while accepted.recv().await.is_some() {} });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch_loop().await });
        Ok(())
    }

    async fn dispatch_loop(self: Arc<Self>) {
        while let Some((handle, frame)) = self.transport.recv().await {
            if !self.connections.handshaken.contains_key(&handle) {
                self.handle_handshake_frame(handle, &frame).await;
            } else {
                self.handle_request_frame(handle, &frame).await;
            }
        }
    }

    /// The first frame on a fresh connection is always the handshake
    /// body; a GUID is registered on success so later frames skip this
    /// branch.
    async fn handle_handshake_frame(&self, handle: ConnectionHandle, frame: &RecvFrame) {
        let (error, reply_tail) = self.handshake.handle_handshake(&frame.body);
        if error == HandshakeError::Ok {
            if let Some(tail) = frame.body.get(frame.body.len().saturating_sub(16)..) {
                if let Ok(guid_bytes) = <[u8; 16]>::try_from(tail) {
                    self.connections.handshaken.insert(handle, Uuid::from_bytes(guid_bytes));
                }
            }
        }
        let mut reply = vec![error as u8];
        reply.extend_from_slice(&reply_tail);
        let header = RecvFrameHeader {
            message_id: 0,
            body_size: reply.len() as u32,
        };
        let _ = self.transport.send_reply(handle, header, &reply).await;
    }

    async fn handle_request_frame(&self, handle: ConnectionHandle, frame: &RecvFrame) {
        if ServiceId::from_bits(frame.service_id) != Some(ServiceId::Session) {
            self.send_error(handle, frame.message_id).await;
            return;
        }

        let reply_body = match SessionMessageType::from_bits(frame.message_type) {
            Some(SessionMessageType::GetNextProcess) => {
                let response = match self.registry.take_next_ready() {
                    Some(info) => NextProcessResponse::Process(info),
                    None if self.registry.all_finished() => NextProcessResponse::Disconnect,
                    None => NextProcessResponse::None,
                };
                Some(encode_next_process_response(&response))
            }
            Some(message_type @ SessionMessageType::GetFileFromServer) => {
                self.lookup_reply(message_type, &frame.body)
            }
            Some(message_type @ SessionMessageType::GetDirectoriesFromServer) => {
                self.lookup_reply(message_type, &frame.body)
            }
            Some(message_type @ SessionMessageType::GetNameToHashFromServer) => {
                self.lookup_reply(message_type, &frame.body)
            }
            _ => None,
        };

        match reply_body {
            Some(body) => {
                let header = RecvFrameHeader {
                    message_id: frame.message_id,
                    body_size: body.len() as u32,
                };
                let _ = self.transport.send_reply(handle, header, &body).await;
            }
            None => self.send_error(handle, frame.message_id).await,
        }
    }

    fn lookup_reply(&self, message_type: SessionMessageType, body: &[u8]) -> Option<Vec<u8>> {
        let request = decode_helper_request(message_type as u8, body).ok()?;
        Some(match request {
            HelperRequest::GetFileFromServer(key) => {
                encode_file_response(self.name_to_hash.get(&key).map(|(hash, _)| hash))
            }
            HelperRequest::GetDirectoriesFromServer(key) => {
                encode_directory_response(self.directories.get(&key).as_ref())
            }
            HelperRequest::GetNameToHashFromServer(key) => {
                encode_name_to_hash_response(self.name_to_hash.get(&key))
            }
        })
    }

    async fn send_error(&self, handle: ConnectionHandle, message_id: u16) {
        let header = RecvFrameHeader {
            message_id,
            body_size: uba_proto::MESSAGE_ERROR_SIZE,
        };
        let _ = self.transport.send_reply(handle, header, &[]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_server_rejects_version_mismatch() {
        let server = HandshakeServer::new(None);
        let mut body = Vec::new();
        body.extend_from_slice(&999u32.to_le_bytes());
        body.extend_from_slice(Uuid::new_v4().as_bytes());
        let (code, _) = server.handle_handshake(&body);
        assert_eq!(code, HandshakeError::VersionMismatch);
    }

    #[test]
    fn handshake_server_rejects_nil_guid() {
        let server = HandshakeServer::new(None);
        let mut body = Vec::new();
        body.extend_from_slice(&SYSTEM_NETWORK_VERSION.to_le_bytes());
        body.extend_from_slice(Uuid::nil().as_bytes());
        let (code, _) = server.handle_handshake(&body);
        assert_eq!(code, HandshakeError::BadClientGuid);
    }

    #[test]
    fn handshake_server_accepts_well_formed_client() {
        let server = HandshakeServer::new(None);
        let mut body = Vec::new();
        body.extend_from_slice(&SYSTEM_NETWORK_VERSION.to_le_bytes());
        body.extend_from_slice(Uuid::new_v4().as_bytes());
        let (code, reply) = server.handle_handshake(&body);
        assert_eq!(code, HandshakeError::Ok);
        assert_eq!(reply.len(), 16);
    }

    #[test]
    fn handshake_server_disallows_new_clients_when_configured() {
        let mut server = HandshakeServer::new(None);
        server.set_allow_new_clients(false);
        let mut body = Vec::new();
        body.extend_from_slice(&SYSTEM_NETWORK_VERSION.to_le_bytes());
        body.extend_from_slice(Uuid::new_v4().as_bytes());
        let (code, _) = server.handle_handshake(&body);
        assert_eq!(code, HandshakeError::NewClientsDisallowed);
        assert!(code.is_retry_as_timeout());
    }

    #[test]
    fn fetch_config_round_trips() {
        let encoded = encode_fetch_config_response("[Storage]\ncapacity_bytes = 1024\n");
        let decoded = decode_fetch_config_response(&encoded).unwrap();
        assert_eq!(decoded, "[Storage]\ncapacity_bytes = 1024\n");
    }

    #[tokio::test]
    async fn keep_alive_reports_idle_after_timeout() {
        let keep_alive = KeepAlive {
            idle_timeout: Duration::from_millis(10),
            last_activity: Mutex::new(tokio::time::Instant::now()),
        };
        assert!(!keep_alive.is_idle().await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(keep_alive.is_idle().await);
    }

    async fn handshake_over_raw_transport(transport: &Arc<TcpTransport>, handle: ConnectionHandle) {
        let mut body = Vec::new();
        body.extend_from_slice(&SYSTEM_NETWORK_VERSION.to_le_bytes());
        body.extend_from_slice(Uuid::new_v4().as_bytes());
        let header = SendFrameHeader {
            service_id: ServiceId::System as u8,
            message_type: 0,
            message_id: 0,
            body_size: body.len() as u32,
        };
        transport.send(handle, header, &body).await.unwrap();
        let (_, reply) = transport.recv().await.unwrap();
        assert_eq!(reply.body[0], HandshakeError::Ok as u8);
    }

    #[tokio::test]
    async fn session_server_drives_get_next_process_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let directories = crate::session::DirectoryTable::create(&dir.path().join("dirs.bin"), 1 << 16).unwrap();
        let name_to_hash = crate::session::NameToHashTable::create(&dir.path().join("n2h.bin"), 1 << 16).unwrap();
        let registry = ProcessRegistry::new();
        registry.enqueue(crate::session::ProcessInfo {
            id: 42,
            argv: vec!["cc".into()],
            working_dir: ".".into(),
            roots: None,
            weight: 1.0,
            dependencies: vec![],
            cache_bucket_id: None,
            exit_code: None,
            log_lines: vec![],
        });

        let server = SessionServer::new(None, registry, directories, name_to_hash);
        server.listen("127.0.0.1", 17890).await.unwrap();

        let client = TcpTransport::new();
        let handle = client.connect("127.0.0.1", 17890).await.unwrap();
        handshake_over_raw_transport(&client, handle).await;

        let header = SendFrameHeader {
            service_id: ServiceId::Session as u8,
            message_type: SessionMessageType::GetNextProcess as u8,
            message_id: 1,
            body_size: 0,
        };
        client.send(handle, header, &[]).await.unwrap();
        let (_, reply) = client.recv().await.unwrap();
        assert_eq!(reply.message_id, 1);
        match crate::session::decode_next_process_response(&reply.body).unwrap() {
            NextProcessResponse::Process(info) => assert_eq!(info.id, 42),
            other => panic!("expected a claimed process, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn session_server_resolves_name_to_hash_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let directories = crate::session::DirectoryTable::create(&dir.path().join("dirs.bin"), 1 << 16).unwrap();
        let name_to_hash = crate::session::NameToHashTable::create(&dir.path().join("n2h.bin"), 1 << 16).unwrap();
        let key = uba_proto::StringKey::from_path("out.o", true);
        let hash = uba_proto::CasKey::hash_content(b"object bytes", uba_proto::CasFlags::empty());
        name_to_hash.insert(key, hash, 1).unwrap();
        name_to_hash.parse_new_rows();

        let server = SessionServer::new(None, ProcessRegistry::new(), directories, name_to_hash);
        server.listen("127.0.0.1", 17891).await.unwrap();

        let client = TcpTransport::new();
        let handle = client.connect("127.0.0.1", 17891).await.unwrap();
        handshake_over_raw_transport(&client, handle).await;

        let body = crate::session::encode_helper_request_key(&key);
        let header = SendFrameHeader {
            service_id: ServiceId::Session as u8,
            message_type: SessionMessageType::GetNameToHashFromServer as u8,
            message_id: 2,
            body_size: body.len() as u32,
        };
        client.send(handle, header, &body).await.unwrap();
        let (_, reply) = client.recv().await.unwrap();
        let (found_hash, _) = crate::session::decode_name_to_hash_response(&reply.body).unwrap().unwrap();
        assert!(found_hash.content_eq(&hash));
    }
}
