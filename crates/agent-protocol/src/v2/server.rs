//! Connection runtime for protocol v2: UDS and TCP/gRPC-simulated
//! listeners, handshake, the multiplexed read-dispatch-write loop,
//! keep-alive, cancellation, and draining/shutdown.
//!
//! Grounded in the teacher's `UdsAgentServerV2`/`handle_connection` shape
//! (accept loop spawning one task per connection, handshake-then-event-loop
//! structure), generalised to this crate's tag table, dual transports, and
//! drain/shutdown semantics the teacher did not have.

use crate::capability::{Capabilities, InspectionCapability};
use crate::context::RequestKey;
use crate::decision::DecisionBuilder;
use crate::dispatcher::EventDispatcher;
use crate::errors::AgentProtocolError;
use crate::v2::protocol_metrics::ConnectionMetrics;
use crate::v2::wire::{read_message, write_message, MessageType};
use crate::v2::{
    CancelAllMessage, CancelRequestMessage, DecisionMessageV2, HandshakeRequest, HandshakeResponse,
    RequestBodyChunkV2, RequestHeadersV2, ResponseBodyChunkV2, ResponseHeadersV2, PROTOCOL_VERSION_V2,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// UDS payload cap: 16 MiB - 1 (the frame's 4-byte length includes the tag byte).
pub const MAX_PAYLOAD_UDS: usize = 16 * 1024 * 1024 - 1;
/// TCP/gRPC-simulated payload cap.
pub const MAX_PAYLOAD_TCP: usize = 10 * 1024 * 1024;

/// Which transport a v2 listener binds.
pub enum Transport {
    Uds(PathBuf),
    Tcp(SocketAddr),
}

/// Runtime configuration for one v2 listener. Built from the launcher's
/// `AgentConfig` (see `launcher.rs`).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub agent_name: String,
    pub handshake_timeout: Duration,
    pub request_timeout: Option<Duration>,
    pub max_connections: usize,
    pub enable_keep_alive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agent_name: "outpost-agent".to_string(),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: None,
            max_connections: 1024,
            enable_keep_alive: true,
        }
    }
}

struct ConnectionHandle {
    dispatcher: Arc<EventDispatcher>,
    close: Arc<Notify>,
}

/// The v2 agent server: owns the listener, the draining/shutdown state, and
/// the registry of live connections.
pub struct AgentServerV2 {
    capability: Arc<dyn InspectionCapability>,
    config: ServerConfig,
    metrics: Arc<ConnectionMetrics>,
    draining: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    critical_section: Arc<tokio::sync::Mutex<()>>,
    connections: Arc<DashMap<u64, ConnectionHandle>>,
    next_conn_id: Arc<AtomicU64>,
}

impl AgentServerV2 {
    pub fn new(capability: Arc<dyn InspectionCapability>, config: ServerConfig) -> Self {
        Self {
            capability,
            config,
            metrics: Arc::new(ConnectionMetrics::new()),
            draining: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            critical_section: Arc::new(tokio::sync::Mutex::new(())),
            connections: Arc::new(DashMap::new()),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn metrics(&self) -> &ConnectionMetrics {
        &self.metrics
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Refuse new connections and new `request_headers` events; let
    /// in-progress requests run to completion.
    pub async fn drain(&self, timeout_ms: u64) {
        let _guard = self.critical_section.lock().await;
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        self.capability.on_drain(timeout_ms).await;
    }

    /// Enter drain, cancel every in-flight context on every connection,
    /// invoke `on_shutdown`, and signal every connection task to close.
    /// Idempotent: a second call is a no-op.
    pub async fn shutdown(&self) {
        let _guard = self.critical_section.lock().await;
        let already_draining = self.draining.swap(true, Ordering::SeqCst);
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if !already_draining {
            self.capability.on_drain(0).await;
        }
        for entry in self.connections.iter() {
            entry.dispatcher.dispatch_cancel_all("Agent shutdown").await;
            entry.close.notify_one();
        }
        self.connections.clear();
        self.capability.on_shutdown().await;
    }

    /// Bind and run the accept loop until `shutdown()` is called.
    pub async fn run(&self, transport: Transport) -> Result<(), AgentProtocolError> {
        match transport {
            Transport::Uds(path) => self.run_uds(path).await,
            Transport::Tcp(addr) => self.run_tcp(addr).await,
        }
    }

    async fn run_uds(&self, socket_path: PathBuf) -> Result<(), AgentProtocolError> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        let listener = UnixListener::bind(&socket_path)?;
        info!(socket_path = %socket_path.display(), "v2 UDS listener bound");

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    self.accept_connection(stream, MAX_PAYLOAD_UDS).await;
                }
                Err(e) => {
                    error!(error = %e, "UDS accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        let _ = std::fs::remove_file(&socket_path);
        Ok(())
    }

    async fn run_tcp(&self, addr: SocketAddr) -> Result<(), AgentProtocolError> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "v2 TCP (gRPC-simulated) listener bound");

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nodelay(true);
                    self.accept_connection(stream, MAX_PAYLOAD_TCP).await;
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        Ok(())
    }

    async fn accept_connection<S>(&self, stream: S, max_payload: usize)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.draining.load(Ordering::SeqCst) {
            self.metrics.inc_rejected();
            drop(stream);
            return;
        }
        if self.connections.len() >= self.config.max_connections {
            self.metrics.inc_rejected();
            drop(stream);
            return;
        }
        self.metrics.inc_accepted();

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let dispatcher = Arc::new(EventDispatcher::new(self.capability.clone()));
        let close = Arc::new(Notify::new());
        self.connections.insert(
            conn_id,
            ConnectionHandle {
                dispatcher: dispatcher.clone(),
                close: close.clone(),
            },
        );

        let capability = self.capability.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let draining = self.draining.clone();
        let connections = self.connections.clone();

        tokio::spawn(async move {
            let result = run_connection(
                stream,
                max_payload,
                dispatcher,
                capability.clone(),
                &config,
                &metrics,
                &draining,
                close,
            )
            .await;

            connections.remove(&conn_id);
            metrics.dec_active();
            let error_msg = result.as_ref().err().map(|e| e.to_string());
            capability.on_stream_closed(error_msg.as_deref()).await;
            if let Err(e) = result {
                if !matches!(e, AgentProtocolError::ConnectionClosed) {
                    debug!(error = %e, "v2 connection closed with error");
                }
            }
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_connection<S>(
    stream: S,
    max_payload: usize,
    dispatcher: Arc<EventDispatcher>,
    capability: Arc<dyn InspectionCapability>,
    config: &ServerConfig,
    metrics: &Arc<ConnectionMetrics>,
    draining: &Arc<AtomicBool>,
    close: Arc<Notify>,
) -> Result<(), AgentProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    // ── Handshake ─────────────────────────────────────────────────────
    let (tag, payload) = timeout(config.handshake_timeout, read_message(&mut reader, max_payload))
        .await
        .map_err(|_| AgentProtocolError::Timeout(config.handshake_timeout))??;

    if tag != MessageType::HandshakeReq as u8 {
        metrics.inc_handshake_failures();
        return Err(AgentProtocolError::HandshakeFailed(
            "first frame was not HandshakeReq".to_string(),
        ));
    }
    let _req: HandshakeRequest = serde_json::from_slice(&payload)
        .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string()))?;

    let capabilities: Capabilities = capability.capabilities();
    let response = HandshakeResponse::new(config.agent_name.clone(), capabilities);
    let resp_bytes =
        serde_json::to_vec(&response).map_err(|e| AgentProtocolError::Serialization(e.to_string()))?;
    write_message(&mut writer, MessageType::HandshakeResp, &resp_bytes, max_payload).await?;

    info!(agent_name = %config.agent_name, "v2 handshake complete");

    // ── Event loop ────────────────────────────────────────────────────
    loop {
        let next = tokio::select! {
            biased;
            _ = close.notified() => break,
            frame = read_message(&mut reader, max_payload) => frame,
        };

        let (tag, payload) = match next {
            Ok(v) => v,
            Err(AgentProtocolError::ConnectionClosed) => break,
            Err(e) => {
                metrics.inc_protocol_errors();
                return Err(e);
            }
        };

        metrics.inc_requests();

        let msg_type = match MessageType::try_from(tag) {
            Ok(t) => t,
            Err(unknown) => {
                warn!(tag = format!("0x{unknown:02x}"), "unknown v2 message tag; skipping");
                continue;
            }
        };

        match msg_type {
            MessageType::Ping => {
                write_message(&mut writer, MessageType::Pong, &payload, max_payload).await?;
            }
            MessageType::Pong => {
                // No reply; keep-alive is respond-only on our side.
            }
            MessageType::CancelRequest => {
                let msg: CancelRequestMessage = match serde_json::from_slice(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, "malformed CancelRequest; ignoring");
                        continue;
                    }
                };
                dispatcher
                    .dispatch_cancel_request(RequestKey::V2(msg.request_id), msg.reason)
                    .await;
            }
            MessageType::CancelAll => {
                let msg: CancelAllMessage = serde_json::from_slice(&payload).unwrap_or_default();
                dispatcher
                    .dispatch_cancel_all(msg.reason.as_deref().unwrap_or("peer requested cancel_all"))
                    .await;
            }
            MessageType::RequestHeaders => {
                let event: RequestHeadersV2 = match serde_json::from_slice(&payload) {
                    Ok(e) => e,
                    Err(e) => return Err(AgentProtocolError::InvalidMessage(e.to_string())),
                };
                let request_id = event.request_id;
                let decision = if draining.load(Ordering::SeqCst) {
                    DecisionBuilder::deny().block(503).with_body("Agent is draining")
                } else {
                    let key = RequestKey::V2(request_id);
                    let fut = dispatcher.dispatch_request_headers(
                        key.clone(),
                        event.method,
                        event.uri,
                        event.headers,
                        event.metadata.client_ip,
                        event.metadata.route_id,
                    );
                    run_with_optional_timeout(&dispatcher, &key, config.request_timeout, fut)
                        .await
                };
                write_decision(&mut writer, request_id, decision, max_payload, metrics).await?;
            }
            MessageType::RequestBodyChunk => {
                let event: RequestBodyChunkV2 = match serde_json::from_slice(&payload) {
                    Ok(e) => e,
                    Err(e) => return Err(AgentProtocolError::InvalidMessage(e.to_string())),
                };
                let request_id = event.request_id;
                let chunk = base64_decode(&event.data)?;
                let key = RequestKey::V2(request_id);
                let fut = dispatcher.dispatch_request_body_chunk(key.clone(), &chunk, event.is_last);
                let decision =
                    run_with_optional_timeout(&dispatcher, &key, config.request_timeout, fut)
                        .await;
                write_decision(&mut writer, request_id, decision, max_payload, metrics).await?;
            }
            MessageType::ResponseHeaders => {
                let event: ResponseHeadersV2 = match serde_json::from_slice(&payload) {
                    Ok(e) => e,
                    Err(e) => return Err(AgentProtocolError::InvalidMessage(e.to_string())),
                };
                let request_id = event.request_id;
                let key = RequestKey::V2(request_id);
                let fut = dispatcher.dispatch_response_headers(key.clone(), event.status_code, event.headers);
                let decision =
                    run_with_optional_timeout(&dispatcher, &key, config.request_timeout, fut)
                        .await;
                write_decision(&mut writer, request_id, decision, max_payload, metrics).await?;
            }
            MessageType::ResponseBodyChunk => {
                let event: ResponseBodyChunkV2 = match serde_json::from_slice(&payload) {
                    Ok(e) => e,
                    Err(e) => return Err(AgentProtocolError::InvalidMessage(e.to_string())),
                };
                let request_id = event.request_id;
                let chunk = base64_decode(&event.data)?;
                let key = RequestKey::V2(request_id);
                let fut = dispatcher.dispatch_response_body_chunk(key.clone(), &chunk);
                let decision =
                    run_with_optional_timeout(&dispatcher, &key, config.request_timeout, fut)
                        .await;
                write_decision(&mut writer, request_id, decision, max_payload, metrics).await?;
            }
            MessageType::HandshakeReq | MessageType::HandshakeResp => {
                return Err(AgentProtocolError::ProtocolViolation(
                    "handshake message after handshake completed".to_string(),
                ));
            }
            MessageType::Decision | MessageType::BodyMutation => {
                // Not valid inbound from the peer; ignore defensively.
                warn!(?msg_type, "unexpected outbound-only message type received; skipping");
            }
        }
    }

    Ok(())
}

/// Base64-decode a body-chunk `data` field. A decode failure is a protocol
/// error that terminates the connection, per the wire invariant.
fn base64_decode(data: &str) -> Result<Vec<u8>, AgentProtocolError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| AgentProtocolError::InvalidMessage(format!("bad base64 body chunk: {e}")))
}

async fn run_with_optional_timeout<F>(
    dispatcher: &Arc<EventDispatcher>,
    key: &RequestKey,
    request_timeout: Option<Duration>,
    fut: F,
) -> DecisionBuilder
where
    F: std::future::Future<Output = DecisionBuilder>,
{
    match request_timeout {
        None => fut.await,
        Some(d) => match timeout(d, fut).await {
            Ok(decision) => decision,
            Err(_) => {
                dispatcher
                    .dispatch_cancel_request(key.clone(), Some("timeout".to_string()))
                    .await;
                DecisionBuilder::deny().block(500).with_body("Agent timeout")
            }
        },
    }
}

async fn write_decision<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    request_id: i64,
    decision: DecisionBuilder,
    max_payload: usize,
    metrics: &Arc<ConnectionMetrics>,
) -> Result<(), AgentProtocolError> {
    let start = std::time::Instant::now();
    let msg: DecisionMessageV2 = decision.build_v2(request_id);
    let bytes = serde_json::to_vec(&msg).map_err(|e| AgentProtocolError::Serialization(e.to_string()))?;
    metrics.record_decision_serialization(start.elapsed());
    write_message(writer, MessageType::Decision, &bytes, max_payload).await?;
    metrics.inc_responses();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities as Caps;
    use async_trait::async_trait;
    use tokio::net::UnixStream as ClientStream;

    struct EchoCapability;

    #[async_trait]
    impl InspectionCapability for EchoCapability {
        fn capabilities(&self) -> Caps {
            Caps {
                handles_request_headers: true,
                ..Default::default()
            }
        }
    }

    async fn handshake(stream: &mut ClientStream) {
        let req = HandshakeRequest {
            protocol_version: PROTOCOL_VERSION_V2,
            client_name: "test-proxy".to_string(),
            supported_features: vec![],
            supported_encodings: vec!["json".to_string()],
        };
        let bytes = serde_json::to_vec(&req).unwrap();
        write_message(stream, MessageType::HandshakeReq, &bytes, MAX_PAYLOAD_UDS)
            .await
            .unwrap();
        let (tag, payload) = read_message(stream, MAX_PAYLOAD_UDS).await.unwrap();
        assert_eq!(tag, MessageType::HandshakeResp as u8);
        let _resp: HandshakeResponse = serde_json::from_slice(&payload).unwrap();
    }

    #[tokio::test]
    async fn handshake_then_allow_round_trip_over_real_uds() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("outpost-test.sock");

        let server = Arc::new(AgentServerV2::new(Arc::new(EchoCapability), ServerConfig::default()));
        let server_clone = server.clone();
        let path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _ = server_clone.run(Transport::Uds(path_clone)).await;
        });

        // Give the listener a moment to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = ClientStream::connect(&socket_path).await.unwrap();
        handshake(&mut client).await;

        let event = RequestHeadersV2 {
            request_id: 1,
            metadata: crate::v2::RequestMetadataV2 {
                correlation_id: "c1".to_string(),
                client_ip: "127.0.0.1".to_string(),
                client_port: 9000,
                server_name: None,
                protocol: "http/1.1".to_string(),
                route_id: None,
                timestamp: "2026-01-01T00:00:00Z".to_string(),
            },
            method: "GET".to_string(),
            uri: "/".to_string(),
            headers: Default::default(),
            has_body: false,
        };
        let bytes = serde_json::to_vec(&event).unwrap();
        write_message(&mut client, MessageType::RequestHeaders, &bytes, MAX_PAYLOAD_UDS)
            .await
            .unwrap();

        let (tag, payload) = read_message(&mut client, MAX_PAYLOAD_UDS).await.unwrap();
        assert_eq!(tag, MessageType::Decision as u8);
        let decision: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decision["request_id"], 1);
        assert_eq!(decision["decision"]["type"], "allow");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("outpost-ping.sock");
        let server = Arc::new(AgentServerV2::new(Arc::new(EchoCapability), ServerConfig::default()));
        let server_clone = server.clone();
        let path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _ = server_clone.run(Transport::Uds(path_clone)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = ClientStream::connect(&socket_path).await.unwrap();
        handshake(&mut client).await;

        write_message(&mut client, MessageType::Ping, b"{}", MAX_PAYLOAD_UDS)
            .await
            .unwrap();
        let (tag, _payload) = read_message(&mut client, MAX_PAYLOAD_UDS).await.unwrap();
        assert_eq!(tag, MessageType::Pong as u8);

        server.shutdown().await;
    }

    #[tokio::test]
    async fn drain_rejects_new_requests_with_503() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("outpost-drain.sock");
        let server = Arc::new(AgentServerV2::new(Arc::new(EchoCapability), ServerConfig::default()));
        let server_clone = server.clone();
        let path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _ = server_clone.run(Transport::Uds(path_clone)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = ClientStream::connect(&socket_path).await.unwrap();
        handshake(&mut client).await;

        server.drain(0).await;

        let event = RequestHeadersV2 {
            request_id: 99,
            metadata: crate::v2::RequestMetadataV2 {
                correlation_id: "c99".to_string(),
                client_ip: "127.0.0.1".to_string(),
                client_port: 9000,
                server_name: None,
                protocol: "http/1.1".to_string(),
                route_id: None,
                timestamp: "2026-01-01T00:00:00Z".to_string(),
            },
            method: "GET".to_string(),
            uri: "/".to_string(),
            headers: Default::default(),
            has_body: false,
        };
        let bytes = serde_json::to_vec(&event).unwrap();
        write_message(&mut client, MessageType::RequestHeaders, &bytes, MAX_PAYLOAD_UDS)
            .await
            .unwrap();

        let (_tag, payload) = read_message(&mut client, MAX_PAYLOAD_UDS).await.unwrap();
        let decision: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(decision["decision"]["type"], "block");
        assert_eq!(decision["decision"]["status"], 503);
        assert_eq!(decision["decision"]["body"], "Agent is draining");

        server.shutdown().await;
    }
}
