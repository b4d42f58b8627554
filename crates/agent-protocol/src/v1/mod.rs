//! Protocol v1 (legacy profile): length-prefixed JSON, no
//! type tag, no handshake. Each frame is `[4-byte BE length][JSON]`; the
//! JSON is an [`AgentRequest`] envelope carrying `event_type`. One
//! connection carries one request's lifecycle (`configure` -> `request_headers`
//! -> `request_body_chunk`* -> `response_headers` -> `response_body_chunk`* ->
//! `request_complete`), though the core does not itself enforce that a peer
//! reuse a connection's correlation id only once.

use crate::capability::InspectionCapability;
use crate::context::RequestKey;
use crate::decision::DecisionBuilder;
use crate::dispatcher::EventDispatcher;
use crate::errors::AgentProtocolError;
use crate::protocol::{
    AgentRequest, AgentResponse, ConfigureEvent, EventType, RequestBodyChunkEvent, RequestCompleteEvent,
    RequestHeadersEvent, ResponseBodyChunkEvent, ResponseHeadersEvent, MAX_MESSAGE_SIZE_V1,
};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

/// Which transport a v1 listener binds.
pub enum Transport {
    Uds(PathBuf),
    Tcp(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub request_timeout: Option<Duration>,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            request_timeout: None,
            max_connections: 1024,
        }
    }
}

struct ConnectionHandle {
    dispatcher: Arc<EventDispatcher>,
    close: Arc<Notify>,
}

/// The v1 agent server: one task per connection, no handshake, no
/// multiplexed message tags. Shares the drain/shutdown shape of
/// [`crate::v2::server::AgentServerV2`].
pub struct AgentServerV1 {
    capability: Arc<dyn InspectionCapability>,
    config: ServerConfig,
    draining: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    critical_section: Arc<tokio::sync::Mutex<()>>,
    connections: Arc<DashMap<u64, ConnectionHandle>>,
    next_conn_id: Arc<AtomicU64>,
}

impl AgentServerV1 {
    pub fn new(capability: Arc<dyn InspectionCapability>, config: ServerConfig) -> Self {
        Self {
            capability,
            config,
            draining: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
            critical_section: Arc::new(tokio::sync::Mutex::new(())),
            connections: Arc::new(DashMap::new()),
            next_conn_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub async fn drain(&self, timeout_ms: u64) {
        let _guard = self.critical_section.lock().await;
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        self.capability.on_drain(timeout_ms).await;
    }

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
        info!(socket_path = %socket_path.display(), "v1 UDS listener bound");

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept().await {
                Ok((stream, _addr)) => self.accept_connection(stream).await,
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
        info!(%addr, "v1 TCP listener bound");

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let _ = stream.set_nodelay(true);
                    self.accept_connection(stream).await;
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        Ok(())
    }

    async fn accept_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.draining.load(Ordering::SeqCst) || self.connections.len() >= self.config.max_connections {
            drop(stream);
            return;
        }

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
        let draining = self.draining.clone();
        let connections = self.connections.clone();
        let request_timeout = self.config.request_timeout;

        tokio::spawn(async move {
            let result = run_connection(stream, dispatcher, &draining, request_timeout, close).await;
            connections.remove(&conn_id);
            let error_msg = result.as_ref().err().map(|e| e.to_string());
            capability.on_stream_closed(error_msg.as_deref()).await;
            if let Err(e) = result {
                if !matches!(e, AgentProtocolError::ConnectionClosed) {
                    debug!(error = %e, "v1 connection closed with error");
                }
            }
        });
    }
}

async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Vec<u8>, AgentProtocolError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(AgentProtocolError::ConnectionClosed),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE_V1 {
        return Err(AgentProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE_V1,
        });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<(), AgentProtocolError> {
    if payload.len() > MAX_MESSAGE_SIZE_V1 {
        return Err(AgentProtocolError::MessageTooLarge {
            size: payload.len(),
            max: MAX_MESSAGE_SIZE_V1,
        });
    }
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

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
        Some(d) => match tokio::time::timeout(d, fut).await {
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

async fn run_connection<S>(
    stream: S,
    dispatcher: Arc<EventDispatcher>,
    draining: &Arc<AtomicBool>,
    request_timeout: Option<Duration>,
    close: Arc<Notify>,
) -> Result<(), AgentProtocolError>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    loop {
        let next = tokio::select! {
            biased;
            _ = close.notified() => break,
            frame = read_frame(&mut reader) => frame,
        };

        let payload = match next {
            Ok(p) => p,
            Err(AgentProtocolError::ConnectionClosed) => break,
            Err(e) => return Err(e),
        };

        let request: AgentRequest = serde_json::from_slice(&payload)
            .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string()))?;

        match request.event_type {
            EventType::Configure => {
                let event: ConfigureEvent = serde_json::from_value(request.payload)
                    .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string()))?;
                dispatcher.dispatch_configure(event.config).await;
            }
            EventType::RequestHeaders => {
                let event: RequestHeadersEvent = serde_json::from_value(request.payload)
                    .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string()))?;
                let key = RequestKey::V1(event.metadata.correlation_id.clone());
                let decision = if draining.load(Ordering::SeqCst) {
                    DecisionBuilder::deny().block(503).with_body("Agent is draining")
                } else {
                    let fut = dispatcher.dispatch_request_headers(
                        key.clone(),
                        event.method,
                        event.uri,
                        event.headers,
                        event.metadata.client_ip,
                        event.metadata.route_id,
                    );
                    run_with_optional_timeout(&dispatcher, &key, request_timeout, fut).await
                };
                write_frame(&mut writer, &serde_json::to_vec(&decision.build())?).await?;
            }
            EventType::RequestBodyChunk => {
                let event: RequestBodyChunkEvent = serde_json::from_value(request.payload)
                    .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string()))?;
                let key = RequestKey::V1(event.correlation_id.clone());
                let chunk = base64_decode(&event.data)?;
                let fut = dispatcher.dispatch_request_body_chunk(key.clone(), &chunk, event.is_last);
                let decision = run_with_optional_timeout(&dispatcher, &key, request_timeout, fut).await;
                write_frame(&mut writer, &serde_json::to_vec(&decision.build())?).await?;
            }
            EventType::ResponseHeaders => {
                let event: ResponseHeadersEvent = serde_json::from_value(request.payload)
                    .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string()))?;
                let key = RequestKey::V1(event.correlation_id.clone());
                let fut = dispatcher.dispatch_response_headers(key.clone(), event.status, event.headers);
                let decision = run_with_optional_timeout(&dispatcher, &key, request_timeout, fut).await;
                write_frame(&mut writer, &serde_json::to_vec(&decision.build())?).await?;
            }
            EventType::ResponseBodyChunk => {
                let event: ResponseBodyChunkEvent = serde_json::from_value(request.payload)
                    .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string()))?;
                let key = RequestKey::V1(event.correlation_id.clone());
                let chunk = base64_decode(&event.data)?;
                let fut = dispatcher.dispatch_response_body_chunk(key.clone(), &chunk);
                let decision = run_with_optional_timeout(&dispatcher, &key, request_timeout, fut).await;
                write_frame(&mut writer, &serde_json::to_vec(&decision.build())?).await?;
            }
            EventType::RequestComplete => {
                let event: RequestCompleteEvent = serde_json::from_value(request.payload)
                    .map_err(|e| AgentProtocolError::InvalidMessage(e.to_string()))?;
                let key = RequestKey::V1(event.correlation_id.clone());
                dispatcher.dispatch_request_complete(key, event.status, event.duration_ms).await;
            }
            EventType::WebSocketFrame => {
                warn!("websocket_frame event has no v1 handler; replying Allow");
                write_frame(&mut writer, &serde_json::to_vec(&AgentResponse::allow())?).await?;
            }
        }
    }

    Ok(())
}

impl From<serde_json::Error> for AgentProtocolError {
    fn from(e: serde_json::Error) -> Self {
        AgentProtocolError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capabilities as Caps;
    use async_trait::async_trait;
    use tokio::net::UnixStream as ClientStream;

    struct AllowCapability;

    #[async_trait]
    impl InspectionCapability for AllowCapability {
        fn capabilities(&self) -> Caps {
            Caps::default()
        }
    }

    fn request_headers_frame(correlation_id: &str) -> Vec<u8> {
        let payload = serde_json::json!({
            "metadata": {
                "correlation_id": correlation_id,
                "client_ip": "127.0.0.1",
                "client_port": 9000,
                "protocol": "http/1.1",
                "timestamp": "2026-01-01T00:00:00Z",
            },
            "method": "GET",
            "uri": "/admin/x",
            "headers": {},
        });
        let request = serde_json::json!({
            "version": 1,
            "event_type": "request_headers",
            "payload": payload,
        });
        serde_json::to_vec(&request).unwrap()
    }

    #[tokio::test]
    async fn scenario_block_on_path_prefix_round_trips_over_real_uds() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("outpost-v1-test.sock");

        struct DenyAdmin;
        #[async_trait]
        impl InspectionCapability for DenyAdmin {
            async fn on_request(
                &self,
                request: crate::views::RequestView<'_>,
            ) -> anyhow::Result<DecisionBuilder> {
                if request.path().starts_with("/admin") {
                    Ok(DecisionBuilder::deny().with_body("nope").with_tag("blocked"))
                } else {
                    Ok(DecisionBuilder::allow())
                }
            }
        }

        let server = Arc::new(AgentServerV1::new(Arc::new(DenyAdmin), ServerConfig::default()));
        let server_clone = server.clone();
        let path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _ = server_clone.run(Transport::Uds(path_clone)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = ClientStream::connect(&socket_path).await.unwrap();
        write_frame(&mut client, &request_headers_frame("c1")).await.unwrap();
        let reply = read_frame(&mut client).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "version": 1,
                "decision": {"type": "block", "status": 403, "body": "nope"},
                "audit": {"tags": ["blocked"]},
            })
        );

        server.shutdown().await;
    }

    #[tokio::test]
    async fn body_chunks_accumulate_over_real_uds_before_on_request_body() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("outpost-v1-body.sock");

        struct RecordingCapability {
            seen: parking_lot::Mutex<Vec<u8>>,
        }
        #[async_trait]
        impl InspectionCapability for RecordingCapability {
            fn capabilities(&self) -> Caps {
                Caps {
                    handles_request_headers: true,
                    handles_request_body: true,
                    ..Default::default()
                }
            }

            async fn on_request_body(
                &self,
                request: crate::views::RequestView<'_>,
            ) -> anyhow::Result<DecisionBuilder> {
                *self.seen.lock() = request.body.unwrap_or_default().to_vec();
                Ok(DecisionBuilder::allow())
            }
        }

        let capability = Arc::new(RecordingCapability {
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let server = Arc::new(AgentServerV1::new(capability.clone(), ServerConfig::default()));
        let server_clone = server.clone();
        let path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _ = server_clone.run(Transport::Uds(path_clone)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = ClientStream::connect(&socket_path).await.unwrap();
        write_frame(&mut client, &request_headers_frame("c-body")).await.unwrap();
        let _ = read_frame(&mut client).await.unwrap();

        let chunk_frame = |data: &str, is_last: bool| {
            let payload = serde_json::json!({
                "correlation_id": "c-body",
                "data": data,
                "is_last": is_last,
            });
            let request = serde_json::json!({
                "version": 1,
                "event_type": "request_body_chunk",
                "payload": payload,
            });
            serde_json::to_vec(&request).unwrap()
        };

        use base64::Engine;
        let first = base64::engine::general_purpose::STANDARD.encode(b"foo");
        let second = base64::engine::general_purpose::STANDARD.encode(b"bar");

        write_frame(&mut client, &chunk_frame(&first, false)).await.unwrap();
        let reply1: serde_json::Value =
            serde_json::from_slice(&read_frame(&mut client).await.unwrap()).unwrap();
        assert_eq!(reply1["decision"]["type"], "allow");
        assert!(capability.seen.lock().is_empty());

        write_frame(&mut client, &chunk_frame(&second, true)).await.unwrap();
        let reply2: serde_json::Value =
            serde_json::from_slice(&read_frame(&mut client).await.unwrap()).unwrap();
        assert_eq!(reply2["decision"]["type"], "allow");
        assert_eq!(&*capability.seen.lock(), b"foobar");

        server.shutdown().await;
    }

    #[tokio::test]
    async fn drain_rejects_new_request_headers_with_503() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("outpost-v1-drain.sock");
        let server = Arc::new(AgentServerV1::new(Arc::new(AllowCapability), ServerConfig::default()));
        let server_clone = server.clone();
        let path_clone = socket_path.clone();
        tokio::spawn(async move {
            let _ = server_clone.run(Transport::Uds(path_clone)).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.drain(0).await;

        let mut client = ClientStream::connect(&socket_path).await.unwrap();
        write_frame(&mut client, &request_headers_frame("c2")).await.unwrap();
        let reply = read_frame(&mut client).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&reply).unwrap();
        assert_eq!(json["decision"]["type"], "block");
        assert_eq!(json["decision"]["status"], 503);
        assert_eq!(json["decision"]["body"], "Agent is draining");

        server.shutdown().await;
    }
}
