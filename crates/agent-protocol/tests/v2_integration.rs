//! End-to-end tests over a real Unix domain socket, exercising the v2
//! connection runtime as an external peer would see it: handshake,
//! multiplexed concurrent requests, cancellation, and oversize-frame
//! termination.

use async_trait::async_trait;
use outpost_agent_protocol::v2::server::{AgentServerV2, ServerConfig, Transport, MAX_PAYLOAD_UDS};
use outpost_agent_protocol::v2::wire::{read_message, write_message, MessageType};
use outpost_agent_protocol::v2::{
    CancelRequestMessage, HandshakeRequest, HandshakeResponse, RequestHeadersV2, RequestMetadataV2,
    PROTOCOL_VERSION_V2,
};
use outpost_agent_protocol::{Capabilities, DecisionBuilder, InspectionCapability, RequestKey, RequestView};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

async fn handshake(stream: &mut UnixStream) {
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

fn request_headers(request_id: i64, correlation_id: &str, uri: &str) -> RequestHeadersV2 {
    RequestHeadersV2 {
        request_id,
        metadata: RequestMetadataV2 {
            correlation_id: correlation_id.to_string(),
            client_ip: "127.0.0.1".to_string(),
            client_port: 9000,
            server_name: None,
            protocol: "http/1.1".to_string(),
            route_id: None,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        },
        method: "GET".to_string(),
        uri: uri.to_string(),
        headers: HashMap::new(),
        has_body: false,
    }
}

async fn spawn_server(capability: Arc<dyn InspectionCapability>) -> (Arc<AgentServerV2>, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    // Leak the tempdir so the socket path stays valid for the test's lifetime.
    let socket_path = dir.path().join("outpost-v2-it.sock");
    std::mem::forget(dir);

    let server = Arc::new(AgentServerV2::new(capability, ServerConfig::default()));
    let server_clone = server.clone();
    let path_clone = socket_path.clone();
    tokio::spawn(async move {
        let _ = server_clone.run(Transport::Uds(path_clone)).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (server, socket_path)
}

struct TaggingCapability;

#[async_trait]
impl InspectionCapability for TaggingCapability {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            handles_request_headers: true,
            ..Default::default()
        }
    }

    async fn on_request(&self, request: RequestView<'_>) -> anyhow::Result<DecisionBuilder> {
        Ok(DecisionBuilder::allow().with_tag(request.path().to_string()))
    }
}

#[tokio::test]
async fn two_requests_interleaved_on_one_connection_get_independent_decisions() {
    let (server, socket_path) = spawn_server(Arc::new(TaggingCapability)).await;

    let mut client = UnixStream::connect(&socket_path).await.unwrap();
    handshake(&mut client).await;

    // Send headers for two different request ids back to back before reading
    // either reply, exercising the multiplexed id-keyed demultiplexing.
    let a = request_headers(1, "corr-a", "/a");
    let b = request_headers(2, "corr-b", "/b");
    write_message(
        &mut client,
        MessageType::RequestHeaders,
        &serde_json::to_vec(&a).unwrap(),
        MAX_PAYLOAD_UDS,
    )
    .await
    .unwrap();
    write_message(
        &mut client,
        MessageType::RequestHeaders,
        &serde_json::to_vec(&b).unwrap(),
        MAX_PAYLOAD_UDS,
    )
    .await
    .unwrap();

    let (_, payload1) = read_message(&mut client, MAX_PAYLOAD_UDS).await.unwrap();
    let decision1: serde_json::Value = serde_json::from_slice(&payload1).unwrap();
    let (_, payload2) = read_message(&mut client, MAX_PAYLOAD_UDS).await.unwrap();
    let decision2: serde_json::Value = serde_json::from_slice(&payload2).unwrap();

    assert_eq!(decision1["request_id"], 1);
    assert_eq!(decision1["audit"]["tags"][0], "/a");
    assert_eq!(decision2["request_id"], 2);
    assert_eq!(decision2["audit"]["tags"][0], "/b");

    server.shutdown().await;
}

struct CancelSpyCapability {
    cancelled: Arc<AtomicUsize>,
}

#[async_trait]
impl InspectionCapability for CancelSpyCapability {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            handles_request_headers: true,
            ..Default::default()
        }
    }

    async fn on_request_cancelled(&self, _key: &RequestKey, _reason: Option<&str>) {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn cancel_request_over_the_wire_notifies_the_capability() {
    let cancelled = Arc::new(AtomicUsize::new(0));
    let (server, socket_path) = spawn_server(Arc::new(CancelSpyCapability {
        cancelled: cancelled.clone(),
    }))
    .await;

    let mut client = UnixStream::connect(&socket_path).await.unwrap();
    handshake(&mut client).await;

    let headers = request_headers(7, "corr-7", "/slow");
    write_message(
        &mut client,
        MessageType::RequestHeaders,
        &serde_json::to_vec(&headers).unwrap(),
        MAX_PAYLOAD_UDS,
    )
    .await
    .unwrap();
    let _ = read_message(&mut client, MAX_PAYLOAD_UDS).await.unwrap();

    let cancel = CancelRequestMessage {
        request_id: 7,
        reason: Some("client disconnected".to_string()),
    };
    write_message(
        &mut client,
        MessageType::CancelRequest,
        &serde_json::to_vec(&cancel).unwrap(),
        MAX_PAYLOAD_UDS,
    )
    .await
    .unwrap();

    // CancelRequest produces no reply frame; give the server a moment to process it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cancelled.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn oversize_frame_header_closes_the_connection() {
    let (server, socket_path) = spawn_server(Arc::new(TaggingCapability)).await;

    let mut client = UnixStream::connect(&socket_path).await.unwrap();
    handshake(&mut client).await;

    // Declare a length far beyond the UDS cap; the server must reject before
    // attempting to read a payload of that size and close the connection.
    let bogus_len: u32 = (MAX_PAYLOAD_UDS as u32).saturating_add(100);
    client.write_all(&bogus_len.to_be_bytes()).await.unwrap();
    client.write_all(&[MessageType::RequestHeaders as u8]).await.unwrap();
    client.flush().await.unwrap();

    // The server closes the socket rather than waiting for a payload that
    // size; further reads observe EOF.
    let mut buf = [0u8; 1];
    use tokio::io::AsyncReadExt;
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "expected connection to be closed after an oversize frame header");

    server.shutdown().await;
}
