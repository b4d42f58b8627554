//! Protocol v2: the multiplexed profile. Adds a handshake, per-request ids,
//! keep-alive, and cancellation messages on top of the v1 data model.

pub mod protocol_metrics;
pub mod server;
pub mod wire;

use crate::capability::Capabilities;
use crate::protocol::{AuditMetadata, BodyMutation, Decision, HeaderOp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const PROTOCOL_VERSION_V2: u32 = 2;

/// v2 handshake request (peer -> agent), framed with tag `0x01`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub protocol_version: u32,
    pub client_name: String,
    #[serde(default)]
    pub supported_features: Vec<String>,
    #[serde(default = "default_encodings")]
    pub supported_encodings: Vec<String>,
}

fn default_encodings() -> Vec<String> {
    vec!["json".to_string()]
}

/// v2 handshake response (agent -> peer), framed with tag `0x02`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub protocol_version: u32,
    pub agent_name: String,
    pub capabilities: Capabilities,
    pub encoding: String,
}

impl HandshakeResponse {
    pub fn new(agent_name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION_V2,
            agent_name: agent_name.into(),
            capabilities,
            encoding: "json".to_string(),
        }
    }
}

/// v2 request-headers event, tag `0x10`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeadersV2 {
    pub request_id: i64,
    pub metadata: RequestMetadataV2,
    pub method: String,
    pub uri: String,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub has_body: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadataV2 {
    pub correlation_id: String,
    pub client_ip: String,
    pub client_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    pub timestamp: String,
}

/// v2 request-body-chunk event, tag `0x11`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBodyChunkV2 {
    pub request_id: i64,
    pub data: String,
    pub is_last: bool,
    #[serde(default)]
    pub total_size: Option<usize>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub bytes_received: usize,
}

/// v2 response-headers event, tag `0x12`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeadersV2 {
    pub request_id: i64,
    pub status_code: u16,
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub has_body: bool,
}

/// v2 response-body-chunk event, tag `0x13`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBodyChunkV2 {
    pub request_id: i64,
    pub data: String,
    pub is_last: bool,
    #[serde(default)]
    pub total_size: Option<usize>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub bytes_sent: usize,
}

/// v2 decision reply, tag `0x20`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct DecisionMessageV2 {
    pub request_id: i64,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers: Vec<HeaderOp>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers: Vec<HeaderOp>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub routing_metadata: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit: Option<AuditMetadata>,
    #[serde(skip_serializing_if = "is_false")]
    pub needs_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body_mutation: Option<BodyMutation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body_mutation: Option<BodyMutation>,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Cancel one in-flight request, tag `0x30`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelRequestMessage {
    pub request_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Cancel every in-flight request on the connection, tag `0x31`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelAllMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
