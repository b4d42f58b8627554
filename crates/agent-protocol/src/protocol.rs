//! Wire protocol types for the legacy (v1) profile.
//!
//! v1 is the single-request-per-connection, length-prefixed JSON profile: every
//! inbound message is an [`AgentRequest`] envelope, and every reply is an
//! [`AgentResponse`]. See [`crate::v2`] for the multiplexed profile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// v1 protocol version advertised in every [`AgentRequest`]/[`AgentResponse`].
pub const PROTOCOL_VERSION_V1: u32 = 1;

/// Maximum v1 frame payload size (10 MiB), per the wire codec invariant.
pub const MAX_MESSAGE_SIZE_V1: usize = 10 * 1024 * 1024;

/// v1 event type, carried as the envelope's `event_type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Configure,
    RequestHeaders,
    RequestBodyChunk,
    ResponseHeaders,
    ResponseBodyChunk,
    RequestComplete,
    /// Carried on the wire for forward compatibility; the core dispatcher has
    /// no handler for this event and replies Allow without invoking the
    /// capability (see `dispatcher::EventDispatcher`).
    WebSocketFrame,
}

/// v1 inbound envelope: `{version, event_type, payload}`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentRequest {
    pub version: u32,
    pub event_type: EventType,
    pub payload: serde_json::Value,
}

/// Agent decision, serialised as a `type`-tagged record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Allow,
    Block {
        status: u16,
        #[serde(skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(skip_serializing_if = "is_empty_headers")]
        headers: Option<HashMap<String, String>>,
    },
    Redirect {
        url: String,
        status: u16,
    },
    /// v1-only; v2 lowers this to `Block{403, "Challenge required"}` (see
    /// `decision::lower_challenge_for_v2`).
    Challenge {
        challenge_type: String,
        #[serde(default)]
        params: HashMap<String, String>,
    },
}

fn is_empty_headers(headers: &Option<HashMap<String, String>>) -> bool {
    match headers {
        None => true,
        Some(map) => map.is_empty(),
    }
}

/// Header modification operation, tagged by variant name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HeaderOp {
    Set { name: String, value: String },
    Add { name: String, value: String },
    Remove { name: String },
}

/// A body mutation for one chunk.
///
/// `data: None` is pass-through, `data: Some("")` drops the chunk, anything
/// else replaces it. Per the wire invariant, presence-with-null and presence-
/// with-empty-string are distinct; total field absence at the `AgentResponse`
/// level means "no mutation at all" and is modelled there as `Option<BodyMutation>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyMutation {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub chunk_index: u32,
}

impl BodyMutation {
    pub fn pass_through(chunk_index: u32) -> Self {
        Self {
            data: None,
            chunk_index,
        }
    }

    pub fn drop_chunk(chunk_index: u32) -> Self {
        Self {
            data: Some(String::new()),
            chunk_index,
        }
    }

    pub fn replace(chunk_index: u32, data: String) -> Self {
        Self {
            data: Some(data),
            chunk_index,
        }
    }

    pub fn is_pass_through(&self) -> bool {
        self.data.is_none()
    }

    pub fn is_drop(&self) -> bool {
        matches!(&self.data, Some(d) if d.is_empty())
    }
}

/// Metadata accompanying a request-headers event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub client_ip: String,
    pub client_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cipher: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_id: Option<String>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestHeadersEvent {
    pub metadata: RequestMetadata,
    pub method: String,
    pub uri: String,
    pub headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBodyChunkEvent {
    pub correlation_id: String,
    pub data: String,
    pub is_last: bool,
    #[serde(default)]
    pub total_size: Option<usize>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub bytes_received: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseHeadersEvent {
    pub correlation_id: String,
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseBodyChunkEvent {
    pub correlation_id: String,
    pub data: String,
    pub is_last: bool,
    #[serde(default)]
    pub total_size: Option<usize>,
    #[serde(default)]
    pub chunk_index: u32,
    #[serde(default)]
    pub bytes_sent: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCompleteEvent {
    pub correlation_id: String,
    pub status: u16,
    pub duration_ms: u64,
    pub request_body_size: usize,
    pub response_body_size: usize,
    #[serde(default)]
    pub upstream_attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigureEvent {
    pub agent_id: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// v1 outbound reply.
#[derive(Debug, Clone, Serialize, Default)]
pub struct AgentResponse {
    pub version: u32,
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

impl AgentResponse {
    pub fn allow() -> Self {
        Self {
            version: PROTOCOL_VERSION_V1,
            decision: Decision::Allow,
            ..Default::default()
        }
    }

    pub fn block(status: u16, body: Option<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION_V1,
            decision: Decision::Block {
                status,
                body,
                headers: None,
            },
            ..Default::default()
        }
    }
}

/// Audit metadata attached to a decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rule_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reason_codes: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, serde_json::Value>,
}

impl AuditMetadata {
    /// True iff this metadata would be entirely omitted from the wire.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
            && self.rule_ids.is_empty()
            && self.reason_codes.is_empty()
            && self.custom.is_empty()
            && self.confidence.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_mutation_variants() {
        let pass_through = BodyMutation::pass_through(0);
        assert!(pass_through.is_pass_through());
        assert!(!pass_through.is_drop());

        let drop = BodyMutation::drop_chunk(1);
        assert!(!drop.is_pass_through());
        assert!(drop.is_drop());

        let replace = BodyMutation::replace(2, "modified".to_string());
        assert_eq!(replace.data, Some("modified".to_string()));
    }

    #[test]
    fn block_decision_omits_null_body_and_headers() {
        let decision = Decision::Block {
            status: 403,
            body: None,
            headers: None,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert_eq!(json, serde_json::json!({"type": "block", "status": 403}));
    }

    #[test]
    fn empty_audit_is_considered_empty() {
        assert!(AuditMetadata::default().is_empty());
        let mut audit = AuditMetadata::default();
        audit.tags.push("blocked".into());
        assert!(!audit.is_empty());
    }

    #[test]
    fn scenario_block_on_path_prefix_serializes_minimally() {
        let mut response = AgentResponse::block(403, Some("nope".to_string()));
        let mut audit = AuditMetadata::default();
        audit.tags.push("blocked".to_string());
        response.audit = Some(audit);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "version": 1,
                "decision": {"type": "block", "status": 403, "body": "nope"},
                "audit": {"tags": ["blocked"]},
            })
        );
    }
}
