//! Decision builder: accumulates a capability's verdict and lowers it to
//! the v1 or v2 wire representation on `build`.

use crate::protocol::{AgentResponse, AuditMetadata, BodyMutation, Decision, HeaderOp};
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Variant {
    Allow,
    Block {
        status: Option<u16>,
        body: Option<String>,
        headers: Option<HashMap<String, String>>,
    },
    Redirect {
        url: Option<String>,
        status: Option<u16>,
    },
    Challenge {
        challenge_type: String,
        params: HashMap<String, String>,
    },
}

impl Default for Variant {
    fn default() -> Self {
        Variant::Allow
    }
}

/// Fluent accumulator for a decision. Each `with_*`/`add_*`/`set_*` call
/// mutates and returns `self`; the last call to set a decision variant wins.
#[derive(Debug, Clone, Default)]
pub struct DecisionBuilder {
    variant: Variant,
    request_header_ops: Vec<HeaderOp>,
    response_header_ops: Vec<HeaderOp>,
    needs_more: bool,
    request_body_mutation: Option<BodyMutation>,
    response_body_mutation: Option<BodyMutation>,
    audit: AuditMetadata,
    routing_metadata: HashMap<String, String>,
}

impl DecisionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow() -> Self {
        Self::new()
    }

    /// Alias for `block()` with no arguments set yet; matches the fluent
    /// `Decision.deny().withBody(...)` call pattern.
    pub fn deny() -> Self {
        let mut b = Self::new();
        b.variant = Variant::Block {
            status: None,
            body: None,
            headers: None,
        };
        b
    }

    pub fn block(mut self, status: u16) -> Self {
        self.variant = Variant::Block {
            status: Some(status),
            body: None,
            headers: None,
        };
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        match &mut self.variant {
            Variant::Block { body: b, .. } => *b = Some(body.into()),
            _ => {
                self.variant = Variant::Block {
                    status: None,
                    body: Some(body.into()),
                    headers: None,
                }
            }
        }
        self
    }

    pub fn with_block_headers(mut self, headers: HashMap<String, String>) -> Self {
        match &mut self.variant {
            Variant::Block { headers: h, .. } => *h = Some(headers),
            _ => {
                self.variant = Variant::Block {
                    status: None,
                    body: None,
                    headers: Some(headers),
                }
            }
        }
        self
    }

    pub fn redirect(mut self, url: impl Into<String>) -> Self {
        self.variant = Variant::Redirect {
            url: Some(url.into()),
            status: None,
        };
        self
    }

    pub fn with_redirect_status(mut self, status: u16) -> Self {
        if let Variant::Redirect { status: s, .. } = &mut self.variant {
            *s = Some(status);
        }
        self
    }

    pub fn challenge(mut self, challenge_type: impl Into<String>) -> Self {
        self.variant = Variant::Challenge {
            challenge_type: challenge_type.into(),
            params: HashMap::new(),
        };
        self
    }

    pub fn with_challenge_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Variant::Challenge { params, .. } = &mut self.variant {
            params.insert(key.into(), value.into());
        }
        self
    }

    pub fn add_request_header(mut self, op: HeaderOp) -> Self {
        self.request_header_ops.push(op);
        self
    }

    pub fn add_response_header(mut self, op: HeaderOp) -> Self {
        self.response_header_ops.push(op);
        self
    }

    pub fn set_needs_more(mut self, needs_more: bool) -> Self {
        self.needs_more = needs_more;
        self
    }

    pub fn with_request_body_mutation(mut self, mutation: BodyMutation) -> Self {
        self.request_body_mutation = Some(mutation);
        self
    }

    pub fn with_response_body_mutation(mut self, mutation: BodyMutation) -> Self {
        self.response_body_mutation = Some(mutation);
        self
    }

    pub fn with_routing_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.routing_metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.audit.tags.push(tag.into());
        self
    }

    pub fn with_rule_id(mut self, rule_id: impl Into<String>) -> Self {
        self.audit.rule_ids.push(rule_id.into());
        self
    }

    /// Clamps to [0.0, 1.0] per the confidence invariant.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.audit.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_reason_code(mut self, code: impl Into<String>) -> Self {
        self.audit.reason_codes.push(code.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.audit.custom.insert(key.into(), value);
        self
    }

    fn finalize_audit(&self) -> Option<AuditMetadata> {
        if self.audit.is_empty() {
            None
        } else {
            Some(self.audit.clone())
        }
    }

    fn to_v1_decision(&self) -> Decision {
        match self.variant.clone() {
            Variant::Allow => Decision::Allow,
            Variant::Block {
                status,
                body,
                headers,
            } => Decision::Block {
                status: status.unwrap_or(403),
                body,
                headers,
            },
            Variant::Redirect { url, status } => Decision::Redirect {
                url: url.unwrap_or_else(|| "/".to_string()),
                status: status.unwrap_or(302),
            },
            Variant::Challenge {
                challenge_type,
                params,
            } => Decision::Challenge {
                challenge_type,
                params,
            },
        }
    }

    /// Lowers `Challenge` to `Block{403, "Challenge required"}` since v2 has
    /// no challenge decision (see DESIGN.md "Inheritance of v2 from v1").
    pub(crate) fn to_v2_decision(&self) -> Decision {
        match self.to_v1_decision() {
            Decision::Challenge { .. } => Decision::Block {
                status: 403,
                body: Some("Challenge required".to_string()),
                headers: None,
            },
            other => other,
        }
    }

    /// Build the v1 `AgentResponse` wire record.
    pub fn build(self) -> AgentResponse {
        let decision = self.to_v1_decision();
        AgentResponse {
            version: crate::protocol::PROTOCOL_VERSION_V1,
            decision,
            request_headers: self.request_header_ops.clone(),
            response_headers: self.response_header_ops.clone(),
            routing_metadata: self.routing_metadata.clone(),
            audit: self.finalize_audit(),
            needs_more: self.needs_more,
            request_body_mutation: self.request_body_mutation.clone(),
            response_body_mutation: self.response_body_mutation.clone(),
        }
    }

    /// Build the v2 `DecisionMessageV2` wire record for `request_id`.
    pub fn build_v2(self, request_id: i64) -> crate::v2::DecisionMessageV2 {
        let decision = self.to_v2_decision();
        crate::v2::DecisionMessageV2 {
            request_id,
            decision,
            request_headers: self.request_header_ops,
            response_headers: self.response_header_ops,
            routing_metadata: self.routing_metadata,
            audit: self.finalize_audit(),
            needs_more: self.needs_more,
            request_body_mutation: self.request_body_mutation,
            response_body_mutation: self.response_body_mutation,
        }
    }

    pub(crate) fn request_header_ops(&self) -> &[HeaderOp] {
        &self.request_header_ops
    }

    pub(crate) fn response_header_ops(&self) -> &[HeaderOp] {
        &self.response_header_ops
    }

    pub(crate) fn needs_more_flag(&self) -> bool {
        self.needs_more
    }

    pub(crate) fn request_body_mutation_ref(&self) -> Option<&BodyMutation> {
        self.request_body_mutation.as_ref()
    }

    pub(crate) fn response_body_mutation_ref(&self) -> Option<&BodyMutation> {
        self.response_body_mutation.as_ref()
    }

    pub(crate) fn routing_metadata_ref(&self) -> &HashMap<String, String> {
        &self.routing_metadata
    }

    pub(crate) fn audit_ref(&self) -> Option<AuditMetadata> {
        self.finalize_audit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_with_body_and_tag_matches_scenario_2() {
        let response = DecisionBuilder::deny()
            .with_body("nope")
            .with_tag("blocked")
            .build();
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

    #[test]
    fn confidence_is_clamped() {
        let builder = DecisionBuilder::allow().with_confidence(5.0);
        assert_eq!(builder.audit.confidence, Some(1.0));
        let builder = DecisionBuilder::allow().with_confidence(-5.0);
        assert_eq!(builder.audit.confidence, Some(0.0));
    }

    #[test]
    fn challenge_lowers_to_block_for_v2() {
        let builder = DecisionBuilder::new().challenge("captcha");
        let lowered = builder.to_v2_decision();
        assert_eq!(
            lowered,
            Decision::Block {
                status: 403,
                body: Some("Challenge required".to_string()),
                headers: None,
            }
        );
    }

    #[test]
    fn redirect_defaults_status_to_302() {
        let response = DecisionBuilder::new().redirect("/login").build();
        match response.decision {
            Decision::Redirect { url, status } => {
                assert_eq!(status, 302);
                assert_eq!(url, "/login");
            }
            _ => panic!("expected redirect"),
        }
    }
}
