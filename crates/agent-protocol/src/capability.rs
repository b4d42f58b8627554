//! Capability adaptor: the inspection trait the connection runtime
//! invokes, plus the handshake/health/metrics entities it exposes.

use crate::context::RequestKey;
use crate::decision::DecisionBuilder;
use crate::views::{RequestView, ResponseView};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capabilities advertised once at handshake (v2) and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default = "default_true")]
    pub handles_request_headers: bool,
    #[serde(default)]
    pub handles_request_body: bool,
    #[serde(default)]
    pub handles_response_headers: bool,
    #[serde(default)]
    pub handles_response_body: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default = "default_true")]
    pub supports_cancellation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_features: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            handles_request_headers: true,
            handles_request_body: false,
            handles_response_headers: false,
            handles_response_body: false,
            supports_streaming: false,
            supports_cancellation: true,
            max_concurrent_requests: None,
            supported_features: Vec::new(),
        }
    }
}

/// Health status reported by a capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        load: Option<f32>,
    },
    Unhealthy {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Healthy
    }
}

/// A point-in-time metrics snapshot, exported through `v2::protocol_metrics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsReport {
    pub counters: MetricsCounters,
    pub gauges: MetricsGauges,
    pub latency: MetricsLatency,
    #[serde(default)]
    pub custom: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsCounters {
    pub processed: u64,
    pub blocked: u64,
    pub allowed: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsGauges {
    pub active: u64,
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsLatency {
    pub avg: f64,
    pub p99: f64,
}

/// The user-supplied inspection logic. All methods have default
/// implementations that allow everything through, so a capability only
/// needs to override the events it cares about. Implementations declare
/// what they handle via [`Capabilities`] so the runtime (and, in v2, the
/// peer) can skip dispatching events nobody wants.
#[async_trait]
pub trait InspectionCapability: Send + Sync {
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn health(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    fn metrics(&self) -> MetricsReport {
        MetricsReport::default()
    }

    async fn on_configure(&self, _config: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_request(&self, _request: RequestView<'_>) -> anyhow::Result<DecisionBuilder> {
        Ok(DecisionBuilder::allow())
    }

    async fn on_request_body(&self, _request: RequestView<'_>) -> anyhow::Result<DecisionBuilder> {
        Ok(DecisionBuilder::allow())
    }

    async fn on_response(
        &self,
        _request: RequestView<'_>,
        _response: ResponseView<'_>,
    ) -> anyhow::Result<DecisionBuilder> {
        Ok(DecisionBuilder::allow())
    }

    async fn on_response_body(
        &self,
        _request: RequestView<'_>,
        _response: ResponseView<'_>,
    ) -> anyhow::Result<DecisionBuilder> {
        Ok(DecisionBuilder::allow())
    }

    async fn on_request_complete(&self, _request: RequestView<'_>, _status: u16, _duration_ms: u64) {}

    async fn on_request_cancelled(&self, _key: &RequestKey, _reason: Option<&str>) {}

    async fn on_all_requests_cancelled(&self, _reason: &str) {}

    async fn on_drain(&self, _timeout_ms: u64) {}

    async fn on_shutdown(&self) {}

    async fn on_stream_closed(&self, _error: Option<&str>) {}
}
