//! Agent-side protocol runtime for the Outpost sidecar SDK.
//!
//! This crate implements the agent side of an out-of-band request/response
//! inspection protocol: a reverse proxy's dataplane opens a connection (Unix
//! domain socket or TCP) to an external agent process and streams it
//! request/response lifecycle events; the agent replies with decisions
//! (allow/block, header mutations, tags) that the proxy applies.
//!
//! Two wire profiles are supported, each with its own connection runtime:
//!
//! - [`v1`]: the legacy profile. 4-byte big-endian length-prefixed JSON,
//!   `event_type`-tagged envelope, no handshake.
//! - [`v2::server`]: the multiplexed profile. Handshake-first, 4-byte
//!   length (inclusive of a 1-byte type tag) + tag + JSON, many concurrent
//!   requests demultiplexed over a single connection.
//!
//! Both profiles dispatch through the same [`dispatcher::EventDispatcher`]
//! into a user-supplied [`capability::InspectionCapability`].

#![allow(dead_code)]

mod errors;

pub mod capability;
pub mod context;
pub mod decision;
pub mod dispatcher;
pub mod headers;
pub mod launcher;
pub mod protocol;
pub mod views;

/// Legacy single-envelope wire profile and its connection runtime.
pub mod v1;

/// Multiplexed, handshake-first wire profile and its connection runtime.
pub mod v2;

// Re-export error types
pub use errors::{AgentProtocolError, AgentProtocolResult};

// Re-export protocol types
pub use protocol::{
    AgentRequest, AgentResponse, AuditMetadata, BodyMutation, ConfigureEvent, Decision, EventType,
    HeaderOp, RequestBodyChunkEvent, RequestCompleteEvent, RequestHeadersEvent, RequestMetadata,
    ResponseBodyChunkEvent, ResponseHeadersEvent, MAX_MESSAGE_SIZE_V1, PROTOCOL_VERSION_V1,
};

// Re-export decision builder
pub use decision::DecisionBuilder;

// Re-export context/cache types
pub use context::{RequestContext, RequestContextCache, RequestKey, ResponseHeadersSnapshot};

// Re-export read-only views handed to capabilities
pub use views::{RequestView, ResponseView};

// Re-export the capability trait and its supporting types
pub use capability::{
    Capabilities, HealthStatus, InspectionCapability, MetricsCounters, MetricsGauges,
    MetricsLatency, MetricsReport,
};

// Re-export the dispatcher
pub use dispatcher::EventDispatcher;

// Re-export launcher configuration types
pub use launcher::{AgentConfig, LauncherArgs, TransportKind, WireProfile};
