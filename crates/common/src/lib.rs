//! Common utilities and shared components for Outpost
//!
//! This crate provides shared functionality used across all Outpost components,
//! including observability (metrics, logging, tracing), error types, and common utilities.

pub mod observability;

pub mod errors;
pub mod limits;
pub mod types;

// Re-export commonly used items at the crate root
pub use observability::{AuditLogEntry, ComponentHealth, HealthChecker, HealthStatus};
#[cfg(feature = "runtime")]
pub use observability::{init_tracing, RequestMetrics};

// Re-export error types
pub use errors::{OutpostError, OutpostResult};

// Re-export limit types
pub use limits::{Limits, RateLimiter};

// Re-export common types
pub use types::{CorrelationId, RequestId};
