//! Logging, health, and metrics scaffolding shared by every Outpost binary.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One structured audit record, suitable for a JSON log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: String,
    pub component: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub fields: HashMap<String, serde_json::Value>,
}

impl AuditLogEntry {
    pub fn new(component: impl Into<String>, event: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            component: component.into(),
            event: event.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A point-in-time request latency/outcome sample, aggregated by `RequestMetrics`.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub duration: std::time::Duration,
    pub succeeded: bool,
}

/// Health of one named subsystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded { reason: String },
    Unhealthy { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
}

/// A registry of named health checks. Each check is a plain closure so
/// callers can wire in whatever probe makes sense (socket liveness,
/// capability `health()`, disk space, ...).
#[derive(Default)]
pub struct HealthChecker {
    checks: parking_lot::Mutex<HashMap<String, Box<dyn Fn() -> HealthStatus + Send + Sync>>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, check: impl Fn() -> HealthStatus + Send + Sync + 'static) {
        self.checks.lock().insert(name.into(), Box::new(check));
    }

    /// Run every registered check and report the aggregate. Aggregate status
    /// is the worst of the individual component statuses.
    pub fn check_all(&self) -> (HealthStatus, Vec<ComponentHealth>) {
        let checks = self.checks.lock();
        let mut components = Vec::with_capacity(checks.len());
        let mut worst = HealthStatus::Healthy;
        for (name, check) in checks.iter() {
            let status = check();
            if matches!(status, HealthStatus::Unhealthy { .. }) {
                worst = status.clone();
            } else if matches!(status, HealthStatus::Degraded { .. }) && matches!(worst, HealthStatus::Healthy) {
                worst = status.clone();
            }
            components.push(ComponentHealth {
                name: name.clone(),
                status,
            });
        }
        (worst, components)
    }
}

#[cfg(feature = "runtime")]
mod runtime {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Initialise the global `tracing` subscriber. `log_level` is parsed via
    /// `tracing::Level`, falling back to `info` with a single warning on an
    /// unrecognised value. `json_logs` selects the JSON formatting layer.
    pub fn init_tracing(log_level: &str, json_logs: bool) {
        let level: tracing::Level = log_level.parse().unwrap_or_else(|_| {
            eprintln!("unrecognised log level '{log_level}', defaulting to info");
            tracing::Level::INFO
        });
        let filter = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy();

        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        if json_logs {
            let _ = subscriber.json().try_init();
        } else {
            let _ = subscriber.try_init();
        }
    }

    /// Aggregate request-duration/outcome metrics, exported in Prometheus
    /// text format via the `prometheus` crate's own registry and types
    /// (rather than hand-rolled atomics, since this is a shared utility
    /// crate and not on anyone's per-frame hot path).
    pub struct RequestMetrics {
        registry: prometheus::Registry,
        total: prometheus::IntCounter,
        errors: prometheus::IntCounter,
        in_flight: Arc<AtomicU64>,
        duration: prometheus::Histogram,
    }

    impl RequestMetrics {
        pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
            let registry = prometheus::Registry::new();
            let total = prometheus::IntCounter::new(format!("{namespace}_requests_total"), "Total requests processed")?;
            let errors = prometheus::IntCounter::new(format!("{namespace}_request_errors_total"), "Requests that errored")?;
            let duration = prometheus::Histogram::with_opts(prometheus::HistogramOpts::new(
                format!("{namespace}_request_duration_seconds"),
                "Request duration in seconds",
            ))?;
            registry.register(Box::new(total.clone()))?;
            registry.register(Box::new(errors.clone()))?;
            registry.register(Box::new(duration.clone()))?;
            Ok(Self {
                registry,
                total,
                errors,
                in_flight: Arc::new(AtomicU64::new(0)),
                duration,
            })
        }

        pub fn start(&self) -> InFlightGuard<'_> {
            self.in_flight.fetch_add(1, Ordering::Relaxed);
            InFlightGuard {
                metrics: self,
                start: std::time::Instant::now(),
            }
        }

        pub fn in_flight(&self) -> u64 {
            self.in_flight.load(Ordering::Relaxed)
        }

        pub fn to_prometheus(&self) -> Result<String, prometheus::Error> {
            use prometheus::Encoder;
            let encoder = prometheus::TextEncoder::new();
            let mut buf = Vec::new();
            encoder.encode(&self.registry.gather(), &mut buf)?;
            Ok(String::from_utf8_lossy(&buf).into_owned())
        }
    }

    pub struct InFlightGuard<'a> {
        metrics: &'a RequestMetrics,
        start: std::time::Instant,
    }

    impl InFlightGuard<'_> {
        pub fn finish(self, succeeded: bool) {
            self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
            self.metrics.total.inc();
            if !succeeded {
                self.metrics.errors.inc();
            }
            self.metrics.duration.observe(self.start.elapsed().as_secs_f64());
        }
    }

    /// Report process memory usage as a health component, for wiring into a
    /// `HealthChecker`. Degraded above `warn_mb`, unhealthy above `crit_mb`.
    pub fn system_memory_health(warn_mb: u64, crit_mb: u64) -> HealthStatus {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let used_mb = system.used_memory() / (1024 * 1024);
        if used_mb >= crit_mb {
            HealthStatus::Unhealthy {
                reason: format!("memory usage {used_mb}MiB >= critical threshold {crit_mb}MiB"),
            }
        } else if used_mb >= warn_mb {
            HealthStatus::Degraded {
                reason: format!("memory usage {used_mb}MiB >= warning threshold {warn_mb}MiB"),
            }
        } else {
            HealthStatus::Healthy
        }
    }
}

#[cfg(feature = "runtime")]
pub use runtime::{init_tracing, system_memory_health, InFlightGuard, RequestMetrics};
