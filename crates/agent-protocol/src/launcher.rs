//! Launcher configuration and CLI parsing shared by every agent binary.
//!
//! Two-layer shape: [`LauncherArgs`] is the `clap::Parser` derive struct a
//! binary's `main()` parses from `std::env::args()`; [`AgentConfig`] is the
//! validated, transport-resolved record that gets handed to the connection
//! runtime. `LauncherArgs::into_config` does the conversion and validation.

use crate::errors::AgentProtocolError;
use crate::v1;
use crate::v2::server as v2;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Wire profile a launched agent speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WireProfile {
    V1,
    V2,
}

/// Transport kind, independent of wire profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportKind {
    Uds,
    Tcp,
}

/// CLI arguments for an agent binary.
#[derive(Debug, Clone, Parser)]
#[command(about = "Outpost inspection agent")]
pub struct LauncherArgs {
    /// Wire profile to speak.
    #[arg(long, value_enum, default_value = "v2", env = "OUTPOST_PROFILE")]
    pub profile: WireProfile,

    /// Transport to bind.
    #[arg(long, value_enum, default_value = "uds", env = "OUTPOST_TRANSPORT")]
    pub transport: TransportKind,

    /// Unix domain socket path, required when `--transport uds`.
    #[arg(long, env = "OUTPOST_SOCKET_PATH")]
    pub socket_path: Option<PathBuf>,

    /// TCP bind host, used when `--transport tcp`.
    #[arg(long, default_value = "127.0.0.1", env = "OUTPOST_HOST")]
    pub host: String,

    /// TCP bind port, used when `--transport tcp`.
    #[arg(long, default_value_t = 9700, env = "OUTPOST_PORT")]
    pub port: u16,

    /// Upper bound on a single capability call, in milliseconds. Unset means unbounded.
    #[arg(long, env = "OUTPOST_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// v2 handshake timeout, in milliseconds.
    #[arg(long, default_value_t = 10_000, env = "OUTPOST_HANDSHAKE_TIMEOUT_MS")]
    pub handshake_timeout_ms: u64,

    /// Grace period given to `drain()` before `shutdown()` forces closure, in milliseconds.
    #[arg(long, default_value_t = 5_000, env = "OUTPOST_DRAIN_TIMEOUT_MS")]
    pub drain_timeout_ms: u64,

    /// Maximum concurrently open connections.
    #[arg(long, default_value_t = 1024, env = "OUTPOST_MAX_CONNECTIONS")]
    pub max_connections: usize,

    /// Whether to answer keep-alive Pings (v2 only; core never initiates them).
    #[arg(long, default_value_t = true, env = "OUTPOST_ENABLE_KEEP_ALIVE")]
    pub enable_keep_alive: bool,

    /// Interval an agent-initiated keep-alive Ping would use, if it chose to send one.
    #[arg(long, default_value_t = 30_000, env = "OUTPOST_KEEP_ALIVE_INTERVAL_MS")]
    pub keep_alive_interval_ms: u64,

    /// Tracing level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info", env = "OUTPOST_LOG_LEVEL")]
    pub log_level: String,

    /// Emit JSON-formatted logs instead of the default human-readable layer.
    #[arg(long, default_value_t = false, env = "OUTPOST_JSON_LOGS")]
    pub json_logs: bool,

    /// Override the agent name advertised in the v2 handshake response.
    #[arg(long, env = "OUTPOST_AGENT_NAME")]
    pub agent_name_override: Option<String>,
}

/// Validated, transport-resolved configuration handed to the connection runtime.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub profile: WireProfile,
    pub transport: TransportKind,
    pub socket_path: Option<PathBuf>,
    pub host: String,
    pub port: u16,
    pub request_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
    pub max_connections: usize,
    pub enable_keep_alive: bool,
    pub keep_alive_interval: Duration,
    pub log_level: String,
    pub json_logs: bool,
    pub agent_name_override: Option<String>,
}

impl LauncherArgs {
    /// Validate and lower CLI args into an [`AgentConfig`].
    pub fn into_config(self) -> Result<AgentConfig, AgentProtocolError> {
        if self.transport == TransportKind::Uds && self.socket_path.is_none() {
            return Err(AgentProtocolError::InvalidMessage(
                "--socket-path is required when --transport uds".to_string(),
            ));
        }
        Ok(AgentConfig {
            profile: self.profile,
            transport: self.transport,
            socket_path: self.socket_path,
            host: self.host,
            port: self.port,
            request_timeout: self.request_timeout_ms.map(Duration::from_millis),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            max_connections: self.max_connections,
            enable_keep_alive: self.enable_keep_alive,
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            log_level: self.log_level,
            json_logs: self.json_logs,
            agent_name_override: self.agent_name_override,
        })
    }
}

impl AgentConfig {
    /// Resolve the `v1`/`v2::server` `Transport` this config describes.
    fn resolve_socket_addr(&self) -> Result<SocketAddr, AgentProtocolError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AgentProtocolError::InvalidMessage(format!("invalid host/port: {e}")))
    }

    pub fn v1_transport(&self) -> Result<v1::Transport, AgentProtocolError> {
        match self.transport {
            TransportKind::Uds => Ok(v1::Transport::Uds(
                self.socket_path.clone().expect("validated by into_config"),
            )),
            TransportKind::Tcp => Ok(v1::Transport::Tcp(self.resolve_socket_addr()?)),
        }
    }

    pub fn v2_transport(&self) -> Result<v2::Transport, AgentProtocolError> {
        match self.transport {
            TransportKind::Uds => Ok(v2::Transport::Uds(
                self.socket_path.clone().expect("validated by into_config"),
            )),
            TransportKind::Tcp => Ok(v2::Transport::Tcp(self.resolve_socket_addr()?)),
        }
    }

    pub fn v1_server_config(&self) -> v1::ServerConfig {
        v1::ServerConfig {
            request_timeout: self.request_timeout,
            max_connections: self.max_connections,
        }
    }

    pub fn v2_server_config(&self) -> v2::ServerConfig {
        v2::ServerConfig {
            agent_name: self
                .agent_name_override
                .clone()
                .unwrap_or_else(|| "outpost-agent".to_string()),
            handshake_timeout: self.handshake_timeout,
            request_timeout: self.request_timeout,
            max_connections: self.max_connections,
            enable_keep_alive: self.enable_keep_alive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uds_transport_without_socket_path_is_rejected() {
        let args = LauncherArgs {
            profile: WireProfile::V2,
            transport: TransportKind::Uds,
            socket_path: None,
            host: "127.0.0.1".to_string(),
            port: 9700,
            request_timeout_ms: None,
            handshake_timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
            max_connections: 1024,
            enable_keep_alive: true,
            keep_alive_interval_ms: 30_000,
            log_level: "info".to_string(),
            json_logs: false,
            agent_name_override: None,
        };
        assert!(args.into_config().is_err());
    }

    #[test]
    fn tcp_config_resolves_socket_addr() {
        let args = LauncherArgs {
            profile: WireProfile::V2,
            transport: TransportKind::Tcp,
            socket_path: None,
            host: "127.0.0.1".to_string(),
            port: 9700,
            request_timeout_ms: Some(500),
            handshake_timeout_ms: 10_000,
            drain_timeout_ms: 5_000,
            max_connections: 64,
            enable_keep_alive: true,
            keep_alive_interval_ms: 30_000,
            log_level: "debug".to_string(),
            json_logs: true,
            agent_name_override: Some("demo".to_string()),
        };
        let config = args.into_config().unwrap();
        let transport = config.v2_transport().unwrap();
        assert!(matches!(transport, v2::Transport::Tcp(_)));
        assert_eq!(config.request_timeout, Some(Duration::from_millis(500)));
    }
}
