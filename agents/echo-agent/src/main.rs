//! Reference inspection agent: echoes request metadata back as response
//! headers and otherwise allows everything through. Useful for exercising a
//! proxy integration end-to-end without writing a real inspection policy.

use async_trait::async_trait;
use clap::Parser;
use outpost_agent_protocol::launcher::{LauncherArgs, WireProfile};
use outpost_agent_protocol::{
    v1, v2, Capabilities, DecisionBuilder, HeaderOp, InspectionCapability, RequestView,
    ResponseView,
};
use outpost_common::init_tracing;
use std::sync::Arc;
use tracing::{info, warn};

struct EchoCapability;

#[async_trait]
impl InspectionCapability for EchoCapability {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            handles_request_headers: true,
            handles_response_headers: true,
            ..Capabilities::default()
        }
    }

    async fn on_request(&self, request: RequestView<'_>) -> anyhow::Result<DecisionBuilder> {
        Ok(DecisionBuilder::allow()
            .add_response_header(HeaderOp::Add {
                name: "x-outpost-echo-method".to_string(),
                value: request.method.to_string(),
            })
            .add_response_header(HeaderOp::Add {
                name: "x-outpost-echo-path".to_string(),
                value: request.path().to_string(),
            }))
    }

    async fn on_response(
        &self,
        request: RequestView<'_>,
        response: ResponseView<'_>,
    ) -> anyhow::Result<DecisionBuilder> {
        info!(
            method = request.method,
            path = request.path(),
            status = response.status,
            "echo agent observed response"
        );
        Ok(DecisionBuilder::allow())
    }
}

/// Waits for either Ctrl-C or, on Unix, SIGTERM. Used twice: once to catch
/// the signal that starts a graceful drain, and again to race a second
/// signal against that drain completing.
async fn wait_for_termination_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = LauncherArgs::parse();
    let config = args.into_config()?;
    init_tracing(&config.log_level, config.json_logs);

    let capability: Arc<dyn InspectionCapability> = Arc::new(EchoCapability);
    let drain_timeout_ms = config.drain_timeout.as_millis() as u64;

    match config.profile {
        WireProfile::V1 => {
            let server = Arc::new(v1::AgentServerV1::new(capability, config.v1_server_config()));
            let transport = config.v1_transport()?;
            info!("echo agent starting on v1 profile");
            let run_handle = tokio::spawn({
                let server = server.clone();
                async move { server.run(transport).await }
            });

            wait_for_termination_signal().await;
            info!("termination signal received, draining connections");
            tokio::select! {
                _ = async {
                    server.drain(drain_timeout_ms).await;
                    server.shutdown().await;
                } => {
                    info!("graceful shutdown complete");
                }
                _ = wait_for_termination_signal() => {
                    warn!("second termination signal received, exiting immediately");
                    std::process::exit(130);
                }
            }
            run_handle.abort();
        }
        WireProfile::V2 => {
            let server = Arc::new(v2::server::AgentServerV2::new(capability, config.v2_server_config()));
            let transport = config.v2_transport()?;
            info!("echo agent starting on v2 profile");
            let run_handle = tokio::spawn({
                let server = server.clone();
                async move { server.run(transport).await }
            });

            wait_for_termination_signal().await;
            info!("termination signal received, draining connections");
            tokio::select! {
                _ = async {
                    server.drain(drain_timeout_ms).await;
                    server.shutdown().await;
                } => {
                    info!("graceful shutdown complete");
                }
                _ = wait_for_termination_signal() => {
                    warn!("second termination signal received, exiting immediately");
                    std::process::exit(130);
                }
            }
            run_handle.abort();
        }
    }

    Ok(())
}
