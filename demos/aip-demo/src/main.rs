//! Minimal AIP deployment in one binary.
//!
//! ```text
//! aip-demo server --bind 127.0.0.1:8765
//! aip-demo device --server ws://127.0.0.1:8765 --device-id laptop
//! aip-demo dispatch --server ws://127.0.0.1:8765 --device laptop --request "say hello"
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use aip_agents::config::AipSettings;
use aip_agents::endpoint::{
    AipEndpoint, CommandDispatcher, ConstellationEndpoint, DeviceClientEndpoint,
    DeviceServerEndpoint, EndpointConfig, SessionManager, TaskContext,
};
use aip_agents::primitives::{Command, CommandResult, Metadata};
use aip_agents::protocol::TaskRequest;
use aip_agents::telemetry::{LogFormat, TelemetryConfig, init_tracing};
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "aip-demo", version, about = "Agent Interaction Protocol demo")]
struct Cli {
    /// TOML settings file; `AIP_*` variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log directives used when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    log_filter: String,
    /// `compact` or `pretty`.
    #[arg(long, global = true, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Accept devices and constellations until Ctrl-C.
    Server {
        #[arg(long, default_value = "127.0.0.1:8765")]
        bind: SocketAddr,
    },
    /// Register a device that echoes every command back.
    Device {
        #[arg(long)]
        server: String,
        #[arg(long)]
        device_id: String,
    },
    /// Send one task to a device and print its outcome.
    Dispatch {
        #[arg(long)]
        server: String,
        #[arg(long)]
        device: String,
        #[arg(long, default_value = "demo")]
        task: String,
        #[arg(long)]
        request: String,
        #[arg(long, default_value = "demo-constellation")]
        constellation_id: String,
    },
}

/// Turns a request into a single `echo` command.
struct EchoPlanner;

#[async_trait]
impl SessionManager for EchoPlanner {
    async fn execute_task(&self, context: TaskContext) -> anyhow::Result<Option<Value>> {
        let mut parameters = Metadata::new();
        parameters.insert("text".into(), Value::from(context.request.clone().unwrap_or_default()));
        let results = context
            .execute_commands(vec![Command::new("echo").with_parameters(parameters).with_call_id("echo-1")])
            .await?;
        Ok(Some(json!({ "session_id": context.session_id, "action_results": results })))
    }

    async fn cancel_task(&self, session_id: &str, reason: &str) -> anyhow::Result<()> {
        info!(%session_id, %reason, "task cancelled");
        Ok(())
    }
}

/// Answers each command with its own parameters.
struct EchoDevice;

#[async_trait]
impl CommandDispatcher for EchoDevice {
    async fn execute_commands(&self, commands: &[Command]) -> anyhow::Result<Vec<CommandResult>> {
        Ok(commands
            .iter()
            .map(|command| {
                info!(tool = %command.tool_name, "executing command");
                CommandResult::success(command.call_id.clone(), Value::Object(command.parameters.clone()))
            })
            .collect())
    }
}

fn settings(path: Option<&PathBuf>) -> Result<EndpointConfig> {
    let settings = match path {
        Some(path) => AipSettings::load(path)
            .with_context(|| format!("reading {}", path.display()))?
            .with_env_overrides(|key| std::env::var(key).ok())?,
        None => AipSettings::from_env()?,
    };
    Ok(EndpointConfig::from_settings(&settings)?)
}

async fn run_until_ctrl_c<E: AipEndpoint>(endpoint: &E) -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutting down");
    endpoint.stop().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(
        &TelemetryConfig::default()
            .with_filter(cli.log_filter.clone())
            .with_format(cli.log_format),
    )?;
    let config = settings(cli.config.as_ref())?;

    match cli.command {
        Mode::Server { bind } => {
            let server = DeviceServerEndpoint::builder(Arc::new(EchoPlanner))
                .bind(bind)
                .config(config)
                .build()?;
            server.start().await?;
            info!(addr = ?server.local_addr(), "device server listening");
            run_until_ctrl_c(&server).await
        }
        Mode::Device { server, device_id } => {
            let device = DeviceClientEndpoint::builder(server, device_id, Arc::new(EchoDevice))
                .config(config)
                .build()?;
            device.start().await?;
            info!(device_id = %device.device_id(), "device registered");
            run_until_ctrl_c(&device).await
        }
        Mode::Dispatch {
            server,
            device,
            task,
            request,
            constellation_id,
        } => {
            let constellation = ConstellationEndpoint::builder(constellation_id)
                .config(config)
                .build()?;
            constellation.start().await?;
            constellation.connect_to_device(&device, &server).await?;
            let outcome = constellation
                .send_task_to_device(&device, TaskRequest::new(task, request))
                .await;
            constellation.stop().await?;
            let end = outcome?;
            println!("{}", serde_json::to_string_pretty(&end)?);
            Ok(())
        }
    }
}
