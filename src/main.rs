#![forbid(unsafe_code)]

//! `acp-adapter`: drive a JSON-RPC agent over stdio from the command line.
//!
//! Spawns the agent, sends one request (printing its result) or one
//! notification, prints every notification the agent emits meanwhile, then
//! stops the agent.
//!
//! ```text
//! acp-adapter call --method ping --params '{}' -- my-agent --acp
//! acp-adapter --config agent.toml notify --method session/cancel
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use acp_adapter::{AcpProcessAdapter, AdapterConfig, AdapterEvent, AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "acp-adapter", about = "Drive a JSON-RPC agent over stdio", version, long_about = None)]
struct Cli {
    /// Path to a TOML adapter configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json); logs go to stderr.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Working directory for the agent.
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,

    /// Extra environment variable for the agent, as KEY=VALUE. Repeatable.
    #[arg(long = "env", value_parser = parse_env_pair, global = true)]
    env: Vec<(String, String)>,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Send a request and print its result.
    Call(Invocation),
    /// Send a notification.
    Notify(Invocation),
}

#[derive(Debug, Args)]
struct Invocation {
    /// Method to invoke.
    #[arg(long)]
    method: String,

    /// JSON parameters; defaults to `{}`.
    #[arg(long)]
    params: Option<String>,

    /// Give up waiting for the response after this many seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Agent command and arguments; overrides `command`/`args` from `--config`.
    #[arg(last = true)]
    command: Vec<String>,
}

impl Action {
    fn invocation(&self) -> &Invocation {
        match self {
            Self::Call(invocation) | Self::Notify(invocation) => invocation,
        }
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = build_config(&args)?;
    let invocation = args.action.invocation();
    let params = invocation
        .params
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()
        .map_err(|err| AppError::Config(format!("--params is not valid JSON: {err}")))?;

    let (adapter, mut events) = AcpProcessAdapter::new(config)?;

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                AdapterEvent::Notification { method, params } => {
                    println!("{}", json!({ "method": method, "params": params }));
                }
                AdapterEvent::Error { message } => warn!(error = %message, "agent error"),
                other => debug!(?other, "adapter event"),
            }
        }
    });

    let call = async {
        if matches!(args.action, Action::Notify(_)) {
            adapter.notify(&invocation.method, params).await.map(|()| None)
        } else {
            let response = adapter.request_typed::<Value>(&invocation.method, params);
            match invocation.timeout_secs {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), response)
                    .await
                    .map_err(|_| AppError::Io(format!("no response within {secs}s")))?
                    .map(Some),
                None => response.await.map(Some),
            }
        }
    };

    let outcome = tokio::select! {
        outcome = call => outcome,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(None)
        }
    };

    adapter.stop().await?;
    drop(adapter);
    if let Err(err) = printer.await {
        warn!(%err, "event printer task failed");
    }

    if let Some(result) = outcome? {
        let rendered = serde_json::to_string_pretty(&result)
            .map_err(|err| AppError::Acp(format!("failed to render result: {err}")))?;
        println!("{rendered}");
    }

    Ok(())
}

fn build_config(args: &Cli) -> Result<AdapterConfig> {
    let command = &args.action.invocation().command;
    let mut config = match (&args.config, command.split_first()) {
        (Some(path), trailing) => {
            let mut config = AdapterConfig::load_from_path(path)?;
            if let Some((program, rest)) = trailing {
                config.command.clone_from(program);
                config.args = rest.to_vec();
            }
            config
        }
        (None, Some((program, rest))) => {
            AdapterConfig::new(program.clone()).with_args(rest.iter().cloned())
        }
        (None, None) => {
            return Err(AppError::Config(
                "no agent command given; pass it after `--` or use --config".into(),
            ))
        }
    };

    if let Some(cwd) = &args.cwd {
        config.cwd = Some(cwd.clone());
    }
    for (key, value) in &args.env {
        config.env.insert(key.clone(), value.clone());
    }

    config.validate()?;
    Ok(config)
}

fn parse_env_pair(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                if let Err(err) = ctrl_c.await {
                    error!(%err, "ctrl-c signal handler failed");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
