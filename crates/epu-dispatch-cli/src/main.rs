use std::{path::PathBuf, process::ExitCode};

use clap::Parser;
use epu_core::{ClientIdentity, Constraint, DispatchRequest, InvalidProcessId, ProcessId};
use epu_dispatch::{
    ConfigError, ConnectError, DispatchClient, DispatchError, MessagingConfig, SpecLoadError,
    load_process_spec,
};
use serde_json::Value;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "epu-dispatch", about = "Submit a process launch to the EPU process dispatcher")]
struct Cli {
    /// JSON document describing the process.
    spec: PathBuf,
    /// Dispatcher endpoint name.
    #[arg(long)]
    endpoint: Option<String>,
    /// Broker socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Reply timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// JSON messaging config supplying defaults for the flags above.
    #[arg(long)]
    messaging_config: Option<PathBuf>,
    /// Scheduling constraint; the property must have one of the listed values.
    #[arg(long = "constraint", value_name = "KEY=V1[,V2...]")]
    constraints: Vec<String>,
    /// Fail instead of queueing when no resource matches.
    #[arg(long)]
    immediate: bool,
    /// Reuse the upid of an attempt whose outcome is unknown.
    #[arg(long)]
    upid: Option<String>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    SpecLoad(#[from] SpecLoadError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("invalid --upid: {0}")]
    InvalidUpid(#[from] InvalidProcessId),
    #[error("invalid constraint '{value}': expected KEY=V1[,V2...]")]
    InvalidConstraint { value: String },
    #[error("dispatch of process {upid} failed: {source}")]
    Dispatch {
        upid: ProcessId,
        #[source]
        source: DispatchError,
    },
    #[error("failed to render result: {0}")]
    Render(#[from] serde_json::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "epu-dispatch failed");
            eprintln!("{err}");
            report_detail(&err);
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = match &cli.messaging_config {
        Some(path) => MessagingConfig::load(path)?,
        None => MessagingConfig::default(),
    };
    let settings = config.resolve(cli.socket, cli.endpoint, cli.timeout_ms);

    let spec = load_process_spec(&cli.spec)?;
    let constraints = parse_constraints(cli.constraints)?;
    let upid = match cli.upid {
        Some(value) => value.parse::<ProcessId>()?,
        None => ProcessId::generate(),
    };

    let client = DispatchClient::connect(
        &settings.broker_socket,
        ClientIdentity::generate(),
        settings.endpoint,
    )
    .await?
    .with_timeout(settings.timeout);

    eprintln!("dispatching process {upid} to {}", client.endpoint());

    let mut request = DispatchRequest::new(upid.clone(), spec, constraints);
    request.immediate = cli.immediate;
    let result = client
        .dispatch_request(request)
        .await
        .map_err(|source| CliError::Dispatch { upid, source })?;

    if result.is_rejected() {
        tracing::warn!(state = %result.state, "dispatcher did not accept the process");
    }
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn report_detail(err: &CliError) {
    let CliError::Dispatch { upid, source } = err else {
        return;
    };
    if let Some(payload) = source.raw_payload() {
        eprintln!("raw reply: {}", String::from_utf8_lossy(payload));
    }
    if source.outcome_unknown() {
        eprintln!("outcome unknown; retry with --upid {upid} to avoid a second launch");
    }
}

fn parse_constraints(values: Vec<String>) -> Result<Vec<Constraint>, CliError> {
    values
        .into_iter()
        .map(|value| {
            let Some((key, accepted)) = value.split_once('=') else {
                return Err(CliError::InvalidConstraint { value });
            };
            if key.is_empty() || accepted.is_empty() {
                return Err(CliError::InvalidConstraint { value });
            }

            let accepts = accepted
                .split(',')
                .map(|item| {
                    serde_json::from_str(item).unwrap_or_else(|_| Value::String(item.to_string()))
                })
                .collect();
            Ok(Constraint::new(key, accepts))
        })
        .collect()
}
