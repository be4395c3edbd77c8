use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use epu_bus::{SocketTransport, Transport, serve_endpoint};
use epu_core::{Address, DEFAULT_DISPATCHER_ENDPOINT, default_broker_socket};
use epu_pd::ProcessDispatcher;
use serde_json::{Map, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "epu-pd", about = "EPU process dispatcher service")]
struct Args {
    /// Broker socket; defaults to $EPU_BROKER_SOCKET or /tmp/epu-broker.sock.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Endpoint name to serve.
    #[arg(long, default_value = DEFAULT_DISPATCHER_ENDPOINT)]
    endpoint: String,
    /// Advertised resource property; JSON values are parsed, anything else is a string.
    #[arg(long = "property", value_name = "KEY=VALUE")]
    properties: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("epu-pd error: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();
    let socket = args.socket.unwrap_or_else(default_broker_socket);
    let properties = parse_properties(args.properties)?;
    let endpoint = Address::new(args.endpoint);

    info!(
        socket = %socket.display(),
        endpoint = %endpoint,
        properties = properties.len(),
        "starting epu-pd"
    );

    let transport: Arc<dyn Transport> = Arc::new(SocketTransport::connect(&socket).await?);
    let dispatcher = Arc::new(ProcessDispatcher::new(properties));

    tokio::select! {
        served = serve_endpoint(transport, &endpoint, dispatcher) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

fn parse_properties(pairs: Vec<String>) -> Result<Map<String, Value>, String> {
    let mut properties = Map::new();

    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(format!("invalid property '{pair}': expected KEY=VALUE"));
        };
        if key.is_empty() {
            return Err(format!("invalid property '{pair}': empty key"));
        }

        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        properties.insert(key.to_string(), value);
    }

    Ok(properties)
}
