use std::{
    fs, io,
    os::unix::fs::FileTypeExt,
    path::{Path, PathBuf},
    process::ExitCode,
};

use clap::Parser;
use epu_bus::serve_unix;
use epu_core::default_broker_socket;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "epu-brokerd", about = "EPU message bus broker")]
struct Args {
    /// Socket to listen on; defaults to $EPU_BROKER_SOCKET or /tmp/epu-broker.sock.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("epu-brokerd error: {err}");
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
    prepare_socket_path(&socket)?;

    info!(
        socket = %socket.display(),
        version = env!("CARGO_PKG_VERSION"),
        "starting epu-brokerd"
    );

    tokio::select! {
        served = serve_unix(&socket) => served?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }

    let _ = fs::remove_file(&socket);
    Ok(())
}

/// Removes a stale socket left by a previous run; refuses to touch anything else.
fn prepare_socket_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}
