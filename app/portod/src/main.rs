use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use porto_core::{Config, Runtime};
use porto_rpc::Server;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "portod")]
#[command(author, version, about = "Linux container management daemon", long_about = None)]
struct DaemonArgs {
    /// RPC socket path (default: /run/portod.socket).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Persistent state directory (default: /var/lib/porto).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Configuration file instead of /etc/portod.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosely.
    #[arg(long, short)]
    verbose: bool,
}

// The daemon multiplexes connections on one thread; handlers serialize
// behind the runtime lock anyway.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = DaemonArgs::parse();

    let default_filter = if args.verbose {
        "portod=debug,porto_rpc=debug,porto_container=debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    run(args).await
}

async fn run(args: DaemonArgs) -> Result<()> {
    info!("starting portod");

    let mut config = match &args.config {
        Some(path) => Config::load_from(path).context("can't load configuration")?,
        None => Config::load().context("can't load configuration")?,
    };
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    std::fs::create_dir_all(&config.data_dir).context("can't create data directory")?;
    let pid_file = config.data_dir.join("portod.pid");
    std::fs::write(&pid_file, format!("{}\n", std::process::id()))
        .context("can't write pid file")?;

    let runtime = Arc::new(Runtime::new(config.clone()).context("can't build runtime")?);
    runtime
        .init()
        .await
        .context("can't initialize runtime")?;

    info!(
        socket = %config.socket_path.display(),
        data_dir = %config.data_dir.display(),
        "runtime ready"
    );

    let reaper = tokio::spawn(Arc::clone(&runtime).run_reaper());

    let server = Server::new(Arc::clone(&runtime));
    let serve = async move { server.run().await };

    tokio::select! {
        result = serve => {
            // Loss of the listener is fatal.
            result.context("RPC server failed")?;
        }
        () = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    reaper.abort();
    runtime.shutdown().await;

    for path in [&config.socket_path, &pid_file] {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("can't remove {}: {e}", path.display());
            }
        }
    }

    info!("portod stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("can't install SIGINT handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("can't install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
