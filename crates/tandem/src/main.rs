use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::FutureExt;

use tandem::config::{Settings, YateEndpoint};
use tandem::engine::{Engine, EngineConfig, EngineError};
use tandem::storage::{PgRoutingStorage, PgStage2Storage, RoutingStorage};
use tandem::{busy, cache};

/// Two-stage call-routing engine for event telephony networks.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Settings file to use.
    #[clap(
        long = "config",
        env = "TANDEM_CONFIG",
        default_value = "routing_engine.yaml"
    )]
    config: PathBuf,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[clap(long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Reasonable defaults for printing structured logs to stderr.
    let default_filter = if args.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(async_main(args));
    runtime.shutdown_timeout(Duration::from_secs(5));

    match result {
        Ok(()) => {
            tracing::info!("shutdown complete");
            Ok(())
        }
        Err(err) => {
            if let Some(EngineError::Transport(transport)) = err.downcast_ref::<EngineError>() {
                // the switch is authoritative; without it there is nothing
                // worth keeping alive
                tracing::error!(error = %transport, "switch transport lost, exiting");
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let settings = Settings::load(&args.config)?;
    tracing::info!(config = %args.config.display(), "starting routing engine");

    let routing_pool = connect_pool(&settings.database)
        .await
        .context("connecting to the routing database")?;
    let stage2_pool = if settings.stage2_database() == settings.database {
        routing_pool.clone()
    } else {
        connect_pool(settings.stage2_database())
            .await
            .context("connecting to the stage-2 database")?
    };

    let routing_storage = Arc::new(PgRoutingStorage::new(routing_pool));
    let stage2_storage = Arc::new(PgStage2Storage::new(stage2_pool));

    tracing::info!("loading switch hosts from the routing database");
    let yates = Arc::new(
        routing_storage
            .load_yates()
            .await
            .context("loading the switch-host map")?,
    );

    let routing_cache = cache::connect_routing_cache(&settings.routing_cache).await?;
    let busy_cache = busy::connect_busy_cache(&settings.busy_cache).await?;

    let engine = Engine {
        routing_storage,
        stage2_storage,
        routing_cache,
        busy_cache,
        yates,
        config: EngineConfig {
            local_yate_id: settings.local_yate_id,
            internal_listener: settings.internal_yate_listener.clone(),
            ringback_top_directory: settings.ringback_top_directory.clone(),
            routing_time_warning: Duration::from_millis(settings.routing_time_warning_ms),
        },
        ringback_probe: Engine::default_ringback_probe(),
    };

    let shutdown = shutdown_signal().shared();

    match &settings.yate {
        YateEndpoint::Socket { socket_path } => {
            let stream = tokio::net::UnixStream::connect(socket_path)
                .await
                .with_context(|| {
                    format!("connecting to switch socket {}", socket_path.display())
                })?;
            tracing::info!(socket = %socket_path.display(), "connected to switch");
            engine.serve(stream, shutdown).await?;
        }
        YateEndpoint::Tcp { host, port } => {
            let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .with_context(|| format!("connecting to switch at {host}:{port}"))?;
            tracing::info!(host = %host, port, "connected to switch");
            engine.serve(stream, shutdown).await?;
        }
    }
    Ok(())
}

async fn connect_pool(url: &str) -> anyhow::Result<sqlx::PgPool> {
    let options = url
        .parse::<sqlx::postgres::PgConnectOptions>()
        .context("parsing database URL")?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;
    Ok(pool)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(err) => {
            tracing::error!(error = %err, "failed to install the SIGTERM handler");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = sigterm.recv() => {}
    }
}
