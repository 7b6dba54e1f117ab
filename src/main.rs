//! hub-ssh-proxy entry point
//!
//! Exit codes: 0 on SIGINT/SIGTERM, 1 when the listener fails, 2 when the
//! configuration or host key cannot be loaded.

use std::process::ExitCode;

use hub_ssh_proxy::cli::CliArgs;
use hub_ssh_proxy::config::load_config;
use hub_ssh_proxy::proxy::{load_host_key, server_config, ProxyServer};
use hub_ssh_proxy::{build_context, init_logging};
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

const EXIT_LISTENER: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse_args();
    init_logging(&cli.log_level);

    let config = match load_config(&cli.config_file).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let host_key = match load_host_key(&config.host_key_path) {
        Ok(key) => key,
        Err(e) => {
            tracing::error!("Failed to load host key {:?}: {}", config.host_key_path, e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let ctx = match build_context(&config) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let listen = cli.listen_addr(&config.listen);
    tracing::info!(
        listen = %listen,
        hub = %config.jupyterhub.url,
        filter = ?config.filter,
        "Starting hub-ssh-proxy"
    );

    let server = match ProxyServer::bind(
        listen,
        server_config(host_key),
        ctx,
        config.limits.max_sessions,
    )
    .await
    {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::from(EXIT_LISTENER);
        }
    };

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn(server.serve(shutdown.clone()));

    tokio::select! {
        result = serving => {
            match result {
                Ok(Ok(())) => ExitCode::SUCCESS,
                Ok(Err(e)) => {
                    tracing::error!("Listener failed: {}", e);
                    ExitCode::from(EXIT_LISTENER)
                }
                Err(e) => {
                    tracing::error!("Listener task panicked: {}", e);
                    ExitCode::from(EXIT_LISTENER)
                }
            }
        }
        name = shutdown_signal() => {
            tracing::info!("{} received, shutting down...", name);
            shutdown.cancel();
            // Let sessions send their disconnect
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            ExitCode::SUCCESS
        }
    }
}

/// Resolves with the signal name on SIGINT or SIGTERM; never resolves if
/// the handlers cannot be installed
async fn shutdown_signal() -> &'static str {
    match wait_for_signal().await {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!("Failed to install signal handlers: {}", e);
            std::future::pending().await
        }
    }
}

async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => Ok("SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl-C")
    }
}
