use clap::Parser;
use replidb::config::{Options, ServerConfig};
use replidb::server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let options = Options::parse();
    let config = match ServerConfig::from_options(options) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    info!(
        "replidb starting on port {} as {}",
        config.port,
        if config.replicaof.is_some() {
            "replica"
        } else {
            "leader"
        }
    );

    // One token fans the shutdown signal out to the accept loop, every
    // connection task and the expiry sweeper.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("received shutdown signal");
            shutdown.cancel();
        });
    }

    if let Err(e) = server::run(config, shutdown).await {
        error!("server failed: {:#}", e);
        std::process::exit(1);
    }
    info!("server shut down cleanly");
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
