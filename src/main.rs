use bedrock_keeper::config::KeeperConfig;
use bedrock_keeper::keeper::Keeper;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("bedrock-keeper starting");

    let config = match KeeperConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    let token = match config.require_token() {
        Ok(t) => t.to_string(),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let keeper = Keeper::new(config);
    keeper.prepare().await?;
    let schedulers = keeper.spawn_schedulers();

    let shutdown = keeper.shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = termination_signal() => tracing::info!("Shutdown signal received"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });

    if let Err(e) = keeper.ipc_server(&token).start().await {
        tracing::error!("Control API error: {}", e);
        keeper.shutdown.cancel();
    }

    for handle in schedulers {
        let _ = handle.await;
    }

    if keeper.supervisor.shutdown().await {
        tracing::info!("Server stopped cleanly");
    } else {
        tracing::warn!("Server had to be killed");
    }
    tracing::info!("bedrock-keeper shutting down");
    Ok(())
}

/// Ctrl+C, or SIGTERM on unix.
async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
