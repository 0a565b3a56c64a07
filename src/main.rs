use anyhow::Context;

use graph_pool::config::ServerConfig;
use graph_pool::engine::echo_factory;
use graph_pool::pool::WorkerPool;
use graph_pool::routes::routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env().context("invalid server configuration")?;

    eprintln!("Graph Pool v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.pool.max_workers);
    eprintln!(
        "   Queue: {} (job TTL {}s)",
        config.pool.max_queue_size,
        config.pool.job_ttl.as_secs()
    );
    eprintln!("   API: http://{}/execute", config.bind_addr());

    let pool = WorkerPool::new(config.pool.clone(), echo_factory())
        .context("failed to start worker pool")?;

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    tracing::info!(addr = %config.bind_addr(), "HTTP server started");

    axum::serve(listener, routes(pool.clone()))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;

    pool.terminate().await;

    Ok(())
}
