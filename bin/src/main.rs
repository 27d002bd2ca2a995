use anyhow::Context;
use tokio::net::TcpListener;

mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::Config::load_from_env().context("invalid configuration")?;

    logger::init(&config.log_filter);

    log::info!("starting gateway, aws_region={}, listen_addr={}", config.aws_region, config.listen_addr);

    let router = llm_gateway::router(&config).await.context("failed to build router")?;

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    log::info!("listening on {}", config.listen_addr);

    axum::serve(listener, router).with_graceful_shutdown(shutdown_signal()).await.context("server error")?;

    log::info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received SIGINT, shutting down"),
        _ = terminate => log::info!("received SIGTERM, shutting down"),
    }
}
