use rewards_bridge::{
    server::{page_url, StaticFileServer, INDEX_PAGE},
    BridgeConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::from_env();
    if !config.asset_root.is_dir() {
        tracing::error!(root = %config.asset_root.display(), "asset root is not a directory");
        std::process::exit(1);
    }

    let server = StaticFileServer::new(config.asset_root.clone(), config.bind_host.clone());
    let addr = match server.start().await {
        Ok(addr) => addr,
        Err(error) => {
            tracing::error!(%error, "failed to start asset server");
            std::process::exit(1);
        }
    };

    tracing::info!(
        url = %page_url(addr, INDEX_PAGE),
        root = %config.asset_root.display(),
        "serving web client"
    );

    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
    }

    server.stop().await;
    tracing::info!("asset server stopped");
}
