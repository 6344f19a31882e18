use std::path::PathBuf;

use clap::Parser;
use gateway::{
    logs::BroadcastLayer,
    make_app,
    router::router,
    LogChannel,
};
use tracing_subscriber::{
    filter::LevelFilter,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    Layer,
};

#[derive(Clone, Debug, Parser)]
#[command(name = "dbc", about = "Query gateway for PostgreSQL-family databases")]
struct Config {
    /// Listen address. Port 0 picks a free port.
    #[arg(long, env = "ADDR", default_value = "127.0.0.1:0")]
    addr: String,

    /// Path of the persisted connection list.
    #[arg(long = "config-path", env = "DBC_CONFIG", default_value = "connections.json")]
    config_path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    let logs = LogChannel::new();

    // Stdout and the websocket log channel see the same events; `DBC_LOG`
    // (or `RUST_LOG`) narrows both.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_filter(cmd_util::env::log_filter("info")),
        )
        .with(BroadcastLayer::new(logs.clone()).with_filter(LevelFilter::INFO))
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_server(config, logs))
}

async fn run_server(config: Config, logs: LogChannel) -> anyhow::Result<()> {
    tracing::info!("starting dbc gateway with config {config:?}");
    let st = make_app(config.config_path, logs).await?;
    let router = router(st.clone());

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("couldn't listen for ctrl-c: {e}");
            }
            tracing::info!("shutdown requested, draining requests");
        })
        .await?;

    st.executor.pools().shutdown();
    tracing::info!("server shut down");
    Ok(())
}
