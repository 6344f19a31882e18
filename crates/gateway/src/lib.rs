//! The HTTP/WS surface of the query gateway: routing, header-based
//! connection selection, and the diagnostic log channel. Everything below
//! this crate is transport-agnostic.

use std::{
    path::PathBuf,
    sync::Arc,
};

use config_store::ConfigStore;
use executor::Executor;
use sessions::{
    PoolManager,
    Registry,
};

pub mod catalog;
pub mod config_endpoints;
pub mod http;
pub mod logs;
pub mod query;
pub mod router;

pub use logs::LogChannel;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub executor: Arc<Executor>,
    pub logs: LogChannel,
}

impl AppState {
    /// Drops every piece of runtime state derived from one connection's
    /// definition: pools, cached password, observed version, response cache
    /// entries, and catalog slices.
    pub fn teardown_connection(&self, name: &str) {
        tracing::info!("tearing down state for connection {name}");
        self.executor.registry().forget(name);
        self.executor.pools().invalidate_connection(name);
        self.executor.cache().invalidate_connection(name);
        self.executor.catalog().invalidate_connection(name);
    }
}

/// Loads the config and wires the registry, pools, executor, and the
/// config-change listener together.
pub async fn make_app(config_path: PathBuf, logs: LogChannel) -> anyhow::Result<AppState> {
    let config = Arc::new(ConfigStore::load(config_path).await?);
    let registry = Registry::new(config.clone());
    let pools = PoolManager::new(registry.clone());
    let executor = Executor::new(registry, pools);

    let st = AppState {
        config,
        executor,
        logs,
    };

    // The pool manager observes config changes through this channel rather
    // than holding a reference back into the store, which keeps teardown
    // ordered: store first, then derived state.
    let mut events = st.config.subscribe();
    let listener_st = st.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => listener_st.teardown_connection(&event.name),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    Ok(st)
}
