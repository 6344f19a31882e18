//! Connection configuration endpoints.

use std::collections::HashMap;

use axum::extract::{
    Path,
    State,
};
use config_store::ConnectionConfig;
use errors::ErrorMetadata;
use http::StatusCode;
use serde::Serialize;
use sessions::ConnectionStatus;

use crate::{
    http::{
        HttpResponseError,
        Json,
    },
    AppState,
};

#[derive(Serialize)]
pub struct ConnectionWithStatus {
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Per-database status for every (connection, database) this process
    /// has touched. Empty until a pool dials.
    pub status: HashMap<String, ConnectionStatus>,
}

/// `GET /config`: the configured connections plus their observed statuses.
pub async fn get_config(
    State(st): State<AppState>,
) -> Result<Json<Vec<ConnectionWithStatus>>, HttpResponseError> {
    let mut statuses = st.executor.registry().statuses();
    let connections = st
        .config
        .list()
        .into_iter()
        .map(|connection| ConnectionWithStatus {
            status: statuses.remove(&connection.name).unwrap_or_default(),
            connection,
        })
        .collect();
    Ok(Json(connections))
}

/// `PUT /config`: replaces the connection list. Pools, cached passwords,
/// and caches of removed or changed connections are torn down before the
/// 204 goes out.
pub async fn put_config(
    State(st): State<AppState>,
    Json(connections): Json<Vec<ConnectionConfig>>,
) -> Result<StatusCode, HttpResponseError> {
    let affected = st.config.replace(connections).await?;
    for name in &affected {
        st.teardown_connection(name);
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
pub struct ConnectionInfo {
    pub info: String,
}

/// Shortens `SELECT version()` output ("PostgreSQL 16.3 on x86_64..., ...")
/// to "<product> <version>".
fn short_version(version: &str) -> String {
    version
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(',')
        .to_string()
}

/// `GET /connections/{name}`: the server's product and version, probed
/// lazily over the connection's default database.
pub async fn connection_info(
    State(st): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ConnectionInfo>, HttpResponseError> {
    let registry = st.executor.registry();
    if let Some(version) = registry.version(&name) {
        return Ok(Json(ConnectionInfo {
            info: short_version(&version),
        }));
    }
    let connection = st.config.get(&name).ok_or_else(|| {
        ErrorMetadata::bad_request_field(
            "UnknownConnection",
            format!("no connection named {name}"),
            "x-conn-name",
        )
    })?;
    // The dial records the version in the registry as a side effect.
    let _session = st
        .executor
        .pools()
        .acquire(&name, &connection.database, std::time::Duration::from_secs(10))
        .await?;
    let version = registry.version(&name).ok_or_else(|| {
        ErrorMetadata::unavailable("VersionUnknown", "the server didn't report a version")
    })?;
    Ok(Json(ConnectionInfo {
        info: short_version(&version),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_version() {
        assert_eq!(
            short_version(
                "PostgreSQL 16.3 on x86_64-pc-linux-gnu, compiled by gcc (GCC) 13.2.0, 64-bit"
            ),
            "PostgreSQL 16.3"
        );
        assert_eq!(short_version("PostgreSQL 15.1,"), "PostgreSQL 15.1");
    }
}
