use std::{
    collections::HashMap,
    sync::Arc,
};

use config_store::{
    ConfigStore,
    ConnectionConfig,
    PasswordSource,
};
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Pending,
    Active,
    Failed,
}

/// Health of one (connection, database) pair, updated on pool dials and on
/// every executed round-trip.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub state: StatusKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

#[derive(Default)]
struct Entry {
    /// Resolved password bytes. Memory only; erased when the connection
    /// definition changes.
    password: Option<Vec<u8>>,
    /// `SELECT version()` output from the first successful session.
    version: Option<String>,
    status_by_db: HashMap<String, ConnectionStatus>,
}

/// Owns per-connection runtime state layered over the durable config.
pub struct Registry {
    config: Arc<ConfigStore>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new(config: Arc<ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Looks up the connection and produces its password, running the
    /// password command on first use and caching the result in memory.
    pub async fn resolve(&self, name: &str) -> anyhow::Result<(ConnectionConfig, Vec<u8>)> {
        let conn = self.config.get(name).ok_or_else(|| {
            ErrorMetadata::bad_request_field(
                "UnknownConnection",
                format!("no connection named {name}"),
                "x-conn-name",
            )
        })?;
        let command = match conn.password_source()? {
            PasswordSource::Literal(p) => return Ok((conn.clone(), p.as_bytes().to_vec())),
            PasswordSource::Command(cmd) => cmd.to_string(),
        };
        if let Some(cached) = self
            .entries
            .lock()
            .get(name)
            .and_then(|e| e.password.clone())
        {
            return Ok((conn, cached));
        }
        let password = config_store::password::resolve_command(&command).await?;
        self.entries
            .lock()
            .entry(name.to_string())
            .or_default()
            .password = Some(password.clone());
        Ok((conn, password))
    }

    /// Drops runtime state derived from a connection definition. Called when
    /// the definition changes or disappears.
    pub fn forget(&self, name: &str) {
        self.entries.lock().remove(name);
    }

    pub fn note_status(&self, conn: &str, db: &str, state: StatusKind, message: impl Into<String>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(conn.to_string()).or_default();
        let server_version = entry.version.clone();
        entry.status_by_db.insert(
            db.to_string(),
            ConnectionStatus {
                state,
                message: message.into(),
                server_version,
            },
        );
    }

    pub fn note_version(&self, conn: &str, version: String) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(conn.to_string()).or_default();
        entry.version = Some(version.clone());
        for status in entry.status_by_db.values_mut() {
            status.server_version = Some(version.clone());
        }
    }

    pub fn version(&self, conn: &str) -> Option<String> {
        self.entries.lock().get(conn).and_then(|e| e.version.clone())
    }

    /// Snapshot of every known (connection, database) status, for the config
    /// listing endpoint. Configured connections that haven't been touched yet
    /// report an empty map.
    pub fn statuses(&self) -> HashMap<String, HashMap<String, ConnectionStatus>> {
        let entries = self.entries.lock();
        let mut out: HashMap<String, HashMap<String, ConnectionStatus>> = HashMap::new();
        for conn in self.config.list() {
            out.insert(
                conn.name.clone(),
                entries
                    .get(&conn.name)
                    .map(|e| e.status_by_db.clone())
                    .unwrap_or_default(),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(conns: Vec<ConnectionConfig>) -> Arc<ConfigStore> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(&path, serde_json::to_vec(&conns).unwrap()).unwrap();
        // Leak the tempdir so the file outlives the store in tests.
        std::mem::forget(dir);
        Arc::new(ConfigStore::load(path).await.unwrap())
    }

    fn literal_conn(name: &str) -> ConnectionConfig {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "username": "me",
            "password": "hunter2",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_resolve_literal() -> anyhow::Result<()> {
        let registry = Registry::new(store_with(vec![literal_conn("local")]).await);
        let (conn, password) = registry.resolve("local").await?;
        assert_eq!(conn.name, "local");
        assert_eq!(password, b"hunter2");
        Ok(())
    }

    #[tokio::test]
    async fn test_resolve_command_is_cached() -> anyhow::Result<()> {
        // The command appends to a scratch file so we can count invocations.
        let dir = tempfile::tempdir()?;
        let marker = dir.path().join("calls");
        let conn: ConnectionConfig = serde_json::from_value(serde_json::json!({
            "name": "prod",
            "username": "me",
            "password_file": format!("echo x >> {} && printf secret", marker.display()),
        }))?;
        let registry = Registry::new(store_with(vec![conn]).await);

        let (_, p1) = registry.resolve("prod").await?;
        let (_, p2) = registry.resolve("prod").await?;
        assert_eq!(p1, b"secret");
        assert_eq!(p2, b"secret");
        assert_eq!(std::fs::read_to_string(&marker)?.lines().count(), 1);

        // Forgetting the connection forces re-resolution.
        registry.forget("prod");
        let (_, p3) = registry.resolve("prod").await?;
        assert_eq!(p3, b"secret");
        assert_eq!(std::fs::read_to_string(&marker)?.lines().count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let registry = Registry::new(store_with(vec![]).await);
        let err = registry.resolve("nope").await.unwrap_err();
        assert_eq!(errors::ErrorMetadataAnyhowExt::short_msg(&err), "UnknownConnection");
    }

    #[tokio::test]
    async fn test_status_bookkeeping() {
        let registry = Registry::new(store_with(vec![literal_conn("local")]).await);
        registry.note_status("local", "postgres", StatusKind::Pending, "connecting");
        registry.note_version("local", "PostgreSQL 16.3".to_string());
        registry.note_status("local", "app", StatusKind::Active, "connected");

        let statuses = registry.statuses();
        // Versions learned later backfill existing statuses.
        assert_eq!(
            statuses["local"],
            maplit::hashmap! {
                "postgres".to_string() => ConnectionStatus {
                    state: StatusKind::Pending,
                    message: "connecting".to_string(),
                    server_version: Some("PostgreSQL 16.3".to_string()),
                },
                "app".to_string() => ConnectionStatus {
                    state: StatusKind::Active,
                    message: "connected".to_string(),
                    server_version: Some("PostgreSQL 16.3".to_string()),
                },
            }
        );

        registry.forget("local");
        assert!(registry.statuses()["local"].is_empty());
        assert_eq!(registry.version("local"), None);
    }
}
