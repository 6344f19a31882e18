//! Durable store of connection definitions.
//!
//! Connections are persisted as a JSON array in a single file (the path comes
//! from `DBC_CONFIG`). Mutations validate, persist atomically, and broadcast a
//! [`ConfigEvent`] per affected connection so session pools can tear down
//! state built from stale credentials.

use std::path::PathBuf;

use anyhow::Context;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use serde::{
    Deserialize,
    Serialize,
};
use tokio::sync::broadcast;

pub mod password;

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

/// One configured database server. Immutable once a pool is built from it;
/// editing a connection tears its pools down rather than mutating them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Literal password. Exactly one of `password`/`password_file` is set.
    #[serde(default)]
    pub password: Option<String>,
    /// Command line that prints the password on stdout.
    #[serde(default)]
    pub password_file: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default)]
    pub ssl: bool,
}

pub enum PasswordSource<'a> {
    Literal(&'a str),
    Command(&'a str),
}

impl ConnectionConfig {
    pub fn password_source(&self) -> anyhow::Result<PasswordSource<'_>> {
        match (&self.password, &self.password_file) {
            (Some(p), None) => Ok(PasswordSource::Literal(p)),
            (None, Some(cmd)) => Ok(PasswordSource::Command(cmd)),
            _ => Err(ErrorMetadata::invalid_config(format!(
                "connection {} must set exactly one of password or password_file",
                self.name
            ))
            .into()),
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_config("connection name must not be empty"));
        }
        if self.username.is_empty() {
            anyhow::bail!(ErrorMetadata::invalid_config(format!(
                "connection {} must set a username",
                self.name
            )));
        }
        self.password_source().map(|_| ())
    }
}

/// Emitted when a connection definition is removed or replaced with different
/// contents. Consumers drop pools, cached passwords, and cached catalog state
/// for `name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEvent {
    pub name: String,
}

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    connections: Mutex<Vec<ConnectionConfig>>,
    /// Serializes file writes so concurrent mutations can't interleave
    /// half-written snapshots.
    io_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ConfigEvent>,
}

impl ConfigStore {
    /// Loads the persisted connection list. A missing file is an empty list;
    /// an unreadable or malformed file is `InvalidConfig`.
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let connections = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<ConnectionConfig>>(&bytes).map_err(|e| {
                ErrorMetadata::invalid_config(format!(
                    "config file {} is not a valid connection list: {e}",
                    path.display()
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(anyhow::Error::from(e)
                    .context(format!("couldn't read config file {}", path.display())))
            },
        };
        validate_list(&connections)?;
        tracing::info!(
            "Loaded {} connection(s) from {}",
            connections.len(),
            path.display()
        );
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            path,
            connections: Mutex::new(connections),
            io_lock: tokio::sync::Mutex::new(()),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.events.subscribe()
    }

    pub fn list(&self) -> Vec<ConnectionConfig> {
        self.connections.lock().clone()
    }

    pub fn get(&self, name: &str) -> Option<ConnectionConfig> {
        self.connections.lock().iter().find(|c| c.name == name).cloned()
    }

    /// Adds or replaces one connection. Replacing an existing definition with
    /// different contents emits a change event.
    pub async fn upsert(&self, conn: ConnectionConfig) -> anyhow::Result<()> {
        conn.validate()?;
        let (snapshot, changed) = {
            let mut connections = self.connections.lock();
            let changed = match connections.iter_mut().find(|c| c.name == conn.name) {
                Some(existing) if *existing == conn => false,
                Some(existing) => {
                    *existing = conn.clone();
                    true
                },
                None => {
                    connections.push(conn.clone());
                    false
                },
            };
            (connections.clone(), changed)
        };
        self.persist(&snapshot).await?;
        if changed {
            let _ = self.events.send(ConfigEvent { name: conn.name });
        }
        Ok(())
    }

    /// Removes a connection by name. Unknown names are rejected so a typo'd
    /// delete doesn't silently succeed.
    pub async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let snapshot = {
            let mut connections = self.connections.lock();
            let before = connections.len();
            connections.retain(|c| c.name != name);
            if connections.len() == before {
                anyhow::bail!(ErrorMetadata::invalid_config(format!(
                    "no connection named {name}"
                )));
            }
            connections.clone()
        };
        self.persist(&snapshot).await?;
        let _ = self.events.send(ConfigEvent {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Replaces the whole connection list (the `PUT /config` shape). Returns
    /// the names whose definitions were removed or changed; one event is
    /// emitted per such name.
    pub async fn replace(&self, new: Vec<ConnectionConfig>) -> anyhow::Result<Vec<String>> {
        validate_list(&new)?;
        let affected = {
            let mut connections = self.connections.lock();
            let mut affected = Vec::new();
            for old in connections.iter() {
                match new.iter().find(|c| c.name == old.name) {
                    Some(replacement) if replacement == old => {},
                    _ => affected.push(old.name.clone()),
                }
            }
            *connections = new.clone();
            affected
        };
        self.persist(&new).await?;
        for name in &affected {
            let _ = self.events.send(ConfigEvent { name: name.clone() });
        }
        Ok(affected)
    }

    /// Writes the snapshot to a sibling temp file, then renames it over the
    /// config path so a crash mid-write never truncates the stored config.
    async fn persist(&self, snapshot: &[ConnectionConfig]) -> anyhow::Result<()> {
        let _guard = self.io_lock.lock().await;
        let body = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.path.with_extension("tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("couldn't write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("couldn't replace {}", self.path.display()))?;
        Ok(())
    }
}

fn validate_list(connections: &[ConnectionConfig]) -> anyhow::Result<()> {
    for (i, conn) in connections.iter().enumerate() {
        conn.validate()?;
        if connections[..i].iter().any(|c| c.name == conn.name) {
            anyhow::bail!(ErrorMetadata::invalid_config(format!(
                "duplicate connection name {}",
                conn.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use errors::{
        ErrorCode,
        ErrorMetadataAnyhowExt,
    };

    use super::*;

    fn conn(name: &str) -> ConnectionConfig {
        ConnectionConfig {
            name: name.to_string(),
            host: default_host(),
            port: default_port(),
            username: "postgres".to_string(),
            password: Some("hunter2".to_string()),
            password_file: None,
            database: default_database(),
            ssl: false,
        }
    }

    fn temp_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        (dir, path)
    }

    #[test]
    fn test_serde_defaults() {
        let parsed: ConnectionConfig =
            serde_json::from_str(r#"{"name":"local","username":"me","password":"pw"}"#).unwrap();
        assert_eq!(parsed.host, "localhost");
        assert_eq!(parsed.port, 5432);
        assert_eq!(parsed.database, "postgres");
        assert!(!parsed.ssl);
    }

    #[test]
    fn test_validation() {
        let mut c = conn("");
        assert!(c.validate().is_err());
        c = conn("x");
        c.username = String::new();
        assert!(c.validate().is_err());
        c = conn("x");
        c.password = None;
        assert!(c.validate().is_err());
        c.password_file = Some("pass show db".to_string());
        assert!(c.validate().is_ok());
        c.password = Some("also".to_string());
        assert!(c.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() -> anyhow::Result<()> {
        let (_dir, path) = temp_path();
        let store = ConfigStore::load(path).await?;
        assert!(store.list().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_load_malformed_file() {
        let (_dir, path) = temp_path();
        std::fs::write(&path, b"{not json").unwrap();
        let err = ConfigStore::load(path).await.unwrap_err();
        assert!(matches!(
            err.metadata().unwrap().code,
            ErrorCode::InvalidConfig
        ));
    }

    #[tokio::test]
    async fn test_persist_roundtrip() -> anyhow::Result<()> {
        let (_dir, path) = temp_path();
        let store = ConfigStore::load(path.clone()).await?;
        store.upsert(conn("a")).await?;
        store.upsert(conn("b")).await?;
        store.remove("a").await?;

        let reloaded = ConfigStore::load(path).await?;
        assert_eq!(reloaded.list(), vec![conn("b")]);
        Ok(())
    }

    #[tokio::test]
    async fn test_replace_reports_affected() -> anyhow::Result<()> {
        let (_dir, path) = temp_path();
        let store = ConfigStore::load(path).await?;
        store.upsert(conn("a")).await?;
        store.upsert(conn("b")).await?;
        store.upsert(conn("c")).await?;
        let mut rx = store.subscribe();

        // Drop a, change b, keep c.
        let mut b = conn("b");
        b.port = 5433;
        let mut affected = store.replace(vec![b, conn("c"), conn("d")]).await?;
        affected.sort();
        assert_eq!(affected, vec!["a".to_string(), "b".to_string()]);

        let mut seen = vec![rx.try_recv()?.name, rx.try_recv()?.name];
        seen.sort();
        assert_eq!(seen, vec!["a".to_string(), "b".to_string()]);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_upsert_rejects_duplicate_only_in_replace() -> anyhow::Result<()> {
        let (_dir, path) = temp_path();
        let store = ConfigStore::load(path).await?;
        let err = store.replace(vec![conn("a"), conn("a")]).await.unwrap_err();
        assert!(matches!(
            err.metadata().unwrap().code,
            ErrorCode::InvalidConfig
        ));
        Ok(())
    }
}
