//! Per-(connection, database) session pools.
//!
//! Pools are created lazily on first acquire and hold a small bounded set of
//! driver sessions. A handed-out [`Session`] returns to the pool on drop
//! unless it was marked broken or left a transaction open, in which case it
//! is discarded. Idle sessions are reaped after a lifetime without use.

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    future::poll_fn,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        LazyLock,
        Weak,
    },
    task::{
        ready,
        Poll,
    },
    time::Duration,
};

use anyhow::Context as _;
use cmd_util::env::env_config;
use config_store::ConnectionConfig;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio::{
    io::{
        AsyncRead,
        AsyncWrite,
    },
    sync::{
        OwnedSemaphorePermit,
        Semaphore,
    },
    time::Instant,
};
use tokio_postgres::{
    AsyncMessage,
    CancelToken,
    Client,
    NoTls,
};
use tokio_postgres_rustls::MakeRustlsConnect;

use crate::{
    registry::{
        Registry,
        StatusKind,
    },
    tls,
};

static POOL_SIZE: LazyLock<usize> = LazyLock::new(|| env_config("DBC_POOL_SIZE", 4));

static IDLE_SESSION_LIFETIME: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DBC_IDLE_SESSION_SECONDS", 300)));

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

fn build_pg_config(
    conn: &ConnectionConfig,
    password: &[u8],
    database: &str,
) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&conn.host)
        .port(conn.port)
        .user(&conn.username)
        .password(password)
        .dbname(database)
        .application_name("dbc")
        .connect_timeout(DIAL_TIMEOUT);
    config
}

/// Drives a session's socket, logging server notices until the session
/// closes.
fn spawn_driver<S, T>(connection_name: String, mut conn: tokio_postgres::Connection<S, T>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(poll_fn(move |cx| loop {
        match ready!(conn.poll_message(cx)) {
            Some(Ok(AsyncMessage::Notice(notice))) => {
                tracing::info!("{connection_name}: {}: {}", notice.severity(), notice.message());
            },
            Some(Ok(msg)) => {
                // The only other message kind is a Notification and we don't
                // issue LISTEN.
                tracing::warn!("{connection_name}: unexpected message: {msg:?}");
            },
            Some(Err(e)) => {
                tracing::error!("{connection_name}: session error: {e}");
                return Poll::Ready(());
            },
            None => return Poll::Ready(()),
        }
    }));
}

fn dial_error(e: tokio_postgres::Error) -> anyhow::Error {
    if let Some(db) = e.as_db_error() {
        if db.code().code().starts_with(crate::AUTH_SQLSTATE_CLASS) {
            return ErrorMetadata::auth_failure("AuthFailed", db.message().to_string()).into();
        }
        return ErrorMetadata::unavailable("DialFailed", db.message().to_string()).into();
    }
    let msg = e.to_string();
    anyhow::Error::from(e).context(ErrorMetadata::unavailable("DialFailed", msg))
}

/// A session owned by either the pool (idle) or a [`Session`] (in use).
struct PooledSession {
    client: Client,
    tls: Option<MakeRustlsConnect>,
    last_used: Instant,
}

/// Cancels an in-flight query out-of-band. Detached from the [`Session`] so
/// cancellation can run after the request future is gone.
pub struct QueryCanceller {
    token: CancelToken,
    tls: Option<MakeRustlsConnect>,
}

impl QueryCanceller {
    pub async fn cancel(self) {
        let result = match self.tls {
            Some(tls) => self.token.cancel_query(tls).await,
            None => self.token.cancel_query(NoTls).await,
        };
        if let Err(e) = result {
            tracing::warn!("couldn't deliver CancelRequest: {e}");
        }
    }
}

/// An active session from a [`SessionPool`]. Held exclusively for the whole
/// script; returned to the pool on drop unless broken or mid-transaction.
pub struct Session {
    pool: Arc<SessionPool>,
    _permit: OwnedSemaphorePermit,
    conn: Option<PooledSession>,
    broken: AtomicBool,
    in_transaction: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

impl Session {
    pub fn client(&self) -> &Client {
        &self
            .conn
            .as_ref()
            .expect("session is only taken in Drop")
            .client
    }

    pub fn canceller(&self) -> QueryCanceller {
        let conn = self.conn.as_ref().expect("session is only taken in Drop");
        QueryCanceller {
            token: conn.client.cancel_token(),
            tls: conn.tls.clone(),
        }
    }

    /// Prevents this session from returning to the pool. Used when the driver
    /// can't guarantee clean recovery (cancellation mid-stream, protocol
    /// errors).
    pub fn mark_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    /// Executors report transaction-control statements so a session that left
    /// a transaction open is discarded instead of reused.
    pub fn set_in_transaction(&self, open: bool) {
        self.in_transaction.store(open, Ordering::Relaxed);
    }

    pub fn connection_name(&self) -> &str {
        &self.pool.connection
    }

    pub fn database(&self) -> &str {
        &self.pool.database
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if *self.broken.get_mut() {
            tracing::warn!(
                "discarding broken session for {}/{}",
                self.pool.connection,
                self.pool.database
            );
            return;
        }
        if *self.in_transaction.get_mut() {
            tracing::warn!(
                "discarding session with an open transaction for {}/{}",
                self.pool.connection,
                self.pool.database
            );
            return;
        }
        conn.last_used = Instant::now();
        let mut idle = self.pool.idle.lock();
        // Don't return sessions to a pool that has been torn down.
        if !self.pool.semaphore.is_closed() {
            idle.push_back(conn);
        }
    }
}

/// A bounded lazy pool of driver sessions for one (connection, database).
pub struct SessionPool {
    registry: Arc<Registry>,
    connection: String,
    database: String,
    /// Limits the number of sessions handed out simultaneously.
    semaphore: Arc<Semaphore>,
    /// Idle sessions ordered by `last_used`, oldest first.
    idle: Mutex<VecDeque<PooledSession>>,
    /// At most one dial in flight per pool, so a burst of requests against a
    /// cold pool doesn't stampede the server.
    dial_lock: tokio::sync::Mutex<()>,
}

impl SessionPool {
    fn new(registry: Arc<Registry>, connection: String, database: String) -> Arc<Self> {
        let this = Arc::new(Self {
            registry,
            connection,
            database,
            semaphore: Arc::new(Semaphore::new(*POOL_SIZE)),
            idle: Mutex::new(VecDeque::new()),
            dial_lock: tokio::sync::Mutex::new(()),
        });
        let weak = Arc::downgrade(&this);
        tokio::spawn(Self::idle_reaper(weak));
        this
    }

    async fn idle_reaper(weak: Weak<Self>) {
        loop {
            tokio::time::sleep(*IDLE_SESSION_LIFETIME / 2).await;
            let Some(pool) = weak.upgrade() else {
                return;
            };
            if pool.semaphore.is_closed() {
                return;
            }
            let mut idle = pool.idle.lock();
            while let Some(conn) = idle.front() {
                if conn.last_used.elapsed() > *IDLE_SESSION_LIFETIME {
                    idle.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn pop_idle(&self) -> Option<PooledSession> {
        let mut idle = self.idle.lock();
        // Reuse the newest session; the oldest are reaper fodder.
        while let Some(conn) = idle.pop_back() {
            if conn.client.is_closed() {
                continue;
            }
            return Some(conn);
        }
        None
    }

    async fn acquire(self: &Arc<Self>) -> anyhow::Result<Session> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ErrorMetadata::unavailable("PoolClosed", "session pool was shut down"))?;
        let conn = match self.pop_idle() {
            Some(conn) => conn,
            None => self.create_session().await?,
        };
        Ok(Session {
            pool: self.clone(),
            _permit: permit,
            conn: Some(conn),
            broken: AtomicBool::new(false),
            in_transaction: AtomicBool::new(false),
        })
    }

    async fn create_session(&self) -> anyhow::Result<PooledSession> {
        let _dial = self.dial_lock.lock().await;
        // Whoever held the dial lock may have failed and released a permit
        // another task used to return a session; prefer that one.
        if let Some(conn) = self.pop_idle() {
            return Ok(conn);
        }
        self.registry.note_status(
            &self.connection,
            &self.database,
            StatusKind::Pending,
            "connecting",
        );
        let (conn_config, password) = self.registry.resolve(&self.connection).await?;
        let pg_config = build_pg_config(&conn_config, &password, &self.database);
        let dialed = if conn_config.ssl {
            let tls = tls::connector()?;
            match pg_config.connect(tls.clone()).await {
                Ok((client, conn)) => {
                    spawn_driver(self.connection.clone(), conn);
                    Ok((client, Some(tls)))
                },
                Err(e) => Err(e),
            }
        } else {
            match pg_config.connect(NoTls).await {
                Ok((client, conn)) => {
                    spawn_driver(self.connection.clone(), conn);
                    Ok((client, None))
                },
                Err(e) => Err(e),
            }
        };
        let (client, tls) = match dialed {
            Ok(ok) => ok,
            Err(e) => {
                self.registry.note_status(
                    &self.connection,
                    &self.database,
                    StatusKind::Failed,
                    e.to_string(),
                );
                return Err(dial_error(e));
            },
        };
        if self.registry.version(&self.connection).is_none() {
            match client.query_one("SELECT version()", &[]).await {
                Ok(row) => {
                    if let Ok(version) = row.try_get::<_, String>(0) {
                        self.registry.note_version(&self.connection, version);
                    }
                },
                Err(e) => tracing::warn!("version probe failed for {}: {e}", self.connection),
            }
        }
        self.registry.note_status(
            &self.connection,
            &self.database,
            StatusKind::Active,
            "connected",
        );
        Ok(PooledSession {
            client,
            tls,
            last_used: Instant::now(),
        })
    }

    fn shutdown(&self) {
        self.semaphore.close();
        self.idle.lock().clear();
    }
}

/// Multiplexes pools across every configured (connection, database).
pub struct PoolManager {
    registry: Arc<Registry>,
    pools: Mutex<HashMap<(String, String), Arc<SessionPool>>>,
}

impl PoolManager {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Acquires a session, dialing lazily. A session that can't be produced
    /// within `timeout` is `Unavailable`.
    pub async fn acquire(
        &self,
        connection: &str,
        database: &str,
        timeout: Duration,
    ) -> anyhow::Result<Session> {
        let pool = {
            let mut pools = self.pools.lock();
            pools
                .entry((connection.to_string(), database.to_string()))
                .or_insert_with(|| {
                    SessionPool::new(
                        self.registry.clone(),
                        connection.to_string(),
                        database.to_string(),
                    )
                })
                .clone()
        };
        tokio::time::timeout(timeout, pool.acquire())
            .await
            .map_err(|_| {
                ErrorMetadata::unavailable(
                    "AcquireTimeout",
                    format!("couldn't acquire a session for {connection}/{database} within {timeout:?}"),
                )
            })?
            .with_context(|| format!("acquiring session for {connection}/{database}"))
    }

    /// Tears down every pool of one connection. Called on config changes.
    pub fn invalidate_connection(&self, connection: &str) {
        let removed: Vec<_> = {
            let mut pools = self.pools.lock();
            let keys: Vec<_> = pools
                .keys()
                .filter(|(c, _)| c == connection)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| pools.remove(&k)).collect()
        };
        for pool in removed {
            pool.shutdown();
        }
    }

    pub fn invalidate_database(&self, connection: &str, database: &str) {
        let removed = self
            .pools
            .lock()
            .remove(&(connection.to_string(), database.to_string()));
        if let Some(pool) = removed {
            pool.shutdown();
        }
    }

    pub fn shutdown(&self) {
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.shutdown();
        }
    }

    #[cfg(test)]
    fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }
}
