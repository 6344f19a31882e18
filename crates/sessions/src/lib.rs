//! Live state for configured connections: the registry (credentials,
//! observed server version, per-database status) and the session pools.

mod pool;
mod registry;
mod tls;

pub use pool::{
    PoolManager,
    QueryCanceller,
    Session,
    SessionPool,
};
pub use registry::{
    ConnectionStatus,
    Registry,
    StatusKind,
};

use errors::ErrorMetadata;

/// SQLSTATE class for authentication/authorization failures.
const AUTH_SQLSTATE_CLASS: &str = "28";

/// SQLSTATE for `query_canceled`, produced by our own CancelRequest.
const QUERY_CANCELED_SQLSTATE: &str = "57014";

/// Converts a driver error into the gateway's wire taxonomy. Server-reported
/// SQL errors keep their severity/code/position; connection-level failures
/// become `Unavailable`.
pub fn classify_pg_error(e: tokio_postgres::Error) -> anyhow::Error {
    if let Some(db) = e.as_db_error() {
        let code = db.code().code();
        if code == QUERY_CANCELED_SQLSTATE {
            return ErrorMetadata::canceled().into();
        }
        let position = match db.position() {
            Some(tokio_postgres::error::ErrorPosition::Original(p)) => Some(*p),
            _ => None,
        };
        if code.starts_with(AUTH_SQLSTATE_CLASS) {
            return ErrorMetadata::auth_failure("AuthFailed", db.message().to_string()).into();
        }
        return ErrorMetadata::pg(
            db.severity().to_string(),
            code.to_string(),
            db.message().to_string(),
            position,
        )
        .into();
    }
    if e.is_closed() {
        return anyhow::Error::from(e)
            .context(ErrorMetadata::unavailable("SessionClosed", "database session closed"));
    }
    let msg = e.to_string();
    anyhow::Error::from(e).context(ErrorMetadata::unavailable("DatabaseUnreachable", msg))
}
