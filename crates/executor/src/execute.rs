//! Runs classified scripts through pooled sessions: one session held
//! exclusively from the first statement to the last, the final statement's
//! result shaped into a [`ResultPage`], cancellation threaded from the
//! caller down to a driver-level CancelRequest.

use std::{
    sync::{
        Arc,
        LazyLock,
    },
    time::Duration,
};

use cmd_util::env::env_config;
use errors::{
    ErrorCode,
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sessions::{
    classify_pg_error,
    PoolManager,
    Registry,
    Session,
    StatusKind,
};
use statements::{
    explain_sql,
    paginate,
    split_script,
    Filter,
    Sort,
    Statement,
    StatementKind,
    PAGE_SIZE_ALL,
};
use tokio_postgres::{
    types::ToSql,
    Client,
};

use crate::{
    annotate::CatalogCache,
    cache::{
        fingerprint,
        CacheRequest,
        ResponseCache,
    },
    decode::{
        columns_meta,
        decode_cell,
        decode_rows,
        is_native,
    },
    params::{
        convert_params,
        Param,
    },
    probe::{
        probe,
        PrepareResponse,
    },
    results::{
        ResultEntries,
        ResultPage,
    },
};

static QUERY_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DBC_QUERY_TIMEOUT_SECONDS", 30)));

static CATALOG_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DBC_CATALOG_TIMEOUT_SECONDS", 5)));

/// The pagination wrapper's prefix, for mapping server error positions back
/// into the user's statement text.
const WRAPPER_PREFIX: &str = "WITH __base AS (\n";

fn default_page() -> u64 {
    1
}

fn default_page_size() -> i64 {
    100
}

fn default_use_cache() -> bool {
    true
}

/// The `POST /query` request body.
#[derive(Clone, Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub params: Vec<JsonValue>,
    #[serde(default)]
    pub sort: Option<Sort>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default = "default_page")]
    pub page: u64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    #[serde(default)]
    pub cache_ttl_seconds: Option<u64>,
}

/// Issues a driver CancelRequest and breaks the session if the request
/// future is dropped (client went away, budget elapsed) while a statement
/// may be in flight.
struct CancelGuard<'a> {
    session: &'a Session,
    armed: bool,
}

impl<'a> CancelGuard<'a> {
    fn arm(session: &'a Session) -> Self {
        Self {
            session,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.session.mark_broken();
        let canceller = self.session.canceller();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(canceller.cancel());
        }
    }
}

fn param_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Rebases a server-reported error position from the pagination wrapper's
/// text onto the user's statement. Positions pointing into wrapper syntax
/// (or filter predicates) carry no useful editor location and are dropped.
fn shift_wrapper_position(err: anyhow::Error, statement: &Statement) -> anyhow::Error {
    let Some(em) = err.metadata() else {
        return err;
    };
    let ErrorCode::Pg {
        severity,
        code,
        position: Some(position),
    } = &em.code
    else {
        return err;
    };
    let offset = WRAPPER_PREFIX.chars().count() as u32;
    let user_len = statement.text.chars().count() as u32;
    let rebased = (*position > offset && *position <= offset + user_len)
        .then(|| position - offset);
    ErrorMetadata::pg(severity.clone(), code.clone(), em.msg.to_string(), rebased).into()
}

pub struct Executor {
    registry: Arc<Registry>,
    pools: Arc<PoolManager>,
    cache: Arc<ResponseCache>,
    catalog: Arc<CatalogCache>,
}

impl Executor {
    pub fn new(registry: Arc<Registry>, pools: Arc<PoolManager>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            pools,
            cache: ResponseCache::new(),
            catalog: CatalogCache::new(),
        })
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn catalog(&self) -> &Arc<CatalogCache> {
        &self.catalog
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The `/query` entry point: classify, consult the cache, execute,
    /// shape the response.
    pub async fn query(
        &self,
        connection: &str,
        database: &str,
        req: QueryRequest,
    ) -> anyhow::Result<ResultPage> {
        let statements = split_script(&req.query);
        let Some(last) = statements.last() else {
            anyhow::bail!(ErrorMetadata::bad_request_field(
                "EmptyQuery",
                "the submitted script contains no statements",
                "query",
            ));
        };
        let cacheable = matches!(last.kind, StatementKind::Select | StatementKind::Explain);
        let request = CacheRequest {
            connection: connection.to_string(),
            database: database.to_string(),
            fingerprint: fingerprint(
                connection,
                database,
                &req.query,
                &req.params,
                req.sort.as_ref(),
                &req.filters,
                req.page,
                req.page_size,
            ),
            tables: last
                .tables
                .iter()
                .map(|t| t.name.to_ascii_lowercase())
                .collect(),
            ttl_seconds: req.cache_ttl_seconds,
            use_cache: req.use_cache,
            cacheable,
        };
        let page = self
            .cache
            .get_or_load(
                request,
                self.execute_script(connection, database, &statements, &req),
            )
            .await?;
        Ok(page.as_ref().clone())
    }

    /// Probes parameter and column metadata for the last statement of the
    /// submitted script without executing anything.
    pub async fn prepare(
        &self,
        connection: &str,
        database: &str,
        query: &str,
    ) -> anyhow::Result<PrepareResponse> {
        let statements = split_script(query);
        let Some(statement) = statements.last() else {
            anyhow::bail!(ErrorMetadata::bad_request_field(
                "EmptyQuery",
                "the submitted script contains no statements",
                "query",
            ));
        };
        let session = self
            .pools
            .acquire(connection, database, *CATALOG_TIMEOUT)
            .await?;
        match tokio::time::timeout(*CATALOG_TIMEOUT, probe(session.client(), statement)).await {
            Ok(result) => result,
            Err(_) => Err(ErrorMetadata::canceled().into()),
        }
    }

    /// Runs one of the predefined catalog queries on a routed session and
    /// decodes the rows. Parameters bind as text.
    pub async fn catalog_query(
        &self,
        connection: &str,
        database: &str,
        sql: &str,
        params: &[&str],
    ) -> anyhow::Result<Vec<Vec<JsonValue>>> {
        let session = self
            .pools
            .acquire(connection, database, *CATALOG_TIMEOUT)
            .await?;
        let client = session.client();
        let result = tokio::time::timeout(*CATALOG_TIMEOUT, async {
            let prepared = client.prepare(sql).await.map_err(classify_pg_error)?;
            let owned: Vec<Param> = params
                .iter()
                .map(|p| Param::Coerced(p.to_string()))
                .collect();
            let rows = client
                .query(&prepared, &param_refs(&owned))
                .await
                .map_err(classify_pg_error)?;
            decode_rows(&rows, 0)
        })
        .await;
        match result {
            Ok(rows) => rows,
            Err(_) => Err(ErrorMetadata::canceled().into()),
        }
    }

    async fn execute_script(
        &self,
        connection: &str,
        database: &str,
        statements: &[Statement],
        req: &QueryRequest,
    ) -> anyhow::Result<ResultPage> {
        let session = self
            .pools
            .acquire(connection, database, *QUERY_TIMEOUT)
            .await?;
        let outcome = tokio::time::timeout(*QUERY_TIMEOUT, async {
            let guard = CancelGuard::arm(&session);
            let result = self.run_statements(&session, statements, req).await;
            guard.disarm();
            result
        })
        .await;

        // Invalidation keys off classification rather than the execution
        // outcome: over-invalidating is harmless, missing one is not.
        let mut structure_changed = false;
        let mut data_modified = false;
        let mut modified_tables: Vec<String> = Vec::new();
        for statement in statements {
            let effective_kind = match statement.kind {
                // EXPLAIN ANALYZE executes the wrapped statement for real.
                StatementKind::Explain if statement.explain_analyze => {
                    statement.inner_kind.unwrap_or(StatementKind::Unknown)
                },
                kind => kind,
            };
            match effective_kind {
                StatementKind::ModifyStructure => structure_changed = true,
                StatementKind::ModifyData => {
                    data_modified = true;
                    modified_tables
                        .extend(statement.tables.iter().map(|t| t.name.to_ascii_lowercase()));
                },
                _ => {},
            }
        }
        if structure_changed {
            self.cache.invalidate_bucket(connection, database);
            self.catalog.invalidate(connection, database);
        } else if data_modified {
            self.cache.invalidate_tables(connection, database, &modified_tables);
        }

        match outcome {
            Ok(result) => {
                if result.is_ok() {
                    self.registry
                        .note_status(connection, database, StatusKind::Active, "ok");
                }
                result
            },
            Err(_) => Err(ErrorMetadata::canceled().into()),
        }
    }

    async fn run_statements(
        &self,
        session: &Session,
        statements: &[Statement],
        req: &QueryRequest,
    ) -> anyhow::Result<ResultPage> {
        let client = session.client();
        let mut open_transaction = false;
        for (i, statement) in statements.iter().enumerate() {
            match statement.leading_keyword.as_str() {
                "begin" => open_transaction = true,
                "commit" | "rollback" => open_transaction = false,
                _ => {},
            }
            session.set_in_transaction(open_transaction);
            if i + 1 == statements.len() {
                return self.run_last(session, client, statement, req).await;
            }
            self.run_intermediate(client, statement, &req.params).await?;
        }
        anyhow::bail!(ErrorMetadata::bad_request_field(
            "EmptyQuery",
            "the submitted script contains no statements",
            "query",
        ));
    }

    /// Statements before the last run for their effects only.
    async fn run_intermediate(
        &self,
        client: &Client,
        statement: &Statement,
        params: &[JsonValue],
    ) -> anyhow::Result<()> {
        let prepared = client
            .prepare(&statement.text)
            .await
            .map_err(classify_pg_error)?;
        let converted = convert_params(params, prepared.params())?;
        client
            .execute(&prepared, &param_refs(&converted))
            .await
            .map_err(classify_pg_error)?;
        Ok(())
    }

    async fn run_last(
        &self,
        session: &Session,
        client: &Client,
        statement: &Statement,
        req: &QueryRequest,
    ) -> anyhow::Result<ResultPage> {
        match statement.kind {
            StatementKind::Select => self.run_select(session, client, statement, req).await,
            StatementKind::Explain => self.run_explain(client, statement, req).await,
            StatementKind::ModifyData => {
                let affected_rows = self.run_for_count(client, statement, req).await?;
                Ok(ResultPage::ModifyData { affected_rows })
            },
            StatementKind::ModifyStructure => {
                self.run_for_count(client, statement, req).await?;
                Ok(ResultPage::ModifyStructure {})
            },
            StatementKind::Utility | StatementKind::Unknown => {
                let affected_rows = self.run_for_count(client, statement, req).await?;
                Ok(ResultPage::ModifyData { affected_rows })
            },
        }
    }

    async fn run_for_count(
        &self,
        client: &Client,
        statement: &Statement,
        req: &QueryRequest,
    ) -> anyhow::Result<u64> {
        let prepared = client
            .prepare(&statement.text)
            .await
            .map_err(classify_pg_error)?;
        let converted = convert_params(&req.params, prepared.params())?;
        client
            .execute(&prepared, &param_refs(&converted))
            .await
            .map_err(classify_pg_error)
    }

    async fn run_select(
        &self,
        session: &Session,
        client: &Client,
        statement: &Statement,
        req: &QueryRequest,
    ) -> anyhow::Result<ResultPage> {
        // SHOW classifies as a read but isn't a query expression, so the CTE
        // wrapper would be rejected. It yields one row; run it bare.
        if statement.leading_keyword == "show" {
            let prepared = client
                .prepare(&statement.text)
                .await
                .map_err(classify_pg_error)?;
            let rows = client.query(&prepared, &[]).await.map_err(classify_pg_error)?;
            let total_count = rows.len() as i64;
            return Ok(ResultPage::Select {
                page: 1,
                page_size: req.page_size,
                total_count,
                total_pages: 1,
                sort: None,
                entries: ResultEntries {
                    columns: columns_meta(prepared.columns()),
                    rows: decode_rows(&rows, 0)?,
                },
            });
        }
        let rewritten = paginate(
            statement,
            req.page,
            req.page_size,
            req.sort.as_ref(),
            &req.filters,
        )?;
        let prepared = client
            .prepare(&rewritten.sql)
            .await
            .map_err(|e| shift_wrapper_position(classify_pg_error(e), statement))?;

        let user_count = prepared.params().len().saturating_sub(rewritten.binds.len());
        let user_types = &prepared.params()[..user_count];
        let mut converted = convert_params(&req.params, user_types)?;
        converted.extend(rewritten.binds.iter().cloned().map(Param::from));

        // Result columns, minus the wrapper's __total projection.
        let mut columns = columns_meta(&prepared.columns()[1..]);
        for (ordinal, column) in columns.iter_mut().enumerate() {
            column.ordinal = ordinal;
        }

        // Columns the driver can't decode natively re-run through a text
        // cast; the reported column types stay the original ones. The
        // subquery's columns get positional aliases so duplicate output
        // names (SELECT t1.id, t2.id ...) stay referenceable; rows decode
        // by position, so the synthetic names never reach the response.
        let exec_prepared = if prepared.columns().iter().all(|c| is_native(c.type_())) {
            prepared.clone()
        } else {
            let aliases: Vec<String> = (0..prepared.columns().len())
                .map(|i| format!("col{i}"))
                .collect();
            let projection: Vec<String> = prepared
                .columns()
                .iter()
                .zip(&aliases)
                .map(|(c, alias)| {
                    if is_native(c.type_()) {
                        alias.clone()
                    } else {
                        format!("{alias}::text")
                    }
                })
                .collect();
            let cast_sql = format!(
                "SELECT {} FROM (\n{}\n) __page({})",
                projection.join(", "),
                rewritten.sql,
                aliases.join(", "),
            );
            client
                .prepare(&cast_sql)
                .await
                .map_err(classify_pg_error)?
        };

        let refs = param_refs(&converted);
        let rows = client
            .query(&exec_prepared, &refs)
            .await
            .map_err(|e| shift_wrapper_position(classify_pg_error(e), statement))?;

        let total_count = match rows.first() {
            Some(row) => row.try_get::<_, i64>(0)?,
            // An empty page past the end still needs the real count.
            None if req.page > 1 => {
                self.recount(client, statement, req, &converted).await?
            },
            None => 0,
        };
        let rows = decode_rows(&rows, 1)?;

        let total_pages = if req.page_size == PAGE_SIZE_ALL {
            1
        } else {
            (total_count + req.page_size - 1) / req.page_size
        };

        let annotate = self.catalog.annotate(
            session.connection_name(),
            session.database(),
            client,
            &mut columns,
        );
        match tokio::time::timeout(*CATALOG_TIMEOUT, annotate).await {
            Ok(Err(e)) => tracing::warn!("column annotation failed: {e:#}"),
            Err(_) => tracing::warn!("column annotation timed out"),
            Ok(Ok(())) => {},
        }

        Ok(ResultPage::Select {
            page: req.page,
            page_size: req.page_size,
            total_count,
            total_pages,
            sort: req.sort,
            entries: ResultEntries {
                columns,
                rows,
            },
        })
    }

    /// Re-runs the wrapper at page 1 size 1 purely for its `__total`
    /// projection, used when the requested page is past the end.
    async fn recount(
        &self,
        client: &Client,
        statement: &Statement,
        req: &QueryRequest,
        converted: &[Param],
    ) -> anyhow::Result<i64> {
        let counting = paginate(statement, 1, 1, None, &req.filters)?;
        let prepared = client
            .prepare(&counting.sql)
            .await
            .map_err(classify_pg_error)?;
        let rows = client
            .query(&prepared, &param_refs(converted))
            .await
            .map_err(classify_pg_error)?;
        match rows.first() {
            Some(row) => Ok(row.try_get::<_, i64>(0)?),
            None => Ok(0),
        }
    }

    async fn run_explain(
        &self,
        client: &Client,
        statement: &Statement,
        req: &QueryRequest,
    ) -> anyhow::Result<ResultPage> {
        let (sql, inner) = explain_sql(statement);
        let prepared = client.prepare(&sql).await.map_err(classify_pg_error)?;
        let converted = convert_params(&req.params, prepared.params())?;
        let rows = client
            .query(&prepared, &param_refs(&converted))
            .await
            .map_err(classify_pg_error)?;
        let plan = if statement.explain_analyze {
            // EXPLAIN ANALYZE runs verbatim and reports text lines.
            let mut lines = Vec::with_capacity(rows.len());
            for row in &rows {
                lines.push(row.try_get::<_, String>(0)?);
            }
            JsonValue::String(lines.join("\n"))
        } else {
            match rows.first() {
                Some(row) => decode_cell(row, 0)?,
                None => JsonValue::Null,
            }
        };
        Ok(ResultPage::Explain { plan, query: inner })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_query_request_defaults() {
        let req: QueryRequest = serde_json::from_value(json!({ "query": "SELECT 1" })).unwrap();
        assert_eq!(req.page, 1);
        assert_eq!(req.page_size, 100);
        assert!(req.use_cache);
        assert!(req.params.is_empty());
        assert!(req.filters.is_empty());
        assert!(req.sort.is_none());
        assert!(req.cache_ttl_seconds.is_none());
    }

    #[test]
    fn test_query_request_full_body() {
        let req: QueryRequest = serde_json::from_value(json!({
            "query": "SELECT * FROM t WHERE id = $1",
            "params": [7],
            "sort": { "column_idx": 0, "direction": "DESC" },
            "filters": [
                { "type": "integer", "index": 1, "column": "age", "operator": "gte", "value": 21 }
            ],
            "page": 2,
            "page_size": 50,
            "use_cache": false
        }))
        .unwrap();
        assert_eq!(req.page, 2);
        assert!(!req.use_cache);
        assert_eq!(req.filters.len(), 1);
    }

    #[test]
    fn test_shift_wrapper_position() {
        let statement = split_script("SELEKT 1").remove(0);
        // The server reports position 1 + the wrapper prefix length for an
        // error at the start of the user's text.
        let offset = WRAPPER_PREFIX.chars().count() as u32;
        let err: anyhow::Error =
            ErrorMetadata::pg("ERROR", "42601", "syntax error", Some(offset + 1)).into();
        let shifted = shift_wrapper_position(err, &statement);
        match &shifted.metadata().unwrap().code {
            ErrorCode::Pg { position, .. } => assert_eq!(*position, Some(1)),
            other => panic!("unexpected code {other:?}"),
        }

        // Positions inside the wrapper's own syntax don't map anywhere.
        let err: anyhow::Error = ErrorMetadata::pg("ERROR", "42601", "boom", Some(3)).into();
        let shifted = shift_wrapper_position(err, &statement);
        match &shifted.metadata().unwrap().code {
            ErrorCode::Pg { position, .. } => assert_eq!(*position, None),
            other => panic!("unexpected code {other:?}"),
        }

        // Non-PG errors pass through untouched.
        let err: anyhow::Error = ErrorMetadata::canceled().into();
        assert!(shift_wrapper_position(err, &statement).is_canceled());
    }
}
