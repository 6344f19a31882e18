//! Catalog browsing endpoints: predefined queries dispatched through the
//! same routed, pooled sessions as user queries.

use axum::extract::{
    Path,
    State,
};
use errors::ErrorMetadata;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::{
    http::{
        ExtractConnection,
        ExtractDatabase,
        ExtractDatabaseOptional,
        HttpResponseError,
        Json,
    },
    AppState,
};

const DATABASES_SQL: &str = r"
SELECT datname
FROM pg_catalog.pg_database
WHERE NOT datistemplate AND datallowconn
ORDER BY datname";

const SCHEMAS_SQL: &str = r"
SELECT nspname
FROM pg_catalog.pg_namespace
WHERE nspname NOT IN ('pg_catalog', 'information_schema')
  AND nspname NOT LIKE 'pg\_toast%'
  AND nspname NOT LIKE 'pg\_temp%'
ORDER BY nspname";

const TABLES_SQL: &str = r"
SELECT table_name, table_type
FROM information_schema.tables
WHERE table_schema = $1
ORDER BY table_name";

const COLUMNS_SQL: &str = r"
SELECT column_name, data_type, is_nullable, column_default, ordinal_position
FROM information_schema.columns
WHERE table_schema = $1 AND table_name = $2
ORDER BY ordinal_position";

const VIEW_DDL_SQL: &str = r"
SELECT pg_get_viewdef(format('%I.%I', $1::text, $2::text)::regclass, true)";

const INDEX_DDL_SQL: &str = r"
SELECT pg_get_indexdef(format('%I.%I', $1::text, $2::text)::regclass)";

const FUNCTION_DDL_SQL: &str = r"
SELECT pg_get_functiondef(p.oid)
FROM pg_catalog.pg_proc p
JOIN pg_catalog.pg_namespace n ON n.oid = p.pronamespace
WHERE n.nspname = $1 AND p.proname = $2
LIMIT 1";

const TABLE_CONSTRAINTS_SQL: &str = r"
SELECT conname, pg_get_constraintdef(oid)
FROM pg_catalog.pg_constraint
WHERE conrelid = format('%I.%I', $1::text, $2::text)::regclass
ORDER BY conname";

fn cell_str(row: &[JsonValue], idx: usize) -> String {
    row.get(idx)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// `GET /db/databases`: routed on the connection's default database when no
/// `x-database` header is present.
pub async fn list_databases(
    State(st): State<AppState>,
    ExtractConnection(conn): ExtractConnection,
    ExtractDatabaseOptional(database): ExtractDatabaseOptional,
) -> Result<Json<Vec<String>>, HttpResponseError> {
    let database = match database {
        Some(db) => db,
        None => {
            st.config
                .get(&conn)
                .ok_or_else(|| {
                    ErrorMetadata::bad_request_field(
                        "UnknownConnection",
                        format!("no connection named {conn}"),
                        "x-conn-name",
                    )
                })?
                .database
        },
    };
    let rows = st
        .executor
        .catalog_query(&conn, &database, DATABASES_SQL, &[])
        .await?;
    Ok(Json(rows.iter().map(|r| cell_str(r, 0)).collect()))
}

pub async fn list_schemas(
    State(st): State<AppState>,
    ExtractConnection(conn): ExtractConnection,
    ExtractDatabase(database): ExtractDatabase,
) -> Result<Json<Vec<String>>, HttpResponseError> {
    let rows = st
        .executor
        .catalog_query(&conn, &database, SCHEMAS_SQL, &[])
        .await?;
    Ok(Json(rows.iter().map(|r| cell_str(r, 0)).collect()))
}

#[derive(Serialize)]
pub struct TableInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub table_type: String,
}

pub async fn list_tables(
    State(st): State<AppState>,
    ExtractConnection(conn): ExtractConnection,
    ExtractDatabase(database): ExtractDatabase,
    Path(schema): Path<String>,
) -> Result<Json<Vec<TableInfo>>, HttpResponseError> {
    let rows = st
        .executor
        .catalog_query(&conn, &database, TABLES_SQL, &[schema.as_str()])
        .await?;
    Ok(Json(
        rows.iter()
            .map(|r| TableInfo {
                name: cell_str(r, 0),
                table_type: cell_str(r, 1),
            })
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    pub ordinal: i64,
}

pub async fn list_columns(
    State(st): State<AppState>,
    ExtractConnection(conn): ExtractConnection,
    ExtractDatabase(database): ExtractDatabase,
    Path((schema, table)): Path<(String, String)>,
) -> Result<Json<Vec<ColumnInfo>>, HttpResponseError> {
    let rows = st
        .executor
        .catalog_query(&conn, &database, COLUMNS_SQL, &[schema.as_str(), table.as_str()])
        .await?;
    Ok(Json(
        rows.iter()
            .map(|r| ColumnInfo {
                name: cell_str(r, 0),
                data_type: cell_str(r, 1),
                nullable: cell_str(r, 2) == "YES",
                default: r.get(3).and_then(|v| v.as_str()).map(String::from),
                ordinal: r.get(4).and_then(|v| v.as_i64()).unwrap_or_default(),
            })
            .collect(),
    ))
}

#[derive(Serialize)]
pub struct DdlResponse {
    pub ddl: String,
}

/// `GET /db/ddl/schemas/{schema}/{kind}/{name}` for kinds `table`, `view`,
/// `index`, and `function`. Views, indexes, and functions come straight from
/// the server's deparser; tables are reassembled from the catalog.
pub async fn ddl(
    State(st): State<AppState>,
    ExtractConnection(conn): ExtractConnection,
    ExtractDatabase(database): ExtractDatabase,
    Path((schema, kind, name)): Path<(String, String, String)>,
) -> Result<Json<DdlResponse>, HttpResponseError> {
    let ddl = match kind.as_str() {
        "view" => first_cell(
            st.executor
                .catalog_query(&conn, &database, VIEW_DDL_SQL, &[schema.as_str(), name.as_str()])
                .await?,
        )
        .map(|body| format!("CREATE OR REPLACE VIEW {schema}.{name} AS\n{body}")),
        "index" => first_cell(
            st.executor
                .catalog_query(&conn, &database, INDEX_DDL_SQL, &[schema.as_str(), name.as_str()])
                .await?,
        ),
        "function" => first_cell(
            st.executor
                .catalog_query(
                    &conn,
                    &database,
                    FUNCTION_DDL_SQL,
                    &[schema.as_str(), name.as_str()],
                )
                .await?,
        ),
        "table" => Some(table_ddl(&st, &conn, &database, &schema, &name).await?),
        other => {
            return Err(ErrorMetadata::bad_request(
                "UnknownDdlKind",
                format!("no DDL renderer for {other}; expected table, view, index, or function"),
            )
            .into())
        },
    };
    let ddl = ddl.ok_or_else(|| {
        ErrorMetadata::bad_request("NotFound", format!("{kind} {schema}.{name} doesn't exist"))
    })?;
    Ok(Json(DdlResponse { ddl }))
}

fn first_cell(rows: Vec<Vec<JsonValue>>) -> Option<String> {
    rows.first().map(|r| cell_str(r, 0))
}

async fn table_ddl(
    st: &AppState,
    conn: &str,
    database: &str,
    schema: &str,
    table: &str,
) -> anyhow::Result<String> {
    let columns = st
        .executor
        .catalog_query(conn, database, COLUMNS_SQL, &[schema, table])
        .await?;
    if columns.is_empty() {
        anyhow::bail!(ErrorMetadata::bad_request(
            "NotFound",
            format!("table {schema}.{table} doesn't exist"),
        ));
    }
    let mut lines: Vec<String> = columns
        .iter()
        .map(|r| {
            let mut line = format!("    {} {}", cell_str(r, 0), cell_str(r, 1));
            if let Some(default) = r.get(3).and_then(|v| v.as_str()) {
                line.push_str(&format!(" DEFAULT {default}"));
            }
            if cell_str(r, 2) == "NO" {
                line.push_str(" NOT NULL");
            }
            line
        })
        .collect();
    let constraints = st
        .executor
        .catalog_query(conn, database, TABLE_CONSTRAINTS_SQL, &[schema, table])
        .await?;
    for row in &constraints {
        lines.push(format!(
            "    CONSTRAINT {} {}",
            cell_str(row, 0),
            cell_str(row, 1)
        ));
    }
    Ok(format!(
        "CREATE TABLE {schema}.{table} (\n{}\n);",
        lines.join(",\n")
    ))
}
