//! Decodes driver rows into the JSON cell model: booleans and numbers stay
//! scalars, timestamps become ISO-8601 strings, json/jsonb nest, binary is
//! base64, and types without a native decoding are re-fetched through a text
//! cast by the executor (see `is_native`).

use chrono::{
    DateTime,
    NaiveDate,
    NaiveDateTime,
    NaiveTime,
    Utc,
};
use serde_json::Value as JsonValue;
use tokio_postgres::{
    types::Type,
    Column,
    Row,
};

use crate::results::ResultColumn;

/// Builds the column descriptors for a result, carrying the driver's
/// provenance hooks for the annotator.
pub fn columns_meta(columns: &[Column]) -> Vec<ResultColumn> {
    columns
        .iter()
        .enumerate()
        .map(|(ordinal, col)| ResultColumn {
            name: col.name().to_string(),
            type_name: col.type_().name().to_string(),
            ordinal,
            table_oid: col.table_oid(),
            column_id: col.column_id(),
            ..Default::default()
        })
        .collect()
}

/// Whether the driver can hand us this type without a server-side text cast.
pub fn is_native(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::OID
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::TEXT
            | Type::VARCHAR
            | Type::BPCHAR
            | Type::NAME
            | Type::UNKNOWN
            | Type::JSON
            | Type::JSONB
            | Type::UUID
            | Type::BYTEA
            | Type::DATE
            | Type::TIME
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
            | Type::BOOL_ARRAY
            | Type::INT2_ARRAY
            | Type::INT4_ARRAY
            | Type::INT8_ARRAY
            | Type::FLOAT4_ARRAY
            | Type::FLOAT8_ARRAY
            | Type::TEXT_ARRAY
            | Type::VARCHAR_ARRAY
            | Type::UUID_ARRAY
            | Type::JSON_ARRAY
            | Type::JSONB_ARRAY
    )
}

fn float_value(f: f64) -> JsonValue {
    match serde_json::Number::from_f64(f) {
        Some(n) => JsonValue::Number(n),
        // NaN and infinities have no JSON spelling.
        None => JsonValue::String(f.to_string()),
    }
}

fn array_value<T, F>(cells: Option<Vec<Option<T>>>, f: F) -> JsonValue
where
    F: Fn(T) -> JsonValue,
{
    match cells {
        Some(cells) => JsonValue::Array(
            cells
                .into_iter()
                .map(|c| c.map(&f).unwrap_or(JsonValue::Null))
                .collect(),
        ),
        None => JsonValue::Null,
    }
}

fn scalar<T: Into<JsonValue>>(v: Option<T>) -> JsonValue {
    v.map(Into::into).unwrap_or(JsonValue::Null)
}

/// Decodes one cell. The column's declared type picks the decoding; callers
/// guarantee `is_native` holds (exotic columns were cast to text upstream).
pub fn decode_cell(row: &Row, idx: usize) -> anyhow::Result<JsonValue> {
    let ty = row.columns()[idx].type_().clone();
    let value = match ty {
        Type::BOOL => scalar(row.try_get::<_, Option<bool>>(idx)?),
        Type::INT2 => scalar(row.try_get::<_, Option<i16>>(idx)?),
        Type::INT4 => scalar(row.try_get::<_, Option<i32>>(idx)?),
        Type::INT8 => scalar(row.try_get::<_, Option<i64>>(idx)?),
        Type::OID => scalar(row.try_get::<_, Option<u32>>(idx)?),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)?
            .map(|f| float_value(f as f64))
            .unwrap_or(JsonValue::Null),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(idx)?
            .map(float_value)
            .unwrap_or(JsonValue::Null),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            scalar(row.try_get::<_, Option<String>>(idx)?)
        },
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<JsonValue>>(idx)?
            .unwrap_or(JsonValue::Null),
        Type::UUID => scalar(
            row.try_get::<_, Option<uuid::Uuid>>(idx)?
                .map(|u| u.to_string()),
        ),
        Type::BYTEA => scalar(
            row.try_get::<_, Option<Vec<u8>>>(idx)?
                .map(|b| base64::encode(&b)),
        ),
        Type::DATE => scalar(
            row.try_get::<_, Option<NaiveDate>>(idx)?
                .map(|d| d.to_string()),
        ),
        Type::TIME => scalar(
            row.try_get::<_, Option<NaiveTime>>(idx)?
                .map(|t| t.to_string()),
        ),
        Type::TIMESTAMP => scalar(
            row.try_get::<_, Option<NaiveDateTime>>(idx)?
                .map(|ts| ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        ),
        Type::TIMESTAMPTZ => scalar(
            row.try_get::<_, Option<DateTime<Utc>>>(idx)?
                .map(|ts| ts.to_rfc3339()),
        ),
        Type::BOOL_ARRAY => array_value(row.try_get(idx)?, JsonValue::Bool),
        Type::INT2_ARRAY => array_value(row.try_get::<_, Option<Vec<Option<i16>>>>(idx)?, |v| {
            JsonValue::from(v)
        }),
        Type::INT4_ARRAY => array_value(row.try_get::<_, Option<Vec<Option<i32>>>>(idx)?, |v| {
            JsonValue::from(v)
        }),
        Type::INT8_ARRAY => array_value(row.try_get::<_, Option<Vec<Option<i64>>>>(idx)?, |v| {
            JsonValue::from(v)
        }),
        Type::FLOAT4_ARRAY => {
            array_value(row.try_get::<_, Option<Vec<Option<f32>>>>(idx)?, |v| {
                float_value(v as f64)
            })
        },
        Type::FLOAT8_ARRAY => {
            array_value(row.try_get::<_, Option<Vec<Option<f64>>>>(idx)?, float_value)
        },
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            array_value(row.try_get::<_, Option<Vec<Option<String>>>>(idx)?, JsonValue::String)
        },
        Type::UUID_ARRAY => {
            array_value(row.try_get::<_, Option<Vec<Option<uuid::Uuid>>>>(idx)?, |u| {
                JsonValue::String(u.to_string())
            })
        },
        Type::JSON_ARRAY | Type::JSONB_ARRAY => {
            array_value(row.try_get::<_, Option<Vec<Option<JsonValue>>>>(idx)?, |v| v)
        },
        // Exotic columns are cast to text before execution; reaching here
        // means the cast was skipped, so fall back to a lossy rendering.
        other => {
            tracing::warn!("no native decoding for {other}, returning null");
            JsonValue::Null
        },
    };
    Ok(value)
}

/// Decodes the rows of a result, skipping `skip_columns` leading columns
/// (the pagination wrapper's `__total` projection).
pub fn decode_rows(rows: &[Row], skip_columns: usize) -> anyhow::Result<Vec<Vec<JsonValue>>> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut cells = Vec::with_capacity(row.len().saturating_sub(skip_columns));
        for idx in skip_columns..row.len() {
            cells.push(decode_cell(row, idx)?);
        }
        out.push(cells);
    }
    Ok(out)
}
