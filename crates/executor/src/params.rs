//! JSON-to-driver parameter conversion.
//!
//! Types the driver binds natively get native encodings; everything else is
//! bound in text format so the server performs the coercion, which is how
//! parameters behave in a plain psql session.

use std::error::Error;

use bytes::BytesMut;
use errors::ErrorMetadata;
use serde_json::Value as JsonValue;
use statements::FilterBind;
use tokio_postgres::types::{
    to_sql_checked,
    Format,
    IsNull,
    ToSql,
    Type,
};

#[derive(Clone, Debug)]
pub enum Param {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    /// Bound in text format; the server parses it into the declared type.
    Coerced(String),
}

impl ToSql for Param {
    to_sql_checked!();

    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Send + Sync + 'static>> {
        match self {
            Param::Null => Ok(IsNull::Yes),
            Param::Bool(v) => v.to_sql(ty, out),
            Param::Int2(v) => v.to_sql(ty, out),
            Param::Int4(v) => v.to_sql(ty, out),
            Param::Int8(v) => v.to_sql(ty, out),
            Param::Float4(v) => v.to_sql(ty, out),
            Param::Float8(v) => v.to_sql(ty, out),
            Param::Text(v) => v.to_sql(ty, out),
            Param::Coerced(v) => {
                out.extend_from_slice(v.as_bytes());
                Ok(IsNull::No)
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        match self {
            Param::Coerced(_) => Format::Text,
            _ => Format::Binary,
        }
    }
}

impl From<FilterBind> for Param {
    fn from(bind: FilterBind) -> Self {
        match bind {
            FilterBind::Bool(b) => Param::Bool(b),
            FilterBind::Int(i) => Param::Int8(i),
            // Filter SQL carries explicit casts, so text format is safe.
            FilterBind::Text(s) => Param::Coerced(s),
        }
    }
}

fn bad_param(ordinal: usize, expected: &Type, got: &JsonValue) -> anyhow::Error {
    ErrorMetadata::bad_request_field(
        "InvalidParam",
        format!("parameter ${} expects {expected}, got {got}", ordinal + 1),
        "params",
    )
    .into()
}

/// Renders a JSON scalar the way its SQL text form reads.
fn text_of(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Converts the JSON value supplied for parameter `ordinal` (0-based) into a
/// driver value of the probed type.
pub fn json_to_param(ordinal: usize, value: &JsonValue, ty: &Type) -> anyhow::Result<Param> {
    if value.is_null() {
        return Ok(Param::Null);
    }
    let param = match *ty {
        Type::BOOL => match value {
            JsonValue::Bool(b) => Param::Bool(*b),
            JsonValue::String(s) if s.eq_ignore_ascii_case("true") => Param::Bool(true),
            JsonValue::String(s) if s.eq_ignore_ascii_case("false") => Param::Bool(false),
            v => return Err(bad_param(ordinal, ty, v)),
        },
        Type::INT2 => Param::Int2(integer_of(value).ok_or_else(|| bad_param(ordinal, ty, value))?),
        Type::INT4 => Param::Int4(integer_of(value).ok_or_else(|| bad_param(ordinal, ty, value))?),
        Type::INT8 => Param::Int8(integer_of(value).ok_or_else(|| bad_param(ordinal, ty, value))?),
        Type::FLOAT4 => {
            Param::Float4(float_of(value).ok_or_else(|| bad_param(ordinal, ty, value))? as f32)
        },
        Type::FLOAT8 => {
            Param::Float8(float_of(value).ok_or_else(|| bad_param(ordinal, ty, value))?)
        },
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            Param::Text(text_of(value))
        },
        // numeric, timestamps, uuid, json, arrays, enums, domains: let the
        // server parse the text rendering.
        _ => Param::Coerced(text_of(value)),
    };
    Ok(param)
}

fn integer_of<T: TryFrom<i64>>(value: &JsonValue) -> Option<T> {
    let i = match value {
        JsonValue::Number(n) => n.as_i64()?,
        JsonValue::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    T::try_from(i).ok()
}

fn float_of(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Converts a request's parameter values against the probed parameter types.
/// `types` covers the statement's own placeholders; the caller appends
/// filter binds separately.
pub fn convert_params(values: &[JsonValue], types: &[Type]) -> anyhow::Result<Vec<Param>> {
    if values.len() < types.len() {
        anyhow::bail!(ErrorMetadata::bad_request_field(
            "MissingParams",
            format!("statement needs {} parameter(s), got {}", types.len(), values.len()),
            "params",
        ));
    }
    values
        .iter()
        .zip(types)
        .enumerate()
        .map(|(i, (value, ty))| json_to_param(i, value, ty))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_native_conversions() {
        assert!(matches!(
            json_to_param(0, &json!(true), &Type::BOOL).unwrap(),
            Param::Bool(true)
        ));
        assert!(matches!(
            json_to_param(0, &json!(7), &Type::INT8).unwrap(),
            Param::Int8(7)
        ));
        assert!(matches!(
            json_to_param(0, &json!("42"), &Type::INT4).unwrap(),
            Param::Int4(42)
        ));
        assert!(matches!(
            json_to_param(0, &json!(1.5), &Type::FLOAT8).unwrap(),
            Param::Float8(_)
        ));
        assert!(matches!(
            json_to_param(0, &json!("x"), &Type::TEXT).unwrap(),
            Param::Text(_)
        ));
        assert!(matches!(
            json_to_param(0, &JsonValue::Null, &Type::INT8).unwrap(),
            Param::Null
        ));
    }

    #[test]
    fn test_unknown_types_coerce_from_text() {
        let p = json_to_param(0, &json!("12.34"), &Type::NUMERIC).unwrap();
        match &p {
            Param::Coerced(s) => assert_eq!(s, "12.34"),
            other => panic!("expected coerced param, got {other:?}"),
        }
        assert!(matches!(p.encode_format(&Type::NUMERIC), Format::Text));

        let p = json_to_param(0, &json!({"a": 1}), &Type::JSONB).unwrap();
        match p {
            Param::Coerced(s) => assert_eq!(s, r#"{"a":1}"#),
            other => panic!("expected coerced param, got {other:?}"),
        }
    }

    #[test]
    fn test_type_mismatch_is_bad_request() {
        let err = json_to_param(2, &json!("nope"), &Type::INT8).unwrap_err();
        assert_eq!(errors::ErrorMetadataAnyhowExt::short_msg(&err), "InvalidParam");
        assert!(err.to_string().contains("$3"));
    }

    #[test]
    fn test_convert_params_arity() {
        let err = convert_params(&[json!(1)], &[Type::INT8, Type::TEXT]).unwrap_err();
        assert_eq!(errors::ErrorMetadataAnyhowExt::short_msg(&err), "MissingParams");
        // Extra values beyond the statement's placeholders are ignored.
        let params = convert_params(&[json!(1), json!("x"), json!(2)], &[Type::INT8, Type::TEXT])
            .unwrap();
        assert_eq!(params.len(), 2);
    }
}
