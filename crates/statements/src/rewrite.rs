//! Wraps a user `select` for paginated display: one round-trip that returns
//! the page rows plus the total row count, with ordering and filtering
//! applied to the wrapper rather than injected into the user's text.

use std::fmt::Write as _;

use errors::ErrorMetadata;
use postgres_protocol::escape::escape_identifier;
use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use crate::script::{
    Statement,
    StatementKind,
};

/// Sentinel `page_size` requesting every row (downloads).
pub const PAGE_SIZE_ALL: i64 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    #[serde(rename = "ASC")]
    Asc,
    #[serde(rename = "DESC")]
    Desc,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub column_idx: usize,
    pub direction: SortDirection,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Boolean,
    Integer,
    Numeric,
    Text,
    Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    Like,
    NotLike,
    Null,
    NotNull,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// One column filter from the results grid. `type` drives the coercion
/// applied to `value`; `null`/`not_null` ignore `value` entirely.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(rename = "type")]
    pub filter_type: FilterType,
    pub index: u32,
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: JsonValue,
}

/// A filter value ready to bind. Everything the driver can't bind natively
/// travels as text and is cast server-side.
#[derive(Clone, Debug, PartialEq)]
pub enum FilterBind {
    Bool(bool),
    Int(i64),
    Text(String),
}

/// The rewritten statement plus the values to bind after the user's own
/// parameters, in placeholder order.
#[derive(Clone, Debug, PartialEq)]
pub struct RewrittenQuery {
    pub sql: String,
    pub binds: Vec<FilterBind>,
}

fn bad_filter(msg: String) -> anyhow::Error {
    ErrorMetadata::bad_request_field("InvalidFilter", msg, "filters").into()
}

impl Filter {
    /// Coerces `value` per the declared type. `like` patterns are wrapped in
    /// `%...%` after coercion to text.
    fn bind(&self) -> anyhow::Result<Option<FilterBind>> {
        if matches!(self.operator, FilterOperator::Null | FilterOperator::NotNull) {
            return Ok(None);
        }
        let text_of = |v: &JsonValue| -> anyhow::Result<String> {
            match v {
                JsonValue::String(s) => Ok(s.clone()),
                JsonValue::Number(n) => Ok(n.to_string()),
                JsonValue::Bool(b) => Ok(b.to_string()),
                _ => Err(bad_filter(format!(
                    "filter on {} needs a scalar value, got {v}",
                    self.column
                ))),
            }
        };
        let bind = match self.filter_type {
            FilterType::Boolean => match &self.value {
                JsonValue::Bool(b) => FilterBind::Bool(*b),
                JsonValue::String(s) if s.eq_ignore_ascii_case("true") => FilterBind::Bool(true),
                JsonValue::String(s) if s.eq_ignore_ascii_case("false") => FilterBind::Bool(false),
                v => {
                    return Err(bad_filter(format!(
                        "filter on {} needs a boolean, got {v}",
                        self.column
                    )))
                },
            },
            FilterType::Integer => match &self.value {
                JsonValue::Number(n) if n.as_i64().is_some() => {
                    FilterBind::Int(n.as_i64().expect("checked"))
                },
                JsonValue::String(s) => FilterBind::Int(s.trim().parse().map_err(|_| {
                    bad_filter(format!("filter on {} needs an integer, got {s:?}", self.column))
                })?),
                v => {
                    return Err(bad_filter(format!(
                        "filter on {} needs an integer, got {v}",
                        self.column
                    )))
                },
            },
            FilterType::Numeric | FilterType::Timestamp => FilterBind::Text(text_of(&self.value)?),
            FilterType::Text => {
                let text = text_of(&self.value)?;
                match self.operator {
                    FilterOperator::Like | FilterOperator::NotLike => {
                        FilterBind::Text(format!("%{text}%"))
                    },
                    _ => FilterBind::Text(text),
                }
            },
        };
        Ok(Some(bind))
    }

    /// The parameter cast that fixes the placeholder's type server-side.
    fn cast(&self) -> &'static str {
        match self.filter_type {
            FilterType::Boolean => "::boolean",
            FilterType::Integer => "::int8",
            FilterType::Numeric => "::numeric",
            FilterType::Timestamp => "::timestamptz",
            FilterType::Text => "::text",
        }
    }

    fn render(&self, placeholder: Option<u32>) -> String {
        let column = escape_identifier(&self.column);
        match self.operator {
            FilterOperator::Null => format!("{column} IS NULL"),
            FilterOperator::NotNull => format!("{column} IS NOT NULL"),
            op => {
                let ordinal = placeholder.expect("binding operators get a placeholder");
                let sql_op = match op {
                    FilterOperator::Eq => "=",
                    FilterOperator::Neq => "<>",
                    FilterOperator::Like => "LIKE",
                    FilterOperator::NotLike => "NOT LIKE",
                    FilterOperator::Gt => ">",
                    FilterOperator::Gte => ">=",
                    FilterOperator::Lt => "<",
                    FilterOperator::Lte => "<=",
                    FilterOperator::Null | FilterOperator::NotNull => unreachable!(),
                };
                format!("{column} {sql_op} ${ordinal}{}", self.cast())
            },
        }
    }
}

/// Builds the pageable wrapper around a `select` statement. Non-`select`
/// statements come back unchanged with no binds; the caller executes them
/// as written.
///
/// The wrapper projects `__total` (the filtered row count) ahead of the
/// user's columns, so sort ordinals shift by two: user column `i` is output
/// column `i + 2` in ORDER BY terms. Filter placeholders continue numbering
/// after the statement's own highest `$N`.
pub fn paginate(
    statement: &Statement,
    page: u64,
    page_size: i64,
    sort: Option<&Sort>,
    filters: &[Filter],
) -> anyhow::Result<RewrittenQuery> {
    if statement.kind != StatementKind::Select {
        return Ok(RewrittenQuery {
            sql: statement.text.clone(),
            binds: Vec::new(),
        });
    }
    if page < 1 {
        anyhow::bail!(ErrorMetadata::bad_request_field(
            "InvalidPage",
            "page must be >= 1",
            "page",
        ));
    }
    if page_size < 1 && page_size != PAGE_SIZE_ALL {
        anyhow::bail!(ErrorMetadata::bad_request_field(
            "InvalidPageSize",
            "page_size must be >= 1, or -1 for all rows",
            "page_size",
        ));
    }

    let mut next_ordinal = statement.max_param_ordinal() + 1;
    let mut predicates = Vec::with_capacity(filters.len());
    let mut binds = Vec::with_capacity(filters.len());
    for filter in filters {
        match filter.bind()? {
            Some(bind) => {
                predicates.push(filter.render(Some(next_ordinal)));
                binds.push(bind);
                next_ordinal += 1;
            },
            None => predicates.push(filter.render(None)),
        }
    }
    let where_clause = if predicates.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", predicates.join(" AND "))
    };

    let mut sql = format!(
        "WITH __base AS (\n{}\n)\nSELECT (SELECT count(*) FROM __base{where_clause}) AS __total, \
         __base.*\nFROM __base{where_clause}",
        statement.text,
    );
    if let Some(sort) = sort {
        let direction = match sort.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        write!(sql, "\nORDER BY {} {direction}", sort.column_idx + 2).expect("write to string");
    }
    if page_size != PAGE_SIZE_ALL {
        let offset = (page - 1).saturating_mul(page_size as u64);
        write!(sql, "\nLIMIT {page_size} OFFSET {offset}").expect("write to string");
    }
    Ok(RewrittenQuery { sql, binds })
}

/// Produces the SQL to run for an `explain` statement and the inner query
/// text reported back to the client. Plain `EXPLAIN` is rewritten to ask for
/// a JSON plan without executing; `EXPLAIN ANALYZE` in any spelling runs
/// verbatim, exactly as the user wrote it.
pub fn explain_sql(statement: &Statement) -> (String, String) {
    let inner = statement
        .inner_text
        .clone()
        .unwrap_or_else(|| statement.text.clone());
    if statement.explain_analyze {
        (statement.text.clone(), inner)
    } else {
        (format!("EXPLAIN (FORMAT JSON, ANALYZE false) {inner}"), inner)
    }
}

/// Wraps a bare `select` the client asked to explain.
pub fn explain_select_sql(statement: &Statement) -> (String, String) {
    (
        format!("EXPLAIN (FORMAT JSON, ANALYZE false) {}", statement.text),
        statement.text.clone(),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::split_script;

    fn statement(sql: &str) -> Statement {
        split_script(sql).remove(0)
    }

    #[test]
    fn test_non_select_passes_through() {
        let s = statement("UPDATE t SET a = 1");
        let q = paginate(&s, 1, 10, None, &[]).unwrap();
        assert_eq!(q.sql, "UPDATE t SET a = 1");
        assert!(q.binds.is_empty());
    }

    #[test]
    fn test_basic_page_wrapper() {
        let s = statement("SELECT n FROM generate_series(1,7) n;");
        let q = paginate(&s, 2, 3, None, &[]).unwrap();
        assert_eq!(
            q.sql,
            "WITH __base AS (\nSELECT n FROM generate_series(1,7) n\n)\n\
             SELECT (SELECT count(*) FROM __base) AS __total, __base.*\n\
             FROM __base\nLIMIT 3 OFFSET 3"
        );
    }

    #[test]
    fn test_sort_ordinal_shifts_past_total() {
        let s = statement("SELECT a, b FROM t");
        let q = paginate(
            &s,
            1,
            10,
            Some(&Sort {
                column_idx: 0,
                direction: SortDirection::Desc,
            }),
            &[],
        )
        .unwrap();
        assert!(q.sql.contains("ORDER BY 2 DESC"));
    }

    #[test]
    fn test_download_all_omits_limit() {
        let s = statement("SELECT 1");
        let q = paginate(&s, 1, PAGE_SIZE_ALL, None, &[]).unwrap();
        assert!(!q.sql.contains("LIMIT"));
        assert!(!q.sql.contains("OFFSET"));
    }

    #[test]
    fn test_filters_number_after_user_params() {
        let s = statement("SELECT * FROM t WHERE id > $1 AND org = $2");
        let filters = vec![
            Filter {
                filter_type: FilterType::Text,
                index: 0,
                column: "name".to_string(),
                operator: FilterOperator::Like,
                value: json!("bob"),
            },
            Filter {
                filter_type: FilterType::Integer,
                index: 1,
                column: "age".to_string(),
                operator: FilterOperator::Gte,
                value: json!(21),
            },
            Filter {
                filter_type: FilterType::Text,
                index: 2,
                column: "deleted_at".to_string(),
                operator: FilterOperator::Null,
                value: JsonValue::Null,
            },
        ];
        let q = paginate(&s, 1, 10, None, &filters).unwrap();
        assert!(q.sql.contains(
            r#"WHERE "name" LIKE $3::text AND "age" >= $4::int8 AND "deleted_at" IS NULL"#
        ));
        // The count subquery sees the same predicates.
        assert_eq!(q.sql.matches("LIKE $3::text").count(), 2);
        assert_eq!(
            q.binds,
            vec![FilterBind::Text("%bob%".to_string()), FilterBind::Int(21)]
        );
    }

    #[test]
    fn test_filter_coercions() {
        let mk = |ty, op, value| Filter {
            filter_type: ty,
            index: 0,
            column: "c".to_string(),
            operator: op,
            value,
        };
        assert_eq!(
            mk(FilterType::Boolean, FilterOperator::Eq, json!("TRUE")).bind().unwrap(),
            Some(FilterBind::Bool(true))
        );
        assert_eq!(
            mk(FilterType::Integer, FilterOperator::Eq, json!("42")).bind().unwrap(),
            Some(FilterBind::Int(42))
        );
        assert_eq!(
            mk(FilterType::Numeric, FilterOperator::Lt, json!(1.5)).bind().unwrap(),
            Some(FilterBind::Text("1.5".to_string()))
        );
        assert_eq!(
            mk(FilterType::Timestamp, FilterOperator::Gt, json!("2024-01-01")).bind().unwrap(),
            Some(FilterBind::Text("2024-01-01".to_string()))
        );
        assert!(mk(FilterType::Integer, FilterOperator::Eq, json!("nope")).bind().is_err());
        assert!(mk(FilterType::Boolean, FilterOperator::Eq, json!(3)).bind().is_err());
    }

    #[test]
    fn test_filter_column_is_escaped() {
        let s = statement("SELECT 1");
        let filters = vec![Filter {
            filter_type: FilterType::Text,
            index: 0,
            column: "evil\"; DROP TABLE t; --".to_string(),
            operator: FilterOperator::Eq,
            value: json!("x"),
        }];
        let q = paginate(&s, 1, 10, None, &filters).unwrap();
        assert!(q.sql.contains(r#""evil""; DROP TABLE t; --""#));
    }

    #[test]
    fn test_page_validation() {
        let s = statement("SELECT 1");
        assert!(paginate(&s, 0, 10, None, &[]).is_err());
        assert!(paginate(&s, 1, 0, None, &[]).is_err());
        assert!(paginate(&s, 1, -2, None, &[]).is_err());
    }

    #[test]
    fn test_explain_sql_wraps_plain_explain() {
        let s = statement("EXPLAIN SELECT * FROM t");
        let (sql, inner) = explain_sql(&s);
        assert_eq!(sql, "EXPLAIN (FORMAT JSON, ANALYZE false) SELECT * FROM t");
        assert_eq!(inner, "SELECT * FROM t");
    }

    #[test]
    fn test_explain_analyze_verbatim() {
        let s = statement("EXPLAIN ANALYZE SELECT * FROM t");
        let (sql, inner) = explain_sql(&s);
        assert_eq!(sql, "EXPLAIN ANALYZE SELECT * FROM t");
        assert_eq!(inner, "SELECT * FROM t");

        let s = statement("explain (analyze, buffers) update t set a = 1");
        let (sql, _) = explain_sql(&s);
        assert_eq!(sql, "explain (analyze, buffers) update t set a = 1");
    }
}
