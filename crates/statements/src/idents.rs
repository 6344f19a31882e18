//! Best-effort extraction of CTE names, referenced tables, and aliases from
//! a statement's token stream. Editor completion consumes these; the cache
//! uses referenced tables for targeted invalidation. Precision matters more
//! than recall here, so the walk is a keyword-driven scan, not a parse.

use serde::Serialize;

use crate::lexer::{
    Token,
    TokenKind,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TableRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Words that terminate a FROM-list item and therefore can't be aliases.
const ALIAS_STOP_WORDS: &[&str] = &[
    "on", "using", "where", "group", "order", "limit", "offset", "having", "window", "union",
    "except", "intersect", "join", "inner", "left", "right", "full", "cross", "natural", "set",
    "values", "returning", "select", "for", "with", "as", "tablesample", "fetch", "into",
];

fn ident_text(script: &str, token: &Token) -> Option<String> {
    match token.kind {
        TokenKind::Word => Some(token.text(script).to_string()),
        TokenKind::QuotedIdent => {
            let text = token.text(script);
            let body = text
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .unwrap_or(text);
            Some(body.replace("\"\"", "\""))
        },
        _ => None,
    }
}

fn is_stop_word(script: &str, token: &Token) -> bool {
    token.kind == TokenKind::Word
        && ALIAS_STOP_WORDS.contains(&token.text(script).to_ascii_lowercase().as_str())
}

/// Skips a balanced paren group starting at `i` (which must point at `(`).
/// Returns the index one past the closing paren.
fn skip_parens(tokens: &[Token], mut i: usize) -> usize {
    let mut depth = 0usize;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Symbol(b'(') => depth += 1,
            TokenKind::Symbol(b')') => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return i + 1;
                }
            },
            _ => {},
        }
        i += 1;
    }
    i
}

/// Parses one FROM-list item at `i`: a possibly-qualified name, an optional
/// call-argument group, an optional alias. Returns the next index.
fn parse_table_item(
    script: &str,
    tokens: &[Token],
    mut i: usize,
    out: &mut Vec<TableRef>,
) -> usize {
    while let Some(t) = tokens.get(i) {
        if t.is_word(script, "only") || t.is_word(script, "lateral") {
            i += 1;
        } else {
            break;
        }
    }
    let Some(first) = tokens.get(i) else {
        return i;
    };
    // A parenthesized item is a subquery; its tables surface from the outer
    // scan of the same token stream.
    if first.kind == TokenKind::Symbol(b'(') {
        return i + 1;
    }
    if is_stop_word(script, first) {
        return i;
    }
    let Some(mut name) = ident_text(script, first) else {
        return i;
    };
    i += 1;
    let mut parts = vec![name];
    while tokens.get(i).map(|t| t.kind) == Some(TokenKind::Symbol(b'.')) {
        match tokens.get(i + 1).and_then(|t| ident_text(script, t)) {
            Some(part) => {
                parts.push(part);
                i += 2;
            },
            None => break,
        }
    }
    let schema = if parts.len() > 1 {
        name = parts.pop().expect("len > 1");
        Some(parts.pop().expect("len >= 1"))
    } else {
        name = parts.pop().expect("len == 1");
        None
    };
    // Set-returning function in FROM position: keep the name, skip the args.
    if tokens.get(i).map(|t| t.kind) == Some(TokenKind::Symbol(b'(')) {
        i = skip_parens(tokens, i);
    }
    let mut alias = None;
    if let Some(t) = tokens.get(i) {
        if t.is_word(script, "as") {
            alias = tokens.get(i + 1).and_then(|t| ident_text(script, t));
            if alias.is_some() {
                i += 2;
            }
        } else if !is_stop_word(script, t) {
            if let Some(a) = ident_text(script, t) {
                alias = Some(a);
                i += 1;
            }
        }
    }
    out.push(TableRef {
        schema,
        name,
        alias,
    });
    // Comma-separated FROM list.
    if tokens.get(i).map(|t| t.kind) == Some(TokenKind::Symbol(b',')) {
        return parse_table_item(script, tokens, i + 1, out);
    }
    i
}

/// Walks `WITH [RECURSIVE] name [(cols)] AS [MATERIALIZED] ( ... ), ...`
/// collecting the CTE names.
fn parse_ctes(script: &str, tokens: &[Token]) -> Vec<String> {
    let mut ctes = Vec::new();
    if !tokens.first().is_some_and(|t| t.is_word(script, "with")) {
        return ctes;
    }
    let mut i = 1;
    if tokens.get(i).is_some_and(|t| t.is_word(script, "recursive")) {
        i += 1;
    }
    loop {
        let Some(name) = tokens.get(i).and_then(|t| ident_text(script, t)) else {
            break;
        };
        i += 1;
        if tokens.get(i).map(|t| t.kind) == Some(TokenKind::Symbol(b'(')) {
            i = skip_parens(tokens, i);
        }
        if !tokens.get(i).is_some_and(|t| t.is_word(script, "as")) {
            break;
        }
        i += 1;
        while tokens
            .get(i)
            .is_some_and(|t| t.is_word(script, "not") || t.is_word(script, "materialized"))
        {
            i += 1;
        }
        if tokens.get(i).map(|t| t.kind) != Some(TokenKind::Symbol(b'(')) {
            break;
        }
        ctes.push(name);
        i = skip_parens(tokens, i);
        if tokens.get(i).map(|t| t.kind) == Some(TokenKind::Symbol(b',')) {
            i += 1;
            continue;
        }
        break;
    }
    ctes
}

/// Returns (CTE names, referenced tables). `tokens` must be comment-free.
pub(crate) fn extract(script: &str, tokens: &[Token]) -> (Vec<String>, Vec<TableRef>) {
    let ctes = parse_ctes(script, tokens);
    let mut tables = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let t = &tokens[i];
        let next = i + 1;
        if t.is_word(script, "from") || t.is_word(script, "join") {
            i = parse_table_item(script, tokens, next, &mut tables).max(next);
            continue;
        }
        if t.is_word(script, "into")
            && i > 0
            && (tokens[i - 1].is_word(script, "insert") || tokens[i - 1].is_word(script, "merge"))
        {
            i = parse_table_item(script, tokens, next, &mut tables).max(next);
            continue;
        }
        if t.is_word(script, "update") {
            let prefixed = i > 0
                && (tokens[i - 1].is_word(script, "for") || tokens[i - 1].is_word(script, "do"));
            if !prefixed {
                i = parse_table_item(script, tokens, next, &mut tables).max(next);
                continue;
            }
        }
        i = next;
    }
    (ctes, tables)
}

#[cfg(test)]
mod tests {
    use crate::split_script;

    use super::*;

    fn tables_of(sql: &str) -> Vec<TableRef> {
        split_script(sql).remove(0).tables
    }

    fn table(schema: Option<&str>, name: &str, alias: Option<&str>) -> TableRef {
        TableRef {
            schema: schema.map(String::from),
            name: name.to_string(),
            alias: alias.map(String::from),
        }
    }

    #[test]
    fn test_simple_from() {
        assert_eq!(tables_of("SELECT * FROM users"), vec![table(None, "users", None)]);
    }

    #[test]
    fn test_qualified_and_aliased() {
        assert_eq!(
            tables_of("SELECT * FROM app.users u JOIN app.orders AS o ON o.user_id = u.id"),
            vec![
                table(Some("app"), "users", Some("u")),
                table(Some("app"), "orders", Some("o")),
            ]
        );
    }

    #[test]
    fn test_from_list_with_commas() {
        assert_eq!(
            tables_of("SELECT * FROM a, b bb, c WHERE a.x = b.x"),
            vec![
                table(None, "a", None),
                table(None, "b", Some("bb")),
                table(None, "c", None),
            ]
        );
    }

    #[test]
    fn test_quoted_identifiers() {
        assert_eq!(
            tables_of(r#"SELECT * FROM "My Schema"."My ""Table""" t"#),
            vec![table(Some("My Schema"), r#"My "Table""#, Some("t"))]
        );
    }

    #[test]
    fn test_update_delete_insert_targets() {
        assert_eq!(tables_of("UPDATE t SET a = 1"), vec![table(None, "t", None)]);
        assert_eq!(tables_of("DELETE FROM t WHERE false"), vec![table(None, "t", None)]);
        assert_eq!(
            tables_of("INSERT INTO logs (a) VALUES (1)"),
            vec![table(None, "logs", None)]
        );
    }

    #[test]
    fn test_for_update_not_a_target() {
        assert_eq!(
            tables_of("SELECT * FROM t WHERE id = 1 FOR UPDATE"),
            vec![table(None, "t", None)]
        );
    }

    #[test]
    fn test_function_in_from() {
        assert_eq!(
            tables_of("SELECT n FROM generate_series(1,7) n"),
            vec![table(None, "generate_series", Some("n"))]
        );
    }

    #[test]
    fn test_ctes() {
        let statement = split_script(
            "WITH RECURSIVE tree(id) AS (SELECT 1), leaves AS MATERIALIZED (SELECT * FROM t) \
             SELECT * FROM tree JOIN leaves ON true",
        )
        .remove(0);
        assert_eq!(statement.ctes, vec!["tree".to_string(), "leaves".to_string()]);
        assert_eq!(
            statement.tables,
            vec![
                table(None, "t", None),
                table(None, "tree", None),
                table(None, "leaves", None),
            ]
        );
    }

    #[test]
    fn test_subquery_in_from() {
        // The subquery's tables surface; its alias belongs to the subquery,
        // not to a table, and is not recorded.
        assert_eq!(
            tables_of("SELECT * FROM (SELECT * FROM inner_t) sub"),
            vec![table(None, "inner_t", None)]
        );
    }
}
