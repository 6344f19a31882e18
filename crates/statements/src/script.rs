//! Script splitting, statement classification, and the active-statement
//! lookup used by editor cursors.

use serde::Serialize;

use crate::{
    idents,
    lexer::{
        tokenize,
        Token,
        TokenKind,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatementKind {
    Select,
    Explain,
    ModifyData,
    ModifyStructure,
    Utility,
    Unknown,
}

const SELECT_KEYWORDS: &[&str] = &["select", "with", "values", "table", "show"];
const MODIFY_DATA_KEYWORDS: &[&str] = &["insert", "update", "delete", "merge", "copy"];
const MODIFY_STRUCTURE_KEYWORDS: &[&str] = &[
    "create", "alter", "drop", "truncate", "rename", "comment", "grant", "revoke", "reindex",
    "vacuum", "cluster", "refresh",
];
const UTILITY_KEYWORDS: &[&str] = &[
    "begin",
    "commit",
    "rollback",
    "set",
    "reset",
    "listen",
    "notify",
    "deallocate",
    "prepare",
    "execute",
    "call",
];

pub fn classify_keyword(keyword: &str) -> StatementKind {
    let lower = keyword.to_ascii_lowercase();
    let lower = lower.as_str();
    if SELECT_KEYWORDS.contains(&lower) {
        StatementKind::Select
    } else if lower == "explain" {
        StatementKind::Explain
    } else if MODIFY_DATA_KEYWORDS.contains(&lower) {
        StatementKind::ModifyData
    } else if MODIFY_STRUCTURE_KEYWORDS.contains(&lower) {
        StatementKind::ModifyStructure
    } else if UTILITY_KEYWORDS.contains(&lower) {
        StatementKind::Utility
    } else {
        StatementKind::Unknown
    }
}

/// A `$N` reference within one statement. The display name comes from a block
/// comment immediately following the marker (`$1 /* user_id */`), defaulting
/// to the ordinal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ParamRef {
    pub ordinal: u32,
    pub name: String,
}

/// One statement out of a submitted script.
#[derive(Clone, Debug)]
pub struct Statement {
    /// Statement text, comment/whitespace-trimmed at both ends.
    pub text: String,
    /// Inclusive byte range of `text` within the script.
    pub start: usize,
    pub end: usize,
    pub kind: StatementKind,
    /// First keyword, lowercased. Distinguishes utility statements the
    /// executor treats specially (`begin`, `commit`, `rollback`).
    pub leading_keyword: String,
    /// For `explain`: how the wrapped statement classifies.
    pub inner_kind: Option<StatementKind>,
    /// For `explain`: whether ANALYZE was requested (bare or in the option
    /// list). Such statements execute verbatim and are never rewrapped.
    pub explain_analyze: bool,
    /// For `explain`: the wrapped statement's text.
    pub inner_text: Option<String>,
    pub params: Vec<ParamRef>,
    pub ctes: Vec<String>,
    pub tables: Vec<idents::TableRef>,
}

impl Statement {
    pub fn max_param_ordinal(&self) -> u32 {
        self.params.iter().map(|p| p.ordinal).max().unwrap_or(0)
    }

    fn from_tokens(script: &str, tokens: &[Token]) -> Option<Self> {
        let code: Vec<Token> = tokens
            .iter()
            .copied()
            .filter(|t| t.kind != TokenKind::Comment)
            .collect();
        let first = code.first()?;
        let last = code.last()?;
        let (start, end) = (first.start, last.end - 1);
        let text = script[start..=end].to_string();

        let leading_keyword = match first.kind {
            TokenKind::Word => first.text(script).to_ascii_lowercase(),
            _ => String::new(),
        };
        let kind = if leading_keyword.is_empty() {
            StatementKind::Unknown
        } else {
            classify_keyword(&leading_keyword)
        };

        let (inner_kind, explain_analyze, inner_text) = if kind == StatementKind::Explain {
            explain_parts(script, &code)
        } else {
            (None, false, None)
        };

        let params = extract_params(script, tokens);
        let (ctes, tables) = idents::extract(script, &code);

        Some(Statement {
            text,
            start,
            end,
            kind,
            leading_keyword,
            inner_kind,
            explain_analyze,
            inner_text,
            params,
            ctes,
            tables,
        })
    }
}

/// Parses the token tail of an EXPLAIN statement: an optional `( ... )`
/// option list, then bare ANALYZE/VERBOSE, then the wrapped statement.
fn explain_parts(
    script: &str,
    code: &[Token],
) -> (Option<StatementKind>, bool, Option<String>) {
    let mut analyze = false;
    let mut i = 1;
    if code.get(i).map(|t| t.kind) == Some(TokenKind::Symbol(b'(')) {
        let mut depth = 0usize;
        let mut last_was_analyze = false;
        while i < code.len() {
            match code[i].kind {
                TokenKind::Symbol(b'(') => depth += 1,
                TokenKind::Symbol(b')') => {
                    depth -= 1;
                    if depth == 0 {
                        i += 1;
                        break;
                    }
                },
                TokenKind::Word => {
                    let word = code[i].text(script).to_ascii_lowercase();
                    if last_was_analyze && matches!(word.as_str(), "false" | "off") {
                        analyze = false;
                    }
                    last_was_analyze = word == "analyze";
                    if last_was_analyze {
                        analyze = true;
                    }
                },
                TokenKind::Number => {
                    if last_was_analyze && code[i].text(script) == "0" {
                        analyze = false;
                    }
                    last_was_analyze = false;
                },
                _ => last_was_analyze = false,
            }
            i += 1;
        }
    }
    while let Some(t) = code.get(i) {
        if t.is_word(script, "analyze") {
            analyze = true;
            i += 1;
        } else if t.is_word(script, "verbose") {
            i += 1;
        } else {
            break;
        }
    }
    let Some(first_inner) = code.get(i) else {
        return (None, analyze, None);
    };
    let inner_text = script[first_inner.start..code.last().expect("nonempty").end].to_string();
    let inner_kind = match first_inner.kind {
        TokenKind::Word => classify_keyword(first_inner.text(script)),
        _ => StatementKind::Unknown,
    };
    (Some(inner_kind), analyze, Some(inner_text))
}

/// Collects `$N` references with their display names. A marker named in one
/// place keeps that name everywhere.
fn extract_params(script: &str, tokens: &[Token]) -> Vec<ParamRef> {
    let mut by_ordinal: Vec<(u32, Option<String>)> = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let TokenKind::Param(ordinal) = token.kind else {
            continue;
        };
        let name = tokens.get(i + 1).and_then(|next| {
            if next.kind != TokenKind::Comment {
                return None;
            }
            let text = next.text(script);
            let body = text.strip_prefix("/*")?.strip_suffix("*/")?.trim();
            (!body.is_empty()).then(|| body.to_string())
        });
        match by_ordinal.iter_mut().find(|(o, _)| *o == ordinal) {
            Some((_, existing)) => {
                if existing.is_none() {
                    *existing = name;
                }
            },
            None => by_ordinal.push((ordinal, name)),
        }
    }
    by_ordinal.sort_by_key(|(o, _)| *o);
    by_ordinal
        .into_iter()
        .map(|(ordinal, name)| ParamRef {
            name: name.unwrap_or_else(|| ordinal.to_string()),
            ordinal,
        })
        .collect()
}

/// Splits a script on top-level semicolons. Statements empty of code (two
/// consecutive semicolons, comment-only segments) are skipped. A single
/// statement without a trailing semicolon is valid.
pub fn split_script(script: &str) -> Vec<Statement> {
    let tokens = tokenize(script);
    let mut statements = Vec::new();
    let mut segment_start = 0;
    for (i, token) in tokens.iter().enumerate() {
        if token.kind == TokenKind::Symbol(b';') {
            statements.extend(Statement::from_tokens(script, &tokens[segment_start..i]));
            segment_start = i + 1;
        }
    }
    statements.extend(Statement::from_tokens(script, &tokens[segment_start..]));
    statements
}

/// Returns the byte range (inclusive) of the statement under the cursor: the
/// maximal span that doesn't cross a top-level semicolon, with lines carrying
/// no code (whitespace, comments, block-comment interiors) excluded from both
/// ends.
pub fn active_statement_range(script: &str, cursor: usize) -> Option<(usize, usize)> {
    let cursor = cursor.min(script.len());
    let tokens = tokenize(script);

    let mut region_start = 0;
    let mut region_end = script.len();
    for token in &tokens {
        if token.kind != TokenKind::Symbol(b';') {
            continue;
        }
        if token.end <= cursor {
            region_start = token.end;
        } else {
            region_end = token.start;
            break;
        }
    }

    // Line-oriented pass: a line is blank when no non-comment token overlaps
    // its clipped extent. This makes lines that open, continue, or close a
    // block comment blank unless they also carry code.
    let mut lines: Vec<(usize, usize)> = Vec::new();
    let mut line_start = region_start;
    for (i, b) in script[region_start..region_end].bytes().enumerate() {
        if b == b'\n' {
            let abs = region_start + i;
            lines.push((line_start, abs));
            line_start = abs + 1;
        }
    }
    lines.push((line_start, region_end));

    let code_tokens: Vec<_> = tokens
        .iter()
        .filter(|t| t.kind != TokenKind::Comment && t.start < region_end && t.end > region_start)
        .collect();
    let has_code = |lo: usize, hi: usize| code_tokens.iter().any(|t| t.start < hi && t.end > lo);

    let first = lines.iter().position(|&(lo, hi)| has_code(lo, hi))?;
    let last = lines.iter().rposition(|&(lo, hi)| has_code(lo, hi))?;

    let mut start = lines[first].0.max(region_start);
    let mut end = lines[last].1.min(region_end);
    while start < end && script.as_bytes()[start].is_ascii_whitespace() {
        start += 1;
    }
    while end > start && script.as_bytes()[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    (start < end).then_some((start, end - 1))
}
