//! SQL script analysis for the query gateway: splitting a submitted script
//! into statements, classifying each one, scanning parameters and referenced
//! identifiers, locating the statement under an editor cursor, and rewriting
//! `select`s into pageable/sortable/filterable wrappers. Nothing in this
//! crate touches a database; it works on text alone.

mod idents;
mod lexer;
mod rewrite;
mod script;

pub use idents::TableRef;
pub use rewrite::{
    explain_select_sql,
    explain_sql,
    paginate,
    Filter,
    FilterBind,
    FilterOperator,
    FilterType,
    RewrittenQuery,
    Sort,
    SortDirection,
    PAGE_SIZE_ALL,
};
pub use script::{
    active_statement_range,
    classify_keyword,
    split_script,
    ParamRef,
    Statement,
    StatementKind,
};

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::split_script;

    /// Statements whose trimmed text is stable under split: no leading or
    /// trailing comments, semicolons only inside quoting constructs.
    fn statement_pool() -> Vec<&'static str> {
        vec![
            "SELECT 1",
            "SELECT 'a;b' AS s",
            "SELECT $$x;y$$",
            "SELECT $tag$nested ; -- inside$tag$",
            "SELECT E'it\\'s;'",
            "SELECT \"odd; name\" FROM t",
            "SELECT /* inline ; comment */ 2",
            "INSERT INTO t (a) VALUES (';')",
            "UPDATE t SET a = 1 WHERE b = $1",
            "CREATE TABLE x(id int)",
            "WITH c AS (SELECT 1) SELECT * FROM c",
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        /// Splitting a script of known statements recovers each statement's
        /// text, and rejoining with `;` re-splits to the same statements.
        #[test]
        fn proptest_split_rejoin(
            indices in proptest::collection::vec(0usize..11, 1..6),
            trailing_semicolon in any::<bool>(),
        ) {
            let pool = statement_pool();
            let chosen: Vec<&str> = indices.iter().map(|&i| pool[i]).collect();
            let mut script = chosen.join(" ;\n");
            if trailing_semicolon {
                script.push(';');
            }

            let statements = split_script(&script);
            let texts: Vec<&str> = statements.iter().map(|s| s.text.as_str()).collect();
            prop_assert_eq!(&texts, &chosen);

            // Ranges point back into the script.
            for s in &statements {
                prop_assert_eq!(&script[s.start..=s.end], s.text.as_str());
            }

            let rejoined = texts.join(";");
            let resplit = split_script(&rejoined);
            let retexts: Vec<&str> = resplit.iter().map(|s| s.text.as_str()).collect();
            prop_assert_eq!(retexts, texts);
        }
    }
}
