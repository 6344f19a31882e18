//! The wire model for query responses. `ResultPage` is the externally
//! visible sum type, tagged with `type` on the wire.

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;
use statements::Sort;

/// One output column, with optional provenance filled in by the catalog
/// annotator after execution.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub ordinal: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_column: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fk_constraint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fk_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fk_column: Option<String>,
    /// Driver-reported provenance, input to the annotator. Not serialized.
    #[serde(skip)]
    pub table_oid: Option<u32>,
    #[serde(skip)]
    pub column_id: Option<i16>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEntries {
    pub columns: Vec<ResultColumn>,
    /// Row-major cells, aligned with `columns`. Each cell is a JSON scalar,
    /// `null`, array, or object.
    pub rows: Vec<Vec<JsonValue>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResultPage {
    Select {
        page: u64,
        page_size: i64,
        total_count: i64,
        total_pages: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        sort: Option<Sort>,
        entries: ResultEntries,
    },
    ModifyData {
        affected_rows: u64,
    },
    ModifyStructure {},
    Explain {
        plan: JsonValue,
        query: String,
    },
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use statements::SortDirection;

    use super::*;

    #[test]
    fn test_select_wire_shape() {
        let page = ResultPage::Select {
            page: 1,
            page_size: 10,
            total_count: 1,
            total_pages: 1,
            sort: None,
            entries: ResultEntries {
                columns: vec![ResultColumn {
                    name: "x".to_string(),
                    type_name: "int4".to_string(),
                    ordinal: 0,
                    ..Default::default()
                }],
                rows: vec![vec![json!(1)]],
            },
        };
        let body = serde_json::to_value(&page).unwrap();
        assert_eq!(body["type"], "select");
        assert_eq!(body["total_count"], 1);
        assert_eq!(body["entries"]["columns"][0]["name"], "x");
        assert_eq!(body["entries"]["columns"][0]["type"], "int4");
        assert_eq!(body["entries"]["rows"], json!([[1]]));
        // Unfilled provenance stays off the wire.
        assert!(body["entries"]["columns"][0].get("source_table").is_none());
    }

    #[test]
    fn test_tag_spellings() {
        assert_eq!(
            serde_json::to_value(ResultPage::ModifyData { affected_rows: 0 }).unwrap(),
            json!({ "type": "modify-data", "affected_rows": 0 })
        );
        assert_eq!(
            serde_json::to_value(ResultPage::ModifyStructure {}).unwrap(),
            json!({ "type": "modify-structure" })
        );
        let explain = ResultPage::Explain {
            plan: json!([{ "Plan": {} }]),
            query: "SELECT 1".to_string(),
        };
        assert_eq!(serde_json::to_value(&explain).unwrap()["type"], "explain");
    }

    #[test]
    fn test_sort_roundtrip() {
        let page = ResultPage::Select {
            page: 2,
            page_size: 3,
            total_count: 7,
            total_pages: 3,
            sort: Some(Sort {
                column_idx: 0,
                direction: SortDirection::Desc,
            }),
            entries: ResultEntries::default(),
        };
        let body = serde_json::to_value(&page).unwrap();
        assert_eq!(body["sort"], json!({ "column_idx": 0, "direction": "DESC" }));
        let back: ResultPage = serde_json::from_value(body).unwrap();
        assert_eq!(back, page);
    }
}
