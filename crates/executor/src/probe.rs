//! The prepare probe: parameter and column metadata without execution.
//!
//! `Client::prepare` runs the extended-protocol Parse/Describe round-trip
//! and nothing else; the server-side prepared statement is closed when the
//! driver `Statement` drops, so probes leave no state behind.

use serde::Serialize;
use sessions::classify_pg_error;
use statements::Statement;
use tokio_postgres::Client;

use crate::{
    decode::columns_meta,
    results::ResultColumn,
};

#[derive(Clone, Debug, Serialize)]
pub struct ParamMeta {
    pub ordinal: u32,
    /// Display name per the source convention (`$1 /* user_id */`), the
    /// ordinal otherwise.
    pub name: String,
    pub type_oid: u32,
    pub type_name: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PrepareResponse {
    pub columns: Vec<ResultColumn>,
    pub params: Vec<ParamMeta>,
}

pub async fn probe(client: &Client, statement: &Statement) -> anyhow::Result<PrepareResponse> {
    let prepared = client
        .prepare(&statement.text)
        .await
        .map_err(classify_pg_error)?;

    let params = prepared
        .params()
        .iter()
        .enumerate()
        .map(|(i, ty)| {
            let ordinal = i as u32 + 1;
            let name = statement
                .params
                .iter()
                .find(|p| p.ordinal == ordinal)
                .map(|p| p.name.clone())
                .unwrap_or_else(|| ordinal.to_string());
            ParamMeta {
                ordinal,
                name,
                type_oid: ty.oid(),
                type_name: ty.name().to_string(),
            }
        })
        .collect();

    Ok(PrepareResponse {
        columns: columns_meta(prepared.columns()),
        params,
    })
}
