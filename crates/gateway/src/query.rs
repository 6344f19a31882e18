//! The `/query` and `/prepare` handlers.

use axum::extract::State;
use executor::{
    PrepareResponse,
    QueryRequest,
    ResultPage,
};
use serde::Deserialize;

use crate::{
    http::{
        ExtractConnection,
        ExtractDatabase,
        HttpResponseError,
        Json,
    },
    AppState,
};

pub async fn query(
    State(st): State<AppState>,
    ExtractConnection(conn): ExtractConnection,
    ExtractDatabase(database): ExtractDatabase,
    Json(req): Json<QueryRequest>,
) -> Result<Json<ResultPage>, HttpResponseError> {
    let page = st.executor.query(&conn, &database, req).await?;
    Ok(Json(page))
}

#[derive(Deserialize)]
pub struct PrepareRequest {
    pub query: String,
}

pub async fn prepare(
    State(st): State<AppState>,
    ExtractConnection(conn): ExtractConnection,
    ExtractDatabase(database): ExtractDatabase,
    Json(req): Json<PrepareRequest>,
) -> Result<Json<PrepareResponse>, HttpResponseError> {
    let response = st.executor.prepare(&conn, &database, &req.query).await?;
    Ok(Json(response))
}
