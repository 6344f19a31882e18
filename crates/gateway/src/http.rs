//! HTTP plumbing: the error-to-response exit point and the extractors every
//! handler shares. All handlers return `Result<_, HttpResponseError>`; the
//! conversion from `anyhow::Error` recovers the attached `ErrorMetadata`
//! and renders the structured error body.

use axum::{
    extract::{
        FromRequest,
        FromRequestParts,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
    ErrorPayload,
};
use http::{
    request::Parts,
    StatusCode,
};
use serde::{
    de::DeserializeOwned,
    Serialize,
};

/// Carries the full error chain to the logs and the structured payload to
/// the client. Built from any `anyhow::Error` at the handler boundary.
pub struct HttpResponseError {
    trace: anyhow::Error,
    status: StatusCode,
    payload: ErrorPayload,
}

impl From<anyhow::Error> for HttpResponseError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: err.http_status(),
            payload: err.payload(),
            trace: err,
        }
    }
}

impl From<ErrorMetadata> for HttpResponseError {
    fn from(em: ErrorMetadata) -> Self {
        anyhow::Error::from(em).into()
    }
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        // The exit point of the HTTP layer is the one place errors are
        // logged, so each failure surfaces exactly once.
        if self.status.is_server_error() {
            tracing::error!("request failed: {:#}", self.trace);
        } else {
            tracing::debug!("request rejected: {:#}", self.trace);
        }
        (self.status, axum::Json(self.payload)).into_response()
    }
}

/// Wrapper around `axum::Json` so body rejections render the gateway's
/// structured error shape instead of axum's plain text.
pub struct Json<T>(pub T);

impl<S, T> FromRequest<S> for Json<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let t = axum::Json::<T>::from_request(req, state)
            .await
            .map_err(|e| {
                HttpResponseError::from(ErrorMetadata::bad_request("BadJsonBody", e.body_text()))
            })?;
        Ok(Self(t.0))
    }
}

impl<T> IntoResponse for Json<T>
where
    T: Serialize,
{
    fn into_response(self) -> Response {
        axum::Json(self.0).into_response()
    }
}

fn required_header(parts: &Parts, name: &'static str) -> Result<String, HttpResponseError> {
    let value = parts.headers.get(name).ok_or_else(|| {
        HttpResponseError::from(ErrorMetadata::bad_request_field(
            "MissingHeader",
            format!("the {name} header is required for this endpoint"),
            name,
        ))
    })?;
    let value = value.to_str().map_err(|_| {
        HttpResponseError::from(ErrorMetadata::bad_request_field(
            "InvalidHeader",
            format!("the {name} header isn't valid UTF-8"),
            name,
        ))
    })?;
    Ok(value.to_string())
}

/// The connection routing header, `x-conn-name`.
pub struct ExtractConnection(pub String);

impl<S> FromRequestParts<S> for ExtractConnection
where
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(required_header(parts, "x-conn-name")?))
    }
}

/// The database routing header, `x-database`.
pub struct ExtractDatabase(pub String);

impl<S> FromRequestParts<S> for ExtractDatabase
where
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(required_header(parts, "x-database")?))
    }
}

/// `x-database` where the endpoint falls back to the connection's default
/// database (`GET /db/databases`).
pub struct ExtractDatabaseOptional(pub Option<String>);

impl<S> FromRequestParts<S> for ExtractDatabaseOptional
where
    S: Send + Sync,
{
    type Rejection = HttpResponseError;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get("x-database") {
            None => Ok(Self(None)),
            Some(_) => Ok(Self(Some(required_header(parts, "x-database")?))),
        }
    }
}
