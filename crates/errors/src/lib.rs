use std::borrow::Cow;

use http::StatusCode;
use serde::{
    Deserialize,
    Serialize,
};

const INTERNAL_SERVER_ERROR: &str = "InternalServerError";
const INTERNAL_SERVER_ERROR_MSG: &str = "Your request couldn't be completed. Try again later.";
const CANCELED: &str = "Canceled";
const CANCELED_MSG: &str = "Request was canceled";

/// HTTP status used for requests the client abandoned. Not in the IANA
/// registry but widely understood (nginx's "client closed request").
const CLIENT_CLOSED_REQUEST: u16 = 499;

/// `ErrorMetadata` is attached to an `anyhow` error chain via `.context(..)`
/// and recovered at the HTTP boundary by downcasting. It classifies the error
/// into the gateway's wire taxonomy and carries the user-facing message.
///
/// `short_msg` is a stable ScreamingCamelCase tag usable in tests and log
/// grepping; `msg` is the human-readable text shown verbatim in the editor.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    /// Short ScreamingCamelCase tag, e.g. `MissingHeader`.
    pub short_msg: Cow<'static, str>,
    /// Developer-facing description, e.g. "the x-conn-name header is
    /// required for this endpoint".
    pub msg: Cow<'static, str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// Malformed body, missing header, invalid pagination/filter shape.
    BadRequest { field: Option<Cow<'static, str>> },
    /// Pool exhausted or dial failure.
    Unavailable,
    /// Password resolution or handshake failure.
    AuthFailure,
    /// The client canceled the request (or its budget elapsed).
    Canceled,
    /// Config mutation rejected or persisted config unreadable.
    InvalidConfig,
    /// Anything else.
    Internal,
    /// An error reported by the database itself. `position` is the 1-based
    /// character offset within the statement text, when the server gave one.
    Pg {
        severity: String,
        code: String,
        position: Option<u32>,
    },
}

impl ErrorMetadata {
    /// Maps to 400.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest { field: None },
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Maps to 400, naming the offending request field or header.
    pub fn bad_request_field(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
        field: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest {
                field: Some(field.into()),
            },
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Pool exhausted or the server couldn't be dialed. Maps to 503.
    pub fn unavailable(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unavailable,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Password resolution or authentication handshake failure. Maps to 401.
    pub fn auth_failure(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::AuthFailure,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// The request was canceled before producing a result. Maps to 499.
    pub fn canceled() -> Self {
        Self {
            code: ErrorCode::Canceled,
            short_msg: CANCELED.into(),
            msg: CANCELED_MSG.into(),
        }
    }

    /// Config mutation rejected. Maps to 400.
    pub fn invalid_config(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::InvalidConfig,
            short_msg: "InvalidConfig".into(),
            msg: msg.into(),
        }
    }

    /// A SQL error returned by the database. Maps to 400 so the editor can
    /// render the message (and position marker) inline.
    pub fn pg(
        severity: impl Into<String>,
        code: impl Into<String>,
        msg: impl Into<Cow<'static, str>>,
        position: Option<u32>,
    ) -> Self {
        Self {
            code: ErrorCode::Pg {
                severity: severity.into(),
                code: code.into(),
                position,
            },
            short_msg: "PgError".into(),
            msg: msg.into(),
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match &self.code {
            ErrorCode::BadRequest { .. } | ErrorCode::InvalidConfig | ErrorCode::Pg { .. } => {
                StatusCode::BAD_REQUEST
            },
            ErrorCode::AuthFailure => StatusCode::UNAUTHORIZED,
            ErrorCode::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Canceled => {
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).expect("499 is in the valid range")
            },
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let message = self.msg.to_string();
        match &self.code {
            ErrorCode::Pg {
                severity,
                code,
                position,
            } => ErrorPayload::PgError {
                severity: severity.clone(),
                code: code.clone(),
                message,
                position: *position,
            },
            ErrorCode::Unavailable => ErrorPayload::Unavailable { message },
            ErrorCode::AuthFailure => ErrorPayload::AuthFailure { message },
            ErrorCode::BadRequest { field } => ErrorPayload::BadRequest {
                message,
                field: field.as_ref().map(|f| f.to_string()),
            },
            ErrorCode::Canceled => ErrorPayload::Canceled {},
            ErrorCode::InvalidConfig => ErrorPayload::InvalidConfig { message },
            ErrorCode::Internal => ErrorPayload::Internal { message },
        }
    }
}

/// The structured error body every endpoint returns on failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ErrorPayload {
    PgError {
        severity: String,
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<u32>,
    },
    Unavailable {
        message: String,
    },
    AuthFailure {
        message: String,
    },
    BadRequest {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    Canceled {},
    InvalidConfig {
        message: String,
    },
    Internal {
        message: String,
    },
}

/// Classification helpers on `anyhow::Error` for error chains that may carry
/// an [`ErrorMetadata`]. Untagged chains classify as internal errors and the
/// user sees a generic message; the full chain still goes to the logs.
pub trait ErrorMetadataAnyhowExt {
    fn metadata(&self) -> Option<&ErrorMetadata>;
    fn http_status(&self) -> StatusCode;
    fn payload(&self) -> ErrorPayload;
    fn short_msg(&self) -> &str;
    fn is_canceled(&self) -> bool;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn metadata(&self) -> Option<&ErrorMetadata> {
        self.downcast_ref::<ErrorMetadata>()
    }

    fn http_status(&self) -> StatusCode {
        self.metadata()
            .map(ErrorMetadata::http_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn payload(&self) -> ErrorPayload {
        match self.metadata() {
            Some(em) => em.payload(),
            None => ErrorPayload::Internal {
                message: INTERNAL_SERVER_ERROR_MSG.to_string(),
            },
        }
    }

    fn short_msg(&self) -> &str {
        self.metadata()
            .map(|em| em.short_msg.as_ref())
            .unwrap_or(INTERNAL_SERVER_ERROR)
    }

    fn is_canceled(&self) -> bool {
        matches!(
            self.metadata(),
            Some(ErrorMetadata {
                code: ErrorCode::Canceled,
                ..
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ErrorMetadata::bad_request("Nope", "nope").http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorMetadata::unavailable("PoolExhausted", "pool exhausted").http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ErrorMetadata::auth_failure("BadPassword", "no").http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ErrorMetadata::canceled().http_status().as_u16(), 499);
        assert_eq!(
            ErrorMetadata::pg("ERROR", "42601", "syntax error", Some(1)).http_status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_pg_payload_shape() {
        let em = ErrorMetadata::pg("ERROR", "42601", "syntax error at or near \"SELEKT\"", Some(1));
        let body = serde_json::to_value(em.payload()).unwrap();
        assert_eq!(body["type"], "PgError");
        assert_eq!(body["code"], "42601");
        assert_eq!(body["position"], 1);
        assert_eq!(body["message"], "syntax error at or near \"SELEKT\"");
    }

    #[test]
    fn test_position_omitted_when_absent() {
        let em = ErrorMetadata::pg("ERROR", "57014", "canceling statement", None);
        let body = serde_json::to_value(em.payload()).unwrap();
        assert!(body.get("position").is_none());
    }

    #[test]
    fn test_canceled_payload_is_bare() {
        let body = serde_json::to_value(ErrorMetadata::canceled().payload()).unwrap();
        assert_eq!(body, serde_json::json!({ "type": "Canceled" }));
    }

    #[test]
    fn test_untagged_anyhow_is_internal() {
        let err = anyhow::anyhow!("sharp edge");
        assert_eq!(err.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_value(err.payload()).unwrap();
        assert_eq!(body["type"], "Internal");
        // The raw message must not leak to the client.
        assert!(!body["message"].as_str().unwrap().contains("sharp edge"));
    }

    #[test]
    fn test_tagged_anyhow_roundtrip() {
        let err: anyhow::Error = anyhow::anyhow!("dial failed")
            .context(ErrorMetadata::unavailable("DialFailed", "connection refused"));
        assert_eq!(err.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.short_msg(), "DialFailed");
        assert!(!err.is_canceled());
    }
}
