use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── Library errors ─────────────────────────────────────────────────────────

/// Failure reported by a peer transport or the capture collaborator.
///
/// None of these are fatal: the supervisor logs them and takes its restart
/// path.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("capture unavailable: {0}")]
    Capture(String),
    #[error("transport already closed")]
    Closed,
}

impl From<webrtc::Error> for TransportError {
    fn from(err: webrtc::Error) -> Self {
        Self::Negotiation(err.to_string())
    }
}

/// Failure on the client side of a signaling channel.
#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("could not reach broker at {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
    #[error("gave up after {0} reconnection attempts")]
    Exhausted(u32),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failure uploading to the telemetry collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("server responded with {status}")]
    Status { status: u16 },
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured error returned by the broker's HTTP endpoints.
///
/// ```json
/// {
///   "error": {
///     "code": "group_not_found",
///     "message": "Group 'team9' does not exist.",
///     "status": 404
///   }
/// }
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        } else if self.status.is_client_error() {
            tracing::warn!(code = self.code, status = self.status.as_u16(), "{}", self.message);
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

impl ApiError {
    /// 404: no group is registered under this key.
    pub fn group_not_found(group_key: &str) -> Self {
        Self {
            code: "group_not_found",
            message: format!("Group '{group_key}' does not exist."),
            status: StatusCode::NOT_FOUND,
        }
    }

    /// 400: the group key is empty or otherwise unusable.
    pub fn invalid_group_key() -> Self {
        Self {
            code: "invalid_group_key",
            message: "Group key must not be empty.".into(),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> serde_json::Value {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let value = body_json(ApiError::group_not_found("team9")).await;

        assert_eq!(value["error"]["code"], "group_not_found");
        assert_eq!(value["error"]["message"], "Group 'team9' does not exist.");
        assert_eq!(value["error"]["status"], 404);
    }

    #[tokio::test]
    async fn status_code_is_set() {
        let response = ApiError::invalid_group_key().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn library_errors_render_context() {
        let err = SignalingError::Connect {
            url: "ws://localhost:3000/ws".into(),
            reason: "refused".into(),
        };
        assert!(err.to_string().contains("ws://localhost:3000/ws"));

        let err = TelemetryError::Exhausted { attempts: 3, last: "status 503".into() };
        assert_eq!(err.to_string(), "gave up after 3 attempts: status 503");
    }
}
