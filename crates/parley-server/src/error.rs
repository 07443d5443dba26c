//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::{Error, TaskKind};
use serde_json::json;

/// API error type, rendered as `{"detail": message}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }

    /// Map a core error for a request of `task`.
    ///
    /// Caller mistakes are 400, readiness problems 503, everything else 500
    /// prefixed with the task name ("Translation failed: ...").
    pub fn from_core(err: Error, task: TaskKind) -> Self {
        match &err {
            Error::Validation(msg) => ApiError::bad_request(msg.clone()),
            Error::Audio(msg) => ApiError::bad_request(format!("Invalid audio: {}", msg)),
            Error::NotReady(_) | Error::ServiceUnavailable(_) => {
                ApiError::service_unavailable(err.to_string())
            }
            _ => ApiError::internal(format!("{} failed: {}", task.display_name(), err)),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::BackendError;

    #[test]
    fn maps_core_errors_to_status_codes() {
        let err = ApiError::from_core(
            Error::Validation("Empty text provided for translation".into()),
            TaskKind::Translation,
        );
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.message, "Empty text provided for translation");

        let err = ApiError::from_core(Error::NotReady("loading".into()), TaskKind::Synthesis);
        assert_eq!(err.status, StatusCode::SERVICE_UNAVAILABLE);

        let err = ApiError::from_core(
            Error::AllBackendsFailed {
                attempts: 1,
                last: BackendError::remote("boom"),
            },
            TaskKind::Synthesis,
        );
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.message.starts_with("TTS generation failed: "));
        assert!(err.message.contains("boom"));
    }
}
