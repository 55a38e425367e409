mod health;
mod sessions;
mod websocket;

pub use health::{health_handler, health_live_handler, health_ready_handler, metrics_handler};
pub use sessions::{
    create_session, delete_session, get_session, list_sessions, resume_project, set_focus,
    suspend_project,
};
pub use websocket::stream_handler;

use axum::http::StatusCode;

use crate::error::EngineError;

/// Map engine errors onto HTTP status codes.
pub(crate) fn error_response(err: EngineError) -> (StatusCode, String) {
    let status = match &err {
        EngineError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
        EngineError::FocusLimitExceeded(_) => StatusCode::CONFLICT,
        EngineError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::SpawnTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
        EngineError::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Pty(_) | EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_codes_match_error_taxonomy() {
        assert_eq!(
            error_response(EngineError::ResourceExhausted("p".into())).0,
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            error_response(EngineError::FocusLimitExceeded("p".into())).0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_response(EngineError::SessionNotFound("s".into())).0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_response(EngineError::SpawnTimeout(Duration::from_secs(5))).0,
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            error_response(EngineError::BackendUnavailable).0,
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_response(EngineError::internal("boom")).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
