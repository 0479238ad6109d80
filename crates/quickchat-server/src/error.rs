use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use quickchat_shared::AuthError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    #[error("Message must contain text or an image")]
    EmptyMessage,

    #[error("Message store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Too many requests")]
    RateLimited,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl From<AuthError> for ServerError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated => ServerError::Unauthenticated,
            AuthError::InvalidCredential(reason) => ServerError::InvalidCredential(reason),
        }
    }
}

impl From<JsonRejection> for ServerError {
    fn from(rejection: JsonRejection) -> Self {
        ServerError::BadRequest(rejection.body_text())
    }
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::Unauthenticated | ServerError::InvalidCredential(_) => {
                StatusCode::UNAUTHORIZED
            }
            ServerError::EmptyMessage | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            // Backend details stay in the logs.
            ServerError::StoreUnavailable(_) => "Message store unavailable".to_string(),
            ServerError::InvalidCredential(_) => "Invalid credential".to_string(),
            _ => self.to_string(),
        };

        let body = serde_json::json!({
            "success": false,
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServerError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ServerError::from(AuthError::InvalidCredential("expired".into())).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ServerError::EmptyMessage.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServerError::BadRequest("text: invalid type".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::StoreUnavailable("disk".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_store_details_are_not_leaked() {
        let response = ServerError::StoreUnavailable("/var/lib/secret.db locked".into())
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
