//! Service error type and its HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dto::ErrorBody;

use crate::ami::AmiError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Operation attempted on an entity that no longer accepts it.
    #[error("{0}")]
    Conflict(String),

    /// A PBX-side failure that already drove the order/call to a failure
    /// state; `state` carries the resulting order state for the body.
    #[error("{message}")]
    Pbx {
        message: String,
        state: Option<String>,
        details: Option<String>,
        status: StatusCode,
    },

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ApiError {
    /// Map an AMI failure onto an HTTP status: infrastructure unreachability
    /// is 503, everything the PBX itself said (or failed to say in time)
    /// is 500.
    pub fn from_ami(error: &AmiError, order_state: &str) -> Self {
        let status = match error {
            AmiError::Dns(_)
            | AmiError::ConnectionRefused(_)
            | AmiError::ConnectTimeout
            | AmiError::Transport(_)
            | AmiError::NotConnected => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::Pbx {
            message: error.to_string(),
            state: Some(order_state.to_string()),
            details: Some(error.to_string()),
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(ErrorBody::new(format!("{what} not found"))),
            )
                .into_response(),
            ApiError::Conflict(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorBody::new(message))).into_response()
            }
            ApiError::Pbx {
                message,
                state,
                details,
                status,
            } => {
                let mut body = ErrorBody::new(message);
                if let Some(state) = state {
                    body = body.with_state(state);
                }
                if let Some(details) = details {
                    body = body.with_details(details);
                }
                (status, Json(body)).into_response()
            }
            ApiError::Unexpected(error) => {
                tracing::error!(?error, "unexpected api error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorBody::new("internal error")),
                )
                    .into_response()
            }
        }
    }
}
