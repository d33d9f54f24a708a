//! The error taxonomy of . Library code returns `anyhow::Result`
//! throughout (matching the teacher's `kumod`); this is the boundary type
//! that the C8/C9 HTTP surfaces and the campaign-state/enqueue/dispatch
//! services convert into at the edge.
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    /// A state-machine guard rejected the transition; carries the status
    /// the campaign was actually found in.
    #[error("invalid state: campaign is {current}, cannot {attempted}")]
    InvalidState { current: String, attempted: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("authentication required")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("payload too large")]
    TooLarge,
}

impl AppError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::InvalidState { .. } => 409,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Unauthenticated => 401,
            Self::Forbidden => 403,
            Self::Internal(_) => 500,
            Self::Upstream(_) => 502,
            Self::TooLarge => 413,
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: String,
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        use axum::Json;

        if matches!(self, Self::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(ErrorEnvelope {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(AppError::Validation("x".into()).status_code(), 400);
        assert_eq!(
            AppError::InvalidState {
                current: "draft".into(),
                attempted: "pause".into()
            }
            .status_code(),
            409
        );
        assert_eq!(AppError::NotFound("campaign".into()).status_code(), 404);
        assert_eq!(AppError::Conflict("locked".into()).status_code(), 409);
        assert_eq!(AppError::Unauthenticated.status_code(), 401);
        assert_eq!(AppError::Forbidden.status_code(), 403);
        assert_eq!(AppError::Upstream("esp down".into()).status_code(), 502);
        assert_eq!(AppError::TooLarge.status_code(), 413);
    }
}
