//! Mapping of service errors onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use slipstream_core::{ConfigError, LedgerError, RaceError, RegistryError, ServiceError};

/// Error returned by every handler.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Bad request: {reason}")]
    BadRequest { reason: String },
}

impl ApiError {
    pub fn bad_request(reason: impl std::fmt::Display) -> Self {
        ApiError::BadRequest {
            reason: reason.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        let ApiError::Service(error) = self else {
            return StatusCode::BAD_REQUEST;
        };
        match error {
            ServiceError::Ledger(ledger) | ServiceError::Race(RaceError::Ledger(ledger)) => {
                ledger_status(ledger)
            }
            ServiceError::Registry(RegistryError::DuplicateTask { .. }) => StatusCode::CONFLICT,
            ServiceError::Registry(RegistryError::UnknownTask { .. }) => StatusCode::NOT_FOUND,
            ServiceError::Gateway(_) | ServiceError::Race(RaceError::Gateway(_)) => {
                StatusCode::BAD_GATEWAY
            }
            ServiceError::Config(ConfigError::Invalid { .. }) => StatusCode::BAD_REQUEST,
            ServiceError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::Race(RaceError::TorrentNotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::Race(
                RaceError::CategoryNotRaceable { .. }
                | RaceError::TorrentPaused { .. }
                | RaceError::AlreadyComplete { .. },
            ) => StatusCode::BAD_REQUEST,
            ServiceError::Race(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn ledger_status(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::DuplicateObligation { .. } => StatusCode::CONFLICT,
        LedgerError::UnknownObligation { .. } => StatusCode::NOT_FOUND,
        LedgerError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }
        let body = Json(json!({
            "status": "error",
            "reason": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use slipstream_core::GatewayError;

    use super::*;

    #[test]
    fn test_status_mapping() {
        let duplicate = ApiError::from(ServiceError::from(RaceError::Ledger(
            LedgerError::DuplicateObligation {
                id: "abc".to_string(),
            },
        )));
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let unknown = ApiError::from(ServiceError::from(RegistryError::UnknownTask {
            id: "t".to_string(),
        }));
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

        let outage = ApiError::from(ServiceError::from(GatewayError::Unavailable {
            reason: "connection refused".to_string(),
        }));
        assert_eq!(outage.status(), StatusCode::BAD_GATEWAY);

        let config = ApiError::from(ServiceError::from(ConfigError::invalid("bad port")));
        assert_eq!(config.status(), StatusCode::BAD_REQUEST);

        let storage = ApiError::from(ServiceError::from(LedgerError::Storage {
            reason: "locked".to_string(),
        }));
        assert_eq!(storage.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
