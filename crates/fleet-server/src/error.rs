//! HTTP error types for the fleet control plane server.
//!
//! Maps domain errors from `fleet-core`/`fleet-storage` into HTTP responses.
//! Every error variant produces a JSON body with a machine-readable `error`
//! field and a human-readable `message`, mirroring the category table: a
//! validation problem is a client error, an external or storage fault is a
//! server error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use fleet_core::error::{AdapterError, HostRegistryError, PlacementError, ProvisionError};
use fleet_storage::StoreError;

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// Authentication failed or token invalid.
    Unauthorized(String),
    /// Requested resource not found.
    NotFound(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// A conflict with the current state (e.g. stale CAS, duplicate id).
    Conflict(String),
    /// The underlying store or an external system is unavailable.
    ServiceUnavailable(String),
    /// Internal server error.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg)
            }
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::HostNotFound { .. } | StoreError::LeaseNotFound { .. } => {
                Self::NotFound(err.to_string())
            }
            StoreError::Conflict { .. } => Self::Conflict(err.to_string()),
            StoreError::Open { .. }
            | StoreError::Read { .. }
            | StoreError::Write { .. }
            | StoreError::Transaction { .. }
            | StoreError::Corrupt { .. } => Self::ServiceUnavailable(err.to_string()),
        }
    }
}

impl From<HostRegistryError> for AppError {
    fn from(err: HostRegistryError) -> Self {
        match err {
            HostRegistryError::UnknownHost { .. } => Self::NotFound(err.to_string()),
            HostRegistryError::BadBootstrapToken { .. } | HostRegistryError::BadSessionToken { .. } => {
                Self::Unauthorized(err.to_string())
            }
            HostRegistryError::InvalidCapacity { .. } => Self::BadRequest(err.to_string()),
            HostRegistryError::Storage(inner) => inner.into(),
        }
    }
}

impl From<PlacementError> for AppError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::NoHostsEnabled
            | PlacementError::InsufficientCapacity
            | PlacementError::LabelNotServed => Self::Conflict(err.to_string()),
        }
    }
}

impl From<ProvisionError> for AppError {
    fn from(err: ProvisionError) -> Self {
        match err {
            ProvisionError::StaleLease { .. } => Self::Conflict(err.to_string()),
            ProvisionError::ControllerAllocation { .. } | ProvisionError::NodeAgentLaunch { .. } => {
                Self::ServiceUnavailable(err.to_string())
            }
            ProvisionError::Storage(inner) => inner.into(),
        }
    }
}

impl From<AdapterError> for AppError {
    fn from(err: AdapterError) -> Self {
        Self::ServiceUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_404() {
        let err = StoreError::LeaseNotFound {
            lease_id: uuid::Uuid::nil(),
        };
        assert!(matches!(AppError::from(err), AppError::NotFound(_)));
    }

    #[test]
    fn store_conflict_maps_to_409() {
        let err = StoreError::Conflict {
            reason: "stale CAS".to_owned(),
        };
        assert!(matches!(AppError::from(err), AppError::Conflict(_)));
    }

    #[test]
    fn bad_bootstrap_token_maps_to_401() {
        let err = HostRegistryError::BadBootstrapToken {
            host_id: "build-1".to_owned(),
        };
        assert!(matches!(AppError::from(err), AppError::Unauthorized(_)));
    }

    #[test]
    fn placement_error_maps_to_409() {
        assert!(matches!(
            AppError::from(PlacementError::InsufficientCapacity),
            AppError::Conflict(_)
        ));
    }
}
