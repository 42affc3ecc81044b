//! Translation of registry error codes into the application taxonomy.
//!
//! The registry reports failures as GraphQL errors whose `extensions` carry a
//! numeric `error_code`.

use crate::apperrors::{AppError, ErrComponent, ErrReason};

/// Extension key holding the registry error code.
pub const ERROR_CODE_EXTENSION: &str = "error_code";

/// Error codes understood by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorCode {
    InternalError,
    UnknownError,
    NotFound,
    NotUnique,
    InvalidData,
    InsufficientScopes,
    TenantRequired,
    TenantNotFound,
    Unauthorized,
    InvalidOperation,
}

impl RemoteErrorCode {
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            10 => RemoteErrorCode::InternalError,
            11 => RemoteErrorCode::UnknownError,
            20 => RemoteErrorCode::NotFound,
            21 => RemoteErrorCode::NotUnique,
            22 => RemoteErrorCode::InvalidData,
            23 => RemoteErrorCode::InsufficientScopes,
            24 => RemoteErrorCode::TenantRequired,
            25 => RemoteErrorCode::TenantNotFound,
            26 => RemoteErrorCode::Unauthorized,
            27 => RemoteErrorCode::InvalidOperation,
            _ => return None,
        })
    }

    pub fn reason(&self) -> ErrReason {
        match self {
            RemoteErrorCode::InternalError => ErrReason::Internal,
            RemoteErrorCode::UnknownError => ErrReason::UnknownError,
            RemoteErrorCode::NotFound => ErrReason::NotFound,
            RemoteErrorCode::NotUnique => ErrReason::NotUnique,
            RemoteErrorCode::InvalidData => ErrReason::InvalidData,
            RemoteErrorCode::InsufficientScopes => ErrReason::InsufficientScopes,
            RemoteErrorCode::TenantRequired => ErrReason::TenantRequired,
            RemoteErrorCode::TenantNotFound => ErrReason::TenantNotFound,
            RemoteErrorCode::Unauthorized => ErrReason::Unauthorized,
            RemoteErrorCode::InvalidOperation => ErrReason::InvalidOperation,
        }
    }
}

/// Map a registry GraphQL error onto an [`AppError`].
///
/// | remote code | category |
/// |---|---|
/// | internal, unknown | internal |
/// | insufficient scopes, unauthorized | bad-gateway |
/// | not found, not unique, invalid data, invalid operation | bad-request |
/// | tenant required, tenant not found | invalid-tenant |
/// | anything else | internal (`UnrecognizedCode`) |
pub fn map_registry_error(
    message: &str,
    extensions: &serde_json::Map<String, serde_json::Value>,
) -> AppError {
    let Some(raw_code) = extensions.get(ERROR_CODE_EXTENSION) else {
        return AppError::internal(format!(
            "Failed to read the error code from the error response. Original error: {message}"
        ))
        .with_component(ErrComponent::RegistryClient)
        .with_reason(ErrReason::MissingErrorCode);
    };

    let Some(code) = raw_code
        .as_i64()
        .or_else(|| raw_code.as_f64().map(|f| f as i64))
    else {
        return AppError::internal(format!(
            "Failed to cast the error code from the error response. Original error: {message}"
        ))
        .with_component(ErrComponent::RegistryClient)
        .with_reason(ErrReason::MissingErrorCode);
    };

    let Some(remote) = RemoteErrorCode::from_code(code) else {
        return AppError::internal(format!(
            "Did not recognize the error code {code} from the error response. Original error: {message}"
        ))
        .with_component(ErrComponent::RegistryClient)
        .with_reason(ErrReason::UnrecognizedCode);
    };

    let err = match remote {
        RemoteErrorCode::InternalError | RemoteErrorCode::UnknownError => {
            AppError::internal(message)
        }
        RemoteErrorCode::InsufficientScopes | RemoteErrorCode::Unauthorized => {
            AppError::bad_gateway(message)
        }
        RemoteErrorCode::NotFound
        | RemoteErrorCode::NotUnique
        | RemoteErrorCode::InvalidData
        | RemoteErrorCode::InvalidOperation => AppError::bad_request(message),
        RemoteErrorCode::TenantRequired | RemoteErrorCode::TenantNotFound => {
            AppError::invalid_tenant(message)
        }
    };

    err.with_component(ErrComponent::RegistryClient)
        .with_reason(remote.reason())
}
