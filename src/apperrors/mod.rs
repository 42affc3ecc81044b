//! Classified application errors.
//!
//! Every failure that reaches the operation engine is an [`AppError`]. The
//! `(code, component, reason)` triple is fixed when the error is created and
//! survives any number of [`AppError::append`] calls, so callers branch on
//! failure kind without inspecting the human-readable message.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Failure category. Drives retry decisions in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrCode {
    /// Unexpected condition, including nil or mismatched collaborator responses.
    Internal,
    /// Caller or configuration defect. Never retried.
    BadRequest,
    /// Upstream authentication or permission failure.
    BadGateway,
    /// Tenant missing or unknown on the registry side.
    InvalidTenant,
}

impl ErrCode {
    /// Whether an error of this category may be retried.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ErrCode::BadRequest)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrCode::Internal => "internal",
            ErrCode::BadRequest => "bad-request",
            ErrCode::BadGateway => "bad-gateway",
            ErrCode::InvalidTenant => "invalid-tenant",
        }
    }
}

impl fmt::Display for ErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subsystem that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrComponent {
    #[default]
    Unspecified,
    /// Cluster-infrastructure provider.
    InfraClient,
    /// Errors reported by the remote registry service.
    RegistryClient,
    /// Local encoding and transport failures talking to the registry.
    RegistryTransport,
    /// Token acquisition for the registry.
    RegistryAuth,
    /// Database layer.
    Persistence,
    /// Failures raised by the engine itself (unknown stage, timeout, regression).
    Internal,
}

impl ErrComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrComponent::Unspecified => "",
            ErrComponent::InfraClient => "infra-client",
            ErrComponent::RegistryClient => "registry-client",
            ErrComponent::RegistryTransport => "registry-client-transport",
            ErrComponent::RegistryAuth => "registry-client-auth",
            ErrComponent::Persistence => "persistence",
            ErrComponent::Internal => "internal-validation",
        }
    }
}

impl fmt::Display for ErrComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrComponent {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" => ErrComponent::Unspecified,
            "infra-client" => ErrComponent::InfraClient,
            "registry-client" => ErrComponent::RegistryClient,
            "registry-client-transport" => ErrComponent::RegistryTransport,
            "registry-client-auth" => ErrComponent::RegistryAuth,
            "persistence" => ErrComponent::Persistence,
            "internal-validation" => ErrComponent::Internal,
            other => return Err(UnknownVariant(other.to_string())),
        })
    }
}

/// Fine-grained, machine-matchable failure cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrReason {
    #[default]
    Unspecified,
    Internal,
    UnknownError,
    NotFound,
    NotUnique,
    InvalidData,
    InsufficientScopes,
    TenantRequired,
    TenantNotFound,
    Unauthorized,
    InvalidOperation,
    UnrecognizedCode,
    MissingErrorCode,
    NilResponse,
    IdMismatch,
    InvalidResponse,
    DbInternal,
    DbNotFound,
    StageTimeout,
    UnknownStage,
    StageRegression,
}

impl ErrReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrReason::Unspecified => "",
            ErrReason::Internal => "internal",
            ErrReason::UnknownError => "unknown-error",
            ErrReason::NotFound => "not-found",
            ErrReason::NotUnique => "not-unique",
            ErrReason::InvalidData => "invalid-data",
            ErrReason::InsufficientScopes => "insufficient-scopes",
            ErrReason::TenantRequired => "tenant-required",
            ErrReason::TenantNotFound => "tenant-not-found",
            ErrReason::Unauthorized => "unauthorized",
            ErrReason::InvalidOperation => "invalid-operation",
            ErrReason::UnrecognizedCode => "unrecognized-code",
            ErrReason::MissingErrorCode => "missing-error-code",
            ErrReason::NilResponse => "nil-response",
            ErrReason::IdMismatch => "id-mismatch",
            ErrReason::InvalidResponse => "invalid-response",
            ErrReason::DbInternal => "db-internal",
            ErrReason::DbNotFound => "db-not-found",
            ErrReason::StageTimeout => "stage-timeout",
            ErrReason::UnknownStage => "unknown-stage",
            ErrReason::StageRegression => "stage-regression",
        }
    }
}

impl fmt::Display for ErrReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrReason {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "" => ErrReason::Unspecified,
            "internal" => ErrReason::Internal,
            "unknown-error" => ErrReason::UnknownError,
            "not-found" => ErrReason::NotFound,
            "not-unique" => ErrReason::NotUnique,
            "invalid-data" => ErrReason::InvalidData,
            "insufficient-scopes" => ErrReason::InsufficientScopes,
            "tenant-required" => ErrReason::TenantRequired,
            "tenant-not-found" => ErrReason::TenantNotFound,
            "unauthorized" => ErrReason::Unauthorized,
            "invalid-operation" => ErrReason::InvalidOperation,
            "unrecognized-code" => ErrReason::UnrecognizedCode,
            "missing-error-code" => ErrReason::MissingErrorCode,
            "nil-response" => ErrReason::NilResponse,
            "id-mismatch" => ErrReason::IdMismatch,
            "invalid-response" => ErrReason::InvalidResponse,
            "db-internal" => ErrReason::DbInternal,
            "db-not-found" => ErrReason::DbNotFound,
            "stage-timeout" => ErrReason::StageTimeout,
            "unknown-stage" => ErrReason::UnknownStage,
            "stage-regression" => ErrReason::StageRegression,
            other => return Err(UnknownVariant(other.to_string())),
        })
    }
}

/// Returned when a persisted component or reason string is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown variant: {0}")]
pub struct UnknownVariant(pub String);

/// A classified failure with an appendable message chain.
#[derive(Debug, Clone)]
pub struct AppError {
    code: ErrCode,
    component: ErrComponent,
    reason: ErrReason,
    message: String,
    /// Context added by callers, oldest first.
    context: Vec<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl AppError {
    fn new(code: ErrCode, message: impl Into<String>) -> Self {
        Self {
            code,
            component: ErrComponent::Unspecified,
            reason: ErrReason::Unspecified,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrCode::Internal, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrCode::BadRequest, message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(ErrCode::BadGateway, message)
    }

    pub fn invalid_tenant(message: impl Into<String>) -> Self {
        Self::new(ErrCode::InvalidTenant, message)
    }

    pub fn with_component(mut self, component: ErrComponent) -> Self {
        self.component = component;
        self
    }

    pub fn with_reason(mut self, reason: ErrReason) -> Self {
        self.reason = reason;
        self
    }

    /// Attach the underlying error. Does not change the classification.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    /// Add caller context in front of the message, keeping the classification.
    pub fn append(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    pub fn code(&self) -> ErrCode {
        self.code
    }

    pub fn component(&self) -> ErrComponent {
        self.component
    }

    pub fn reason(&self) -> ErrReason {
        self.reason
    }

    /// The original message, without appended context.
    pub fn root_message(&self) -> &str {
        &self.message
    }

    pub fn is_recoverable(&self) -> bool {
        self.code.is_recoverable()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for context in self.context.iter().rev() {
            write!(f, "{context}, ")?;
        }
        f.write_str(&self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests;
