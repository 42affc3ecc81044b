use std::error::Error;

use super::*;

#[test]
fn test_append_renders_newest_context_first() {
    let err = AppError::bad_gateway("some error")
        .with_component(ErrComponent::RegistryClient)
        .with_reason(ErrReason::InvalidData)
        .append("Failed to request")
        .append("error deleting cluster from registry");

    assert_eq!(
        err.to_string(),
        "error deleting cluster from registry, Failed to request, some error"
    );
    assert_eq!(err.root_message(), "some error");
}

#[test]
fn test_append_preserves_classification() {
    let err = AppError::internal("exists err")
        .with_component(ErrComponent::Persistence)
        .with_reason(ErrReason::DbNotFound);
    let wrapped = err.append("outer").append("outermost");

    assert_eq!(wrapped.code(), ErrCode::Internal);
    assert_eq!(wrapped.component(), ErrComponent::Persistence);
    assert_eq!(wrapped.reason(), ErrReason::DbNotFound);
}

#[test]
fn test_defaults_are_unspecified() {
    let err = AppError::internal("boom");
    assert_eq!(err.component(), ErrComponent::Unspecified);
    assert_eq!(err.reason(), ErrReason::Unspecified);
    assert!(err.source().is_none());
}

#[test]
fn test_source_is_exposed() {
    let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
    let err = AppError::internal("write failed").with_source(io);

    let source = err.source().expect("source attached");
    assert_eq!(source.to_string(), "disk gone");
}

#[test]
fn test_only_bad_request_is_unrecoverable() {
    assert!(ErrCode::Internal.is_recoverable());
    assert!(ErrCode::BadGateway.is_recoverable());
    assert!(ErrCode::InvalidTenant.is_recoverable());
    assert!(!ErrCode::BadRequest.is_recoverable());
    assert!(!AppError::bad_request("missing config").is_recoverable());
}

#[test]
fn test_component_and_reason_strings_parse_back() {
    for component in [
        ErrComponent::Unspecified,
        ErrComponent::InfraClient,
        ErrComponent::RegistryClient,
        ErrComponent::RegistryTransport,
        ErrComponent::RegistryAuth,
        ErrComponent::Persistence,
        ErrComponent::Internal,
    ] {
        assert_eq!(component.as_str().parse::<ErrComponent>(), Ok(component));
    }

    assert_eq!("tenant-not-found".parse::<ErrReason>(), Ok(ErrReason::TenantNotFound));
    assert_eq!("db-internal".parse::<ErrReason>(), Ok(ErrReason::DbInternal));
    assert!("no-such-reason".parse::<ErrReason>().is_err());
}
