use beskar::core::BeskarError;

#[test]
fn test_http_status_taxonomy() {
    assert_eq!(BeskarError::InvalidArgument("x".into()).http_status(), 400);
    assert_eq!(BeskarError::FailedPrecondition("x".into()).http_status(), 400);
    assert_eq!(BeskarError::Unauthorized("x".into()).http_status(), 401);
    assert_eq!(BeskarError::NotFound("x".into()).http_status(), 404);
    assert_eq!(BeskarError::AlreadyExists("x".into()).http_status(), 409);
    assert_eq!(BeskarError::Unavailable("x".into()).http_status(), 503);
    assert_eq!(BeskarError::Internal("x".into()).http_status(), 500);
    assert_eq!(BeskarError::Storage("x".into()).http_status(), 500);
}

#[test]
fn test_waiting_failures_are_distinct() {
    let timeout = BeskarError::WaitingTimeout("pkg".into());
    let interruption = BeskarError::WaitingInterruption("pkg".into());
    assert_ne!(timeout.to_string(), interruption.to_string());
    assert!(timeout.to_string().contains("timeout"));
    assert!(interruption.to_string().contains("interruption"));
}

#[test]
fn test_errors_clone_for_waiter_fanout() {
    let err = BeskarError::NotFound("pkg".into());
    let cloned = err.clone();
    assert_eq!(err.to_string(), cloned.to_string());

    let io: BeskarError = std::io::Error::other("disk gone").into();
    assert!(io.clone().to_string().contains("disk gone"));
}
