//! Installs a global subscriber, so it lives in its own test binary

use multicloud_discovery::{init_tracing, LogFormat};

#[test]
fn test_second_init_is_an_error() {
    assert!(init_tracing(LogFormat::Json).is_ok());
    assert!(init_tracing(LogFormat::Pretty).is_err());
}
