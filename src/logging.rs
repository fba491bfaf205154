use crate::error::Error;

/// Installs `env_logger` with an `info` default, overridable through
/// `RUST_LOG`. Later calls are ignored.
pub fn init() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}

/// Logger for unit and integration tests: output is captured by the test
/// harness and repeated initialisation is harmless.
pub fn init_for_tests() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}

/// Logs a failure that happened while tearing down (closing a transport,
/// removing an identity). Teardown failures are never propagated so they
/// cannot mask the failure that ended the run.
pub fn log_teardown_failure(what: &str, err: &Error) {
    match err.context() {
        Some(context) => log::warn!("Teardown step '{}' failed [{}]: {}", what, context, err),
        None => log::warn!("Teardown step '{}' failed: {}", what, err),
    }
}
