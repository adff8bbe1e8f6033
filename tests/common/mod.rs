//! Shared fixtures for the end-to-end tests.

use std::path::PathBuf;

use ocpp_runtime::messages::{CP_INITIATED_ACTIONS, CS_INITIATED_ACTIONS};

/// Install the test subscriber; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Write a permissive schema file pair for every action into a temp dir.
///
/// The end-to-end tests exercise transport and dispatch, not the OCPP
/// schema corpus (the validator has its own unit tests), so `{}` accepts
/// every payload.
pub fn schemas_dir() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("temp dir");
    for action in CP_INITIATED_ACTIONS.iter().chain(CS_INITIATED_ACTIONS) {
        for name in [format!("{action}.json"), format!("{action}Response.json")] {
            std::fs::write(dir.path().join(name), "{}").expect("schema file");
        }
    }
    let path = dir.path().to_path_buf();
    (dir, path)
}

/// Poll until `predicate` holds or the timeout elapses.
pub async fn wait_until(timeout_ms: u64, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    predicate()
}
