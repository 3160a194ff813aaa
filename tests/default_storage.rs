//! Process-wide default store
//!
//! Kept in its own test binary with a single test: the default store is
//! global state shared by every test in the process.

use loopscope::{get_storage, monitor, reset_storage, set_storage, SqliteStorage, TraceQuery, TraceStore};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_default_store_lifecycle() {
    let dir = tempfile::tempdir().unwrap();

    let explicit = Arc::new(SqliteStorage::open(dir.path().join("explicit.db")).unwrap());
    set_storage(explicit.clone());

    let double = monitor(|x: i64| x * 2);
    assert_eq!(double(21), 42);

    let traces = explicit.list_traces(&TraceQuery::new()).unwrap();
    assert_eq!(traces.len(), 1);
    assert_eq!(
        traces[0].metadata["function_name"],
        json!("test_default_store_lifecycle")
    );
    assert_eq!(traces[0].metadata["is_async"], json!(false));

    // Rebuilt from configuration after a reset
    std::env::set_var("LOOPSCOPE_DB_PATH", dir.path().join("configured.db"));
    reset_storage();
    let configured = get_storage();
    assert_eq!(configured.count(None).unwrap(), 0);
    double(1);
    assert_eq!(configured.count(None).unwrap(), 1);
    assert!(dir.path().join("configured.db").exists());
    assert_eq!(explicit.count(None).unwrap(), 1);

    reset_storage();
    std::env::remove_var("LOOPSCOPE_DB_PATH");
}
