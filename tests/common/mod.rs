#![allow(dead_code)]

pub mod fault_injection;
pub mod research_mocks;

use durable_research::providers::Provider;
use durable_research::providers::sqlite::SqliteProvider;
use durable_research::{Event, RuntimeOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Runtime options tuned for tests: fast polling, short locks.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(2),
        orchestrator_lock_timeout: Duration::from_secs(5),
        worker_lock_timeout: Duration::from_secs(5),
        worker_lock_renewal_buffer: Duration::from_secs(1),
        ..Default::default()
    }
}

pub async fn create_sqlite_store_memory() -> Arc<dyn Provider> {
    Arc::new(SqliteProvider::new_in_memory().await.unwrap())
}

pub async fn create_sqlite_store_disk() -> (Arc<dyn Provider>, TempDir) {
    let td = tempfile::tempdir().unwrap();
    let url = sqlite_url(&td);
    let store = Arc::new(SqliteProvider::new(&url, None).await.unwrap()) as Arc<dyn Provider>;
    (store, td)
}

pub fn sqlite_url(td: &TempDir) -> String {
    format!("sqlite:{}?mode=rwc", td.path().join("test.db").display())
}

pub async fn wait_for_history<F>(store: Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count_kind(hist: &[Event], type_name: &str) -> usize {
    hist.iter().filter(|e| e.type_name() == type_name).count()
}
