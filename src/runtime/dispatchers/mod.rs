//! Dispatcher implementations for Runtime
//!
//! - `orchestration`: fetches locked instances and runs one turn each
//! - `worker`: executes activities with retry and acks their completions

mod orchestration;
mod worker;

use tokio::task::JoinHandle;

/// Aborts the wrapped task when dropped.
///
/// Dispatchers hold their workers this way so that aborting a dispatcher
/// also stops every worker it spawned.
pub(in crate::runtime) struct AbortOnDrop(pub(in crate::runtime) JoinHandle<()>);

impl AbortOnDrop {
    pub(in crate::runtime) async fn join(&mut self) {
        let _ = (&mut self.0).await;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
