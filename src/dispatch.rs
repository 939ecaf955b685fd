use std::future::Future;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, warn};

/// Supervised set of in-flight notification deliveries. The scan loop does
/// not wait on them; shutdown drains them with a bound.
#[derive(Default)]
pub struct DispatchGroup {
    tasks: JoinSet<()>,
}

impl DispatchGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&mut self, dispatch: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(dispatch);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Collects finished deliveries without waiting. Returns how many were
    /// collected.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(join_error) = result {
                error!(error = %join_error, "notification dispatch task failed");
            }
            reaped += 1;
        }
        reaped
    }

    /// Waits for every in-flight delivery up to `timeout`; whatever is still
    /// running afterwards is aborted. Returns false when the bound was hit.
    pub async fn drain(&mut self, timeout: Duration) -> bool {
        let pending = self.tasks.len();
        let finished = tokio::time::timeout(timeout, async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(join_error) = result {
                    error!(error = %join_error, "notification dispatch task failed");
                }
            }
        })
        .await
        .is_ok();

        if !finished {
            warn!(
                pending,
                abandoned = self.tasks.len(),
                "notification dispatch drain timed out"
            );
            self.tasks.abort_all();
        }
        finished
    }
}
