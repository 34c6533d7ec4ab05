use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::workflow::WorkflowManager;

/// Graceful shutdown coordinator for the process engine.
///
/// On SIGINT/SIGTERM every live instance is aborted and given time to drain
/// its in-flight steps before the process exits.
pub struct ShutdownCoordinator {
    manager: Arc<WorkflowManager>,
    deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<WorkflowManager>) -> Self {
        // Aborts drain side by side within one grace period; the second covers the sweep
        let deadline = manager.config().abort_grace() * 2;
        Self { manager, deadline }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Drive `work` to completion unless a shutdown signal arrives first.
    ///
    /// Returns `None` when interrupted; live instances have been aborted by then.
    pub async fn run_until_signal<F: Future>(self, work: F) -> Result<Option<F::Output>> {
        tokio::select! {
            output = work => Ok(Some(output)),
            signal = wait_for_signal() => {
                signal?;
                info!("Shutdown signal received");
                self.shutdown_all().await?;
                Ok(None)
            }
        }
    }

    /// Abort every live instance, bounded by the shutdown deadline
    pub async fn shutdown_all(&self) -> Result<()> {
        info!(deadline_ms = self.deadline.as_millis() as u64, "Initiating graceful shutdown");

        if timeout(self.deadline, self.manager.shutdown()).await.is_err() {
            warn!("Some instances did not finish draining before the shutdown deadline");
            return Err(anyhow::anyhow!("Timeout waiting for instances to drain"));
        }

        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}

/// Resolve on Ctrl-C, or SIGTERM on unix
async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            ctrl_c = tokio::signal::ctrl_c() => ctrl_c?,
            _ = terminate.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[tokio::test]
    async fn finished_work_is_returned() {
        let manager = Arc::new(WorkflowManager::new(EngineConfig::default()));
        let coordinator = ShutdownCoordinator::new(manager);

        let output = coordinator.run_until_signal(async { 7 }).await.unwrap();
        assert_eq!(output, Some(7));
    }

    #[tokio::test]
    async fn shutdown_with_no_instances_is_immediate() {
        let manager = Arc::new(WorkflowManager::new(EngineConfig::default()));
        let coordinator =
            ShutdownCoordinator::new(manager).with_deadline(Duration::from_millis(50));
        coordinator.shutdown_all().await.unwrap();
    }
}
