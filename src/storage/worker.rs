use crate::core::{Result, TetherError};
use crate::storage::persistence::FlushPolicy;
use crate::storage::registry::SnapshotRegistry;
use log::warn;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

/// Lower bound for the debounce interval.
const MIN_INTERVAL_MS: u64 = 10;

/// Background task writing the registry whenever it has been marked dirty.
pub struct FlushWorker {
    registry: Arc<SnapshotRegistry>,
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    /// Stops the worker, waits for it, then writes whatever is still dirty.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| TetherError::HostError(format!("flush worker join: {}", err)))?;
        }

        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || registry.flush())
            .await
            .map_err(|err| TetherError::HostError(format!("final flush join: {}", err)))?
    }

    /// Signals the worker without waiting for it. The caller is responsible
    /// for the final flush.
    pub fn halt(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.join_handle.take();
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns the debounced flush worker. Must run inside a Tokio runtime.
pub fn spawn_flush_worker(registry: Arc<SnapshotRegistry>) -> Result<FlushWorker> {
    let layer = registry.persistence().ok_or_else(|| {
        TetherError::ConfigError("flush worker needs an initialized persistence layer".to_string())
    })?;
    let interval_ms = match layer.policy() {
        FlushPolicy::Debounced { interval_ms } => interval_ms.max(MIN_INTERVAL_MS),
        FlushPolicy::Immediate => {
            return Err(TetherError::ConfigError(
                "flush worker requires FlushPolicy::Debounced".to_string(),
            ));
        }
    };

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let registry_for_worker = Arc::clone(&registry);

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(Duration::from_millis(interval_ms)) => {
                    if !layer.is_dirty() {
                        continue;
                    }
                    let registry = Arc::clone(&registry_for_worker);
                    match tokio::task::spawn_blocking(move || registry.flush()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => warn!("Debounced flush failed: {}", err),
                        Err(err) => warn!("Debounced flush task failed: {}", err),
                    }
                }
            }
        }
    });

    Ok(FlushWorker {
        registry,
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    })
}
