//! Worker manager: owns a set of workers, fans out cancellation signals and
//! coordinates graceful shutdown.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::runtime::{RuntimeOptions, SandboxRuntime};
use super::store::JobStore;
use super::worker::{LineCounters, StoreObserver, Worker, WorkerConfig};
use crate::kernel::ServerKernel;

/// Owns the workers of this process.
pub struct WorkerManager {
    workers: Mutex<Vec<Arc<Worker>>>,
    handles: Mutex<Vec<JoinHandle<Result<()>>>>,
    shutdown: CancellationToken,
}

impl Default for WorkerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerManager {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Token child workers should observe for shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Launch an already-constructed worker under this manager.
    pub fn launch(&self, worker: Arc<Worker>) {
        let handle = tokio::spawn(Arc::clone(&worker).run());
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker);
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Construct and launch `count` subprocess-backed workers.
    pub fn start(&self, kernel: &Arc<ServerKernel>, store: &Arc<dyn JobStore>, count: usize) {
        info!(count, "starting workers");
        for index in 0..count {
            let counters = LineCounters::default();
            let observer = Arc::new(StoreObserver::new(Arc::clone(store), counters.clone()));
            let runtime = Arc::new(SandboxRuntime::new(
                RuntimeOptions::from(&kernel.config),
                observer,
            ));
            let worker = Worker::new(
                WorkerConfig::from_config(&kernel.config, index),
                Arc::clone(store),
                Arc::clone(&kernel.secrets),
                runtime,
                counters,
                self.shutdown.child_token(),
            );
            self.launch(worker);
        }
    }

    /// Broadcast a cancellation to every worker; the owner (if it lives in
    /// this process) trips the job's in-memory signal. Returns whether any
    /// worker owned the job.
    pub fn cancel_job(&self, job_id: Uuid) -> bool {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let mut hit = false;
        for worker in workers.iter() {
            if worker.cancel_local(job_id) {
                info!(job_id = %job_id, worker_id = %worker.id(), "cancellation delivered to worker");
                hit = true;
            }
        }
        hit
    }

    /// Signal shutdown and wait for every worker to drain and exit.
    pub async fn stop(&self) {
        info!("stopping workers");
        self.shutdown.cancel();

        let handles: Vec<_> = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "worker exited with error"),
                Err(e) => warn!(error = %e, "worker task join failed"),
            }
        }
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        info!("all workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_on_empty_manager_is_a_miss() {
        let manager = WorkerManager::new();
        assert!(!manager.cancel_job(Uuid::new_v4()));
    }
}
