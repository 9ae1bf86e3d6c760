//! Process-wide transport runtime
//!
//! Every open endpoint holds an `Arc<TransportRuntime>`. The runtime is built
//! when the first endpoint opens and shut down when the last one is dropped.

use std::future::Future;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::NetworkError;

/// Worker threads driving socket I/O and command responders
const WORKER_THREADS: usize = 2;

static SHARED_RUNTIME: Mutex<Weak<TransportRuntime>> = parking_lot::const_mutex(Weak::new());

/// Shared async runtime backing all transport endpoints
pub struct TransportRuntime {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl TransportRuntime {
    /// Get the shared runtime, starting it if no endpoint currently holds it
    pub fn acquire() -> Result<Arc<Self>, NetworkError> {
        let mut shared = SHARED_RUNTIME.lock();
        if let Some(runtime) = shared.upgrade() {
            return Ok(runtime);
        }

        let runtime = Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("admbridge-io")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let runtime = Arc::new(Self {
            runtime: Some(runtime),
            handle,
        });
        *shared = Arc::downgrade(&runtime);

        info!("Transport runtime started ({} workers)", WORKER_THREADS);
        Ok(runtime)
    }

    /// Whether any endpoint currently keeps the shared runtime alive
    pub fn is_running() -> bool {
        SHARED_RUNTIME.lock().strong_count() > 0
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Spawn a task on the transport workers
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Drive a future to completion from a non-async thread
    ///
    /// Must not be called from inside a task on any tokio runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }
}

impl Drop for TransportRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
            debug!("Transport runtime shut down");
        }
    }
}
