//! Engine backed by a tokio multi-thread runtime

use super::{Executor, Task};
use parking_lot::Mutex;
use rbdio_common::{EngineOptions, Result};
use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the engine owning the current worker thread (0 = none)
    static CURRENT_ENGINE: Cell<u64> = const { Cell::new(0) };
}

/// Shared multi-worker engine
///
/// Worker threads tag themselves with the engine id so [`Executor::dispatch`]
/// can tell whether it already runs inside this engine. The serialized
/// sub-context is a single task draining an unbounded channel.
pub struct AsyncEngine {
    id: u64,
    runtime: Option<Runtime>,
    handle: Handle,
    api_tx: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    api_worker: Option<JoinHandle<()>>,
}

impl AsyncEngine {
    /// Start a runtime with `options.threads` workers
    pub fn new(options: &EngineOptions) -> Result<Self> {
        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        let runtime = Builder::new_multi_thread()
            .worker_threads(options.threads.max(1))
            .thread_name("rbdio-engine")
            .on_thread_start(move || CURRENT_ENGINE.with(|current| current.set(id)))
            .on_thread_stop(|| CURRENT_ENGINE.with(|current| current.set(0)))
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();

        let (api_tx, mut api_rx) = mpsc::unbounded_channel::<Task>();
        let api_worker = runtime.spawn(async move {
            while let Some(task) = api_rx.recv().await {
                task();
            }
        });

        debug!("Started engine {} with {} workers", id, options.threads);
        Ok(Self {
            id,
            runtime: Some(runtime),
            handle,
            api_tx: Mutex::new(Some(api_tx)),
            api_worker: Some(api_worker),
        })
    }

    fn in_context(&self) -> bool {
        CURRENT_ENGINE.with(|current| current.get()) == self.id
    }
}

impl Executor for AsyncEngine {
    fn dispatch(&self, task: Task) {
        if self.in_context() {
            task();
        } else {
            self.post(task);
        }
    }

    fn post(&self, task: Task) {
        drop(self.handle.spawn(async move { task() }));
    }

    fn post_api(&self, task: Task) {
        match self.api_tx.lock().as_ref() {
            Some(tx) => {
                if tx.send(task).is_err() {
                    warn!("Engine {} api strand closed, dropping task", self.id);
                }
            }
            None => warn!("Engine {} shutting down, dropping api task", self.id),
        }
    }

    fn post_after(&self, delay: Duration, task: Task) {
        drop(self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        }));
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

impl Drop for AsyncEngine {
    fn drop(&mut self) {
        // Closing the channel lets the strand worker exit once drained
        self.api_tx.lock().take();

        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            warn!(
                "Engine {} dropped inside a runtime, shutting down in background",
                self.id
            );
            runtime.shutdown_background();
            return;
        }
        if let Some(worker) = self.api_worker.take()
            && let Err(e) = runtime.block_on(worker)
        {
            warn!("Engine {} api strand failed: {}", self.id, e);
        }
        runtime.shutdown_timeout(Duration::from_secs(5));
        debug!("Stopped engine {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    fn engine() -> Arc<AsyncEngine> {
        Arc::new(AsyncEngine::new(&EngineOptions { threads: 2 }).unwrap())
    }

    #[test]
    fn test_post_runs_on_worker() {
        let engine = engine();
        let (tx, rx) = std_mpsc::channel();
        engine.post(Box::new(move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("rbdio-engine"));
    }

    #[test]
    fn test_dispatch_inline_inside_engine() {
        let engine = engine();
        let (tx, rx) = std_mpsc::channel();
        let inner = engine.clone();
        engine.post(Box::new(move || {
            let ran = Arc::new(AtomicUsize::new(0));
            let ran2 = ran.clone();
            inner.dispatch(Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }));
            // dispatch ran synchronously on this worker
            tx.send(ran.load(Ordering::SeqCst)).unwrap();
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
    }

    #[test]
    fn test_api_strand_is_fifo_and_serialized() {
        let engine = engine();
        let running = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = std_mpsc::channel();
        for i in 0..100 {
            let running = running.clone();
            let order = order.clone();
            let tx = tx.clone();
            engine.post_api(Box::new(move || {
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                order.lock().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
                if i == 99 {
                    tx.send(()).unwrap();
                }
            }));
        }
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_drop_drains_api_strand() {
        let engine = AsyncEngine::new(&EngineOptions { threads: 1 }).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = count.clone();
            engine.post_api(Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(engine);
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_post_after_delay() {
        let engine = engine();
        let (tx, rx) = std_mpsc::channel();
        let start = Instant::now();
        engine.post_after(
            Duration::from_millis(20),
            Box::new(move || tx.send(Instant::now()).unwrap()),
        );
        let fired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(fired.duration_since(start) >= Duration::from_millis(20));
    }
}
