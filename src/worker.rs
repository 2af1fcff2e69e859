//! Dedicated execution context for one controller
//!
//! Each client or server controller owns exactly one worker: an OS thread
//! running a single-threaded tokio runtime. All session I/O and listener
//! callbacks of that controller happen on this thread.

use std::future::Future;
use std::io;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use tokio::runtime::Builder;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct Worker {
    name: String,
    stop: watch::Sender<bool>,
    done: std_mpsc::Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Start a worker thread running `task` to completion
    ///
    /// The runtime stops (dropping any tasks it spawned) when `task` returns or
    /// when the worker is told to stop.
    pub fn spawn<F, Fut>(name: &str, task: F) -> io::Result<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let (stop, mut stop_rx) = watch::channel(false);
        let (done_tx, done) = std_mpsc::channel();

        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                runtime.block_on(async move {
                    let stopped = async {
                        // A detached worker loses its stop sender; keep running then
                        if stop_rx.wait_for(|stop| *stop).await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    };
                    tokio::select! {
                        _ = task() => debug!(worker = %thread_name, "Worker task finished"),
                        _ = stopped => debug!(worker = %thread_name, "Worker stopped"),
                    }
                });
                drop(runtime);
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            name: name.to_string(),
            stop,
            done,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the worker's task returned or it was stopped
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Identity of the worker's OS thread, `None` once it was shut down
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread.as_ref().map(|t| t.thread().id())
    }

    /// True when called from this worker's own thread
    pub fn is_current(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    /// Wait up to `grace` for the task to finish on its own, then stop it
    ///
    /// Called from the worker's own thread (from inside a listener callback)
    /// the worker is detached instead, since it cannot join itself. Returns
    /// `true` if the thread was joined.
    pub fn shutdown(mut self, grace: Duration) -> bool {
        self.halt(grace)
    }

    fn halt(&mut self, grace: Duration) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };

        if thread.thread().id() == thread::current().id() {
            debug!(worker = %self.name, "Shutdown from inside the worker, detaching");
            return false;
        }

        if self.done.recv_timeout(grace).is_err() {
            debug!(worker = %self.name, "Worker still busy after {:?}, stopping", grace);
            self.stop.send_replace(true);
        }

        if thread.join().is_err() {
            warn!(worker = %self.name, "Worker thread panicked");
        }
        true
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.halt(Duration::ZERO);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}
