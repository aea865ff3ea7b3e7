use std::future::Future;
use std::io;
use std::{panic, thread};

use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tokio::task;

/// Execution context used to run async driver code from blocking callers.
///
/// A dedicated context owns a one-worker runtime so background I/O tasks
/// (connection drivers, pooled HTTP connections) keep making progress between
/// blocking calls. A shared context reuses the runtime a resource was opened on.
#[derive(Debug)]
pub struct BlockingContext {
    kind: ContextKind,
}

#[derive(Debug)]
enum ContextKind {
    Dedicated(Option<Runtime>),
    Shared(Handle),
}

impl BlockingContext {
    /// Build a context backed by its own runtime.
    pub fn dedicated() -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("uow-blocking")
            .enable_all()
            .build()?;
        Ok(Self {
            kind: ContextKind::Dedicated(Some(runtime)),
        })
    }

    /// Capture the runtime the caller is currently running on.
    ///
    /// Falls back to a dedicated runtime when called outside of one.
    pub fn current() -> io::Result<Self> {
        match Handle::try_current() {
            Ok(handle) => Ok(Self {
                kind: ContextKind::Shared(handle),
            }),
            Err(_) => Self::dedicated(),
        }
    }

    /// Drive `future` to completion, blocking the calling thread.
    ///
    /// Inside a multi-threaded runtime the worker is handed off with
    /// `block_in_place`; inside a current-thread runtime the future is driven
    /// from a scoped helper thread instead. A context shared with a
    /// current-thread runtime cannot be blocked on at all, because only that
    /// runtime's own thread drives its I/O.
    pub fn block_on<F>(&self, future: F) -> io::Result<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        match &self.kind {
            ContextKind::Dedicated(Some(runtime)) => Ok(off_runtime(|| runtime.block_on(future))),
            ContextKind::Dedicated(None) => Err(io::Error::new(
                io::ErrorKind::Other,
                "blocking runtime has been shut down",
            )),
            ContextKind::Shared(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::CurrentThread => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "resource is bound to a current-thread runtime; use the async API",
                )),
                _ => Ok(off_runtime(|| handle.block_on(future))),
            },
        }
    }
}

/// Run `run` somewhere it is allowed to block.
fn off_runtime<T, R>(run: R) -> T
where
    R: FnOnce() -> T + Send,
    T: Send,
{
    match Handle::try_current() {
        Err(_) => run(),
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => {
            thread::scope(|scope| match scope.spawn(run).join() {
                Ok(output) => output,
                Err(payload) => panic::resume_unwind(payload),
            })
        }
        Ok(_) => task::block_in_place(run),
    }
}

impl Drop for BlockingContext {
    fn drop(&mut self) {
        // Dropping a runtime normally waits for its workers, which panics
        // inside async code.
        if let ContextKind::Dedicated(runtime) = &mut self.kind {
            if let Some(runtime) = runtime.take() {
                runtime.shutdown_background();
            }
        }
    }
}
