//! Promises, their combinators, and the worker pool that runs them.
//!
//! A [`Promise`] is a cloneable handle to one asynchronous result. It is pending until its
//! [`Resolver`] (or the task that [`WorkerPool::spawn`] created for it) stores exactly one
//! outcome, after which it never changes. Continuations such as [`Promise::then_accept`] and
//! [`Promise::then_combine`] run on the pool and produce new promises; cancelling a derived
//! promise stops its own task and leaves its sources alone.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Map, Shared};
use once_cell::sync::Lazy;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::error::ClientError;
use crate::utils::ensure;

const DEFAULT_THREAD_NAME: &str = "micro-client-worker";

static SHARED_POOL: Lazy<WorkerPool> =
    Lazy::new(|| WorkerPool::builder().build().expect("failed to start the shared micro-client worker pool"));

type Outcome<T> = Result<T, ClientError>;

type Completion<T> = Shared<BoxFuture<'static, Arc<Outcome<T>>>>;

/// Handle to a result that becomes available later.
///
/// Clones observe the same result. With `T: Clone` the promise can be `.await`ed from async
/// code as well as waited on with [`Promise::wait`].
pub struct Promise<T> {
    completion: Completion<T>,
    control: Arc<Control<T>>,
    pool: WorkerPool,
}

/// The producing half: whoever takes the sender first decides the outcome.
struct Control<T> {
    sender: Mutex<Option<oneshot::Sender<Outcome<T>>>>,
    cancel: CancellationToken,
}

impl<T> Control<T> {
    fn take_sender(&self) -> Option<oneshot::Sender<Outcome<T>>> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Stores `result` unless an outcome is already present. Returns whether it was stored.
    fn complete(&self, result: Outcome<T>) -> bool {
        self.take_sender().is_some_and(|sender| sender.send(result).is_ok())
    }
}

impl<T: Send + 'static> Promise<T> {
    fn pending(pool: WorkerPool) -> Self {
        let (sender, receiver) = oneshot::channel();
        // a sender dropped without sending means nobody will ever produce the value
        let completion = receiver
            .map(|received| Arc::new(received.unwrap_or_else(|oneshot::Canceled| Err(ClientError::Cancelled))))
            .boxed()
            .shared();
        let control = Control { sender: Mutex::new(Some(sender)), cancel: CancellationToken::new() };
        Self { completion, control: Arc::new(control), pool }
    }
}

impl<T> Promise<T> {
    /// Fails the promise with [`ClientError::Cancelled`] if it is still pending and stops the
    /// task producing it. Returns false when the promise had already completed.
    pub fn cancel(&self) -> bool {
        let cancelled = self.control.complete(Err(ClientError::Cancelled));
        if cancelled {
            trace!("promise cancelled");
            self.control.cancel.cancel();
        }
        cancelled
    }

    pub fn is_done(&self) -> bool {
        self.peek().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.peek().is_some_and(|outcome| matches!(*outcome, Err(ClientError::Cancelled)))
    }

    /// The pool continuations of this promise run on.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    fn peek(&self) -> Option<Arc<Outcome<T>>> {
        self.completion.clone().now_or_never()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The outcome, if the promise has completed.
    pub fn try_result(&self) -> Option<Outcome<T>> {
        self.peek().map(Arc::unwrap_or_clone)
    }

    /// Blocks the calling thread until the promise completes.
    ///
    /// Must not be called from a worker of the pool that produces the promise.
    pub fn wait(&self) -> Outcome<T> {
        if let Some(result) = self.try_result() {
            return result;
        }
        if Handle::try_current().is_ok() {
            warn!("blocking wait on a promise from inside an async runtime");
        }
        futures::executor::block_on(self.clone().into_future())
    }

    /// Maps a fulfilled value with `f` on a worker; failures skip `f` and propagate.
    pub fn then_apply<U, F>(&self, f: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let source = self.clone();
        self.pool.spawn(async move { source.await.map(f) })
    }

    /// Runs `f` with the fulfilled value; failures skip `f` and propagate.
    pub fn then_accept<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.then_apply(f)
    }

    /// Chains a dependent asynchronous step.
    pub fn then_compose<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        let source = self.clone();
        self.pool.spawn(async move {
            let next = f(source.await?);
            next.await
        })
    }

    /// Runs `f` exactly once after both promises are fulfilled.
    ///
    /// If either fails the result fails with the first failure observed. When both fail at
    /// about the same time, which one is reported is unspecified.
    pub fn then_combine<U, R, F>(&self, other: &Promise<U>, f: F) -> Promise<R>
    where
        U: Clone + Send + Sync + 'static,
        R: Send + 'static,
        F: FnOnce(T, U) -> R + Send + 'static,
    {
        let left = self.clone();
        let right = other.clone();
        self.pool.spawn(async move {
            let (left, right) = futures::future::try_join(left.into_future(), right.into_future()).await?;
            Ok(f(left, right))
        })
    }
}

impl<T: Clone> IntoFuture for Promise<T> {
    type Output = Outcome<T>;
    type IntoFuture = Map<Completion<T>, fn(Arc<Outcome<T>>) -> Outcome<T>>;

    fn into_future(self) -> Self::IntoFuture {
        self.completion.map(Arc::unwrap_or_clone as fn(_) -> _)
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self { completion: self.completion.clone(), control: Arc::clone(&self.control), pool: self.pool.clone() }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.peek().as_deref() {
            None => "pending",
            Some(Ok(_)) => "fulfilled",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("Promise").field("state", &state).finish_non_exhaustive()
    }
}

/// The producing side of a [`Promise`].
///
/// Dropping a resolver that never resolved fails its promise with [`ClientError::Cancelled`].
pub struct Resolver<T> {
    control: Option<Arc<Control<T>>>,
}

impl<T> Resolver<T> {
    /// Stores `result`. Returns false if the promise was already completed, e.g. cancelled.
    pub fn resolve(mut self, result: Outcome<T>) -> bool {
        self.control.take().is_some_and(|control| control.complete(result))
    }

    pub fn fulfill(self, value: T) -> bool {
        self.resolve(Ok(value))
    }

    pub fn fail(self, error: ClientError) -> bool {
        self.resolve(Err(error))
    }

    /// Resolves once the consumer cancels the promise.
    pub async fn cancelled(&self) {
        if let Some(control) = &self.control {
            control.cancel.cancelled().await;
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if let Some(control) = self.control.take() {
            drop(control.take_sender());
        }
    }
}

impl<T> fmt::Debug for Resolver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").field("resolved", &self.control.is_none()).finish()
    }
}

/// The multi-threaded runtime that runs dispatches, continuations and WebSocket receive loops.
///
/// Cheap to clone; every clone drives the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl WorkerPool {
    /// The process-wide pool, started on first use.
    pub fn shared() -> WorkerPool {
        SHARED_POOL.clone()
    }

    /// Starts a dedicated pool with `worker_threads` workers.
    pub fn new(worker_threads: usize) -> io::Result<WorkerPool> {
        Self::builder().worker_threads(worker_threads).build()
    }

    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder::new()
    }

    /// Runs work on an existing runtime instead of owning one.
    pub fn from_handle(handle: Handle) -> WorkerPool {
        WorkerPool { inner: Arc::new(PoolInner { runtime: None, handle }) }
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    /// Runs `future` on the pool and exposes its output as a promise.
    ///
    /// Cancelling the promise drops the future at its next suspension point.
    pub fn spawn<T, F>(&self, future: F) -> Promise<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, ClientError>> + Send + 'static,
    {
        let (resolver, promise) = self.promise();
        let cancel = promise.control.cancel.clone();

        self.inner.handle.spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                result = future => {
                    resolver.resolve(result);
                }
            }
        });
        promise
    }

    /// A pending promise and the resolver that completes it.
    pub fn promise<T: Send + 'static>(&self) -> (Resolver<T>, Promise<T>) {
        let promise = Promise::pending(self.clone());
        let resolver = Resolver { control: Some(Arc::clone(&promise.control)) };
        (resolver, promise)
    }

    pub fn completed<T: Send + 'static>(&self, value: T) -> Promise<T> {
        let promise = Promise::pending(self.clone());
        promise.control.complete(Ok(value));
        promise
    }

    pub fn failed<T: Send + 'static>(&self, error: ClientError) -> Promise<T> {
        let promise = Promise::pending(self.clone());
        promise.control.complete(Err(error));
        promise
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool").field("owns_runtime", &self.inner.runtime.is_some()).finish()
    }
}

#[derive(Debug)]
pub struct WorkerPoolBuilder {
    worker_threads: Option<usize>,
    thread_name: String,
}

impl WorkerPoolBuilder {
    fn new() -> Self {
        Self { worker_threads: None, thread_name: DEFAULT_THREAD_NAME.to_string() }
    }

    /// Number of worker threads; defaults to the number of cores. Zero is rejected by
    /// [`WorkerPoolBuilder::build`].
    pub fn worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = Some(worker_threads);
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn build(self) -> io::Result<WorkerPool> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name(self.thread_name);
        if let Some(worker_threads) = self.worker_threads {
            ensure!(worker_threads > 0, io::Error::new(io::ErrorKind::InvalidInput, "worker_threads must be non-zero"));
            builder.worker_threads(worker_threads);
        }

        let runtime = builder.build()?;
        let handle = runtime.handle().clone();
        Ok(WorkerPool { inner: Arc::new(PoolInner { runtime: Some(runtime), handle }) })
    }
}
