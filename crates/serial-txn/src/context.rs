use crate::{Error, Store};
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

/// Observer is called with the name of a TxnContext and an operation failure.
/// It's invoked on the drain thread, before the failed operation's Completion
/// is resolved. A panicking Observer is logged and otherwise ignored.
pub type Observer = Arc<dyn Fn(&str, &Error) + Send + Sync>;

/// Options of a TxnContext.
#[derive(Clone)]
pub struct Options {
    /// Name of the context, which also names its drain thread.
    pub name: String,
    /// Observer of failed operations, if any.
    pub observer: Option<Observer>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            name: "serial-txn".to_string(),
            observer: None,
        }
    }
}

impl Options {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("name", &self.name)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// State of a TxnContext. States only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Started,
    Stopping,
    Disposed,
}

/// TxnContext owns a Store and the single transaction begun from it,
/// both of which live on a dedicated drain thread.
///
/// Callers submit operations from any thread or task. Operations are queued
/// and then invoked by the drain thread with the transaction handle,
/// one at a time and in the order in which they were submitted.
/// Each submission returns a Completion which resolves with the
/// operation's outcome.
pub struct TxnContext<S: Store> {
    name: String,
    lifecycle: Mutex<Lifecycle<S>>,
    tx: mpsc::UnboundedSender<Work<S::Txn>>,
    cancel: CancellationToken,
}

enum Lifecycle<S: Store> {
    // The Drain is held here until start() moves it onto its thread.
    Created(Drain<S>),
    Started {
        opened: watch::Receiver<Opened>,
        done: oneshot::Receiver<()>,
    },
    Stopping,
    Disposed,
}

// Outcome of beginning the transaction, which is None until it's known.
type Opened = Option<Result<(), Arc<anyhow::Error>>>;

impl<S: Store> TxnContext<S> {
    /// Build a TxnContext which will begin its transaction from `store`.
    /// Operations may be submitted right away, but won't run until start().
    pub fn new(store: S, options: Options) -> Self {
        let Options { name, observer } = options;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let drain = Drain {
            store,
            rx,
            notifier: Notifier {
                name: name.clone(),
                observer,
            },
            cancel: cancel.clone(),
        };

        Self {
            name,
            lifecycle: Mutex::new(Lifecycle::Created(drain)),
            tx,
            cancel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> State {
        match &*self.lock() {
            Lifecycle::Created(_) => State::Created,
            Lifecycle::Started { .. } => State::Started,
            Lifecycle::Stopping => State::Stopping,
            Lifecycle::Disposed => State::Disposed,
        }
    }

    /// Start the drain thread and begin the transaction, returning once it's begun.
    /// Calls after the first don't start anything further, but they also wait
    /// for the transaction to begin and return the same outcome.
    pub async fn start(&self) -> Result<(), Error> {
        let mut opened = {
            let mut lifecycle = self.lock();
            let current = std::mem::replace(&mut *lifecycle, Lifecycle::Stopping);

            match current {
                Lifecycle::Created(drain) => {
                    let (opened_tx, opened_rx) = watch::channel(None);
                    let (done_tx, done_rx) = oneshot::channel();

                    let spawned = std::thread::Builder::new()
                        .name(format!("{}-drain", self.name))
                        .spawn(move || drain.run(opened_tx, done_tx));

                    if let Err(err) = spawned {
                        // The Drain was dropped with the closure, canceling queued work.
                        *lifecycle = Lifecycle::Disposed;
                        return Err(Error::Spawn(err));
                    }
                    *lifecycle = Lifecycle::Started {
                        opened: opened_rx.clone(),
                        done: done_rx,
                    };
                    opened_rx
                }
                Lifecycle::Started { opened, done } => {
                    *lifecycle = Lifecycle::Started {
                        opened: opened.clone(),
                        done,
                    };
                    opened
                }
                other => {
                    *lifecycle = other;
                    return Err(Error::AlreadyDisposed);
                }
            }
        };

        let outcome = opened.wait_for(Option::is_some).await.map(|opened| opened.clone());

        match outcome {
            Ok(Some(Ok(()))) => Ok(()),
            Ok(Some(Err(err))) => Err(Error::BeginFailed(err)),
            // The drain thread exited without reporting.
            Ok(None) | Err(_) => Err(Error::ShutdownCanceled),
        }
    }

    /// Submit an operation to be invoked with the transaction handle.
    /// Fails immediately if the context is stopping or disposed.
    pub fn submit<T, F>(&self, op: F) -> Result<Completion<T>, Error>
    where
        F: FnOnce(&mut S::Txn) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        // The lock is held while enqueuing so that no operation can be
        // queued behind the release of the transaction.
        let lifecycle = self.lock();
        if matches!(*lifecycle, Lifecycle::Stopping | Lifecycle::Disposed) {
            return Err(Error::AlreadyDisposed);
        }

        let (reply, rx) = oneshot::channel();
        // If the drain loop has exited, the returned Work is dropped
        // and its Completion resolves as canceled.
        let _ = self.tx.send(Work::Run(Box::new(Call { op, reply })));

        Ok(Completion { rx })
    }

    /// Submit an operation and wait for its outcome.
    pub async fn run<T, F>(&self, op: F) -> Result<T, Error>
    where
        F: FnOnce(&mut S::Txn) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(op)?.await
    }

    /// Release the transaction after all previously-submitted operations
    /// have run, then stop the drain thread. Operations which are still
    /// queued are resolved as canceled. dispose() never fails, and calling
    /// it more than once is a no-op.
    pub async fn dispose(&self) {
        let (released, done) = {
            let mut lifecycle = self.lock();
            let current = std::mem::replace(&mut *lifecycle, Lifecycle::Stopping);

            match current {
                Lifecycle::Created(drain) => {
                    *lifecycle = Lifecycle::Disposed;
                    std::mem::drop(lifecycle);

                    let Drain { mut rx, .. } = drain;
                    let canceled = cancel_queued(&mut rx);
                    tracing::debug!(name = %self.name, canceled, "disposed a context that was never started");
                    return;
                }
                Lifecycle::Started { done, .. } => {
                    let (reply, released) = oneshot::channel();
                    let _ = self.tx.send(Work::Release(reply));
                    (released, done)
                }
                other => {
                    *lifecycle = other;
                    return;
                }
            }
        };

        match released.await {
            Ok(Ok(())) => tracing::debug!(name = %self.name, "released transaction"),
            Ok(Err(error)) => {
                tracing::warn!(name = %self.name, error = %format!("{error:#}"), "failed to release transaction")
            }
            Err(_) => {
                tracing::warn!(name = %self.name, "drain loop exited before the transaction was released")
            }
        }
        self.cancel.cancel();

        // The drain thread sends or drops `done` as it exits.
        let _ = done.await;

        *self.lock() = Lifecycle::Disposed;
        tracing::debug!(name = %self.name, "disposed");
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle<S>> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S: Store> Drop for TxnContext<S> {
    fn drop(&mut self) {
        // Wake a drain loop which was never disposed, so that its thread exits.
        // The transaction is dropped without being released.
        self.cancel.cancel();
    }
}

/// Completion is the outcome of a submitted operation.
/// It resolves as Error::ShutdownCanceled if the operation
/// was discarded without being run.
#[must_use = "completions do nothing unless awaited"]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
}

impl<T> Future for Completion<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or_else(|_| Err(Error::ShutdownCanceled)))
    }
}

enum Work<Txn> {
    Run(Box<dyn Job<Txn>>),
    Release(oneshot::Sender<Result<(), Error>>),
}

impl<Txn> Work<Txn> {
    fn cancel(self) {
        match self {
            Work::Run(job) => job.fail(Error::ShutdownCanceled),
            Work::Release(reply) => {
                let _ = reply.send(Err(Error::ShutdownCanceled));
            }
        }
    }
}

// Job is a type-erased operation and the sender of its Completion.
trait Job<Txn>: Send {
    // Invoke the operation and resolve its Completion, returning whether it succeeded.
    fn invoke(self: Box<Self>, txn: &mut Txn, notifier: &Notifier) -> bool;
    // Resolve the Completion with `error` without invoking the operation.
    fn fail(self: Box<Self>, error: Error);
}

struct Call<F, T> {
    op: F,
    reply: oneshot::Sender<Result<T, Error>>,
}

impl<Txn, F, T> Job<Txn> for Call<F, T>
where
    F: FnOnce(&mut Txn) -> anyhow::Result<T> + Send,
    T: Send,
{
    fn invoke(self: Box<Self>, txn: &mut Txn, notifier: &Notifier) -> bool {
        let Call { op, reply } = *self;

        match guarded(|| op(txn)) {
            Ok(value) => {
                let _ = reply.send(Ok(value));
                true
            }
            Err(err) => {
                let err = Error::OperationFailed(err);
                notifier.notify(&err);
                let _ = reply.send(Err(err));
                false
            }
        }
    }

    fn fail(self: Box<Self>, error: Error) {
        let _ = self.reply.send(Err(error));
    }
}

// Binding is the drain loop's view of its transaction handle.
enum Binding<Txn> {
    Unbound,
    Bound(Txn),
    Released,
}

impl<Txn> Binding<Txn> {
    fn get_mut(&mut self) -> Result<&mut Txn, Error> {
        match self {
            Binding::Bound(txn) => Ok(txn),
            Binding::Unbound => Err(Error::HandleNotYetBound),
            Binding::Released => Err(Error::ShutdownCanceled),
        }
    }
}

struct Notifier {
    name: String,
    observer: Option<Observer>,
}

impl Notifier {
    fn notify(&self, error: &Error) {
        tracing::warn!(error = %format!("{error:#}"), "transaction operation failed");

        let Some(observer) = &self.observer else {
            return;
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&self.name, error))) {
            tracing::error!(panic = %panic_message(&*panic), "failure observer panicked");
        }
    }
}

struct Drain<S: Store> {
    store: S,
    rx: mpsc::UnboundedReceiver<Work<S::Txn>>,
    notifier: Notifier,
    cancel: CancellationToken,
}

impl<S: Store> Drain<S> {
    // Body of the drain thread.
    fn run(self, opened: watch::Sender<Opened>, done: oneshot::Sender<()>) {
        let Drain {
            mut store,
            mut rx,
            notifier,
            cancel,
        } = self;

        let span = tracing::debug_span!("drain", name = %notifier.name);
        let _guard = span.enter();

        // The transaction is begun before any queued work is looked at,
        // including work which was submitted prior to start().
        let mut binding = match guarded(|| store.begin()) {
            Ok(txn) => {
                tracing::debug!("began transaction");
                let _ = opened.send(Some(Ok(())));
                Binding::Bound(txn)
            }
            Err(err) => {
                let err = Arc::new(err.context("failed to begin transaction"));
                notifier.notify(&Error::BeginFailed(err.clone()));
                let _ = opened.send(Some(Err(err)));
                Binding::Unbound
            }
        };

        if let Binding::Bound(_) = binding {
            futures::executor::block_on(drain(
                &mut store,
                &mut rx,
                &mut binding,
                &notifier,
                &cancel,
            ));
        }

        let canceled = cancel_queued(&mut rx);
        if canceled != 0 {
            tracing::debug!(canceled, "canceled queued operations");
        }

        std::mem::drop(binding);
        std::mem::drop(store);

        tracing::debug!("drain loop exited");
        let _ = done.send(());
    }
}

// Invoke queued work until cancelled, the queue is closed,
// or an invariant violation is encountered.
async fn drain<S: Store>(
    store: &mut S,
    rx: &mut mpsc::UnboundedReceiver<Work<S::Txn>>,
    binding: &mut Binding<S::Txn>,
    notifier: &Notifier,
    cancel: &CancellationToken,
) {
    loop {
        let work = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("drain loop cancelled");
                return;
            }
            work = rx.recv() => match work {
                Some(work) => work,
                None => {
                    tracing::debug!("work queue closed");
                    return;
                }
            },
        };

        match work {
            Work::Run(job) => {
                let txn = match binding.get_mut() {
                    Ok(txn) => txn,
                    Err(err) if err.is_invariant_violation() => {
                        tracing::error!(error = %err, "drain loop invariant violated");
                        notifier.notify(&err);
                        job.fail(err);
                        return;
                    }
                    Err(err) => {
                        job.fail(err);
                        continue;
                    }
                };

                let started = Instant::now();
                let ok = job.invoke(txn, notifier);
                tracing::trace!(ok, elapsed = ?started.elapsed(), "processed operation");
            }
            Work::Release(reply) => {
                let result = match std::mem::replace(binding, Binding::Released) {
                    Binding::Bound(txn) => guarded(|| store.release(txn))
                        .map_err(|err| Error::OperationFailed(err.context("failed to release transaction"))),
                    Binding::Unbound | Binding::Released => Ok(()),
                };
                if let Err(err) = &result {
                    notifier.notify(err);
                }
                let _ = reply.send(result);
            }
        }
    }
}

// Close the queue, then resolve everything still within it as canceled.
fn cancel_queued<Txn>(rx: &mut mpsc::UnboundedReceiver<Work<Txn>>) -> usize {
    rx.close();

    let mut canceled = 0;
    while let Ok(work) = rx.try_recv() {
        work.cancel();
        canceled += 1;
    }
    canceled
}

// Call `f`, mapping a panic into an error.
fn guarded<R>(f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!("panicked: {}", panic_message(&*panic))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
