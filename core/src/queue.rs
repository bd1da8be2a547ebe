//! Ordered submission of evaluator queries.
//!
//! Callers never touch the evaluator channel directly. Every query goes
//! through [`RequestQueue::submit`], which appends it to an unbounded
//! channel read by a single dispatcher task. The dispatcher:
//!
//! - buffers while the evaluator is `NotInitialized` or `Starting`;
//! - delivers one query at a time while `Ready`, in arrival order, and only
//!   takes the next entry once the previous one has resolved;
//! - fails everything with `EvaluatorUnavailable` once the evaluator is
//!   `Crashed` or `Stopped`, including entries buffered before the crash.
//!
//! An abandoned [`PendingReply`] does not cancel its query: the entry is
//! still delivered and the reply is discarded.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::ConsentError;
use crate::evaluator::EvaluatorState;
use crate::evaluator::EvaluatorStatus;
use crate::evaluator::QueryChannel;
use crate::evaluator::RuleEvaluatorProcess;
use crate::evaluator::until_left;
use crate::query::Query;
use crate::query::Reply;

type ReplySlot = oneshot::Sender<Result<Reply, ConsentError>>;

/// A query waiting for the evaluator, with its single-use result slot.
struct PendingRequest {
    query: Query,
    slot: ReplySlot,
}

impl PendingRequest {
    fn resolve(self, result: Result<Reply, ConsentError>) {
        // The caller may have given up on the reply.
        let _ = self.slot.send(result);
    }
}

/// Future returned by [`RequestQueue::submit`].
#[must_use = "a PendingReply does nothing unless awaited"]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Reply, ConsentError>>,
}

impl Future for PendingReply {
    type Output = Result<Reply, ConsentError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(ConsentError::unavailable("request queue shut down")))
        })
    }
}

/// FIFO front door to the evaluator.
pub struct RequestQueue {
    tx: mpsc::UnboundedSender<PendingRequest>,
    depth: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl RequestQueue {
    /// Spawn the dispatcher for `evaluator`. Must be called inside a tokio
    /// runtime.
    pub fn new(evaluator: &RuleEvaluatorProcess) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher {
            rx,
            status: evaluator.subscribe_status(),
            link: evaluator.link(),
            depth: Arc::clone(&depth),
        };
        tokio::spawn(dispatcher.run(shutdown.clone()));
        Self {
            tx,
            depth,
            shutdown,
        }
    }

    /// Enqueue `query`. Never blocks; the returned future resolves with the
    /// parsed reply or the failure that took its place.
    pub fn submit(&self, query: Query) -> PendingReply {
        let (slot, rx) = oneshot::channel();
        self.depth.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(request)) = self.tx.send(PendingRequest { query, slot })
        {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            request.resolve(Err(ConsentError::unavailable("request queue shut down")));
        }
        PendingReply { rx }
    }

    /// Entries submitted but not yet resolved, including the one in flight.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("depth", &self.depth())
            .finish_non_exhaustive()
    }
}

struct Dispatcher {
    rx: mpsc::UnboundedReceiver<PendingRequest>,
    status: watch::Receiver<EvaluatorStatus>,
    link: Arc<Mutex<Option<QueryChannel>>>,
    depth: Arc<AtomicUsize>,
}

impl Dispatcher {
    async fn run(mut self, shutdown: CancellationToken) {
        let mut last = *self.status.borrow_and_update();
        loop {
            let current = *self.status.borrow_and_update();
            // A crash followed by a quick restart may coalesce into a single
            // watch update; the generation bump still tells us it happened.
            if last.is_live() && current.generation != last.generation {
                self.fail_buffered(last);
            }
            last = current;

            match current.state {
                EvaluatorState::NotInitialized | EvaluatorState::Starting => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        changed = self.status.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                EvaluatorState::Ready => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        changed = self.status.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        request = self.rx.recv() => match request {
                            Some(request) => self.dispatch(request, current).await,
                            None => break,
                        },
                    }
                }
                EvaluatorState::Crashed | EvaluatorState::Stopped => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        changed = self.status.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        request = self.rx.recv() => match request {
                            Some(request) => self.finish(request, Err(unavailable_in(current.state))),
                            None => break,
                        },
                    }
                }
            }
        }

        self.rx.close();
        while let Some(request) = self.rx.recv().await {
            self.finish(request, Err(ConsentError::unavailable("request queue shut down")));
        }
        tracing::debug!("Request queue dispatcher exited");
    }

    /// Deliver one request and wait for its reply, or for the evaluator to
    /// leave the status it was dispatched under.
    async fn dispatch(&mut self, request: PendingRequest, status: EvaluatorStatus) {
        let result = {
            let mut link = self.link.lock().await;
            match link.as_mut() {
                Some(channel) => {
                    tokio::select! {
                        reply = channel.ask(&request.query) => reply,
                        _ = until_left(&mut self.status, status) => {
                            let state = self.status.borrow().state;
                            Err(unavailable_in(state))
                        }
                    }
                }
                None => Err(ConsentError::unavailable("evaluator channel closed")),
            }
        };
        if let Err(err) = &result {
            tracing::debug!("Query `{}` failed: {err}", request.query);
        }
        self.finish(request, result);
    }

    /// Fail every entry buffered so far; used when a crash was observed only
    /// through a generation change.
    fn fail_buffered(&mut self, crashed: EvaluatorStatus) {
        let mut failed = 0usize;
        while let Ok(request) = self.rx.try_recv() {
            self.finish(
                request,
                Err(ConsentError::unavailable(format!(
                    "evaluator generation {} crashed",
                    crashed.generation
                ))),
            );
            failed += 1;
        }
        if failed > 0 {
            tracing::warn!(
                "Failed {failed} queued requests after evaluator generation {} went away",
                crashed.generation
            );
        }
    }

    fn finish(&self, request: PendingRequest, result: Result<Reply, ConsentError>) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
        request.resolve(result);
    }
}

fn unavailable_in(state: EvaluatorState) -> ConsentError {
    ConsentError::unavailable(format!("evaluator is {state}"))
}
