//! Supervision of the evaluator process.
//!
//! ## State Machine
//!
//! ```text
//! NotInitialized --start--> Starting --ready signal--> Ready
//!                              ^  |                      |
//!                   start      |  +-------exit-------+   | exit
//!                              |                     v   v
//!                              +------------------ Crashed
//!
//! any state --stop--> Stopped (terminal)
//! ```
//!
//! Each `start` opens a new generation. Tasks belonging to an older
//! generation (exit monitor, readiness probe) can no longer move the state.
//! A failed readiness check terminates the instance; the move to `Crashed`
//! is then made by the exit monitor, which knows the exit code.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::EvaluatorEvent;
use super::EvaluatorState;
use super::EvaluatorStatus;
use super::channel::QueryChannel;
use super::launcher::EvaluatorConfig;
use super::launcher::EvaluatorLauncher;
use super::launcher::LaunchedEvaluator;
use super::launcher::ProcessLauncher;
use super::launcher::Readiness;
use super::until_left;
use crate::category::CookieCategory;
use crate::error::ConsentError;
use crate::query::Query;

const EVENT_CAPACITY: usize = 64;

const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Extra time `stop` waits for the exit monitor beyond the launcher's own
/// grace period.
const STOP_WAIT_SLACK: Duration = Duration::from_secs(1);

struct Session {
    generation: u64,
    pid: Option<u32>,
    terminate: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

struct Inner {
    launcher: Arc<dyn EvaluatorLauncher>,
    readiness: Readiness,
    stop_grace: Duration,
    state_tx: watch::Sender<EvaluatorStatus>,
    events_tx: broadcast::Sender<EvaluatorEvent>,
    link: Arc<Mutex<Option<QueryChannel>>>,
    session: Mutex<Option<Session>>,
    /// Serializes start, stop and crash handling.
    transition: Mutex<()>,
}

/// Owns the one evaluator instance of a service.
#[derive(Clone)]
pub struct RuleEvaluatorProcess {
    inner: Arc<Inner>,
}

impl RuleEvaluatorProcess {
    pub fn new(launcher: Arc<dyn EvaluatorLauncher>, readiness: Readiness) -> Self {
        Self::with_stop_grace(launcher, readiness, DEFAULT_STOP_GRACE)
    }

    pub fn with_stop_grace(
        launcher: Arc<dyn EvaluatorLauncher>,
        readiness: Readiness,
        stop_grace: Duration,
    ) -> Self {
        let (state_tx, _) = watch::channel(EvaluatorStatus::initial());
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                launcher,
                readiness,
                stop_grace,
                state_tx,
                events_tx,
                link: Arc::new(Mutex::new(None)),
                session: Mutex::new(None),
                transition: Mutex::new(()),
            }),
        }
    }

    /// Supervisor for a real child process described by `config`.
    pub fn from_config(config: &EvaluatorConfig) -> Self {
        Self::with_stop_grace(
            Arc::new(ProcessLauncher::new(config.clone())),
            config.readiness(),
            config.stop_grace(),
        )
    }

    pub fn status(&self) -> EvaluatorStatus {
        *self.inner.state_tx.borrow()
    }

    pub fn state(&self) -> EvaluatorState {
        self.status().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == EvaluatorState::Ready
    }

    pub fn subscribe_status(&self) -> watch::Receiver<EvaluatorStatus> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EvaluatorEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Generation of the most recent `start`; 0 before the first one.
    pub fn generation(&self) -> u64 {
        self.status().generation
    }

    pub async fn pid(&self) -> Option<u32> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .and_then(|session| session.pid)
    }

    pub(crate) fn link(&self) -> Arc<Mutex<Option<QueryChannel>>> {
        Arc::clone(&self.inner.link)
    }

    /// Launch the evaluator. Returns once the instance is running; the
    /// transition to `Ready` happens in the background.
    ///
    /// Valid from `NotInitialized` and `Crashed` (operator restart).
    pub async fn start(&self) -> Result<(), ConsentError> {
        let inner = &self.inner;
        let _guard = inner.transition.lock().await;

        let current = self.state();
        if !matches!(
            current,
            EvaluatorState::NotInitialized | EvaluatorState::Crashed
        ) {
            return Err(ConsentError::InvalidTransition {
                action: "start",
                state: current,
            });
        }

        let generation = self.generation() + 1;
        inner.state_tx.send_replace(EvaluatorStatus {
            state: EvaluatorState::Starting,
            generation,
        });
        tracing::info!(
            "Starting rule evaluator (generation {generation}): {}",
            inner.launcher.describe()
        );

        let launched = match inner.launcher.launch().await {
            Ok(launched) => launched,
            Err(err) => {
                tracing::error!("Rule evaluator failed to launch: {err}");
                inner.crash_locked(generation, None).await;
                return Err(err);
            }
        };
        let LaunchedEvaluator {
            channel,
            pid,
            exit,
            terminate,
        } = launched;

        *inner.link.lock().await = Some(channel);
        let monitor = tokio::spawn(monitor_exit(Arc::clone(inner), generation, exit));
        *inner.session.lock().await = Some(Session {
            generation,
            pid,
            terminate,
            monitor: Some(monitor),
        });
        let _ = inner
            .events_tx
            .send(EvaluatorEvent::Started { generation, pid });

        tokio::spawn(await_readiness(Arc::clone(inner), generation));
        Ok(())
    }

    /// Terminate the evaluator. In-flight and queued requests fail with
    /// `EvaluatorUnavailable`. `Stopped` is terminal; stopping twice is a
    /// no-op.
    pub async fn stop(&self) -> Result<(), ConsentError> {
        let inner = &self.inner;
        let monitor = {
            let _guard = inner.transition.lock().await;
            let mut previous = None;
            inner.state_tx.send_if_modified(|status| {
                if status.state == EvaluatorState::Stopped {
                    return false;
                }
                previous = Some(status.state);
                status.state = EvaluatorState::Stopped;
                true
            });
            let Some(previous) = previous else {
                return Ok(());
            };
            tracing::info!("Stopping rule evaluator (was {previous})");

            // Dropping the channel closes the evaluator's input.
            inner.link.lock().await.take();
            let session = inner.session.lock().await.take();
            let _ = inner.events_tx.send(EvaluatorEvent::Stopped);
            session.and_then(|mut session| {
                session.terminate.cancel();
                session.monitor.take()
            })
        };

        if let Some(monitor) = monitor
            && tokio::time::timeout(inner.stop_grace + STOP_WAIT_SLACK, monitor)
                .await
                .is_err()
        {
            tracing::warn!("Rule evaluator exit not observed after stop");
        }
        Ok(())
    }

    /// Wait until the evaluator is `Ready`, failing early if it crashes or
    /// stops first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ConsentError> {
        let mut rx = self.subscribe_status();
        let settled = rx.wait_for(|status| {
            matches!(
                status.state,
                EvaluatorState::Ready | EvaluatorState::Crashed | EvaluatorState::Stopped
            )
        });
        match tokio::time::timeout(timeout, settled).await {
            Ok(Ok(status)) => match status.state {
                EvaluatorState::Ready => Ok(()),
                other => Err(ConsentError::unavailable(format!("evaluator is {other}"))),
            },
            Ok(Err(_)) => Err(ConsentError::unavailable("evaluator supervisor dropped")),
            Err(_) => Err(ConsentError::unavailable(format!(
                "evaluator not ready within {timeout:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for RuleEvaluatorProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleEvaluatorProcess")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.state_tx.borrow().generation == generation
    }

    /// Move `from` -> `to` only if `generation` is still current.
    fn advance(&self, generation: u64, from: &[EvaluatorState], to: EvaluatorState) -> bool {
        self.state_tx.send_if_modified(|status| {
            if status.generation == generation && from.contains(&status.state) {
                status.state = to;
                true
            } else {
                false
            }
        })
    }

    async fn crash(&self, generation: u64, code: Option<i32>) {
        let _guard = self.transition.lock().await;
        self.crash_locked(generation, code).await;
    }

    async fn crash_locked(&self, generation: u64, code: Option<i32>) {
        if !self.advance(
            generation,
            &[EvaluatorState::Starting, EvaluatorState::Ready],
            EvaluatorState::Crashed,
        ) {
            return;
        }
        tracing::warn!("Rule evaluator crashed (generation {generation}, exit code {code:?})");

        self.link.lock().await.take();
        let stale = {
            let mut session = self.session.lock().await;
            match session.as_ref() {
                Some(current) if current.generation == generation => session.take(),
                _ => None,
            }
        };
        if let Some(stale) = stale {
            stale.terminate.cancel();
        }
        let _ = self
            .events_tx
            .send(EvaluatorEvent::Crashed { generation, code });
    }

    async fn terminate(&self, generation: u64) {
        if let Some(session) = self.session.lock().await.as_ref()
            && session.generation == generation
        {
            session.terminate.cancel();
        }
    }

    /// Probe query: any well-formed reply proves the rule source is loaded.
    async fn probe(&self, timeout: Duration) -> Result<(), ConsentError> {
        let mut state = self.state_tx.subscribe();
        let starting = *state.borrow_and_update();
        if starting.state != EvaluatorState::Starting {
            return Err(ConsentError::unavailable("evaluator left startup before the probe"));
        }
        let mut link = self.link.lock().await;
        let channel = link
            .as_mut()
            .ok_or_else(|| ConsentError::unavailable("evaluator channel missing"))?;
        let query = Query::requires_consent(CookieCategory::Essential);
        tokio::select! {
            result = tokio::time::timeout(timeout, channel.ask(&query)) => match result {
                Ok(reply) => reply.map(|_| ()),
                Err(_) => Err(ConsentError::unavailable(format!(
                    "no reply to readiness probe within {timeout:?}"
                ))),
            },
            _ = until_left(&mut state, starting) => {
                Err(ConsentError::unavailable("evaluator left startup before the probe finished"))
            }
        }
    }
}

async fn monitor_exit(inner: Arc<Inner>, generation: u64, exit: oneshot::Receiver<Option<i32>>) {
    let code = exit.await.unwrap_or(None);
    tracing::debug!("Evaluator generation {generation} exited with code {code:?}");
    inner.crash(generation, code).await;
}

async fn await_readiness(inner: Arc<Inner>, generation: u64) {
    let outcome = match inner.readiness {
        Readiness::Probe { timeout } => inner.probe(timeout).await,
        Readiness::Delay { after } => {
            tokio::time::sleep(after).await;
            Ok(())
        }
    };

    match outcome {
        Ok(()) => {
            if inner.advance(
                generation,
                &[EvaluatorState::Starting],
                EvaluatorState::Ready,
            ) {
                tracing::info!("Rule evaluator ready (generation {generation})");
                let _ = inner.events_tx.send(EvaluatorEvent::Ready { generation });
            }
        }
        Err(err) => {
            if !inner.is_current(generation) {
                return;
            }
            tracing::warn!("Rule evaluator failed its readiness check: {err}");
            // The exit monitor records the crash with the real exit code.
            inner.terminate(generation).await;
        }
    }
}
