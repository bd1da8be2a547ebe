//! Automatic restart of a crashed rule evaluator.
//!
//! Watches lifecycle events and, when the current generation crashes,
//! restarts it with exponential backoff. Restarts draw from a budget shared
//! across the lifetime of the service; once it is spent the evaluator stays
//! `Crashed` until an operator restarts it over IPC.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use backon::ExponentialBuilder;
use backon::Retryable;
use consent_core::ConsentError;
use consent_core::EvaluatorEvent;
use consent_core::EvaluatorState;
use consent_core::RuleEvaluatorProcess;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::RestartConfig;

/// Spawn the supervisor. The task ends on shutdown, when the evaluator is
/// stopped, or when the restart budget runs out; it yields the number of
/// restart attempts made.
pub fn spawn(
    evaluator: RuleEvaluatorProcess,
    config: RestartConfig,
    ready_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<usize> {
    let events = evaluator.subscribe_events();
    tokio::spawn(run(evaluator, events, config, ready_timeout, shutdown))
}

async fn run(
    evaluator: RuleEvaluatorProcess,
    mut events: broadcast::Receiver<EvaluatorEvent>,
    config: RestartConfig,
    ready_timeout: Duration,
    shutdown: CancellationToken,
) -> usize {
    let mut used = 0;

    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };

        let crashed = match event {
            Ok(EvaluatorEvent::Crashed { generation, code }) => {
                if generation != evaluator.generation() {
                    tracing::debug!("Ignoring crash of superseded generation {generation}");
                    continue;
                }
                tracing::info!("Evaluator generation {generation} exited with {code:?}");
                true
            }
            Ok(EvaluatorEvent::Stopped) => break,
            Ok(_) => false,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Supervisor missed {skipped} evaluator events");
                evaluator.state() == EvaluatorState::Crashed
            }
            Err(RecvError::Closed) => break,
        };
        if !crashed {
            continue;
        }

        let remaining = config.max_restarts.saturating_sub(used);
        if remaining == 0 {
            tracing::error!(
                "Evaluator restart budget of {} exhausted; leaving it crashed",
                config.max_restarts
            );
            break;
        }

        let initial = Duration::from_millis(config.initial_backoff_ms);
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(initial) => {}
        }

        let attempts = AtomicUsize::new(0);
        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            outcome = restart(&evaluator, &config, remaining, ready_timeout, &attempts) => {
                Some(outcome)
            }
        };
        used += attempts.load(Ordering::SeqCst);

        match outcome {
            None => break,
            Some(Ok(())) => tracing::info!(
                "Evaluator restarted (generation {}, {used}/{} restarts used)",
                evaluator.generation(),
                config.max_restarts
            ),
            Some(Err(err)) => tracing::warn!("Evaluator restart failed: {err}"),
        }
    }
    used
}

/// Up to `remaining` start attempts, each waiting for readiness.
async fn restart(
    evaluator: &RuleEvaluatorProcess,
    config: &RestartConfig,
    remaining: usize,
    ready_timeout: Duration,
    attempts: &AtomicUsize,
) -> Result<(), ConsentError> {
    let backoff = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.initial_backoff_ms))
        .with_max_delay(Duration::from_millis(config.max_backoff_ms))
        .with_max_times(remaining.saturating_sub(1));

    (|| async move {
        attempts.fetch_add(1, Ordering::SeqCst);
        evaluator.start().await?;
        evaluator.wait_ready(ready_timeout).await
    })
    .retry(backoff)
    // Another party already restarted (or stopped) the evaluator.
    .when(|err: &ConsentError| !matches!(err, ConsentError::InvalidTransition { .. }))
    .notify(|err: &ConsentError, after: Duration| {
        tracing::warn!("Evaluator restart attempt failed ({err}); retrying in {after:?}");
    })
    .await
}
