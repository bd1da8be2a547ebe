//! External rule evaluator: process launch, query channel and lifecycle.
//!
//! ## Architecture
//!
//! ```text
//! RuleEvaluatorProcess (one per service instance)
//!   ├─ EvaluatorLauncher (spawns the process, or a fake in tests)
//!   │   └─ LaunchedEvaluator { channel, exit, terminate }
//!   ├─ watch<EvaluatorStatus>   (only the supervisor writes it)
//!   ├─ broadcast<EvaluatorEvent> (started / ready / crashed / stopped)
//!   └─ Mutex<Option<QueryChannel>>
//!        └─ shared with RequestQueue's dispatcher once Ready
//! ```

use serde::Serialize;
use strum_macros::Display;
use tokio::sync::watch;

mod channel;
mod launcher;
mod process;

pub use channel::QueryChannel;
pub use launcher::EvaluatorConfig;
pub use launcher::EvaluatorLauncher;
pub use launcher::LaunchedEvaluator;
pub use launcher::ProcessLauncher;
pub use launcher::Readiness;
pub use launcher::ReadinessMode;
pub use process::RuleEvaluatorProcess;

/// Lifecycle state of the evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EvaluatorState {
    NotInitialized,
    Starting,
    Ready,
    Crashed,
    Stopped,
}

/// Observable lifecycle events, for logging and restart supervision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvaluatorEvent {
    Started { generation: u64, pid: Option<u32> },
    Ready { generation: u64 },
    Crashed { generation: u64, code: Option<i32> },
    Stopped,
}

/// Snapshot published on the supervisor's watch channel.
///
/// `generation` counts `start` calls, so a crash followed by a restart is
/// visible to a reader that missed the intermediate `Crashed` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvaluatorStatus {
    pub state: EvaluatorState,
    pub generation: u64,
}

impl EvaluatorStatus {
    pub(crate) fn initial() -> Self {
        Self {
            state: EvaluatorState::NotInitialized,
            generation: 0,
        }
    }

    /// Starting or Ready.
    pub fn is_live(&self) -> bool {
        matches!(self.state, EvaluatorState::Starting | EvaluatorState::Ready)
    }
}

/// Resolve once the published status differs from `status`, or the sender
/// is gone.
pub(crate) async fn until_left(rx: &mut watch::Receiver<EvaluatorStatus>, status: EvaluatorStatus) {
    let _ = rx.wait_for(|current| *current != status).await;
}
