use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::channel::QueryChannel;
use crate::error::ConsentError;

/// Placeholder in `args` replaced by the rule-source path.
const RULES_PLACEHOLDER: &str = "{rules}";

/// How the supervisor decides that a freshly launched evaluator is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessMode {
    /// Send a probe query and wait for a well-formed reply.
    Probe,
    /// Wait a fixed delay and assume the evaluator is up if it has not exited.
    Delay,
}

/// Resolved readiness signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Probe { timeout: Duration },
    Delay { after: Duration },
}

/// Evaluator process configuration (`[evaluator]` in the service config).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Executable to launch.
    pub program: String,

    /// Arguments; `{rules}` is replaced by `rules_path`.
    pub args: Vec<String>,

    /// Rule source loaded by the evaluator.
    pub rules_path: PathBuf,

    /// Working directory for the process.
    pub working_dir: Option<PathBuf>,

    pub readiness: ReadinessMode,

    /// Upper bound for the readiness probe.
    pub readiness_timeout_ms: u64,

    /// Delay used when `readiness = "delay"`.
    pub readiness_delay_ms: u64,

    /// Time given to the process to exit after its input is closed before
    /// it is killed.
    pub stop_grace_ms: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            program: "swipl".to_string(),
            args: ["-q", "-s", RULES_PLACEHOLDER, "-g", "serve", "-t", "halt"]
                .into_iter()
                .map(String::from)
                .collect(),
            rules_path: PathBuf::from("rules/policies.pl"),
            working_dir: None,
            readiness: ReadinessMode::Probe,
            readiness_timeout_ms: 5_000,
            readiness_delay_ms: 1_000,
            stop_grace_ms: 2_000,
        }
    }
}

impl EvaluatorConfig {
    pub fn resolved_args(&self) -> Vec<String> {
        let rules = self.rules_path.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace(RULES_PLACEHOLDER, &rules))
            .collect()
    }

    pub fn readiness(&self) -> Readiness {
        match self.readiness {
            ReadinessMode::Probe => Readiness::Probe {
                timeout: Duration::from_millis(self.readiness_timeout_ms),
            },
            ReadinessMode::Delay => Readiness::Delay {
                after: Duration::from_millis(self.readiness_delay_ms),
            },
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// A running evaluator instance as handed to the supervisor.
pub struct LaunchedEvaluator {
    pub channel: QueryChannel,
    pub pid: Option<u32>,
    /// Resolves with the exit code once the instance is gone.
    pub exit: oneshot::Receiver<Option<i32>>,
    /// Cancel to terminate the instance.
    pub terminate: CancellationToken,
}

/// Starts evaluator instances.
///
/// The process-backed implementation is [`ProcessLauncher`]; tests plug in
/// in-memory evaluators through this seam.
#[async_trait]
pub trait EvaluatorLauncher: Send + Sync {
    async fn launch(&self) -> Result<LaunchedEvaluator, ConsentError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Launches the evaluator as a child process speaking the query protocol
/// on stdin/stdout. Stderr is forwarded to tracing.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    config: EvaluatorConfig,
}

impl ProcessLauncher {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }
}

#[async_trait]
impl EvaluatorLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<LaunchedEvaluator, ConsentError> {
        let program = &self.config.program;
        if which::which(program).is_err() {
            return Err(ConsentError::BinaryNotFound {
                program: program.clone(),
            });
        }

        let mut cmd = Command::new(program);
        cmd.args(self.config.resolved_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| ConsentError::Launch {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();
        tracing::debug!("Evaluator process spawned: PID={pid:?}");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConsentError::unavailable("evaluator stdin not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConsentError::unavailable("evaluator stdout not available"))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        tracing::debug!("Evaluator stderr: {line}");
                    }
                }
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        let terminate = CancellationToken::new();
        let token = terminate.clone();
        let grace = self.config.stop_grace();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            tracing::warn!("Evaluator did not exit within {grace:?}, killing");
                            let _ = child.start_kill();
                            child.wait().await
                        }
                    }
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!("Failed to wait for evaluator: {e}");
                    None
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(LaunchedEvaluator {
            channel: QueryChannel::new(stdin, stdout),
            pid,
            exit: exit_rx,
            terminate,
        })
    }

    fn describe(&self) -> String {
        format!(
            "{} {}",
            self.config.program,
            self.config.resolved_args().join(" ")
        )
    }
}
