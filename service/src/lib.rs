//! consentd: cookie-consent decision daemon.
//!
//! Owns one [`ConsentEngine`] (a supervised rule evaluator plus the consent
//! store) and serves decisions to local clients over a Unix socket.

pub mod client;
pub mod config;
pub mod ipc;
pub mod protocol;
pub mod supervisor;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use consent_core::ConsentEngine;
use consent_core::FileConsentStore;
use consent_core::RuleEvaluatorProcess;

use crate::config::ConfigError;
use crate::config::ServiceConfig;
use crate::protocol::EvaluatorStatusResult;

pub const PROTOCOL_VERSION: &str = "1.0";

pub const SOCKET_FILENAME: &str = "consentd.sock";

/// Default socket path: `$XDG_RUNTIME_DIR/consentd.sock`, falling back to
/// `/tmp/consentd-<user>.sock`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(SOCKET_FILENAME);
    }
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/consentd-{user}.sock"))
}

/// Assemble the engine described by `config`. The evaluator is not started.
pub async fn build_engine(config: &ServiceConfig) -> Result<ConsentEngine, ConfigError> {
    let classifier = config.classifier()?;
    let store = FileConsentStore::open(config.store.resolved_path()).await?;
    store.seed_users(&config.store.seed_users).await?;
    tracing::info!(
        "Consent store at {} ({} classifier rules)",
        store.path().display(),
        classifier.rule_count()
    );

    let evaluator = RuleEvaluatorProcess::from_config(&config.evaluator);
    Ok(
        ConsentEngine::new(evaluator, Arc::new(store), classifier)
            .with_cookie_max_age(config.cookies.max_age()),
    )
}

/// State shared by every IPC connection.
#[derive(Debug)]
pub struct ConsentService {
    engine: ConsentEngine,
    started_at: Instant,
}

impl ConsentService {
    pub fn new(engine: ConsentEngine) -> Self {
        Self {
            engine,
            started_at: Instant::now(),
        }
    }

    pub fn engine(&self) -> &ConsentEngine {
        &self.engine
    }

    pub async fn status(&self) -> EvaluatorStatusResult {
        let status = self.engine.status();
        EvaluatorStatusResult {
            state: status.state,
            ready: status.state == consent_core::EvaluatorState::Ready,
            generation: status.generation,
            pid: self.engine.evaluator().pid().await,
            queue_depth: self.engine.resolver().queue().depth(),
            uptime_s: self.started_at.elapsed().as_secs(),
        }
    }
}
