#![allow(clippy::unwrap_used, clippy::expect_used)]
//! In-memory evaluator doubles for consent-core integration tests.
//!
//! [`FakeLauncher`] hands the supervisor a [`QueryChannel`] backed by a
//! duplex pipe. Behind the pipe a task answers each query line with
//! [`reference_reply`] (or a per-query override), and the test can hold
//! replies, crash the instance and inspect what it received.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use consent_core::ConsentEngine;
use consent_core::ConsentError;
use consent_core::CookieCategory;
use consent_core::CookieClassifier;
use consent_core::EvaluatorState;
use consent_core::InMemoryConsentStore;
use consent_core::RuleEvaluatorProcess;
use consent_core::evaluator::EvaluatorLauncher;
use consent_core::evaluator::LaunchedEvaluator;
use consent_core::evaluator::QueryChannel;
use consent_core::evaluator::Readiness;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Probe readiness with a timeout long enough for held-reply tests.
pub const TEST_READINESS: Readiness = Readiness::Probe {
    timeout: Duration::from_secs(10),
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Reply the bundled rule source gives for one query line.
pub fn reference_reply(line: &str) -> String {
    let Some((op, args)) = split_goal(line) else {
        return "unsupported".to_string();
    };
    match (op, args.as_slice()) {
        ("can_set_cookie", [category, consent]) => match (*category, *consent) {
            ("essential", _) => "true".to_string(),
            (_, "true") => "true".to_string(),
            (_, "false") => "false".to_string(),
            _ => "unsupported".to_string(),
        },
        ("requires_consent", [category, _]) => (*category != "essential").to_string(),
        ("classify_cookie", [name, _]) => {
            let name = name.trim_matches('\'');
            CookieClassifier::with_default_rules()
                .classify(name)
                .token()
                .to_string()
        }
        _ => "unsupported".to_string(),
    }
}

fn split_goal(line: &str) -> Option<(&str, Vec<&str>)> {
    let goal = line.trim().strip_suffix('.')?;
    let (op, rest) = goal.split_once('(')?;
    let args = rest.strip_suffix(')')?;
    Some((op, args.split(',').map(str::trim).collect()))
}

struct Shared {
    received: Mutex<Vec<String>>,
    overrides: Mutex<HashMap<String, String>>,
    gate: watch::Sender<bool>,
    crash: Mutex<Option<mpsc::UnboundedSender<Option<i32>>>>,
    launches: AtomicUsize,
    fail_next_launch: AtomicBool,
}

/// Launcher double. Clones share state, so a test keeps one handle while
/// the supervisor owns another.
#[derive(Clone)]
pub struct FakeLauncher {
    shared: Arc<Shared>,
}

impl Default for FakeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLauncher {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            shared: Arc::new(Shared {
                received: Mutex::new(Vec::new()),
                overrides: Mutex::new(HashMap::new()),
                gate,
                crash: Mutex::new(None),
                launches: AtomicUsize::new(0),
                fail_next_launch: AtomicBool::new(false),
            }),
        }
    }

    /// Received lines are still recorded, but no reply is written until
    /// [`FakeLauncher::release_replies`]. Holding before `start` keeps the
    /// evaluator in `Starting`.
    pub fn hold_replies(&self) {
        self.shared.gate.send_replace(false);
    }

    pub fn release_replies(&self) {
        self.shared.gate.send_replace(true);
    }

    /// Answer `query` (canonical wire text) with `reply` instead of the
    /// reference rules.
    pub fn set_reply(&self, query: &str, reply: &str) {
        self.shared
            .overrides
            .lock()
            .unwrap()
            .insert(query.to_string(), reply.to_string());
    }

    /// Make the running instance exit with `code`.
    pub fn crash(&self, code: i32) {
        if let Some(tx) = self.shared.crash.lock().unwrap().as_ref() {
            let _ = tx.send(Some(code));
        }
    }

    pub fn fail_next_launch(&self) {
        self.shared.fail_next_launch.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.shared.launches.load(Ordering::SeqCst)
    }

    /// Every line received so far, across instances.
    pub fn received(&self) -> Vec<String> {
        self.shared.received.lock().unwrap().clone()
    }

    /// Received lines other than readiness probes.
    pub fn received_queries(&self) -> Vec<String> {
        self.received()
            .into_iter()
            .filter(|line| line != "requires_consent(essential, Requires).")
            .collect()
    }

    /// Wait until at least `count` lines have been received.
    pub async fn wait_received(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.received().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fake evaluator did not receive the expected lines");
    }

    fn reply_for(&self, line: &str) -> String {
        self.shared
            .overrides
            .lock()
            .unwrap()
            .get(line)
            .cloned()
            .unwrap_or_else(|| reference_reply(line))
    }
}

#[async_trait]
impl EvaluatorLauncher for FakeLauncher {
    async fn launch(&self) -> Result<LaunchedEvaluator, ConsentError> {
        if self.shared.fail_next_launch.swap(false, Ordering::SeqCst) {
            return Err(ConsentError::Launch {
                program: "fake".to_string(),
                source: std::io::Error::other("launch refused"),
            });
        }
        self.shared.launches.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, mut server_write) = tokio::io::split(server);

        let (crash_tx, mut crash_rx) = mpsc::unbounded_channel();
        *self.shared.crash.lock().unwrap() = Some(crash_tx);
        let (exit_tx, exit_rx) = oneshot::channel();
        let terminate = CancellationToken::new();
        let token = terminate.clone();
        let mut gate = self.shared.gate.subscribe();
        let this = self.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let code = loop {
                let line = tokio::select! {
                    _ = token.cancelled() => break Some(0),
                    Some(code) = crash_rx.recv() => break code,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => line,
                        _ => break Some(0),
                    },
                };
                this.shared.received.lock().unwrap().push(line.clone());

                tokio::select! {
                    _ = token.cancelled() => break Some(0),
                    Some(code) = crash_rx.recv() => break code,
                    _ = gate.wait_for(|open| *open) => {}
                }

                let mut reply = this.reply_for(&line);
                reply.push('\n');
                if server_write.write_all(reply.as_bytes()).await.is_err() {
                    break Some(0);
                }
                let _ = server_write.flush().await;
            };
            drop(lines);
            drop(server_write);
            let _ = exit_tx.send(code);
        });

        Ok(LaunchedEvaluator {
            channel: QueryChannel::new(client_write, client_read),
            pid: None,
            exit: exit_rx,
            terminate,
        })
    }

    fn describe(&self) -> String {
        "fake evaluator".to_string()
    }
}

/// Consent fixture: user "1" consented to analytics only, user "2" to
/// everything, user "3" to nothing.
pub fn seeded_store() -> Arc<InMemoryConsentStore> {
    let mut users = Vec::new();
    for (user, granted) in [
        ("1", &[CookieCategory::Analytics][..]),
        (
            "2",
            &[
                CookieCategory::Analytics,
                CookieCategory::Marketing,
                CookieCategory::Performance,
                CookieCategory::Unknown,
            ][..],
        ),
        ("3", &[][..]),
    ] {
        let mut record = consent_core::ConsentRecord::new();
        for category in CookieCategory::non_essential() {
            record.set(category, granted.contains(&category));
        }
        users.push((user.to_string(), record));
    }
    Arc::new(InMemoryConsentStore::with_users(users))
}

/// Engine over `launcher` and the seeded store, not yet started.
pub fn fake_engine(launcher: &FakeLauncher) -> ConsentEngine {
    let evaluator = RuleEvaluatorProcess::new(Arc::new(launcher.clone()), TEST_READINESS);
    ConsentEngine::new(
        evaluator,
        seeded_store(),
        CookieClassifier::with_default_rules(),
    )
}

/// Engine over `launcher`, started and Ready.
pub async fn ready_engine(launcher: &FakeLauncher) -> ConsentEngine {
    let engine = fake_engine(launcher);
    engine.start_and_wait(WAIT).await.expect("fake evaluator ready");
    engine
}

pub async fn wait_for_state(evaluator: &RuleEvaluatorProcess, state: EvaluatorState) {
    let mut rx = evaluator.subscribe_status();
    tokio::time::timeout(WAIT, rx.wait_for(|status| status.state == state))
        .await
        .unwrap_or_else(|_| panic!("evaluator never reached {state}"))
        .expect("supervisor dropped");
}
