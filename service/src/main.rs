//! `consentd` entry point.
//!
//! ## Modes
//!
//! - **`serve`** (default): start the rule evaluator, supervise it, and
//!   answer consent queries on the Unix socket until Ctrl+C.
//! - **`ping`**: hello handshake against a running daemon.
//! - **`decide`** / **`requires-consent`**: one-shot queries against a
//!   private evaluator instance; the answer is printed as JSON.
//! - **`classify`**: local cookie classification, no evaluator needed.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use consent_core::ConsentEngine;
use consent_core::CookieCategory;
use consent_service::ConsentService;
use consent_service::client::ServiceClient;
use consent_service::config::ServiceConfig;
use consent_service::protocol::ClassifyResult;
use consent_service::protocol::DecideResult;
use consent_service::protocol::RequiresResult;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "consentd", version, about = "Cookie-consent decision daemon")]
struct Cli {
    /// Config file (defaults to ~/.config/consentd/config.toml).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon (default).
    Serve,
    /// Check that a daemon is answering on the socket.
    Ping,
    /// Decide whether a user's cookie in a category may be set.
    Decide {
        #[arg(long)]
        user: String,
        #[arg(long, value_parser = parse_category)]
        category: CookieCategory,
    },
    /// Ask the rules whether a category needs consent.
    RequiresConsent {
        #[arg(value_parser = parse_category)]
        category: CookieCategory,
    },
    /// Classify cookie names with the configured rule table.
    Classify {
        #[arg(required = true)]
        names: Vec<String>,
    },
}

fn parse_category(raw: &str) -> Result<CookieCategory, String> {
    CookieCategory::from_token(raw).ok_or_else(|| format!("unknown cookie category: {raw}"))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = ServiceConfig::load(cli.config.as_deref())?;
    match cli.command.unwrap_or(Command::Serve) {
        Command::Ping => ping(&config.socket_path()),
        Command::Classify { names } => classify(&config, &names),
        command => run(config, command),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Send a hello handshake and verify the response.
fn ping(path: &Path) -> anyhow::Result<()> {
    let mut client = ServiceClient::connect(path, Duration::from_secs(10))
        .context("ping")?;
    let hello = client
        .hello(env!("CARGO_PKG_VERSION"))
        .context("ping: hello failed")?;
    eprintln!(
        "ping: consentd {} is alive (protocol {})",
        hello.service_version, hello.protocol_version
    );
    Ok(())
}

fn classify(config: &ServiceConfig, names: &[String]) -> anyhow::Result<()> {
    let classifier = config.classifier()?;
    let results: Vec<ClassifyResult> = names
        .iter()
        .map(|name| ClassifyResult {
            name: name.clone(),
            category: classifier.classify(name),
        })
        .collect();
    print_json(&results)
}

#[tokio::main]
async fn run(config: ServiceConfig, command: Command) -> anyhow::Result<()> {
    let engine = consent_service::build_engine(&config).await?;
    match command {
        Command::Decide { user, category } => {
            let decision = one_shot(&engine, &config, async {
                engine.resolver().decide(&user, category).await
            })
            .await?;
            print_json(&DecideResult {
                user_id: user,
                category,
                decision,
            })
        }
        Command::RequiresConsent { category } => {
            let requires_consent = one_shot(&engine, &config, async {
                engine.resolver().requires_consent(category).await
            })
            .await?;
            print_json(&RequiresResult {
                category,
                requires_consent,
            })
        }
        _ => serve(engine, config).await,
    }
}

/// Run `query` against a freshly started evaluator, stopping it afterwards.
async fn one_shot<T>(
    engine: &ConsentEngine,
    config: &ServiceConfig,
    query: impl Future<Output = consent_core::error::Result<T>>,
) -> anyhow::Result<T> {
    engine
        .start_and_wait(config.ready_timeout())
        .await
        .context("rule evaluator did not become ready")?;
    let result = query.await;
    if let Err(err) = engine.stop().await {
        tracing::warn!("Failed to stop rule evaluator: {err}");
    }
    Ok(result?)
}

async fn serve(engine: ConsentEngine, config: ServiceConfig) -> anyhow::Result<()> {
    tracing::info!("consentd v{} starting", env!("CARGO_PKG_VERSION"));

    if let Err(err) = engine.start_and_wait(config.ready_timeout()).await {
        // The supervisor (or an operator) takes it from here.
        tracing::error!("Rule evaluator not ready at startup: {err}");
    }

    let supervision = CancellationToken::new();
    let supervisor = config.restart.enabled.then(|| {
        consent_service::supervisor::spawn(
            engine.evaluator().clone(),
            config.restart.clone(),
            config.ready_timeout(),
            supervision.clone(),
        )
    });

    let listener = consent_service::ipc::bind(&config.socket_path())?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Signal received, shutting down");
        let _ = shutdown_tx.send(true);
    });

    let service = Arc::new(ConsentService::new(engine));
    consent_service::ipc::serve(Arc::clone(&service), listener, shutdown_rx).await?;

    supervision.cancel();
    if let Some(supervisor) = supervisor {
        let _ = supervisor.await;
    }
    service.engine().stop().await?;
    let _ = std::fs::remove_file(config.socket_path());

    tracing::info!("consentd exiting cleanly");
    Ok(())
}
