//! Unix domain socket IPC listener.
//!
//! Accepts connections, reads newline-delimited JSON-RPC-lite requests and
//! dispatches them to the [`ConsentService`].

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::watch;

use crate::ConsentService;
use crate::PROTOCOL_VERSION;
use crate::protocol::*;

/// Methods answered by [`dispatch_method`], as advertised by `hello`.
pub const CAPABILITIES: &[&str] = &[
    "consent.decide",
    "consent.requires",
    "consent.update",
    "consent.get",
    "cookie.classify",
    "cookie.summarize",
    "cookie.authorize",
    "evaluator.status",
    "evaluator.restart",
];

/// Bind the listener, replacing a stale socket file.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(path)?;
    tracing::info!("consentd listening on {}", path.display());
    Ok(listener)
}

/// Serve connections until `shutdown` flips to `true`.
pub async fn serve(
    service: Arc<ConsentService>,
    listener: UnixListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let service = Arc::clone(&service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(service, stream).await {
                            tracing::warn!("Connection error: {e}");
                        }
                    });
                }
                Err(e) => tracing::error!("Accept error: {e}"),
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    tracing::info!("IPC listener shutting down");
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn handle_connection(
    service: Arc<ConsentService>,
    stream: UnixStream,
) -> std::io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let response = dispatch_message(&service, trimmed).await;
        let mut bytes = serde_json::to_vec(&response).unwrap_or_else(|_| b"{}".to_vec());
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Parse and dispatch a single request line.
pub async fn dispatch_message(service: &ConsentService, raw: &str) -> serde_json::Value {
    let request: RpcRequest = match serde_json::from_str(raw) {
        Ok(request) => request,
        Err(e) => {
            return error_response(
                serde_json::Value::Null,
                RpcError::new(ERR_INVALID_REQUEST, format!("Invalid JSON-RPC: {e}")),
            );
        }
    };

    match dispatch_method(service, &request.method, request.params).await {
        Ok(result) => serde_json::to_value(RpcResponse {
            id: request.id,
            result,
        })
        .unwrap_or_default(),
        Err(error) => {
            tracing::debug!("{} failed: {}", request.method, error.message);
            error_response(request.id, error)
        }
    }
}

fn error_response(id: serde_json::Value, error: RpcError) -> serde_json::Value {
    serde_json::to_value(RpcErrorResponse { id, error }).unwrap_or_default()
}

async fn dispatch_method(
    service: &ConsentService,
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, RpcError> {
    let resolver = service.engine().resolver();
    match method {
        "hello" => {
            let hello: HelloParams = parse_params(method, params)?;
            handle_hello(&hello)
        }
        "consent.decide" => {
            let p: DecideParams = parse_params(method, params)?;
            let decision = resolver.decide(&p.user_id, p.category).await?;
            to_result(DecideResult {
                user_id: p.user_id,
                category: p.category,
                decision,
            })
        }
        "consent.requires" => {
            let p: RequiresParams = parse_params(method, params)?;
            let requires_consent = resolver.requires_consent(p.category).await?;
            to_result(RequiresResult {
                category: p.category,
                requires_consent,
            })
        }
        "consent.update" => {
            let p: UpdateParams = parse_params(method, params)?;
            let record = resolver.update_consent(&p.user_id, &p.consent).await?;
            to_result(ConsentResult {
                user_id: p.user_id,
                found: true,
                consent: record.effective(),
            })
        }
        "consent.get" => {
            let p: UserParams = parse_params(method, params)?;
            let record = resolver.consent_record(&p.user_id).await?;
            to_result(ConsentResult {
                found: record.is_some(),
                consent: record.unwrap_or_default().effective(),
                user_id: p.user_id,
            })
        }
        "cookie.classify" => {
            let p: ClassifyParams = parse_params(method, params)?;
            to_result(ClassifyResult {
                category: resolver.classify(&p.name),
                name: p.name,
            })
        }
        "cookie.summarize" => {
            let p: SummarizeParams = parse_params(method, params)?;
            to_result(SummarizeResult {
                total: p.names.len(),
                counts: resolver.summarize(&p.names),
            })
        }
        "cookie.authorize" => {
            let p: AuthorizeParams = parse_params(method, params)?;
            to_result(resolver.authorize(&p.user_id, p.category).await?)
        }
        "evaluator.status" => to_result(service.status().await),
        "evaluator.restart" => {
            service.engine().start().await?;
            to_result(service.status().await)
        }
        _ => Err(RpcError::new(
            ERR_METHOD_NOT_FOUND,
            format!("Unknown method: {method}"),
        )),
    }
}

fn handle_hello(hello: &HelloParams) -> Result<serde_json::Value, RpcError> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(RpcError::invalid_params(format!(
            "Incompatible protocol version: client={}, service={PROTOCOL_VERSION}",
            hello.protocol_version
        )));
    }
    tracing::debug!("hello from client {}", hello.client_version);
    to_result(HelloResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: CAPABILITIES.iter().map(|c| (*c).to_string()).collect(),
    })
}

fn parse_params<T>(method: &str, params: Option<serde_json::Value>) -> Result<T, RpcError>
where
    T: DeserializeOwned,
{
    let params = params.ok_or_else(|| RpcError::invalid_params("Missing params"))?;
    serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(format!("Invalid {method} params: {e}")))
}

fn to_result<T: Serialize>(value: T) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::new(ERR_INTERNAL, format!("Serialize error: {e}")))
}
