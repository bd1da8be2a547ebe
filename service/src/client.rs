//! Blocking client for the consentd socket, used by `consentd ping`.

use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::PROTOCOL_VERSION;
use crate::protocol::HelloResult;
use crate::protocol::RpcError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("cannot connect to {}: {source}", path.display())]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{method} failed ({}): {}", error.code, error.message)]
    Rpc { method: String, error: RpcError },
}

/// One connection; requests are answered in order.
pub struct ServiceClient {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
    next_id: u64,
}

impl ServiceClient {
    pub fn connect(path: &Path, timeout: Duration) -> Result<Self, ClientError> {
        let stream = UnixStream::connect(path).map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let writer = stream.try_clone()?;
        Ok(Self {
            writer,
            reader: BufReader::new(stream),
            next_id: 0,
        })
    }

    /// Send one request and return its `result`.
    pub fn call(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let id = self.next_id;
        self.next_id += 1;
        let request = serde_json::json!({"id": id, "method": method, "params": params});

        let mut bytes = serde_json::to_vec(&request)
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        bytes.push(b'\n');
        self.writer.write_all(&bytes)?;
        self.writer.flush()?;

        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ClientError::InvalidResponse(
                "connection closed before a response".to_string(),
            ));
        }
        let mut response: serde_json::Value = serde_json::from_str(line.trim())
            .map_err(|e| ClientError::InvalidResponse(format!("{e}: {}", line.trim())))?;

        if let Some(error) = response.get_mut("error") {
            let error: RpcError = serde_json::from_value(error.take())
                .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
            return Err(ClientError::Rpc {
                method: method.to_string(),
                error,
            });
        }
        response
            .get_mut("result")
            .map(serde_json::Value::take)
            .ok_or_else(|| ClientError::InvalidResponse("missing result".to_string()))
    }

    pub fn hello(&mut self, client_version: &str) -> Result<HelloResult, ClientError> {
        let result = self.call(
            "hello",
            serde_json::json!({
                "protocol_version": PROTOCOL_VERSION,
                "client_version": client_version,
            }),
        )?;
        serde_json::from_value(result).map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}
