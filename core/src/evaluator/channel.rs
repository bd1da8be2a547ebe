use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;

use crate::error::ConsentError;
use crate::query::Query;
use crate::query::Reply;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Line-oriented request/reply channel to one evaluator instance.
///
/// The protocol has no correlation ids, so callers must never have more
/// than one `ask` outstanding; `&mut self` enforces that per channel.
pub struct QueryChannel {
    writer: BoxedWriter,
    reader: BufReader<BoxedReader>,
    asked: u64,
}

impl QueryChannel {
    pub fn new<W, R>(writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            writer: Box::new(writer),
            reader: BufReader::new(Box::new(reader)),
            asked: 0,
        }
    }

    /// Number of queries written so far.
    pub fn asked(&self) -> u64 {
        self.asked
    }

    /// Send one canonical query line and parse the single reply line.
    pub async fn ask(&mut self, query: &Query) -> Result<Reply, ConsentError> {
        let wire = query.to_wire();
        tracing::debug!("Evaluator query: {wire}");

        let mut line = wire.into_bytes();
        line.push(b'\n');
        self.writer
            .write_all(&line)
            .await
            .map_err(|e| ConsentError::unavailable(format!("write to evaluator failed: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| ConsentError::unavailable(format!("flush to evaluator failed: {e}")))?;
        self.asked += 1;

        let mut raw = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut raw)
            .await
            .map_err(|e| ConsentError::unavailable(format!("read from evaluator failed: {e}")))?;
        if n == 0 {
            return Err(ConsentError::unavailable("evaluator closed its output"));
        }
        // Undecodable bytes are a bad reply, not a closed channel.
        let reply = String::from_utf8(raw).map_err(|e| ConsentError::MalformedReply {
            query: query.to_wire(),
            reply: String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })?;
        tracing::debug!("Evaluator reply: {}", reply.trim_end());
        query.parse_reply(&reply)
    }
}

impl std::fmt::Debug for QueryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryChannel")
            .field("asked", &self.asked)
            .finish_non_exhaustive()
    }
}
