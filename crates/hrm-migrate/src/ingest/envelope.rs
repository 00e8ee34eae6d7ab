//! Streamed envelope messages: `{"table": "...", "payload": {...}}`

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};

use crate::error::PipelineResult;

/// A message addressed to one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub table: String,
    pub payload: Value,
}

/// Result of one poll
#[derive(Debug)]
pub enum Polled {
    Message(Envelope),
    /// A message arrived but is not an envelope; carries a description
    Malformed(String),
    /// Nothing arrived within the timeout
    Idle,
    /// The source has no more messages
    Exhausted,
}

#[async_trait]
pub trait EnvelopeSource: Send {
    /// Wait at most `timeout` for the next message
    async fn poll(&mut self, timeout: Duration) -> PipelineResult<Polled>;

    /// Release the upstream connection. Further polls report `Exhausted`.
    async fn close(&mut self) -> PipelineResult<()>;
}

/// Newline-delimited JSON envelopes from a file or stdin
pub struct JsonLinesSource<R> {
    lines: Option<Lines<R>>,
    line_number: u64,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: Some(reader.lines()),
            line_number: 0,
        }
    }
}

impl JsonLinesSource<BufReader<tokio::fs::File>> {
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl JsonLinesSource<BufReader<tokio::io::Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EnvelopeSource for JsonLinesSource<R> {
    async fn poll(&mut self, timeout: Duration) -> PipelineResult<Polled> {
        let Some(lines) = self.lines.as_mut() else {
            return Ok(Polled::Exhausted);
        };

        let line = match tokio::time::timeout(timeout, lines.next_line()).await {
            Err(_) => return Ok(Polled::Idle),
            Ok(line) => line?,
        };
        let Some(line) = line else {
            self.lines = None;
            return Ok(Polled::Exhausted);
        };
        self.line_number += 1;

        if line.trim().is_empty() {
            return Ok(Polled::Idle);
        }

        Ok(match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => Polled::Message(envelope),
            Err(e) => Polled::Malformed(format!("line {}: {}", self.line_number, e)),
        })
    }

    async fn close(&mut self) -> PipelineResult<()> {
        self.lines = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(text: &'static str) -> JsonLinesSource<BufReader<&'static [u8]>> {
        JsonLinesSource::new(BufReader::new(text.as_bytes()))
    }

    #[tokio::test]
    async fn test_reads_envelopes_until_exhausted() {
        let mut source = source(
            "{\"table\":\"jobs\",\"payload\":{\"id\":1,\"name\":\"Analyst\"}}\n\n{oops}\n",
        );
        let timeout = Duration::from_millis(100);

        let Polled::Message(envelope) = source.poll(timeout).await.unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(envelope.table, "jobs");
        assert_eq!(envelope.payload["name"], "Analyst");

        assert!(matches!(source.poll(timeout).await.unwrap(), Polled::Idle));
        let Polled::Malformed(reason) = source.poll(timeout).await.unwrap() else {
            panic!("expected a malformed line");
        };
        assert!(reason.starts_with("line 3"));
        assert!(matches!(source.poll(timeout).await.unwrap(), Polled::Exhausted));
        assert!(matches!(source.poll(timeout).await.unwrap(), Polled::Exhausted));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let mut source = source("{\"table\":\"jobs\",\"payload\":{}}\n");
        source.close().await.unwrap();
        assert!(matches!(
            source.poll(Duration::from_millis(10)).await.unwrap(),
            Polled::Exhausted
        ));
    }
}
