//! Scripted in-memory transport playing the adapter side of a session.
//!
//! Rules are either repeatable (`on`) or ordered one-shots (`expect_next`).
//! Responses may be split into chunks with individual delays, which is how
//! tests exercise `SEARCHING...` banners, NRC 0x78 response-pending flows
//! and keep-alive timeouts under `tokio::time::pause`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::transport::{Error, Transport};

/// How a rule matches the command written to the adapter (CR stripped,
/// uppercased).
#[derive(Debug, Clone)]
pub enum Expect {
    Exact(String),
    Prefix(String),
    Any,
}

impl Expect {
    fn matches(&self, command: &str) -> bool {
        match self {
            Expect::Exact(expected) => command == expected,
            Expect::Prefix(prefix) => command.starts_with(prefix.as_str()),
            Expect::Any => true,
        }
    }
}

/// One piece of a response, delivered `after` the command was written.
#[derive(Debug, Clone)]
pub struct MockChunk {
    pub after: Duration,
    pub bytes: Vec<u8>,
}

impl MockChunk {
    pub fn new(after: Duration, text: &str) -> Self {
        Self {
            after,
            bytes: text.as_bytes().to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    expect: Expect,
    chunks: Vec<MockChunk>,
}

/// Shared, clonable log of every command written to the mock.
#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<StdMutex<Vec<String>>>);

impl SentLog {
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count_of(&self, command: &str) -> usize {
        let command = command.to_uppercase();
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    fn push(&self, command: String) {
        self.0.lock().unwrap().push(command);
    }
}

/// Scripted [`Transport`] implementation.
#[derive(Debug, Default)]
pub struct MockTransport {
    rules: Vec<Rule>,
    ordered: VecDeque<Rule>,
    pending: VecDeque<(Instant, Vec<u8>)>,
    sent: SentLog,
    disconnected: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport that answers the standard initialization sequence, ready
    /// for protocol-specific rules on top. Later rules win, so the generic
    /// `AT` rule goes in first.
    pub fn with_defaults() -> Self {
        let mut mock = Self::new();
        mock.on(Expect::Prefix("AT".into()), "OK\r\r>");
        mock.on(Expect::Exact("ATZ".into()), "\r\rELM327 v1.5\r\r>");
        mock
    }

    /// Handle to the command log, usable after the transport moved into an
    /// adapter.
    pub fn sent(&self) -> SentLog {
        self.sent.clone()
    }

    /// Add a repeatable rule. Rules added later win over earlier ones so
    /// specific rules can be layered over catch-alls.
    pub fn on(&mut self, expect: Expect, response: &str) {
        self.rules.push(Rule {
            expect,
            chunks: vec![MockChunk::new(Duration::ZERO, response)],
        });
    }

    /// Add a repeatable rule answering a plain hex command with a payload
    /// line and prompt.
    pub fn on_obd(&mut self, command: &str, response_line: &str) {
        self.on(
            Expect::Exact(command.to_uppercase()),
            &format!("{response_line}\r\r>"),
        );
    }

    /// Add a repeatable rule answering in multiple timed chunks.
    pub fn on_chunks(&mut self, expect: Expect, chunks: Vec<MockChunk>) {
        self.rules.push(Rule { expect, chunks });
    }

    /// Add an ordered one-shot rule consumed before any repeatable rule.
    pub fn expect_next(&mut self, expect: Expect, chunks: Vec<MockChunk>) {
        self.ordered.push_back(Rule { expect, chunks });
    }

    /// Simulate the peer going away. Subsequent reads and writes fail.
    pub fn disconnect(&mut self) {
        self.disconnected = true;
    }

    fn respond(&mut self, command: &str) {
        let rule = if let Some(front) = self.ordered.front() {
            if front.expect.matches(command) {
                self.ordered.pop_front()
            } else {
                None
            }
        } else {
            None
        };

        let rule =
            rule.or_else(|| self.rules.iter().rev().find(|r| r.expect.matches(command)).cloned());

        let now = Instant::now();
        match rule {
            Some(rule) => {
                for chunk in rule.chunks {
                    self.pending.push_back((now + chunk.after, chunk.bytes));
                }
            }
            // Real ELM327 behavior for anything it does not understand.
            None => {
                debug!("mock: no rule for {:?}", command);
                self.pending.push_back((now, b"?\r\r>".to_vec()));
            }
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.disconnected {
            return Err(Error::Disconnected);
        }

        let command = String::from_utf8_lossy(bytes)
            .trim_end_matches(['\r', '\n'])
            .to_uppercase();
        debug!("mock RX command {:?}", command);
        self.sent.push(command.clone());
        self.respond(&command);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        if self.disconnected {
            return Err(Error::Disconnected);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some((ready_at, _)) = self.pending.front() {
                let ready_at = *ready_at;
                if ready_at <= Instant::now() {
                    let (_, bytes) = self.pending.pop_front().unwrap();
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        self.pending.push_front((ready_at, bytes[n..].to_vec()));
                    }
                    return Ok(n);
                }
                if ready_at >= deadline {
                    tokio::time::sleep_until(deadline).await;
                    return Ok(0);
                }
                tokio::time::sleep_until(ready_at).await;
            } else {
                tokio::time::sleep_until(deadline).await;
                return Ok(0);
            }
        }
    }

    fn available(&self) -> usize {
        let now = Instant::now();
        self.pending
            .iter()
            .filter(|(ready_at, _)| *ready_at <= now)
            .map(|(_, bytes)| bytes.len())
            .sum()
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    fn is_connected(&self) -> bool {
        !self.disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn answers_scripted_commands() {
        let mut mock = MockTransport::with_defaults();
        mock.on_obd("010C", "41 0C 1A F8");

        mock.write(b"010C\r").await.unwrap();
        let mut buf = [0u8; 64];
        let n = mock.read(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], b"41 0C 1A F8\r\r>");
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_chunks_arrive_on_schedule() {
        let mut mock = MockTransport::new();
        mock.expect_next(
            Expect::Exact("0100".into()),
            vec![
                MockChunk::new(Duration::from_millis(50), "SEARCHING...\r"),
                MockChunk::new(Duration::from_millis(400), "41 00 BE 3F A8 13\r\r>"),
            ],
        );

        mock.write(b"0100\r").await.unwrap();
        let mut buf = [0u8; 64];

        let n = mock.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(n, 0);

        let n = mock.read(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], b"SEARCHING...\r");

        let n = mock.read(&mut buf, Duration::from_millis(500)).await.unwrap();
        assert!(n > 0);
    }

    #[tokio::test]
    async fn unknown_commands_get_question_mark() {
        let mut mock = MockTransport::new();
        mock.write(b"BOGUS\r").await.unwrap();
        let mut buf = [0u8; 16];
        let n = mock.read(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], b"?\r\r>");
    }
}
