//! ELM327 / STN / OBDLink adapter driver.
//!
//! Wraps a bidirectional byte stream to the adapter and provides the three
//! verbs the layers above need: `reset`, `apply_profile` and `exchange`.
//! Responses are cleaned (echo, `SEARCHING...`, prompt) and scanned for the
//! adapter's error markers before any hex parsing happens.
//! ## Example
//! ```
//! # async fn adapter_example() {
//! use std::time::Duration;
//! use diaglink::adapter::Elm327;
//! use diaglink::transport::MockTransport;
//!
//! let mut mock = MockTransport::with_defaults();
//! mock.on_obd("010C", "41 0C 1A F8");
//!
//! let mut adapter = Elm327::new(Box::new(mock));
//! adapter.reset().await.unwrap();
//! let lines = adapter
//!     .exchange(&[0x01, 0x0c], Duration::from_millis(1000))
//!     .await
//!     .unwrap();
//! assert_eq!(lines[0], vec![0x41, 0x0c, 0x1a, 0xf8]);
//! # }
//! ```

pub mod error;
pub mod profile;

pub use error::Error;
pub use profile::{st_timeout_operand, AdapterProfile};

use std::time::Duration;

use bstr::ByteSlice;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::transport::Transport;

/// Polling period for the read loop; individual reads never block longer
/// than `timeout / 20`.
const POLL_PERIOD: Duration = Duration::from_millis(50);
const RESET_TIMEOUT: Duration = Duration::from_millis(2000);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(1000);

/// Driver for an ELM327-class adapter behind a [`Transport`].
///
/// Every `exchange` takes `&mut self`: the borrow checker enforces the
/// one-outstanding-exchange rule, nested exchanges cannot compile.
pub struct Elm327 {
    transport: Box<dyn Transport>,
    identity: Option<String>,
}

impl Elm327 {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            identity: None,
        }
    }

    /// Adapter identification banner from the last reset, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Issue `ATZ`, wait for the banner and drain to the prompt. Retries
    /// once before giving up.
    pub async fn reset(&mut self) -> Result<String, crate::Error> {
        for attempt in 0..2 {
            self.transport.clear();
            match self.command("ATZ", RESET_TIMEOUT).await {
                Ok(banner) if !banner.is_empty() => {
                    debug!("adapter banner: {}", banner);
                    self.identity = Some(banner.clone());
                    return Ok(banner);
                }
                Ok(_) | Err(_) if attempt == 0 => {
                    warn!("adapter reset attempt failed, retrying");
                }
                _ => break,
            }
        }
        Err(Error::Reset.into())
    }

    /// Apply an AT command profile. Every command must answer `OK`;
    /// anything else aborts the application.
    pub async fn apply_profile(&mut self, profile: &AdapterProfile) -> Result<(), crate::Error> {
        for command in profile.commands() {
            let response = self.command(command, COMMAND_TIMEOUT).await?;
            if !response.contains("OK") {
                return Err(Error::ConfigurationFailed {
                    command: command.to_string(),
                    response,
                }
                .into());
            }
        }
        Ok(())
    }

    /// `ATI` identification string.
    pub async fn identify(&mut self) -> Result<String, crate::Error> {
        self.command("ATI", COMMAND_TIMEOUT).await
    }

    /// `ATRV` battery voltage in volts.
    pub async fn battery_voltage(&mut self) -> Result<f32, crate::Error> {
        let text = self.command("ATRV", COMMAND_TIMEOUT).await?;
        text.trim()
            .trim_end_matches(['V', 'v'])
            .parse()
            .map_err(|_| Error::Unexpected(text).into())
    }

    /// Send a raw AT or hex command and return the cleaned textual response.
    pub async fn command(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, crate::Error> {
        debug!("TX {:?}", command);

        self.transport.clear();
        let mut line = command.as_bytes().to_vec();
        line.push(b'\r');
        self.transport.write(&line).await?;

        let raw = self.read_until_prompt(timeout).await?;
        let lines = clean_response(&raw, command);
        let text = lines.join("\n");
        debug!("RX {:?}", text);

        if let Some(marker) = Error::from_marker(&text) {
            return Err(marker.into());
        }
        Ok(text)
    }

    /// Send a hex payload and parse the response into one byte vector per
    /// line, header bytes (when enabled) included.
    pub async fn exchange(
        &mut self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, crate::Error> {
        // A new request starts clean: anything still buffered belongs to an
        // abandoned exchange.
        self.transport.clear();
        self.write_hex(payload).await?;
        self.read_response_lines(&hex::encode_upper(payload), timeout).await
    }

    /// Send a hex payload where a quiet bus is a valid outcome
    /// (intermediate ISO-TP frames, suppressed positive responses). The
    /// adapter still prints `NO DATA` and a prompt in that case; total
    /// silence remains a timeout. Buffered input is kept; the frames of an
    /// in-flight message must not be dropped.
    pub async fn send_frame(
        &mut self,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, crate::Error> {
        self.write_hex(payload).await?;
        match self
            .read_response_lines(&hex::encode_upper(payload), timeout)
            .await
        {
            Ok(lines) => Ok(lines),
            Err(crate::Error::Adapter(Error::NoData)) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    async fn write_hex(&mut self, payload: &[u8]) -> Result<(), crate::Error> {
        let command = hex::encode_upper(payload);
        debug!("TX {}", command);
        let mut line = command.into_bytes();
        line.push(b'\r');
        self.transport.write(&line).await?;
        Ok(())
    }

    /// Keep reading until the next prompt. Used when the ECU signalled
    /// response-pending and the final answer is still on its way.
    pub async fn continue_read(
        &mut self,
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, crate::Error> {
        self.read_response_lines("", timeout).await
    }

    async fn read_response_lines(
        &mut self,
        echo: &str,
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, crate::Error> {
        let raw = self.read_until_prompt(timeout).await?;
        let lines = clean_response(&raw, echo);
        debug!("RX {:?}", lines);

        let text = lines.join("\n");
        if let Some(marker) = Error::from_marker(&text) {
            return Err(marker.into());
        }

        let mut parsed = Vec::new();
        for line in &lines {
            if let Some(bytes) = parse_hex_line(line) {
                parsed.push(bytes);
            }
        }

        if parsed.is_empty() {
            if lines.is_empty() {
                return Err(Error::NoData.into());
            }
            return Err(Error::Unexpected(text).into());
        }
        Ok(parsed)
    }

    async fn read_until_prompt(&mut self, timeout: Duration) -> Result<String, crate::Error> {
        let deadline = Instant::now() + timeout;
        let poll = POLL_PERIOD.min(timeout / 20).max(Duration::from_millis(1));
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let n = self
                .transport
                .read(&mut chunk, poll.min(deadline - now))
                .await?;
            if n == 0 {
                continue;
            }
            buf.extend(&chunk[..n]);

            if ends_with_prompt(&buf) {
                return Ok(String::from_utf8_lossy(&buf).into_owned());
            }
        }

        if buf.is_empty() {
            Err(Error::Timeout.into())
        } else {
            // Deadline hit mid-response; classify what we have.
            Ok(String::from_utf8_lossy(&buf).into_owned())
        }
    }
}

fn ends_with_prompt(buf: &[u8]) -> bool {
    buf.trim_end_with(|c| c.is_whitespace()).last_byte() == Some(b'>')
}

/// Strip prompt, echo and search banners; split into trimmed lines.
fn clean_response(raw: &str, echo: &str) -> Vec<String> {
    let mut echo_dropped = echo.is_empty();
    let mut lines = Vec::new();

    for line in raw.as_bytes().fields_with(|c| c == '\r' || c == '\n') {
        let line = line.trim_with(|c| c.is_whitespace() || c == '>');
        if line.is_empty() {
            continue;
        }
        let line = line.to_str_lossy().into_owned();

        if !echo_dropped && line.eq_ignore_ascii_case(echo) {
            echo_dropped = true;
            continue;
        }
        if line.starts_with("SEARCHING") {
            continue;
        }
        lines.push(line);
    }
    lines
}

/// Parse one response line as hex bytes, tolerating embedded spaces.
/// Returns `None` for non-hex text such as `OK`.
fn parse_hex_line(line: &str) -> Option<Vec<u8>> {
    let mut compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return None;
    }
    // An 11-bit header prints as three hex digits and leaves the line odd.
    if compact.len() % 2 != 0 {
        compact.insert(0, '0');
    }
    hex::decode(&compact).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Expect, MockChunk};
    use crate::transport::MockTransport;

    fn adapter(mock: MockTransport) -> Elm327 {
        Elm327::new(Box::new(mock))
    }

    #[tokio::test]
    async fn reset_captures_banner() {
        let mut adapter = adapter(MockTransport::with_defaults());
        let banner = adapter.reset().await.unwrap();
        assert_eq!(banner, "ELM327 v1.5");
        assert_eq!(adapter.identity(), Some("ELM327 v1.5"));
    }

    #[tokio::test]
    async fn exchange_parses_hex_lines() {
        let mut mock = MockTransport::with_defaults();
        mock.on_obd("010C", "41 0C 1A F8");
        let mut adapter = adapter(mock);

        let lines = adapter
            .exchange(&[0x01, 0x0c], Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(lines, vec![vec![0x41, 0x0c, 0x1a, 0xf8]]);
    }

    #[tokio::test]
    async fn exchange_strips_echo_and_searching() {
        let mut mock = MockTransport::new();
        mock.on(
            Expect::Exact("0100".into()),
            "0100\rSEARCHING...\r41 00 BE 3F A8 13\r\r>",
        );
        let mut adapter = adapter(mock);

        let lines = adapter
            .exchange(&[0x01, 0x00], Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(lines, vec![vec![0x41, 0x00, 0xbe, 0x3f, 0xa8, 0x13]]);
    }

    #[tokio::test]
    async fn error_markers_map_to_variants() {
        let mut mock = MockTransport::new();
        mock.on(Expect::Exact("0100".into()), "CAN ERROR\r\r>");
        mock.on(Expect::Exact("010C".into()), "NO DATA\r\r>");
        let mut adapter = adapter(mock);

        let err = adapter
            .exchange(&[0x01, 0x00], Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Adapter(Error::CanError)));

        let err = adapter
            .exchange(&[0x01, 0x0c], Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Adapter(Error::NoData)));
    }

    #[tokio::test]
    async fn profile_application_checks_ok() {
        let mut mock = MockTransport::with_defaults();
        mock.on(Expect::Exact("ATSP6".into()), "?\r\r>");
        let mut adapter = adapter(mock);

        let mut profile = AdapterProfile::conditioning();
        assert!(adapter.apply_profile(&profile).await.is_ok());

        profile.push("ATSP6");
        let err = adapter.apply_profile(&profile).await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Adapter(Error::UnknownCommand)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_any_data() {
        let mut mock = MockTransport::new();
        mock.expect_next(
            Expect::Exact("0100".into()),
            vec![MockChunk::new(Duration::from_secs(10), "LATE\r\r>")],
        );
        let mut adapter = adapter(mock);

        let err = adapter
            .exchange(&[0x01, 0x00], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Adapter(Error::Timeout)));
    }

    #[tokio::test]
    async fn battery_voltage_parses() {
        let mut mock = MockTransport::with_defaults();
        mock.on(Expect::Exact("ATRV".into()), "12.6V\r\r>");
        let mut adapter = adapter(mock);
        assert_eq!(adapter.battery_voltage().await.unwrap(), 12.6);
    }
}
