//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::isotp::IsoTpConfig;
use crate::protocol::ProtocolType;
use crate::session::error::ConfigError;

/// Immutable numeric contracts for one engine. Build via
/// [`ProtocolConfig::builder`]; updates produce a new instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolConfig {
    pub response_timeout: Duration,
    /// Deadline after an NRC 0x78 response-pending.
    pub extended_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub keep_alive_interval: Duration,
    pub enable_padding: bool,
    pub padding_byte: u8,
    /// ISO-TP extended addressing byte, when the target needs it.
    pub extended_addressing: Option<u8>,
    /// STmin advertised in flow control frames we send.
    pub st_min: Duration,
    /// Block size advertised in flow control frames we send.
    pub block_size: u8,
    /// Per-service response deadline overrides, keyed by service id.
    pub service_timeouts: HashMap<u8, Duration>,
    pub preferred_protocol: Option<ProtocolType>,
    /// Physical request address overriding the protocol default.
    pub target_address: Option<u32>,
    /// Ask the adapter for headers; enables per-ECU attribution and
    /// checksum verification on K-line protocols.
    pub headers: bool,
    pub structured_logging: bool,
    /// Telemetry backlog size.
    pub event_backlog: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            extended_timeout: Duration::from_millis(5000),
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            keep_alive_interval: Duration::from_millis(2000),
            enable_padding: true,
            padding_byte: 0xaa,
            extended_addressing: None,
            st_min: Duration::ZERO,
            block_size: 0,
            service_timeouts: HashMap::new(),
            preferred_protocol: None,
            target_address: None,
            headers: false,
            structured_logging: true,
            event_backlog: 256,
        }
    }
}

impl ProtocolConfig {
    pub fn builder() -> ProtocolConfigBuilder {
        ProtocolConfigBuilder::default()
    }

    /// Response deadline for one service, override first.
    pub fn timeout_for(&self, service_id: u8) -> Duration {
        self.service_timeouts
            .get(&service_id)
            .copied()
            .unwrap_or(self.response_timeout)
    }

    /// The frame layer settings this config implies.
    pub fn isotp(&self) -> IsoTpConfig {
        IsoTpConfig {
            tx_dl: 8,
            padding: self.enable_padding.then_some(self.padding_byte),
            block_size: self.block_size,
            separation_time_min: self.st_min,
        }
    }
}

/// Builder-style constructor for [`ProtocolConfig`].
#[derive(Debug, Clone, Default)]
pub struct ProtocolConfigBuilder {
    config: ProtocolConfig,
}

impl ProtocolConfigBuilder {
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    pub fn extended_timeout(mut self, timeout: Duration) -> Self {
        self.config.extended_timeout = timeout;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn padding(mut self, enabled: bool, byte: u8) -> Self {
        self.config.enable_padding = enabled;
        self.config.padding_byte = byte;
        self
    }

    pub fn extended_addressing(mut self, address_byte: Option<u8>) -> Self {
        self.config.extended_addressing = address_byte;
        self
    }

    pub fn flow_control(mut self, block_size: u8, st_min: Duration) -> Self {
        self.config.block_size = block_size;
        self.config.st_min = st_min;
        self
    }

    pub fn service_timeout(mut self, service_id: u8, timeout: Duration) -> Self {
        self.config.service_timeouts.insert(service_id, timeout);
        self
    }

    pub fn preferred_protocol(mut self, protocol: ProtocolType) -> Self {
        self.config.preferred_protocol = Some(protocol);
        self
    }

    pub fn target_address(mut self, address: u32) -> Self {
        self.config.target_address = Some(address);
        self
    }

    pub fn headers(mut self, enabled: bool) -> Self {
        self.config.headers = enabled;
        self
    }

    pub fn structured_logging(mut self, enabled: bool) -> Self {
        self.config.structured_logging = enabled;
        self
    }

    pub fn event_backlog(mut self, capacity: usize) -> Self {
        self.config.event_backlog = capacity;
        self
    }

    pub fn build(self) -> Result<ProtocolConfig, ConfigError> {
        let config = self.config;
        if config.response_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout("response timeout is zero"));
        }
        if config.extended_timeout < config.response_timeout {
            return Err(ConfigError::InvalidTimeout(
                "extended timeout below response timeout",
            ));
        }
        if config.max_retries > 16 {
            return Err(ConfigError::InvalidRetry("more than 16 retries"));
        }
        if config.keep_alive_interval < Duration::from_millis(100) {
            return Err(ConfigError::InvalidKeepAlive);
        }
        Ok(config)
    }
}
