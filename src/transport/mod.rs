//! Byte-stream abstraction consumed by the adapter driver.
//!
//! The core makes no assumption about the physical transport (Bluetooth
//! RFCOMM, WiFi TCP, USB serial); anything that can move bytes both ways
//! implements [`Transport`]. The [`mock`] module provides a scripted
//! in-memory transport used throughout the test suite.

pub mod error;
pub mod mock;

pub use error::Error;
pub use mock::MockTransport;

use std::time::Duration;

use async_trait::async_trait;

/// A bidirectional byte stream to a diagnostic adapter.
///
/// `read` returns `Ok(0)` when no bytes arrived within `timeout`; a closed
/// stream reports [`Error::Disconnected`] instead.
#[async_trait]
pub trait Transport: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, Error>;

    /// Bytes that can be read without waiting.
    fn available(&self) -> usize;

    /// Drop any buffered input.
    fn clear(&mut self);

    fn is_connected(&self) -> bool;
}
