//! # The Diaglink Crate
//! Welcome to the `diaglink` crate documentation. This crate is the
//! diagnostic protocol core of an OBD-II / UDS scan tool: it turns
//! high-level requests ("read stored DTCs", "read PID 0C", "start an
//! extended session") into wire exchanges with vehicle ECUs through an
//! ELM327-class adapter, and turns the raw bytes coming back into typed
//! diagnostic objects.
//!
//! The crate consumes only a byte stream ([`transport::Transport`]); how
//! those bytes move (Bluetooth, WiFi TCP, USB serial) is the caller's
//! business.
//!
//! ## Reading live data
//!
//! ```rust
//! async fn rpm_example(transport: Box<dyn diaglink::transport::Transport>) {
//!     let adapter = diaglink::adapter::Elm327::new(transport);
//!     let engine = diaglink::session::SessionEngine::new(
//!         adapter,
//!         diaglink::session::ProtocolConfig::default(),
//!     );
//!     engine.initialize().await.unwrap();
//!
//!     let client = diaglink::services::DiagnosticClient::new(&engine);
//!     let rpm = client.read_current_pid(0x0c).await.unwrap();
//!     println!("{}: {} {}", rpm.name, rpm.value, rpm.unit);
//! }
//! ```
//!
//! ## Reading and clearing trouble codes
//!
//! ```rust
//! async fn dtc_example(engine: &diaglink::session::SessionEngine) {
//!     let client = diaglink::services::DiagnosticClient::new(engine);
//!
//!     for dtc in client.read_stored_dtcs().await.unwrap() {
//!         println!("{} severity {:?}", dtc.code, dtc.severity());
//!     }
//!     client.clear_dtcs().await.unwrap();
//! }
//! ```
//!
//! ## UDS sessions
//!
//! Entering a non-default session starts the Tester Present keep-alive
//! automatically; telemetry about every exchange is available on the
//! engine's event bus.
//!
//! ```rust
//! async fn uds_example(engine: &diaglink::session::SessionEngine) {
//!     use diaglink::uds::{DataIdentifier, SessionKind};
//!
//!     let client = diaglink::services::DiagnosticClient::new(engine);
//!     client.start_session(SessionKind::Extended, None).await.unwrap();
//!
//!     let vin = client.read_did(DataIdentifier::Vin as u16).await.unwrap();
//!     println!("VIN: {}", String::from_utf8_lossy(&vin));
//! }
//! ```

pub mod adapter;
pub mod dtc;
mod error;
pub mod event;
pub mod isotp;
pub mod obd;
pub mod protocol;
pub mod services;
pub mod session;
pub mod transport;
pub mod uds;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
