//! CoAP client core for a family of networked air-purifier appliances.
//!
//! This crate implements the stateful, application-layer-encrypted control
//! channel the appliances run on top of plain CoAP/UDP: a counter-based
//! crypto session ([`session`]), the AES-CBC/SHA-256 wire codec
//! ([`codec`]), a CoAP transport adapter ([`transport`]), the JSON
//! envelope shapes both directions use ([`schema`]), and the device-facing
//! [`client::Client`] that composes all of the above into `get_status`,
//! `observe_status` and `set_control_values`.
//!
//! Discovery, device classification, an interactive setup wizard, and a
//! CLI frontend are out of scope here — they are thin orchestration layers
//! that treat this crate as a black box.

pub mod client;
pub mod codec;
pub mod error;
pub mod schema;
pub mod session;
pub mod transport;

pub use client::{Client, DEFAULT_RETRY_COUNT};
pub use error::{Error, Result};
pub use transport::{DEFAULT_MAX_AGE, DEFAULT_PORT};
