#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bydhvs_lib
//!
//! This crate polls BYD Battery-Box HVS/HVM batteries over their MODBUS-framed TCP
//! protocol and decodes the replies into pack and per-cell telemetry.
//!
//! The pieces, leaves first:
//!
//! - [`protocol`]: CRC-16, request frames and the byte-level decoders.
//! - [`telemetry`]: the aggregate the decoders write into.
//! - [`transport`]: the connection/session abstraction and its TCP implementation.
//! - [`poller`]: the state machine running one complete polling cycle.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `bydhvs` exporter binary.
//! - `serde`: Enables `serde` serialization of the telemetry types.

/// Contains error types for the library.
mod error;
/// Polling state machine.
pub mod poller;
/// Defines the communication protocol for BYD Battery-Box.
pub mod protocol;
/// Telemetry model filled in by the decoders.
pub mod telemetry;
/// Device connections.
pub mod transport;

pub use error::{Error, Result};
