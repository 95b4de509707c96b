//! thruflux-core: the data-plane transfer engine shared by both endpoints
//! of a thruflux session.
//!
//! This crate provides:
//! - The manifest protocol: catalogue codec, resume negotiation, completion
//!   acknowledgement
//! - Sender and receiver pipelines over a reliable multiplexed stream
//!   transport
//! - The file-handle cache and durable resume state
//! - The single-threaded scheduler that drives the QUIC engine from
//!   datagram arrivals and timer hints
//!
//! Signaling, NAT traversal, and the CLI live in the surrounding
//! application; the core receives an already-selected address pair, a
//! datagram feed, and a packet-batch egress primitive.

pub mod cache;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod manifest;
pub mod metrics;
pub mod resume;
pub mod transfer;
pub mod transport;

pub use config::TransferConfig;
pub use error::{Error, Result};
pub use logging::{init_logging, LogFormat};
pub use manifest::{Manifest, SourceIndex};
pub use metrics::{PathClass, TransferMetrics};
pub use transfer::{ReceiverPipeline, SenderPipeline};
pub use transport::{ConnectionDriver, TransportTuning};
