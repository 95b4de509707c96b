//! Transport abstractions.
//!
//! The core never implements QUIC; it drives an engine through the narrow
//! contract below. `StreamIo` is the slice of the engine a pipeline touches
//! from inside a callback, `TransferHandler` is the callback surface a
//! pipeline implements, and `PacketSink` is the egress primitive the
//! scheduler drains packet batches into.
//!
//! All of it is single-threaded and cooperative: callbacks never block on
//! the network and never reenter the engine.

pub mod cert;
pub mod config;
pub mod driver;

use std::net::SocketAddr;
use std::time::Instant;

use crate::error::Result;

pub use config::TransportTuning;
pub use driver::ConnectionDriver;

/// Stream operations available to a pipeline from inside a callback.
pub trait StreamIo {
    /// Open the next outgoing bidirectional stream, returning its id.
    fn open_stream(&mut self) -> Result<u64>;

    /// Write to a stream, optionally finishing it. Returns the number of
    /// bytes the transport accepted; zero means flow-blocked, and the
    /// handler's `on_writable` fires once capacity returns.
    fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize>;

    /// Read from a stream. `Ok(None)` means no data is currently pending;
    /// `Ok(Some((n, fin)))` delivers bytes and the peer's half-close flag.
    fn stream_recv(&mut self, stream_id: u64, buf: &mut [u8]) -> Result<Option<(usize, bool)>>;

    /// Half-close the write side of a stream. Needs no send capacity and
    /// always takes effect immediately.
    fn stream_finish(&mut self, stream_id: u64) -> Result<()>;

    /// Begin a graceful connection close.
    fn close(&mut self, code: u64, reason: &[u8]);
}

/// Callback contract a pipeline implements; mirrors the engine's stream
/// interface. Errors returned from any callback are caught at the boundary
/// and translated into a connection close — nothing unwinds into the engine.
pub trait TransferHandler {
    /// The transport handshake finished; streams may now be opened.
    fn on_connected(&mut self, io: &mut dyn StreamIo) -> Result<()>;

    /// A peer-initiated stream was seen for the first time.
    fn on_new_stream(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()>;

    /// A stream has bytes (or a fin) pending.
    fn on_readable(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()>;

    /// A stream regained send capacity.
    fn on_writable(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()>;

    /// Periodic hook driven by the scheduler's process step; used for
    /// cursor flush throttling and throughput sampling.
    fn on_tick(&mut self, io: &mut dyn StreamIo, now: Instant) -> Result<()>;

    /// The connection is gone. Flush durable state and release handles.
    fn on_conn_closed(&mut self);

    /// True once this side considers the transfer finished.
    fn is_complete(&self) -> bool;
}

/// Egress primitive: hand a batch of datagrams (all to the same peer) to
/// the OS or the test link. Partial acceptance stops the batch and returns
/// the number consumed; the scheduler retries the remainder.
pub trait PacketSink {
    fn send_packets(&mut self, peer: SocketAddr, packets: &[Vec<u8>]) -> std::io::Result<usize>;
}
