//! Single-threaded connection scheduler over a quiche engine.
//!
//! One driver owns one `quiche::Connection` and the pipeline handler
//! attached to it. The embedding loop feeds ingress datagrams in, calls
//! `process` after every batch, and arms exactly one timer from the
//! engine's advisory `timeout()`. Each process step synchronously
//! dispatches the ready stream callbacks, then drains outgoing packets
//! into a `PacketSink` in batches of at most `MAX_SEND_BATCH`.
//!
//! Handler errors never unwind into the engine: they are caught at the
//! callback boundary and translated into a graceful connection close.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::{debug, error, trace, warn};

use crate::constants::{HEARTBEAT_INTERVAL, MAX_RECV_UDP_PAYLOAD, MAX_SEND_BATCH, TLS_SERVER_NAME};
use crate::error::{Error, Result};

use super::{PacketSink, StreamIo, TransferHandler};

fn transport_err(e: quiche::Error) -> Error {
    Error::Transport {
        message: e.to_string(),
    }
}

/// The slice of the engine handed to pipeline callbacks.
struct EngineIo<'a> {
    conn: &'a mut quiche::Connection,
    next_stream_id: &'a mut u64,
    seen_streams: &'a mut HashSet<u64>,
}

impl StreamIo for EngineIo<'_> {
    fn open_stream(&mut self) -> Result<u64> {
        // Client-initiated bidirectional ids: 0, 4, 8, ...
        let id = *self.next_stream_id;
        *self.next_stream_id += 4;
        self.seen_streams.insert(id);
        Ok(id)
    }

    fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize> {
        match self.conn.stream_send(stream_id, data, fin) {
            Ok(n) => Ok(n),
            Err(quiche::Error::Done) => Ok(0),
            Err(e) => Err(transport_err(e)),
        }
    }

    fn stream_recv(&mut self, stream_id: u64, buf: &mut [u8]) -> Result<Option<(usize, bool)>> {
        match self.conn.stream_recv(stream_id, buf) {
            Ok((n, fin)) => Ok(Some((n, fin))),
            Err(quiche::Error::Done) => Ok(None),
            Err(e) => Err(transport_err(e)),
        }
    }

    fn stream_finish(&mut self, stream_id: u64) -> Result<()> {
        // A zero-length fin needs no flow-control capacity.
        match self.conn.stream_send(stream_id, &[], true) {
            Ok(_) | Err(quiche::Error::Done) => Ok(()),
            Err(e) => Err(transport_err(e)),
        }
    }

    fn close(&mut self, code: u64, reason: &[u8]) {
        let _ = self.conn.close(true, code, reason);
    }
}

/// Scheduler for one connection and its pipeline.
pub struct ConnectionDriver<H: TransferHandler> {
    conn: quiche::Connection,
    handler: H,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    next_stream_id: u64,
    seen_streams: HashSet<u64>,
    /// Packets the sink refused; retried before polling the engine again.
    pending_egress: VecDeque<Vec<u8>>,
    send_buf: Vec<u8>,
    connected_delivered: bool,
    closed_delivered: bool,
}

impl<H: TransferHandler> ConnectionDriver<H> {
    /// Connect out to the peer (sender side).
    pub fn connect(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: &mut quiche::Config,
        handler: H,
    ) -> Result<Self> {
        let scid = random_scid();
        let scid = quiche::ConnectionId::from_ref(&scid);
        let conn = quiche::connect(Some(TLS_SERVER_NAME), &scid, local_addr, peer_addr, config)
            .map_err(transport_err)?;
        debug!(%local_addr, %peer_addr, "connecting");
        Ok(Self::new(conn, local_addr, peer_addr, handler))
    }

    /// Accept the peer's incoming connection (receiver side). The address
    /// pair is already selected, so no routing by connection id is needed;
    /// the first datagrams are simply fed in via `recv_datagram`.
    pub fn accept(
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        config: &mut quiche::Config,
        handler: H,
    ) -> Result<Self> {
        let scid = random_scid();
        let scid = quiche::ConnectionId::from_ref(&scid);
        let conn = quiche::accept(&scid, None, local_addr, peer_addr, config)
            .map_err(transport_err)?;
        debug!(%local_addr, %peer_addr, "accepting");
        Ok(Self::new(conn, local_addr, peer_addr, handler))
    }

    fn new(
        conn: quiche::Connection,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        handler: H,
    ) -> Self {
        Self {
            conn,
            handler,
            local_addr,
            peer_addr,
            next_stream_id: 0,
            seen_streams: HashSet::new(),
            pending_egress: VecDeque::new(),
            send_buf: vec![0u8; MAX_RECV_UDP_PAYLOAD],
            connected_delivered: false,
            closed_delivered: false,
        }
    }

    /// Feed one ingress datagram from the selected peer path.
    pub fn recv_datagram(&mut self, data: &mut [u8], from: SocketAddr) -> Result<()> {
        let info = quiche::RecvInfo {
            from,
            to: self.local_addr,
        };
        match self.conn.recv(data, info) {
            Ok(n) => {
                trace!(bytes = n, "ingress datagram");
                Ok(())
            }
            Err(quiche::Error::Done) => Ok(()),
            Err(e) => {
                warn!(error = %e, "engine rejected datagram");
                Err(transport_err(e))
            }
        }
    }

    /// One process step: dispatch ready callbacks, then drain egress.
    pub fn process(&mut self, sink: &mut dyn PacketSink) -> Result<()> {
        self.dispatch_callbacks();
        self.flush_egress(sink)?;
        if self.conn.is_closed() && !self.closed_delivered {
            self.closed_delivered = true;
            debug!(peer = %self.peer_addr, "connection closed");
            self.handler.on_conn_closed();
        }
        Ok(())
    }

    /// The engine's next advisory tick. Falls back to a heartbeat when the
    /// engine has nothing scheduled. The caller arms exactly one timer and
    /// calls `on_timeout` followed by `process` when it fires.
    pub fn timeout(&self) -> Duration {
        self.conn.timeout().unwrap_or(HEARTBEAT_INTERVAL)
    }

    /// The armed timer fired without traffic.
    pub fn on_timeout(&mut self) {
        self.conn.on_timeout();
    }

    pub fn is_established(&self) -> bool {
        self.conn.is_established()
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    /// True once the attached pipeline considers the transfer finished.
    pub fn is_complete(&self) -> bool {
        self.handler.is_complete()
    }

    /// The close frame the peer sent, if one arrived. A transfer that ends
    /// with a peer error surfaces as incomplete; the error says why.
    pub fn peer_error(&self) -> Option<&quiche::ConnectionError> {
        self.conn.peer_error()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    fn dispatch_callbacks(&mut self) {
        if self.conn.is_closed() {
            return;
        }

        if !self.connected_delivered && self.conn.is_established() {
            self.connected_delivered = true;
            debug!(peer = %self.peer_addr, "transport established");
            self.with_io(|handler, io| handler.on_connected(io));
        }
        if !self.connected_delivered {
            return;
        }

        let readable: Vec<u64> = self.conn.readable().collect();
        for stream_id in readable {
            if self.conn.is_closed() {
                return;
            }
            if self.seen_streams.insert(stream_id) {
                self.with_io(|handler, io| handler.on_new_stream(io, stream_id));
            }
            self.with_io(|handler, io| handler.on_readable(io, stream_id));
        }

        let writable: Vec<u64> = self.conn.writable().collect();
        for stream_id in writable {
            if self.conn.is_closed() {
                return;
            }
            self.with_io(|handler, io| handler.on_writable(io, stream_id));
        }

        if !self.conn.is_closed() {
            let now = Instant::now();
            self.with_io(|handler, io| handler.on_tick(io, now));
        }
    }

    /// Run one handler callback with engine access, catching errors at the
    /// boundary. Fatal errors close the connection; the durable cursor on
    /// the receiver stays authoritative.
    fn with_io(&mut self, f: impl FnOnce(&mut H, &mut dyn StreamIo) -> Result<()>) {
        let result = {
            let Self {
                conn,
                handler,
                next_stream_id,
                seen_streams,
                ..
            } = self;
            let mut io = EngineIo {
                conn,
                next_stream_id,
                seen_streams,
            };
            f(handler, &mut io)
        };
        if let Err(e) = result {
            if e.is_fatal() {
                error!(error = %e, "pipeline error; closing connection");
                let _ = self.conn.close(true, 0x1, e.to_string().as_bytes());
            } else {
                warn!(error = %e, "non-fatal pipeline error");
            }
        }
    }

    /// Drain outgoing packets into the sink, at most `MAX_SEND_BATCH` per
    /// call, all addressed to the selected peer. On partial acceptance the
    /// remainder is parked and retried before the engine is polled again.
    fn flush_egress(&mut self, sink: &mut dyn PacketSink) -> Result<()> {
        loop {
            // Retry parked packets first so ordering is preserved.
            while !self.pending_egress.is_empty() {
                let batch: Vec<Vec<u8>> = {
                    let take = self.pending_egress.len().min(MAX_SEND_BATCH);
                    self.pending_egress.drain(..take).collect()
                };
                let accepted = sink.send_packets(self.peer_addr, &batch)?;
                if accepted < batch.len() {
                    for packet in batch.into_iter().skip(accepted).rev() {
                        self.pending_egress.push_front(packet);
                    }
                    return Ok(());
                }
            }

            let mut batch: Vec<Vec<u8>> = Vec::new();
            loop {
                match self.conn.send(&mut self.send_buf) {
                    Ok((n, _info)) => {
                        batch.push(self.send_buf[..n].to_vec());
                        if batch.len() == MAX_SEND_BATCH {
                            break;
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => return Err(transport_err(e)),
                }
            }
            if batch.is_empty() {
                return Ok(());
            }

            let accepted = sink.send_packets(self.peer_addr, &batch)?;
            if accepted < batch.len() {
                trace!(
                    accepted,
                    total = batch.len(),
                    "partial egress batch; parking remainder"
                );
                self.pending_egress.extend(batch.into_iter().skip(accepted));
                return Ok(());
            }
        }
    }
}

fn random_scid() -> [u8; quiche::MAX_CONN_ID_LEN] {
    let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
    rand::rng().fill_bytes(&mut scid);
    scid
}

// =============================================================================
// Production drive loop
// =============================================================================

/// Packet sink over a UDP socket. Short writes stop the batch; the driver
/// retries the remainder on the next process step.
pub struct UdpPacketSink<'a> {
    pub socket: &'a tokio::net::UdpSocket,
}

impl PacketSink for UdpPacketSink<'_> {
    fn send_packets(&mut self, peer: SocketAddr, packets: &[Vec<u8>]) -> std::io::Result<usize> {
        let mut sent = 0;
        for packet in packets {
            match self.socket.try_send_to(packet, peer) {
                Ok(_) => sent += 1,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(sent)
    }
}

/// Drive a connection over a UDP socket until it closes.
///
/// Single-threaded cooperative: one pending timer at a time, armed from the
/// engine's advisory tick; every ingress batch is followed by a process
/// step.
pub async fn drive<H: TransferHandler>(
    driver: &mut ConnectionDriver<H>,
    socket: &tokio::net::UdpSocket,
) -> Result<()> {
    let mut buf = vec![0u8; MAX_RECV_UDP_PAYLOAD];
    loop {
        driver.process(&mut UdpPacketSink { socket })?;
        if driver.is_closed() {
            return Ok(());
        }

        let timeout = driver.timeout();
        match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                driver.recv_datagram(&mut buf[..len], from)?;
                // Drain whatever else already arrived before processing.
                loop {
                    match socket.try_recv_from(&mut buf) {
                        Ok((len, from)) => driver.recv_datagram(&mut buf[..len], from)?,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => driver.on_timeout(),
        }
    }
}
