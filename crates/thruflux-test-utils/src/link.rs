//! In-memory datagram link between two connection drivers.
//!
//! Lossless and synchronous: every process step's egress is delivered to
//! the peer before the peer runs. Timers only fire when a round moves no
//! packets at all, which keeps runs deterministic.

use std::collections::VecDeque;
use std::net::SocketAddr;

use thruflux_core::transport::{ConnectionDriver, PacketSink, TransferHandler};
use thruflux_core::{Error, Result};

/// Packet sink that queues datagrams for hand delivery. An optional budget
/// caps how many packets each `send_packets` call accepts, to exercise the
/// scheduler's partial-acceptance path.
#[derive(Debug, Default)]
pub struct QueuePacketSink {
    pub packets: VecDeque<Vec<u8>>,
    pub budget: Option<usize>,
}

impl QueuePacketSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            budget: Some(budget),
        }
    }
}

impl PacketSink for QueuePacketSink {
    fn send_packets(&mut self, _peer: SocketAddr, packets: &[Vec<u8>]) -> std::io::Result<usize> {
        let take = self.budget.unwrap_or(usize::MAX).min(packets.len());
        for packet in &packets[..take] {
            self.packets.push_back(packet.clone());
        }
        Ok(take)
    }
}

fn deliver<H: TransferHandler>(
    sink: &mut QueuePacketSink,
    to: &mut ConnectionDriver<H>,
    from: SocketAddr,
) -> Result<usize> {
    let mut moved = 0;
    while let Some(mut packet) = sink.packets.pop_front() {
        if to.is_closed() {
            continue;
        }
        to.recv_datagram(&mut packet, from)?;
        moved += 1;
    }
    Ok(moved)
}

/// Pump both drivers until both report completion.
///
/// Returns an error if either side hits a transport failure or the round
/// cap is reached first.
pub fn run_to_completion<A: TransferHandler, B: TransferHandler>(
    client: &mut ConnectionDriver<A>,
    server: &mut ConnectionDriver<B>,
    max_rounds: usize,
) -> Result<()> {
    let mut client_sink = QueuePacketSink::new();
    let mut server_sink = QueuePacketSink::new();
    let client_addr = client.local_addr();
    let server_addr = server.local_addr();

    for _ in 0..max_rounds {
        client.process(&mut client_sink)?;
        let to_server = deliver(&mut client_sink, server, client_addr)?;
        server.process(&mut server_sink)?;
        let to_client = deliver(&mut server_sink, client, server_addr)?;

        if client.is_complete() && server.is_complete() {
            return Ok(());
        }
        if to_server == 0 && to_client == 0 {
            // Nothing in flight on a lossless link: let timers run.
            client.on_timeout();
            server.on_timeout();
        }
    }

    Err(Error::Transport {
        message: format!("transfer did not complete within {max_rounds} rounds"),
    })
}
