//! Sender and receiver pipelines.
//!
//! Both sides attach to a `ConnectionDriver` as its `TransferHandler` and
//! hold every piece of per-transfer state themselves; nothing about transfer
//! progress lives in globals.

pub mod receiver;
pub mod sender;

pub use receiver::ReceiverPipeline;
pub use sender::SenderPipeline;

use crate::constants::{DATA_STREAM_TAG, MANIFEST_STREAM_TAG};

/// What a stream turned out to be, decided by its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// First byte not yet consumed.
    Unknown,
    /// Carries the manifest and both ACK codes.
    Manifest,
    /// Carries the raw logical byte sequence.
    Data,
}

impl StreamKind {
    /// Classify a stream by its tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            MANIFEST_STREAM_TAG => Some(StreamKind::Manifest),
            DATA_STREAM_TAG => Some(StreamKind::Data),
            _ => None,
        }
    }
}

/// In-memory `StreamIo` for exercising pipeline state machines without an
/// engine. Outbound bytes accumulate per stream; inbound bytes are queued by
/// the test and drained by `stream_recv`.
#[cfg(test)]
pub(crate) mod testio {
    use std::collections::{HashMap, HashSet, VecDeque};

    use crate::error::Result;
    use crate::transport::StreamIo;

    #[derive(Default)]
    pub struct FakeIo {
        pub next_stream_id: u64,
        pub opened: Vec<u64>,
        pub sent: HashMap<u64, Vec<u8>>,
        pub fin_sent: HashSet<u64>,
        /// Remaining send budget in bytes; models transport flow control.
        /// Once exhausted, `stream_send` accepts nothing until the test
        /// raises it again.
        pub send_capacity: usize,
        inbound: HashMap<u64, VecDeque<u8>>,
        inbound_fin: HashSet<u64>,
        pub closed: Option<(u64, Vec<u8>)>,
    }

    impl FakeIo {
        pub fn new() -> Self {
            Self {
                send_capacity: usize::MAX,
                ..Self::default()
            }
        }

        /// Queue bytes for the pipeline to read from `stream_id`.
        pub fn push_inbound(&mut self, stream_id: u64, data: &[u8], fin: bool) {
            self.inbound.entry(stream_id).or_default().extend(data);
            if fin {
                self.inbound_fin.insert(stream_id);
            }
        }

        pub fn sent_on(&self, stream_id: u64) -> &[u8] {
            self.sent.get(&stream_id).map(|v| v.as_slice()).unwrap_or(&[])
        }
    }

    impl StreamIo for FakeIo {
        fn open_stream(&mut self) -> Result<u64> {
            let id = self.next_stream_id;
            self.next_stream_id += 4;
            self.opened.push(id);
            Ok(id)
        }

        fn stream_send(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<usize> {
            let n = data.len().min(self.send_capacity);
            self.send_capacity -= n;
            self.sent.entry(stream_id).or_default().extend(&data[..n]);
            if fin && n == data.len() {
                self.fin_sent.insert(stream_id);
            }
            Ok(n)
        }

        fn stream_recv(
            &mut self,
            stream_id: u64,
            buf: &mut [u8],
        ) -> Result<Option<(usize, bool)>> {
            let queue = self.inbound.entry(stream_id).or_default();
            if queue.is_empty() {
                return if self.inbound_fin.remove(&stream_id) {
                    Ok(Some((0, true)))
                } else {
                    Ok(None)
                };
            }
            let n = buf.len().min(queue.len());
            for slot in buf.iter_mut().take(n) {
                *slot = queue.pop_front().unwrap();
            }
            let fin = queue.is_empty() && self.inbound_fin.remove(&stream_id);
            Ok(Some((n, fin)))
        }

        fn stream_finish(&mut self, stream_id: u64) -> Result<()> {
            self.fin_sent.insert(stream_id);
            Ok(())
        }

        fn close(&mut self, code: u64, reason: &[u8]) {
            self.closed = Some((code, reason.to_vec()));
        }
    }
}
