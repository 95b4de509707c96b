//! Sender pipeline.
//!
//! One pipeline per receiver connection. The manifest goes out on the first
//! bidirectional stream; the resume ACK comes back on the same stream and
//! seeks the logical cursor; raw file bytes then flow on a single data
//! stream until the receiver acknowledges completion.
//!
//! All file reads happen inside `on_writable`, one chunk at a time, pacing
//! disk I/O to whatever the transport will actually accept.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cache::FileHandleCache;
use crate::config::TransferConfig;
use crate::constants::{
    COMPLETE_ACK, DATA_STREAM_TAG, MANIFEST_STREAM_TAG, RESUME_ACK, RESUME_ACK_LEN,
};
use crate::error::{Error, Result};
use crate::manifest::SourceIndex;
use crate::metrics::{PathClass, TransferMetrics, TransferSnapshot};
use crate::resume::{self, ResumeCursor};
use crate::transport::{StreamIo, TransferHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SenderState {
    Init,
    SendManifest,
    AwaitResumeAck,
    StreamData,
    AwaitCompleteAck,
    Closed,
}

/// Per-connection sender state machine.
pub struct SenderPipeline {
    source: Arc<SourceIndex>,
    /// Signaling-assigned id of the receiver behind this connection.
    receiver_id: String,
    cache: FileHandleCache,
    state: SenderState,
    manifest_stream: Option<u64>,
    data_stream: Option<u64>,
    manifest_tag_sent: bool,
    data_tag_sent: bool,
    manifest_sent: usize,
    /// Control bytes received on the manifest stream, pending parse.
    ack_buf: Vec<u8>,
    current_file: usize,
    file_offset: u64,
    pinned: Option<(u32, Arc<File>)>,
    chunk: Vec<u8>,
    buf_ready: usize,
    buf_sent: usize,
    metrics: TransferMetrics,
}

impl SenderPipeline {
    /// Attach a pipeline to a shared source catalogue. One pipeline serves
    /// one receiver.
    pub fn new(
        source: Arc<SourceIndex>,
        config: &TransferConfig,
        path_class: PathClass,
        receiver_id: impl Into<String>,
    ) -> Self {
        let mut cache = FileHandleCache::new(config.fd_cache_capacity);
        for file in source.files() {
            cache.register(file.id, file.absolute_path.clone());
        }
        Self {
            source,
            receiver_id: receiver_id.into(),
            cache,
            state: SenderState::Init,
            manifest_stream: None,
            data_stream: None,
            manifest_tag_sent: false,
            data_tag_sent: false,
            manifest_sent: 0,
            ack_buf: Vec::new(),
            current_file: 0,
            file_offset: 0,
            pinned: None,
            chunk: vec![0u8; config.chunk_size],
            buf_ready: 0,
            buf_sent: 0,
            metrics: TransferMetrics::new(path_class),
        }
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.metrics.snapshot()
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    fn pump_manifest(&mut self, io: &mut dyn StreamIo) -> Result<()> {
        if self.state != SenderState::SendManifest {
            return Ok(());
        }
        let sid = self.manifest_stream.expect("manifest stream open");

        if !self.manifest_tag_sent {
            if io.stream_send(sid, &[MANIFEST_STREAM_TAG], false)? == 0 {
                return Ok(());
            }
            self.manifest_tag_sent = true;
        }

        let source = Arc::clone(&self.source);
        let blob = source.blob();
        while self.manifest_sent < blob.len() {
            let n = io.stream_send(sid, &blob[self.manifest_sent..], false)?;
            if n == 0 {
                return Ok(());
            }
            self.manifest_sent += n;
        }

        io.stream_finish(sid)?;
        self.state = SenderState::AwaitResumeAck;
        debug!(
            bytes = blob.len(),
            files = source.file_count(),
            "manifest sent"
        );
        Ok(())
    }

    fn process_acks(&mut self, io: &mut dyn StreamIo) -> Result<()> {
        while !self.ack_buf.is_empty() {
            match self.ack_buf[0] {
                RESUME_ACK => {
                    if self.ack_buf.len() < RESUME_ACK_LEN {
                        return Ok(());
                    }
                    let file_id =
                        u32::from_le_bytes(self.ack_buf[1..5].try_into().unwrap());
                    let offset = u64::from_le_bytes(self.ack_buf[5..13].try_into().unwrap());
                    self.ack_buf.drain(..RESUME_ACK_LEN);
                    self.handle_resume(io, file_id, offset)?;
                }
                COMPLETE_ACK => {
                    self.ack_buf.remove(0);
                    self.handle_complete(io)?;
                }
                code => {
                    return Err(Error::Protocol {
                        message: format!("unexpected control code {code:#04x} from receiver"),
                    });
                }
            }
        }
        Ok(())
    }

    fn handle_resume(&mut self, io: &mut dyn StreamIo, file_id: u32, offset: u64) -> Result<()> {
        if self.state != SenderState::AwaitResumeAck {
            return Err(Error::Protocol {
                message: "resume ack outside of manifest exchange".into(),
            });
        }

        let count = self.source.file_count();
        if file_id > count {
            return Err(Error::Protocol {
                message: format!("resume file id {file_id} beyond manifest of {count}"),
            });
        }
        if file_id == count && offset != 0 {
            return Err(Error::Protocol {
                message: format!("resume offset {offset} past end of catalogue"),
            });
        }
        if file_id < count {
            let size = self.source.manifest().size_of(file_id).unwrap_or(0);
            if offset > size {
                return Err(Error::Protocol {
                    message: format!(
                        "resume offset {offset} beyond file {file_id} of {size} bytes"
                    ),
                });
            }
        }

        // Seek the logical cursor, stepping over zero-size files.
        let cursor = resume::normalize(ResumeCursor { file_id, offset }, self.source.manifest());
        let skipped = self
            .source
            .manifest()
            .logical_offset(cursor.file_id, cursor.offset);
        self.metrics.resume_from(skipped, cursor.file_id.min(count));
        self.metrics.mark_started(Instant::now());
        info!(
            file_id = cursor.file_id,
            offset = cursor.offset,
            skipped_bytes = skipped,
            "resume ack received"
        );

        if cursor.file_id == count {
            // Nothing left to send; wait for the completion ack.
            self.state = SenderState::AwaitCompleteAck;
            return Ok(());
        }

        self.current_file = cursor.file_id as usize;
        self.file_offset = cursor.offset;
        self.state = SenderState::StreamData;
        self.data_stream = Some(io.open_stream()?);
        self.pump_data(io)
    }

    fn handle_complete(&mut self, io: &mut dyn StreamIo) -> Result<()> {
        if self.state != SenderState::AwaitCompleteAck {
            return Err(Error::Protocol {
                message: "completion ack before data stream finished".into(),
            });
        }
        self.state = SenderState::Closed;
        self.metrics.complete = true;
        info!(
            receiver_id = %self.receiver_id,
            bytes_moved = self.metrics.bytes_moved,
            files_moved = self.metrics.files_moved,
            "transfer complete"
        );
        io.close(0, b"complete");
        Ok(())
    }

    fn pump_data(&mut self, io: &mut dyn StreamIo) -> Result<()> {
        if self.state != SenderState::StreamData {
            return Ok(());
        }
        let sid = self.data_stream.expect("data stream open");

        if !self.data_tag_sent {
            if io.stream_send(sid, &[DATA_STREAM_TAG], false)? == 0 {
                return Ok(());
            }
            self.data_tag_sent = true;
        }

        loop {
            if self.buf_sent >= self.buf_ready {
                if !self.refill()? {
                    io.stream_finish(sid)?;
                    self.state = SenderState::AwaitCompleteAck;
                    debug!("data stream finished; awaiting completion ack");
                    return Ok(());
                }
            }

            let n = io.stream_send(sid, &self.chunk[self.buf_sent..self.buf_ready], false)?;
            if n == 0 {
                // Transport full; on_writable re-enters when capacity returns.
                return Ok(());
            }
            self.buf_sent += n;
            self.file_offset += n as u64;
            self.metrics.record_bytes(n);
        }
    }

    /// Position the cursor on the next unsent byte and stage one chunk.
    /// Returns false once the catalogue is exhausted.
    fn refill(&mut self) -> Result<bool> {
        let source = Arc::clone(&self.source);
        let files = source.files();

        while self.current_file < files.len()
            && self.file_offset >= files[self.current_file].size
        {
            self.release_pinned();
            self.metrics.record_file();
            self.current_file += 1;
            self.file_offset = 0;
        }
        if self.current_file >= files.len() {
            self.release_pinned();
            return Ok(false);
        }

        let file = &files[self.current_file];
        if self.pinned.as_ref().map(|(id, _)| *id) != Some(file.id) {
            self.release_pinned();
            let handle = self.cache.acquire(file.id, false)?;
            self.pinned = Some((file.id, handle));
        }

        let to_read = (file.size - self.file_offset).min(self.chunk.len() as u64) as usize;
        let handle = &self.pinned.as_ref().expect("handle pinned above").1;
        handle
            .read_exact_at(&mut self.chunk[..to_read], self.file_offset)
            .map_err(|e| Error::ReadFailed {
                file_id: file.id,
                offset: self.file_offset,
                message: e.to_string(),
            })?;

        self.buf_ready = to_read;
        self.buf_sent = 0;
        Ok(true)
    }

    fn release_pinned(&mut self) {
        if let Some((id, handle)) = self.pinned.take() {
            drop(handle);
            self.cache.release(id);
        }
    }
}

impl TransferHandler for SenderPipeline {
    fn on_connected(&mut self, io: &mut dyn StreamIo) -> Result<()> {
        debug_assert_eq!(self.state, SenderState::Init);
        self.manifest_stream = Some(io.open_stream()?);
        self.state = SenderState::SendManifest;
        self.pump_manifest(io)
    }

    fn on_new_stream(&mut self, _io: &mut dyn StreamIo, stream_id: u64) -> Result<()> {
        // The receiver opens no streams of its own.
        warn!(stream_id, "ignoring unexpected peer-initiated stream");
        Ok(())
    }

    fn on_readable(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()> {
        if Some(stream_id) != self.manifest_stream {
            return Ok(());
        }
        let mut scratch = [0u8; 256];
        while let Some((n, _fin)) = io.stream_recv(stream_id, &mut scratch)? {
            if n == 0 {
                break;
            }
            self.ack_buf.extend_from_slice(&scratch[..n]);
        }
        self.process_acks(io)
    }

    fn on_writable(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()> {
        if Some(stream_id) == self.manifest_stream {
            self.pump_manifest(io)
        } else if Some(stream_id) == self.data_stream {
            self.pump_data(io)
        } else {
            Ok(())
        }
    }

    fn on_tick(&mut self, _io: &mut dyn StreamIo, now: Instant) -> Result<()> {
        self.metrics.sample(now);
        Ok(())
    }

    fn on_conn_closed(&mut self) {
        if !self.metrics.complete {
            warn!(
                receiver_id = %self.receiver_id,
                bytes_moved = self.metrics.bytes_moved,
                files_moved = self.metrics.files_moved,
                "connection closed before completion"
            );
        }
        self.release_pinned();
        self.cache.close_all();
    }

    fn is_complete(&self) -> bool {
        self.metrics.complete
    }
}
