//! Receiver pipeline.
//!
//! Consumes the manifest on the first incoming stream, prepares the output
//! tree (directories, preallocation, resume cursor), answers with a resume
//! ACK, then writes the raw logical byte sequence from the data stream to
//! pinned file handles. The durable cursor trails the last fully written
//! byte at all times, so an interrupted transfer resumes exactly where disk
//! state ends.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use tracing::{debug, info, warn};

use crate::cache::FileHandleCache;
use crate::config::TransferConfig;
use crate::constants::{COMPLETE_ACK, RESUME_ACK};
use crate::error::{Error, Result};
use crate::manifest::{codec, Manifest};
use crate::metrics::{PathClass, TransferMetrics, TransferSnapshot};
use crate::resume::{self, ResumeCursor, ResumeStore};
use crate::transfer::StreamKind;
use crate::transport::{StreamIo, TransferHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiverState {
    AwaitManifest,
    SendResumeAck,
    RecvData,
    SendCompleteAck,
    Complete,
}

/// Per-session receiver state machine.
pub struct ReceiverPipeline {
    config: TransferConfig,
    state: ReceiverState,
    /// Stream kinds, decided by each stream's first byte.
    kinds: std::collections::HashMap<u64, StreamKind>,
    manifest_stream: Option<u64>,
    data_stream: Option<u64>,
    manifest_buf: BytesMut,
    manifest: Option<Manifest>,
    /// File sizes indexed by id; filled once the manifest is installed.
    sizes: Vec<u64>,
    cache: FileHandleCache,
    store: Option<ResumeStore>,
    cursor: ResumeCursor,
    pinned: Option<(u32, Arc<File>)>,
    chunk: Vec<u8>,
    /// Control bytes queued for the manifest stream.
    ack_out: Vec<u8>,
    metrics: TransferMetrics,
}

impl ReceiverPipeline {
    pub fn new(config: TransferConfig, path_class: PathClass) -> Self {
        let cache = FileHandleCache::new(config.fd_cache_capacity);
        let chunk = vec![0u8; config.chunk_size];
        Self {
            config,
            state: ReceiverState::AwaitManifest,
            kinds: std::collections::HashMap::new(),
            manifest_stream: None,
            data_stream: None,
            manifest_buf: BytesMut::new(),
            manifest: None,
            sizes: Vec::new(),
            cache,
            store: None,
            cursor: ResumeCursor::ZERO,
            pinned: None,
            chunk,
            ack_out: Vec::new(),
            metrics: TransferMetrics::new(path_class),
        }
    }

    pub fn metrics(&self) -> &TransferMetrics {
        &self.metrics
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.metrics.snapshot()
    }

    /// Current durable position in the logical byte sequence.
    pub fn cursor(&self) -> ResumeCursor {
        self.cursor
    }

    /// The installed catalogue, once the manifest stream has delivered it.
    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    fn file_count(&self) -> u32 {
        self.sizes.len() as u32
    }

    fn classify_stream(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<bool> {
        let mut tag = [0u8; 1];
        let fin = match io.stream_recv(stream_id, &mut tag)? {
            Some((1, fin)) => fin,
            Some((0, true)) => {
                // Stream closed before carrying a tag; nothing to do.
                self.kinds.remove(&stream_id);
                return Ok(false);
            }
            _ => return Ok(false),
        };

        let kind = StreamKind::from_tag(tag[0]).ok_or_else(|| Error::Protocol {
            message: format!("unknown stream tag {:#04x}", tag[0]),
        })?;

        match kind {
            StreamKind::Manifest => {
                if self.manifest_stream.is_some() {
                    return Err(Error::Protocol {
                        message: "second manifest stream on one connection".into(),
                    });
                }
                self.manifest_stream = Some(stream_id);
                if fin {
                    // Tag with an immediate fin means an empty blob; the
                    // decoder rejects it with the right error.
                    self.kinds.insert(stream_id, kind);
                    self.install_manifest(io)?;
                    return Ok(false);
                }
            }
            StreamKind::Data => {
                if self.data_stream.is_some() {
                    return Err(Error::Protocol {
                        message: "second data stream on one connection".into(),
                    });
                }
                if fin {
                    return Err(Error::TransportClosed);
                }
                self.data_stream = Some(stream_id);
                self.metrics.mark_started(Instant::now());
            }
            StreamKind::Unknown => unreachable!("from_tag never yields Unknown"),
        }
        self.kinds.insert(stream_id, kind);
        debug!(stream_id, ?kind, "stream classified");
        Ok(true)
    }

    fn read_manifest(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()> {
        if self.state != ReceiverState::AwaitManifest {
            return Ok(());
        }
        let mut scratch = [0u8; 4096];
        while let Some((n, fin)) = io.stream_recv(stream_id, &mut scratch)? {
            self.manifest_buf.extend_from_slice(&scratch[..n]);
            if fin {
                self.install_manifest(io)?;
                return Ok(());
            }
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Decode the complete manifest, prepare the output tree, load the
    /// resume cursor, and queue the resume ACK.
    fn install_manifest(&mut self, io: &mut dyn StreamIo) -> Result<()> {
        let manifest = codec::decode(&self.manifest_buf)?;
        let fingerprint = codec::fingerprint(&self.manifest_buf);
        info!(
            files = manifest.file_count(),
            total_bytes = manifest.total_bytes(),
            fingerprint,
            "manifest received"
        );

        self.prepare_output_tree(&manifest)?;

        let mut store =
            ResumeStore::load(&self.config.output_dir, fingerprint, self.config.overwrite)?;
        let cursor = resume::normalize(store.cursor(), &manifest);
        store.reset(cursor);

        let skipped = manifest.logical_offset(cursor.file_id, cursor.offset);
        self.metrics.resume_from(skipped, cursor.file_id);
        if skipped > 0 {
            info!(
                file_id = cursor.file_id,
                offset = cursor.offset,
                skipped_bytes = skipped,
                "resuming from durable cursor"
            );
        }

        self.cursor = cursor;
        self.sizes = manifest.files().iter().map(|f| f.size).collect();
        self.manifest = Some(manifest);

        // Durable before the ACK leaves: the sender must never be told a
        // position the disk does not back.
        store.flush()?;
        self.store = Some(store);

        self.ack_out.push(RESUME_ACK);
        self.ack_out.extend_from_slice(&cursor.file_id.to_le_bytes());
        self.ack_out.extend_from_slice(&cursor.offset.to_le_bytes());
        self.state = ReceiverState::SendResumeAck;
        self.flush_acks(io)
    }

    /// Create parent directories, register every path with the handle
    /// cache, and size files up (preallocation) or down (stale tails).
    fn prepare_output_tree(&mut self, manifest: &Manifest) -> Result<()> {
        for entry in manifest.files() {
            let full = self.resolve_output_path(&entry.relative_path)?;
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let file = OpenOptions::new().write(true).create(true).open(&full)?;
            let on_disk = file.metadata()?.len();
            if on_disk > entry.size {
                file.set_len(entry.size)?;
            }
            if entry.size >= self.config.prealloc_threshold && on_disk < entry.size {
                if let Err(e) = preallocate(&file, entry.size) {
                    let err = Error::PreallocFailed {
                        path: entry.relative_path.clone(),
                        source: e,
                    };
                    warn!(error = %err, "continuing without preallocation");
                }
            }

            self.cache.register(entry.id, full);
        }
        Ok(())
    }

    /// Resolve a manifest path beneath the output root. The codec already
    /// rejected traversal; this re-checks the joined result so no single
    /// layer is load-bearing.
    fn resolve_output_path(&self, relative: &str) -> Result<PathBuf> {
        let joined = self.config.output_dir.join(relative);
        for comp in Path::new(relative).components() {
            match comp {
                Component::Normal(_) => {}
                _ => {
                    return Err(Error::PathUnsafe {
                        path: relative.to_string(),
                    })
                }
            }
        }
        Ok(joined)
    }

    fn flush_acks(&mut self, io: &mut dyn StreamIo) -> Result<()> {
        let sid = match self.manifest_stream {
            Some(sid) => sid,
            None => return Ok(()),
        };
        loop {
            while !self.ack_out.is_empty() {
                let n = io.stream_send(sid, &self.ack_out, false)?;
                if n == 0 {
                    return Ok(());
                }
                self.ack_out.drain(..n);
            }
            match self.state {
                ReceiverState::SendResumeAck => {
                    if self.cursor.file_id == self.file_count() {
                        // Already complete from resume state alone.
                        debug!("resume cursor at end; skipping data phase");
                        self.queue_complete_ack();
                    } else {
                        self.state = ReceiverState::RecvData;
                        return Ok(());
                    }
                }
                ReceiverState::SendCompleteAck => {
                    self.finalize();
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    fn queue_complete_ack(&mut self) {
        self.ack_out.push(COMPLETE_ACK);
        self.state = ReceiverState::SendCompleteAck;
        if let Some(store) = &mut self.store {
            if let Err(e) = store.flush() {
                warn!(error = %e, "resume flush before completion ack failed");
            }
        }
    }

    /// Terminal state. The sender closes the connection after it consumes
    /// the completion ACK; closing from this side could race the ACK.
    fn finalize(&mut self) {
        self.state = ReceiverState::Complete;
        self.metrics.complete = true;
        self.release_pinned();
        info!(
            bytes_moved = self.metrics.bytes_moved,
            files_moved = self.metrics.files_moved,
            skipped_bytes = self.metrics.skipped_bytes,
            "transfer complete"
        );
    }

    fn read_data(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()> {
        if self.state != ReceiverState::RecvData {
            // The resume ACK has not fully left yet; per protocol the
            // sender cannot have data in flight. Leave bytes in the
            // transport and let flow control push back.
            return Ok(());
        }
        let count = self.file_count();

        loop {
            debug_assert!(self.cursor.file_id < count);
            let size = self.sizes[self.cursor.file_id as usize];
            let remaining = size - self.cursor.offset;
            let to_read = remaining.min(self.chunk.len() as u64) as usize;

            let (n, fin) = match io.stream_recv(stream_id, &mut self.chunk[..to_read])? {
                Some(progress) => progress,
                None => return Ok(()),
            };

            if n > 0 {
                self.write_chunk(n)?;

                if self.cursor.offset == size {
                    self.advance_file(count);
                    if self.cursor.file_id == count {
                        self.queue_complete_ack();
                        return self.flush_acks(io);
                    }
                }
            }

            if fin {
                // Half-close before the catalogue is exhausted loses data.
                return Err(Error::TransportClosed);
            }
        }
    }

    /// Write one received chunk at the cursor and advance it. A short
    /// write never advances the cursor past the last fully written byte.
    fn write_chunk(&mut self, n: usize) -> Result<()> {
        let file_id = self.cursor.file_id;
        if self.pinned.as_ref().map(|(id, _)| *id) != Some(file_id) {
            self.release_pinned();
            let handle = self.cache.acquire(file_id, true)?;
            self.pinned = Some((file_id, handle));
        }
        let handle = &self.pinned.as_ref().expect("handle pinned above").1;

        write_full_at(handle, file_id, &self.chunk[..n], self.cursor.offset)?;

        self.cursor.offset += n as u64;
        self.metrics.record_bytes(n);
        if let Some(store) = &mut self.store {
            store.advance(self.cursor);
        }
        Ok(())
    }

    fn advance_file(&mut self, count: u32) {
        self.release_pinned();
        self.metrics.record_file();
        self.cursor.file_id += 1;
        self.cursor.offset = 0;
        // Zero-size files carry no data bytes; they were created at
        // manifest time and complete by advancing over them.
        while self.cursor.file_id < count && self.sizes[self.cursor.file_id as usize] == 0 {
            self.metrics.record_file();
            self.cursor.file_id += 1;
        }
        if let Some(store) = &mut self.store {
            store.advance(self.cursor);
        }
    }

    fn release_pinned(&mut self) {
        if let Some((id, handle)) = self.pinned.take() {
            drop(handle);
            self.cache.release(id);
        }
    }
}

impl TransferHandler for ReceiverPipeline {
    fn on_connected(&mut self, _io: &mut dyn StreamIo) -> Result<()> {
        // The sender opens every stream; nothing to do yet.
        Ok(())
    }

    fn on_new_stream(&mut self, _io: &mut dyn StreamIo, stream_id: u64) -> Result<()> {
        self.kinds.insert(stream_id, StreamKind::Unknown);
        Ok(())
    }

    fn on_readable(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()> {
        if self.kinds.get(&stream_id).copied() == Some(StreamKind::Unknown)
            && !self.classify_stream(io, stream_id)?
        {
            return Ok(());
        }

        match self.kinds.get(&stream_id).copied() {
            Some(StreamKind::Manifest) => self.read_manifest(io, stream_id),
            Some(StreamKind::Data) => self.read_data(io, stream_id),
            _ => Ok(()),
        }
    }

    fn on_writable(&mut self, io: &mut dyn StreamIo, stream_id: u64) -> Result<()> {
        if Some(stream_id) == self.manifest_stream && !self.ack_out.is_empty() {
            self.flush_acks(io)
        } else {
            Ok(())
        }
    }

    fn on_tick(&mut self, _io: &mut dyn StreamIo, now: Instant) -> Result<()> {
        if let Some(store) = &mut self.store {
            store.maybe_flush(now)?;
        }
        self.metrics.sample(now);
        Ok(())
    }

    fn on_conn_closed(&mut self) {
        if let Some(store) = &mut self.store {
            if let Err(e) = store.flush() {
                warn!(error = %e, "final resume flush failed");
            }
        }
        if !self.metrics.complete {
            warn!(
                file_id = self.cursor.file_id,
                offset = self.cursor.offset,
                bytes_moved = self.metrics.bytes_moved,
                "connection closed before completion; cursor is durable"
            );
        }
        self.release_pinned();
        self.cache.close_all();
    }

    fn is_complete(&self) -> bool {
        self.state == ReceiverState::Complete
    }
}

/// Write a whole chunk at `offset`. A zero-length write is a distinct
/// failure from an I/O error: it names how much actually landed, and the
/// caller's cursor stays at the last fully written byte either way.
fn write_full_at(handle: &File, file_id: u32, buf: &[u8], offset: u64) -> Result<()> {
    let mut written = 0;
    while written < buf.len() {
        match handle.write_at(&buf[written..], offset + written as u64) {
            Ok(0) => {
                return Err(Error::ShortWrite {
                    file_id,
                    offset,
                    expected: buf.len(),
                    written,
                })
            }
            Ok(n) => written += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(Error::WriteFailed {
                    file_id,
                    offset: offset + written as u64,
                    source: e,
                })
            }
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, size: u64) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;
    nix::fcntl::fallocate(
        file.as_raw_fd(),
        nix::fcntl::FallocateFlags::empty(),
        0,
        size as i64,
    )
    .map_err(std::io::Error::from)
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, size: u64) -> std::io::Result<()> {
    file.set_len(size)
}
