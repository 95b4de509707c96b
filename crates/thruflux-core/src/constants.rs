//! Protocol and configuration constants for thruflux.

use std::time::Duration;

// =============================================================================
// Wire Protocol
// =============================================================================

/// ALPN identifier for QUIC connections.
pub const ALPN: &[u8] = b"thruflux";

/// TLS server name presented by the receiver's self-signed certificate.
pub const TLS_SERVER_NAME: &str = "thruflux.local";

/// First byte of a manifest stream.
pub const MANIFEST_STREAM_TAG: u8 = 0x00;

/// First byte of a data stream.
pub const DATA_STREAM_TAG: u8 = 0x01;

/// Control code on the manifest stream: resume ACK, followed by the cursor.
pub const RESUME_ACK: u8 = 0x06;

/// Control code on the manifest stream: transfer complete.
pub const COMPLETE_ACK: u8 = 0x07;

/// Wire size of the resume ACK: code + fileId (u32) + offset (u64).
pub const RESUME_ACK_LEN: usize = 1 + 4 + 8;

/// The manifest stream is the sender's first bidirectional stream.
pub const MANIFEST_STREAM_ID: u64 = 0;

/// The data stream is the sender's second bidirectional stream.
pub const DATA_STREAM_ID: u64 = 4;

// =============================================================================
// Pipeline Defaults
// =============================================================================

/// Default I/O chunk size. Controls resume granularity and scheduling.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Lower bound for the configurable chunk size.
pub const MIN_CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound for the configurable chunk size.
pub const MAX_CHUNK_SIZE: usize = 16 * 1024 * 1024;

/// Files at or above this size are preallocated to their full extent.
pub const DEFAULT_PREALLOC_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Default capacity of the file-handle cache.
pub const DEFAULT_FD_CACHE_CAPACITY: usize = 128;

// =============================================================================
// Resume State
// =============================================================================

/// Resume state file name: `<prefix><fingerprint_decimal><suffix>`.
pub const RESUME_STATE_PREFIX: &str = ".thruflux_resume_";

/// Resume state file extension.
pub const RESUME_STATE_SUFFIX: &str = ".state";

/// On-disk size of the resume cursor: fileId (u32) + offset (u64).
pub const RESUME_STATE_LEN: usize = 4 + 8;

/// Minimum interval between timer-driven resume cursor flushes.
pub const RESUME_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Scheduler / Transport Adapter
// =============================================================================

/// Maximum datagrams handed to the packet sink in one batch.
pub const MAX_SEND_BATCH: usize = 64;

/// Heartbeat used when the engine reports no advisory tick.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum outgoing UDP payload size.
pub const MAX_SEND_UDP_PAYLOAD: usize = 1350;

/// Maximum incoming UDP payload size.
pub const MAX_RECV_UDP_PAYLOAD: usize = 65535;

/// Default connection-level flow-control window.
pub const DEFAULT_CONN_WINDOW: u64 = 256 * 1024 * 1024;

/// Default per-stream flow-control window.
pub const DEFAULT_STREAM_WINDOW: u64 = 32 * 1024 * 1024;

/// Sender-side idle timeout. The sender gives up on a silent receiver
/// faster than the receiver gives up on it, so a crashed receiver frees
/// the sender's slot promptly.
pub const SENDER_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

/// Receiver-side idle timeout.
pub const RECEIVER_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alpn_is_eight_bytes() {
        assert_eq!(ALPN.len(), 8);
        assert_eq!(ALPN, b"thruflux");
    }

    #[test]
    fn chunk_bounds_bracket_default() {
        assert!(MIN_CHUNK_SIZE <= DEFAULT_CHUNK_SIZE);
        assert!(DEFAULT_CHUNK_SIZE <= MAX_CHUNK_SIZE);
    }

    #[test]
    fn stream_ids_follow_client_bidi_numbering() {
        // Client-initiated bidirectional streams are 0, 4, 8, ...
        assert_eq!(MANIFEST_STREAM_ID % 4, 0);
        assert_eq!(DATA_STREAM_ID, MANIFEST_STREAM_ID + 4);
    }

    #[test]
    fn windows_are_ordered() {
        assert!(DEFAULT_STREAM_WINDOW <= DEFAULT_CONN_WINDOW);
    }

    #[test]
    fn sender_gives_up_before_receiver() {
        assert!(SENDER_IDLE_TIMEOUT < RECEIVER_IDLE_TIMEOUT);
    }
}
