//! quiche configuration builders for the transfer connection.
//!
//! Both endpoints get wide flow-control windows (bulk transfer saturates
//! long fat paths), exactly two client bidirectional streams (manifest +
//! data), and no unidirectional streams. Idle timeouts differ by role: the
//! sender abandons a silent receiver after 15s, the receiver waits 30s.

use std::io::Write;
use std::time::Duration;

use crate::constants::{
    ALPN, DEFAULT_CONN_WINDOW, DEFAULT_STREAM_WINDOW, MAX_RECV_UDP_PAYLOAD,
    MAX_SEND_UDP_PAYLOAD, RECEIVER_IDLE_TIMEOUT, SENDER_IDLE_TIMEOUT,
};
use crate::error::{Error, Result};

/// Transport-level knobs applied to `quiche::Config`.
#[derive(Debug, Clone)]
pub struct TransportTuning {
    /// Connection-level flow-control window.
    pub conn_window: u64,
    /// Per-stream flow-control window.
    pub stream_window: u64,
    /// Idle timeout before the engine abandons a silent peer.
    pub idle_timeout: Duration,
    /// Maximum outgoing UDP payload size.
    pub max_send_udp_payload: usize,
}

impl TransportTuning {
    fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            conn_window: DEFAULT_CONN_WINDOW,
            stream_window: DEFAULT_STREAM_WINDOW,
            idle_timeout,
            max_send_udp_payload: MAX_SEND_UDP_PAYLOAD,
        }
    }

    /// Defaults for the sender endpoint (QUIC client).
    pub fn sender() -> Self {
        Self::with_idle_timeout(SENDER_IDLE_TIMEOUT)
    }

    /// Defaults for the receiver endpoint (QUIC server).
    pub fn receiver() -> Self {
        Self::with_idle_timeout(RECEIVER_IDLE_TIMEOUT)
    }
}

fn apply_tuning(config: &mut quiche::Config, tuning: &TransportTuning) {
    config.set_max_idle_timeout(tuning.idle_timeout.as_millis() as u64);
    config.set_max_recv_udp_payload_size(MAX_RECV_UDP_PAYLOAD);
    config.set_max_send_udp_payload_size(tuning.max_send_udp_payload);
    config.set_initial_max_data(tuning.conn_window);
    config.set_initial_max_stream_data_bidi_local(tuning.stream_window);
    config.set_initial_max_stream_data_bidi_remote(tuning.stream_window);
    config.set_initial_max_stream_data_uni(0);
    config.set_initial_max_streams_bidi(2);
    config.set_initial_max_streams_uni(0);
    config.set_disable_active_migration(true);
}

/// Create the sender-side (QUIC client) configuration.
pub fn client_config(tuning: &TransportTuning) -> Result<quiche::Config> {
    let mut config =
        quiche::Config::new(quiche::PROTOCOL_VERSION).map_err(|e| Error::Transport {
            message: format!("failed to create quiche config: {e}"),
        })?;

    config
        .set_application_protos(&[ALPN])
        .map_err(|e| Error::Transport {
            message: format!("failed to set ALPN: {e}"),
        })?;

    // The receiver presents a throwaway self-signed certificate.
    config.verify_peer(false);
    apply_tuning(&mut config, tuning);

    Ok(config)
}

/// Create the receiver-side (QUIC server) configuration with a certificate
/// and key in PEM form.
///
/// quiche loads credentials from file paths, so the PEM data is staged
/// through temp files.
pub fn server_config(
    tuning: &TransportTuning,
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<quiche::Config> {
    let mut config =
        quiche::Config::new(quiche::PROTOCOL_VERSION).map_err(|e| Error::Transport {
            message: format!("failed to create quiche config: {e}"),
        })?;

    config
        .set_application_protos(&[ALPN])
        .map_err(|e| Error::Transport {
            message: format!("failed to set ALPN: {e}"),
        })?;

    let temp_dir = std::env::temp_dir();
    let unique_id = format!(
        "{}-{:?}-{}",
        std::process::id(),
        std::thread::current().id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0)
    );
    let cert_path = temp_dir.join(format!("thruflux-cert-{unique_id}.pem"));
    let key_path = temp_dir.join(format!("thruflux-key-{unique_id}.pem"));

    write_pem(&cert_path, cert_pem)?;
    write_pem(&key_path, key_pem)?;

    let load_result = config
        .load_cert_chain_from_pem_file(cert_path.to_str().unwrap())
        .map_err(|e| Error::Certificate {
            message: format!("failed to load certificate: {e}"),
        })
        .and_then(|_| {
            config
                .load_priv_key_from_pem_file(key_path.to_str().unwrap())
                .map_err(|e| Error::Certificate {
                    message: format!("failed to load private key: {e}"),
                })
        });

    let _ = std::fs::remove_file(&cert_path);
    let _ = std::fs::remove_file(&key_path);
    load_result?;

    apply_tuning(&mut config, tuning);

    Ok(config)
}

fn write_pem(path: &std::path::Path, pem: &[u8]) -> Result<()> {
    let mut file = std::fs::File::create(path).map_err(|e| Error::Certificate {
        message: format!("failed to create temp PEM file: {e}"),
    })?;
    file.write_all(pem).map_err(|e| Error::Certificate {
        message: format!("failed to write temp PEM file: {e}"),
    })?;
    Ok(())
}
