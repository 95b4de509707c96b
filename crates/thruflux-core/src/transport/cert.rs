//! Self-signed TLS identity for the transfer connection.
//!
//! Peers never verify each other's certificate (introductions are brokered
//! out of band and the path is already authenticated by the signaling
//! exchange); the certificate exists because QUIC requires one.

use crate::error::{Error, Result};

/// Generate a self-signed certificate and return `(cert_pem, key_pem)`.
pub fn generate_self_signed_cert() -> Result<(Vec<u8>, Vec<u8>)> {
    let certified_key = rcgen::generate_simple_self_signed(vec![
        crate::constants::TLS_SERVER_NAME.to_string(),
    ])
    .map_err(|e| Error::Certificate {
        message: format!("failed to generate certificate: {e}"),
    })?;

    let cert_pem = certified_key.cert.pem().into_bytes();
    let key_pem = certified_key.signing_key.serialize_pem().into_bytes();

    Ok((cert_pem, key_pem))
}
