//! Channel credentials and certificate plumbing
//!
//! Both channels pin a single trusted root instead of consulting WebPKI:
//! the untrusted bootstrap channel pins a caller-supplied certificate
//! (hardware mode) or whatever the socket presents at connection time
//! (simulation mode), and the attested channel pins the certificate proven by
//! attestation. The only trust-on-first-use path is the simulation fetch,
//! which exists so a development server can be reached without any
//! pre-shared material.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};

use crate::error::{ConnectError, ConnectResult};

const PEM_LINE: usize = 64;

/// PEM-encode a DER blob under the given label.
pub fn pem_encode(label: &str, der: &[u8]) -> Vec<u8> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = String::with_capacity(encoded.len() + 64);
    out.push_str("-----BEGIN ");
    out.push_str(label);
    out.push_str("-----\n");
    let mut i = 0;
    while i < encoded.len() {
        let end = (i + PEM_LINE).min(encoded.len());
        out.push_str(&encoded[i..end]);
        out.push('\n');
        i = end;
    }
    out.push_str("-----END ");
    out.push_str(label);
    out.push_str("-----\n");
    out.into_bytes()
}

/// PEM-encode a DER certificate.
pub fn der_to_pem(der: &[u8]) -> Vec<u8> {
    pem_encode("CERTIFICATE", der)
}

/// SHA-256 fingerprint of a PEM certificate's DER body, hex-encoded.
///
/// Used for operator-facing logs so the certificate a session was pinned to
/// can be compared out of band.
pub fn certificate_fingerprint(pem: &[u8]) -> ConnectResult<String> {
    let der = pem_to_der(pem)?;
    Ok(hex::encode(Sha256::digest(&der)))
}

/// Extract the DER body of the first PEM block in `pem`.
pub fn pem_to_der(pem: &[u8]) -> ConnectResult<Vec<u8>> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| ConnectError::Tls("certificate is not valid UTF-8".into()))?;

    let mut body = String::new();
    let mut inside = false;
    for line in text.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN") {
            inside = true;
            continue;
        }
        if line.starts_with("-----END") {
            break;
        }
        if inside {
            body.push_str(line);
        }
    }

    if !inside {
        return Err(ConnectError::Tls("no PEM block found".into()));
    }

    base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| ConnectError::Tls(format!("invalid PEM body: {}", e)))
}

/// Credentials for one channel: exactly one trusted root certificate.
///
/// Transports build their TLS configuration from this; no other root is ever
/// accepted on the channel.
#[derive(Debug, Clone)]
pub struct ChannelCredentials {
    root_certificate_pem: Vec<u8>,
}

impl ChannelCredentials {
    /// Pin the given PEM certificate as the channel's only trusted root.
    pub fn root_certificate(pem: impl Into<Vec<u8>>) -> Self {
        Self {
            root_certificate_pem: pem.into(),
        }
    }

    pub fn root_certificate_pem(&self) -> &[u8] {
        &self.root_certificate_pem
    }

    /// Build a rustls client configuration whose root store contains only
    /// the pinned certificate.
    ///
    /// The pinned root must be a full X.509 certificate; a bare
    /// SubjectPublicKeyInfo block is enough to verify response signatures
    /// but cannot anchor a TLS channel.
    pub fn client_config(&self) -> ConnectResult<ClientConfig> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let der = pem_to_der(&self.root_certificate_pem)?;
        let mut roots = RootCertStore::empty();
        roots
            .add(CertificateDer::from(der))
            .map_err(|e| ConnectError::Tls(format!("rejected root certificate: {}", e)))?;

        Ok(ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    }
}

/// Verifier that accepts whatever certificate the server presents.
///
/// Only reachable through [`fetch_server_certificate`], i.e. the
/// simulation-mode bootstrap. The captured certificate is pinned for the
/// actual channel, so this never guards real traffic.
#[derive(Debug)]
struct TrustOnFirstUse {
    schemes: Vec<SignatureScheme>,
}

impl TrustOnFirstUse {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for TrustOnFirstUse {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Fetch the certificate the server presents on `host:port`, PEM-encoded.
///
/// Synchronous: TCP connect, TLS handshake, read the peer certificate, done.
/// Every socket operation is bounded by `timeout`; on timeout or socket
/// failure the returned error carries a diagnostic naming the endpoint.
pub fn fetch_server_certificate(host: &str, port: u16, timeout: Duration) -> ConnectResult<Vec<u8>> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| ConnectError::Connection(format!("failed to resolve {}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| ConnectError::Connection(format!("no address found for {}:{}", host, port)))?;

    let mut sock = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| ConnectError::Connection(format!("failed to connect to {}:{}: {}", host, port, e)))?;
    sock.set_read_timeout(Some(timeout))
        .and_then(|_| sock.set_write_timeout(Some(timeout)))
        .map_err(|e| ConnectError::Connection(format!("failed to set socket timeout: {}", e)))?;

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(TrustOnFirstUse::new()))
        .with_no_client_auth();

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| ConnectError::Tls(format!("invalid server name: {}", host)))?;

    let mut conn = ClientConnection::new(Arc::new(config), server_name)
        .map_err(|e| ConnectError::Tls(format!("failed to start TLS session: {}", e)))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut sock).map_err(|e| {
            ConnectError::Connection(format!("TLS handshake with {}:{} failed: {}", host, port, e))
        })?;
    }

    let cert = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .ok_or_else(|| ConnectError::Tls("server presented no certificate".into()))?;

    Ok(der_to_pem(cert.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pem_round_trip() {
        let der: Vec<u8> = (0..200u8).collect();
        let pem = der_to_pem(&der);
        assert_eq!(pem_to_der(&pem).unwrap(), der);
    }

    #[test]
    fn test_pem_encode_carries_the_label() {
        let pem = String::from_utf8(pem_encode("PUBLIC KEY", &[1, 2, 3])).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
        // The body decodes regardless of the label
        assert_eq!(pem_to_der(pem.as_bytes()).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_certificate_fingerprint_is_hex_sha256_of_der() {
        let der = vec![0x30, 0x03, 0x02, 0x01, 0x01];
        let fp = certificate_fingerprint(&der_to_pem(&der)).unwrap();
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, hex::encode(sha2::Sha256::digest(&der)));
        // Stable across the PEM labeling
        assert_eq!(
            fp,
            certificate_fingerprint(&pem_encode("PUBLIC KEY", &der)).unwrap()
        );

        let other = certificate_fingerprint(&der_to_pem(&[0x30, 0x00])).unwrap();
        assert_ne!(fp, other);
    }

    #[test]
    fn test_pem_lines_are_bounded() {
        let pem = der_to_pem(&[0xAA; 300]);
        let text = String::from_utf8(pem).unwrap();
        for line in text.lines() {
            assert!(line.len() <= PEM_LINE || line.starts_with("-----"));
        }
    }

    #[test]
    fn test_pem_to_der_rejects_garbage() {
        assert!(matches!(
            pem_to_der(b"definitely not pem"),
            Err(ConnectError::Tls(_))
        ));
        assert!(matches!(
            pem_to_der(b"-----BEGIN CERTIFICATE-----\n!!!\n-----END CERTIFICATE-----\n"),
            Err(ConnectError::Tls(_))
        ));
    }

    #[test]
    fn test_credentials_keep_the_pem() {
        let pem = der_to_pem(&[1, 2, 3]);
        let creds = ChannelCredentials::root_certificate(pem.clone());
        assert_eq!(creds.root_certificate_pem(), pem.as_slice());
    }

    #[test]
    fn test_fetch_certificate_unreachable_endpoint() {
        // Port 1 on localhost should refuse immediately
        let err = fetch_server_certificate("127.0.0.1", 1, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, ConnectError::Connection(_)));
        assert!(err.to_string().contains("127.0.0.1:1"));
    }
}
