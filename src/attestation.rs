//! Attestation evidence and verified claims
//!
//! The cryptographic internals of DCAP quote verification (evidence parsing,
//! collateral and revocation checking) live behind the [`DcapVerifier`]
//! trait; this module only fixes the shapes flowing across that seam and how
//! the enclave's TLS identity is extracted from verified claims.
//!
//! Claims are never trusted before [`crate::policy::Policy::check`] has
//! accepted them.

use der::Decode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_cert::Certificate;

/// Raw attestation material served by the untrusted endpoint. Received once
/// per connection attempt and consumed exactly once by a [`DcapVerifier`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationEvidence {
    /// Hardware-signed SGX quote.
    pub quote: Vec<u8>,
    /// Collateral: certificate chain, TCB info, revocation data.
    pub collateral: Vec<u8>,
    /// Data the enclave bound into the quote; carries the enclave's TLS
    /// identity (certificate or SubjectPublicKeyInfo, DER).
    pub enclave_held_data: Vec<u8>,
}

/// Facts extracted from successfully verified attestation evidence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    /// Enclave identity measurement, lowercase hex.
    pub mr_enclave: String,
    /// Enclave signer measurement, lowercase hex.
    pub mr_signer: String,
    /// Whether the enclave was launched with debugging enabled.
    pub is_debuggable: bool,
    /// The enclave-held data echoed out of the verified quote.
    pub enclave_held_data: Vec<u8>,
}

/// Quote verification failure.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct AttestationError(pub String);

/// Validates hardware-signed evidence and returns verified claims.
///
/// Implementations perform full DCAP verification: quote signature chain to
/// the Intel root, collateral freshness, revocation. A failure is fatal for
/// the connection attempt; it is never safe to retry without operator
/// intervention.
pub trait DcapVerifier {
    fn verify(&self, evidence: &AttestationEvidence) -> Result<Claims, AttestationError>;
}

/// Extract the server certificate from verified claims, PEM-encoded.
///
/// The enclave-held data is the DER of the enclave's TLS identity; quote
/// verification has already bound it to the measurement, so wrapping it in
/// PEM is all that is left to do. A full X.509 certificate is labeled
/// `CERTIFICATE`; anything else is treated as a bare SubjectPublicKeyInfo
/// and labeled `PUBLIC KEY`, which still verifies response signatures but
/// cannot anchor a TLS channel.
pub fn server_cert_from_claims(claims: &Claims) -> Vec<u8> {
    let der = &claims.enclave_held_data;
    if Certificate::from_der(der).is_ok() {
        crate::tls::pem_encode("CERTIFICATE", der)
    } else {
        crate::tls::pem_encode("PUBLIC KEY", der)
    }
}
