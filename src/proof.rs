//! Signed-response verification
//!
//! Every response from the attested endpoint carries opaque payload bytes and
//! an enclave signature over exactly those bytes. When the caller requested
//! signing, verification runs in a fixed order:
//!
//! 1. ECDSA P-256 signature (DER) over the raw payload bytes;
//! 2. decode the payload into the operation-specific shape;
//! 3. re-derive the echoed fields locally and compare byte-for-byte, so a
//!    relay cannot substitute a validly-signed response for a *different*
//!    request.
//!
//! Only then is a [`ProofData`] handed back. When signing was not requested
//! no verification happens at all: that is explicit, caller-controlled trust
//! degradation.

use der::{Decode, Encode};
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use crate::error::{ConnectError, ConnectResult, OpError, OpResult};
use crate::rpc::SignedResponse;
use crate::tls;

/// Verifying key bound to the attested enclave, extracted from the server
/// certificate. Lives for the lifetime of the connection and checks every
/// signed response.
#[derive(Debug, Clone)]
pub struct EnclaveSigningKey {
    key: VerifyingKey,
}

impl EnclaveSigningKey {
    /// Extract the verifying key from a PEM-encoded server certificate.
    ///
    /// Accepts either a full X.509 certificate (the key is taken from its
    /// SubjectPublicKeyInfo) or a bare SubjectPublicKeyInfo block, which is
    /// what the enclave-held data carries.
    pub fn from_certificate_pem(pem: &[u8]) -> ConnectResult<Self> {
        let der = tls::pem_to_der(pem)?;

        let spki_der = match Certificate::from_der(&der) {
            Ok(cert) => cert
                .tbs_certificate
                .subject_public_key_info
                .to_der()
                .map_err(|e| ConnectError::Tls(format!("failed to encode SPKI: {}", e)))?,
            // Not a certificate: treat the block as a bare SPKI
            Err(_) => der,
        };

        let key = VerifyingKey::from_public_key_der(&spki_der)
            .map_err(|e| ConnectError::Tls(format!("unsupported enclave signing key: {}", e)))?;

        Ok(Self { key })
    }

    /// Verify a DER ECDSA signature over the raw payload bytes.
    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> OpResult<()> {
        let signature = Signature::from_der(signature)
            .map_err(|_| OpError::Signature("Invalid signature".into()))?;
        self.key
            .verify(payload, &signature)
            .map_err(|_| OpError::Signature("Invalid signature".into()))
    }
}

/// Payload of a signed `SendModel` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendModelPayload {
    /// SHA-256 of the reassembled model bytes, computed server-side.
    pub model_hash: Vec<u8>,
    /// Input shape echoed back by the server.
    pub input_fact: Vec<i64>,
    pub model_id: String,
}

/// Payload of a signed `RunModel` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunModelPayload {
    pub output: Vec<f32>,
    /// SHA-256 of the reassembled serialized input, computed server-side.
    pub input_hash: Vec<u8>,
    pub model_id: String,
}

/// Payload of a signed `DeleteModel` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteModelPayload {
    pub model_id: String,
}

/// Envelope decoded from the raw payload bytes of a [`SignedResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    SendModel(SendModelPayload),
    RunModel(RunModelPayload),
    DeleteModel(DeleteModelPayload),
}

impl Payload {
    /// Decode payload bytes (CBOR).
    pub fn decode(bytes: &[u8]) -> OpResult<Self> {
        serde_cbor::from_slice(bytes).map_err(|e| OpError::Payload(e.to_string()))
    }

    /// Encode to payload bytes (CBOR). The client only decodes; this is for
    /// server-side implementations and tests.
    pub fn encode(&self) -> OpResult<Vec<u8>> {
        serde_cbor::to_vec(self).map_err(|e| OpError::Payload(e.to_string()))
    }
}

/// Evidence of response authenticity, returned to the caller when signing was
/// requested. Purely informational after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ProofData {
    /// Raw payload bytes as signed by the enclave.
    pub payload: Vec<u8>,
    /// DER ECDSA signature over `payload`.
    pub signature: Vec<u8>,
    pub model_id: String,
}

impl ProofData {
    fn new(response: &SignedResponse, model_id: &str) -> Self {
        Self {
            payload: response.payload.clone(),
            signature: response.signature.clone(),
            model_id: model_id.to_string(),
        }
    }
}

/// Verify a `SendModel` response against the uploaded model.
pub fn verify_upload_response(
    key: &EnclaveSigningKey,
    response: &SignedResponse,
    model_bytes: &[u8],
    input_fact: &[i64],
    sign: bool,
) -> OpResult<(SendModelPayload, Option<ProofData>)> {
    if sign {
        key.verify(&response.payload, &response.signature)?;
    }

    let payload = match Payload::decode(&response.payload)? {
        Payload::SendModel(p) => p,
        _ => return Err(OpError::Payload("expected a SendModel payload".into())),
    };

    if !sign {
        return Ok((payload, None));
    }

    if Sha256::digest(model_bytes).as_slice() != payload.model_hash.as_slice() {
        return Err(OpError::Signature("Invalid returned model_hash".into()));
    }
    if payload.input_fact != input_fact {
        return Err(OpError::Signature("Invalid returned input_fact".into()));
    }

    let proof = ProofData::new(response, &payload.model_id);
    Ok((payload, Some(proof)))
}

/// Verify a `RunModel` response against the serialized input.
///
/// `expected_model_id` is checked only when the caller addressed a specific
/// model rather than the default one.
pub fn verify_run_response(
    key: &EnclaveSigningKey,
    response: &SignedResponse,
    serialized_input: &[u8],
    expected_model_id: Option<&str>,
    sign: bool,
) -> OpResult<(RunModelPayload, Option<ProofData>)> {
    if sign {
        key.verify(&response.payload, &response.signature)?;
    }

    let payload = match Payload::decode(&response.payload)? {
        Payload::RunModel(p) => p,
        _ => return Err(OpError::Payload("expected a RunModel payload".into())),
    };

    if !sign {
        return Ok((payload, None));
    }

    if Sha256::digest(serialized_input).as_slice() != payload.input_hash.as_slice() {
        return Err(OpError::Signature("Invalid returned input_hash".into()));
    }
    if let Some(expected) = expected_model_id {
        if payload.model_id != expected {
            return Err(OpError::Signature("Invalid model".into()));
        }
    }

    let proof = ProofData::new(response, &payload.model_id);
    Ok((payload, Some(proof)))
}

/// Verify a `DeleteModel` response against the requested model id.
pub fn verify_delete_response(
    key: &EnclaveSigningKey,
    response: &SignedResponse,
    model_id: &str,
    sign: bool,
) -> OpResult<(DeleteModelPayload, Option<ProofData>)> {
    if sign {
        key.verify(&response.payload, &response.signature)?;
    }

    let payload = match Payload::decode(&response.payload)? {
        Payload::DeleteModel(p) => p,
        _ => return Err(OpError::Payload("expected a DeleteModel payload".into())),
    };

    if !sign {
        return Ok((payload, None));
    }

    if payload.model_id != model_id {
        return Err(OpError::Signature("Invalid model".into()));
    }

    let proof = ProofData::new(response, &payload.model_id);
    Ok((payload, Some(proof)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;

    fn signing_key() -> SigningKey {
        SigningKey::from_slice(&[7u8; 32]).unwrap()
    }

    fn enclave_key(sk: &SigningKey) -> EnclaveSigningKey {
        let spki = sk.verifying_key().to_public_key_der().unwrap();
        EnclaveSigningKey::from_certificate_pem(&tls::der_to_pem(spki.as_bytes())).unwrap()
    }

    fn signed(sk: &SigningKey, payload: &Payload) -> SignedResponse {
        let bytes = payload.encode().unwrap();
        let signature: Signature = sk.sign(&bytes);
        SignedResponse {
            payload: bytes,
            signature: signature.to_der().as_bytes().to_vec(),
        }
    }

    fn upload_payload(model: &[u8], input_fact: &[i64]) -> Payload {
        Payload::SendModel(SendModelPayload {
            model_hash: Sha256::digest(model).to_vec(),
            input_fact: input_fact.to_vec(),
            model_id: "model-1".into(),
        })
    }

    #[test]
    fn test_key_extraction_from_spki_pem() {
        let sk = signing_key();
        // Round-trips through PEM and verifies a signature
        let key = enclave_key(&sk);
        let sig: Signature = sk.sign(b"hello");
        key.verify(b"hello", sig.to_der().as_bytes()).unwrap();
    }

    #[test]
    fn test_key_extraction_rejects_garbage() {
        assert!(EnclaveSigningKey::from_certificate_pem(b"not pem").is_err());
        let pem = tls::der_to_pem(&[0u8; 40]);
        assert!(EnclaveSigningKey::from_certificate_pem(&pem).is_err());
    }

    #[test]
    fn test_upload_verification_accepts_valid_response() {
        let sk = signing_key();
        let model = b"0123456789";
        let fact = [1i64, 10];
        let response = signed(&sk, &upload_payload(model, &fact));

        let (payload, proof) =
            verify_upload_response(&enclave_key(&sk), &response, model, &fact, true).unwrap();
        assert_eq!(payload.model_id, "model-1");
        let proof = proof.unwrap();
        assert_eq!(proof.payload, response.payload);
        assert_eq!(proof.signature, response.signature);
        assert_eq!(proof.model_id, "model-1");
    }

    #[test]
    fn test_upload_verification_is_idempotent() {
        let sk = signing_key();
        let model = b"0123456789";
        let fact = [1i64, 10];
        let response = signed(&sk, &upload_payload(model, &fact));
        let key = enclave_key(&sk);

        let first = verify_upload_response(&key, &response, model, &fact, true).unwrap();
        let second = verify_upload_response(&key, &response, model, &fact, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_upload_rejects_flipped_model_hash_bit() {
        let sk = signing_key();
        let model = b"0123456789";
        let fact = [1i64, 10];

        let mut hash = Sha256::digest(model).to_vec();
        hash[0] ^= 0x01;
        let payload = Payload::SendModel(SendModelPayload {
            model_hash: hash,
            input_fact: fact.to_vec(),
            model_id: "model-1".into(),
        });
        let response = signed(&sk, &payload);

        let err =
            verify_upload_response(&enclave_key(&sk), &response, model, &fact, true).unwrap_err();
        assert_eq!(err.to_string(), "Invalid returned model_hash");
    }

    #[test]
    fn test_upload_rejects_wrong_input_fact() {
        let sk = signing_key();
        let model = b"0123456789";
        let response = signed(&sk, &upload_payload(model, &[1, 20]));

        let err = verify_upload_response(&enclave_key(&sk), &response, model, &[1, 10], true)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid returned input_fact");
    }

    #[test]
    fn test_upload_rejects_tampered_payload() {
        let sk = signing_key();
        let model = b"0123456789";
        let mut response = signed(&sk, &upload_payload(model, &[1, 10]));
        // Any payload byte change invalidates the signature
        let last = response.payload.len() - 1;
        response.payload[last] ^= 0xFF;

        let err = verify_upload_response(&enclave_key(&sk), &response, model, &[1, 10], true)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid signature");
    }

    #[test]
    fn test_unsigned_response_skips_verification() {
        let sk = signing_key();
        let model = b"0123456789";
        let payload = upload_payload(model, &[1, 10]);
        let response = SignedResponse {
            payload: payload.encode().unwrap(),
            signature: Vec::new(),
        };

        // sign = false: garbage signature is fine, no proof comes back
        let (decoded, proof) =
            verify_upload_response(&enclave_key(&sk), &response, model, &[1, 10], false).unwrap();
        assert_eq!(decoded.model_id, "model-1");
        assert!(proof.is_none());
    }

    #[test]
    fn test_run_rejects_flipped_input_hash_bit() {
        let sk = signing_key();
        let input = b"serialized tensor";

        let mut hash = Sha256::digest(input).to_vec();
        hash[31] ^= 0x80;
        let payload = Payload::RunModel(RunModelPayload {
            output: vec![1.0],
            input_hash: hash,
            model_id: "m1".into(),
        });
        let response = signed(&sk, &payload);

        let err = verify_run_response(&enclave_key(&sk), &response, input, None, true).unwrap_err();
        assert_eq!(err.to_string(), "Invalid returned input_hash");
    }

    #[test]
    fn test_run_rejects_substituted_model_id() {
        let sk = signing_key();
        let input = b"serialized tensor";
        let payload = Payload::RunModel(RunModelPayload {
            output: vec![1.0],
            input_hash: Sha256::digest(input).to_vec(),
            model_id: "someone-elses-model".into(),
        });
        let response = signed(&sk, &payload);

        let err = verify_run_response(&enclave_key(&sk), &response, input, Some("m1"), true)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid model");
    }

    #[test]
    fn test_run_skips_model_id_check_for_default_model() {
        let sk = signing_key();
        let input = b"serialized tensor";
        let payload = Payload::RunModel(RunModelPayload {
            output: vec![4.0, 2.0],
            input_hash: Sha256::digest(input).to_vec(),
            model_id: "whatever-the-server-picked".into(),
        });
        let response = signed(&sk, &payload);

        let (decoded, proof) =
            verify_run_response(&enclave_key(&sk), &response, input, None, true).unwrap();
        assert_eq!(decoded.output, vec![4.0, 2.0]);
        assert!(proof.is_some());
    }

    #[test]
    fn test_delete_checks_model_id_echo() {
        let sk = signing_key();
        let key = enclave_key(&sk);

        let ok = signed(
            &sk,
            &Payload::DeleteModel(DeleteModelPayload { model_id: "m1".into() }),
        );
        assert!(verify_delete_response(&key, &ok, "m1", true).is_ok());

        let wrong = signed(
            &sk,
            &Payload::DeleteModel(DeleteModelPayload { model_id: "m2".into() }),
        );
        let err = verify_delete_response(&key, &wrong, "m1", true).unwrap_err();
        assert_eq!(err.to_string(), "Invalid model");
    }

    #[test]
    fn test_wrong_payload_kind_is_a_payload_error() {
        let sk = signing_key();
        let response = signed(
            &sk,
            &Payload::DeleteModel(DeleteModelPayload { model_id: "m1".into() }),
        );
        let err = verify_upload_response(&enclave_key(&sk), &response, b"x", &[1], true)
            .unwrap_err();
        assert!(matches!(err, OpError::Payload(_)));
    }
}
