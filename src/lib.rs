//! # BlindAI client
//!
//! Client-side trust establishment and response integrity for a remote
//! enclave-hosted inference service. The server's identity is proven by
//! hardware attestation rather than a certificate authority, and every signed
//! response is verified before its result is released.
//!
//! ## Two-phase connection
//!
//! ### Phase 1: untrusted bootstrap
//! - Open a provisional channel to the untrusted port
//! - Check the server version (hard compatibility gate)
//! - Hardware mode: fetch the SGX quote + collateral, verify it (DCAP),
//!   check the extracted claims against the caller's trust policy
//! - Simulation mode: fetch the certificate directly, with a loud warning
//!   that attestation is bypassed
//!
//! ### Phase 2: attested session
//! - Close the bootstrap channel
//! - Derive the enclave signing key from the attested certificate
//! - Re-connect to the attested port with that certificate as the only
//!   trusted root
//!
//! ## Response verification
//!
//! For every signed `SendModel` / `RunModel` / `DeleteModel` response the
//! client checks the enclave signature over the raw payload bytes, then
//! re-derives the echoed fields (model hash, input hash, input shape, model
//! id) and compares byte-for-byte. A relay in front of the enclave can
//! therefore neither tamper with a response nor replay one for a different
//! request.
//!
//! ## Example
//!
//! ```rust,ignore
//! use blindai_client::{BlindAiClient, ConnectOptions, ModelDatumType};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = BlindAiClient::new(transport, dcap_verifier);
//!
//!     client.connect(
//!         &ConnectOptions::new("enclave.example.com")
//!             .policy("policy.toml")
//!             .certificate("host_server.pem"),
//!     )?;
//!
//!     let uploaded = client.upload_model(
//!         Path::new("model.onnx"),
//!         &[1, 10],
//!         Some(ModelDatumType::F32),
//!         true,
//!         "default",
//!     )?;
//!     let result = client.run_model(&[1.0, 2.0, 3.0], true, &uploaded.model_id)?;
//!     println!("output: {:?}", result.output);
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

pub mod attestation;
pub mod client;
pub mod error;
pub mod policy;
pub mod proof;
pub mod rpc;
pub mod tls;

pub use attestation::{AttestationError, AttestationEvidence, Claims, DcapVerifier};
pub use client::{
    supported_server_version, BlindAiClient, ConnectOptions, DeleteModelResponse,
    RunModelResponse, UploadModelResponse, DEFAULT_MODEL_ID,
};
pub use error::{ConnectError, OpError};
pub use policy::Policy;
pub use proof::{EnclaveSigningKey, ProofData};
pub use rpc::{ModelDatumType, ServerInfo, SignedResponse, Transport};
