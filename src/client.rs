//! Connection state machine and operation surface
//!
//! `connect` walks the two-phase trust-establishment protocol:
//!
//! ```text
//! Disconnected -> UntrustedLinkUp -> VersionChecked -> EvidenceCollected
//!              -> Verified (hardware only) -> Attested
//! ```
//!
//! Every intermediate state is local to the `connect` call, so a failure at
//! any step leaves the client exactly as it was: either the whole session is
//! installed or none of it is. The untrusted bootstrap channel serves only
//! version information and attestation material and is closed before the
//! attested channel opens; all request traffic flows through the attested
//! channel, whose single trust root is the attested certificate.
//!
//! After `connect`, every operation that asked for signing runs through the
//! response verifier in [`crate::proof`] before its result is released.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::attestation::{server_cert_from_claims, DcapVerifier};
use crate::error::{ConnectError, ConnectResult, OpError, OpResult};
use crate::policy::Policy;
use crate::proof::{self, EnclaveSigningKey, ProofData};
use crate::rpc::{
    chunk_bytes, DeleteModelRequest, Endpoint, ExchangeEndpoint, ModelDatumType, RunModelRequest,
    SendModelRequest, Transport,
};
use crate::tls::{self, ChannelCredentials};

/// Default port of the untrusted bootstrap endpoint.
pub const DEFAULT_UNTRUSTED_PORT: u16 = 50052;
/// Default port of the attested exchange endpoint.
pub const DEFAULT_ATTESTED_PORT: u16 = 50051;
/// Default CN expected in the server TLS certificate.
pub const DEFAULT_SERVER_NAME: &str = "blindai-srv";
/// Model id addressing the server's default model.
pub const DEFAULT_MODEL_ID: &str = "default";

/// Bound on the simulation-mode certificate fetch.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters of a connection attempt.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server address; an `https://` or `http://` scheme prefix is stripped.
    pub address: String,
    /// CN expected in the server TLS certificate.
    pub server_name: String,
    /// Trust policy path. Required in hardware mode, ignored in simulation.
    pub policy_path: Option<PathBuf>,
    /// Untrusted-endpoint certificate path. Required in hardware mode,
    /// ignored in simulation.
    pub certificate_path: Option<PathBuf>,
    /// Bypass attestation entirely. Never use in production.
    pub simulation: bool,
    pub untrusted_port: u16,
    pub attested_port: u16,
}

impl ConnectOptions {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            policy_path: None,
            certificate_path: None,
            simulation: false,
            untrusted_port: DEFAULT_UNTRUSTED_PORT,
            attested_port: DEFAULT_ATTESTED_PORT,
        }
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn policy(mut self, path: impl Into<PathBuf>) -> Self {
        self.policy_path = Some(path.into());
        self
    }

    pub fn certificate(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate_path = Some(path.into());
        self
    }

    /// Opt in to simulation mode. This bypasses attestation; the opt-in is
    /// deliberate and loud (see the warnings `connect` emits).
    pub fn simulation(mut self, simulation: bool) -> Self {
        self.simulation = simulation;
        self
    }

    pub fn ports(mut self, untrusted: u16, attested: u16) -> Self {
        self.untrusted_port = untrusted;
        self.attested_port = attested;
        self
    }
}

/// Result of a model upload.
#[derive(Debug)]
pub struct UploadModelResponse {
    pub proof: Option<ProofData>,
    pub model_id: String,
}

/// Result of an inference run.
#[derive(Debug)]
pub struct RunModelResponse {
    pub proof: Option<ProofData>,
    pub output: Vec<f32>,
}

/// Result of a model deletion.
#[derive(Debug)]
pub struct DeleteModelResponse {
    pub proof: Option<ProofData>,
}

/// The attested session: exchange channel and signing key are always set
/// together, never one without the other.
struct Session {
    exchange: Box<dyn ExchangeEndpoint>,
    signing_key: EnclaveSigningKey,
    policy: Option<Policy>,
    simulation: bool,
}

/// Client for an enclave-hosted inference server.
///
/// Holds at most one attested session. `is_connected` is false until
/// `connect` has fully succeeded, and all operations refuse to run without a
/// session. Not synchronized: share behind a lock if `close` can race other
/// calls.
pub struct BlindAiClient {
    transport: Box<dyn Transport>,
    dcap: Box<dyn DcapVerifier>,
    session: Option<Session>,
}

impl BlindAiClient {
    /// Create a disconnected client over the given transport and DCAP
    /// verifier.
    pub fn new(transport: Box<dyn Transport>, dcap: Box<dyn DcapVerifier>) -> Self {
        Self {
            transport,
            dcap,
            session: None,
        }
    }

    /// Whether an attested session is established.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// The policy the current session was attested against, if any.
    pub fn policy(&self) -> Option<&Policy> {
        self.session.as_ref().and_then(|s| s.policy.as_ref())
    }

    /// Whether the current session was established in simulation mode.
    pub fn simulation_mode(&self) -> bool {
        self.session.as_ref().map_or(false, |s| s.simulation)
    }

    /// Establish the attested session.
    ///
    /// Hardware mode requires `policy_path` and `certificate_path`; the
    /// verified claims must match the policy. Simulation mode requires
    /// neither, bypasses attestation and says so loudly in the log.
    ///
    /// On any failure the client is left exactly as before the call.
    pub fn connect(&mut self, options: &ConnectOptions) -> ConnectResult<()> {
        let host = strip_scheme(&options.address);
        let untrusted_endpoint = Endpoint::new(host, options.untrusted_port, &options.server_name);
        let attested_endpoint = Endpoint::new(host, options.attested_port, &options.server_name);

        // Disconnected -> UntrustedLinkUp
        let untrusted_creds = if options.simulation {
            log::warn!("Untrusted server certificate check bypassed");
            let pem = self
                .transport
                .fetch_server_certificate(&untrusted_endpoint, CONNECTION_TIMEOUT)?;
            ChannelCredentials::root_certificate(pem)
        } else {
            let path = options.certificate_path.as_deref().ok_or_else(|| {
                ConnectError::FileNotFound("no certificate path provided".into())
            })?;
            ChannelCredentials::root_certificate(read_local_file(path)?)
        };
        let mut bootstrap = self
            .transport
            .open_untrusted(&untrusted_endpoint, &untrusted_creds)?;

        // UntrustedLinkUp -> VersionChecked. A mismatch aborts immediately:
        // no attestation or certificate exchange happens with an
        // incompatible server.
        let info = bootstrap.get_server_info()?;
        if !supported_server_version(&info.version) {
            return Err(ConnectError::Version {
                server: info.version,
            });
        }

        // VersionChecked -> EvidenceCollected -> Verified. Both branches end
        // with the server certificate in hand so everything downstream is
        // branch-agnostic.
        let (server_cert, policy) = if options.simulation {
            log::warn!(
                "Attestation process is bypassed: running without requesting and checking attestation"
            );
            (bootstrap.get_certificate()?, None)
        } else {
            let policy_path = options.policy_path.as_deref().ok_or_else(|| {
                ConnectError::FileNotFound("no policy path provided".into())
            })?;
            let policy = Policy::from_file(policy_path)?;

            let evidence = bootstrap.get_sgx_quote_with_collateral()?;
            let claims = self
                .dcap
                .verify(&evidence)
                .map_err(|e| ConnectError::Attestation(e.to_string()))?;
            policy
                .check(&claims)
                .map_err(|e| ConnectError::Policy(e.to_string()))?;

            log::info!("Quote verification passed");
            log::info!("MRENCLAVE {}", claims.mr_enclave);
            (server_cert_from_claims(&claims), Some(policy))
        };

        // Verified -> Attested. The bootstrap channel has done its only job;
        // the two channels are never open at the same time.
        drop(bootstrap);

        let signing_key = EnclaveSigningKey::from_certificate_pem(&server_cert)?;
        log::info!(
            "Attested certificate fingerprint {}",
            tls::certificate_fingerprint(&server_cert)?
        );
        let attested_creds = ChannelCredentials::root_certificate(server_cert);
        let exchange = self
            .transport
            .open_attested(&attested_endpoint, &attested_creds)?;

        self.session = Some(Session {
            exchange,
            signing_key,
            policy,
            simulation: options.simulation,
        });
        log::info!("Successfully connected to the server");
        Ok(())
    }

    /// Upload an ONNX model file to the server.
    ///
    /// `shape` is the model input shape; `dtype` defaults to `F32` when not
    /// given; `sign` requests a signed response which is then verified
    /// against the local model bytes and shape.
    pub fn upload_model(
        &mut self,
        model_path: &Path,
        shape: &[i64],
        dtype: Option<ModelDatumType>,
        sign: bool,
        model_name: &str,
    ) -> OpResult<UploadModelResponse> {
        let session = self.session.as_mut().ok_or(OpError::NotConnected)?;
        let dtype = dtype.unwrap_or_default();

        let data = std::fs::read(model_path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                OpError::FileNotFound(model_path.display().to_string())
            } else {
                OpError::Connection(format!("failed to read model file: {}", e))
            }
        })?;
        let input_fact: Vec<i64> = shape.to_vec();
        let length = data.len() as u64;

        let mut requests = chunk_bytes(&data).map(|chunk| SendModelRequest {
            length,
            input_fact: input_fact.clone(),
            data: chunk.to_vec(),
            datum: dtype,
            sign,
            model_name: model_name.to_string(),
        });
        let response = session.exchange.send_model(&mut requests)?;

        let (payload, proof) =
            proof::verify_upload_response(&session.signing_key, &response, &data, &input_fact, sign)?;
        Ok(UploadModelResponse {
            proof,
            model_id: payload.model_id,
        })
    }

    /// Run inference on a previously uploaded model.
    ///
    /// The values are serialized (CBOR) and streamed in chunks; the server
    /// rebuilds the tensor before hashing or running anything.
    pub fn run_model(
        &mut self,
        values: &[f32],
        sign: bool,
        model_id: &str,
    ) -> OpResult<RunModelResponse> {
        let session = self.session.as_mut().ok_or(OpError::NotConnected)?;

        let serialized = serde_cbor::to_vec(&values)
            .map_err(|e| OpError::Payload(format!("failed to serialize input: {}", e)))?;

        let mut requests = chunk_bytes(&serialized).map(|chunk| RunModelRequest {
            input: chunk.to_vec(),
            sign,
            model_id: model_id.to_string(),
        });
        let response = session.exchange.run_model(&mut requests)?;

        let expected_model_id = (model_id != DEFAULT_MODEL_ID).then_some(model_id);
        let (payload, proof) = proof::verify_run_response(
            &session.signing_key,
            &response,
            &serialized,
            expected_model_id,
            sign,
        )?;
        Ok(RunModelResponse {
            proof,
            output: payload.output,
        })
    }

    /// Delete a model from the server.
    pub fn delete_model(&mut self, model_id: &str, sign: bool) -> OpResult<DeleteModelResponse> {
        let session = self.session.as_mut().ok_or(OpError::NotConnected)?;

        let response = session.exchange.delete_model(DeleteModelRequest {
            model_id: model_id.to_string(),
            sign,
        })?;

        let (_, proof) =
            proof::verify_delete_response(&session.signing_key, &response, model_id, sign)?;
        Ok(DeleteModelResponse { proof })
    }

    /// Tear down the session. Idempotent: closing an already-closed client is
    /// a no-op. Channel, signing key and policy are cleared together.
    pub fn close(&mut self) {
        self.session = None;
    }
}

/// Whether this client supports a server reporting `version`.
///
/// Compatibility is `major.minor` equality with the client's own version; the
/// patch level does not matter.
pub fn supported_server_version(version: &str) -> bool {
    match (major_minor(version), major_minor(env!("CARGO_PKG_VERSION"))) {
        (Some(server), Some(client)) => server == client,
        _ => false,
    }
}

fn major_minor(version: &str) -> Option<(&str, &str)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?;
    let minor = parts.next()?;
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some((major, minor))
}

fn strip_scheme(address: &str) -> &str {
    address
        .strip_prefix("https://")
        .or_else(|| address.strip_prefix("http://"))
        .unwrap_or(address)
        .trim_end_matches('/')
}

fn read_local_file(path: &Path) -> ConnectResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            ConnectError::FileNotFound(path.display().to_string())
        } else {
            ConnectError::Connection(format!("failed to read {}: {}", path.display(), e))
        }
    })
}
