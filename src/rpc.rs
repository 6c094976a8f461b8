//! Black-box RPC surface
//!
//! The wire protocol (channel creation, stream framing, message schema) is an
//! external collaborator. This module pins down only what the trust layer
//! needs from it:
//!
//! - the untrusted bootstrap endpoint: `GetServerInfo`, `GetCertificate`,
//!   `GetSgxQuoteWithCollateral`;
//! - the attested exchange endpoint: `SendModel`, `RunModel`, `DeleteModel`,
//!   each taking a streamed sequence of chunk-carrying request messages and
//!   returning one signed response;
//! - a `Transport` factory that opens either endpoint against a host/port
//!   with a single pinned root certificate.
//!
//! Large buffers are split into `CHUNK_SIZE` pieces before transmission
//! because the transport enforces a maximum message size; the server
//! reassembles them in order before hashing anything.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attestation::AttestationEvidence;
use crate::tls::ChannelCredentials;

/// Fixed chunk size for streamed request bodies, in bytes.
///
/// Has to stay comfortably under the transport's maximum message size.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Split a buffer into an ordered, exhaustive sequence of bounded chunks.
///
/// Reassembling the chunks in iteration order reproduces the input exactly;
/// an empty buffer yields no chunks.
pub fn chunk_bytes(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    data.chunks(CHUNK_SIZE)
}

/// Version information reported by the untrusted endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
}

/// Element type of the model input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelDatumType {
    F32,
    F64,
    I32,
    I64,
    U32,
    U64,
}

impl Default for ModelDatumType {
    fn default() -> Self {
        ModelDatumType::F32
    }
}

/// One message of the `SendModel` request stream. Every message repeats the
/// fixed fields; `data` carries one chunk of the model bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendModelRequest {
    /// Total model size in bytes, across all chunks.
    pub length: u64,
    /// Shape of the model input tensor.
    pub input_fact: Vec<i64>,
    /// One chunk of the model bytes.
    pub data: Vec<u8>,
    pub datum: ModelDatumType,
    /// Ask the enclave to sign the response payload.
    pub sign: bool,
    pub model_name: String,
}

/// One message of the `RunModel` request stream; `input` carries one chunk of
/// the serialized input tensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunModelRequest {
    pub input: Vec<u8>,
    pub sign: bool,
    pub model_id: String,
}

/// The single `DeleteModel` request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteModelRequest {
    pub model_id: String,
    pub sign: bool,
}

/// One response from the attested exchange endpoint: opaque payload bytes
/// plus the enclave's signature over exactly those bytes. The signature is
/// empty when signing was not requested.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedResponse {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Transport-level failure reported by an endpoint implementation.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The remote returned an error status.
    #[error("RPC status {code}: {message}")]
    Status { code: u32, message: String },

    /// Socket or framing failure below the RPC layer.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The call did not complete within the transport's deadline.
    #[error("Deadline exceeded")]
    Timeout,
}

impl RpcError {
    /// One-line operator-facing diagnostic, used when surfacing transport
    /// failures as connection errors.
    pub fn diagnostic(&self) -> String {
        match self {
            RpcError::Status { code, message } => {
                format!("server rejected the call (status {}): {}", code, message)
            }
            RpcError::Transport(msg) => format!("transport failure: {}", msg),
            RpcError::Timeout => "deadline exceeded while waiting for the server".to_string(),
        }
    }
}

/// Where a channel terminates: host, port and the server name expected in the
/// presented TLS certificate.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub server_name: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, server_name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            server_name: server_name.into(),
        }
    }

    /// `host:port` form used for socket addresses and diagnostics.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The untrusted bootstrap endpoint. Its only job is to serve version
/// information and attestation material; it is closed (dropped) before the
/// attested channel is opened.
pub trait AttestationEndpoint {
    fn get_server_info(&mut self) -> Result<ServerInfo, RpcError>;

    /// Fetch the enclave TLS certificate directly (simulation mode only).
    fn get_certificate(&mut self) -> Result<Vec<u8>, RpcError>;

    /// Fetch the quote, collateral and enclave-held data (hardware mode).
    fn get_sgx_quote_with_collateral(&mut self) -> Result<AttestationEvidence, RpcError>;
}

/// The attested exchange endpoint. Streamed calls take the request messages
/// in transmission order; the implementation must forward them without
/// reordering or dropping any.
pub trait ExchangeEndpoint {
    fn send_model(
        &mut self,
        requests: &mut dyn Iterator<Item = SendModelRequest>,
    ) -> Result<SignedResponse, RpcError>;

    fn run_model(
        &mut self,
        requests: &mut dyn Iterator<Item = RunModelRequest>,
    ) -> Result<SignedResponse, RpcError>;

    fn delete_model(&mut self, request: DeleteModelRequest) -> Result<SignedResponse, RpcError>;
}

/// Channel factory. Implementations own dialing, framing and deadlines; the
/// trust layer only dictates which root certificate each channel may accept.
pub trait Transport {
    fn open_untrusted(
        &self,
        endpoint: &Endpoint,
        credentials: &ChannelCredentials,
    ) -> Result<Box<dyn AttestationEndpoint>, RpcError>;

    fn open_attested(
        &self,
        endpoint: &Endpoint,
        credentials: &ChannelCredentials,
    ) -> Result<Box<dyn ExchangeEndpoint>, RpcError>;

    /// Fetch whatever certificate the endpoint presents at connection time,
    /// PEM-encoded (simulation-mode bootstrap only). Every socket operation
    /// is bounded by `timeout`.
    fn fetch_server_certificate(
        &self,
        endpoint: &Endpoint,
        timeout: std::time::Duration,
    ) -> Result<Vec<u8>, RpcError> {
        crate::tls::fetch_server_certificate(&endpoint.host, endpoint.port, timeout)
            .map_err(|e| RpcError::Transport(e.to_string()))
    }
}
