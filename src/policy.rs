//! Trust policy loading and claim checking
//!
//! The policy is a TOML file generated on the server side describing the
//! enclave identity the caller is willing to talk to. It is loaded once per
//! connection attempt and checked against the claims extracted from verified
//! attestation evidence. Load/parse failures are reported distinctly from
//! attestation failures so operators can tell a bad local file from a bad
//! enclave.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attestation::Claims;
use crate::error::{ConnectError, ConnectResult};

/// Expected enclave identity and configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Expected enclave measurement, lowercase hex.
    pub mr_enclave: String,

    /// Expected signer measurement. Optional: not every deployment pins the
    /// signer.
    #[serde(default)]
    pub mr_signer: Option<String>,

    /// Accept an enclave launched in debug mode. Off by default; a debug
    /// enclave leaks its memory to the host.
    #[serde(default)]
    pub allow_debug: bool,
}

/// A claim that contradicts the policy.
#[derive(Error, Debug)]
pub enum PolicyMismatch {
    #[error("MRENCLAVE mismatch: policy expects {expected}, enclave reports {actual}")]
    MrEnclave { expected: String, actual: String },

    #[error("MRSIGNER mismatch: policy expects {expected}, enclave reports {actual}")]
    MrSigner { expected: String, actual: String },

    #[error("enclave is debuggable but the policy does not allow debug")]
    Debuggable,
}

impl Policy {
    /// Load a policy from a TOML file.
    pub fn from_file(path: &Path) -> ConnectResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                ConnectError::FileNotFound(path.display().to_string())
            } else {
                ConnectError::Policy(format!("failed to read policy file: {}", e))
            }
        })?;

        toml::from_str(&text)
            .map_err(|e| ConnectError::Policy(format!("invalid policy file: {}", e)))
    }

    /// Check verified claims against this policy.
    ///
    /// Claims must never be acted on before this has passed.
    pub fn check(&self, claims: &Claims) -> Result<(), PolicyMismatch> {
        if !claims.mr_enclave.eq_ignore_ascii_case(&self.mr_enclave) {
            return Err(PolicyMismatch::MrEnclave {
                expected: self.mr_enclave.clone(),
                actual: claims.mr_enclave.clone(),
            });
        }

        if let Some(expected) = &self.mr_signer {
            if !claims.mr_signer.eq_ignore_ascii_case(expected) {
                return Err(PolicyMismatch::MrSigner {
                    expected: expected.clone(),
                    actual: claims.mr_signer.clone(),
                });
            }
        }

        if claims.is_debuggable && !self.allow_debug {
            return Err(PolicyMismatch::Debuggable);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> Claims {
        Claims {
            mr_enclave: "ab".repeat(32),
            mr_signer: "cd".repeat(32),
            is_debuggable: false,
            enclave_held_data: vec![1, 2, 3],
        }
    }

    fn policy() -> Policy {
        Policy {
            mr_enclave: "ab".repeat(32),
            mr_signer: None,
            allow_debug: false,
        }
    }

    #[test]
    fn test_parse_policy_toml() {
        let text = format!(
            "mr_enclave = \"{}\"\nmr_signer = \"{}\"\nallow_debug = true\n",
            "ab".repeat(32),
            "cd".repeat(32),
        );
        let policy: Policy = toml::from_str(&text).unwrap();
        assert_eq!(policy.mr_enclave, "ab".repeat(32));
        assert_eq!(policy.mr_signer, Some("cd".repeat(32)));
        assert!(policy.allow_debug);
    }

    #[test]
    fn test_optional_fields_default() {
        let text = format!("mr_enclave = \"{}\"\n", "ab".repeat(32));
        let policy: Policy = toml::from_str(&text).unwrap();
        assert_eq!(policy.mr_signer, None);
        assert!(!policy.allow_debug);
    }

    #[test]
    fn test_missing_file_is_file_not_found() {
        let err = Policy::from_file(Path::new("/nonexistent/policy.toml")).unwrap_err();
        assert!(matches!(err, ConnectError::FileNotFound(_)));
    }

    #[test]
    fn test_check_accepts_matching_claims() {
        assert!(policy().check(&claims()).is_ok());
    }

    #[test]
    fn test_check_is_case_insensitive_on_hex() {
        let mut p = policy();
        p.mr_enclave = p.mr_enclave.to_uppercase();
        assert!(p.check(&claims()).is_ok());
    }

    #[test]
    fn test_check_rejects_wrong_mr_enclave() {
        let mut p = policy();
        p.mr_enclave = "ff".repeat(32);
        assert!(matches!(
            p.check(&claims()),
            Err(PolicyMismatch::MrEnclave { .. })
        ));
    }

    #[test]
    fn test_check_rejects_wrong_mr_signer() {
        let mut p = policy();
        p.mr_signer = Some("ff".repeat(32));
        assert!(matches!(
            p.check(&claims()),
            Err(PolicyMismatch::MrSigner { .. })
        ));
    }

    #[test]
    fn test_check_rejects_debug_enclave_by_default() {
        let mut c = claims();
        c.is_debuggable = true;
        assert!(matches!(policy().check(&c), Err(PolicyMismatch::Debuggable)));

        let mut p = policy();
        p.allow_debug = true;
        assert!(p.check(&c).is_ok());
    }
}
