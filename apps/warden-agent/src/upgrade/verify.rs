//! Artifact verification: an ed25519 signature over the archive's
//! SHA-256 digest, shipped as a detached `<archive>.sig` (base64)
//! alongside the download. The verifying key is baked into the binary;
//! development builds without a key may opt into accepting unsigned
//! artifacts, loudly.

use std::path::Path;

use base64::Engine as _;
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::errors::AgentError;

pub struct ArtifactVerifier {
    key_b64: String,
    allow_unverified: bool,
}

impl ArtifactVerifier {
    pub fn new(key_b64: String, allow_unverified: bool) -> Self {
        Self {
            key_b64,
            allow_unverified,
        }
    }

    pub fn from_release() -> Self {
        let (allow, key) = crate::release::allow_unverified();
        Self::new(key, allow)
    }

    pub fn sig_path(archive: &Path) -> std::path::PathBuf {
        let mut os = archive.as_os_str().to_os_string();
        os.push(".sig");
        std::path::PathBuf::from(os)
    }

    /// Verify `archive` against its detached signature. Missing key or
    /// signature is fatal unless the unverified escape hatch is on.
    pub fn verify(&self, archive: &Path) -> Result<(), AgentError> {
        if self.key_b64.is_empty() {
            if self.allow_unverified {
                warn!(archive = %archive.display(),
                      "no verification key in this build; accepting unsigned artifact");
                return Ok(());
            }
            return Err(AgentError::crypto(
                "no artifact verification key available and unsigned artifacts are not allowed",
            ));
        }

        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(self.key_b64.trim())
            .map_err(|e| AgentError::crypto(format!("verification key is not valid base64: {e}")))?;
        let key_arr: [u8; 32] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AgentError::crypto("verification key has the wrong length"))?;
        let key = VerifyingKey::from_bytes(&key_arr)
            .map_err(|e| AgentError::crypto(format!("verification key is invalid: {e}")))?;

        let sig_path = Self::sig_path(archive);
        let sig_b64 = std::fs::read_to_string(&sig_path)
            .map_err(|e| AgentError::io("reading artifact signature", &sig_path, e))?;
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(sig_b64.trim())
            .map_err(|e| AgentError::crypto(format!("artifact signature is not valid base64: {e}")))?;
        let sig_arr: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| AgentError::crypto("artifact signature has the wrong length"))?;
        let signature = Signature::from_bytes(&sig_arr);

        let digest = sha256_file(archive)?;
        key.verify(&digest, &signature)
            .map_err(|_| AgentError::crypto("artifact signature does not match"))
    }
}

fn sha256_file(path: &Path) -> Result<Vec<u8>, AgentError> {
    let bytes = std::fs::read(path).map_err(|e| AgentError::io("reading artifact", path, e))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hasher.finalize().to_vec())
}
