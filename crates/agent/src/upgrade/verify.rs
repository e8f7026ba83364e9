//! Minisign-format detached signature verification.
//!
//! Public keys and signatures are the usual two-line minisign layout:
//! an untrusted comment followed by base64. Only the pure ed25519
//! algorithm (`Ed`) is accepted; prehashed signatures are rejected.

use std::path::Path;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

const ALG_PURE: [u8; 2] = *b"Ed";
const ALG_PREHASHED: [u8; 2] = *b"ED";

pub struct MinisignVerifier {
    key_id: [u8; 8],
    key: VerifyingKey,
}

impl MinisignVerifier {
    /// Parses a minisign public key (comment header included).
    pub fn from_public_key(text: &str) -> anyhow::Result<Self> {
        let encoded = base64_line(text).context("minisign public key is empty")?;
        let decoded = BASE64
            .decode(encoded)
            .context("decode minisign public key")?;
        if decoded.len() != 42 {
            anyhow::bail!(
                "invalid minisign public key length: expected 42 bytes, got {}",
                decoded.len()
            );
        }
        if decoded[..2] != ALG_PURE {
            anyhow::bail!("unsupported minisign key algorithm");
        }
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&decoded[2..10]);
        let mut key_bytes = [0u8; 32];
        key_bytes.copy_from_slice(&decoded[10..42]);
        let key = VerifyingKey::from_bytes(&key_bytes).context("invalid ed25519 public key")?;
        Ok(Self { key_id, key })
    }

    pub fn from_public_key_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read minisign public key {}", path.display()))?;
        Self::from_public_key(&text)
    }

    /// Verifies the detached signature at `signature_path` over the file
    /// at `artifact_path`.
    pub fn verify(&self, artifact_path: &Path, signature_path: &Path) -> anyhow::Result<()> {
        let signature_text = std::fs::read_to_string(signature_path)
            .with_context(|| format!("read signature {}", signature_path.display()))?;
        let encoded = base64_line(&signature_text)
            .with_context(|| format!("signature {} is empty", signature_path.display()))?;
        let decoded = BASE64.decode(encoded).context("decode signature")?;
        if decoded.len() != 74 {
            anyhow::bail!(
                "invalid minisign signature length: expected 74 bytes, got {}",
                decoded.len()
            );
        }
        if decoded[..2] == ALG_PREHASHED {
            anyhow::bail!("prehashed minisign signatures are not supported");
        }
        if decoded[..2] != ALG_PURE {
            anyhow::bail!("unsupported minisign signature algorithm");
        }
        if decoded[2..10] != self.key_id {
            anyhow::bail!("signature key id does not match the trusted public key");
        }

        let mut sig_bytes = [0u8; 64];
        sig_bytes.copy_from_slice(&decoded[10..74]);
        let signature = Signature::from_bytes(&sig_bytes);

        let message = std::fs::read(artifact_path)
            .with_context(|| format!("read artifact {}", artifact_path.display()))?;
        self.key
            .verify(&message, &signature)
            .map_err(|_| anyhow::anyhow!("signature verification failed"))
    }
}

/// First line that is neither empty nor a comment; minisign files put
/// the base64 payload there.
fn base64_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("untrusted comment:"))
}
