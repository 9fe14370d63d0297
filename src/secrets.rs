//! Chain secret generation and decoding.
//!
//! A chain's cryptographic identity is a secp256k1 signing key plus a root
//! HMAC credential pair, packaged as an opaque JSON payload in a Kubernetes
//! secret. Generation happens exactly once per internal ID; later runs decode
//! the stored payload verbatim so the identity never changes.

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng as _;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Alphabet for HMAC key ids.
pub const UPPER_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
/// Alphabet for HMAC keys and generated passwords.
pub const ALNUM_CHARS: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
/// Alphabet for generated chain ids and matchmaking tokens.
pub const LOWER_ALNUM_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of a root HMAC key id.
pub const HMAC_ID_LEN: usize = 12;
/// Length of a root HMAC key.
pub const HMAC_KEY_LEN: usize = 43;

/// The secret triple stored for a chain, plus the (initially blank) registry
/// password. Field names match the payload the chain itself reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSecret {
    /// Base64-encoded secp256k1 private key.
    #[serde(rename = "private-key")]
    pub private_key: String,
    /// Root HMAC key id.
    #[serde(rename = "hmac-id")]
    pub hmac_id: String,
    /// Root HMAC key.
    #[serde(rename = "hmac-key")]
    pub hmac_key: String,
    /// Password for the container registry; blank until a registry login is
    /// configured through the chain itself.
    #[serde(rename = "registry-password", default)]
    pub registry_password: String,
}

/// `kubectl get secret -o json` wrapper around the stored payload.
#[derive(Debug, Deserialize)]
struct KubectlSecret {
    data: KubectlSecretData,
}

#[derive(Debug, Deserialize)]
struct KubectlSecretData {
    #[serde(rename = "SecretString")]
    secret_string: String,
}

/// Kubernetes secret name for a chain's internal ID.
#[must_use]
pub fn secret_name(internal_id: &str) -> String {
    format!("d-{internal_id}-secrets")
}

/// Generate a random token of `len` characters drawn from `alphabet`.
#[must_use]
pub fn random_token(len: usize, alphabet: &[u8]) -> String {
    (0..len)
        .map(|_| char::from(alphabet[OsRng.gen_range(0..alphabet.len())]))
        .collect()
}

fn random_signing_key() -> String {
    let key = k256::SecretKey::random(&mut OsRng);
    BASE64.encode(key.to_bytes())
}

impl ChainSecret {
    /// Generate a fresh chain identity: new signing key, new HMAC pair.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            private_key: random_signing_key(),
            hmac_id: random_token(HMAC_ID_LEN, UPPER_CHARS),
            hmac_key: random_token(HMAC_KEY_LEN, ALNUM_CHARS),
            registry_password: String::new(),
        }
    }

    /// Serialize to the opaque payload stored in the Kubernetes secret.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_payload(&self) -> Result<String> {
        serde_json::to_string(self).context("serializing chain secret payload")
    }

    /// Decode the payload back out of `kubectl get secret -o json` output.
    /// Kubernetes base64-encodes each data value, so this decodes twice:
    /// JSON envelope, then base64, then the payload JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope, base64 value, or payload cannot be
    /// parsed.
    pub fn from_kubectl_json(stdout: &[u8]) -> Result<Self> {
        let envelope: KubectlSecret =
            serde_json::from_slice(stdout).context("parsing chain secret from kubectl")?;
        let decoded = BASE64
            .decode(envelope.data.secret_string)
            .context("decoding base64 secret value")?;
        serde_json::from_slice(&decoded).context("parsing chain secret payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_id_is_twelve_upper_chars() {
        let secret = ChainSecret::generate();
        assert_eq!(secret.hmac_id.len(), HMAC_ID_LEN);
        assert!(secret.hmac_id.bytes().all(|b| UPPER_CHARS.contains(&b)));
    }

    #[test]
    fn hmac_key_is_forty_three_alnum_chars() {
        let secret = ChainSecret::generate();
        assert_eq!(secret.hmac_key.len(), HMAC_KEY_LEN);
        assert!(secret.hmac_key.bytes().all(|b| ALNUM_CHARS.contains(&b)));
    }

    #[test]
    fn private_key_is_base64_of_32_bytes() {
        let secret = ChainSecret::generate();
        let raw = BASE64.decode(&secret.private_key).expect("valid base64");
        assert_eq!(raw.len(), 32);
    }

    #[test]
    fn registry_password_starts_blank() {
        assert!(ChainSecret::generate().registry_password.is_empty());
    }

    #[test]
    fn generated_secrets_differ() {
        let a = ChainSecret::generate();
        let b = ChainSecret::generate();
        assert_ne!(a.private_key, b.private_key);
        assert_ne!(a.hmac_key, b.hmac_key);
    }

    #[test]
    fn secret_name_format() {
        assert_eq!(secret_name("abc123"), "d-abc123-secrets");
    }

    #[test]
    fn payload_uses_chain_field_names() {
        let secret = ChainSecret::generate();
        let payload = secret.to_payload().expect("payload");
        for field in ["private-key", "hmac-id", "hmac-key", "registry-password"] {
            assert!(payload.contains(field), "missing {field}");
        }
    }

    #[test]
    fn kubectl_json_round_trip() {
        let original = ChainSecret {
            private_key: "a2V5".to_owned(),
            hmac_id: "ABCDEFGHIJKL".to_owned(),
            hmac_key: "K".repeat(HMAC_KEY_LEN),
            registry_password: String::new(),
        };
        let payload = original.to_payload().expect("payload");
        let envelope = format!(
            r#"{{"data":{{"SecretString":"{}"}}}}"#,
            BASE64.encode(payload)
        );
        let decoded = ChainSecret::from_kubectl_json(envelope.as_bytes()).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn malformed_envelope_is_an_error() {
        assert!(ChainSecret::from_kubectl_json(b"not json").is_err());
        assert!(ChainSecret::from_kubectl_json(br#"{"data":{"SecretString":"!!!"}}"#).is_err());
    }

    #[test]
    fn random_token_respects_alphabet() {
        let token = random_token(16, LOWER_ALNUM_CHARS);
        assert_eq!(token.len(), 16);
        assert!(token.bytes().all(|b| LOWER_ALNUM_CHARS.contains(&b)));
    }
}
