//! Sealing for stored registry secrets
//!
//! Secrets at rest carry an HMAC so a tampered or foreign row is rejected
//! before its contents are ever used. This is integrity protection, not
//! encryption; the deployment is expected to protect the database file.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const SEAL_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum SealError {
    #[error("Malformed sealed secret")]
    Malformed,

    #[error("Secret failed integrity check")]
    IntegrityFailure,
}

/// Seals and opens secret strings with a keyed MAC
#[derive(Clone)]
pub struct SecretSealer {
    key: Vec<u8>,
}

impl SecretSealer {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.as_bytes().to_vec(),
        }
    }

    pub fn seal(&self, plaintext: &str) -> String {
        let payload = BASE64.encode(plaintext.as_bytes());
        let tag = self.mac(&payload);
        format!("{}:{}:{}", SEAL_VERSION, payload, tag)
    }

    pub fn open(&self, sealed: &str) -> Result<String, SealError> {
        let mut parts = sealed.splitn(3, ':');
        let (version, payload, tag) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(p), Some(t)) => (v, p, t),
            _ => return Err(SealError::Malformed),
        };

        if version != SEAL_VERSION {
            return Err(SealError::Malformed);
        }

        if self.mac(payload) != tag {
            return Err(SealError::IntegrityFailure);
        }

        let bytes = BASE64.decode(payload).map_err(|_| SealError::Malformed)?;
        String::from_utf8(bytes).map_err(|_| SealError::Malformed)
    }

    fn mac(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        BASE64.encode(mac.finalize().into_bytes())
    }
}
