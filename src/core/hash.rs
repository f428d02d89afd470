use crate::core::models::{Fingerprint, FINGERPRINT_LEN};
use image_hasher::{HashAlg, Hasher, HasherConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Image decoding error: {0}")]
    Decode(#[from] image::ImageError),

    #[error("Hash computation failed: {message}")]
    ComputationFailed { message: String },
}

/// How image bytes are turned into a fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FingerprintMode {
    /// Truncated BLAKE3 digest of the raw bytes. Only byte-identical (or
    /// near-identical) encodings land close to each other.
    #[default]
    ContentDigest,
    /// 8x8 mean hash of the decoded pixels.
    Perceptual,
}

/// Computes fingerprints for one worker. Not shared between threads.
pub struct Fingerprinter {
    hasher: Option<Hasher>,
}

impl Fingerprinter {
    pub fn new(mode: FingerprintMode) -> Self {
        let hasher = match mode {
            FingerprintMode::ContentDigest => None,
            FingerprintMode::Perceptual => Some(
                HasherConfig::new()
                    .hash_alg(HashAlg::Mean)
                    .hash_size(8, 8)
                    .to_hasher(),
            ),
        };
        Self { hasher }
    }

    pub fn fingerprint(&self, bytes: &[u8]) -> Result<Fingerprint, HashError> {
        match &self.hasher {
            None => Ok(content_fingerprint(bytes)),
            Some(hasher) => {
                let image = image::load_from_memory(bytes)?;
                let hex = to_hex(hasher.hash_image(&image).as_bytes());
                if hex.len() != FINGERPRINT_LEN {
                    return Err(HashError::ComputationFailed {
                        message: format!(
                            "perceptual hash has {} hex characters, expected {}",
                            hex.len(),
                            FINGERPRINT_LEN
                        ),
                    });
                }
                Ok(Fingerprint(hex))
            }
        }
    }
}

/// BLAKE3 digest of `bytes`, truncated to the fixed fingerprint length.
pub fn content_fingerprint(bytes: &[u8]) -> Fingerprint {
    let digest = blake3::hash(bytes).to_hex();
    Fingerprint(digest.as_str()[..FINGERPRINT_LEN].to_string())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
