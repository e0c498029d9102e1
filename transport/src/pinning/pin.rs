use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{HttpError, Result};

/// Digest algorithm for a certificate pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinAlgorithm {
    Sha1,
    Sha256,
}

impl PinAlgorithm {
    pub fn label(&self) -> &'static str {
        match self {
            PinAlgorithm::Sha1 => "sha1",
            PinAlgorithm::Sha256 => "sha256",
        }
    }

    pub fn digest_len(&self) -> usize {
        match self {
            PinAlgorithm::Sha1 => 20,
            PinAlgorithm::Sha256 => 32,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sha1" => Some(PinAlgorithm::Sha1),
            "sha256" => Some(PinAlgorithm::Sha256),
            _ => None,
        }
    }
}

/// A digest of a certificate's encoded public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertificatePin {
    algorithm: PinAlgorithm,
    digest: Vec<u8>,
}

impl CertificatePin {
    /// Build a pin, enforcing that the digest length matches the algorithm.
    pub fn new(algorithm: PinAlgorithm, digest: Vec<u8>) -> Result<Self> {
        if digest.len() != algorithm.digest_len() {
            return Err(HttpError::Config(format!(
                "Pin digest length {} does not match {} output size {}",
                digest.len(),
                algorithm.label(),
                algorithm.digest_len()
            )));
        }
        Ok(Self { algorithm, digest })
    }

    /// Parse the SDK pin notation `"[algorithm]/[base64-hash]"`.
    pub fn parse(pin: &str) -> Result<Self> {
        let (algorithm, hash) = pin.split_once('/').ok_or_else(|| {
            HttpError::Config(format!(
                "Pin must be in the form \"[algorithm]/[hash]\": {}",
                pin
            ))
        })?;

        let algorithm = PinAlgorithm::parse(algorithm).ok_or_else(|| {
            HttpError::Config(format!(
                "Invalid pin algorithm {:?}. Must be sha256 or sha1",
                algorithm
            ))
        })?;

        let digest = BASE64
            .decode(hash)
            .map_err(|e| HttpError::Config(format!("Invalid base64 pin hash {:?}: {}", hash, e)))?;

        Self::new(algorithm, digest)
    }

    pub fn algorithm(&self) -> PinAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Render as `algorithm/base64`, the same notation `parse` accepts.
    pub fn display(&self) -> String {
        format!("{}/{}", self.algorithm.label(), BASE64.encode(&self.digest))
    }
}

/// Digests an encoded public key into candidate pin bytes.
///
/// Kept behind a trait so verification logic can be exercised without real
/// key material.
pub trait PinEncoder: Send + Sync {
    fn encode(&self, algorithm: PinAlgorithm, spki: &[u8]) -> Vec<u8>;
}

/// Default encoder: plain SHA-1/SHA-256 over the SubjectPublicKeyInfo bytes.
pub struct SpkiPinEncoder;

impl PinEncoder for SpkiPinEncoder {
    fn encode(&self, algorithm: PinAlgorithm, spki: &[u8]) -> Vec<u8> {
        match algorithm {
            PinAlgorithm::Sha1 => Sha1::digest(spki).to_vec(),
            PinAlgorithm::Sha256 => Sha256::digest(spki).to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sha256_pin_notation() {
        let digest = [7u8; 32];
        let pin = CertificatePin::parse(&format!("sha256/{}", BASE64.encode(digest))).unwrap();

        assert_eq!(pin.algorithm(), PinAlgorithm::Sha256);
        assert_eq!(pin.digest(), &digest);
    }

    #[test]
    fn algorithm_is_case_insensitive() {
        let digest = [1u8; 20];
        let pin = CertificatePin::parse(&format!("SHA1/{}", BASE64.encode(digest))).unwrap();
        assert_eq!(pin.algorithm(), PinAlgorithm::Sha1);
    }

    #[test]
    fn rejects_unknown_algorithm_and_bad_notation() {
        assert!(CertificatePin::parse("md5/AAAA").is_err());
        assert!(CertificatePin::parse("sha256-no-slash").is_err());
        assert!(CertificatePin::parse("sha256/!!!not-base64!!!").is_err());
    }

    #[test]
    fn rejects_digest_length_mismatch() {
        // 20 bytes is SHA-1 sized, not SHA-256 sized.
        assert!(CertificatePin::new(PinAlgorithm::Sha256, vec![0u8; 20]).is_err());
        assert!(CertificatePin::new(PinAlgorithm::Sha1, vec![0u8; 20]).is_ok());
    }

    #[test]
    fn encoder_output_matches_algorithm_size() {
        let encoder = SpkiPinEncoder;
        assert_eq!(encoder.encode(PinAlgorithm::Sha1, b"key").len(), 20);
        assert_eq!(encoder.encode(PinAlgorithm::Sha256, b"key").len(), 32);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let pin = CertificatePin::new(PinAlgorithm::Sha256, vec![9u8; 32]).unwrap();
        let reparsed = CertificatePin::parse(&pin.display()).unwrap();
        assert_eq!(pin, reparsed);
    }
}
