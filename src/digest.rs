//! Content digests: parsing, hashing and manifest body correlation

use std::fmt;

use sha2::Digest as _;

use crate::sha256_digest;

/// Header carrying the canonical digest of the content a registry returns
pub const DOCKER_DIGEST_HEADER: &str = "Docker-Content-Digest";

/// Result type of digest helpers
pub type Result<T> = std::result::Result<T, DigestError>;

/// Errors that can occur when handling digests
#[derive(Debug, thiserror::Error)]
pub enum DigestError {
    /// The digest has no `<algorithm>:` prefix
    #[error("Digest {0:?} is missing its algorithm")]
    MissingAlgorithm(String),
    /// The digest names an algorithm this client cannot compute
    #[error("Unsupported digest algorithm: {0}")]
    UnsupportedAlgorithm(String),
    /// Content hashed to something other than the expected digest
    #[error("Invalid digest. Expected {expected}, got {actual}")]
    VerificationError {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },
}

/// A borrowed `<algorithm>:<hex>` content address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest<'a> {
    algorithm: &'a str,
    hex: &'a str,
}

impl<'a> Digest<'a> {
    /// Split a digest string into algorithm and hash.
    pub fn parse(digest: &'a str) -> Result<Self> {
        match digest.split_once(':') {
            Some((algorithm, hex)) if !algorithm.is_empty() && !hex.is_empty() => {
                Ok(Self { algorithm, hex })
            }
            _ => Err(DigestError::MissingAlgorithm(digest.to_string())),
        }
    }

    /// Algorithm name, e.g. `sha256`
    pub fn algorithm(&self) -> &'a str {
        self.algorithm
    }

    /// Hex encoded hash
    pub fn hex(&self) -> &'a str {
        self.hex
    }
}

impl fmt::Display for Digest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// Whether a manifest reference addresses content by digest rather than by
/// tag. Tags cannot contain `:`.
pub fn is_digest_reference(reference: &str) -> bool {
    reference.contains(':')
}

/// Incremental hasher for the algorithms a digest may name. An enum because
/// the `sha2` hashers are not object safe.
pub(crate) enum Digester {
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Digester {
    pub fn new(digest: &str) -> Result<Self> {
        let digest = Digest::parse(digest)?;
        match digest.algorithm() {
            "sha256" => Ok(Digester::Sha256(sha2::Sha256::new())),
            "sha384" => Ok(Digester::Sha384(sha2::Sha384::new())),
            "sha512" => Ok(Digester::Sha512(sha2::Sha512::new())),
            other => Err(DigestError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn update(&mut self, data: impl AsRef<[u8]>) {
        match self {
            Self::Sha256(d) => d.update(data),
            Self::Sha384(d) => d.update(data),
            Self::Sha512(d) => d.update(data),
        }
    }

    pub fn finalize(&mut self) -> String {
        match self {
            Self::Sha256(d) => format!("sha256:{:x}", d.finalize_reset()),
            Self::Sha384(d) => format!("sha384:{:x}", d.finalize_reset()),
            Self::Sha512(d) => format!("sha512:{:x}", d.finalize_reset()),
        }
    }
}

/// Correlate a manifest body with the digests claimed for it.
///
/// `header` is the `Docker-Content-Digest` value and `reference` the digest
/// the manifest was requested by, if it was requested by digest. Every digest
/// given must match the body. The header digest is canonical and wins when
/// both are present. With neither, the sha256 of the body is returned.
pub fn validate_digest(body: &[u8], header: Option<&str>, reference: Option<&str>) -> Result<String> {
    match (header, reference) {
        (Some(header), Some(reference)) if header == reference => verify(body, header),
        (Some(header), Some(reference)) => {
            verify(body, reference)?;
            verify(body, header)
        }
        (Some(digest), None) | (None, Some(digest)) => verify(body, digest),
        (None, None) => Ok(sha256_digest(body)),
    }
}

/// Hash `content` with the algorithm `digest` names and compare.
pub fn verify(content: &[u8], digest: &str) -> Result<String> {
    let mut digester = Digester::new(digest)?;
    digester.update(content);
    let actual = digester.finalize();
    tracing::trace!(%actual, expected = %digest, "Computed digest of payload");
    if actual != digest {
        return Err(DigestError::VerificationError {
            expected: digest.to_owned(),
            actual,
        });
    }
    Ok(actual)
}
