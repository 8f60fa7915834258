//! A Docker Distribution Registry (HTTP API v2) client for pulling manifests,
//! listing tags and streaming blobs from a single repository.
#![deny(missing_docs)]

pub mod auth;
pub mod blob;
pub mod client;
pub mod digest;
pub mod errors;
pub mod manifest;
mod regexp;
pub mod repo;
pub mod response;
pub mod secrets;
mod session;

#[doc(inline)]
pub use auth::AuthMode;
#[doc(inline)]
pub use blob::BlobStream;
#[doc(inline)]
pub use client::{Client, ClientConfig, ClientProtocol, PingResponse, TagResponse};
#[doc(inline)]
pub use errors::{RegistryClientError, Result};
#[doc(inline)]
pub use manifest::{Manifest, ManifestOptions};
#[doc(inline)]
pub use repo::{parse_repo, InvalidRepoNameError, RepoCoordinates};
#[doc(inline)]
pub use response::{RegistryResponse, ResponseChain};
#[doc(inline)]
pub use secrets::RegistryAuth;
#[doc(inline)]
pub use session::SessionInfo;

#[macro_use]
extern crate lazy_static;

/// Computes the SHA256 digest of a byte vector, in `sha256:<hex>` form
pub fn sha256_digest(bytes: &[u8]) -> String {
    use sha2::Digest as _;
    format!("sha256:{:x}", sha2::Sha256::digest(bytes))
}
