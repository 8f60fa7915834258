//! Errors related to interacting with a registry

use std::fmt;

use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::digest::DigestError;
use crate::repo::InvalidRepoNameError;
use crate::response::{RegistryResponse, ResponseChain};

/// Result type for registry client operations
pub type Result<T> = std::result::Result<T, RegistryClientError>;

/// Errors returned by the registry client
#[derive(Debug, thiserror::Error)]
pub enum RegistryClientError {
    /// The repository name given at construction is malformed
    #[error(transparent)]
    InvalidRepoName(#[from] InvalidRepoNameError),

    /// The token endpoint answered the exchange with a non-2xx status
    #[error("token endpoint {url} returned {status}: {message}")]
    AuthEndpoint {
        /// Token endpoint URL
        url: String,
        /// Status returned by the token endpoint
        status: StatusCode,
        /// Body returned by the token endpoint
        message: String,
    },

    /// The token endpoint answered with a body carrying no usable token
    #[error("token endpoint {url} returned no token: {reason}")]
    MalformedAuthResponse {
        /// Token endpoint URL
        url: String,
        /// What was wrong with the body
        reason: String,
    },

    /// The registry answered `401`, either after the one authenticated retry
    /// or, for `ping`, on the anonymous request itself
    #[error("not authorized: {} returned 401", .chain.last().url())]
    Unauthorized {
        /// Responses received for the failing request
        chain: ResponseChain,
        /// Registry error envelope, if the body carried one
        envelope: Option<RegistryErrorEnvelope>,
    },

    /// The repository, tag, manifest or blob does not exist
    #[error("not found: {} returned 404", .chain.last().url())]
    NotFound {
        /// Responses received for the failing request
        chain: ResponseChain,
        /// Registry error envelope, if the body carried one
        envelope: Option<RegistryErrorEnvelope>,
    },

    /// Any other non-2xx status
    #[error("registry error: {} returned {}", .chain.last().url(), .chain.last().status())]
    Registry {
        /// Responses received for the failing request
        chain: ResponseChain,
        /// Registry error envelope, if the body carried one
        envelope: Option<RegistryErrorEnvelope>,
    },

    /// Connection-level failure reported by the HTTP transport
    #[error("transport error: {source}")]
    Transport {
        /// Underlying transport error
        source: reqwest::Error,
        /// Responses received before the failing hop, if any
        attempted: Option<ResponseChain>,
    },

    /// A redirect could not be followed
    #[error("cannot follow redirect from {}: {reason}", .chain.last().url())]
    Redirect {
        /// What went wrong
        reason: String,
        /// Every hop attempted so far
        chain: ResponseChain,
    },

    /// The manifest declares a `schemaVersion` this client does not handle
    #[error("unsupported manifest schema version {0}")]
    UnsupportedSchemaVersion(i64),

    /// The manifest body is not a schema-versioned JSON document
    #[error("failed to parse manifest: {0}")]
    ManifestParsing(String),

    /// Digest parsing or verification failed
    #[error(transparent)]
    Digest(#[from] DigestError),

    /// A JSON body could not be decoded
    #[error("failed to decode response body: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing a blob to its destination failed, or its body was cut short
    #[error("blob I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was issued after [`Client::close`](crate::Client::close)
    #[error("client has been closed")]
    Closed,
}

impl From<reqwest::Error> for RegistryClientError {
    fn from(source: reqwest::Error) -> Self {
        RegistryClientError::Transport {
            source,
            attempted: None,
        }
    }
}

impl RegistryClientError {
    /// Build the error for a non-2xx registry response, attaching the error
    /// envelope when the body holds one.
    pub(crate) fn from_status(chain: ResponseChain, body: &[u8]) -> Self {
        let envelope = serde_json::from_slice::<RegistryErrorEnvelope>(body).ok();
        match chain.last().status() {
            StatusCode::UNAUTHORIZED => RegistryClientError::Unauthorized { chain, envelope },
            StatusCode::NOT_FOUND => RegistryClientError::NotFound { chain, envelope },
            _ => RegistryClientError::Registry { chain, envelope },
        }
    }

    /// Responses attached to the error, if it came from an HTTP exchange
    pub fn chain(&self) -> Option<&ResponseChain> {
        match self {
            RegistryClientError::Unauthorized { chain, .. }
            | RegistryClientError::NotFound { chain, .. }
            | RegistryClientError::Registry { chain, .. }
            | RegistryClientError::Redirect { chain, .. } => Some(chain),
            RegistryClientError::Transport { attempted, .. } => attempted.as_ref(),
            _ => None,
        }
    }

    /// The terminal response attached to the error
    pub fn response(&self) -> Option<&RegistryResponse> {
        self.chain().map(ResponseChain::last)
    }

    /// HTTP status behind the error, if any
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RegistryClientError::AuthEndpoint { status, .. } => Some(*status),
            RegistryClientError::Transport { source, .. } => source
                .status()
                .or_else(|| self.response().map(RegistryResponse::status)),
            _ => self.response().map(RegistryResponse::status),
        }
    }

    /// Registry error envelope carried by the failing response
    pub fn envelope(&self) -> Option<&RegistryErrorEnvelope> {
        match self {
            RegistryClientError::Unauthorized { envelope, .. }
            | RegistryClientError::NotFound { envelope, .. }
            | RegistryClientError::Registry { envelope, .. } => envelope.as_ref(),
            _ => None,
        }
    }

    /// Whether the registry reported the addressed content as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryClientError::NotFound { .. })
    }
}

/// The error body registries return with non-2xx responses
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RegistryErrorEnvelope {
    /// The individual errors
    pub errors: Vec<RegistryErrorDetail>,
}

/// One entry of a [`RegistryErrorEnvelope`]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistryErrorDetail {
    /// Error code, e.g. `MANIFEST_UNKNOWN`
    pub code: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    /// Unstructured detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl fmt::Display for RegistryErrorEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect();
        write!(f, "{}", errors.join(", "))
    }
}
