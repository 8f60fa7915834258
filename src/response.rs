//! Raw HTTP response metadata returned alongside operation results

use std::ops::Index;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use http::{HeaderMap, StatusCode};
use reqwest::Url;

use crate::digest::DOCKER_DIGEST_HEADER;

/// Header carrying the API version a registry speaks.
pub const DOCKER_API_VERSION_HEADER: &str = "Docker-Distribution-Api-Version";

/// Status, URL and headers of one HTTP response received from a registry or
/// from a storage backend it redirected to. Bodies are never stored here.
#[derive(Debug, Clone)]
pub struct RegistryResponse {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
}

impl RegistryResponse {
    pub(crate) fn new(url: Url, status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            url,
            status,
            headers,
        }
    }

    pub(crate) fn from_reqwest(res: &reqwest::Response) -> Self {
        Self::new(res.url().clone(), res.status(), res.headers().clone())
    }

    /// URL the request was issued against
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// HTTP status code
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// All response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Value of a header, if present and valid visible ASCII
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The `Docker-Content-Digest` header: the canonical digest of the
    /// content addressed by the request.
    pub fn content_digest(&self) -> Option<&str> {
        self.header(DOCKER_DIGEST_HEADER)
    }

    /// The declared `Content-Length`.
    ///
    /// Read from the header rather than the body, so it is also available on
    /// `HEAD` responses.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    }

    /// The `Content-Type` header
    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE.as_str())
    }

    /// The `Docker-Distribution-Api-Version` header
    pub fn api_version(&self) -> Option<&str> {
        self.header(DOCKER_API_VERSION_HEADER)
    }

    /// The raw `WWW-Authenticate` challenge, present on `401` responses
    pub fn www_authenticate(&self) -> Option<&str> {
        self.header(WWW_AUTHENTICATE.as_str())
    }

    /// The `Location` header of a redirect
    pub fn location(&self) -> Option<&str> {
        self.header(LOCATION.as_str())
    }

    /// Whether this response asks the client to follow `Location`
    pub fn is_redirect(&self) -> bool {
        matches!(
            self.status,
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        )
    }
}

/// The ordered responses of one logical request after redirect-following.
///
/// Index `0` is the response to the original request, which is the only one
/// carrying registry headers such as `Docker-Content-Digest`. The last entry
/// is the terminal response whose body, if any, is authoritative. A chain is
/// never empty.
#[derive(Debug, Clone)]
pub struct ResponseChain {
    responses: Vec<RegistryResponse>,
}

impl ResponseChain {
    pub(crate) fn new(first: RegistryResponse) -> Self {
        Self {
            responses: vec![first],
        }
    }

    pub(crate) fn push(&mut self, response: RegistryResponse) {
        self.responses.push(response);
    }

    /// The response to the original request
    pub fn first(&self) -> &RegistryResponse {
        &self.responses[0]
    }

    /// The terminal response
    pub fn last(&self) -> &RegistryResponse {
        &self.responses[self.responses.len() - 1]
    }

    /// Number of hops, at least one
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// Response of hop `index`
    pub fn get(&self, index: usize) -> Option<&RegistryResponse> {
        self.responses.get(index)
    }

    /// Iterate hops in request order
    pub fn iter(&self) -> std::slice::Iter<'_, RegistryResponse> {
        self.responses.iter()
    }

    /// All hops as a slice
    pub fn as_slice(&self) -> &[RegistryResponse] {
        &self.responses
    }
}

impl Index<usize> for ResponseChain {
    type Output = RegistryResponse;

    fn index(&self, index: usize) -> &Self::Output {
        &self.responses[index]
    }
}

impl<'a> IntoIterator for &'a ResponseChain {
    type Item = &'a RegistryResponse;
    type IntoIter = std::slice::Iter<'a, RegistryResponse>;

    fn into_iter(self) -> Self::IntoIter {
        self.responses.iter()
    }
}
