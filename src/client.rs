//! Docker Registry HTTP API v2 client
//!
//! A [`Client`] is bound to one repository. It shares a single
//! authentication session across every operation it issues, so that one
//! token negotiation serves `ping`, tag listing, manifest and blob requests
//! alike until the registry rejects the token.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::StreamExt;
use http::header::ACCEPT;
use http::{Method, StatusCode};
use reqwest::redirect::Policy;
use reqwest::Url;
use serde::{Deserialize, Deserializer};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, trace, warn};

use crate::auth::pull_scope;
use crate::blob::BlobStream;
use crate::digest::{is_digest_reference, validate_digest};
use crate::errors::{RegistryClientError, Result};
use crate::manifest::{Manifest, ManifestOptions};
use crate::repo::{parse_repo, RepoCoordinates};
use crate::response::{RegistryResponse, ResponseChain};
use crate::secrets::RegistryAuth;
use crate::session::{Session, SessionInfo};

/// Registry API version this client speaks
pub const API_VERSION: u8 = 2;

/// Value of `Docker-Distribution-Api-Version` announced by v2 registries
pub const API_VERSION_V2: &str = "registry/2.0";

/// Default value for `ClientConfig::max_redirects`
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The data returned by a successful tags/list Request
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TagResponse {
    /// Repository Name
    pub name: String,
    /// List of existing Tags, in the order the registry returned them
    #[serde(default, deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
}

// registries answer `"tags": null` for a repository without tags
fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Outcome of a successful `ping`
#[derive(Debug, Clone)]
pub struct PingResponse {
    body: Option<serde_json::Value>,
    response: RegistryResponse,
}

impl PingResponse {
    /// Decoded body, usually `{}`. `None` when the body is not JSON.
    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    /// Response to the `GET /v2/`
    pub fn response(&self) -> &RegistryResponse {
        &self.response
    }

    /// Announced `Docker-Distribution-Api-Version`
    pub fn api_version(&self) -> Option<&str> {
        self.response.api_version()
    }

    /// Whether the registry announces the v2 API
    pub fn supports_v2(&self) -> bool {
        self.api_version() == Some(API_VERSION_V2)
    }
}

/// The encoding of the certificate
#[derive(Debug, Clone)]
pub enum CertificateEncoding {
    #[allow(missing_docs)]
    Der,
    #[allow(missing_docs)]
    Pem,
}

/// A x509 certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    /// Which encoding is used by the certificate
    pub encoding: CertificateEncoding,

    /// Actual certificate
    pub data: Vec<u8>,
}

/// A client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Credentials used to answer authentication challenges
    pub auth: RegistryAuth,

    /// Which protocol the client should use
    pub protocol: ClientProtocol,

    /// Accept invalid hostname. Defaults to false
    #[cfg(feature = "native-tls")]
    pub accept_invalid_hostnames: bool,

    /// Accept invalid certificates. Defaults to false
    pub accept_invalid_certificates: bool,

    /// A list of extra root certificate to trust. This can be used to connect
    /// to servers using self-signed certificates
    pub extra_root_certificates: Vec<Certificate>,

    /// `User-Agent` sent with every request
    pub user_agent: String,

    /// Timeout applied to every request unless overridden with
    /// [`Client::with_timeout`]. Defaults to none.
    pub timeout: Option<Duration>,

    /// Maximum number of redirects followed by blob requests.
    ///
    /// This defaults to [`DEFAULT_MAX_REDIRECTS`].
    pub max_redirects: usize,

    /// Parent of the span every operation of the client is recorded in
    pub span: Option<tracing::Span>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auth: RegistryAuth::default(),
            protocol: ClientProtocol::default(),
            #[cfg(feature = "native-tls")]
            accept_invalid_hostnames: false,
            accept_invalid_certificates: false,
            extra_root_certificates: Vec::new(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            span: None,
        }
    }
}

/// The protocol that the client should use to connect
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientProtocol {
    #[allow(missing_docs)]
    Http,
    #[allow(missing_docs)]
    #[default]
    Https,
    /// HTTPS, except for the listed registry hosts
    HttpsExcept(Vec<String>),
}

impl ClientProtocol {
    fn scheme_for(&self, registry: &str) -> &str {
        match self {
            ClientProtocol::Https => "https",
            ClientProtocol::Http => "http",
            ClientProtocol::HttpsExcept(exceptions) => {
                if exceptions.iter().any(|e| e == registry) {
                    "http"
                } else {
                    "https"
                }
            }
        }
    }
}

/// The HTTP clients a registry client issues requests through.
///
/// `direct` never follows redirects, so blob requests can record every hop
/// and drop credentials after the first one. `following` follows redirects
/// itself and serves every other request, including token exchanges.
#[derive(Clone)]
pub(crate) struct Transport {
    pub(crate) direct: reqwest::Client,
    pub(crate) following: reqwest::Client,
}

impl Transport {
    fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Transport {
            direct: build_http_client(config, Policy::none())?,
            following: build_http_client(config, Policy::limited(config.max_redirects))?,
        })
    }
}

fn build_http_client(config: &ClientConfig, redirect: Policy) -> Result<reqwest::Client> {
    let mut client_builder = reqwest::Client::builder()
        .user_agent(config.user_agent.as_str())
        .redirect(redirect)
        .danger_accept_invalid_certs(config.accept_invalid_certificates);

    client_builder = match () {
        #[cfg(feature = "native-tls")]
        () => client_builder.danger_accept_invalid_hostnames(config.accept_invalid_hostnames),
        #[cfg(not(feature = "native-tls"))]
        () => client_builder,
    };

    for c in &config.extra_root_certificates {
        let cert = match c.encoding {
            CertificateEncoding::Der => reqwest::Certificate::from_der(c.data.as_slice())?,
            CertificateEncoding::Pem => reqwest::Certificate::from_pem(c.data.as_slice())?,
        };
        client_builder = client_builder.add_root_certificate(cert);
    }

    Ok(client_builder.build()?)
}

struct ClientInner {
    repo: RepoCoordinates,
    base_url: String,
    session: Session,
    // `None` once closed
    transport: RwLock<Option<Transport>>,
    default_timeout: Option<Duration>,
    max_redirects: usize,
    span: tracing::Span,
}

/// Client for one repository of a Docker Distribution registry.
///
/// Cloning is cheap; clones share the session and the connection pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    timeout: Option<Duration>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("repo", &self.inner.repo)
            .field("base_url", &self.inner.base_url)
            .field("timeout", &self.timeout())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Client {
    /// Create a client for the repository `name`, e.g. `alpine`,
    /// `quay.io/coreos/etcd` or `localhost:5000/app`.
    ///
    /// Fails with [`RegistryClientError::InvalidRepoName`] before any I/O if
    /// the name is malformed.
    pub fn new(name: &str, config: ClientConfig) -> Result<Self> {
        let repo = parse_repo(name)?;
        let transport = Transport::new(&config)?;

        let endpoint = repo.registry_endpoint();
        let base_url = format!("{}://{}", config.protocol.scheme_for(endpoint), endpoint);
        let span = match &config.span {
            Some(parent) => tracing::debug_span!(parent: parent, "docker_registry", repo = %repo),
            None => tracing::debug_span!("docker_registry", repo = %repo),
        };
        span.in_scope(|| debug!(%base_url, auth = ?config.auth, "Created registry client"));

        Ok(Client {
            inner: Arc::new(ClientInner {
                session: Session::new(config.auth, pull_scope(repo.remote_name())),
                repo,
                base_url,
                transport: RwLock::new(Some(transport)),
                default_timeout: config.timeout,
                max_redirects: config.max_redirects,
                span,
            }),
            timeout: None,
        })
    }

    /// Registry API version, always `2`
    pub fn version(&self) -> u8 {
        API_VERSION
    }

    /// Coordinates of the repository the client is bound to
    pub fn repo(&self) -> &RepoCoordinates {
        &self.inner.repo
    }

    /// A handle on the same session and transport whose requests time out
    /// after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Client {
        Client {
            inner: Arc::clone(&self.inner),
            timeout: Some(timeout),
        }
    }

    /// Current authentication state
    pub async fn session_info(&self) -> SessionInfo {
        self.inner.session.info().await
    }

    /// Release the client's pooled connections.
    ///
    /// Operations already in flight keep their own handle on the pool and
    /// run to completion; operations issued afterwards, from this handle or
    /// any clone, fail with [`RegistryClientError::Closed`]. Calling `close`
    /// more than once has no further effect.
    pub fn close(&self) {
        let previous = self
            .inner
            .transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if previous.is_some() {
            self.inner.span.in_scope(|| debug!("Closed registry client"));
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Issue an anonymous `GET /v2/`.
    ///
    /// This does not negotiate credentials: against an access-controlled
    /// registry it fails with [`RegistryClientError::Unauthorized`] carrying
    /// the `401` response and its `WWW-Authenticate` challenge.
    #[instrument(level = "debug", parent = &self.inner.span, skip(self))]
    pub async fn ping(&self) -> Result<PingResponse> {
        let transport = self.transport()?;
        let url = format!("{}/v2/", self.inner.base_url);
        let mut request = transport.following.get(&url);
        if let Some(timeout) = self.timeout() {
            request = request.timeout(timeout);
        }
        let (response, body) = read_success(request.send().await?).await?;
        debug!(api_version = ?response.api_version(), "Registry answered ping");
        Ok(PingResponse {
            body: serde_json::from_slice(&body).ok(),
            response,
        })
    }

    /// List every tag of the repository
    #[instrument(level = "debug", parent = &self.inner.span, skip(self))]
    pub async fn list_tags(&self) -> Result<TagResponse> {
        self.fetch_tags(None, None).await
    }

    /// List at most `n` tags, starting after `last`
    #[instrument(level = "debug", parent = &self.inner.span, skip(self))]
    pub async fn list_tags_page(&self, n: Option<usize>, last: Option<&str>) -> Result<TagResponse> {
        self.fetch_tags(n, last).await
    }

    async fn fetch_tags(&self, n: Option<usize>, last: Option<&str>) -> Result<TagResponse> {
        let transport = self.transport()?;
        let url = self.to_list_tags_url();
        let res = self
            .inner
            .session
            .send(&transport, self.timeout(), |t| {
                let request = t.following.get(&url);
                let request = if let Some(num) = n {
                    request.query(&[("n", num)])
                } else {
                    request
                };
                if let Some(l) = last {
                    request.query(&[("last", l)])
                } else {
                    request
                }
            })
            .await?;
        let (_, body) = read_success(res).await?;
        let tags: TagResponse = serde_json::from_slice(&body)?;
        debug!(count = tags.tags.len(), "Listed tags");
        Ok(tags)
    }

    /// Fetch the manifest `reference` points at, a tag or a digest.
    ///
    /// Schema 2 manifests are advertised in preference to schema 1. The
    /// returned response exposes `Docker-Content-Digest`.
    #[instrument(level = "debug", parent = &self.inner.span, skip(self))]
    pub async fn get_manifest(&self, reference: &str) -> Result<(Manifest, RegistryResponse)> {
        self.fetch_manifest(reference, &ManifestOptions::default())
            .await
    }

    /// Fetch a manifest, negotiating the formats `options` allows.
    ///
    /// The body of a schema 2 manifest is checked against
    /// `Docker-Content-Digest`, and against `reference` when it is a digest.
    /// Schema 1 signed manifests are returned unchecked: their digest covers
    /// the signed payload rather than the bytes on the wire.
    #[instrument(level = "debug", parent = &self.inner.span, skip(self))]
    pub async fn get_manifest_with(
        &self,
        reference: &str,
        options: &ManifestOptions,
    ) -> Result<(Manifest, RegistryResponse)> {
        self.fetch_manifest(reference, options).await
    }

    async fn fetch_manifest(
        &self,
        reference: &str,
        options: &ManifestOptions,
    ) -> Result<(Manifest, RegistryResponse)> {
        let transport = self.transport()?;
        let url = self.to_v2_manifest_url(reference);
        let accept = options.accept_header();
        let res = self
            .inner
            .session
            .send(&transport, self.timeout(), |t| {
                t.following.get(&url).header(ACCEPT, accept.as_str())
            })
            .await?;
        let (response, body) = read_success(res).await?;

        let manifest = Manifest::from_bytes(body, response.content_type())?;
        if manifest.schema_version() == 2 {
            let reference_digest = is_digest_reference(reference).then_some(reference);
            let digest =
                validate_digest(manifest.raw(), response.content_digest(), reference_digest)?;
            trace!(%digest, "Verified manifest digest");
        } else if response.content_digest().is_none() {
            warn!("Schema 1 manifest returned without Docker-Content-Digest");
        }
        debug!(
            schema_version = manifest.schema_version(),
            media_type = ?manifest.media_type(),
            digest = ?response.content_digest(),
            "Fetched manifest"
        );
        Ok((manifest, response))
    }

    /// Check that a blob exists, following redirects.
    ///
    /// The chain starts with the registry's own response, which carries
    /// `Docker-Content-Digest`, and ends with the storage backend's answer.
    #[instrument(level = "debug", parent = &self.inner.span, skip(self))]
    pub async fn head_blob(&self, digest: &str) -> Result<ResponseChain> {
        let (_, chain) = self.follow_blob(Method::HEAD, digest).await?;
        Ok(chain)
    }

    /// Open a stream over a blob's bytes, following redirects.
    ///
    /// The bytes are not verified against `digest`; wrap the stream with
    /// [`BlobStream::verifying`] to have it checked at the end.
    #[instrument(level = "debug", parent = &self.inner.span, skip(self))]
    pub async fn create_blob_read_stream(
        &self,
        digest: &str,
    ) -> Result<(BlobStream, ResponseChain)> {
        let (res, chain) = self.follow_blob(Method::GET, digest).await?;
        let content_length = chain.last().content_length();
        Ok((BlobStream::from_response(res, content_length), chain))
    }

    /// Write a blob's bytes to `out`, following redirects.
    #[instrument(level = "debug", parent = &self.inner.span, skip(self, out))]
    pub async fn pull_blob<T: AsyncWrite + Unpin>(
        &self,
        digest: &str,
        mut out: T,
    ) -> Result<ResponseChain> {
        let (mut stream, chain) = self.create_blob_read_stream(digest).await?;
        while let Some(bytes) = stream.next().await {
            out.write_all(&bytes?).await?;
        }
        out.flush().await?;
        debug!(bytes = stream.bytes_received(), "Pulled blob");
        Ok(chain)
    }

    /// Issue `method` against the blob URL and follow redirects by hand.
    ///
    /// Only the first hop goes through the session and carries credentials;
    /// storage backends are contacted anonymously.
    async fn follow_blob(
        &self,
        method: Method,
        digest: &str,
    ) -> Result<(reqwest::Response, ResponseChain)> {
        let transport = self.transport()?;
        let timeout = self.timeout();
        let url = self.to_v2_blob_url(digest);
        let mut res = self
            .inner
            .session
            .send(&transport, timeout, |t| t.direct.request(method.clone(), &url))
            .await?;
        let mut chain = ResponseChain::new(RegistryResponse::from_reqwest(&res));

        while chain.last().is_redirect() {
            if chain.len() > self.inner.max_redirects {
                return Err(RegistryClientError::Redirect {
                    reason: format!("stopped after {} redirects", self.inner.max_redirects),
                    chain,
                });
            }
            let next = match next_hop(chain.last()) {
                Ok(next) => next,
                Err(reason) => return Err(RegistryClientError::Redirect { reason, chain }),
            };
            debug!(status = %chain.last().status(), %next, "Following blob redirect");

            let mut request = transport.direct.request(method.clone(), next);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }
            res = match request.send().await {
                Ok(res) => res,
                Err(source) => {
                    return Err(RegistryClientError::Transport {
                        source,
                        attempted: Some(chain),
                    })
                }
            };
            chain.push(RegistryResponse::from_reqwest(&res));
        }

        let status = chain.last().status();
        if !status.is_success() {
            let body = if method == Method::HEAD {
                Bytes::new()
            } else {
                res.bytes().await.unwrap_or_default()
            };
            debug!(%status, hops = chain.len(), "Blob request failed");
            return Err(RegistryClientError::from_status(chain, &body));
        }
        debug!(hops = chain.len(), content_length = ?chain.last().content_length(), "Blob request succeeded");
        Ok((res, chain))
    }

    fn transport(&self) -> Result<Transport> {
        self.inner
            .transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(RegistryClientError::Closed)
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout.or(self.inner.default_timeout)
    }

    fn to_list_tags_url(&self) -> String {
        format!(
            "{}/v2/{}/tags/list",
            self.inner.base_url,
            self.inner.repo.remote_name()
        )
    }

    fn to_v2_manifest_url(&self, reference: &str) -> String {
        format!(
            "{}/v2/{}/manifests/{}",
            self.inner.base_url,
            self.inner.repo.remote_name(),
            reference
        )
    }

    fn to_v2_blob_url(&self, digest: &str) -> String {
        format!(
            "{}/v2/{}/blobs/{}",
            self.inner.base_url,
            self.inner.repo.remote_name(),
            digest
        )
    }
}

/// Resolve the `Location` of a redirect against the URL that produced it.
fn next_hop(response: &RegistryResponse) -> std::result::Result<Url, String> {
    let location = response
        .location()
        .ok_or_else(|| format!("{} without a Location header", response.status()))?;
    response
        .url()
        .join(location)
        .map_err(|e| format!("invalid Location {:?}: {}", location, e))
}

/// Read a whole body, turning a non-2xx status into the matching error.
async fn read_success(res: reqwest::Response) -> Result<(RegistryResponse, Bytes)> {
    let response = RegistryResponse::from_reqwest(&res);
    let body = res.bytes().await?;
    if response.status().is_success() {
        return Ok((response, body));
    }
    if response.status() == StatusCode::UNAUTHORIZED {
        debug!(challenge = ?response.www_authenticate(), "Registry requires authentication");
    }
    Err(RegistryClientError::from_status(
        ResponseChain::new(response),
        &body,
    ))
}
