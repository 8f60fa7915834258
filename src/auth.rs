//! Authentication negotiation
//!
//! A `401` from the registry carries a `WWW-Authenticate` challenge. A Basic
//! challenge is answered locally from the configured credentials. A Bearer
//! challenge is answered by exchanging credentials (or nothing, for an
//! anonymous token) for a token at the challenge's realm.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::WWW_AUTHENTICATE;
use http::{HeaderMap, HeaderValue};
use http_auth::{parser::ChallengeParser, ChallengeRef};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use tracing::debug;
use unicase::UniCase;

use crate::errors::{RegistryClientError, Result};
use crate::secrets::{Authenticable, RegistryAuth};

/// Token lifetime assumed when the token endpoint does not state one.
pub const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 60;

/// How a session authenticates its requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// No credentials are attached
    #[default]
    None,
    /// HTTP Basic credentials are attached
    Basic,
    /// A bearer token from the token endpoint is attached
    Bearer,
}

/// Authentication scheme named by a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// HTTP Basic
    Basic,
    /// Token exchange
    Bearer,
}

/// A parsed `WWW-Authenticate` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// Requested scheme
    pub scheme: AuthScheme,
    /// Token endpoint for Bearer, protection space for Basic
    pub realm: String,
    /// Service the token is requested for
    pub service: Option<String>,
    /// Scope the registry asked for, informational
    pub scope: Option<String>,
}

impl AuthChallenge {
    /// Parse a header value, preferring a Bearer challenge over a Basic one
    /// when several are offered.
    pub fn parse(header: &str) -> Option<Self> {
        let challenges: Vec<AuthChallenge> = ChallengeParser::new(header)
            .filter_map(|parsed| match parsed {
                Ok(challenge_ref) => AuthChallenge::try_from(&challenge_ref).ok(),
                Err(e) => {
                    debug!(error = ?e, "Skipping unparsable challenge");
                    None
                }
            })
            .collect();
        challenges
            .iter()
            .find(|c| c.scheme == AuthScheme::Bearer)
            .or_else(|| challenges.first())
            .cloned()
    }

    /// First usable challenge across every `WWW-Authenticate` header
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(AuthChallenge::parse)
            .min_by_key(|c| match c.scheme {
                AuthScheme::Bearer => 0,
                AuthScheme::Basic => 1,
            })
    }
}

impl TryFrom<&ChallengeRef<'_>> for AuthChallenge {
    type Error = String;

    fn try_from(value: &ChallengeRef<'_>) -> std::result::Result<Self, Self::Error> {
        let scheme = UniCase::new(value.scheme);
        let scheme = if scheme == UniCase::new("Bearer") {
            AuthScheme::Bearer
        } else if scheme == UniCase::new("Basic") {
            AuthScheme::Basic
        } else {
            return Err(format!("unsupported challenge scheme {:?}", value.scheme));
        };

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (k, v) in &value.params {
            if k.eq_ignore_ascii_case("realm") {
                realm = Some(v.to_unescaped());
            } else if k.eq_ignore_ascii_case("service") {
                service = Some(v.to_unescaped());
            } else if k.eq_ignore_ascii_case("scope") {
                scope = Some(v.to_unescaped());
            }
        }

        let realm = match (scheme, realm) {
            (_, Some(realm)) => realm,
            (AuthScheme::Basic, None) => String::new(),
            (AuthScheme::Bearer, None) => return Err("missing required parameter realm".into()),
        };

        Ok(AuthChallenge {
            scheme,
            realm,
            service,
            scope,
        })
    }
}

/// Read-only scope of a repository, the only one this client requests.
pub fn pull_scope(remote_name: &str) -> String {
    format!("repository:{}:pull", remote_name)
}

/// A token granted by a token endpoint.
#[derive(Deserialize, Clone)]
#[serde(untagged)]
pub(crate) enum RegistryToken {
    Token { token: String },
    AccessToken { access_token: String },
}

impl RegistryToken {
    pub fn token(&self) -> &str {
        match self {
            RegistryToken::Token { token } => token,
            RegistryToken::AccessToken { access_token } => access_token,
        }
    }
}

impl fmt::Debug for RegistryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted = String::from("<redacted>");
        match self {
            RegistryToken::Token { .. } => {
                f.debug_struct("Token").field("token", &redacted).finish()
            }
            RegistryToken::AccessToken { .. } => f
                .debug_struct("AccessToken")
                .field("access_token", &redacted)
                .finish(),
        }
    }
}

/// Lifetime fields of a token response. Malformed values are ignored.
#[derive(Deserialize, Default, Debug)]
struct TokenLifetime {
    #[serde(default, deserialize_with = "lenient")]
    expires_in: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    issued_at: Option<String>,
}

/// Body of a token endpoint response
#[derive(Deserialize, Debug)]
struct TokenResponse {
    #[serde(flatten)]
    token: RegistryToken,
    #[serde(flatten)]
    lifetime: TokenLifetime,
}

fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

impl TokenLifetime {
    fn expiry(&self) -> Option<DateTime<Utc>> {
        let issued = self
            .issued_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let lifetime = self
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS);
        chrono::Duration::try_seconds(lifetime).and_then(|d| issued.checked_add_signed(d))
    }
}

/// Credentials produced by a successful negotiation
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    pub mode: AuthMode,
    pub authorization: HeaderValue,
    pub token_expiry: Option<DateTime<Utc>>,
}

/// Answer `challenge` with the configured credentials.
///
/// Returns `Ok(None)` when the challenge cannot be answered, i.e. a Basic
/// challenge with no credentials configured.
pub(crate) async fn negotiate(
    http: &reqwest::Client,
    challenge: &AuthChallenge,
    auth: &RegistryAuth,
    scope: &str,
    timeout: Option<Duration>,
) -> Result<Option<Negotiated>> {
    match challenge.scheme {
        AuthScheme::Basic => {
            let Some(value) = auth.basic_authorization() else {
                debug!("Basic challenge received but no credentials are configured");
                return Ok(None);
            };
            debug!("Answering Basic challenge");
            Ok(Some(Negotiated {
                mode: AuthMode::Basic,
                authorization: sensitive_header(&value, "basic credentials")?,
                token_expiry: None,
            }))
        }
        AuthScheme::Bearer => request_token(http, challenge, auth, scope, timeout)
            .await
            .map(Some),
    }
}

async fn request_token(
    http: &reqwest::Client,
    challenge: &AuthChallenge,
    auth: &RegistryAuth,
    scope: &str,
    timeout: Option<Duration>,
) -> Result<Negotiated> {
    let realm = challenge.realm.as_str();
    let mut query = vec![("scope", scope)];
    if let Some(service) = challenge.service.as_deref() {
        query.push(("service", service));
    }
    if let Some(account) = auth.username() {
        query.push(("account", account));
    }
    debug!(%realm, service = ?challenge.service, %scope, anonymous = auth.username().is_none(), "Requesting bearer token");

    let mut request = http.get(realm).query(&query).apply_authentication(auth);
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }
    let res = request.send().await?;
    let status = res.status();
    let url = res.url().to_string();
    let body = res.bytes().await?;

    if !status.is_success() {
        let message = String::from_utf8_lossy(&body).into_owned();
        debug!(%url, %status, "Token endpoint refused the exchange");
        return Err(RegistryClientError::AuthEndpoint {
            url,
            status,
            message,
        });
    }

    let malformed = |reason: String| RegistryClientError::MalformedAuthResponse {
        url: url.clone(),
        reason,
    };
    let TokenResponse { token, lifetime } =
        serde_json::from_slice(&body).map_err(|e| malformed(e.to_string()))?;
    if token.token().is_empty() {
        return Err(malformed("token is empty".to_string()));
    }
    let token_expiry = lifetime.expiry();
    debug!(?token, ?token_expiry, "Received bearer token");

    Ok(Negotiated {
        mode: AuthMode::Bearer,
        authorization: sensitive_header(&format!("Bearer {}", token.token()), "bearer token")
            .map_err(|_| malformed("token contains characters not allowed in a header".into()))?,
        token_expiry,
    })
}

fn sensitive_header(value: &str, what: &str) -> Result<HeaderValue> {
    let mut value = HeaderValue::from_str(value).map_err(|_| {
        RegistryClientError::MalformedAuthResponse {
            url: String::new(),
            reason: format!("{} cannot be sent as a header", what),
        }
    })?;
    value.set_sensitive(true);
    Ok(value)
}
