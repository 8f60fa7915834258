use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::AUTHORIZATION;
use http::{HeaderValue, StatusCode};
use reqwest::RequestBuilder;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::auth::{self, AuthChallenge, AuthMode, Negotiated};
use crate::client::Transport;
use crate::errors::{RegistryClientError, Result};
use crate::response::{RegistryResponse, ResponseChain};
use crate::secrets::RegistryAuth;

/// A snapshot of a client's authentication state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// How requests are currently authenticated
    pub mode: AuthMode,
    /// When the current bearer token lapses, as reported by the token
    /// endpoint. Informational only: tokens are replaced when the registry
    /// rejects them, not ahead of time.
    pub token_expiry: Option<DateTime<Utc>>,
    /// Number of successful negotiations so far
    pub negotiations: u64,
}

#[derive(Default)]
struct SessionState {
    mode: AuthMode,
    authorization: Option<HeaderValue>,
    token_expiry: Option<DateTime<Utc>>,
    // bumped on every stored negotiation
    generation: u64,
}

/// Per-client authentication state shared by every operation.
///
/// At most one negotiation runs at a time. A request that was rejected with
/// credentials of generation `n` only negotiates if the stored generation is
/// still `n`; otherwise another request already replaced them and the retry
/// uses the fresh ones.
pub(crate) struct Session {
    auth: RegistryAuth,
    scope: String,
    state: RwLock<SessionState>,
    negotiation: Mutex<()>,
}

impl Session {
    pub fn new(auth: RegistryAuth, scope: String) -> Self {
        Session {
            auth,
            scope,
            state: RwLock::new(SessionState::default()),
            negotiation: Mutex::new(()),
        }
    }

    pub async fn info(&self) -> SessionInfo {
        let state = self.state.read().await;
        SessionInfo {
            mode: state.mode,
            token_expiry: state.token_expiry,
            negotiations: state.generation,
        }
    }

    async fn snapshot(&self) -> (u64, Option<HeaderValue>) {
        let state = self.state.read().await;
        (state.generation, state.authorization.clone())
    }

    /// Send the request `build` produces, negotiating and retrying exactly
    /// once if the registry answers `401`.
    ///
    /// `build` is called again for the retry, so it must not consume state.
    /// Only the request `build` produces is authenticated; callers following
    /// redirects issue the further hops themselves without credentials.
    pub async fn send<F>(
        &self,
        transport: &Transport,
        timeout: Option<Duration>,
        build: F,
    ) -> Result<reqwest::Response>
    where
        F: Fn(&Transport) -> RequestBuilder,
    {
        let (generation, authorization) = self.snapshot().await;
        let res = authorize(build(transport), authorization, timeout)
            .send()
            .await?;
        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let Some(challenge) = AuthChallenge::from_headers(res.headers()) else {
            debug!(url = %res.url(), "401 without a usable challenge");
            return Err(unauthorized(res).await);
        };
        if !self
            .renegotiate(transport, generation, &challenge, timeout)
            .await?
        {
            return Err(unauthorized(res).await);
        }
        drop(res);

        let (_, authorization) = self.snapshot().await;
        let res = authorize(build(transport), authorization, timeout)
            .send()
            .await?;
        if res.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %res.url(), "Registry rejected freshly negotiated credentials");
            return Err(unauthorized(res).await);
        }
        Ok(res)
    }

    /// Returns whether usable credentials are now stored.
    async fn renegotiate(
        &self,
        transport: &Transport,
        rejected_generation: u64,
        challenge: &AuthChallenge,
        timeout: Option<Duration>,
    ) -> Result<bool> {
        let _guard = self.negotiation.lock().await;
        if self.state.read().await.generation != rejected_generation {
            debug!("Credentials were replaced by a concurrent request, reusing them");
            return Ok(true);
        }

        match auth::negotiate(
            &transport.following,
            challenge,
            &self.auth,
            &self.scope,
            timeout,
        )
        .await?
        {
            Some(Negotiated {
                mode,
                authorization,
                token_expiry,
            }) => {
                let mut state = self.state.write().await;
                state.mode = mode;
                state.authorization = Some(authorization);
                state.token_expiry = token_expiry;
                state.generation += 1;
                debug!(?mode, generation = state.generation, "Stored negotiated credentials");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn authorize(
    mut request: RequestBuilder,
    authorization: Option<HeaderValue>,
    timeout: Option<Duration>,
) -> RequestBuilder {
    if let Some(value) = authorization {
        request = request.header(AUTHORIZATION, value);
    }
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }
    request
}

async fn unauthorized(res: reqwest::Response) -> RegistryClientError {
    let chain = ResponseChain::new(RegistryResponse::from_reqwest(&res));
    let body = res.bytes().await.unwrap_or_default();
    RegistryClientError::from_status(chain, &body)
}
