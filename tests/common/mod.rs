// In-process registry used by the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    body::Body,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use docker_registry_client::{sha256_digest, Client, ClientConfig, ClientProtocol, RegistryAuth};
use tokio::{net::TcpListener, task::JoinHandle};

pub const SERVICE: &str = "mock-registry";
pub const SCOPE: &str = "repository:library/alpine:pull";
pub const DIGEST_HEADER: &str = "Docker-Content-Digest";
pub const API_VERSION_HEADER: &str = "Docker-Distribution-Api-Version";

pub static MANIFEST_V1: &[u8] = include_bytes!("../fixtures/manifest_v1.json");
pub static MANIFEST_V2: &[u8] = include_bytes!("../fixtures/manifest_v2.json");
pub static CONFIG: &[u8] = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;

lazy_static::lazy_static! {
    pub static ref LAYER: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    pub static ref LAYER_DIGEST: String = sha256_digest(&LAYER);
    pub static ref CONFIG_DIGEST: String = sha256_digest(CONFIG);
    pub static ref MANIFEST_V1_DIGEST: String = sha256_digest(MANIFEST_V1);
    pub static ref MANIFEST_V2_DIGEST: String = sha256_digest(MANIFEST_V2);
    pub static ref BROKEN_STORAGE_DIGEST: String = format!("sha256:{}", "b".repeat(64));
    pub static ref REDIRECT_LOOP_DIGEST: String = format!("sha256:{}", "c".repeat(64));
    pub static ref UNREACHABLE_STORAGE_DIGEST: String = format!("sha256:{}", "d".repeat(64));
    pub static ref ENDLESS_DIGEST: String = format!("sha256:{}", "e".repeat(64));
}

/// How the mock protects its API
#[derive(Clone, Debug)]
pub enum Protection {
    Open,
    Basic { username: String, password: String },
    /// Token exchange; the token endpoint requires these Basic credentials
    /// when set and hands out anonymous tokens otherwise
    Bearer { credentials: Option<(String, String)> },
}

struct Shared {
    protection: Protection,
    addr: SocketAddr,
    token_requests: AtomicUsize,
    issued: Mutex<Vec<String>>,
    reject_tokens: AtomicBool,
    malformed_tokens: AtomicBool,
    storage_saw_credentials: AtomicUsize,
    /// A port nothing listens on
    dead_port: u16,
    endless_body_dropped: Arc<AtomicBool>,
}

/// Sets its flag when the response body owning it goes away
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

const ENDLESS_CHUNK: usize = 64 * 1024;
const ENDLESS_CHUNKS: usize = 16 * 1024;

#[derive(Clone)]
pub struct MockRegistry {
    shared: Arc<Shared>,
}

impl MockRegistry {
    pub fn token_requests(&self) -> usize {
        self.shared.token_requests.load(Ordering::SeqCst)
    }

    /// Forget every issued token, as if they had all expired.
    pub fn revoke_tokens(&self) {
        self.shared.issued.lock().unwrap().clear();
    }

    /// Keep issuing tokens but refuse them on the API.
    pub fn reject_tokens(&self) {
        self.shared.reject_tokens.store(true, Ordering::SeqCst);
    }

    /// Answer token requests with a body lacking a token.
    pub fn malformed_tokens(&self) {
        self.shared.malformed_tokens.store(true, Ordering::SeqCst);
    }

    pub fn storage_saw_credentials(&self) -> usize {
        self.shared.storage_saw_credentials.load(Ordering::SeqCst)
    }

    /// Whether the server let go of the endless blob body
    pub fn endless_body_dropped(&self) -> bool {
        self.shared.endless_body_dropped.load(Ordering::SeqCst)
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), Response> {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let ok = match &self.shared.protection {
            Protection::Open => true,
            Protection::Basic { username, password } => {
                presented == Some(basic(username, password).as_str())
            }
            Protection::Bearer { .. } => match presented.and_then(|p| p.strip_prefix("Bearer ")) {
                Some(token) => {
                    !self.shared.reject_tokens.load(Ordering::SeqCst)
                        && self.shared.issued.lock().unwrap().iter().any(|t| t == token)
                }
                None => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(self.challenge())
        }
    }

    fn challenge(&self) -> Response {
        let challenge = match &self.shared.protection {
            Protection::Bearer { .. } => format!(
                r#"Bearer realm="http://{}/token",service="{}",scope="{}""#,
                self.shared.addr, SERVICE, SCOPE
            ),
            _ => r#"Basic realm="mock-registry""#.to_string(),
        };
        (
            StatusCode::UNAUTHORIZED,
            [
                ("www-authenticate", challenge),
                ("content-type", "application/json".to_string()),
            ],
            error_body("UNAUTHORIZED", "authentication required"),
        )
            .into_response()
    }
}

fn basic(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", username, password)))
}

fn error_body(code: &str, message: &str) -> String {
    serde_json::json!({"errors": [{"code": code, "message": message, "detail": null}]}).to_string()
}

fn not_found(code: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        [("content-type", "application/json")],
        error_body(code, "not known to this registry"),
    )
        .into_response()
}

async fn ping(State(registry): State<MockRegistry>, headers: HeaderMap) -> Response {
    if let Err(challenge) = registry.authorize(&headers) {
        return challenge;
    }
    (
        [
            (API_VERSION_HEADER, "registry/2.0"),
            ("content-type", "application/json"),
        ],
        "{}",
    )
        .into_response()
}

async fn token(
    State(registry): State<MockRegistry>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    registry.shared.token_requests.fetch_add(1, Ordering::SeqCst);
    // long enough for concurrent 401s to pile up behind one negotiation
    tokio::time::sleep(Duration::from_millis(50)).await;

    if query.get("scope").map(String::as_str) != Some(SCOPE)
        || query.get("service").map(String::as_str) != Some(SERVICE)
    {
        return (StatusCode::BAD_REQUEST, "unexpected scope or service").into_response();
    }
    if let Protection::Bearer {
        credentials: Some((username, password)),
    } = &registry.shared.protection
    {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if presented != Some(basic(username, password).as_str())
            || query.get("account") != Some(username)
        {
            return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
        }
    }
    if registry.shared.malformed_tokens.load(Ordering::SeqCst) {
        return Json(serde_json::json!({"details": "no token here"})).into_response();
    }

    let mut issued = registry.shared.issued.lock().unwrap();
    let token = format!("token-{}", registry.token_requests());
    issued.push(token.clone());
    Json(serde_json::json!({
        "token": token,
        "expires_in": 300,
        "issued_at": "2024-01-01T00:00:00Z",
    }))
    .into_response()
}

async fn tags(
    State(registry): State<MockRegistry>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if let Err(challenge) = registry.authorize(&headers) {
        return challenge;
    }
    let mut tags: Vec<&str> = vec!["3.19", "latest", "v1"];
    if let Some(last) = query.get("last") {
        tags.retain(|t| *t > last.as_str());
    }
    if let Some(n) = query.get("n").and_then(|n| n.parse::<usize>().ok()) {
        tags.truncate(n);
    }
    Json(serde_json::json!({"name": "library/alpine", "tags": tags})).into_response()
}

async fn manifest(
    State(registry): State<MockRegistry>,
    Path(reference): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(challenge) = registry.authorize(&headers) {
        return challenge;
    }
    let v2 = |digest: String| {
        (
            [
                (DIGEST_HEADER, digest),
                (
                    "content-type",
                    "application/vnd.docker.distribution.manifest.v2+json".to_string(),
                ),
            ],
            MANIFEST_V2,
        )
            .into_response()
    };
    match reference.as_str() {
        "latest" => v2(MANIFEST_V2_DIGEST.clone()),
        d if d == MANIFEST_V2_DIGEST.as_str() => v2(MANIFEST_V2_DIGEST.clone()),
        "slow" => {
            tokio::time::sleep(Duration::from_millis(300)).await;
            v2(MANIFEST_V2_DIGEST.clone())
        }
        "tampered" => v2(format!("sha256:{}", "0".repeat(64))),
        r if r == "v1" || r == MANIFEST_V1_DIGEST.as_str() => (
            [
                (DIGEST_HEADER, MANIFEST_V1_DIGEST.clone()),
                (
                    "content-type",
                    "application/vnd.docker.distribution.manifest.v1+prettyjws".to_string(),
                ),
            ],
            MANIFEST_V1,
        )
            .into_response(),
        _ => not_found("MANIFEST_UNKNOWN"),
    }
}

async fn blob(
    State(registry): State<MockRegistry>,
    Path(digest): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(challenge) = registry.authorize(&headers) {
        return challenge;
    }
    let redirect = |location: String| {
        (
            StatusCode::TEMPORARY_REDIRECT,
            [
                ("location", location),
                (DIGEST_HEADER, digest.clone()),
                (API_VERSION_HEADER, "registry/2.0".to_string()),
            ],
        )
            .into_response()
    };
    match digest.as_str() {
        d if d == LAYER_DIGEST.as_str() => redirect(format!("/storage/{}", digest)),
        d if d == BROKEN_STORAGE_DIGEST.as_str() => redirect("/storage/broken".to_string()),
        d if d == REDIRECT_LOOP_DIGEST.as_str() => {
            redirect(format!("/v2/library/alpine/blobs/{}", digest))
        }
        d if d == UNREACHABLE_STORAGE_DIGEST.as_str() => redirect(format!(
            "http://127.0.0.1:{}/storage/{}",
            registry.shared.dead_port, digest
        )),
        d if d == ENDLESS_DIGEST.as_str() => endless_body(&registry),
        d if d == CONFIG_DIGEST.as_str() => (
            [
                (DIGEST_HEADER, digest.clone()),
                ("content-type", "application/octet-stream".to_string()),
            ],
            CONFIG,
        )
            .into_response(),
        _ => not_found("BLOB_UNKNOWN"),
    }
}

/// A gigabyte of chunks, far more than any socket buffer holds, so the body is
/// only dropped early when the client goes away.
fn endless_body(registry: &MockRegistry) -> Response {
    let guard = DropFlag(registry.shared.endless_body_dropped.clone());
    let chunk = Bytes::from(vec![7u8; ENDLESS_CHUNK]);
    let chunks = futures_util::stream::unfold((guard, 0usize), move |(guard, sent)| {
        let chunk = chunk.clone();
        async move {
            (sent < ENDLESS_CHUNKS).then(|| (Ok::<_, std::io::Error>(chunk), (guard, sent + 1)))
        }
    });
    (
        [("content-type", "application/octet-stream")],
        Body::from_stream(chunks),
    )
        .into_response()
}

async fn tags_of_unknown_repository() -> Response {
    not_found("NAME_UNKNOWN")
}

async fn storage(
    State(registry): State<MockRegistry>,
    Path(object): Path<String>,
    headers: HeaderMap,
) -> Response {
    if headers.contains_key(header::AUTHORIZATION) {
        registry
            .shared
            .storage_saw_credentials
            .fetch_add(1, Ordering::SeqCst);
    }
    if object == LAYER_DIGEST.as_str() {
        (
            [
                ("content-type", "application/octet-stream".to_string()),
                ("content-length", LAYER.len().to_string()),
            ],
            LAYER.clone(),
        )
            .into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "storage backend unavailable").into_response()
    }
}

pub struct TestRegistry {
    handle: JoinHandle<()>,
    pub registry: MockRegistry,
    pub addr: SocketAddr,
}

impl Drop for TestRegistry {
    fn drop(&mut self) {
        self.handle.abort()
    }
}

impl TestRegistry {
    pub async fn start(protection: Protection) -> Self {
        init_tracing();
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dead_port = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .and_then(|l| l.local_addr())
            .unwrap()
            .port();

        let registry = MockRegistry {
            shared: Arc::new(Shared {
                protection,
                addr,
                token_requests: AtomicUsize::new(0),
                issued: Mutex::new(Vec::new()),
                reject_tokens: AtomicBool::new(false),
                malformed_tokens: AtomicBool::new(false),
                storage_saw_credentials: AtomicUsize::new(0),
                dead_port,
                endless_body_dropped: Arc::new(AtomicBool::new(false)),
            }),
        };
        let app = Router::new()
            .route("/v2/", get(ping))
            .route("/token", get(token))
            .route("/v2/library/alpine/tags/list", get(tags))
            .route("/v2/library/missing/tags/list", get(tags_of_unknown_repository))
            .route("/v2/library/alpine/manifests/{reference}", get(manifest))
            .route("/v2/library/alpine/blobs/{digest}", get(blob))
            .route("/storage/{object}", get(storage))
            .with_state(registry.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            handle,
            registry,
            addr,
        }
    }

    pub fn repo_name(&self) -> String {
        format!("{}/library/alpine", self.addr)
    }

    pub fn client(&self, auth: RegistryAuth) -> Client {
        self.client_with(ClientConfig {
            auth,
            ..Default::default()
        })
    }

    pub fn client_with(&self, config: ClientConfig) -> Client {
        self.client_for(&self.repo_name(), config)
    }

    pub fn client_for(&self, name: &str, config: ClientConfig) -> Client {
        Client::new(
            name,
            ClientConfig {
                protocol: ClientProtocol::Http,
                ..config
            },
        )
        .expect("mock repository name is valid")
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
