//! End-to-end tests: a real gate in front of a real (in-process) upstream.
//!
//! The upstream is plain HTTP on an ephemeral port; the gate's connector
//! is `https_or_http`, so pointing `upstream_scheme` at "http" exercises
//! the full forwarding path without a TLS fixture.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http::{Method, StatusCode, header};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;

use convgate::config::{ConfigHandle, GateConfig};
use convgate::intercept::{INJECT_SNIPPET, REDACTED_NAME};
use convgate::proxy_service::GateService;
use convgate::store::ConversationStore;

// ─────────────────────────────────────────────────────────────────────────────
// Test Harness
// ─────────────────────────────────────────────────────────────────────────────

const PASSWORD: &str = "correct-horse";
const SECRET: &str = "test-secret";
const SESSION_KEY: &str = "sk-real-123";
const OWNER_EMAIL: &str = "owner@example.com";

#[derive(Clone)]
struct UpstreamState {
    asset_hits: Arc<AtomicUsize>,
}

fn full(body: &'static str) -> Full<Bytes> {
    Full::new(Bytes::from_static(body.as_bytes()))
}

async fn upstream_handler(
    req: Request<Incoming>,
    state: UpstreamState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let resp = match (req.method().clone(), path.as_str()) {
        (Method::GET, "/build/app.js") => {
            state.asset_hits.fetch_add(1, Ordering::SeqCst);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/javascript")
                .header("x-upstream", "yes")
                .body(full("console.log('v1');"))
                .unwrap()
        }
        (Method::POST, "/api/organizations/org1/chat_conversations") => Response::builder()
            .status(StatusCode::CREATED)
            .header(header::CONTENT_TYPE, "application/json")
            .body(full(r#"{"uuid":"fresh-conv","name":"New chat"}"#))
            .unwrap(),
        (Method::GET, "/api/organizations/org1/chat_conversations") => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(full(
                r#"[{"uuid":"a","name":"mine"},{"uuid":"b","name":"theirs"}]"#,
            ))
            .unwrap(),
        (Method::GET, "/page") => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
            .body(full(
                "<html><head><title>Chat</title></head>\
                 <body>Signed in as owner@example.com</body></html>",
            ))
            .unwrap(),
        (Method::GET, "/login_token") => {
            // Echo the query so the test can observe placeholder rewriting.
            let body = format!("query={query}");
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain")
                .body(Full::new(Bytes::from(body)))
                .unwrap()
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(full("upstream-not-found"))
            .unwrap(),
    };

    Ok(resp)
}

async fn spawn_upstream(state: UpstreamState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = state.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req| upstream_handler(req, state.clone()));
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });

    addr
}

async fn spawn_gate(service: GateService) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let service = service.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let svc = service_fn(move |req| {
                    let service = service.clone();
                    async move {
                        let result: Result<_, Infallible> = match service.handle_request(req).await
                        {
                            Ok(resp) => Ok(resp),
                            Err(e) => Ok(e.to_response().map(|body| {
                                body.map_err(|never: Infallible| match never {}).boxed()
                            })),
                        };
                        result
                    }
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, svc)
                    .await;
            });
        }
    });

    addr
}

struct TestGate {
    addr: SocketAddr,
    service: GateService,
    store: ConversationStore,
    asset_hits: Arc<AtomicUsize>,
    client: Client<hyper_util::client::legacy::connect::HttpConnector, Full<Bytes>>,
}

impl TestGate {
    async fn start() -> Self {
        let asset_hits = Arc::new(AtomicUsize::new(0));
        let upstream_addr = spawn_upstream(UpstreamState {
            asset_hits: Arc::clone(&asset_hits),
        })
        .await;

        let config = GateConfig {
            upstream_host: upstream_addr.to_string(),
            upstream_scheme: "http".to_string(),
            password: PASSWORD.to_string(),
            signing_secret: SECRET.to_string(),
            session_key: SESSION_KEY.to_string(),
            redact_email: OWNER_EMAIL.to_string(),
            ..GateConfig::default()
        };

        let store = ConversationStore::open_in_memory().unwrap();
        let service = GateService::new(ConfigHandle::new(config), store.clone()).unwrap();
        let addr = spawn_gate(service.clone()).await;

        let client = Client::builder(TokioExecutor::new()).build_http();

        Self {
            addr,
            service,
            store,
            asset_hits,
            client,
        }
    }

    async fn get(&self, path: &str, cookie: Option<&str>) -> (StatusCode, String) {
        self.request(Method::GET, path, cookie).await.1
    }

    /// Issue a request; returns the raw response alongside (status, body).
    async fn request(
        &self,
        method: Method,
        path: &str,
        cookie: Option<&str>,
    ) -> (Response<()>, (StatusCode, String)) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{}", self.addr, path));
        if let Some(cookie) = cookie {
            builder = builder.header(header::COOKIE, cookie);
        }
        let req = builder.body(Full::new(Bytes::new())).unwrap();

        let resp = self.client.request(req).await.unwrap();
        let (parts, body) = resp.into_parts();
        let status = parts.status;
        let bytes = body.collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&bytes).into_owned();
        (
            Response::from_parts(parts, ()),
            (status, text),
        )
    }

    /// Log in and return a cookie header plus the issued user key.
    async fn login(&self) -> (String, String) {
        let (resp, (status, _)) = self
            .request(
                Method::GET,
                &format!("/login?password={PASSWORD}"),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let cookies: Vec<String> = resp
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| {
                let raw = v.to_str().unwrap();
                raw.split(';').next().unwrap().to_string()
            })
            .collect();
        assert_eq!(cookies.len(), 2, "login must set both credential cookies");

        let user_key = cookies
            .iter()
            .find_map(|c| c.strip_prefix("user-key="))
            .unwrap()
            .to_string();

        (cookies.join("; "), user_key)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_login_rejects_wrong_password() {
    let gate = TestGate::start().await;
    let (status, body) = gate.get("/login?password=wrong", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, "Invalid password");
}

#[tokio::test]
async fn test_decoy_uniformity_for_unauthenticated_probes() {
    let gate = TestGate::start().await;

    let (status_real, body_real) = gate
        .get("/api/organizations/org1/chat_conversations", None)
        .await;
    let (status_missing, body_missing) = gate.get("/definitely-not-a-route", None).await;

    assert_eq!(status_real, StatusCode::NOT_FOUND);
    assert_eq!(status_missing, StatusCode::NOT_FOUND);
    assert_eq!(
        body_real, body_missing,
        "protected and nonexistent paths must be indistinguishable"
    );

    // A garbage cookie pair is just as invisible.
    let (status_forged, body_forged) = gate
        .get(
            "/api/organizations/org1/chat_conversations",
            Some("user-key=aaaa; signature=bbbb"),
        )
        .await;
    assert_eq!(status_forged, StatusCode::NOT_FOUND);
    assert_eq!(body_forged, body_real);
}

#[tokio::test]
async fn test_end_to_end_listing_redaction() {
    let gate = TestGate::start().await;
    let (cookie, user_key) = gate.login().await;

    // The caller owns "a"; "b" belongs to someone else.
    gate.store.bind("a", &user_key).await.unwrap();
    gate.store.bind("b", "someone-else").await.unwrap();

    let (status, body) = gate
        .get("/api/organizations/org1/chat_conversations", Some(&cookie))
        .await;
    assert_eq!(status, StatusCode::OK);

    let items: Vec<serde_json::Value> = serde_json::from_str(&body).unwrap();
    assert_eq!(items[0]["uuid"], "a");
    assert_eq!(items[0]["name"], "mine");
    assert_eq!(items[1]["uuid"], "b");
    assert_eq!(items[1]["name"], REDACTED_NAME);
}

#[tokio::test]
async fn test_creation_binding_and_ownership_exclusivity() {
    let gate = TestGate::start().await;
    let (cookie_a, user_key_a) = gate.login().await;
    let (cookie_b, _) = gate.login().await;

    // Identity A creates a conversation through the gate.
    let (_, (status, body)) = gate
        .request(
            Method::POST,
            "/api/organizations/org1/chat_conversations",
            Some(&cookie_a),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    // Body passes through unchanged.
    assert!(body.contains("fresh-conv"));

    // The binding landed in the store.
    let binding = gate.store.owner_of("fresh-conv").await.unwrap().unwrap();
    assert_eq!(binding.user_key, user_key_a);

    // A can reach the conversation (upstream answers; not a gate 403).
    let (status_a, body_a) = gate
        .get(
            "/api/organizations/org1/chat_conversations/fresh-conv",
            Some(&cookie_a),
        )
        .await;
    assert_eq!(status_a, StatusCode::NOT_FOUND); // mock upstream has no such route
    assert_eq!(body_a, "upstream-not-found");

    // B is stopped at the gate.
    let (status_b, body_b) = gate
        .get(
            "/api/organizations/org1/chat_conversations/fresh-conv",
            Some(&cookie_b),
        )
        .await;
    assert_eq!(status_b, StatusCode::FORBIDDEN);
    assert_eq!(body_b, "Access denied");
}

#[tokio::test]
async fn test_cache_determinism_single_upstream_fetch() {
    let gate = TestGate::start().await;
    let (cookie, _) = gate.login().await;

    let (_, (status_first, body_first)) = gate
        .request(Method::GET, "/build/app.js", Some(&cookie))
        .await;
    let (resp_second, (status_second, body_second)) = gate
        .request(Method::GET, "/build/app.js", Some(&cookie))
        .await;

    assert_eq!(status_first, StatusCode::OK);
    assert_eq!(status_second, StatusCode::OK);
    assert_eq!(body_first, body_second);
    // Headers replay from the cache too.
    assert_eq!(resp_second.headers().get("x-upstream").unwrap(), "yes");
    // Exactly one upstream round trip for both requests, and exactly one
    // cache entry behind them.
    assert_eq!(gate.asset_hits.load(Ordering::SeqCst), 1);
    assert_eq!(gate.service.cache().len(), 1);
}

#[tokio::test]
async fn test_count_endpoints_short_circuit() {
    let gate = TestGate::start().await;
    let (cookie, _) = gate.login().await;

    for path in [
        "/api/organizations/org1/chat_conversations/count",
        "/api/organizations/org1/chat_conversations/count_all",
    ] {
        let (status, body) = gate.get(path, Some(&cookie)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "0");
    }
}

#[tokio::test]
async fn test_html_sanitization() {
    let gate = TestGate::start().await;
    let (cookie, _) = gate.login().await;

    let (status, body) = gate.get("/page", Some(&cookie)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body.contains(OWNER_EMAIL), "sensitive string must be scrubbed");
    assert!(body.contains(INJECT_SNIPPET), "styling script must be injected");
}

#[tokio::test]
async fn test_session_key_placeholder_rewrite() {
    let gate = TestGate::start().await;
    let (cookie, _) = gate.login().await;

    let (status, body) = gate
        .get(
            "/login_token?session_key=CONVGATE_SESSION_KEY",
            Some(&cookie),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, format!("query=session_key={SESSION_KEY}"));
}

#[tokio::test]
async fn test_pass_through_preserves_upstream_status() {
    let gate = TestGate::start().await;
    let (cookie, _) = gate.login().await;

    let (status, body) = gate.get("/whatever-else", Some(&cookie)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "upstream-not-found");
}
