//! The batch ingress endpoint: `GET`/`POST /api/dhcp_assignments`,
//! authenticated by source-IP + HTTP Basic against the configured router
//! ACL, pushing validated lease events into the Batch Table.
//!
//! Both listeners are raw `hyper::server::conn::http1` services over
//! plain `tokio::net::TcpListener`/`tokio_rustls::TlsAcceptor` accept loops,
//! not `axum::serve`, so the redirect server can stay a bare `service_fn`
//! with no routing at all. The real endpoint's `axum::Router` is converted
//! to a `tower::Service` and driven through `hyper_util`'s
//! `TowerToHyperService` adapter so the validation pipeline gets axum's
//! extractor/rejection plumbing.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, error, info, warn};

use rb_common::config::BatchConfig;

use crate::acl::{self, MatchedRouter};
use crate::table::BatchTable;

pub const PATH: &str = "/api/dhcp_assignments";
const REMOTE_ID_MAX_LEN: usize = 246;

pub struct BatchEndpointState {
    pub config: BatchConfig,
    pub table: Arc<BatchTable>,
}

#[derive(Debug, Deserialize, Default)]
pub struct BatchRequestFields {
    #[serde(default)]
    pub leased_mac_address: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub expired: Option<String>,
    #[serde(default)]
    pub remote_id: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchRequestError {
    #[error("leased_mac_address is required")]
    MissingMac,
    #[error("unable to parse leased_mac_address")]
    InvalidMac,
    #[error("ip_address is required")]
    MissingIp,
    #[error("unable to parse ip_address")]
    InvalidIp,
    #[error("expired is required")]
    MissingExpired,
    #[error("expired must be the literal \"0\" or \"1\"")]
    InvalidExpired,
    #[error("remote_id exceeds {REMOTE_ID_MAX_LEN} bytes")]
    RemoteIdTooLong,
}

pub struct ValidatedAssignment {
    pub mac: String,
    pub ip: std::net::Ipv4Addr,
    pub expired: String,
    pub remote_id: Option<String>,
}

/// Step 6 of the pipeline: field presence/shape validation, independent of
/// GET vs POST transport.
pub fn validate_fields(fields: BatchRequestFields) -> Result<ValidatedAssignment, BatchRequestError> {
    let mac_raw = fields.leased_mac_address.filter(|s| !s.is_empty()).ok_or(BatchRequestError::MissingMac)?;
    let mac = canonicalize_mac(&mac_raw).ok_or(BatchRequestError::InvalidMac)?;

    let ip_raw = fields.ip_address.filter(|s| !s.is_empty()).ok_or(BatchRequestError::MissingIp)?;
    let ip: std::net::Ipv4Addr = ip_raw.parse().map_err(|_| BatchRequestError::InvalidIp)?;

    let expired = fields.expired.filter(|s| !s.is_empty()).ok_or(BatchRequestError::MissingExpired)?;
    if expired != "0" && expired != "1" {
        return Err(BatchRequestError::InvalidExpired);
    }

    let remote_id = fields.remote_id.filter(|s| !s.is_empty());
    if let Some(rid) = &remote_id {
        if rid.len() > REMOTE_ID_MAX_LEN {
            return Err(BatchRequestError::RemoteIdTooLong);
        }
    }

    Ok(ValidatedAssignment { mac, ip, expired, remote_id })
}

/// Parse and canonicalize a 48-bit MAC address (colon or hyphen separated)
/// to lower-case colon form.
fn canonicalize_mac(raw: &str) -> Option<String> {
    let sep = if raw.contains(':') { ':' } else if raw.contains('-') { '-' } else { return None };
    let parts: Vec<&str> = raw.split(sep).collect();
    if parts.len() != 6 {
        return None;
    }
    let mut octets = [0u8; 6];
    for (i, p) in parts.iter().enumerate() {
        if p.len() != 2 {
            return None;
        }
        octets[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(
        octets
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":"),
    )
}

pub fn router(state: Arc<BatchEndpointState>) -> Router {
    Router::new()
        .route(
            PATH,
            get(handle_get)
                .post(handle_post)
                .fallback(|| async { StatusCode::BAD_REQUEST }),
        )
        .fallback(|| async { StatusCode::BAD_REQUEST })
        .with_state(state)
}

async fn handle_get(
    State(state): State<Arc<BatchEndpointState>>,
    headers: HeaderMap,
    axum::extract::Extension(addr): axum::extract::Extension<SocketAddr>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let fields = BatchRequestFields {
        leased_mac_address: params.get("leased_mac_address").cloned(),
        ip_address: params.get("ip_address").cloned(),
        expired: params.get("expired").cloned(),
        remote_id: params.get("remote_id").cloned(),
    };
    process_request(&state, addr.ip(), &headers, "get", fields).await
}

async fn handle_post(
    State(state): State<Arc<BatchEndpointState>>,
    headers: HeaderMap,
    axum::extract::Extension(addr): axum::extract::Extension<SocketAddr>,
    body: axum::body::Bytes,
) -> Response {
    let fields: BatchRequestFields = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => serde_json::from_value(value).unwrap_or_default(),
        Err(e) => {
            endpoint_log("post", addr.ip(), &format!("unable to parse JSON body: {e}"));
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    process_request(&state, addr.ip(), &headers, "post", fields).await
}

async fn process_request(
    state: &BatchEndpointState,
    source_ip: IpAddr,
    headers: &HeaderMap,
    mode: &str,
    fields: BatchRequestFields,
) -> Response {
    let matched: MatchedRouter = match acl::match_router(&state.config.routers, source_ip) {
        Some(m) => m,
        None => {
            endpoint_log("auth", source_ip, "batch attempted from unauthorized router");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let auth_header = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !acl::verify_basic_auth(auth_header, &matched) {
        endpoint_log("auth", source_ip, "failure (credentials)");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    endpoint_log("auth", source_ip, "success");

    let assignment = match validate_fields(fields) {
        Ok(a) => a,
        Err(e) => {
            endpoint_log(mode, source_ip, &e.to_string());
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let table = state.table.clone();
    tokio::spawn(async move {
        table.upsert(assignment.mac, assignment.ip, assignment.expired, assignment.remote_id);
    });

    StatusCode::OK.into_response()
}

fn endpoint_log(category: &str, source_ip: IpAddr, message: &str) {
    match category {
        "auth" if message.starts_with("success") => debug!(category, %source_ip, message),
        "auth" => warn!(category, %source_ip, message),
        _ => debug!(category, %source_ip, message),
    }
}

/// Build the restricted TLS server config: TLS 1.2 minimum, P-256/X25519
/// curves, ECDHE-(ECDSA|RSA)-AES-GCM or ChaCha20-Poly1305 only, server
/// cipher preference enforced.
pub fn build_tls_config(cert_path: &str, key_path: &str) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    use rustls::crypto::ring as provider;

    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let crypto_provider = rustls::crypto::CryptoProvider {
        cipher_suites: vec![
            provider::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            provider::cipher_suite::TLS13_AES_256_GCM_SHA384,
            provider::cipher_suite::TLS13_AES_128_GCM_SHA256,
            provider::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            provider::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            provider::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            provider::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            provider::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            provider::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        kx_groups: vec![provider::kx_group::SECP256R1, provider::kx_group::X25519],
        ..provider::default_provider()
    };

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(crypto_provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.ignore_client_order = true; // server cipher preference enforced

    Ok(Arc::new(config))
}

fn load_certs(path: &str) -> anyhow::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {path}");
    }
    Ok(certs)
}

fn load_private_key(path: &str) -> anyhow::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| anyhow::anyhow!("no private key found in {path}"))
}

/// Run the batch endpoint server(s) until `shutdown` fires. With TLS
/// disabled this is a single plain HTTP listener; with TLS enabled a
/// second listener 301-redirects every request to the TLS port.
pub async fn run(
    state: Arc<BatchEndpointState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let bind_ip = state.config.server_ip.clone();
    let app = router(state.clone());

    if state.config.use_tls {
        let tls_config = build_tls_config(&state.config.tls_cert, &state.config.tls_key)?;
        let acceptor = TlsAcceptor::from(tls_config);
        let tls_addr: SocketAddr = format!("{}:{}", bind_ip, state.config.tls_port).parse()?;
        let http_addr: SocketAddr = format!("{}:{}", bind_ip, state.config.http_port).parse()?;

        let tls_port = state.config.tls_port;
        let redirect_shutdown = shutdown.resubscribe();
        tokio::spawn(run_redirect_server(http_addr, tls_port, redirect_shutdown));

        info!("batch endpoint: TLS listener on {}", tls_addr);
        let listener = TcpListener::bind(tls_addr).await?;
        serve_tls_loop(listener, acceptor, app, shutdown).await;
    } else {
        let http_addr: SocketAddr = format!("{}:{}", bind_ip, state.config.http_port).parse()?;
        warn!("batch endpoint: starting HTTP endpoint [TLS is highly recommended]");
        let listener = TcpListener::bind(http_addr).await?;
        serve_http_loop(listener, app, shutdown).await;
    }

    Ok(())
}

async fn serve_http_loop(listener: TcpListener, app: Router, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("batch endpoint: HTTP listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(c) => c,
                    Err(e) => { error!("batch endpoint: accept error: {}", e); continue; }
                };
                let app = app.clone();
                tokio::spawn(async move {
                    serve_one(stream, remote_addr, app, std::time::Duration::from_secs(5)).await;
                });
            }
        }
    }
}

async fn serve_tls_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("batch endpoint: TLS listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (tcp_stream, remote_addr) = match accepted {
                    Ok(c) => c,
                    Err(e) => { error!("batch endpoint: accept error: {}", e); continue; }
                };
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(tcp_stream).await {
                        Ok(s) => s,
                        Err(e) => { warn!("batch endpoint: TLS handshake failed from {}: {}", remote_addr, e); return; }
                    };
                    serve_one(tls_stream, remote_addr, app, std::time::Duration::from_secs(10)).await;
                });
            }
        }
    }
}

/// Connection-wide idle bound. hyper's http1 builder only exposes a
/// header-read timeout directly, so the write and steady-state idle
/// budgets are enforced as one outer watchdog around the whole connection
/// instead of per-syscall timers.
const IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(120);

async fn serve_one<S>(stream: S, remote_addr: SocketAddr, app: Router, read_timeout: std::time::Duration)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    // No `ConnectInfo` machinery here: the remote address is stamped into
    // the request's extensions by hand before converting the raw
    // `hyper::Request<Incoming>` into an axum `Request`.
    let service = service_fn(move |req: hyper::Request<Incoming>| {
        let mut app = app.clone();
        async move {
            let (mut parts, body) = req.into_parts();
            parts.extensions.insert(remote_addr);
            let req = axum::extract::Request::from_parts(parts, axum::body::Body::new(body));
            let response = tower::Service::call(&mut app, req).await.unwrap_or_else(|err: std::convert::Infallible| match err {});
            Ok::<_, std::convert::Infallible>(response)
        }
    });
    let hyper_service = TowerToHyperService::new(service);

    let conn = http1::Builder::new()
        .timer(hyper_util::rt::TokioTimer::new())
        .header_read_timeout(read_timeout)
        .serve_connection(io, hyper_service);

    match tokio::time::timeout(IDLE_TIMEOUT, conn).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let msg = e.to_string();
            if !msg.contains("connection closed") && !msg.contains("not connected") {
                debug!("batch endpoint: connection error from {}: {}", remote_addr, e);
            }
        }
        Err(_) => debug!("batch endpoint: connection from {} idle past {:?}, dropping", remote_addr, IDLE_TIMEOUT),
    }
}

async fn run_redirect_server(http_addr: SocketAddr, tls_port: u16, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
    let listener = match TcpListener::bind(http_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("batch endpoint: failed to bind HTTP redirect listener on {}: {}", http_addr, e);
            return;
        }
    };
    info!("batch endpoint: HTTP->HTTPS redirect listening on {}", http_addr);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("batch endpoint: redirect listener shutting down");
                return;
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(c) => c,
                    Err(e) => { error!("batch endpoint: redirect accept error: {}", e); continue; }
                };
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: hyper::Request<Incoming>| async move {
                        let host = req
                            .headers()
                            .get("host")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("localhost")
                            .split(':')
                            .next()
                            .unwrap_or("localhost");
                        let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
                        let location = format!("https://{host}:{tls_port}{path}");
                        Ok::<_, std::convert::Infallible>(
                            hyper::Response::builder()
                                .status(301)
                                .header("Location", location)
                                .header("Connection", "close")
                                .body(axum::body::Body::empty())
                                .unwrap(),
                        )
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        let msg = e.to_string();
                        if !msg.contains("connection closed") && !msg.contains("not connected") {
                            debug!("batch endpoint: redirect connection error: {}", e);
                        }
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rb_common::config::BatchRouterAuth;
    use tower::ServiceExt;

    fn test_state() -> Arc<BatchEndpointState> {
        Arc::new(BatchEndpointState {
            config: BatchConfig {
                routers: vec![BatchRouterAuth {
                    username: "router1".to_string(),
                    password: "a-sixteen-char-pw!!".to_string(),
                    router_ip: "10.0.0.1".to_string(),
                }],
                ..Default::default()
            },
            table: Arc::new(BatchTable::new()),
        })
    }

    fn with_remote(mut req: axum::http::Request<axum::body::Body>, addr: &str) -> axum::http::Request<axum::body::Body> {
        req.extensions_mut().insert(addr.parse::<SocketAddr>().unwrap());
        req
    }

    fn basic_auth_header(user: &str, pass: &str) -> String {
        use base64::Engine;
        format!("Basic {}", base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}")))
    }

    #[tokio::test]
    async fn test_get_from_unauthorized_router_is_401() {
        let state = test_state();
        let app = router(state);

        let req = with_remote(
            axum::http::Request::builder()
                .method("GET")
                .uri(format!("{PATH}?leased_mac_address=aa:bb:cc:dd:ee:ff&ip_address=10.0.0.5&expired=0"))
                .body(axum::body::Body::empty())
                .unwrap(),
            "10.9.9.9:5000",
        );

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unrecognized_method_on_path_is_400() {
        let state = test_state();
        let app = router(state);

        let req = with_remote(
            axum::http::Request::builder()
                .method("PUT")
                .uri(PATH)
                .body(axum::body::Body::empty())
                .unwrap(),
            "10.0.0.1:4000",
        );

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_post_oversize_remote_id_is_400_and_table_unchanged() {
        let state = test_state();
        let table = state.table.clone();
        let app = router(state);

        let body = serde_json::json!({
            "leased_mac_address": "aa:bb:cc:dd:ee:ff",
            "ip_address": "10.0.0.5",
            "expired": "1",
            "remote_id": "x".repeat(247),
        });

        let req = with_remote(
            axum::http::Request::builder()
                .method("POST")
                .uri(PATH)
                .header("content-type", "application/json")
                .header("authorization", basic_auth_header("router1", "a-sixteen-char-pw!!"))
                .body(axum::body::Body::from(body.to_string()))
                .unwrap(),
            "10.0.0.1:4000",
        );

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // give the detached upsert task a chance to run, if it were spawned
        tokio::task::yield_now().await;
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_post_valid_assignment_is_200_and_populates_table() {
        let state = test_state();
        let table = state.table.clone();
        let app = router(state);

        let body = serde_json::json!({
            "leased_mac_address": "AA:BB:CC:DD:EE:01",
            "ip_address": "10.0.0.9",
            "expired": "1",
            "remote_id": "",
        });

        let req = with_remote(
            axum::http::Request::builder()
                .method("POST")
                .uri(PATH)
                .header("content-type", "application/json")
                .header("authorization", basic_auth_header("router1", "a-sixteen-char-pw!!"))
                .body(axum::body::Body::from(body.to_string()))
                .unwrap(),
            "10.0.0.1:4000",
        );

        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // the upsert is spawned asynchronously; poll briefly for it to land.
        for _ in 0..50 {
            if !table.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].mac, "aa:bb:cc:dd:ee:01");
        assert_eq!(drained[0].expired, "1");
    }

    #[test]
    fn test_canonicalize_mac_colon_form() {
        assert_eq!(canonicalize_mac("AA:BB:CC:DD:EE:FF"), Some("aa:bb:cc:dd:ee:ff".to_string()));
    }

    #[test]
    fn test_canonicalize_mac_hyphen_form() {
        assert_eq!(canonicalize_mac("aa-bb-cc-dd-ee-ff"), Some("aa:bb:cc:dd:ee:ff".to_string()));
    }

    #[test]
    fn test_canonicalize_mac_rejects_wrong_group_count() {
        assert_eq!(canonicalize_mac("aa:bb:cc"), None);
    }

    #[test]
    fn test_validate_fields_happy_path() {
        let fields = BatchRequestFields {
            leased_mac_address: Some("AA:BB:CC:DD:EE:FF".to_string()),
            ip_address: Some("10.0.0.5".to_string()),
            expired: Some("0".to_string()),
            remote_id: Some("switch-1".to_string()),
        };
        let result = validate_fields(fields).unwrap();
        assert_eq!(result.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(result.ip, std::net::Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn test_validate_fields_missing_mac() {
        let fields = BatchRequestFields {
            ip_address: Some("10.0.0.5".to_string()),
            expired: Some("0".to_string()),
            ..Default::default()
        };
        assert_eq!(validate_fields(fields), Err(BatchRequestError::MissingMac));
    }

    #[test]
    fn test_validate_fields_invalid_expired() {
        let fields = BatchRequestFields {
            leased_mac_address: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ip_address: Some("10.0.0.5".to_string()),
            expired: Some("maybe".to_string()),
            ..Default::default()
        };
        assert_eq!(validate_fields(fields), Err(BatchRequestError::InvalidExpired));
    }

    #[test]
    fn test_validate_fields_remote_id_too_long() {
        let fields = BatchRequestFields {
            leased_mac_address: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ip_address: Some("10.0.0.5".to_string()),
            expired: Some("1".to_string()),
            remote_id: Some("x".repeat(247)),
        };
        assert_eq!(validate_fields(fields), Err(BatchRequestError::RemoteIdTooLong));
    }

    #[test]
    fn test_validate_fields_remote_id_at_boundary_ok() {
        let fields = BatchRequestFields {
            leased_mac_address: Some("aa:bb:cc:dd:ee:ff".to_string()),
            ip_address: Some("10.0.0.5".to_string()),
            expired: Some("1".to_string()),
            remote_id: Some("x".repeat(246)),
        };
        assert!(validate_fields(fields).is_ok());
    }
}
