//! HTTP wiring for the downstream transports.
//!
//! Every namespace known at bind time gets two mounts:
//!
//! - `/{endpoint}/mcp` - Streamable HTTP
//! - `/{endpoint}/sse` + `/{endpoint}/message` - SSE
//!
//! plus `/health` and `/status` for diagnostics.
//!
//! Transport admission is token-scoped per namespace: the control plane may
//! hand each endpoint its own bearer token, with an optional gateway-wide
//! token accepted everywhere. Token comparison is constant-time. Who may do
//! what *inside* a namespace remains the control plane's concern; this layer
//! only decides whether a request reaches the mount at all.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use metamcp_core::SessionTransport;

use crate::context::GatewayContext;
use crate::service::NamespaceService;

/// Streamable HTTP clients carry their session in this header; browsers must
/// be allowed to send and read it.
const MCP_SESSION_HEADER: HeaderName = HeaderName::from_static("mcp-session-id");

/// Transport security for the gateway.
///
/// `Debug` is implemented by hand so tokens never reach the logs.
#[derive(Clone, Default)]
pub struct HttpSecurityConfig {
    /// Bearer token accepted on every endpoint. `None` leaves endpoints
    /// without their own token open.
    pub gateway_token: Option<String>,
    /// Per-namespace-endpoint bearer tokens, keyed by endpoint name. An
    /// endpoint listed here admits only its own token or the gateway token.
    pub endpoint_tokens: HashMap<String, String>,
    /// TLS certificate path (requires `tls_key`).
    pub tls_cert: Option<PathBuf>,
    /// TLS private key path (requires `tls_cert`).
    pub tls_key: Option<PathBuf>,
    /// Allowed CORS origins (empty = no CORS, `*` = any).
    pub cors_origins: Vec<String>,
}

impl std::fmt::Debug for HttpSecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSecurityConfig")
            .field("gateway_token", &self.gateway_token.as_ref().map(|_| "<redacted>"))
            .field(
                "endpoint_tokens",
                &self.endpoint_tokens.keys().collect::<Vec<_>>(),
            )
            .field("tls_cert", &self.tls_cert)
            .field("tls_key", &self.tls_key)
            .field("cors_origins", &self.cors_origins)
            .finish()
    }
}

impl HttpSecurityConfig {
    /// Certificate and key, when both halves are configured.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        match (&self.tls_cert, &self.tls_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

fn token_eq(provided: &str, expected: &str) -> bool {
    let provided = provided.as_bytes();
    let expected = expected.as_bytes();
    // Length leaks are avoided the same way as content leaks.
    provided.len() == expected.len() && provided.ct_eq(expected).into()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Admission decisions for namespace endpoints.
///
/// Built once from [`HttpSecurityConfig`]; the middleware consults it per
/// request. Kept free of axum types so the scoping rules are testable on
/// their own.
pub struct EndpointAuth {
    gateway_token: Option<String>,
    endpoint_tokens: HashMap<String, String>,
}

impl EndpointAuth {
    pub fn from_config(config: &HttpSecurityConfig) -> Self {
        Self {
            gateway_token: config.gateway_token.clone(),
            endpoint_tokens: config.endpoint_tokens.clone(),
        }
    }

    /// Whether any token is configured at all.
    pub fn is_enforcing(&self) -> bool {
        self.gateway_token.is_some() || !self.endpoint_tokens.is_empty()
    }

    /// Endpoint segment of a request path: `/dev/mcp` -> `dev`.
    fn endpoint_of(path: &str) -> Option<&str> {
        path.trim_start_matches('/')
            .split('/')
            .next()
            .filter(|segment| !segment.is_empty())
    }

    /// Decide admission for one request. `/health` is always open so probes
    /// work without credentials.
    pub fn admit(&self, path: &str, bearer: Option<&str>) -> std::result::Result<(), &'static str> {
        if path == "/health" {
            return Ok(());
        }
        let scoped = Self::endpoint_of(path).and_then(|e| self.endpoint_tokens.get(e));
        let Some(expected) = scoped.or(self.gateway_token.as_ref()) else {
            return Ok(());
        };
        let Some(provided) = bearer else {
            return Err("missing bearer token");
        };
        if token_eq(provided, expected) {
            return Ok(());
        }
        // The gateway-wide token opens endpoint-scoped mounts too.
        if scoped.is_some() {
            if let Some(gateway) = &self.gateway_token {
                if token_eq(provided, gateway) {
                    return Ok(());
                }
            }
        }
        Err("token does not match this endpoint")
    }
}

async fn endpoint_auth_middleware(
    auth: Arc<EndpointAuth>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    match auth.admit(req.uri().path(), bearer_token(req.headers())) {
        Ok(()) => next.run(req).await,
        Err(reason) => {
            tracing::debug!(
                target: "metamcp::http",
                path = req.uri().path(),
                reason,
                "request rejected"
            );
            // Generic body; the reason stays in the logs.
            (StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response()
        }
    }
}

/// CORS stance derived from the configured origins.
enum CorsPolicy {
    Disabled,
    AllowAny,
    Origins(Vec<HeaderValue>),
}

impl CorsPolicy {
    fn from_origins(origins: &[String]) -> Self {
        if origins.is_empty() {
            return CorsPolicy::Disabled;
        }
        if origins.iter().any(|o| o == "*") {
            return CorsPolicy::AllowAny;
        }
        let valid: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(
                        target: "metamcp::http",
                        origin,
                        error = %err,
                        "unparseable CORS origin ignored"
                    );
                    None
                }
            })
            .collect();
        if valid.is_empty() {
            tracing::warn!(
                target: "metamcp::http",
                "no CORS origin survived parsing, CORS disabled"
            );
            return CorsPolicy::Disabled;
        }
        CorsPolicy::Origins(valid)
    }

    /// Browser clients drive the MCP mounts with GET (SSE stream), POST
    /// (messages), and DELETE (Streamable HTTP session teardown), and must be
    /// able to send and read the MCP session header.
    fn into_layer(self) -> CorsLayer {
        let mcp_layer = |layer: CorsLayer| {
            layer
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, MCP_SESSION_HEADER])
                .expose_headers([MCP_SESSION_HEADER])
        };
        match self {
            CorsPolicy::Disabled => CorsLayer::new(),
            CorsPolicy::AllowAny => mcp_layer(CorsLayer::new().allow_origin(Any)),
            CorsPolicy::Origins(origins) => mcp_layer(CorsLayer::new().allow_origin(origins)),
        }
    }
}

/// Build the gateway router: one Streamable HTTP and one SSE mount per
/// namespace known to the repository right now.
///
/// The spawned SSE services hang off `shutdown`; cancelling it tears them
/// down.
pub async fn build_gateway_router(
    ctx: Arc<GatewayContext>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<axum::Router> {
    let namespaces = ctx
        .repo
        .list_namespaces()
        .await
        .map_err(|e| anyhow::anyhow!("list namespaces: {e}"))?;

    let mut app = axum::Router::new();
    for namespace in namespaces {
        let endpoint = namespace.name.clone();
        let namespace_uuid = namespace.uuid;

        // Streamable HTTP mount.
        let http_ctx = ctx.clone();
        let http_endpoint = endpoint.clone();
        let http_service = StreamableHttpService::new(
            move || -> std::result::Result<NamespaceService, std::io::Error> {
                Ok(NamespaceService::new(
                    http_ctx.clone(),
                    namespace_uuid,
                    &http_endpoint,
                    SessionTransport::StreamableHttp,
                ))
            },
            Arc::new(LocalSessionManager::default()),
            StreamableHttpServerConfig::default(),
        );
        app = app.nest_service(&format!("/{endpoint}/mcp"), http_service);

        // SSE mount.
        let sse_config = SseServerConfig {
            bind: addr,
            sse_path: format!("/{endpoint}/sse"),
            post_path: format!("/{endpoint}/message"),
            ct: shutdown.child_token(),
            sse_keep_alive: None,
        };
        let (sse_server, sse_router) = SseServer::new(sse_config);
        let sse_ctx = ctx.clone();
        let sse_endpoint = endpoint.clone();
        sse_server.with_service(move || {
            NamespaceService::new(
                sse_ctx.clone(),
                namespace_uuid,
                &sse_endpoint,
                SessionTransport::Sse,
            )
        });
        app = app.merge(sse_router);

        tracing::info!(
            target: "metamcp::http",
            endpoint = %endpoint,
            "namespace endpoint mounted"
        );
    }

    let status_ctx = ctx.clone();
    app = app
        .route("/health", axum::routing::get(|| async { "ok" }))
        .route(
            "/status",
            axum::routing::get(move || {
                let ctx = status_ctx.clone();
                async move { axum::Json(ctx.status()) }
            }),
        );

    Ok(app)
}

/// Wrap the router with the CORS and admission layers the config asks for.
fn secure_router(app: axum::Router, security: &HttpSecurityConfig) -> axum::Router {
    let auth = EndpointAuth::from_config(security);
    if auth.is_enforcing() && security.cors_origins.iter().any(|o| o == "*") {
        tracing::warn!(
            target: "metamcp::http",
            "wildcard CORS combined with bearer auth exposes tokens to any site; \
             prefer explicit origins"
        );
    }

    let app = app.layer(CorsPolicy::from_origins(&security.cors_origins).into_layer());
    if !auth.is_enforcing() {
        return app;
    }
    let auth = Arc::new(auth);
    app.layer(axum::middleware::from_fn(move |req, next| {
        let auth = auth.clone();
        endpoint_auth_middleware(auth, req, next)
    }))
}

/// Starts the gateway over HTTP with security configuration.
pub async fn serve_gateway(
    ctx: Arc<GatewayContext>,
    bind_addr: &str,
    security: HttpSecurityConfig,
) -> Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid bind address: {bind_addr}"))?;

    let shutdown = CancellationToken::new();
    let app = build_gateway_router(ctx, addr, shutdown.clone()).await?;
    let app = secure_router(app, &security);

    tracing::info!(
        target: "metamcp::http",
        bind = %addr,
        tls = security.tls_paths().is_some(),
        gateway_token = security.gateway_token.is_some(),
        endpoint_tokens = security.endpoint_tokens.len(),
        "MetaMCP gateway listening"
    );

    let result = match security.tls_paths() {
        Some((cert_path, key_path)) => {
            let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
                cert_path, key_path,
            )
            .await
            .with_context(|| {
                format!(
                    "failed to load TLS config from cert={} key={}",
                    cert_path.display(),
                    key_path.display()
                )
            })?;
            axum_server::bind_rustls(addr, tls_config)
                .serve(app.into_make_service())
                .await
                .context("HTTPS server error")
        }
        None => axum_server::bind(addr)
            .serve(app.into_make_service())
            .await
            .context("HTTP server error"),
    };
    shutdown.cancel();
    result
}
