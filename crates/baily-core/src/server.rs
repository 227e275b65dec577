//! Dev server assembly: the per-server context, the fixed middleware
//! chain, and the boot lifecycle (`config_resolved` → `configure_server`
//! → `listen`, reversed on shutdown).
//!
//! Middleware order is fixed: base-path stripping, dep-cache static
//! files, public assets, the transform handler, the HTML rewriter, and
//! the SPA fallback.

use crate::client::client_runtime;
use crate::config::ResolvedConfig;
use crate::error::{Error, Result};
use crate::graph::ModuleGraph;
use crate::hmr::{CssLinks, HmrEngine};
use crate::optimizer::{DepBundler, DepOptimizer};
use crate::paths::{clean_url, fs_url_to_path, strip_base, CLIENT_PATH};
use crate::plugin::{Plugin, PluginContainer, ServerMiddleware, ServerSetup};
use crate::transform::{is_module_request, TransformPipeline};
use crate::watch::{start_watcher, WatcherHandle};
use crate::ws::HmrChannel;
use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use baily_proto::HMR_SUBPROTOCOL;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Everything one server instance owns. Created at boot, dropped at
/// close; nothing here is process-global.
pub struct ServerContext {
    pub config: ResolvedConfig,
    pub graph: Arc<ModuleGraph>,
    pub container: Arc<PluginContainer>,
    pub optimizer: Arc<DepOptimizer>,
    pub pipeline: Arc<TransformPipeline>,
    pub channel: Arc<HmrChannel>,
    pub css_links: Arc<CssLinks>,
    middlewares: Vec<ServerMiddleware>,
}

impl ServerContext {
    /// Process an HTML document the way the HTML middleware does: record
    /// stylesheet links, inject the client script, run the plugin hooks.
    #[must_use]
    pub fn render_html(&self, html: &str) -> String {
        process_html(self, html)
    }
}

/// The dev server: context plus watcher lifecycle.
pub struct DevServer {
    ctx: Arc<ServerContext>,
    engine: Arc<HmrEngine>,
    watcher: Mutex<Option<WatcherHandle>>,
}

impl DevServer {
    /// Assemble a server: run `config_resolved` and `configure_server`
    /// across the plugin chain, bootstrap the dependency cache, build the
    /// pipeline and HMR engine.
    ///
    /// # Errors
    /// Plugin lifecycle failures are startup configuration failures and
    /// fatal. A failed dependency optimization is not: the server starts
    /// and bare imports answer with the structured error until a change
    /// triggers a retry.
    pub fn new(
        config: ResolvedConfig,
        plugins: Vec<Box<dyn Plugin>>,
        bundler: Box<dyn DepBundler>,
    ) -> Result<Self> {
        let container = Arc::new(PluginContainer::new(config.root.clone(), plugins));
        container
            .config_resolved(&config)
            .map_err(|e| Error::other(e.to_string()))?;

        let mut setup = ServerSetup::default();
        container
            .configure_server(&mut setup)
            .map_err(|e| Error::other(e.to_string()))?;

        let optimizer = Arc::new(DepOptimizer::new(
            config.root.clone(),
            config.deps_cache_dir.clone(),
            config.optimize_include.clone(),
            config.optimize_exclude.clone(),
            bundler,
        ));
        if let Err(e) = optimizer.run_initial() {
            warn!(error = %e, "dependency optimization failed, continuing");
        }

        let graph = Arc::new(ModuleGraph::new());
        let channel = Arc::new(HmrChannel::new());
        let css_links = Arc::new(CssLinks::new());

        let pipeline = Arc::new(TransformPipeline::new(
            graph.clone(),
            container.clone(),
            optimizer.clone(),
            channel.clone(),
            config.root.clone(),
            config.fs_allow.clone(),
        ));

        let engine = Arc::new(HmrEngine::new(
            graph.clone(),
            container.clone(),
            channel.clone(),
            css_links.clone(),
            config.root.clone(),
            config.full_reload_patterns.clone(),
        ));

        let ctx = Arc::new(ServerContext {
            config,
            graph,
            container,
            optimizer,
            pipeline,
            channel,
            css_links,
            middlewares: setup.middlewares,
        });

        Ok(Self {
            ctx,
            engine,
            watcher: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn context(&self) -> Arc<ServerContext> {
        self.ctx.clone()
    }

    /// The dev router: one fallback handler running the middleware chain,
    /// plus a permissive CORS layer.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(handle_request)
            .layer(CorsLayer::permissive())
            .with_state(self.ctx.clone())
    }

    /// Bind and serve until the task is cancelled. Starts the file
    /// watcher first.
    ///
    /// # Errors
    /// Fails when the watcher cannot start or the address cannot bind.
    pub async fn listen(&self) -> Result<()> {
        let handle = start_watcher(
            &watch_roots(&self.ctx.config),
            self.ctx.config.watch_ignore.clone(),
            self.engine.clone(),
        )?;
        *self.watcher.lock().unwrap() = Some(handle);

        let host = &self.ctx.config.host;
        let host_ip = if host == "localhost" {
            "127.0.0.1"
        } else {
            host.as_str()
        };
        let addr: SocketAddr = format!("{host_ip}:{}", self.ctx.config.port)
            .parse()
            .map_err(|e| Error::other(format!("invalid listen address: {e}")))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(
            "dev server running at http://{host}:{}{}",
            self.ctx.config.port, self.ctx.config.base
        );

        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Reverse of `listen`: stop watching. The graph dies with the
    /// context.
    pub fn close(&self) {
        self.watcher.lock().unwrap().take();
        info!("dev server closed");
    }
}

async fn handle_request(
    State(ctx): State<Arc<ServerContext>>,
    ws: Option<WebSocketUpgrade>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    // Persistent message channel on the same origin, gated on the
    // subprotocol token.
    if let Some(ws) = ws {
        if !ctx.config.hmr {
            return status_response(StatusCode::NOT_FOUND, "hmr disabled");
        }
        let channel = ctx.channel.clone();
        return ws
            .protocols([HMR_SUBPROTOCOL])
            .on_upgrade(move |socket| channel.handle_socket(socket));
    }

    let raw = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);

    // (1) Base-path stripping; requests outside the base are redirected
    // into it.
    let base = &ctx.config.base;
    let url = if base == "/" {
        raw
    } else {
        let stripped = strip_base(&raw, base);
        if stripped == raw && !raw.starts_with(base.trim_end_matches('/')) {
            let location = format!("{}{}", base.trim_end_matches('/'), raw);
            return Response::builder()
                .status(StatusCode::FOUND)
                .header(header::LOCATION, location)
                .body(Body::empty())
                .unwrap();
        }
        stripped.to_string()
    };

    if clean_url(&url) == "/__ping" {
        return status_response(StatusCode::OK, "pong");
    }

    // Plugin middlewares run before the internal handlers.
    for middleware in &ctx.middlewares {
        if let Some(resp) = (middleware.handler)(&url) {
            return Response::builder()
                .status(resp.status)
                .header(header::CONTENT_TYPE, resp.content_type)
                .body(Body::from(resp.body))
                .unwrap();
        }
    }

    if clean_url(&url) == CLIENT_PATH {
        let code = client_runtime(&ctx.config.host, ctx.config.port, base);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/javascript")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(code))
            .unwrap();
    }

    // (2) Optimized-dep static files: immutable, the `?v=` hash busts.
    if let Some(path) = fs_url_to_path(&url) {
        if ctx.optimizer.is_cache_path(&path) {
            return match std::fs::read(&path) {
                Ok(bytes) => Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/javascript")
                    .header(header::CACHE_CONTROL, "max-age=31536000,immutable")
                    .body(Body::from(bytes))
                    .unwrap(),
                Err(_) => status_response(StatusCode::NOT_FOUND, "optimized dep not found"),
            };
        }
    }

    // (3) Public assets, served verbatim.
    if let Some(response) = serve_public(&ctx, &url) {
        return response;
    }

    // (4) Transform pipeline.
    if is_module_request(&url) {
        return transform_response(&ctx, &url, &headers).await;
    }

    // (5) HTML rewriter and (6) SPA fallback.
    if let Some(response) = serve_html(&ctx, &url) {
        return response;
    }

    status_response(StatusCode::NOT_FOUND, "not found")
}

async fn transform_response(ctx: &ServerContext, url: &str, headers: &HeaderMap) -> Response {
    match ctx.pipeline.transform_request(url).await {
        Ok(result) => {
            if let Some(tag) = headers.get(header::IF_NONE_MATCH) {
                if tag.to_str().map(|s| s == result.etag).unwrap_or(false) {
                    return Response::builder()
                        .status(StatusCode::NOT_MODIFIED)
                        .body(Body::empty())
                        .unwrap();
                }
            }
            let clean = clean_url(url);
            let is_direct_css = clean.ends_with(".css")
                && !crate::paths::query_of(url).is_some_and(|q| q.split('&').any(|p| p == "import"));
            let content_type = if is_direct_css {
                "text/css"
            } else {
                "application/javascript"
            };
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .header(header::ETAG, result.etag)
                .body(Body::from(result.code))
                .unwrap()
        }
        Err(e) => {
            let body = serde_json::to_string(&e.to_payload()).unwrap_or_default();
            Response::builder()
                .status(StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        }
    }
}

fn serve_public(ctx: &ServerContext, url: &str) -> Option<Response> {
    let rel = clean_url(url).trim_start_matches('/');
    if rel.is_empty() || rel.contains("..") {
        return None;
    }
    let path = ctx.config.public_dir.join(rel);
    if !path.is_file() {
        return None;
    }
    let bytes = std::fs::read(&path).ok()?;
    Some(
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, content_type_for(&path))
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(bytes))
            .unwrap(),
    )
}

/// `/index.html`, `/`, and every extensionless request whose directory
/// carries an `index.html` are equivalent; the SPA fallback lands on the
/// root `index.html`.
fn serve_html(ctx: &ServerContext, url: &str) -> Option<Response> {
    let clean = clean_url(url);
    let rel = clean.trim_start_matches('/');
    if rel.contains("..") {
        return None;
    }

    let candidates = if clean.ends_with(".html") {
        vec![ctx.config.root.join(rel)]
    } else if clean.ends_with('/') || !rel.contains('.') {
        vec![
            ctx.config.root.join(rel).join("index.html"),
            ctx.config.root.join("index.html"),
        ]
    } else {
        return None;
    };

    let path = candidates.into_iter().find(|p| p.is_file())?;
    let html = std::fs::read_to_string(&path).ok()?;
    let processed = process_html(ctx, &html);
    Some(
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/html")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(processed))
            .unwrap(),
    )
}

/// Inject the client runtime script, record `<link rel="stylesheet">`
/// URLs for css-update classification, then run the plugin HTML hooks.
fn process_html(ctx: &ServerContext, html: &str) -> String {
    for link in stylesheet_hrefs(html) {
        ctx.css_links.register(clean_url(&link));
    }

    let script = format!(
        "<script type=\"module\" src=\"{}{}\"></script>",
        ctx.config.base.trim_end_matches('/'),
        CLIENT_PATH
    );
    let injected = if let Some(idx) = html.find("<head>") {
        let mut out = html.to_string();
        out.insert_str(idx + "<head>".len(), &format!("\n  {script}"));
        out
    } else {
        format!("{script}\n{html}")
    };

    match ctx.container.transform_index_html(&injected) {
        Ok(out) => out,
        Err(e) => {
            warn!(error = %e, "transform_index_html hook failed");
            injected
        }
    }
}

/// Hrefs of stylesheet links in an HTML document.
fn stylesheet_hrefs(html: &str) -> Vec<String> {
    let mut hrefs = Vec::new();
    let mut rest = html;
    while let Some(idx) = rest.find("<link") {
        rest = &rest[idx..];
        let end = rest.find('>').unwrap_or(rest.len());
        let tag = &rest[..end];
        if tag.contains("rel=\"stylesheet\"") || tag.contains("rel='stylesheet'") {
            for quote in ['"', '\''] {
                let needle = format!("href={quote}");
                if let Some(h) = tag.find(&needle) {
                    let after = &tag[h + needle.len()..];
                    if let Some(close) = after.find(quote) {
                        hrefs.push(after[..close].to_string());
                    }
                    break;
                }
            }
        }
        rest = &rest[end.min(rest.len() - 1) + 1..];
    }
    hrefs
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn status_response(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

/// Convenience used by the CLI and tests: watch roots derive from the
/// config's allow-list.
#[must_use]
pub fn watch_roots(config: &ResolvedConfig) -> Vec<PathBuf> {
    let mut roots = vec![config.root.clone()];
    for extra in &config.fs_allow {
        if !roots.contains(extra) {
            roots.push(extra.clone());
        }
    }
    roots
}
