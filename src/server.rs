use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use axum::{
    extract::{Path as RequestPath, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use tokio::{
    net::TcpListener,
    sync::{oneshot, Mutex},
    task::JoinHandle,
};

use crate::error::{BridgeError, Result};

pub const INDEX_PAGE: &str = "index.html";

struct RunningServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct StaticFileServer {
    root: Arc<PathBuf>,
    bind_host: String,
    running: Mutex<Option<RunningServer>>,
}

impl StaticFileServer {
    pub fn new(root: impl Into<PathBuf>, bind_host: impl Into<String>) -> Self {
        Self {
            root: Arc::new(root.into()),
            bind_host: bind_host.into(),
            running: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Binds an OS-assigned port and starts serving. Calling it while the
    /// server is already up returns the existing address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(server) = running.as_ref() {
            return Ok(server.addr);
        }

        let bind_addr = format!("{}:0", self.bind_host);
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|error| BridgeError::Server(format!("failed to bind {bind_addr}: {error}")))?;
        let addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let app = router(Arc::clone(&self.root));
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(error) = serve.await {
                tracing::error!(%error, "asset server stopped with error");
            }
        });

        tracing::info!(%addr, root = %self.root.display(), "asset server listening");
        *running = Some(RunningServer {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    pub async fn stop(&self) {
        let Some(server) = self.running.lock().await.take() else {
            return;
        };

        let _ = server.shutdown.send(());
        if let Err(error) = server.task.await {
            tracing::warn!(%error, "asset server task did not shut down cleanly");
        }
        tracing::info!(addr = %server.addr, "asset server stopped");
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|server| server.addr)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }
}

/// URL the browser surface should load for `page` on a server bound at
/// `addr`. Wildcard binds are addressed through `localhost`.
pub fn page_url(addr: SocketAddr, page: &str) -> String {
    let authority = if addr.ip().is_unspecified() {
        format!("localhost:{}", addr.port())
    } else {
        addr.to_string()
    };
    format!("http://{authority}/{}", page.trim_start_matches('/'))
}

fn router(root: Arc<PathBuf>) -> Router {
    Router::new()
        .route("/", get(serve_root))
        .route("/{*path}", get(serve_path))
        .with_state(root)
}

async fn serve_root(method: Method, State(root): State<Arc<PathBuf>>) -> Response {
    serve_file(method, &root, "").await
}

async fn serve_path(
    method: Method,
    State(root): State<Arc<PathBuf>>,
    RequestPath(path): RequestPath<String>,
) -> Response {
    serve_file(method, &root, &path).await
}

async fn serve_file(method: Method, root: &Path, request_path: &str) -> Response {
    let Some(file) = resolve_request_path(root, request_path).await else {
        tracing::debug!(%method, path = %request_path, status = 404, "asset request");
        return not_found(&display_path(root, request_path));
    };

    let body = match tokio::fs::read(&file).await {
        Ok(body) => body,
        Err(error) => {
            tracing::warn!(%error, path = %file.display(), "failed to read asset");
            return not_found(&display_path(root, request_path));
        }
    };

    tracing::debug!(%method, path = %request_path, status = 200, bytes = body.len(), "asset request");
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type_for_path(&file).to_string()),
            (header::CONTENT_LENGTH, body.len().to_string()),
        ],
        body,
    )
        .into_response()
}

fn not_found(display_path: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("{display_path} not found."),
    )
        .into_response()
}

/// Path as reported back to clients in the 404 body.
fn display_path(root: &Path, request_path: &str) -> String {
    format!(
        "{}/{}",
        root.to_string_lossy().trim_end_matches('/'),
        request_path.trim_start_matches('/')
    )
}

/// Resolves a decoded request path to a regular file under `root`, with
/// symlinks and `..` resolved on disk. `None` for missing files and for
/// anything outside the root.
async fn resolve_request_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let canonical_root = match tokio::fs::canonicalize(root).await {
        Ok(root) => root,
        Err(error) => {
            tracing::warn!(%error, root = %root.display(), "asset root is not accessible");
            return None;
        }
    };

    let candidate = canonical_root.join(request_path.trim_start_matches('/'));
    let candidate = tokio::fs::canonicalize(&candidate).await.ok()?;
    if !candidate.starts_with(&canonical_root) {
        return None;
    }

    match tokio::fs::metadata(&candidate).await {
        Ok(metadata) if metadata.is_file() => Some(candidate),
        _ => None,
    }
}

pub fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    match ext.as_deref() {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("xml") => "application/xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("bmp") => "image/bmp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("wasm") => "application/wasm",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") => "audio/ogg",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};

    use super::*;

    const INDEX_HTML: &str = "<!doctype html><html><body>rewards</body></html>\n";

    fn asset_root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("index.html"), INDEX_HTML).expect("write index");
        std::fs::create_dir(dir.path().join("static")).expect("mkdir static");
        std::fs::write(dir.path().join("static/app v2.js"), "console.log(1);").expect("write js");
        dir
    }

    #[tokio::test]
    async fn serves_existing_file_with_exact_length_and_mime() {
        let dir = asset_root();
        let server = StaticFileServer::new(dir.path(), "127.0.0.1");
        let addr = server.start().await.expect("start");

        let response = reqwest::get(page_url(addr, INDEX_PAGE)).await.expect("get index");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE].to_str().expect("ascii"),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            response.headers()[CONTENT_LENGTH].to_str().expect("ascii"),
            INDEX_HTML.len().to_string()
        );
        assert_eq!(response.text().await.expect("body"), INDEX_HTML);

        server.stop().await;
    }

    #[tokio::test]
    async fn missing_file_is_a_plaintext_404_naming_the_path() {
        let dir = asset_root();
        let server = StaticFileServer::new(dir.path(), "127.0.0.1");
        let addr = server.start().await.expect("start");

        let response = reqwest::get(page_url(addr, "missing.html")).await.expect("get");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(
            response.text().await.expect("body"),
            format!("{}/missing.html not found.", dir.path().display())
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn decodes_percent_escaped_paths() {
        let dir = asset_root();
        let server = StaticFileServer::new(dir.path(), "127.0.0.1");
        let addr = server.start().await.expect("start");

        let response = reqwest::get(format!("http://{addr}/static/app%20v2.js"))
            .await
            .expect("get");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response.headers()[CONTENT_TYPE].to_str().expect("ascii"),
            "text/javascript; charset=utf-8"
        );

        server.stop().await;
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let dir = asset_root();
        let server = StaticFileServer::new(dir.path(), "127.0.0.1");

        server.stop().await;
        let first = server.start().await.expect("start");
        let second = server.start().await.expect("start again");
        assert_eq!(first, second);
        assert!(server.is_running().await);

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running().await);
        assert!(server.local_addr().await.is_none());
        assert!(reqwest::get(page_url(first, INDEX_PAGE)).await.is_err());
    }

    #[tokio::test]
    async fn instances_never_share_a_port() {
        let dir = asset_root();
        let a = StaticFileServer::new(dir.path(), "127.0.0.1");
        let b = StaticFileServer::new(dir.path(), "127.0.0.1");
        let addr_a = a.start().await.expect("start a");
        let addr_b = b.start().await.expect("start b");
        assert_ne!(addr_a.port(), addr_b.port());
        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn traversal_outside_root_does_not_resolve() {
        let outer = tempfile::tempdir().expect("tempdir");
        let root = outer.path().join("www");
        std::fs::create_dir_all(root.join("static")).expect("mkdir");
        std::fs::write(root.join("index.html"), INDEX_HTML).expect("write index");
        std::fs::write(outer.path().join("secret.txt"), "secret").expect("write secret");

        assert!(resolve_request_path(&root, "../secret.txt").await.is_none());
        assert!(resolve_request_path(&root, "static").await.is_none());
        assert_eq!(
            resolve_request_path(&root, "static/../index.html").await,
            Some(root.canonicalize().expect("canonical root").join("index.html"))
        );
        assert_eq!(display_path(&root, "../secret.txt"), format!("{}/../secret.txt", root.display()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serves_from_a_parent_relative_root() {
        let dir = asset_root();
        let cwd = std::env::current_dir().expect("cwd");
        let mut root = PathBuf::new();
        for _ in cwd.components().skip(1) {
            root.push("..");
        }
        let absolute = dir.path().canonicalize().expect("canonical tempdir");
        root.push(absolute.strip_prefix("/").expect("absolute path"));
        assert!(root.starts_with(".."));

        let server = StaticFileServer::new(&root, "127.0.0.1");
        let addr = server.start().await.expect("start");

        let response = reqwest::get(page_url(addr, INDEX_PAGE)).await.expect("get index");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.expect("body"), INDEX_HTML);

        let response = reqwest::get(page_url(addr, "missing.html")).await.expect("get");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
        assert_eq!(
            response.text().await.expect("body"),
            format!("{}/missing.html not found.", root.display())
        );

        server.stop().await;
    }

    #[test]
    fn wildcard_binds_are_addressed_via_localhost() {
        let any = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 5123));
        assert_eq!(page_url(any, INDEX_PAGE), "http://localhost:5123/index.html");

        let loopback = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5123));
        assert_eq!(page_url(loopback, "/index.html"), "http://127.0.0.1:5123/index.html");
    }

    #[test]
    fn mime_lookup_is_case_insensitive_with_binary_fallback() {
        assert_eq!(content_type_for_path(Path::new("a/B.PNG")), "image/png");
        assert_eq!(content_type_for_path(Path::new("x.wasm")), "application/wasm");
        assert_eq!(content_type_for_path(Path::new("noext")), "application/octet-stream");
    }
}
