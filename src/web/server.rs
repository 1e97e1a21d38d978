//! HTTP(S) transport for the console
//!
//! Routes:
//! - `GET /` renders the page, running `?command=` first when present
//! - `POST /exec` runs the urlencoded `command` field and returns a fragment
//! - `GET /static/<path>` serves files from the static directory
//!
//! Runs are blocking, so they go to tokio's blocking pool and a slow
//! command never holds up other requests.

use crate::error::{Error, Result};
use crate::executor::OneShotExecutor;
use crate::provider::JailProvider;
use crate::web::render;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, instrument, warn};

/// Largest request body accepted
pub const MAX_BODY_BYTES: usize = 64 * 1024;

const HTML: &str = "text/html; charset=utf-8";
const TEXT: &str = "text/plain; charset=utf-8";

/// Shared state behind every connection
pub struct Console<P: JailProvider> {
    executor: OneShotExecutor<P>,
    static_dir: Option<PathBuf>,
}

impl<P: JailProvider + 'static> Console<P> {
    pub fn new(executor: OneShotExecutor<P>, static_dir: Option<PathBuf>) -> Self {
        Self {
            executor,
            static_dir,
        }
    }

    /// Run a command on the blocking pool and return the text to display
    async fn run(self: &Arc<Self>, command: String) -> std::result::Result<String, String> {
        let console = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let outcome = console.executor.run_once(&command);
            info!(command = %command, success = outcome.is_success(), "command finished");
            render::outcome_text(&outcome)
        })
        .await
        .map_err(|e| e.to_string())
    }
}

/// Accept connections until `shutdown` resolves
///
/// With an acceptor every connection is TLS; without one it is plain HTTP.
pub async fn serve<P, F>(
    console: Arc<Console<P>>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shutdown: F,
) -> Result<()>
where
    P: JailProvider + 'static,
    F: Future<Output = ()>,
{
    let local = listener.local_addr()?;
    info!(
        addr = %local,
        scheme = if tls.is_some() { "https" } else { "http" },
        "console listening"
    );

    tokio::pin!(shutdown);
    let mut connection_count: u64 = 0;

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "accept error");
                    continue;
                }
            },
            () = &mut shutdown => {
                info!("shutting down console");
                return Ok(());
            }
        };

        connection_count += 1;
        let conn_id = connection_count;
        let console = Arc::clone(&console);
        let tls = tls.clone();
        debug!(connection_id = conn_id, peer = %peer, "connection accepted");

        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(stream) => serve_connection(stream, console, conn_id).await,
                    Err(e) => debug!(connection_id = conn_id, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(stream, console, conn_id).await,
            }
        });
    }
}

async fn serve_connection<S, P>(stream: S, console: Arc<Console<P>>, conn_id: u64)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    P: JailProvider + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let console = Arc::clone(&console);
        async move { Ok::<_, Infallible>(handle(console, req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        debug!(connection_id = conn_id, error = %e, "connection error");
    }
}

/// Route one request
#[instrument(skip(console, req), fields(method = %req.method(), path = %req.uri().path()))]
pub async fn handle<P, B>(console: Arc<Console<P>>, req: Request<B>) -> Response<Full<Bytes>>
where
    P: JailProvider + 'static,
    B: Body,
    B::Error: std::error::Error + Send + Sync + 'static,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::GET, "/") => {
            let command = req
                .uri()
                .query()
                .and_then(|q| form_field(q.as_bytes(), "command"))
                .filter(|c| !c.trim().is_empty());

            match command {
                Some(command) => match console.run(command).await {
                    Ok(text) => respond(StatusCode::OK, HTML, render::render_index(Some(&text))),
                    Err(e) => internal_error(e),
                },
                None => respond(StatusCode::OK, HTML, render::render_index(None)),
            }
        }
        (&Method::POST, "/exec") => {
            let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "rejected request body");
                    return respond(
                        StatusCode::PAYLOAD_TOO_LARGE,
                        TEXT,
                        "Request body too large\n".into(),
                    );
                }
            };

            match form_field(&body, "command").filter(|c| !c.trim().is_empty()) {
                Some(command) => match console.run(command).await {
                    Ok(text) => respond(StatusCode::OK, HTML, render::render_fragment(Some(&text))),
                    Err(e) => internal_error(e),
                },
                None => respond(StatusCode::OK, HTML, render::render_fragment(None)),
            }
        }
        (_, "/") => method_not_allowed("GET"),
        (_, "/exec") => method_not_allowed("POST"),
        (&Method::GET, p) if p.starts_with("/static/") => {
            serve_static(console.static_dir.as_deref(), &p["/static/".len()..]).await
        }
        _ => not_found(),
    }
}

/// First value of `name` in an urlencoded form
fn form_field(input: &[u8], name: &str) -> Option<String> {
    form_urlencoded::parse(input)
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn serve_static(root: Option<&Path>, relative: &str) -> Response<Full<Bytes>> {
    let Some(root) = root else {
        return not_found();
    };
    let Some(path) = resolve_static(root, relative) else {
        warn!(path = relative, "rejected static path");
        return not_found();
    };

    match tokio::fs::read(&path).await {
        Ok(content) => Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type(&path))
            .body(Full::new(Bytes::from(content)))
            .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, "")),
        Err(_) => not_found(),
    }
}

/// Join `relative` onto `root`, refusing anything that could escape it
fn resolve_static(root: &Path, relative: &str) -> Option<PathBuf> {
    if relative.is_empty() || relative.contains('\\') {
        return None;
    }

    let relative = Path::new(relative);
    let clean = relative
        .components()
        .all(|c| matches!(c, Component::Normal(part) if !part.to_string_lossy().starts_with('.')));
    clean.then(|| root.join(relative))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js") => "application/javascript",
        Some("css") => "text/css",
        Some("html") => HTML,
        Some("gif") => "image/gif",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => TEXT,
        _ => "application/octet-stream",
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| plain(StatusCode::INTERNAL_SERVER_ERROR, ""))
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn not_found() -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, TEXT, "Not Found\n".into())
}

fn method_not_allowed(allow: &'static str) -> Response<Full<Bytes>> {
    let mut response = respond(
        StatusCode::METHOD_NOT_ALLOWED,
        TEXT,
        "Method Not Allowed\n".into(),
    );
    response
        .headers_mut()
        .insert(ALLOW, hyper::header::HeaderValue::from_static(allow));
    response
}

fn internal_error(message: String) -> Response<Full<Bytes>> {
    error!(error = %message, "run task failed");
    respond(
        StatusCode::INTERNAL_SERVER_ERROR,
        TEXT,
        "Internal Server Error\n".into(),
    )
}

/// Bind the listener for `bind:port`
pub async fn bind(bind: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((bind, port))
        .await
        .map_err(|e| Error::Network(format!("Failed to bind {}:{}: {}", bind, port, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::SkiffConfig;
    use crate::provider::{JailHandle, JailSpec};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Provider that "runs" commands by echoing them back
    struct Echo;

    impl JailProvider for Echo {
        fn create(&self, spec: &JailSpec) -> Result<JailHandle> {
            Ok(JailHandle::new(&spec.name, "/nonexistent"))
        }

        fn provision(&self, _handle: &mut JailHandle, _release: &str) -> Result<()> {
            Ok(())
        }

        fn execute(
            &self,
            _handle: &JailHandle,
            command: &str,
            _timeout: Option<Duration>,
        ) -> Result<String> {
            if command == "boom" {
                return Err(Error::JailTimeout(Duration::from_secs(300)));
            }
            Ok(format!("ran: {}\n", command))
        }

        fn stop(&self, _handle: &mut JailHandle, _force: bool) -> Result<()> {
            Ok(())
        }

        fn destroy(&self, _handle: &JailHandle) -> Result<()> {
            Ok(())
        }
    }

    fn console(static_dir: Option<PathBuf>) -> Arc<Console<Echo>> {
        let mut config = SkiffConfig::default();
        config.rate_limit.capacity = 100.0;
        config.rate_limit.refill_per_sec = 100.0;
        let executor = OneShotExecutor::new(Echo, &config).unwrap();
        Arc::new(Console::new(executor, static_dir))
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_index_without_command() {
        let response = handle(console(None), request(Method::GET, "/", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], HTML);
        let body = body_text(response).await;
        assert!(body.contains("<div id=\"stdout\"></div>"));
    }

    #[tokio::test]
    async fn test_index_runs_query_command() {
        let response = handle(console(None), request(Method::GET, "/?command=echo+%3Cb%3E", "")).await;
        let body = body_text(response).await;
        assert!(body.contains("ran: echo &lt;b&gt;"));
    }

    #[tokio::test]
    async fn test_exec_fragment() {
        let response = handle(console(None), request(Method::POST, "/exec", "command=uname+-a")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_text(response).await,
            "<textarea readonly>ran: uname -a\n</textarea>"
        );
    }

    #[tokio::test]
    async fn test_exec_blank_command_returns_sentinel() {
        for body in ["", "command=", "command=+++", "other=1"] {
            let response = handle(console(None), request(Method::POST, "/exec", body)).await;
            assert_eq!(body_text(response).await, "  ");
        }
    }

    #[tokio::test]
    async fn test_exec_failure_is_rendered() {
        let response = handle(console(None), request(Method::POST, "/exec", "command=boom")).await;
        let body = body_text(response).await;
        assert!(body.contains("Error: command failed"));
        assert!(body.contains("timeout"));
    }

    #[tokio::test]
    async fn test_exec_body_limit() {
        let huge = format!("command={}", "a".repeat(MAX_BODY_BYTES + 1));
        let response = handle(console(None), request(Method::POST, "/exec", &huge)).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_wrong_method_and_unknown_path() {
        let response = handle(console(None), request(Method::GET, "/exec", "")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "POST");

        let response = handle(console(None), request(Method::DELETE, "/", "")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = handle(console(None), request(Method::GET, "/admin", "")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("js")).unwrap();
        std::fs::write(dir.path().join("js/app.js"), "let x = 1;").unwrap();
        let console = console(Some(dir.path().to_path_buf()));

        let response = handle(Arc::clone(&console), request(Method::GET, "/static/js/app.js", "")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/javascript");
        assert_eq!(body_text(response).await, "let x = 1;");

        for uri in ["/static/../secret.txt", "/static/js/../../secret.txt", "/static/missing.js"] {
            let response = handle(Arc::clone(&console), request(Method::GET, uri, "")).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[test]
    fn test_resolve_static() {
        let root = Path::new("/srv/static");
        assert_eq!(
            resolve_static(root, "images/loader.gif"),
            Some(PathBuf::from("/srv/static/images/loader.gif"))
        );
        assert_eq!(resolve_static(root, "../etc/passwd"), None);
        assert_eq!(resolve_static(root, "/etc/passwd"), None);
        assert_eq!(resolve_static(root, ".hidden"), None);
        assert_eq!(resolve_static(root, ""), None);
    }
}
