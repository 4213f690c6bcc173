//! Mini HTTP server for the report directory.
//!
//! Serves static files with `index.html` as the default document,
//! gated by optional Basic auth. The config carries a space-
//! separated list of pre-encoded `base64(user:pass)` tokens, so the
//! check is a straight token comparison. Runs on its own tokio
//! runtime thread; the trading path never touches async.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

pub const DEFAULT_PORT: u16 = 11223;

#[derive(Clone)]
struct ServeState {
    dir: Arc<PathBuf>,
    /// Space-separated `base64(user:pass)` tokens; empty disables auth.
    auth: Arc<String>,
    realm: Arc<String>,
}

/// Keeps the server thread alive.
pub struct ServerHandle {
    _thread: thread::JoinHandle<()>,
}

/// Parse a `host:port` bind string; a missing port falls back to
/// 11223.
pub fn parse_bind(bind: &str) -> std::io::Result<SocketAddr> {
    let candidate = if bind.contains(':') {
        bind.to_string()
    } else {
        format!("{bind}:{DEFAULT_PORT}")
    };
    candidate
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "unresolvable bind"))
}

/// Start the report server on a dedicated runtime thread.
pub fn spawn_server(
    addr: SocketAddr,
    dir: PathBuf,
    auth: String,
    realm: String,
) -> std::io::Result<ServerHandle> {
    let state = ServeState {
        dir: Arc::new(dir),
        auth: Arc::new(auth),
        realm: Arc::new(realm),
    };
    let thread = thread::Builder::new()
        .name("pmm-http".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(error = %e, "report server runtime failed");
                    return;
                }
            };
            rt.block_on(async move {
                let app = Router::new()
                    .fallback(serve_file)
                    .with_state(state);
                let listener = match tokio::net::TcpListener::bind(addr).await {
                    Ok(l) => l,
                    Err(e) => {
                        error!(%addr, error = %e, "report server bind failed");
                        return;
                    }
                };
                info!(%addr, "report server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "report server stopped");
                }
            });
        })?;
    Ok(ServerHandle { _thread: thread })
}

async fn serve_file(State(state): State<ServeState>, req: Request<Body>) -> Response {
    if !check_basic_auth(req.headers(), &state.auth) {
        return unauthorized_response(&state.realm);
    }

    let rel = match sanitize(req.uri().path()) {
        Some(rel) => rel,
        None => return (StatusCode::NOT_FOUND, "not found").into_response(),
    };
    let mut path = state.dir.join(rel);
    if path.is_dir() {
        path = path.join("index.html");
    }
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type(&path))],
            bytes,
        )
            .into_response(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "report file not served");
            (StatusCode::NOT_FOUND, "not found").into_response()
        }
    }
}

/// Normalize a request path, refusing anything that escapes the
/// report directory.
fn sanitize(path: &str) -> Option<PathBuf> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Some(PathBuf::from("index.html"));
    }
    let candidate = PathBuf::from(trimmed);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(candidate)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("json") => "application/json",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Accept when the auth list is empty or the request carries one of
/// the configured `base64(user:pass)` tokens.
fn check_basic_auth(headers: &HeaderMap, auth: &str) -> bool {
    if auth.trim().is_empty() {
        return true;
    }
    let header_value = match headers.get(header::AUTHORIZATION).and_then(|h| h.to_str().ok()) {
        Some(v) => v,
        None => return false,
    };
    let mut parts = header_value.splitn(2, ' ');
    if parts.next() != Some("Basic") {
        return false;
    }
    let token = match parts.next() {
        Some(t) => t.trim(),
        None => return false,
    };
    auth.split_whitespace().any(|allowed| allowed == token)
}

fn unauthorized_response(realm: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{realm}\""),
        )],
        "<html><body><h1>401 Unauthorized</h1></body></html>",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_empty_auth_list_allows_everyone() {
        let headers = HeaderMap::new();
        assert!(check_basic_auth(&headers, ""));
        assert!(check_basic_auth(&headers, "   "));
    }

    #[test]
    fn test_missing_header_is_rejected() {
        let headers = HeaderMap::new();
        assert!(!check_basic_auth(&headers, "dXNlcjpwYXNz"));
    }

    #[test]
    fn test_matching_token_accepted() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Basic dXNlcjpwYXNz"),
        );
        assert!(check_basic_auth(&headers, "b3RoZXI6cHc= dXNlcjpwYXNz"));
        assert!(!check_basic_auth(&headers, "b3RoZXI6cHc="));
    }

    #[test]
    fn test_non_basic_scheme_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer dXNlcjpwYXNz"),
        );
        assert!(!check_basic_auth(&headers, "dXNlcjpwYXNz"));
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert_eq!(sanitize("/"), Some(PathBuf::from("index.html")));
        assert_eq!(sanitize("/report.json"), Some(PathBuf::from("report.json")));
        assert!(sanitize("/../etc/passwd").is_none());
        assert!(sanitize("/a/../../b").is_none());
    }

    #[test]
    fn test_parse_bind_defaults_port() {
        assert_eq!(
            parse_bind("127.0.0.1").unwrap(),
            "127.0.0.1:11223".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            parse_bind("0.0.0.0:8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
    }
}
