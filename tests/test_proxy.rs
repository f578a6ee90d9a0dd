//! Tests for SCGI descriptors and request forwarding

use std::fs;
use std::path::Path;
use std::time::Duration;

use citadel::config::ServerConfig;
use citadel::context::RequestContext;
use citadel::error::ServeError;
use citadel::handler::cgi::CgiEnv;
use citadel::http::request::{Method, Request, RequestBuilder};
use citadel::http::response::{Body, Response, StatusCode};
use citadel::proxy::upstream::build_scgi_request;
use citadel::proxy::{ScgiBackendSpec, ScgiProxy};
use citadel::site::{self, Resolution};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// A port nothing listens on.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn site_with_descriptor(descriptor: &str) -> tempfile::TempDir {
    let root = tempfile::tempdir().unwrap();
    let site = root.path().join("default.website");
    fs::create_dir_all(&site).unwrap();
    fs::write(site.join("app.scgi"), descriptor).unwrap();
    fs::write(site.join("offline.html"), "<p>down for maintenance</p>").unwrap();
    root
}

async fn forward(root: &Path, request: Request) -> Result<Response, ServeError> {
    forward_with_relight_delay(root, request, Duration::from_millis(50)).await
}

async fn forward_with_relight_delay(
    root: &Path,
    request: Request,
    relight_delay: Duration,
) -> Result<Response, ServeError> {
    let config = ServerConfig::new(root);
    let (site, resolution) = site::validate(&config, &request).unwrap();
    let Resolution::Target(target) = resolution else { panic!("expected a target") };
    let ctx = RequestContext::new(&config, request, None, None);
    ScgiProxy::new(Duration::from_secs(1), relight_delay)
        .forward(&ctx, &site, &target)
        .await
}

fn get(uri: &str) -> Request {
    RequestBuilder::new().method(Method::GET).uri(uri).build().unwrap()
}

#[test]
fn test_build_scgi_request() {
    let mut env = CgiEnv::default();
    env.set("REQUEST_METHOD", "POST");
    env.set("CONTENT_LENGTH", "999");

    let bytes = build_scgi_request(&env, b"hello");

    let expected_headers = b"CONTENT_LENGTH\x005\x00SCGI\x001\x00REQUEST_METHOD\x00POST\x00";
    let mut expected = format!("{}:", expected_headers.len()).into_bytes();
    expected.extend_from_slice(expected_headers);
    expected.extend_from_slice(b",hello");
    assert_eq!(bytes, expected);
}

#[test]
fn test_parse_descriptor() {
    let dir = Path::new("/srv/site");
    let spec = ScgiBackendSpec::parse(
        "SCGI 127.0.0.1 9000\nfallback: pages/offline.html\nrelight: start-app --daemon\n",
        dir,
    )
    .unwrap();

    assert_eq!(spec.host, "127.0.0.1");
    assert_eq!(spec.port, 9000);
    assert_eq!(spec.fallback.as_deref(), Some(Path::new("/srv/site/pages/offline.html")));
    assert_eq!(spec.relight.as_deref(), Some("start-app --daemon"));
    assert_eq!(spec.display_name(), "127.0.0.1:9000");

    let v6 = ScgiBackendSpec::parse("SCGI [::1] 9000\n", dir).unwrap();
    assert_eq!(v6.display_name(), "[::1]:9000");
}

#[test]
fn test_parse_descriptor_rejects_bad_input() {
    let dir = Path::new("/srv/site");
    for text in [
        "",
        "HTTP 127.0.0.1 9000",
        "SCGI 127.0.0.1",
        "SCGI 127.0.0.1 0",
        "SCGI 127.0.0.1 70000",
        "SCGI 127.0.0.1 9000 extra",
        "SCGI 127.0.0.1 9000\nfallback: /etc/passwd",
        "SCGI 127.0.0.1 9000\nfallback: ../secret",
        "SCGI 127.0.0.1 9000\nfallback: .hidden",
        "SCGI 127.0.0.1 9000\nrelight:",
        "SCGI 127.0.0.1 9000\nunknown line",
    ] {
        assert!(
            matches!(ScgiBackendSpec::parse(text, dir), Err(ServeError::ExecutionFailure(_))),
            "{text:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_unreachable_backend_is_unavailable() {
    let port = closed_port().await;
    let root = site_with_descriptor(&format!("SCGI 127.0.0.1 {port}\n"));

    let err = forward(root.path(), get("/app.scgi")).await.unwrap_err();

    assert!(matches!(err, ServeError::BackendUnavailable(_)));
    assert_eq!(err.status().as_u16(), 503);
}

#[tokio::test]
async fn test_unreachable_backend_serves_fallback() {
    let port = closed_port().await;
    let root = site_with_descriptor(&format!("SCGI 127.0.0.1 {port}\nfallback: offline.html\n"));

    let response = forward(root.path(), get("/app.scgi")).await.unwrap();

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.header("Cache-Control"), Some("no-cache"));
    assert_eq!(response.header("Content-Type"), Some("text/html; charset=utf-8"));
}

#[tokio::test]
async fn test_response_is_relayed_from_backend() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let backend = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        // Read until the netstring and the 4-byte body have arrived.
        loop {
            let n = socket.read(&mut buf).await.unwrap();
            received.extend_from_slice(&buf[..n]);
            if n == 0 || received.ends_with(b",ping") {
                break;
            }
        }
        socket
            .write_all(b"Status: 202 Accepted\r\nContent-Type: text/plain\r\n\r\npong")
            .await
            .unwrap();
        received
    });

    let root = site_with_descriptor(&format!("SCGI 127.0.0.1 {port}\n"));
    let request = RequestBuilder::new()
        .method(Method::POST)
        .uri("/app.scgi/api?x=1")
        .header("Content-Length", "4")
        .body(b"ping".to_vec())
        .build()
        .unwrap();
    let response = forward(root.path(), request).await.unwrap();

    assert_eq!(response.status.as_u16(), 202);
    let Body::Stream(mut reader) = response.body else { panic!("expected a streamed body") };
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"pong");

    let received = String::from_utf8_lossy(&backend.await.unwrap()).into_owned();
    assert!(received.contains("CONTENT_LENGTH\u{0}4\u{0}SCGI\u{0}1\u{0}"));
    assert!(received.contains("PATH_INFO\u{0}/api\u{0}"));
    assert!(received.contains("QUERY_STRING\u{0}x=1\u{0}"));
}

#[tokio::test]
async fn test_relight_starts_backend_and_retries_once() {
    let port = closed_port().await;
    let root = site_with_descriptor(&format!("SCGI 127.0.0.1 {port}\nrelight: echo lit >> relit.marker\n"));
    let marker = root.path().join("default.website/relit.marker");

    // The backend comes up only once the relight command has run.
    let backend_marker = marker.clone();
    let backend = tokio::spawn(async move {
        while !backend_marker.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await.unwrap();
        socket.write_all(b"Content-Type: text/plain\r\n\r\nrelit").await.unwrap();
    });

    let response = forward_with_relight_delay(root.path(), get("/app.scgi"), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::Ok);
    let Body::Stream(mut reader) = response.body else { panic!("expected a streamed body") };
    let mut body = Vec::new();
    reader.read_to_end(&mut body).await.unwrap();
    assert_eq!(body, b"relit");
    backend.await.unwrap();
    assert_eq!(fs::read_to_string(&marker).unwrap(), "lit\n");
}

#[tokio::test]
async fn test_relight_retry_failure_is_unavailable() {
    let port = closed_port().await;
    let root = site_with_descriptor(&format!("SCGI 127.0.0.1 {port}\nrelight: echo lit >> relit.marker\n"));

    let err = forward_with_relight_delay(root.path(), get("/app.scgi"), Duration::from_millis(500))
        .await
        .unwrap_err();

    assert!(matches!(err, ServeError::BackendUnavailable(_)));
    let marker = root.path().join("default.website/relit.marker");
    assert_eq!(fs::read_to_string(marker).unwrap(), "lit\n");
}

#[tokio::test]
async fn test_relight_retry_failure_serves_fallback() {
    let port = closed_port().await;
    let root = site_with_descriptor(&format!(
        "SCGI 127.0.0.1 {port}\nfallback: offline.html\nrelight: echo lit >> relit.marker\n"
    ));

    let response = forward_with_relight_delay(root.path(), get("/app.scgi"), Duration::from_millis(500))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::Ok);
    assert_eq!(response.header("Cache-Control"), Some("no-cache"));
    let marker = root.path().join("default.website/relit.marker");
    assert_eq!(fs::read_to_string(marker).unwrap(), "lit\n");
}
