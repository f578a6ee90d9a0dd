//! Tests for CGI environment construction and program execution

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use citadel::config::ServerConfig;
use citadel::context::RequestContext;
use citadel::error::{Budget, ServeError};
use citadel::handler::{self, cgi};
use citadel::http::request::{Method, RequestBuilder};
use citadel::http::response::{Body, Response, StatusCode};
use citadel::site::{self, Resolution};
use tokio::io::AsyncReadExt;

fn script(root: &Path, name: &str, body: &str) {
    let path = root.join("default.website").join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

async fn read_process_body(response: Response) -> String {
    let Body::Process { mut stdout, mut child } = response.body else {
        panic!("expected a process body, got {:?}", response.body);
    };
    let mut out = String::new();
    stdout.read_to_string(&mut out).await.unwrap();
    drop(stdout);
    child.wait().await.unwrap();
    out
}

#[test]
fn test_env_names_are_checked() {
    assert!(cgi::is_safe_env_name("HTTP_USER_AGENT"));
    assert!(cgi::is_safe_env_name("_X1"));
    assert!(!cgi::is_safe_env_name("1X"));
    assert!(!cgi::is_safe_env_name("lower"));
    assert!(!cgi::is_safe_env_name("A-B"));
    assert!(!cgi::is_safe_env_name(""));
}

#[test]
fn test_env_refuses_function_definitions() {
    let mut env = cgi::CgiEnv::default();
    env.set("HTTP_USER_AGENT", "() { :; }; echo pwned");
    env.set("HTTP_COOKIE", "a=\0b");
    env.set("QUERY_STRING", "a=1");
    env.set("QUERY_STRING", "a=2");

    assert_eq!(env.get("HTTP_USER_AGENT"), None);
    assert_eq!(env.get("HTTP_COOKIE"), None);
    assert_eq!(env.get("QUERY_STRING"), Some("a=2"));
    assert_eq!(env.len(), 1);
}

#[test]
fn test_environment_from_request() {
    let root = tempfile::tempdir().unwrap();
    script(root.path(), "bin/env.cgi", "env\n");
    let config = ServerConfig::new(root.path());
    let request = RequestBuilder::new()
        .method(Method::POST)
        .uri("/bin/env.cgi/extra?x=1")
        .header("Host", "example.com:8080")
        .header("Content-Type", "application/x-www-form-urlencoded")
        .header("User-Agent", "() { :; }; /bin/false")
        .header("X-Secret", "not forwarded")
        .body(b"a=b".to_vec())
        .build()
        .unwrap();

    let (site, resolution) = site::validate(&config, &request).unwrap();
    let Resolution::Target(target) = resolution else { panic!("expected a target") };
    let peer = "[::ffff:10.0.0.7]:5555".parse().unwrap();
    let ctx = RequestContext::new(&config, request, Some(peer), Some(8080));
    let env = cgi::cgi_environment(&ctx, &site, &target);

    assert_eq!(env.get("REQUEST_METHOD"), Some("POST"));
    assert_eq!(env.get("SCRIPT_NAME"), Some("/bin/env.cgi"));
    assert_eq!(env.get("PATH_INFO"), Some("/extra"));
    assert_eq!(env.get("QUERY_STRING"), Some("x=1"));
    assert_eq!(env.get("CONTENT_LENGTH"), Some("3"));
    assert_eq!(env.get("CONTENT_TYPE"), Some("application/x-www-form-urlencoded"));
    assert_eq!(env.get("SERVER_NAME"), Some("example.com"));
    assert_eq!(env.get("SERVER_PORT"), Some("8080"));
    assert_eq!(env.get("REMOTE_ADDR"), Some("10.0.0.7"));
    assert_eq!(env.get("REMOTE_PORT"), Some("5555"));
    assert_eq!(env.get("PATH"), Some(cgi::CGI_PATH));
    assert_eq!(env.get("HTTP_USER_AGENT"), None);
    assert!(env.iter().all(|(_, v)| v != "not forwarded"));
    assert!(env.get("HTTPS").is_none());
}

#[tokio::test]
async fn test_cgi_output_is_relayed() {
    let root = tempfile::tempdir().unwrap();
    script(
        root.path(),
        "hello.cgi",
        "printf 'Status: 201 Created\\r\\nContent-Type: text/plain\\r\\n\\r\\n'\n\
         echo \"$REQUEST_METHOD $PATH_INFO $QUERY_STRING\"\n\
         cat\n",
    );
    let config = ServerConfig::new(root.path());
    let request = RequestBuilder::new()
        .method(Method::POST)
        .uri("/hello.cgi/p?q=1")
        .header("Content-Length", "5")
        .body(b"input".to_vec())
        .build()
        .unwrap();
    let mut ctx = RequestContext::new(&config, request, None, None);

    let response = handler::route(&mut ctx).await.unwrap();

    assert_eq!(response.status, StatusCode::Created);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(read_process_body(response).await, "POST /p q=1\ninput");
}

#[tokio::test]
async fn test_program_without_headers_fails() {
    let root = tempfile::tempdir().unwrap();
    script(root.path(), "quiet.cgi", "exit 0\n");
    let config = ServerConfig::new(root.path());
    let request = RequestBuilder::new().method(Method::GET).uri("/quiet.cgi").build().unwrap();
    let mut ctx = RequestContext::new(&config, request, None, None);

    let err = handler::route(&mut ctx).await.unwrap_err();

    assert!(matches!(err, ServeError::ExecutionFailure(_)));
    assert_eq!(err.status().as_u16(), 500);
}

#[tokio::test]
async fn test_cpu_budget_is_enforced() {
    let root = tempfile::tempdir().unwrap();
    script(root.path(), "spin.cgi", "while :; do :; done\n");
    let mut config = ServerConfig::new(root.path());
    config.max_cpu = 1;
    let request = RequestBuilder::new().method(Method::GET).uri("/spin.cgi").build().unwrap();
    let mut ctx = RequestContext::new(&config, request, None, None);

    let err = handler::route(&mut ctx).await.unwrap_err();

    assert!(matches!(err, ServeError::ResourceExceeded(Budget::Cpu)));
}

#[tokio::test]
async fn test_method_rules() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir_all(root.path().join("default.website")).unwrap();
    fs::write(root.path().join("default.website/page.html"), "hi").unwrap();
    let config = ServerConfig::new(root.path());

    let post = RequestBuilder::new().method(Method::POST).uri("/page.html").build().unwrap();
    let mut ctx = RequestContext::new(&config, post, None, None);
    assert!(matches!(handler::route(&mut ctx).await, Err(ServeError::MethodNotAllowed)));

    let put = RequestBuilder::new().method(Method::Other("PUT".to_string())).uri("/page.html").build().unwrap();
    let mut ctx = RequestContext::new(&config, put, None, None);
    assert!(matches!(handler::route(&mut ctx).await, Err(ServeError::NotImplemented(_))));
}
