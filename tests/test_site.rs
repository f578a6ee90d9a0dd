//! Tests for path cleanup, virtual host selection and target resolution

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use citadel::config::ServerConfig;
use citadel::error::ServeError;
use citadel::http::request::{Method, Request, RequestBuilder};
use citadel::site::auth::{AuthOutcome, AuthPolicy};
use citadel::site::path::{check_components, normalize, sanitize};
use citadel::site::vhost::{select_site, site_name};
use citadel::site::{self, Resolution, TargetKind};

fn write(path: &Path, contents: &str, mode: u32) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

fn request(host: &str, uri: &str) -> Request {
    RequestBuilder::new()
        .method(Method::GET)
        .uri(uri)
        .header("Host", host)
        .build()
        .unwrap()
}

#[test]
fn test_sanitize_replaces_unsafe_bytes() {
    assert_eq!(sanitize(b"/a b/c\"d"), "/a_b/c_d");
    assert_eq!(sanitize(b"/caf\xc3\xa9"), "/caf__");
    assert_eq!(sanitize(b"/x%2Fy"), "/x%2Fy");
}

#[test]
fn test_sanitize_is_idempotent() {
    for input in [&b"/a b"[..], b"/%zz/%41", b"/\x00/..", b"/~user/x,y:z"] {
        let once = sanitize(input);
        assert_eq!(sanitize(once.as_bytes()), once);
    }
}

#[test]
fn test_hidden_and_dash_components_rejected() {
    assert!(matches!(check_components("/.git/config"), Err(ServeError::NotFound)));
    assert!(matches!(check_components("/a/-auth"), Err(ServeError::NotFound)));
    assert!(matches!(check_components("/a/../b"), Err(ServeError::NotFound)));
    assert!(check_components("/a/b.c-d").is_ok());
}

#[test]
fn test_well_known_allows_dot_files_but_not_parent() {
    assert!(check_components("/.well-known/.hidden").is_ok());
    assert!(check_components("/.well-known/acme-challenge/-x").is_ok());
    assert!(check_components("/.well-known/../x").is_err());
}

#[test]
fn test_normalize_requires_absolute_path() {
    assert!(matches!(normalize("index.html"), Err(ServeError::NotFound)));
    assert!(matches!(normalize("*"), Err(ServeError::NotFound)));
    assert_eq!(normalize("/a b").unwrap(), "/a_b");
}

#[test]
fn test_site_name_from_host_header() {
    assert_eq!(site_name("Example.COM").unwrap().as_deref(), Some("example.com"));
    assert_eq!(site_name("example.com:8080").unwrap().as_deref(), Some("example.com"));
    assert_eq!(site_name("127.0.0.1:80").unwrap().as_deref(), Some("127.0.0.1"));
    assert_eq!(site_name("[::1]:8080").unwrap(), None);
}

#[test]
fn test_site_name_rejects_bad_hosts() {
    for host in ["", "exa mple.com", "a/b", "example.com:http", "[::1", "-lead.example"] {
        assert!(
            matches!(site_name(host), Err(ServeError::UnknownHost(_))),
            "{host:?} should be rejected"
        );
    }
}

#[test]
fn test_select_site_falls_back_to_default() {
    let root = tempfile::tempdir().unwrap();
    fs::create_dir(root.path().join("example.com.website")).unwrap();
    fs::create_dir(root.path().join("default.website")).unwrap();
    let config = ServerConfig::new(root.path());

    let named = select_site(&config, Some("example.com:8080")).unwrap();
    assert_eq!(named.dir, root.path().join("example.com.website"));
    assert_eq!(named.server_name, "example.com");

    let other = select_site(&config, Some("other.org")).unwrap();
    assert_eq!(other.dir, root.path().join("default.website"));

    let missing = select_site(&config, None).unwrap();
    assert_eq!(missing.dir, root.path().join("default.website"));
}

#[test]
fn test_select_site_uses_root_only_when_standalone() {
    let root = tempfile::tempdir().unwrap();
    let mut config = ServerConfig::new(root.path());

    assert!(matches!(select_site(&config, Some("x.org")), Err(ServeError::NotFound)));

    config.port = Some(8080);
    assert_eq!(select_site(&config, Some("x.org")).unwrap().dir, root.path());
}

#[test]
fn test_resolve_static_cgi_and_scgi() {
    let root = tempfile::tempdir().unwrap();
    let site = root.path().join("default.website");
    write(&site.join("page.html"), "<p>hi</p>", 0o644);
    write(&site.join("bin/run"), "#!/bin/sh\n", 0o755);
    write(&site.join("app.scgi"), "SCGI 127.0.0.1 4000\n", 0o644);
    let config = ServerConfig::new(root.path());

    let (_, res) = site::validate(&config, &request("x", "/page.html")).unwrap();
    let Resolution::Target(target) = res else { panic!("expected a target") };
    assert_eq!(target.kind, TargetKind::Static);
    assert_eq!(target.script_name, "/page.html");

    let (_, res) = site::validate(&config, &request("x", "/bin/run/extra/path?q=1")).unwrap();
    let Resolution::Target(target) = res else { panic!("expected a target") };
    assert_eq!(target.kind, TargetKind::Cgi);
    assert_eq!(target.script_name, "/bin/run");
    assert_eq!(target.path_info, "/extra/path");

    let (_, res) = site::validate(&config, &request("x", "/app.scgi/api")).unwrap();
    let Resolution::Target(target) = res else { panic!("expected a target") };
    assert_eq!(target.kind, TargetKind::Scgi);
    assert_eq!(target.path_info, "/api");
}

#[test]
fn test_resolve_directory_redirect_and_index() {
    let root = tempfile::tempdir().unwrap();
    let site = root.path().join("default.website");
    write(&site.join("docs/index.html"), "index", 0o644);
    fs::create_dir_all(site.join("empty")).unwrap();
    let config = ServerConfig::new(root.path());

    let (_, res) = site::validate(&config, &request("x", "/docs")).unwrap();
    assert_eq!(res, Resolution::AddSlash("/docs/".to_string()));

    let (_, res) = site::validate(&config, &request("x", "/docs/")).unwrap();
    let Resolution::Target(target) = res else { panic!("expected a target") };
    assert_eq!(target.file_name(), "index.html");

    assert!(matches!(site::validate(&config, &request("x", "/empty/")), Err(ServeError::NotFound)));
}

#[test]
fn test_resolve_refuses_unsafe_targets() {
    let root = tempfile::tempdir().unwrap();
    let site = root.path().join("default.website");
    write(&site.join("page.html"), "x", 0o644);
    write(&site.join("open"), "#!/bin/sh\n", 0o777);
    write(&root.path().join("secret.txt"), "secret", 0o644);
    std::os::unix::fs::symlink(root.path().join("secret.txt"), site.join("link.txt")).unwrap();
    let config = ServerConfig::new(root.path());

    assert!(matches!(site::validate(&config, &request("x", "/page.html/more")), Err(ServeError::NotFound)));
    assert!(matches!(site::validate(&config, &request("x", "/open")), Err(ServeError::Forbidden(_))));
    assert!(matches!(site::validate(&config, &request("x", "/link.txt")), Err(ServeError::Forbidden(_))));
    assert!(matches!(site::validate(&config, &request("x", "/missing")), Err(ServeError::NotFound)));
}

#[test]
fn test_auth_policy_checks_basic_credentials() {
    let policy = AuthPolicy::parse("realm \"Staff\"\nuser alice alice:secret\n").unwrap();

    let anonymous = request("x", "/");
    assert_eq!(
        policy.check(&anonymous, false, "x").unwrap(),
        AuthOutcome::Challenge("Staff".to_string())
    );

    // alice:secret
    let authed = RequestBuilder::new()
        .method(Method::GET)
        .uri("/")
        .header("Authorization", "Basic YWxpY2U6c2VjcmV0")
        .build()
        .unwrap();
    assert_eq!(
        policy.check(&authed, false, "x").unwrap(),
        AuthOutcome::Allow { remote_user: Some("alice".to_string()) }
    );
}

#[test]
fn test_auth_policy_https_rules() {
    let redirect = AuthPolicy::parse("http-redirect\nanyone\n").unwrap();
    assert_eq!(
        redirect.check(&request("x", "/a?b"), false, "example.com").unwrap(),
        AuthOutcome::Redirect("https://example.com/a?b".to_string())
    );
    assert_eq!(
        redirect.check(&request("x", "/a"), true, "example.com").unwrap(),
        AuthOutcome::Allow { remote_user: None }
    );

    let https_only = AuthPolicy::parse("https-only\nanyone\n").unwrap();
    assert!(matches!(https_only.check(&request("x", "/"), false, "x"), Err(ServeError::NotFound)));

    assert!(AuthPolicy::parse("bogus\n").is_err());
}
