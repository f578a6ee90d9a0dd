use std::net::SocketAddr;
use std::time::Duration;

use citadel::config::{AddressFamily, Cli, LogFormat, ServerConfig, validate_log_path};
use clap::Parser;

#[test]
fn test_config_defaults() {
    let cfg = ServerConfig::new("/srv/www");

    assert!(!cfg.standalone());
    assert!(cfg.jail);
    assert_eq!(cfg.max_age, 120);
    assert_eq!(cfg.max_cpu, 30);
    assert_eq!(cfg.response_timeout, Duration::from_secs(60));
    assert_eq!(cfg.max_content_length, 250_000_000);
    assert_eq!(cfg.log_format, LogFormat::Structured);
    assert_eq!(cfg.bind_addr(), None);
    assert_eq!(cfg.scheme(), "http");
}

#[test]
fn test_config_from_cli() {
    let dir = tempfile::tempdir().unwrap();
    let cli = Cli::parse_from([
        "citadel",
        "--root",
        dir.path().to_str().unwrap(),
        "--port",
        "8080",
        "--family",
        "ipv4",
        "--https",
        "--jail",
        "false",
        "--max-cpu",
        "5",
        "--log-format",
        "combined",
    ]);
    let cfg = ServerConfig::from_cli(cli).unwrap();

    assert!(cfg.standalone());
    assert!(!cfg.jail);
    assert!(cfg.https);
    assert_eq!(cfg.max_cpu, 5);
    assert_eq!(cfg.family, AddressFamily::Ipv4);
    assert_eq!(cfg.log_format, LogFormat::Combined);
    assert_eq!(cfg.root, dir.path().canonicalize().unwrap());
    assert_eq!(cfg.bind_addr(), Some("0.0.0.0:8080".parse::<SocketAddr>().unwrap()));
}

#[test]
fn test_config_ipv6_binds_unspecified() {
    let mut cfg = ServerConfig::new("/");
    cfg.port = Some(80);

    assert_eq!(cfg.bind_addr(), Some("[::]:80".parse::<SocketAddr>().unwrap()));
}

#[test]
fn test_config_rejects_missing_root() {
    let cli = Cli::parse_from(["citadel", "--root", "/definitely/not/here"]);

    assert!(ServerConfig::from_cli(cli).is_err());
}

#[test]
fn test_log_path_placeholders() {
    assert!(validate_log_path("/var/log/www-%Y%m%d.log").is_ok());
    assert!(validate_log_path("/var/log/www.log").is_ok());
    assert!(validate_log_path("/var/log/www-%Q.log").is_err());
    assert!(validate_log_path("").is_err());
}
