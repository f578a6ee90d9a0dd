use chrono::{TimeZone, Utc};
use citadel::access_log::{AccessLog, LogEntry};
use citadel::config::LogFormat;

fn entry() -> LogEntry {
    LogEntry {
        timestamp: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
        client: "192.0.2.1".to_string(),
        method: "GET".to_string(),
        url: "/index.html?a=1".to_string(),
        protocol: "HTTP/1.1".to_string(),
        host: Some("example.com".to_string()),
        referer: None,
        user_agent: Some("curl/8.0 \"test\"".to_string()),
        remote_user: Some("alice".to_string()),
        status: 200,
        bytes_in: 80,
        bytes_out: 1234,
        cpu_ms: 3,
        wall_us: 1500,
        outcome: "ok".to_string(),
    }
}

#[test]
fn test_combined_format() {
    assert_eq!(
        entry().to_combined(),
        "192.0.2.1 - alice [09/Mar/2024:14:05:07 +0000] \"GET /index.html?a=1 HTTP/1.1\" 200 1234 \"-\" \"curl/8.0 \\\"test\\\"\""
    );
}

#[test]
fn test_structured_format() {
    let value: serde_json::Value = serde_json::from_str(&entry().render(LogFormat::Structured)).unwrap();

    assert_eq!(value["client"], "192.0.2.1");
    assert_eq!(value["status"], 200);
    assert_eq!(value["bytes_out"], 1234);
    assert_eq!(value["referer"], serde_json::Value::Null);
    assert_eq!(value["outcome"], "ok");
    assert_eq!(value["timestamp"], "2024-03-09T14:05:07Z");
}

#[tokio::test]
async fn test_log_path_is_expanded_per_entry() {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("www-%Y%m%d.log");
    let log = AccessLog::new(Some(template.to_string_lossy().into_owned()), LogFormat::Combined);

    log.write(&entry()).await;
    log.write(&entry()).await;

    let text = std::fs::read_to_string(dir.path().join("www-20240309.log")).unwrap();
    assert_eq!(text.lines().count(), 2);
    assert!(text.starts_with("192.0.2.1 - alice "));
}

#[tokio::test]
async fn test_entries_are_on_disk_in_order_once_written() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access.log");
    let log = AccessLog::new(Some(path.to_string_lossy().into_owned()), LogFormat::Structured);

    for status in [200u16, 304, 404, 500] {
        let mut e = entry();
        e.status = status;
        log.write(&e).await;
        let written = std::fs::read_to_string(&path).unwrap();
        let last: serde_json::Value = serde_json::from_str(written.lines().last().unwrap()).unwrap();
        assert_eq!(last["status"], status);
    }

    let text = std::fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 4);
}
