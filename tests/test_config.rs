use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use outpost::config::Config;

// Env-touching tests must not interleave.
static TEST_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn test_config_defaults() {
    let _lock = TEST_LOCK.lock().unwrap();
    std::env::remove_var("LISTEN");

    let cfg = Config::load();
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");
    assert_eq!(cfg.limits.max_request_line_size, 8192);
    assert_eq!(cfg.limits.max_header_count, 100);
    assert_eq!(cfg.limits.client_max_header_size, 8192);
    assert_eq!(cfg.limits.client_max_body_size, 10 * 1024 * 1024);
    assert_eq!(cfg.buffer.max_in_memory_size, 64 * 1024);
    assert_eq!(cfg.buffer.temp_dir, PathBuf::from("/tmp"));
    assert_eq!(cfg.session.file, PathBuf::from("sessions.bin"));
    assert_eq!(cfg.request_timeout(), Duration::from_secs(30));
}

#[test]
fn test_config_listen_env_override() {
    let _lock = TEST_LOCK.lock().unwrap();
    std::env::set_var("LISTEN", "0.0.0.0:3000");

    let cfg = Config::load();
    assert_eq!(cfg.server.listen_addr, "0.0.0.0:3000");

    std::env::remove_var("LISTEN");
}

#[test]
fn test_config_from_yaml() {
    let _lock = TEST_LOCK.lock().unwrap();

    let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
  request_timeout_secs: 5

limits:
  max_request_line_size: 1024
  max_header_count: 32
  client_max_header_size: 2048
  client_max_body_size: 4096

buffer:
  max_in_memory_size: 512
  temp_dir: "/var/tmp"

session:
  file: "state/sessions.bin"
"#;

    let path = std::env::temp_dir().join(format!("outpost_cfg_{}.yaml", std::process::id()));
    fs::write(&path, yaml).unwrap();

    let cfg = Config::load_from_file(&path).unwrap();
    assert_eq!(cfg.server.listen_addr, "0.0.0.0:9000");
    assert_eq!(cfg.request_timeout(), Duration::from_secs(5));
    assert_eq!(cfg.limits.max_request_line_size, 1024);
    assert_eq!(cfg.limits.max_header_count, 32);
    assert_eq!(cfg.limits.client_max_header_size, 2048);
    assert_eq!(cfg.limits.client_max_body_size, 4096);
    assert_eq!(cfg.buffer.max_in_memory_size, 512);
    assert_eq!(cfg.buffer.temp_dir, PathBuf::from("/var/tmp"));
    assert_eq!(cfg.session.file, PathBuf::from("state/sessions.bin"));

    fs::remove_file(&path).unwrap();
}

#[test]
fn test_config_partial_yaml_falls_back_to_defaults() {
    let _lock = TEST_LOCK.lock().unwrap();

    let yaml = r#"
limits:
  max_header_count: 7
"#;

    let path = std::env::temp_dir().join(format!("outpost_cfg_partial_{}.yaml", std::process::id()));
    fs::write(&path, yaml).unwrap();

    let cfg = Config::load_from_file(&path).unwrap();
    assert_eq!(cfg.limits.max_header_count, 7);
    assert_eq!(cfg.limits.max_request_line_size, 8192);
    assert_eq!(cfg.server.listen_addr, "127.0.0.1:8080");

    fs::remove_file(&path).unwrap();
}

#[test]
fn test_config_missing_file_errors() {
    let result = Config::load_from_file("definitely/not/here.yaml");
    assert!(result.is_err());
}

#[test]
fn test_config_clone() {
    let cfg = Config::default();
    let copy = cfg.clone();
    assert_eq!(cfg.server.listen_addr, copy.server.listen_addr);
    assert_eq!(cfg.limits.max_header_count, copy.limits.max_header_count);
}
