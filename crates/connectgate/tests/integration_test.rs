//! CLI integration tests for `connectgate`.
//!
//! These tests invoke the compiled `connectgate` binary as a subprocess and
//! verify its behavior end-to-end. Each test runs with `HOME` and
//! `XDG_CONFIG_HOME` pointed at an isolated temp directory so the user's
//! global config never leaks in.
//!
//! # Running
//!
//! ```bash
//! cargo test --test integration_test
//! ```

#![allow(clippy::unwrap_used)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

// ============================================================================
// Infrastructure
// ============================================================================

/// Path to the compiled `connectgate` binary, injected by Cargo at compile time.
const CONNECTGATE: &str = env!("CARGO_BIN_EXE_connectgate");

const CONNECTGATE_VARS: &[&str] = &[
    "CONNECTGATE_LOG",
    "CONNECTGATE_BIND_ADDR",
    "CONNECTGATE_TLS_CERT",
    "CONNECTGATE_TLS_KEY",
    "CONNECTGATE_PROXY_AGENT",
    "CONNECTGATE_USERNAME",
    "CONNECTGATE_PASSWORD",
    "CONNECTGATE_REALM",
    "CONNECTGATE_DOH_ENABLED",
    "CONNECTGATE_DOH_URL",
    "CONNECTGATE_DOH_TIMEOUT_MS",
    "CONNECTGATE_DNS_CACHE_TTL_SECS",
    "CONNECTGATE_BLOCK_PRIVATE",
    "CONNECTGATE_MAX_TUNNELS_PER_DEST",
    "CONNECTGATE_CONNECT_TIMEOUT_SECS",
    "CONNECTGATE_IDLE_TIMEOUT_SECS",
];

/// Invoke `connectgate` in `home` with extra environment variables.
fn run_connectgate_with_env(home: &Path, args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut command = Command::new(CONNECTGATE);
    command
        .args(args)
        .current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"));
    for var in CONNECTGATE_VARS {
        command.env_remove(var);
    }
    command.envs(env.iter().copied());
    command
        .output()
        .unwrap_or_else(|e| panic!("Failed to spawn connectgate binary: {e}"))
}

fn run_connectgate(home: &Path, args: &[&str]) -> Output {
    run_connectgate_with_env(home, args, &[])
}

/// Assert exit-success and return stdout as a String.
#[track_caller]
fn expect_success(out: &Output) -> String {
    assert!(
        out.status.success(),
        "connectgate exited {:?}\nstdout: {}\nstderr: {}",
        out.status.code(),
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// Assert that the command exited with a non-zero status and return stderr.
#[track_caller]
fn expect_failure(out: &Output) -> String {
    assert!(
        !out.status.success(),
        "Expected connectgate to fail but it succeeded\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr),
    );
    String::from_utf8_lossy(&out.stderr).into_owned()
}

/// Write `contents` to `<dir>/connectgate.toml` and return the path as a String.
fn write_config(dir: &TempDir, contents: &str) -> String {
    let path = dir.path().join("connectgate.toml");
    fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

// ============================================================================
// config init
// ============================================================================

#[test]
fn test_config_init_creates_file() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("conf").join("connectgate.toml");
    let path_str = path.to_string_lossy().into_owned();

    let stdout = expect_success(&run_connectgate(
        home.path(),
        &["config", "init", "--path", &path_str],
    ));
    assert!(stdout.contains("Created config"), "{stdout}");

    let contents = fs::read_to_string(&path).unwrap();
    assert!(contents.contains("[server]"), "{contents}");
    assert!(contents.contains("bind_addr = \"0.0.0.0:8080\""), "{contents}");
    assert!(contents.contains("max_tunnels_per_destination = 32"), "{contents}");
    assert!(!contents.contains("password"), "{contents}");
}

#[test]
fn test_config_init_fails_if_already_exists() {
    let home = TempDir::new().unwrap();
    let path = write_config(&home, "[policy]\nblock_private = false\n");

    let stderr = expect_failure(&run_connectgate(
        home.path(),
        &["config", "init", "--path", &path],
    ));
    assert!(stderr.contains("already exists"), "{stderr}");
    assert_eq!(
        fs::read_to_string(&path).unwrap(),
        "[policy]\nblock_private = false\n"
    );
}

#[test]
fn test_config_init_output_passes_check() {
    let home = TempDir::new().unwrap();
    let path = home.path().join("connectgate.toml");
    let path_str = path.to_string_lossy().into_owned();
    expect_success(&run_connectgate(
        home.path(),
        &["config", "init", "--path", &path_str],
    ));

    let stdout = expect_success(&run_connectgate(
        home.path(),
        &["check", "--config", &path_str],
    ));
    assert!(stdout.contains("Config valid: OK"), "{stdout}");
}

// ============================================================================
// config show
// ============================================================================

#[test]
fn test_config_show_without_config_file_is_empty_toml() {
    let home = TempDir::new().unwrap();
    let stdout = expect_success(&run_connectgate(home.path(), &["config", "show"]));
    assert!(!stdout.contains("bind_addr"), "{stdout}");
}

#[test]
fn test_config_show_json_is_valid() {
    let home = TempDir::new().unwrap();
    let path = write_config(&home, "[dns]\ncache_ttl_secs = 15\n");
    let stdout = expect_success(&run_connectgate(
        home.path(),
        &["config", "show", "--config", &path, "--format", "json"],
    ));
    let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(json["dns"]["cache_ttl_secs"], 15);
    assert!(json.get("policy").is_some());
}

#[test]
fn test_config_show_redacts_password() {
    let home = TempDir::new().unwrap();
    let path = write_config(
        &home,
        "[auth]\nusername = \"alice\"\npassword = \"hunter2\"\n",
    );
    let stdout = expect_success(&run_connectgate(
        home.path(),
        &["config", "show", "--config", &path],
    ));
    assert!(stdout.contains("alice"), "{stdout}");
    assert!(!stdout.contains("hunter2"), "{stdout}");
    assert!(stdout.contains("<redacted>"), "{stdout}");
}

#[test]
fn test_config_show_applies_environment_over_file() {
    let home = TempDir::new().unwrap();
    let path = write_config(&home, "[policy]\nmax_tunnels_per_destination = 8\n");
    let stdout = expect_success(&run_connectgate_with_env(
        home.path(),
        &["config", "show", "--config", &path],
        &[("CONNECTGATE_MAX_TUNNELS_PER_DEST", "3")],
    ));
    assert!(stdout.contains("max_tunnels_per_destination = 3"), "{stdout}");
}

#[test]
fn test_config_show_rejects_malformed_explicit_file() {
    let home = TempDir::new().unwrap();
    let path = write_config(&home, "not valid toml :::");
    let stderr = expect_failure(&run_connectgate(
        home.path(),
        &["config", "show", "--config", &path],
    ));
    assert!(stderr.starts_with("error:"), "{stderr}");
}

#[test]
fn test_config_show_rejects_bad_environment_value() {
    let home = TempDir::new().unwrap();
    let stderr = expect_failure(&run_connectgate_with_env(
        home.path(),
        &["config", "show"],
        &[("CONNECTGATE_BLOCK_PRIVATE", "maybe")],
    ));
    assert!(stderr.contains("CONNECTGATE_BLOCK_PRIVATE"), "{stderr}");
}

// ============================================================================
// check
// ============================================================================

#[test]
fn test_check_reports_policy() {
    let home = TempDir::new().unwrap();
    let stdout = expect_success(&run_connectgate(home.path(), &["check"]));
    assert!(stdout.contains("Config loaded: OK"), "{stdout}");
    assert!(stdout.contains("TLS: disabled"), "{stdout}");
    assert!(stdout.contains("DoH endpoint: OK"), "{stdout}");
    assert!(stdout.contains("Listen address: 0.0.0.0:8080"), "{stdout}");
    assert!(stdout.contains("Authentication: open"), "{stdout}");
}

#[test]
fn test_check_fails_on_incomplete_credentials() {
    let home = TempDir::new().unwrap();
    let path = write_config(&home, "[auth]\nusername = \"alice\"\n");
    let out = run_connectgate(home.path(), &["check", "--config", &path]);
    expect_failure(&out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Config valid: FAIL"), "{stdout}");
}

#[test]
fn test_check_fails_on_missing_tls_material() {
    let home = TempDir::new().unwrap();
    let path = write_config(
        &home,
        "[server]\ntls_cert_path = \"/nonexistent/cert.pem\"\ntls_key_path = \"/nonexistent/key.pem\"\n",
    );
    let out = run_connectgate(home.path(), &["check", "--config", &path]);
    expect_failure(&out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("TLS: FAIL"), "{stdout}");
}

#[test]
fn test_check_fails_on_bad_doh_url() {
    let home = TempDir::new().unwrap();
    let out = run_connectgate_with_env(
        home.path(),
        &["check"],
        &[("CONNECTGATE_DOH_URL", "ftp://dns.example/query")],
    );
    expect_failure(&out);
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("DoH endpoint: FAIL"), "{stdout}");
}

// ============================================================================
// serve
// ============================================================================

#[test]
fn test_serve_refuses_incomplete_credentials() {
    let home = TempDir::new().unwrap();
    let stderr = expect_failure(&run_connectgate_with_env(
        home.path(),
        &["serve", "--bind", "127.0.0.1:0"],
        &[("CONNECTGATE_PASSWORD", "orphan")],
    ));
    assert!(stderr.contains("must be set together"), "{stderr}");
}
