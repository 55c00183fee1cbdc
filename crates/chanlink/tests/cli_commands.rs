#![cfg(all(unix, feature = "cli"))]

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/chanlink-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn chanlink() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_chanlink"));
    cmd.env_remove("CHANLINK_ACTIVATION_TIMEOUT")
        .env_remove("CHANLINK_MAX_CONNECTIONS")
        .arg("--log-level")
        .arg("error");
    cmd
}

fn spawn_server(subcommand: &str, sock_path: &Path, extra: &[&str]) -> Child {
    let child = chanlink()
        .arg(subcommand)
        .arg(sock_path)
        .args(extra)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("server command should start");
    wait_for_socket(sock_path, Duration::from_secs(3));
    child
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let start = Instant::now();
    while !path.exists() {
        if start.elapsed() >= timeout {
            panic!("socket {} never appeared", path.display());
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn send(sock_path: &Path, message: &str, extra: &[&str]) -> Output {
    chanlink()
        .arg("--format")
        .arg("json")
        .arg("send")
        .arg(sock_path)
        .arg("--message")
        .arg(message)
        .args(extra)
        .output()
        .expect("send command should run")
}

fn stop(mut child: Child, dir: &Path) {
    let _ = child.kill();
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(dir);
}

#[test]
fn send_wait_prints_the_echo() {
    let dir = unique_temp_dir("echo");
    let sock_path = dir.join("echo.sock");
    let server = spawn_server("echo", &sock_path, &[]);

    let output = send(&sock_path, "ping", &["--wait", "--wait-timeout", "3s"]);
    assert!(
        output.status.success(),
        "send failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let line = stdout.lines().next().expect("one json line");
    let value: serde_json::Value = serde_json::from_str(line).expect("stdout should be json");
    assert_eq!(value["msg"], "ping");
    assert_eq!(value["channel_type"], "chanlink.chat");
    assert!(value["channel_id"].as_u64().is_some_and(|id| id >= 1));

    stop(server, &dir);
}

#[test]
fn listen_prints_requested_count_then_exits() {
    let dir = unique_temp_dir("listen");
    let sock_path = dir.join("listen.sock");
    let server = chanlink()
        .arg("--format")
        .arg("json")
        .arg("listen")
        .arg(&sock_path)
        .arg("--count")
        .arg("2")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("listen command should start");
    wait_for_socket(&sock_path, Duration::from_secs(3));

    for text in ["first", "second"] {
        let output = send(&sock_path, text, &[]);
        assert!(output.status.success(), "send {text} failed");
    }

    let output = server.wait_with_output().expect("listen should exit");
    assert!(output.status.success());
    let received: Vec<String> = String::from_utf8(output.stdout)
        .expect("stdout should be utf-8")
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("json line");
            value["msg"].as_str().expect("msg field").to_string()
        })
        .collect();
    assert_eq!(received, vec!["first", "second"]);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn info_lists_the_echo_server_channels() {
    let dir = unique_temp_dir("info");
    let sock_path = dir.join("echo.sock");
    let server = spawn_server("echo", &sock_path, &[]);

    let output = chanlink()
        .arg("--format")
        .arg("json")
        .arg("info")
        .arg(&sock_path)
        .output()
        .expect("info command should run");
    assert!(output.status.success());

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("info output should be json");
    assert_eq!(value["state"], "active");
    let channels = value["channels"].as_array().expect("channels array");
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0]["type_name"], "chanlink.chat");
    assert_eq!(channels[0]["bound"], false);

    stop(server, &dir);
}

#[test]
fn send_to_missing_socket_is_a_transport_error() {
    let dir = unique_temp_dir("missing");
    let output = send(&dir.join("nobody.sock"), "hello", &[]);
    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("connect failed"));
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn invalid_activation_timeout_is_a_usage_error() {
    let output = chanlink()
        .arg("--activation-timeout")
        .arg("soon")
        .arg("send")
        .arg("/tmp/chanlink-unused.sock")
        .arg("--message")
        .arg("x")
        .output()
        .expect("send command should run");
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn echo_refuses_a_socket_path_that_is_a_regular_file() {
    let dir = unique_temp_dir("not-a-socket");
    let path = dir.join("plain.txt");
    std::fs::write(&path, b"keep me").expect("file should be writable");

    let output = chanlink()
        .arg("echo")
        .arg(&path)
        .output()
        .expect("echo command should run");
    assert!(!output.status.success());
    assert_eq!(std::fs::read(&path).expect("file should survive"), b"keep me");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn version_prints_package_version() {
    let output = chanlink()
        .arg("version")
        .output()
        .expect("version command should run");
    assert!(output.status.success());
    assert_eq!(
        String::from_utf8_lossy(&output.stdout).trim(),
        format!("chanlink {}", env!("CARGO_PKG_VERSION"))
    );
}
