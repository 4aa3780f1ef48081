//! Integration tests for the `acp-adapter` binary.

use std::process::Command;

use serde_json::{json, Value};

const PING_AGENT: &str = r#"read _hdr; echo '{"method":"status","params":{"state":"busy"}}'; printf 'Content-Length: 31\r\n\r\n{"id":1,"result":{"pong":true}}'; exec sleep 30"#;

fn adapter_bin() -> Command {
    Command::new(env!("CARGO_BIN_EXE_acp-adapter"))
}

#[test]
fn call_prints_notifications_then_result() {
    let output = adapter_bin()
        .args(["call", "--method", "ping", "--", "sh", "-c", PING_AGENT])
        .env("RUST_LOG", "off")
        .output()
        .expect("run acp-adapter");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let stdout = String::from_utf8(output.stdout).expect("utf-8 stdout");
    let (first_line, rest) = stdout.split_once('\n').expect("notification line");

    let notification: Value = serde_json::from_str(first_line).expect("notification is JSON");
    assert_eq!(
        notification,
        json!({ "method": "status", "params": { "state": "busy" } })
    );

    let result: Value = serde_json::from_str(rest).expect("result is JSON");
    assert_eq!(result, json!({ "pong": true }));
}

#[test]
fn params_are_forwarded() {
    let agent = r#"IFS= read -r hdr; len=${hdr#*: }; len=${len%?}; IFS= read -r _b; body=$(dd bs=1 count="$len" 2>/dev/null); printf '{"id":1,"result":%s}\n' "$body"; exec sleep 30"#;
    let output = adapter_bin()
        .args([
            "call",
            "--method",
            "session/new",
            "--params",
            r#"{"cwd":"/work"}"#,
            "--",
            "sh",
            "-c",
            agent,
        ])
        .env("RUST_LOG", "off")
        .output()
        .expect("run acp-adapter");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let result: Value = serde_json::from_slice(&output.stdout).expect("result is JSON");
    assert_eq!(result["method"], json!("session/new"));
    assert_eq!(result["params"], json!({ "cwd": "/work" }));
}

#[test]
fn agent_error_fails_the_command() {
    let agent = r#"read _hdr; echo '{"id":1,"error":{"code":-32601,"message":"no such method"}}'; exec sleep 30"#;
    let output = adapter_bin()
        .args(["call", "--method", "missing", "--", "sh", "-c", agent])
        .env("RUST_LOG", "off")
        .output()
        .expect("run acp-adapter");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no such method"), "stderr: {stderr}");
}

#[test]
fn missing_agent_command_is_rejected() {
    let output = adapter_bin()
        .args(["call", "--method", "ping"])
        .env("RUST_LOG", "off")
        .output()
        .expect("run acp-adapter");

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}

#[test]
fn invalid_params_are_rejected() {
    let output = adapter_bin()
        .args(["call", "--method", "ping", "--params", "{oops", "--", "sh", "-c", "exit 0"])
        .env("RUST_LOG", "off")
        .output()
        .expect("run acp-adapter");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--params"), "stderr: {stderr}");
}

#[test]
fn config_file_supplies_the_agent() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    std::io::Write::write_all(
        &mut file,
        format!("command = \"sh\"\nargs = [\"-c\", {}]\n", toml_string(PING_AGENT)).as_bytes(),
    )
    .expect("write config");

    let output = adapter_bin()
        .arg("--config")
        .arg(file.path())
        .args(["call", "--method", "ping"])
        .env("RUST_LOG", "off")
        .output()
        .expect("run acp-adapter");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8(output.stdout).expect("utf-8 stdout");
    assert!(stdout.contains("\"pong\": true"), "stdout: {stdout}");
}

#[test]
fn notify_sends_notification_and_exits() {
    let dir = tempfile::tempdir().expect("temp dir");
    let sink = dir.path().join("received");
    // TERM is ignored so the agent only ends once its stdin is closed.
    let agent = r#"trap '' TERM; cat > "$ACP_SINK""#;

    let output = adapter_bin()
        .args(["--env"])
        .arg(format!("ACP_SINK={}", sink.display()))
        .args(["notify", "--method", "session/cancel", "--", "sh", "-c", agent])
        .env("RUST_LOG", "off")
        .output()
        .expect("run acp-adapter");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(output.stdout.is_empty(), "a notification has no result to print");

    let received = std::fs::read_to_string(&sink).expect("agent wrote what it received");
    assert!(
        received.starts_with("Content-Length: "),
        "frame is header-prefixed: {received:?}"
    );
    assert!(received.ends_with(r#""method":"session/cancel","params":{}}"#), "got {received:?}");
}

#[test]
fn sigterm_while_waiting_stops_agent_and_exits_cleanly() {
    use std::io::{BufRead, BufReader};
    use std::process::Stdio;
    use std::time::{Duration, Instant};

    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let agent = r#"read _hdr; echo '{"method":"status","params":{"state":"busy"}}'; exec sleep 30"#;
    let mut child = adapter_bin()
        .args(["call", "--method", "session/prompt", "--", "sh", "-c", agent])
        .env("RUST_LOG", "off")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn acp-adapter");

    let mut stdout = BufReader::new(child.stdout.take().expect("piped stdout"));
    let mut first_line = String::new();
    stdout.read_line(&mut first_line).expect("notification line");
    assert!(first_line.contains("\"status\""), "got {first_line:?}");
    std::thread::sleep(Duration::from_millis(100));

    let pid = Pid::from_raw(i32::try_from(child.id()).expect("pid fits in i32"));
    kill(pid, Signal::SIGTERM).expect("send SIGTERM");

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().expect("poll acp-adapter") {
            break status;
        }
        assert!(Instant::now() < deadline, "acp-adapter did not exit after SIGTERM");
        std::thread::sleep(Duration::from_millis(20));
    };

    assert!(status.success(), "status: {status}");
    let mut rest = String::new();
    std::io::Read::read_to_string(&mut stdout, &mut rest).expect("drain stdout");
    assert!(rest.is_empty(), "no result is printed after a signal: {rest:?}");
}

/// Render `s` as a TOML literal string.
fn toml_string(s: &str) -> String {
    format!("'''{s}'''")
}
