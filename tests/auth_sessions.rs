use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn login_logout_lifecycle() {
    let workspace = temp_dir("schoold-auth");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.seedAdmin",
        json!({
            "email": "head@school.test",
            "password": "s3cret-pw",
            "firstName": "Head",
            "lastName": "Master"
        }),
    );

    // Seeding twice is refused.
    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "setup.seedAdmin",
        json!({
            "email": "other@school.test",
            "password": "s3cret-pw",
            "firstName": "Other",
            "lastName": "Admin"
        }),
    );
    assert_eq!(error_code(&resp), "already_initialized");

    // Wrong password and unknown email share one error code.
    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "auth.login",
        json!({ "email": "head@school.test", "password": "wrong" }),
    );
    assert_eq!(error_code(&resp), "invalid_credentials");
    let resp = request(
        &mut stdin,
        &mut reader,
        "5",
        "auth.login",
        json!({ "email": "nobody@school.test", "password": "s3cret-pw" }),
    );
    assert_eq!(error_code(&resp), "invalid_credentials");

    let login = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "auth.login",
        json!({ "email": "head@school.test", "password": "s3cret-pw" }),
    );
    let token = login
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();
    assert_eq!(
        login.pointer("/user/role").and_then(|v| v.as_str()),
        Some("admin")
    );
    assert!(login.pointer("/user/studentProfile").map(|v| v.is_null()).unwrap_or(true));

    let me = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "auth.me",
        json!({ "token": token }),
    );
    assert_eq!(
        me.pointer("/user/email").and_then(|v| v.as_str()),
        Some("head@school.test")
    );
    assert_eq!(
        me.pointer("/user/firstName").and_then(|v| v.as_str()),
        Some("Head")
    );

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "auth.logout",
        json!({ "token": token }),
    );
    assert_eq!(out.get("loggedOut").and_then(|v| v.as_bool()), Some(true));

    // The invalidated token no longer resolves.
    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "auth.me",
        json!({ "token": token }),
    );
    assert_eq!(error_code(&resp), "unauthorized");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn expired_session_is_rejected() {
    let workspace = temp_dir("schoold-auth-expiry");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "setup.seedAdmin",
        json!({
            "email": "head@school.test",
            "password": "s3cret-pw",
            "firstName": "Head",
            "lastName": "Master"
        }),
    );
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "head@school.test", "password": "s3cret-pw" }),
    );
    let token = login
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();

    // Age the session row past its lifetime.
    let conn = Connection::open(workspace.join("school.sqlite3")).expect("open db");
    let changed = conn
        .execute(
            "UPDATE sessions SET expires_at = '2000-01-01T00:00:00+00:00' WHERE token = ?",
            [&token],
        )
        .expect("age session");
    assert_eq!(changed, 1);

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "auth.me",
        json!({ "token": token }),
    );
    assert_eq!(error_code(&resp), "unauthorized");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn seed_admin_validates_fields() {
    let workspace = temp_dir("schoold-auth-validate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "setup.seedAdmin",
        json!({
            "email": "not-an-email",
            "password": "s3cret-pw",
            "firstName": "Head",
            "lastName": "Master"
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "setup.seedAdmin",
        json!({
            "email": "head@school.test",
            "password": "short",
            "firstName": "Head",
            "lastName": "Master"
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
