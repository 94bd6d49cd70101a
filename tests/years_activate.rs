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

fn active_years(list: &serde_json::Value) -> Vec<String> {
    list.get("academicYears")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter(|y| y.get("isActive").and_then(|v| v.as_bool()) == Some(true))
                .filter_map(|y| y.get("year").and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn activation_is_exclusive() {
    let workspace = temp_dir("schoold-years");
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

    let mut year_ids = Vec::new();
    for (id, label) in [("4", "2023-2024"), ("5", "2024-2025")] {
        let year = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "years.create",
            json!({ "token": token, "year": label }),
        );
        year_ids.push(
            year.get("academicYearId")
                .and_then(|v| v.as_str())
                .expect("academicYearId")
                .to_string(),
        );
    }

    // Nothing active until an explicit activation.
    let list = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "years.list",
        json!({ "token": token }),
    );
    assert!(active_years(&list).is_empty());

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "years.activate",
        json!({ "token": token, "academicYearId": year_ids[0] }),
    );
    let list = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "years.list",
        json!({ "token": token }),
    );
    assert_eq!(active_years(&list), vec!["2023-2024".to_string()]);

    // Switching years flips the previous one off.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "years.activate",
        json!({ "token": token, "academicYearId": year_ids[1] }),
    );
    let list = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "years.list",
        json!({ "token": token }),
    );
    assert_eq!(active_years(&list), vec!["2024-2025".to_string()]);

    let resp = request(
        &mut stdin,
        &mut reader,
        "11",
        "years.activate",
        json!({ "token": token, "academicYearId": "missing-year" }),
    );
    assert_eq!(error_code(&resp), "not_found");

    // Duplicate labels are refused.
    let resp = request(
        &mut stdin,
        &mut reader,
        "12",
        "years.create",
        json!({ "token": token, "year": "2024-2025" }),
    );
    assert_eq!(error_code(&resp), "conflict");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
