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

struct School {
    token: String,
    subject_id: String,
    student_id: String,
}

fn seed_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &std::path::Path,
) -> School {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s2",
        "setup.seedAdmin",
        json!({
            "email": "head@school.test",
            "password": "s3cret-pw",
            "firstName": "Head",
            "lastName": "Master"
        }),
    );
    let login = request_ok(
        stdin,
        reader,
        "s3",
        "auth.login",
        json!({ "email": "head@school.test", "password": "s3cret-pw" }),
    );
    let token = login
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();

    let class = request_ok(
        stdin,
        reader,
        "s4",
        "classes.create",
        json!({
            "token": token,
            "name": "Form 1A",
            "level": "Form 1",
            "academicYear": "2024-2025"
        }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let subject = request_ok(
        stdin,
        reader,
        "s5",
        "subjects.create",
        json!({
            "token": token,
            "name": "Mathematics",
            "code": "MATH",
            "coefficient": 5,
            "classId": class_id
        }),
    );
    let subject_id = subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let student = request_ok(
        stdin,
        reader,
        "s6",
        "students.create",
        json!({
            "token": token,
            "firstName": "Ama",
            "lastName": "Ndoum",
            "email": "ama@school.test",
            "password": "pupil-pw",
            "matricule": "STU-001",
            "classId": class_id,
            "dateOfBirth": "2010-03-14",
            "placeOfBirth": "Douala",
            "gender": "Female"
        }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    School {
        token,
        subject_id,
        student_id,
    }
}

#[test]
fn recording_same_key_twice_updates_in_place() {
    let workspace = temp_dir("schoold-grades-upsert");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader, &workspace);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "subjectId": school.subject_id,
            "term": 1,
            "sequence": 1,
            "score": 12.0
        }),
    );
    assert_eq!(first.get("created").and_then(|v| v.as_bool()), Some(true));
    let first_id = first
        .get("gradeId")
        .and_then(|v| v.as_str())
        .expect("gradeId")
        .to_string();
    assert_eq!(first.get("maxScore").and_then(|v| v.as_f64()), Some(20.0));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "subjectId": school.subject_id,
            "term": 1,
            "sequence": 1,
            "score": 15.5,
            "comment": "much improved"
        }),
    );
    assert_eq!(second.get("created").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        second.get("gradeId").and_then(|v| v.as_str()),
        Some(first_id.as_str())
    );

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "grades.list",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "term": 1,
            "sequence": 1
        }),
    );
    let grades = list.get("grades").and_then(|v| v.as_array()).expect("grades");
    assert_eq!(grades.len(), 1, "upsert must not duplicate the key");
    assert_eq!(grades[0].get("score").and_then(|v| v.as_f64()), Some(15.5));
    assert_eq!(
        grades[0].get("comment").and_then(|v| v.as_str()),
        Some("much improved")
    );

    // A different sequence is a separate row.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "subjectId": school.subject_id,
            "term": 1,
            "sequence": 2,
            "score": 9.0
        }),
    );
    let list = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.list",
        json!({ "token": school.token, "studentId": school.student_id, "term": 1 }),
    );
    let grades = list.get("grades").and_then(|v| v.as_array()).expect("grades");
    assert_eq!(grades.len(), 2);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_score_input_is_rejected_not_coerced() {
    let workspace = temp_dir("schoold-grades-validate");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader, &workspace);

    // A string score must fail loudly; silently coercing it to 0 would be
    // indistinguishable from an earned zero.
    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "subjectId": school.subject_id,
            "term": 1,
            "sequence": 1,
            "score": "twelve"
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "subjectId": school.subject_id,
            "term": 1,
            "sequence": 1,
            "score": -3.0
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "subjectId": school.subject_id,
            "term": 1,
            "sequence": 1,
            "score": 12.0,
            "maxScore": 0.0
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "subjectId": school.subject_id,
            "term": 4,
            "sequence": 1,
            "score": 12.0
        }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    // Nothing got stored along the way.
    let list = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.list",
        json!({ "token": school.token, "studentId": school.student_id }),
    );
    assert_eq!(
        list.get("grades").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_student_or_subject_is_not_found() {
    let workspace = temp_dir("schoold-grades-refs");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": "missing-student",
            "subjectId": school.subject_id,
            "term": 1,
            "sequence": 1,
            "score": 10.0
        }),
    );
    assert_eq!(error_code(&resp), "not_found");

    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "grades.record",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "subjectId": "missing-subject",
            "term": 1,
            "sequence": 1,
            "score": 10.0
        }),
    );
    assert_eq!(error_code(&resp), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
