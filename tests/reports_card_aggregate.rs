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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

struct School {
    token: String,
    class_id: String,
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
            "name": "Form 2B",
            "level": "Form 2",
            "academicYear": "2024-2025"
        }),
    );
    let class_id = class
        .get("classId")
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();

    let student = request_ok(
        stdin,
        reader,
        "s5",
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
        class_id,
        student_id,
    }
}

fn create_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    token: &str,
    class_id: &str,
    name: &str,
    code: &str,
    coefficient: f64,
) -> String {
    let subject = request_ok(
        stdin,
        reader,
        id,
        "subjects.create",
        json!({
            "token": token,
            "name": name,
            "code": code,
            "coefficient": coefficient,
            "classId": class_id
        }),
    );
    subject
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string()
}

fn record_grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    token: &str,
    student_id: &str,
    subject_id: &str,
    term: i64,
    sequence: i64,
    score: f64,
    max_score: f64,
) {
    let _ = request_ok(
        stdin,
        reader,
        id,
        "grades.record",
        json!({
            "token": token,
            "studentId": student_id,
            "subjectId": subject_id,
            "term": term,
            "sequence": sequence,
            "score": score,
            "maxScore": max_score
        }),
    );
}

#[test]
fn report_card_weights_by_coefficient_and_classifies() {
    let workspace = temp_dir("schoold-report-card");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader, &workspace);

    let math = create_subject(
        &mut stdin, &mut reader, "c1", &school.token, &school.class_id,
        "Mathematics", "MATH", 5.0,
    );
    let english = create_subject(
        &mut stdin, &mut reader, "c2", &school.token, &school.class_id,
        "English", "ENG", 3.0,
    );

    // 18*5 + 12*3 = 126 over weight 8 -> 15.75 -> "B"
    record_grade(
        &mut stdin, &mut reader, "g1", &school.token, &school.student_id, &math, 1, 1, 18.0, 20.0,
    );
    record_grade(
        &mut stdin, &mut reader, "g2", &school.token, &school.student_id, &english, 1, 1, 12.0,
        20.0,
    );

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.card",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "term": 1,
            "sequence": 1
        }),
    );
    assert_eq!(
        out.pointer("/report/aggregate/weightedAverage")
            .and_then(|v| v.as_f64()),
        Some(15.75)
    );
    assert_eq!(
        out.pointer("/report/aggregate/letterGrade")
            .and_then(|v| v.as_str()),
        Some("B")
    );
    assert_eq!(
        out.pointer("/report/aggregate/subjectCount")
            .and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(
        out.pointer("/report/student/matricule")
            .and_then(|v| v.as_str()),
        Some("STU-001")
    );
    assert_eq!(
        out.pointer("/report/class/name").and_then(|v| v.as_str()),
        Some("Form 2B")
    );
    let rows = out
        .pointer("/report/grades")
        .and_then(|v| v.as_array())
        .expect("grade rows");
    assert_eq!(rows.len(), 2);
    // Rows are ordered by subject name.
    assert_eq!(
        rows[0].get("subjectCode").and_then(|v| v.as_str()),
        Some("ENG")
    );
    assert_eq!(
        rows[1].get("coefficient").and_then(|v| v.as_f64()),
        Some(5.0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn normalization_reaches_band_boundary() {
    let workspace = temp_dir("schoold-report-boundary");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader, &workspace);

    let sport = create_subject(
        &mut stdin, &mut reader, "c1", &school.token, &school.class_id, "Sport", "SPT", 4.0,
    );
    // 8/10 normalizes to exactly 16.0 -> "A".
    record_grade(
        &mut stdin, &mut reader, "g1", &school.token, &school.student_id, &sport, 2, 1, 8.0, 10.0,
    );

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.card",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "term": 2,
            "sequence": 1
        }),
    );
    assert_eq!(
        out.pointer("/report/aggregate/weightedAverage")
            .and_then(|v| v.as_f64()),
        Some(16.0)
    );
    assert_eq!(
        out.pointer("/report/aggregate/letterGrade")
            .and_then(|v| v.as_str()),
        Some("A")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn empty_period_yields_undefined_aggregate_not_error() {
    let workspace = temp_dir("schoold-report-empty");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader, &workspace);

    let out = request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "reports.card",
        json!({
            "token": school.token,
            "studentId": school.student_id,
            "term": 3,
            "sequence": 2
        }),
    );
    // "No grades yet" is a displayable document, not a failure, and the
    // undefined average is null rather than 0.
    assert!(out
        .pointer("/report/aggregate/weightedAverage")
        .expect("field present")
        .is_null());
    assert!(out
        .pointer("/report/aggregate/letterGrade")
        .expect("field present")
        .is_null());
    assert_eq!(
        out.pointer("/report/aggregate/subjectCount")
            .and_then(|v| v.as_u64()),
        Some(0)
    );
    assert_eq!(
        out.pointer("/report/grades")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
