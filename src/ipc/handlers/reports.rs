use crate::auth::Role;
use crate::calc::{self, CalcError, ClassInfo, ReportingPeriod, StudentIdentity};
use crate::export;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    can_view_student, db_conn, forbidden_student, optional_str, require_role, required_period,
    required_str, session_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::PathBuf;

fn calc_err(req: &Request, e: CalcError) -> serde_json::Value {
    err(
        &req.id,
        &e.code,
        e.message,
        e.details.map(|d| json!(d)).or(None),
    )
}

/// Identity block shared by report cards and transcripts: the student row
/// joined with its user account and class. The academic year prefers the
/// student's enrollment year and falls back to the class label.
fn student_context(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<(StudentIdentity, ClassInfo, String)>, CalcError> {
    conn.query_row(
        "SELECT s.id, u.first_name, u.last_name, s.matricule, s.date_of_birth, s.place_of_birth,
                c.id, c.name, c.level, c.academic_year, ay.year
         FROM students s
         JOIN users u ON u.id = s.user_id
         JOIN classes c ON c.id = s.class_id
         LEFT JOIN academic_years ay ON ay.id = s.academic_year_id
         WHERE s.id = ?",
        [student_id],
        |r| {
            let student = StudentIdentity {
                id: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                matricule: r.get(3)?,
                date_of_birth: r.get(4)?,
                place_of_birth: r.get(5)?,
            };
            let class_year: String = r.get(9)?;
            let enrollment_year: Option<String> = r.get(10)?;
            let class = ClassInfo {
                id: r.get(6)?,
                name: r.get(7)?,
                level: r.get(8)?,
                academic_year: class_year.clone(),
            };
            Ok((student, class, enrollment_year.unwrap_or(class_year)))
        },
    )
    .optional()
    .map_err(|e| CalcError::new("db_query_failed", e.to_string()))
}

fn report_for_student(
    conn: &Connection,
    student_id: &str,
    period: ReportingPeriod,
) -> Result<Option<calc::ReportDocument>, CalcError> {
    let Some((student, class, _)) = student_context(conn, student_id)? else {
        return Ok(None);
    };
    let records = calc::load_period_records(conn, student_id, period)?;
    Ok(Some(calc::build_report_card(student, class, period, records)))
}

fn transcript_for_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<calc::TranscriptDocument>, CalcError> {
    let Some((student, class, academic_year)) = student_context(conn, student_id)? else {
        return Ok(None);
    };
    let records = calc::load_all_records(conn, student_id)?;
    Ok(Some(calc::build_transcript(
        student,
        class,
        academic_year,
        records,
    )))
}

fn class_student_ids(
    conn: &Connection,
    req: &Request,
    class_id: &str,
) -> Result<Vec<String>, serde_json::Value> {
    let class_exists: Option<i64> = conn
        .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if class_exists.is_none() {
        return Err(err(&req.id, "not_found", "class not found", None));
    }

    let academic_year_filter = optional_str(req, "academicYearId");
    let sql = match academic_year_filter {
        Some(_) => {
            "SELECT s.id FROM students s
             JOIN users u ON u.id = s.user_id
             WHERE s.class_id = ? AND s.academic_year_id = ?
             ORDER BY u.last_name, u.first_name"
        }
        None => {
            "SELECT s.id FROM students s
             JOIN users u ON u.id = s.user_id
             WHERE s.class_id = ?
             ORDER BY u.last_name, u.first_name"
        }
    };
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    let rows = match academic_year_filter {
        Some(year_id) => stmt
            .query_map((class_id, year_id), |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([class_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };
    rows.map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn handle_reports_card(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (term, sequence) = match required_period(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    match can_view_student(conn, &user, &student_id) {
        Ok(true) => {}
        Ok(false) => return forbidden_student(req),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match report_for_student(conn, &student_id, ReportingPeriod { term, sequence }) {
        Ok(Some(report)) => ok(&req.id, json!({ "report": report })),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => calc_err(req, e),
    }
}

/// One report per enrolled student. Students without any grade row in the
/// period are skipped, not emitted as empty documents.
fn handle_reports_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &user, &[Role::Admin]) {
        return e;
    }
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (term, sequence) = match required_period(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_ids = match class_student_ids(conn, req, &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let period = ReportingPeriod { term, sequence };
    let mut reports = Vec::new();
    let mut skipped = 0_usize;
    for student_id in &student_ids {
        match report_for_student(conn, student_id, period) {
            Ok(Some(report)) if !report.grades.is_empty() => reports.push(report),
            Ok(_) => skipped += 1,
            Err(e) => return calc_err(req, e),
        }
    }

    ok(
        &req.id,
        json!({ "reports": reports, "skippedCount": skipped }),
    )
}

fn handle_reports_transcript(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match can_view_student(conn, &user, &student_id) {
        Ok(true) => {}
        Ok(false) => return forbidden_student(req),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match transcript_for_student(conn, &student_id) {
        Ok(Some(transcript)) => ok(&req.id, json!({ "transcript": transcript })),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => calc_err(req, e),
    }
}

fn handle_reports_transcript_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &user, &[Role::Admin]) {
        return e;
    }
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_ids = match class_student_ids(conn, req, &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mut transcripts = Vec::new();
    for student_id in &student_ids {
        match transcript_for_student(conn, student_id) {
            Ok(Some(t)) => transcripts.push(t),
            Ok(None) => continue,
            Err(e) => return calc_err(req, e),
        }
    }

    ok(&req.id, json!({ "transcripts": transcripts }))
}

/// Builds the class/period reports and writes them into a zip bundle on
/// disk, one JSON document per student plus a manifest.
fn handle_reports_export_bulk(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &user, &[Role::Admin]) {
        return e;
    }
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (term, sequence) = match required_period(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    let class_name: Option<String> = match conn
        .query_row("SELECT name FROM classes WHERE id = ?", [&class_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_name) = class_name else {
        return err(&req.id, "not_found", "class not found", None);
    };

    let student_ids = match class_student_ids(conn, req, &class_id) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let period = ReportingPeriod { term, sequence };
    let mut reports = Vec::new();
    let mut skipped = 0_usize;
    for student_id in &student_ids {
        match report_for_student(conn, student_id, period) {
            Ok(Some(report)) if !report.grades.is_empty() => reports.push(report),
            Ok(_) => skipped += 1,
            Err(e) => return calc_err(req, e),
        }
    }
    if reports.is_empty() {
        return err(
            &req.id,
            "no_data",
            "no grades recorded for this class and period",
            None,
        );
    }

    match export::export_report_bundle(&out_path, &class_name, term, sequence, &reports) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "bundlePath": out_path.to_string_lossy(),
                "bundleFormat": summary.bundle_format,
                "entryCount": summary.entry_count,
                "reportCount": reports.len(),
                "skippedCount": skipped
            }),
        ),
        Err(e) => err(&req.id, "export_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.card" => Some(handle_reports_card(state, req)),
        "reports.bulk" => Some(handle_reports_bulk(state, req)),
        "reports.transcript" => Some(handle_reports_transcript(state, req)),
        "reports.transcriptBulk" => Some(handle_reports_transcript_bulk(state, req)),
        "reports.exportBulk" => Some(handle_reports_export_bulk(state, req)),
        _ => None,
    }
}
