use crate::auth::Role;
use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    can_view_student, db_conn, forbidden_student, optional_f64, optional_i64, optional_str,
    require_role, required_f64, required_period, required_str, row_exists, session_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Students fall back to their own profile; everyone else must name one
    // explicitly or gets the unfiltered list (admin/teacher only).
    let student_filter = match user.role {
        Role::Student => {
            let own: Option<String> = match conn
                .query_row(
                    "SELECT id FROM students WHERE user_id = ?",
                    [&user.user_id],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let Some(own) = own else {
                return err(&req.id, "not_found", "student profile not found", None);
            };
            if let Some(requested) = optional_str(req, "studentId") {
                if requested != own {
                    return forbidden_student(req);
                }
            }
            Some(own)
        }
        Role::Parent => {
            let Some(requested) = optional_str(req, "studentId") else {
                return err(&req.id, "bad_params", "missing studentId", None);
            };
            match can_view_student(conn, &user, &requested) {
                Ok(true) => Some(requested),
                Ok(false) => return forbidden_student(req),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        Role::Admin | Role::Teacher => optional_str(req, "studentId"),
    };

    let mut where_clauses: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(student_id) = &student_filter {
        where_clauses.push("g.student_id = ?");
        bind_values.push(Value::Text(student_id.clone()));
    }
    if let Some(term) = optional_i64(req, "term") {
        where_clauses.push("g.term = ?");
        bind_values.push(Value::Integer(term));
    }
    if let Some(sequence) = optional_i64(req, "sequence") {
        where_clauses.push("g.sequence = ?");
        bind_values.push(Value::Integer(sequence));
    }

    let mut sql = String::from(
        "SELECT g.id, g.student_id, g.subject_id, g.term, g.sequence, g.score, g.max_score,
                g.comment, g.created_at,
                u.first_name, u.last_name,
                sub.name, sub.code, sub.coefficient
         FROM grades g
         JOIN students s ON s.id = g.student_id
         JOIN users u ON u.id = s.user_id
         JOIN subjects sub ON sub.id = g.subject_id",
    );
    if !where_clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY g.created_at DESC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let grades = match stmt
        .query_map(params_from_iter(bind_values), |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let subject_id: String = r.get(2)?;
            let term: i64 = r.get(3)?;
            let sequence: i64 = r.get(4)?;
            let score: f64 = r.get(5)?;
            let max_score: f64 = r.get(6)?;
            let comment: Option<String> = r.get(7)?;
            let created_at: String = r.get(8)?;
            let first_name: String = r.get(9)?;
            let last_name: String = r.get(10)?;
            let subject_name: String = r.get(11)?;
            let subject_code: String = r.get(12)?;
            let coefficient: f64 = r.get(13)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "studentName": format!("{} {}", first_name, last_name),
                "subjectId": subject_id,
                "subject": subject_name,
                "code": subject_code,
                "coefficient": coefficient,
                "term": term,
                "sequence": sequence,
                "score": score,
                "maxScore": max_score,
                "comment": comment,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "grades": grades }))
}

/// Records one subject's score for one student in one (term, sequence).
/// The (student, subject, term, sequence) key is unique; re-recording
/// updates the existing row.
fn handle_grades_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &user, &[Role::Admin, Role::Teacher]) {
        return e;
    }

    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let (term, sequence) = match required_period(req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    // Scores arrive as numbers or not at all; a malformed value is an error,
    // never a silent zero.
    let score = match required_f64(req, "score") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if score < 0.0 {
        return err(
            &req.id,
            "bad_params",
            "score must not be negative",
            Some(json!({ "score": score })),
        );
    }
    let max_score = match optional_f64(req, "maxScore") {
        Ok(Some(v)) => v,
        Ok(None) => calc::SCALE_MAX,
        Err(e) => return e,
    };
    if max_score <= 0.0 {
        return err(
            &req.id,
            "bad_params",
            "maxScore must be greater than zero",
            Some(json!({ "maxScore": max_score })),
        );
    }
    let comment = optional_str(req, "comment");

    let student_exists = match row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !student_exists {
        return err(&req.id, "not_found", "student not found", None);
    }
    let subject_exists = match row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id)
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !subject_exists {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM grades
             WHERE student_id = ? AND subject_id = ? AND term = ? AND sequence = ?",
            (&student_id, &subject_id, term, sequence),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = db::now_iso();
    let (grade_id, created) = match existing {
        Some(grade_id) => {
            if let Err(e) = conn.execute(
                "UPDATE grades SET score = ?, max_score = ?, comment = ?, updated_at = ?
                 WHERE id = ?",
                (score, max_score, &comment, &now, &grade_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            (grade_id, false)
        }
        None => {
            let grade_id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO grades(id, student_id, subject_id, term, sequence, score, max_score,
                                    comment, created_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                (
                    &grade_id,
                    &student_id,
                    &subject_id,
                    term,
                    sequence,
                    score,
                    max_score,
                    &comment,
                    &now,
                    &now,
                ),
            ) {
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "grades" })),
                );
            }
            (grade_id, true)
        }
    };

    ok(
        &req.id,
        json!({
            "gradeId": grade_id,
            "created": created,
            "studentId": student_id,
            "subjectId": subject_id,
            "term": term,
            "sequence": sequence,
            "score": score,
            "maxScore": max_score,
            "comment": comment
        }),
    )
}

fn handle_grades_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &user, &[Role::Admin, Role::Teacher]) {
        return e;
    }
    let grade_id = match required_str(req, "gradeId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match conn.execute("DELETE FROM grades WHERE id = ?", [&grade_id]) {
        Ok(0) => err(&req.id, "not_found", "grade not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.record" => Some(handle_grades_record(state, req)),
        "grades.delete" => Some(handle_grades_delete(state, req)),
        _ => None,
    }
}
