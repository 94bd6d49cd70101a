use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, session_user};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Headline totals plus the latest recorded grades, enough to drive the
/// admin landing page.
fn handle_dashboard_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = session_user(conn, req) {
        return e;
    }

    let count = |sql: &str| -> Result<i64, rusqlite::Error> {
        conn.query_row(sql, [], |r| r.get(0))
    };
    let total_students = match count("SELECT COUNT(*) FROM students") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total_teachers = match count("SELECT COUNT(*) FROM users WHERE role = 'teacher'") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total_classes = match count("SELECT COUNT(*) FROM classes") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total_subjects = match count("SELECT COUNT(*) FROM subjects") {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT g.id, g.score, g.max_score, g.term, g.sequence, g.created_at,
                u.first_name, u.last_name, sub.name
         FROM grades g
         JOIN students s ON s.id = g.student_id
         JOIN users u ON u.id = s.user_id
         JOIN subjects sub ON sub.id = g.subject_id
         ORDER BY g.created_at DESC
         LIMIT 10",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let recent_grades = match stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let score: f64 = r.get(1)?;
            let max_score: f64 = r.get(2)?;
            let term: i64 = r.get(3)?;
            let sequence: i64 = r.get(4)?;
            let created_at: String = r.get(5)?;
            let first_name: String = r.get(6)?;
            let last_name: String = r.get(7)?;
            let subject: String = r.get(8)?;
            Ok(json!({
                "id": id,
                "studentName": format!("{} {}", first_name, last_name),
                "subject": subject,
                "score": score,
                "maxScore": max_score,
                "term": term,
                "sequence": sequence,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "stats": {
                "totalStudents": total_students,
                "totalTeachers": total_teachers,
                "totalClasses": total_classes,
                "totalSubjects": total_subjects
            },
            "recentGrades": recent_grades
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "dashboard.stats" => Some(handle_dashboard_stats(state, req)),
        _ => None,
    }
}
