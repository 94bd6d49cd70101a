use crate::auth::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_str, require_role, required_str, row_exists, session_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = session_user(conn, req) {
        return e;
    }

    // Correlated subqueries keep the counts join-free.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.level,
           c.academic_year,
           c.teacher_id,
           (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM subjects sub WHERE sub.class_id = c.id) AS subject_count
         FROM classes c
         ORDER BY c.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let level: String = row.get(2)?;
            let academic_year: String = row.get(3)?;
            let teacher_id: Option<String> = row.get(4)?;
            let student_count: i64 = row.get(5)?;
            let subject_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "level": level,
                "academicYear": academic_year,
                "teacherId": teacher_id,
                "studentCount": student_count,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn validate_teacher_ref(
    conn: &rusqlite::Connection,
    req: &Request,
    teacher_id: &str,
) -> Result<(), serde_json::Value> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    match role.as_deref() {
        Some("teacher") => Ok(()),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            "teacherId does not reference a teacher account",
            None,
        )),
        None => Err(err(&req.id, "not_found", "teacher not found", None)),
    }
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if name.len() < 2 {
        return err(
            &req.id,
            "bad_params",
            "class name must be at least 2 characters",
            None,
        );
    }
    let level = match required_str(req, "level") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let academic_year = match required_str(req, "academicYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if academic_year.len() < 7 {
        return err(&req.id, "bad_params", "academic year label is too short", None);
    }
    let teacher_id = optional_str(req, "teacherId");
    if let Some(tid) = teacher_id.as_deref() {
        if let Err(e) = validate_teacher_ref(conn, req, tid) {
            return e;
        }
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, name, level, academic_year, teacher_id) VALUES(?, ?, ?, ?, ?)",
        (&class_id, &name, &level, &academic_year, &teacher_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    ok(&req.id, json!({ "classId": class_id, "name": name }))
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let exists = match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "class not found", None);
    }

    if let Some(name) = optional_str(req, "name") {
        if name.len() < 2 {
            return err(
                &req.id,
                "bad_params",
                "class name must be at least 2 characters",
                None,
            );
        }
        if let Err(e) = conn.execute("UPDATE classes SET name = ? WHERE id = ?", (&name, &class_id))
        {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(level) = optional_str(req, "level") {
        if let Err(e) = conn.execute(
            "UPDATE classes SET level = ? WHERE id = ?",
            (&level, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(academic_year) = optional_str(req, "academicYear") {
        if academic_year.len() < 7 {
            return err(&req.id, "bad_params", "academic year label is too short", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE classes SET academic_year = ? WHERE id = ?",
            (&academic_year, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(teacher_id) = optional_str(req, "teacherId") {
        if let Err(e) = validate_teacher_ref(conn, req, &teacher_id) {
            return e;
        }
        if let Err(e) = conn.execute(
            "UPDATE classes SET teacher_id = ? WHERE id = ?",
            (&teacher_id, &class_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "classId": class_id }))
}

/// Removes a class and everything hanging off it: grades, parent links,
/// student profiles and their user accounts, subjects.
fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let exists = match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "class not found", None);
    }

    // User rows of enrolled students, captured before their profiles go.
    let student_user_ids: Vec<String> = {
        let mut stmt = match conn.prepare("SELECT user_id FROM students WHERE class_id = ?") {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        match stmt
            .query_map([&class_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grades
         WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM student_parents
         WHERE student_id IN (SELECT id FROM students WHERE class_id = ?)",
        [&class_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "student_parents" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if !student_user_ids.is_empty() {
        let placeholders = std::iter::repeat("?")
            .take(student_user_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let bind_values: Vec<Value> = student_user_ids
            .iter()
            .map(|id| Value::Text(id.clone()))
            .collect();
        if let Err(e) = tx.execute(
            &format!("DELETE FROM sessions WHERE user_id IN ({})", placeholders),
            params_from_iter(bind_values.clone()),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "sessions" })),
            );
        }
        if let Err(e) = tx.execute(
            &format!("DELETE FROM users WHERE id IN ({})", placeholders),
            params_from_iter(bind_values),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "users" })),
            );
        }
    }

    if let Err(e) = tx.execute("DELETE FROM subjects WHERE class_id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM classes WHERE id = ?", [&class_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
