use crate::auth::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, optional_f64, optional_str, require_role, required_str, row_exists, session_user,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

/// Coefficients come from the class's subject table and bound how much one
/// subject can move the weighted average.
const COEFFICIENT_MIN: f64 = 0.5;
const COEFFICIENT_MAX: f64 = 10.0;

fn coefficient_in_bounds(req: &Request, value: f64) -> Result<f64, serde_json::Value> {
    if !(COEFFICIENT_MIN..=COEFFICIENT_MAX).contains(&value) {
        return Err(err(
            &req.id,
            "bad_params",
            format!(
                "coefficient must be between {} and {}",
                COEFFICIENT_MIN, COEFFICIENT_MAX
            ),
            Some(json!({ "coefficient": value })),
        ));
    }
    Ok(value)
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = session_user(conn, req) {
        return e;
    }

    let class_filter = optional_str(req, "classId");
    let sql = match class_filter {
        Some(_) => {
            "SELECT id, name, code, coefficient, class_id, teacher_id
             FROM subjects WHERE class_id = ? ORDER BY name"
        }
        None => {
            "SELECT id, name, code, coefficient, class_id, teacher_id
             FROM subjects ORDER BY name"
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let id: String = r.get(0)?;
        let name: String = r.get(1)?;
        let code: String = r.get(2)?;
        let coefficient: f64 = r.get(3)?;
        let class_id: String = r.get(4)?;
        let teacher_id: Option<String> = r.get(5)?;
        Ok(json!({
            "id": id,
            "name": name,
            "code": code,
            "coefficient": coefficient,
            "classId": class_id,
            "teacherId": teacher_id
        }))
    };
    let rows = match class_filter {
        Some(cid) => stmt
            .query_map([&cid], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
            "subject name must be at least 2 characters",
            None,
        );
    }
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if code.len() < 2 {
        return err(
            &req.id,
            "bad_params",
            "subject code must be at least 2 characters",
            None,
        );
    }
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_exists = match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !class_exists {
        return err(&req.id, "not_found", "class not found", None);
    }

    let coefficient = match optional_f64(req, "coefficient") {
        Ok(Some(v)) => match coefficient_in_bounds(req, v) {
            Ok(v) => v,
            Err(e) => return e,
        },
        Ok(None) => 1.0,
        Err(e) => return e,
    };
    let teacher_id = optional_str(req, "teacherId");

    let code_taken = match row_exists(conn, "SELECT 1 FROM subjects WHERE code = ?", &code) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if code_taken {
        return err(
            &req.id,
            "conflict",
            "subject code already in use",
            Some(json!({ "code": code })),
        );
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, code, coefficient, class_id, teacher_id)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&subject_id, &name, &code, coefficient, &class_id, &teacher_id),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({ "subjectId": subject_id, "code": code, "coefficient": coefficient }),
    )
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists = match row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "subject not found", None);
    }

    if let Some(name) = optional_str(req, "name") {
        if let Err(e) = conn.execute(
            "UPDATE subjects SET name = ? WHERE id = ?",
            (&name, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    match optional_f64(req, "coefficient") {
        Ok(Some(v)) => {
            let coefficient = match coefficient_in_bounds(req, v) {
                Ok(v) => v,
                Err(e) => return e,
            };
            if let Err(e) = conn.execute(
                "UPDATE subjects SET coefficient = ? WHERE id = ?",
                (coefficient, &subject_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
        }
        Ok(None) => {}
        Err(e) => return e,
    }
    if let Some(teacher_id) = optional_str(req, "teacherId") {
        if let Err(e) = conn.execute(
            "UPDATE subjects SET teacher_id = ? WHERE id = ?",
            (&teacher_id, &subject_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "subjectId": subject_id }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists = match row_exists(conn, "SELECT 1 FROM subjects WHERE id = ?", &subject_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM grades WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
