use crate::auth::{self, Role};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    account_fields, db_conn, insert_user_account, optional_str, require_role, required_str,
    row_exists, session_user,
};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT
           u.id,
           u.email,
           u.first_name,
           u.last_name,
           u.phone_number,
           (SELECT COUNT(*) FROM subjects s WHERE s.teacher_id = u.id) AS subject_count,
           (SELECT COUNT(*) FROM classes c WHERE c.teacher_id = u.id) AS class_count
         FROM users u
         WHERE u.role = 'teacher'
         ORDER BY u.last_name, u.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let teachers = match stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let email: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let last_name: String = r.get(3)?;
            let phone_number: Option<String> = r.get(4)?;
            let subject_count: i64 = r.get(5)?;
            let class_count: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "email": email,
                "firstName": first_name,
                "lastName": last_name,
                "phoneNumber": phone_number,
                "subjectCount": subject_count,
                "classCount": class_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "teachers": teachers }))
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let account = match account_fields(req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teacher_id = match insert_user_account(conn, req, &account, Role::Teacher) {
        Ok(v) => v,
        Err(e) => return e,
    };

    ok(
        &req.id,
        json!({ "teacherId": teacher_id, "email": account.email }),
    )
}

fn handle_teachers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists = match row_exists(
        conn,
        "SELECT 1 FROM users WHERE id = ? AND role = 'teacher'",
        &teacher_id,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    if let Some(first_name) = optional_str(req, "firstName") {
        if let Err(e) = conn.execute(
            "UPDATE users SET first_name = ?, updated_at = ? WHERE id = ?",
            (&first_name, db::now_iso(), &teacher_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(last_name) = optional_str(req, "lastName") {
        if let Err(e) = conn.execute(
            "UPDATE users SET last_name = ?, updated_at = ? WHERE id = ?",
            (&last_name, db::now_iso(), &teacher_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(phone_number) = optional_str(req, "phoneNumber") {
        if let Err(e) = conn.execute(
            "UPDATE users SET phone_number = ?, updated_at = ? WHERE id = ?",
            (&phone_number, db::now_iso(), &teacher_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(password) = optional_str(req, "password") {
        if password.len() < 6 {
            return err(
                &req.id,
                "bad_params",
                "password must be at least 6 characters",
                None,
            );
        }
        if let Err(e) = conn.execute(
            "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
            (auth::hash_password(&password), db::now_iso(), &teacher_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists = match row_exists(
        conn,
        "SELECT 1 FROM users WHERE id = ? AND role = 'teacher'",
        &teacher_id,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Classes and subjects keep existing, unassigned.
    if let Err(e) = tx.execute(
        "UPDATE classes SET teacher_id = NULL WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE subjects SET teacher_id = NULL WHERE teacher_id = ?",
        [&teacher_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM sessions WHERE user_id = ?", [&teacher_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&teacher_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.update" => Some(handle_teachers_update(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        _ => None,
    }
}
