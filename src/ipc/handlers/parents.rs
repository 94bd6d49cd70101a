use crate::auth::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    account_fields, db_conn, insert_user_account, optional_str, require_role, required_str,
    row_exists, session_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_parents_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
           p.id,
           u.first_name,
           u.last_name,
           u.email,
           u.phone_number,
           p.occupation,
           (SELECT COUNT(*) FROM student_parents sp WHERE sp.parent_id = p.id) AS child_count
         FROM parents p
         JOIN users u ON u.id = p.user_id
         ORDER BY u.last_name, u.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let parents = match stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let first_name: String = r.get(1)?;
            let last_name: String = r.get(2)?;
            let email: String = r.get(3)?;
            let phone_number: Option<String> = r.get(4)?;
            let occupation: Option<String> = r.get(5)?;
            let child_count: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "firstName": first_name,
                "lastName": last_name,
                "email": email,
                "phoneNumber": phone_number,
                "occupation": occupation,
                "childCount": child_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "parents": parents }))
}

fn handle_parents_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let user_id = match insert_user_account(&tx, req, &account, Role::Parent) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return e;
        }
    };
    let parent_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO parents(id, user_id, occupation, address) VALUES(?, ?, ?, ?)",
        (
            &parent_id,
            &user_id,
            optional_str(req, "occupation"),
            optional_str(req, "address"),
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "parents" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "parentId": parent_id, "userId": user_id, "email": account.email }),
    )
}

fn handle_parents_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let parent_id = match required_str(req, "parentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id: Option<String> = match conn
        .query_row(
            "SELECT user_id FROM parents WHERE id = ?",
            [&parent_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "not_found", "parent not found", None);
    };

    if let Some(first_name) = optional_str(req, "firstName") {
        if let Err(e) = conn.execute(
            "UPDATE users SET first_name = ?, updated_at = ? WHERE id = ?",
            (&first_name, crate::db::now_iso(), &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(last_name) = optional_str(req, "lastName") {
        if let Err(e) = conn.execute(
            "UPDATE users SET last_name = ?, updated_at = ? WHERE id = ?",
            (&last_name, crate::db::now_iso(), &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(phone_number) = optional_str(req, "phoneNumber") {
        if let Err(e) = conn.execute(
            "UPDATE users SET phone_number = ?, updated_at = ? WHERE id = ?",
            (&phone_number, crate::db::now_iso(), &user_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(occupation) = optional_str(req, "occupation") {
        if let Err(e) = conn.execute(
            "UPDATE parents SET occupation = ? WHERE id = ?",
            (&occupation, &parent_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "parentId": parent_id }))
}

fn handle_parents_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let parent_id = match required_str(req, "parentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id: Option<String> = match conn
        .query_row(
            "SELECT user_id FROM parents WHERE id = ?",
            [&parent_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "not_found", "parent not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM student_parents WHERE parent_id = ?",
        [&parent_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM parents WHERE id = ?", [&parent_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM sessions WHERE user_id = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM users WHERE id = ?", [&user_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "deleted": true }))
}

fn handle_parents_link_child(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let parent_id = match required_str(req, "parentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let relationship = optional_str(req, "relationship").unwrap_or_else(|| "guardian".to_string());

    let parent_exists = match row_exists(conn, "SELECT 1 FROM parents WHERE id = ?", &parent_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !parent_exists {
        return err(&req.id, "not_found", "parent not found", None);
    }
    let student_exists = match row_exists(conn, "SELECT 1 FROM students WHERE id = ?", &student_id)
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !student_exists {
        return err(&req.id, "not_found", "student not found", None);
    }

    // Re-linking the same pair just refreshes the relationship label.
    if let Err(e) = conn.execute(
        "INSERT INTO student_parents(student_id, parent_id, relationship)
         VALUES(?, ?, ?)
         ON CONFLICT(student_id, parent_id) DO UPDATE SET relationship = excluded.relationship",
        (&student_id, &parent_id, &relationship),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "parentId": parent_id, "studentId": student_id, "relationship": relationship }),
    )
}

/// A parent's children, with enough identity to drive the parent dashboard.
/// Parents may only ask about themselves; admins about anyone.
fn handle_parents_children(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let parent_id = match user.role {
        Role::Parent => {
            let own: Option<String> = match conn
                .query_row(
                    "SELECT id FROM parents WHERE user_id = ?",
                    [&user.user_id],
                    |r| r.get(0),
                )
                .optional()
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            let Some(own) = own else {
                return err(&req.id, "not_found", "parent profile not found", None);
            };
            if let Some(requested) = optional_str(req, "parentId") {
                if requested != own {
                    return err(
                        &req.id,
                        "forbidden",
                        "parents may only list their own children",
                        None,
                    );
                }
            }
            own
        }
        Role::Admin => match required_str(req, "parentId") {
            Ok(v) => v,
            Err(e) => return e,
        },
        _ => {
            return err(
                &req.id,
                "forbidden",
                "insufficient role for this operation",
                None,
            )
        }
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.matricule, u.first_name, u.last_name, c.id, c.name, sp.relationship
         FROM student_parents sp
         JOIN students s ON s.id = sp.student_id
         JOIN users u ON u.id = s.user_id
         JOIN classes c ON c.id = s.class_id
         WHERE sp.parent_id = ?
         ORDER BY u.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let children = match stmt
        .query_map([&parent_id], |r| {
            let id: String = r.get(0)?;
            let matricule: String = r.get(1)?;
            let first_name: String = r.get(2)?;
            let last_name: String = r.get(3)?;
            let class_id: String = r.get(4)?;
            let class_name: String = r.get(5)?;
            let relationship: String = r.get(6)?;
            Ok(json!({
                "id": id,
                "matricule": matricule,
                "firstName": first_name,
                "lastName": last_name,
                "classId": class_id,
                "className": class_name,
                "relationship": relationship
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "children": children }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "parents.list" => Some(handle_parents_list(state, req)),
        "parents.create" => Some(handle_parents_create(state, req)),
        "parents.update" => Some(handle_parents_update(state, req)),
        "parents.delete" => Some(handle_parents_delete(state, req)),
        "parents.linkChild" => Some(handle_parents_link_child(state, req)),
        "parents.children" => Some(handle_parents_children(state, req)),
        _ => None,
    }
}
