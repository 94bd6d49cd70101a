use crate::auth;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

/// Bootstraps the very first account. Every later account is created by an
/// authenticated admin through the role-specific create methods.
fn handle_seed_admin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let user_count: i64 = match conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0)) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if user_count > 0 {
        return err(
            &req.id,
            "already_initialized",
            "workspace already has accounts",
            None,
        );
    }

    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if !email.contains('@') {
        return err(&req.id, "bad_params", "invalid email address", None);
    }
    let password = match required_str(req, "password") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if password.len() < 6 {
        return err(
            &req.id,
            "bad_params",
            "password must be at least 6 characters",
            None,
        );
    }
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let user_id = Uuid::new_v4().to_string();
    let now = db::now_iso();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, email, password_hash, first_name, last_name, role, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'admin', ?, ?)",
        (
            &user_id,
            &email,
            auth::hash_password(&password),
            &first_name,
            &last_name,
            &now,
            &now,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        );
    }

    ok(&req.id, json!({ "userId": user_id, "email": email }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.seedAdmin" => Some(handle_seed_admin(state, req)),
        _ => None,
    }
}
