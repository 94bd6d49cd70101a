use crate::auth::{self, Role};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, required_str, session_user};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let password = match required_str(req, "password") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let row: Option<(String, String, String, String, String)> = match conn
        .query_row(
            "SELECT id, password_hash, first_name, last_name, role FROM users WHERE email = ?",
            [&email],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Same message for unknown email and wrong password.
    let Some((user_id, password_hash, first_name, last_name, role)) = row else {
        return err(
            &req.id,
            "invalid_credentials",
            "invalid email or password",
            None,
        );
    };
    if !auth::verify_password(&password_hash, &password) {
        return err(
            &req.id,
            "invalid_credentials",
            "invalid email or password",
            None,
        );
    }

    let student_profile = if role == Role::Student.as_str() {
        match conn
            .query_row(
                "SELECT id, matricule, class_id FROM students WHERE user_id = ?",
                [&user_id],
                |r| {
                    let id: String = r.get(0)?;
                    let matricule: String = r.get(1)?;
                    let class_id: String = r.get(2)?;
                    Ok(json!({ "id": id, "matricule": matricule, "classId": class_id }))
                },
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    } else {
        None
    };

    let token = match auth::issue_session(conn, &user_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "token": token,
            "user": {
                "id": user_id,
                "email": email,
                "firstName": first_name,
                "lastName": last_name,
                "role": role,
                "studentProfile": student_profile,
            }
        }),
    )
}

fn handle_logout(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let token = match required_str(req, "token") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match auth::invalidate_session(conn, &token) {
        Ok(existed) => ok(&req.id, json!({ "loggedOut": existed })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_me(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };

    let names: Option<(String, String, Option<String>)> = match conn
        .query_row(
            "SELECT first_name, last_name, phone_number FROM users WHERE id = ?",
            [&user.user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((first_name, last_name, phone_number)) = names else {
        return err(&req.id, "not_found", "user not found", None);
    };

    ok(
        &req.id,
        json!({
            "user": {
                "id": user.user_id,
                "email": user.email,
                "firstName": first_name,
                "lastName": last_name,
                "phoneNumber": phone_number,
                "role": user.role.as_str(),
            }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.login" => Some(handle_login(state, req)),
        "auth.logout" => Some(handle_logout(state, req)),
        "auth.me" => Some(handle_me(state, req)),
        _ => None,
    }
}
