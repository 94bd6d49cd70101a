use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::auth::{self, Role, SessionUser};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, serde_json::Value> {
    match req.params.get(key) {
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
        Some(v) => v.as_i64().ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                format!("{} must be an integer", key),
                None,
            )
        }),
    }
}

pub fn optional_i64(req: &Request, key: &str) -> Option<i64> {
    req.params.get(key).and_then(|v| v.as_i64())
}

/// Numeric fields must arrive as JSON numbers. Free-form strings are
/// rejected, never silently coerced to 0 — a coerced zero would be
/// indistinguishable from an earned zero.
pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    let Some(v) = req.params.get(key) else {
        return Err(err(&req.id, "bad_params", format!("missing {}", key), None));
    };
    let Some(n) = v.as_f64() else {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a number", key),
            Some(json!({ "got": v.clone() })),
        ));
    };
    if !n.is_finite() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a finite number", key),
            None,
        ));
    }
    Ok(n)
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(_) => required_f64(req, key).map(Some),
    }
}

/// Terms run 1..=3, sequences 1..=2.
pub fn required_period(req: &Request) -> Result<(i64, i64), serde_json::Value> {
    let term = required_i64(req, "term")?;
    if !(1..=3).contains(&term) {
        return Err(err(&req.id, "bad_params", "term must be 1, 2 or 3", None));
    }
    let sequence = required_i64(req, "sequence")?;
    if !(1..=2).contains(&sequence) {
        return Err(err(&req.id, "bad_params", "sequence must be 1 or 2", None));
    }
    Ok((term, sequence))
}

pub fn session_user(
    conn: &Connection,
    req: &Request,
) -> Result<SessionUser, serde_json::Value> {
    let Some(token) = req.params.get("token").and_then(|v| v.as_str()) else {
        return Err(err(&req.id, "unauthorized", "missing params.token", None));
    };
    match auth::resolve_session(conn, token) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(err(
            &req.id,
            "unauthorized",
            "invalid or expired session",
            None,
        )),
        Err(e) => Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    }
}

pub fn require_role(
    req: &Request,
    user: &SessionUser,
    allowed: &[Role],
) -> Result<(), serde_json::Value> {
    if allowed.contains(&user.role) {
        return Ok(());
    }
    Err(err(
        &req.id,
        "forbidden",
        "insufficient role for this operation",
        Some(json!({ "role": user.role.as_str() })),
    ))
}

/// Record-level visibility: admins and teachers see every student; a student
/// sees only their own profile; a parent only linked children.
pub fn can_view_student(
    conn: &Connection,
    user: &SessionUser,
    student_id: &str,
) -> rusqlite::Result<bool> {
    match user.role {
        Role::Admin | Role::Teacher => Ok(true),
        Role::Student => {
            let owner: Option<String> = conn
                .query_row(
                    "SELECT user_id FROM students WHERE id = ?",
                    [student_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(owner.as_deref() == Some(user.user_id.as_str()))
        }
        Role::Parent => {
            let linked: Option<i64> = conn
                .query_row(
                    "SELECT 1
                     FROM student_parents sp
                     JOIN parents p ON p.id = sp.parent_id
                     WHERE sp.student_id = ? AND p.user_id = ?",
                    (student_id, &user.user_id),
                    |r| r.get(0),
                )
                .optional()?;
            Ok(linked.is_some())
        }
    }
}

pub fn forbidden_student(req: &Request) -> serde_json::Value {
    err(
        &req.id,
        "forbidden",
        "not allowed to view this student's records",
        None,
    )
}

pub fn row_exists(
    conn: &Connection,
    sql: &str,
    id: &str,
) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn.query_row(sql, [id], |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

pub struct NewAccount {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone_number: Option<String>,
    password: String,
}

/// Shared field validation for account-backed rows (teachers, students,
/// parents). Mirrors the portal's form rules.
pub fn account_fields(req: &Request) -> Result<NewAccount, serde_json::Value> {
    let first_name = required_str(req, "firstName")?;
    if first_name.len() < 2 {
        return Err(err(
            &req.id,
            "bad_params",
            "first name must be at least 2 characters",
            None,
        ));
    }
    let last_name = required_str(req, "lastName")?;
    if last_name.len() < 2 {
        return Err(err(
            &req.id,
            "bad_params",
            "last name must be at least 2 characters",
            None,
        ));
    }
    let email = required_str(req, "email")?;
    if !email.contains('@') {
        return Err(err(&req.id, "bad_params", "invalid email address", None));
    }
    let password = required_str(req, "password")?;
    if password.len() < 6 {
        return Err(err(
            &req.id,
            "bad_params",
            "password must be at least 6 characters",
            None,
        ));
    }
    Ok(NewAccount {
        email,
        first_name,
        last_name,
        phone_number: optional_str(req, "phoneNumber"),
        password,
    })
}

/// Inserts the users row for a validated account and returns its id. The
/// email-uniqueness check runs first so callers get a clean conflict error
/// instead of a constraint failure.
pub fn insert_user_account(
    conn: &Connection,
    req: &Request,
    account: &NewAccount,
    role: Role,
) -> Result<String, serde_json::Value> {
    let taken = row_exists(conn, "SELECT 1 FROM users WHERE email = ?", &account.email)
        .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))?;
    if taken {
        return Err(err(
            &req.id,
            "conflict",
            "email already in use",
            Some(json!({ "email": account.email })),
        ));
    }

    let user_id = uuid::Uuid::new_v4().to_string();
    let now = crate::db::now_iso();
    conn.execute(
        "INSERT INTO users(id, email, password_hash, first_name, last_name, role, phone_number, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &account.email,
            auth::hash_password(&account.password),
            &account.first_name,
            &account.last_name,
            role.as_str(),
            &account.phone_number,
            &now,
            &now,
        ),
    )
    .map_err(|e| {
        err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "users" })),
        )
    })?;
    Ok(user_id)
}
