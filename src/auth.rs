use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Matches the 7-day login lifetime the portal has always granted.
pub const SESSION_TTL_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Teacher,
    Student,
    Parent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Teacher => "teacher",
            Role::Student => "student",
            Role::Parent => "parent",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "admin" => Some(Role::Admin),
            "teacher" => Some(Role::Teacher),
            "student" => Some(Role::Student),
            "parent" => Some(Role::Parent),
            _ => None,
        }
    }
}

/// Resolved caller identity, passed explicitly into handlers. There is no
/// ambient session state anywhere in the process.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub user_id: String,
    pub email: String,
    pub role: Role,
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"$");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Stored form: `sha256$<salt>$<hex digest>`.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = salted_digest(&salt, password);
    format!("sha256${}${}", salt, digest)
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    match (parts.next(), parts.next(), parts.next()) {
        (Some("sha256"), Some(salt), Some(digest)) => salted_digest(salt, password) == digest,
        _ => false,
    }
}

/// Creates a session row and returns its opaque bearer token.
pub fn issue_session(conn: &Connection, user_id: &str) -> rusqlite::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    hasher.update(user_id.as_bytes());
    let token = format!("{:x}", hasher.finalize());

    let now = Utc::now();
    let expires = now + Duration::days(SESSION_TTL_DAYS);
    conn.execute(
        "INSERT INTO sessions(token, user_id, created_at, expires_at) VALUES(?, ?, ?, ?)",
        (&token, user_id, now.to_rfc3339(), expires.to_rfc3339()),
    )?;
    Ok(token)
}

/// Looks the token up and checks expiry. Expired rows are deleted on sight so
/// the table does not accumulate dead sessions.
pub fn resolve_session(conn: &Connection, token: &str) -> rusqlite::Result<Option<SessionUser>> {
    let row: Option<(String, String, String, String)> = conn
        .query_row(
            "SELECT s.expires_at, u.id, u.email, u.role
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = ?",
            [token],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((expires_at, user_id, email, role)) = row else {
        return Ok(None);
    };

    let expired = DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| t < Utc::now())
        .unwrap_or(true);
    if expired {
        conn.execute("DELETE FROM sessions WHERE token = ?", [token])?;
        return Ok(None);
    }

    let Some(role) = Role::parse(&role) else {
        return Ok(None);
    };
    Ok(Some(SessionUser {
        user_id,
        email,
        role,
    }))
}

/// Explicit logout. Returns whether a session row existed.
pub fn invalidate_session(conn: &Connection, token: &str) -> rusqlite::Result<bool> {
    Ok(conn.execute("DELETE FROM sessions WHERE token = ?", [token])? > 0)
}
