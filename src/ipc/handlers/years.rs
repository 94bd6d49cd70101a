use crate::auth::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, optional_str, require_role, required_str, row_exists, session_user};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_years_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = session_user(conn, req) {
        return e;
    }

    let mut stmt = match conn.prepare(
        "SELECT id, year, start_date, end_date, is_active
         FROM academic_years
         ORDER BY year",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let years = match stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let year: String = r.get(1)?;
            let start_date: Option<String> = r.get(2)?;
            let end_date: Option<String> = r.get(3)?;
            let is_active: i64 = r.get(4)?;
            Ok(json!({
                "id": id,
                "year": year,
                "startDate": start_date,
                "endDate": end_date,
                "isActive": is_active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "academicYears": years }))
}

fn handle_years_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let year = match required_str(req, "year") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // "2024-2025" style labels.
    if year.len() < 7 {
        return err(&req.id, "bad_params", "year label is too short", None);
    }

    let exists: bool = match row_exists(conn, "SELECT 1 FROM academic_years WHERE year = ?", &year)
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists {
        return err(
            &req.id,
            "conflict",
            "academic year already exists",
            Some(json!({ "year": year })),
        );
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO academic_years(id, year, start_date, end_date, is_active)
         VALUES(?, ?, ?, ?, 0)",
        (
            &id,
            &year,
            optional_str(req, "startDate"),
            optional_str(req, "endDate"),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "academic_years" })),
        );
    }

    ok(&req.id, json!({ "academicYearId": id, "year": year }))
}

fn handle_years_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let exists = match row_exists(conn, "SELECT 1 FROM academic_years WHERE id = ?", &id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "academic year not found", None);
    }

    if let Some(year) = optional_str(req, "year") {
        if year.len() < 7 {
            return err(&req.id, "bad_params", "year label is too short", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE academic_years SET year = ? WHERE id = ?",
            (&year, &id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(start_date) = optional_str(req, "startDate") {
        if let Err(e) = conn.execute(
            "UPDATE academic_years SET start_date = ? WHERE id = ?",
            (&start_date, &id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(end_date) = optional_str(req, "endDate") {
        if let Err(e) = conn.execute(
            "UPDATE academic_years SET end_date = ? WHERE id = ?",
            (&end_date, &id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "academicYearId": id }))
}

fn handle_years_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let referenced = match row_exists(
        conn,
        "SELECT 1 FROM students WHERE academic_year_id = ?",
        &id,
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if referenced {
        return err(
            &req.id,
            "conflict",
            "academic year still has enrolled students",
            None,
        );
    }

    match conn.execute("DELETE FROM academic_years WHERE id = ?", [&id]) {
        Ok(0) => err(&req.id, "not_found", "academic year not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

/// Activation is exclusive: exactly one year is active afterwards.
fn handle_years_activate(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let id = match required_str(req, "academicYearId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let exists = match row_exists(conn, "SELECT 1 FROM academic_years WHERE id = ?", &id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !exists {
        return err(&req.id, "not_found", "academic year not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("UPDATE academic_years SET is_active = 0", []) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE academic_years SET is_active = 1 WHERE id = ?",
        [&id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "academicYearId": id, "isActive": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "years.list" => Some(handle_years_list(state, req)),
        "years.create" => Some(handle_years_create(state, req)),
        "years.update" => Some(handle_years_update(state, req)),
        "years.delete" => Some(handle_years_delete(state, req)),
        "years.activate" => Some(handle_years_activate(state, req)),
        _ => None,
    }
}
