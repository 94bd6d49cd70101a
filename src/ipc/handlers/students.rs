use crate::auth::Role;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    account_fields, can_view_student, db_conn, forbidden_student, insert_user_account,
    optional_str, require_role, required_str, row_exists, session_user,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = require_role(req, &user, &[Role::Admin, Role::Teacher]) {
        return e;
    }

    let class_filter = optional_str(req, "classId");
    let sql = match class_filter {
        Some(_) => {
            "SELECT s.id, s.matricule, s.class_id, s.date_of_birth, s.place_of_birth, s.gender,
                    u.first_name, u.last_name, u.email, c.name
             FROM students s
             JOIN users u ON u.id = s.user_id
             JOIN classes c ON c.id = s.class_id
             WHERE s.class_id = ?
             ORDER BY u.last_name, u.first_name"
        }
        None => {
            "SELECT s.id, s.matricule, s.class_id, s.date_of_birth, s.place_of_birth, s.gender,
                    u.first_name, u.last_name, u.email, c.name
             FROM students s
             JOIN users u ON u.id = s.user_id
             JOIN classes c ON c.id = s.class_id
             ORDER BY u.last_name, u.first_name"
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |r: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let id: String = r.get(0)?;
        let matricule: String = r.get(1)?;
        let class_id: String = r.get(2)?;
        let date_of_birth: Option<String> = r.get(3)?;
        let place_of_birth: Option<String> = r.get(4)?;
        let gender: Option<String> = r.get(5)?;
        let first_name: String = r.get(6)?;
        let last_name: String = r.get(7)?;
        let email: String = r.get(8)?;
        let class_name: String = r.get(9)?;
        Ok(json!({
            "id": id,
            "matricule": matricule,
            "classId": class_id,
            "className": class_name,
            "firstName": first_name,
            "lastName": last_name,
            "email": email,
            "dateOfBirth": date_of_birth,
            "placeOfBirth": place_of_birth,
            "gender": gender
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
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Provisions the login account and the enrollment profile in one
/// transaction; a failure in either leaves no half-created student behind.
fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let matricule = match required_str(req, "matricule") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if matricule.len() < 3 {
        return err(
            &req.id,
            "bad_params",
            "matricule must be at least 3 characters",
            None,
        );
    }
    let class_id = match required_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date_of_birth = match required_str(req, "dateOfBirth") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let place_of_birth = match required_str(req, "placeOfBirth") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if place_of_birth.len() < 2 {
        return err(
            &req.id,
            "bad_params",
            "place of birth must be at least 2 characters",
            None,
        );
    }
    let gender = match required_str(req, "gender") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if gender != "Male" && gender != "Female" {
        return err(
            &req.id,
            "bad_params",
            "gender must be Male or Female",
            Some(json!({ "gender": gender })),
        );
    }

    let class_exists = match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !class_exists {
        return err(&req.id, "not_found", "class not found", None);
    }
    let matricule_taken =
        match row_exists(conn, "SELECT 1 FROM students WHERE matricule = ?", &matricule) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
    if matricule_taken {
        return err(
            &req.id,
            "conflict",
            "matricule already in use",
            Some(json!({ "matricule": matricule })),
        );
    }
    let academic_year_id = optional_str(req, "academicYearId");
    if let Some(year_id) = academic_year_id.as_deref() {
        let year_exists =
            match row_exists(conn, "SELECT 1 FROM academic_years WHERE id = ?", year_id) {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
        if !year_exists {
            return err(&req.id, "not_found", "academic year not found", None);
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let user_id = match insert_user_account(&tx, req, &account, Role::Student) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return e;
        }
    };
    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO students(id, user_id, matricule, class_id, academic_year_id,
                              date_of_birth, place_of_birth, gender, address)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &student_id,
            &user_id,
            &matricule,
            &class_id,
            &academic_year_id,
            &date_of_birth,
            &place_of_birth,
            &gender,
            optional_str(req, "address"),
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "userId": user_id, "matricule": matricule }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id: Option<String> = match conn
        .query_row(
            "SELECT user_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "not_found", "student not found", None);
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
    if let Some(class_id) = optional_str(req, "classId") {
        let class_exists = match row_exists(conn, "SELECT 1 FROM classes WHERE id = ?", &class_id) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if !class_exists {
            return err(&req.id, "not_found", "class not found", None);
        }
        if let Err(e) = conn.execute(
            "UPDATE students SET class_id = ? WHERE id = ?",
            (&class_id, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(address) = optional_str(req, "address") {
        if let Err(e) = conn.execute(
            "UPDATE students SET address = ? WHERE id = ?",
            (&address, &student_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user_id: Option<String> = match conn
        .query_row(
            "SELECT user_id FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(user_id) = user_id else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    for (sql, table) in [
        ("DELETE FROM grades WHERE student_id = ?", "grades"),
        (
            "DELETE FROM student_parents WHERE student_id = ?",
            "student_parents",
        ),
        ("DELETE FROM students WHERE id = ?", "students"),
    ] {
        if let Err(e) = tx.execute(sql, [&student_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
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

fn handle_students_parents(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match session_user(conn, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match can_view_student(conn, &user, &student_id) {
        Ok(true) => {}
        Ok(false) => return forbidden_student(req),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let mut stmt = match conn.prepare(
        "SELECT p.id, u.first_name, u.last_name, u.email, u.phone_number, sp.relationship
         FROM student_parents sp
         JOIN parents p ON p.id = sp.parent_id
         JOIN users u ON u.id = p.user_id
         WHERE sp.student_id = ?
         ORDER BY u.last_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let parents = match stmt
        .query_map([&student_id], |r| {
            let id: String = r.get(0)?;
            let first_name: String = r.get(1)?;
            let last_name: String = r.get(2)?;
            let email: String = r.get(3)?;
            let phone_number: Option<String> = r.get(4)?;
            let relationship: String = r.get(5)?;
            Ok(json!({
                "id": id,
                "firstName": first_name,
                "lastName": last_name,
                "email": email,
                "phoneNumber": phone_number,
                "relationship": relationship
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "parents": parents }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        "students.parents" => Some(handle_students_parents(state, req)),
        _ => None,
    }
}
