use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn db_err(code: &'static str) -> impl Fn(rusqlite::Error) -> HandlerErr {
    move |e| HandlerErr {
        code,
        message: e.to_string(),
        details: None,
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn class_exists(conn: &Connection, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err("db_query_failed"))
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err("db_query_failed"))
}

fn students_list(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_filter = params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut guardians: HashMap<String, Vec<String>> = HashMap::new();
    let mut stmt = conn
        .prepare("SELECT student_id, guardian_ref FROM student_guardians ORDER BY guardian_ref")
        .map_err(db_err("db_query_failed"))?;
    let links = stmt
        .query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;
    for (student_id, guardian_ref) in links {
        guardians.entry(student_id).or_default().push(guardian_ref);
    }

    let (sql, args): (&str, Vec<String>) = match &class_filter {
        Some(cid) => (
            "SELECT id, name, class_id FROM students WHERE class_id = ? ORDER BY name",
            vec![cid.clone()],
        ),
        None => (
            "SELECT id, name, class_id FROM students ORDER BY name",
            Vec::new(),
        ),
    };
    let mut stmt = conn.prepare(sql).map_err(db_err("db_query_failed"))?;
    let students = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let class_id: Option<String> = r.get(2)?;
            Ok((id, name, class_id))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_err("db_query_failed"))?;

    let rows: Vec<serde_json::Value> = students
        .into_iter()
        .map(|(id, name, class_id)| {
            let refs = guardians.remove(&id).unwrap_or_default();
            json!({
                "id": id,
                "name": name,
                "classId": class_id,
                "guardianRefs": refs
            })
        })
        .collect();

    Ok(json!({ "students": rows }))
}

fn students_create(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "name must not be empty".to_string(),
            details: None,
        });
    }

    let class_id = params
        .get("classId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    if let Some(cid) = &class_id {
        if !class_exists(conn, cid)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "class not found".to_string(),
                details: None,
            });
        }
    }

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, name, class_id, created_at) VALUES(?, ?, ?, ?)",
        (&student_id, &name, &class_id, &db::now_iso()),
    )
    .map_err(db_err("db_insert_failed"))?;

    Ok(json!({ "studentId": student_id, "name": name, "classId": class_id }))
}

fn students_assign_class(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    // classId must be present; an explicit null detaches the student.
    let class_value = params.get("classId").ok_or_else(|| HandlerErr {
        code: "bad_params",
        message: "missing classId".to_string(),
        details: None,
    })?;
    let class_id: Option<String> = match class_value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        _ => {
            return Err(HandlerErr {
                code: "bad_params",
                message: "classId must be a string or null".to_string(),
                details: None,
            })
        }
    };
    if let Some(cid) = &class_id {
        if !class_exists(conn, cid)? {
            return Err(HandlerErr {
                code: "not_found",
                message: "class not found".to_string(),
                details: None,
            });
        }
    }

    conn.execute(
        "UPDATE students SET class_id = ? WHERE id = ?",
        (&class_id, &student_id),
    )
    .map_err(db_err("db_update_failed"))?;

    Ok(json!({ "studentId": student_id, "classId": class_id }))
}

fn students_delete(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(db_err("db_tx_failed"))?;
    tx.execute(
        "DELETE FROM student_guardians WHERE student_id = ?",
        [&student_id],
    )
    .map_err(db_err("db_delete_failed"))?;
    tx.execute("DELETE FROM students WHERE id = ?", [&student_id])
        .map_err(db_err("db_delete_failed"))?;
    tx.commit().map_err(db_err("db_commit_failed"))?;

    Ok(json!({ "ok": true }))
}

fn guardians_add(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let guardian_ref = get_required_str(params, "guardianRef")?.trim().to_string();
    if guardian_ref.is_empty() {
        return Err(HandlerErr {
            code: "bad_params",
            message: "guardianRef must not be empty".to_string(),
            details: None,
        });
    }
    if !student_exists(conn, &student_id)? {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    }

    // Re-adding an existing link is a no-op.
    conn.execute(
        "INSERT OR IGNORE INTO student_guardians(student_id, guardian_ref) VALUES(?, ?)",
        (&student_id, &guardian_ref),
    )
    .map_err(db_err("db_insert_failed"))?;

    Ok(json!({ "ok": true }))
}

fn guardians_remove(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let guardian_ref = get_required_str(params, "guardianRef")?;

    let changed = conn
        .execute(
            "DELETE FROM student_guardians WHERE student_id = ? AND guardian_ref = ?",
            (&student_id, &guardian_ref),
        )
        .map_err(db_err("db_delete_failed"))?;
    if changed == 0 {
        return Err(HandlerErr {
            code: "not_found",
            message: "guardian link not found".to_string(),
            details: None,
        });
    }

    Ok(json!({ "ok": true }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle(state, req, students_list)),
        "students.create" => Some(handle(state, req, students_create)),
        "students.assignClass" => Some(handle(state, req, students_assign_class)),
        "students.delete" => Some(handle(state, req, students_delete)),
        "students.guardians.add" => Some(handle(state, req, guardians_add)),
        "students.guardians.remove" => Some(handle(state, req, guardians_remove)),
        _ => None,
    }
}
