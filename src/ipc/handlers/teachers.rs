use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use uuid::Uuid;

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "teachers": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           t.id,
           t.name,
           (SELECT COUNT(*) FROM timetable_entries e WHERE e.teacher_id = t.id) AS entry_count
         FROM teachers t
         ORDER BY t.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let entry_count: i64 = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "entryCount": entry_count }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, name, created_at) VALUES(?, ?, ?)",
        (&teacher_id, &name, &db::now_iso()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id, "name": name }))
}

fn handle_teachers_rename(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_id = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }

    let changed = match conn.execute(
        "UPDATE teachers SET name = ? WHERE id = ?",
        (&name, &teacher_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    ok(&req.id, json!({ "teacherId": teacher_id, "name": name }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let teacher_id = match req.params.get("teacherId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing teacherId", None),
    };

    // Substitute history counts too: a teacher referenced only as the
    // original on covered lessons still blocks deletion.
    let entry_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM timetable_entries
         WHERE teacher_id = ?1 OR original_teacher_id = ?1",
        [&teacher_id],
        |r| r.get(0),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if entry_count > 0 {
        return err(
            &req.id,
            "in_use",
            "teacher is referenced by timetable entries",
            Some(json!({ "entryCount": entry_count })),
        );
    }

    let changed = match conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_delete_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.rename" => Some(handle_teachers_rename(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        _ => None,
    }
}
