use crate::authz::{self, RequesterRole};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::setup;
use crate::ipc::types::{AppState, Request};
use crate::schedule;
use crate::store;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

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

fn bad(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "bad_params",
        message: message.into(),
        details: None,
    }
}

fn not_found(message: impl Into<String>) -> HandlerErr {
    HandlerErr {
        code: "not_found",
        message: message.into(),
        details: None,
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

fn class_name(conn: &Connection, class_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, String>(0)
    })
    .optional()
    .map_err(db_err("db_query_failed"))
}

fn class_week_payload(
    conn: &Connection,
    class_id: &str,
    class_name: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let rows = store::list_by_class(conn, class_id).map_err(db_err("db_query_failed"))?;
    let views = schedule::resolve_views(conn, rows).map_err(db_err("db_query_failed"))?;
    let grid = schedule::build_grid(&views);
    Ok(json!({
        "class": { "id": class_id, "name": class_name },
        "grid": serde_json::Value::Object(grid),
        "entries": serde_json::to_value(views).unwrap_or(serde_json::Value::Null),
    }))
}

fn class_week(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let name = class_name(conn, &class_id)?.ok_or_else(|| not_found("class not found"))?;
    class_week_payload(conn, &class_id, &name)
}

fn student_week(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let student: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT name, class_id FROM students WHERE id = ?",
            [&student_id],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, Option<String>>(1)?)),
        )
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some((student_name, assigned_class)) = student else {
        return Err(not_found("student not found"));
    };

    // The viewing gate runs before any timetable data is touched.
    let role_raw = get_required_str(params, "requesterRole")?;
    let role = RequesterRole::parse(&role_raw).ok_or_else(|| {
        bad("requesterRole must be one of admin, staff, student, guardian")
    })?;
    let requester_id = get_required_str(params, "requesterId")?;
    let allowed = authz::can_view_student_timetable(conn, role, &requester_id, &student_id)
        .map_err(db_err("db_query_failed"))?;
    if !allowed {
        return Err(HandlerErr {
            code: "forbidden",
            message: "not allowed to view this student's timetable".to_string(),
            details: Some(json!({ "requesterRole": role.as_str() })),
        });
    }

    let Some(class_id) = assigned_class else {
        return Err(bad("student has no class assigned"));
    };
    let name = class_name(conn, &class_id)?.ok_or_else(|| not_found("class not found"))?;

    let mut payload = class_week_payload(conn, &class_id, &name)?;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert(
            "student".to_string(),
            json!({ "id": student_id, "name": student_name }),
        );
    }
    Ok(payload)
}

fn teacher_week(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let teacher_name: Option<String> = conn
        .query_row("SELECT name FROM teachers WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(db_err("db_query_failed"))?;
    let Some(teacher_name) = teacher_name else {
        return Err(not_found("teacher not found"));
    };

    // Day length comes from the request when given, else the workspace
    // setting, else the stock eight periods.
    let max_period = match params.get("maxPeriod") {
        Some(v) => {
            let n = v.as_i64().ok_or_else(|| bad("maxPeriod must be an integer"))?;
            if !(1..=20).contains(&n) {
                return Err(bad("maxPeriod must be in 1..=20"));
            }
            n
        }
        None => setup::effective_max_periods(conn).map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?,
    };

    let rows = store::list_by_teacher(conn, &teacher_id).map_err(db_err("db_query_failed"))?;
    let views = schedule::resolve_views(conn, rows).map_err(db_err("db_query_failed"))?;
    let grid = schedule::build_grid(&views);
    let free = schedule::free_periods_by_day(max_period, &views);
    let (regular, substitutes) = schedule::partition_substitutes(&views);

    Ok(json!({
        "teacher": { "id": teacher_id, "name": teacher_name },
        "grid": serde_json::Value::Object(grid),
        "freePeriods": serde_json::Value::Object(free),
        "maxPeriod": max_period,
        "regularEntries": serde_json::to_value(regular).unwrap_or(serde_json::Value::Null),
        "substituteEntries": serde_json::to_value(substitutes).unwrap_or(serde_json::Value::Null),
        "entries": serde_json::to_value(views).unwrap_or(serde_json::Value::Null),
    }))
}

fn handle_class_week(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match class_week(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_student_week(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match student_week(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_teacher_week(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match teacher_week(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.classWeek" => Some(handle_class_week(state, req)),
        "timetable.studentWeek" => Some(handle_student_week(state, req)),
        "timetable.teacherWeek" => Some(handle_teacher_week(state, req)),
        _ => None,
    }
}
