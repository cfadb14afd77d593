use crate::conflict::{self, Conflict, SlotClaim};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::schedule::{self, Weekday};
use crate::store::{self, EntryFilter, TimetableEntry};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
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
        .ok_or_else(|| bad(format!("missing {}", key)))
}

fn get_required_trimmed(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    let s = get_required_str(params, key)?.trim().to_string();
    if s.is_empty() {
        return Err(bad(format!("{} must not be empty", key)));
    }
    Ok(s)
}

fn parse_weekday(v: &serde_json::Value) -> Result<Weekday, HandlerErr> {
    v.as_str()
        .and_then(Weekday::parse)
        .ok_or_else(|| bad("weekday must be one of mon, tue, wed, thu, fri, sat"))
}

fn parse_period(v: &serde_json::Value) -> Result<i64, HandlerErr> {
    let n = v
        .as_i64()
        .ok_or_else(|| bad("period must be an integer"))?;
    if n < 1 {
        return Err(bad("period must be a positive integer"));
    }
    Ok(n)
}

/// Optional text field accepting null as an explicit clear. Returns the
/// trimmed value, with an empty string collapsing to None.
fn parse_optional_text(v: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        _ => Err(bad(format!("{} must be a string or null", key))),
    }
}

fn class_name(conn: &Connection, class_id: &str) -> Result<Option<String>, HandlerErr> {
    conn.query_row("SELECT name FROM classes WHERE id = ?", [class_id], |r| {
        r.get::<_, String>(0)
    })
    .optional()
    .map_err(db_err("db_query_failed"))
}

fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err("db_query_failed"))
}

/// The subject roster column carries NOCASE collation, so one equality
/// lookup covers the case-insensitive membership rule.
fn subject_on_roster(conn: &Connection, class_id: &str, name: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM class_subjects WHERE class_id = ? AND name = ?",
        (class_id, name.trim()),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(db_err("db_query_failed"))
}

fn conflict_response(c: Conflict) -> HandlerErr {
    let dimension = c.kind.as_str();
    HandlerErr {
        code: "slot_conflict",
        message: format!(
            "{} is already booked for {} period {}",
            dimension,
            c.entry.weekday.as_str(),
            c.entry.period
        ),
        details: Some(json!({
            "dimension": dimension,
            "weekday": c.entry.weekday.as_str(),
            "period": c.entry.period,
            "conflictingEntryId": c.entry.id,
        })),
    }
}

fn claim_of(entry: &TimetableEntry) -> SlotClaim {
    SlotClaim {
        class_id: &entry.class_id,
        teacher_id: &entry.teacher_id,
        room: entry.room.as_deref(),
        weekday: entry.weekday,
        period: entry.period,
    }
}

/// A write tripped a slot index after the pre-check passed (a race with
/// another writer on the same database). Re-probe so the caller gets
/// the same conflict answer a pre-checked collision would have given.
fn raced_conflict(conn: &Connection, entry: &TimetableEntry) -> Result<HandlerErr, HandlerErr> {
    if let Some(hit) =
        conflict::check_slot(conn, claim_of(entry), Some(&entry.id)).map_err(db_err("db_query_failed"))?
    {
        return Ok(conflict_response(hit));
    }
    Ok(HandlerErr {
        code: "slot_conflict",
        message: format!(
            "slot {} period {} was booked concurrently",
            entry.weekday.as_str(),
            entry.period
        ),
        details: None,
    })
}

fn joined_entry_json(
    conn: &Connection,
    entry: TimetableEntry,
) -> Result<serde_json::Value, HandlerErr> {
    let view = schedule::resolve_view(conn, entry).map_err(db_err("db_query_failed"))?;
    Ok(serde_json::to_value(view).unwrap_or(serde_json::Value::Null))
}

fn create_entry(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let weekday = parse_weekday(params.get("weekday").ok_or_else(|| bad("missing weekday"))?)?;
    let period = parse_period(params.get("period").ok_or_else(|| bad("missing period"))?)?;
    let start_time = get_required_trimmed(params, "startTime")?;
    let end_time = get_required_trimmed(params, "endTime")?;
    let subject_name = get_required_trimmed(params, "subjectName")?;
    let teacher_id = get_required_str(params, "teacherId")?;

    let room = match params.get("room") {
        Some(v) => parse_optional_text(v, "room")?,
        None => None,
    };
    let notes = match params.get("notes") {
        Some(serde_json::Value::Null) | None => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(bad("notes must be a string or null")),
    };
    let is_substitute = params
        .get("isSubstitute")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    // The covered-teacher reference only means something on a
    // substitute entry; otherwise it is dropped at the door.
    let original_teacher_id = if is_substitute {
        match params.get("originalTeacherId") {
            Some(v) => parse_optional_text(v, "originalTeacherId")?,
            None => None,
        }
    } else {
        None
    };

    if class_name(conn, &class_id)?.is_none() {
        return Err(not_found("class not found"));
    }
    if !subject_on_roster(conn, &class_id, &subject_name)? {
        return Err(bad("subject is not on the class roster"));
    }
    if !teacher_exists(conn, &teacher_id)? {
        return Err(not_found("teacher not found"));
    }
    if let Some(orig) = &original_teacher_id {
        if !teacher_exists(conn, orig)? {
            return Err(not_found("original teacher not found"));
        }
    }

    let now = db::now_iso();
    let entry = TimetableEntry {
        id: Uuid::new_v4().to_string(),
        class_id,
        weekday,
        period,
        start_time,
        end_time,
        subject_name,
        teacher_id,
        room,
        notes,
        is_substitute,
        original_teacher_id,
        created_at: now.clone(),
        updated_at: now,
    };

    if let Some(hit) =
        conflict::check_slot(conn, claim_of(&entry), None).map_err(db_err("db_query_failed"))?
    {
        return Err(conflict_response(hit));
    }

    if let Err(e) = store::insert(conn, &entry) {
        if conflict::classify_unique_violation(&e).is_some() {
            return Err(raced_conflict(conn, &entry)?);
        }
        return Err(db_err("db_insert_failed")(e));
    }

    Ok(json!({ "entry": joined_entry_json(conn, entry)? }))
}

fn update_entry(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "entryId")?;
    let existing = store::get(conn, &id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| not_found("entry not found"))?;

    let mut merged = existing;
    let mut revalidate_subject = false;

    if let Some(v) = params.get("classId") {
        let s = v.as_str().ok_or_else(|| bad("classId must be a string"))?;
        merged.class_id = s.to_string();
        revalidate_subject = true;
    }
    if let Some(v) = params.get("weekday") {
        merged.weekday = parse_weekday(v)?;
    }
    if let Some(v) = params.get("period") {
        merged.period = parse_period(v)?;
    }
    if let Some(v) = params.get("startTime") {
        let s = v.as_str().ok_or_else(|| bad("startTime must be a string"))?;
        let s = s.trim();
        if s.is_empty() {
            return Err(bad("startTime must not be empty"));
        }
        merged.start_time = s.to_string();
    }
    if let Some(v) = params.get("endTime") {
        let s = v.as_str().ok_or_else(|| bad("endTime must be a string"))?;
        let s = s.trim();
        if s.is_empty() {
            return Err(bad("endTime must not be empty"));
        }
        merged.end_time = s.to_string();
    }
    if let Some(v) = params.get("subjectName") {
        let s = v.as_str().ok_or_else(|| bad("subjectName must be a string"))?;
        let s = s.trim();
        if s.is_empty() {
            return Err(bad("subjectName must not be empty"));
        }
        merged.subject_name = s.to_string();
        revalidate_subject = true;
    }
    if let Some(v) = params.get("teacherId") {
        let s = v.as_str().ok_or_else(|| bad("teacherId must be a string"))?;
        merged.teacher_id = s.to_string();
        if !teacher_exists(conn, &merged.teacher_id)? {
            return Err(not_found("teacher not found"));
        }
    }
    if let Some(v) = params.get("room") {
        merged.room = parse_optional_text(v, "room")?;
    }
    if let Some(v) = params.get("notes") {
        merged.notes = match v {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            _ => return Err(bad("notes must be a string or null")),
        };
    }
    if let Some(v) = params.get("isSubstitute") {
        merged.is_substitute = v
            .as_bool()
            .ok_or_else(|| bad("isSubstitute must be a boolean"))?;
    }
    if let Some(v) = params.get("originalTeacherId") {
        merged.original_teacher_id = parse_optional_text(v, "originalTeacherId")?;
    }

    // Invariants are judged on the merged row, not the patch alone.
    if revalidate_subject {
        if class_name(conn, &merged.class_id)?.is_none() {
            return Err(not_found("class not found"));
        }
        if !subject_on_roster(conn, &merged.class_id, &merged.subject_name)? {
            return Err(bad("subject is not on the class roster"));
        }
    }
    if !merged.is_substitute {
        merged.original_teacher_id = None;
    }
    if let Some(orig) = &merged.original_teacher_id {
        if !teacher_exists(conn, orig)? {
            return Err(not_found("original teacher not found"));
        }
    }

    if let Some(hit) = conflict::check_slot(conn, claim_of(&merged), Some(&merged.id))
        .map_err(db_err("db_query_failed"))?
    {
        return Err(conflict_response(hit));
    }

    merged.updated_at = db::now_iso();
    match store::replace(conn, &merged) {
        Ok(true) => {}
        Ok(false) => return Err(not_found("entry not found")),
        Err(e) => {
            if conflict::classify_unique_violation(&e).is_some() {
                return Err(raced_conflict(conn, &merged)?);
            }
            return Err(db_err("db_update_failed")(e));
        }
    }

    Ok(json!({ "entry": joined_entry_json(conn, merged)? }))
}

fn delete_entry(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "entryId")?;
    let removed = store::remove(conn, &id)
        .map_err(db_err("db_delete_failed"))?
        .ok_or_else(|| not_found("entry not found"))?;
    Ok(json!({ "removed": joined_entry_json(conn, removed)? }))
}

fn get_entry(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let id = get_required_str(params, "entryId")?;
    let entry = store::get(conn, &id)
        .map_err(db_err("db_query_failed"))?
        .ok_or_else(|| not_found("entry not found"))?;
    Ok(json!({ "entry": joined_entry_json(conn, entry)? }))
}

fn list_entries(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let mut filter = EntryFilter::default();
    if let Some(v) = params.get("classId") {
        filter.class_id = Some(
            v.as_str()
                .ok_or_else(|| bad("classId must be a string"))?
                .to_string(),
        );
    }
    if let Some(v) = params.get("teacherId") {
        filter.teacher_id = Some(
            v.as_str()
                .ok_or_else(|| bad("teacherId must be a string"))?
                .to_string(),
        );
    }
    if let Some(v) = params.get("weekday") {
        filter.weekday = Some(parse_weekday(v)?);
    }
    if let Some(v) = params.get("period") {
        filter.period = Some(parse_period(v)?);
    }
    if let Some(v) = params.get("room") {
        filter.room = parse_optional_text(v, "room")?;
    }

    let page = match params.get("page") {
        Some(v) => {
            let n = v.as_i64().ok_or_else(|| bad("page must be an integer"))?;
            if n < 1 {
                return Err(bad("page must be >= 1"));
            }
            n
        }
        None => 1,
    };
    let limit = match params.get("limit") {
        Some(v) => {
            let n = v.as_i64().ok_or_else(|| bad("limit must be an integer"))?;
            if !(1..=200).contains(&n) {
                return Err(bad("limit must be in 1..=200"));
            }
            n
        }
        None => 50,
    };

    let (rows, total) =
        store::list_filtered(conn, &filter, page, limit).map_err(db_err("db_query_failed"))?;
    let views = schedule::resolve_views(conn, rows).map_err(db_err("db_query_failed"))?;

    let total_pages = if total == 0 { 0 } else { (total + limit - 1) / limit };
    Ok(json!({
        "entries": serde_json::to_value(views).unwrap_or(serde_json::Value::Null),
        "pagination": {
            "currentPage": page,
            "totalPages": total_pages,
            "totalItems": total,
            "itemsPerPage": limit,
        }
    }))
}

fn handle_create_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match create_entry(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_update_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match update_entry(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_delete_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match delete_entry(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_get_entry(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match get_entry(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_list_entries(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match list_entries(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.createEntry" => Some(handle_create_entry(state, req)),
        "timetable.updateEntry" => Some(handle_update_entry(state, req)),
        "timetable.deleteEntry" => Some(handle_delete_entry(state, req)),
        "timetable.getEntry" => Some(handle_get_entry(state, req)),
        "timetable.listEntries" => Some(handle_list_entries(state, req)),
        _ => None,
    }
}
