use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::schedule::Weekday;
use serde_json::json;
use std::path::PathBuf;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn handle_export_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bundle_export_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    // The export may target a workspace other than the selected one, so
    // the count comes from that workspace's database, not the live handle.
    let entry_count = rusqlite::Connection::open(workspace_path.join(db::DB_FILE_NAME))
        .and_then(|c| c.query_row("SELECT COUNT(*) FROM timetable_entries", [], |r| r.get::<_, i64>(0)));
    let entry_count = match entry_count {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_import_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match req.params.get("inPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing inPath", None),
    };
    let workspace_path = req
        .params
        .get("workspacePath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }
    if let Err(e) = std::fs::create_dir_all(&workspace_path) {
        return err(
            &req.id,
            "bundle_import_failed",
            e.to_string(),
            Some(json!({ "path": workspace_path.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bundle_import_failed",
                e.to_string(),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", e.to_string(), None),
    }
}

fn handle_export_timetable_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
    };

    let mut clauses: Vec<&'static str> = Vec::new();
    let mut args: Vec<rusqlite::types::Value> = Vec::new();
    if let Some(class_id) = req.params.get("classId").and_then(|v| v.as_str()) {
        clauses.push("e.class_id = ?");
        args.push(rusqlite::types::Value::Text(class_id.to_string()));
    }
    if let Some(teacher_id) = req.params.get("teacherId").and_then(|v| v.as_str()) {
        clauses.push("e.teacher_id = ?");
        args.push(rusqlite::types::Value::Text(teacher_id.to_string()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let mut stmt = match conn.prepare(&format!(
        "SELECT e.id, c.name, e.weekday, e.period, e.start_time, e.end_time,
                e.subject_name, t.name, e.room, e.is_substitute, ot.name, e.notes
         FROM timetable_entries e
         JOIN classes c ON c.id = e.class_id
         JOIN teachers t ON t.id = e.teacher_id
         LEFT JOIN teachers ot ON ot.id = e.original_teacher_id{}
         ORDER BY e.weekday, e.period, c.name",
        where_sql
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = match stmt
        .query_map(rusqlite::params_from_iter(args.iter()), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
                r.get::<_, String>(7)?,
                r.get::<_, Option<String>>(8)?,
                r.get::<_, i64>(9)?,
                r.get::<_, Option<String>>(10)?,
                r.get::<_, Option<String>>(11)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut csv = String::from(
        "entry_id,class,weekday,period,start_time,end_time,subject,teacher,room,is_substitute,original_teacher,notes\n",
    );
    let rows_exported = rows.len();
    for (
        entry_id,
        class,
        weekday_ord,
        period,
        start_time,
        end_time,
        subject,
        teacher,
        room,
        is_substitute,
        original_teacher,
        notes,
    ) in rows
    {
        let weekday = Weekday::from_ord(weekday_ord)
            .map(|w| w.as_str())
            .unwrap_or("");
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{},{}\n",
            csv_quote(&entry_id),
            csv_quote(&class),
            weekday,
            period,
            csv_quote(&start_time),
            csv_quote(&end_time),
            csv_quote(&subject),
            csv_quote(&teacher),
            csv_quote(room.as_deref().unwrap_or("")),
            is_substitute != 0,
            csv_quote(original_teacher.as_deref().unwrap_or("")),
            csv_quote(notes.as_deref().unwrap_or(""))
        ));
    }

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out, csv) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        );
    }

    ok(
        &req.id,
        json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "workspace.exportBundle" => Some(handle_export_bundle(state, req)),
        "workspace.importBundle" => Some(handle_import_bundle(state, req)),
        "exchange.exportTimetableCsv" => Some(handle_export_timetable_csv(state, req)),
        _ => None,
    }
}
