use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "timetable.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates the full current schema on a connection. Split out of
/// `open_db` so unit tests can run against `Connection::open_in_memory`.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // Subject names collate NOCASE so the roster uniqueness rule and the
    // entry-subject membership check share one case-folding behavior.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL COLLATE NOCASE,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_subjects_class ON class_subjects(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;

    // Guardian refs are identity-service ids, not rows of our own.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_guardians(
            student_id TEXT NOT NULL,
            guardian_ref TEXT NOT NULL,
            PRIMARY KEY(student_id, guardian_ref),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;

    // weekday is the ordinal of the fixed Mon..Sat order (0..5) so that
    // ORDER BY weekday, period is the canonical listing order.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_entries(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            weekday INTEGER NOT NULL,
            period INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            subject_name TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            room TEXT,
            notes TEXT,
            is_substitute INTEGER NOT NULL DEFAULT 0,
            original_teacher_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(original_teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    ensure_entries_notes(conn)?;

    // The three scheduling invariants, enforced at the storage layer as
    // the last line of defense behind the pre-write conflict check.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_entries_class_slot
         ON timetable_entries(class_id, weekday, period)",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_entries_teacher_slot
         ON timetable_entries(teacher_id, weekday, period)",
        [],
    )?;
    // Entries without a room never collide on the room dimension.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS uq_entries_room_slot
         ON timetable_entries(room, weekday, period) WHERE room IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_class ON timetable_entries(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_teacher ON timetable_entries(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

// Workspaces created before notes shipped lack the column; the CREATE
// above covers fresh databases.
fn ensure_entries_notes(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "timetable_entries", "notes")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE timetable_entries ADD COLUMN notes TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let text = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &text),
    )?;
    Ok(())
}

/// RFC-3339 UTC stamp used for created_at/updated_at columns.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_round_trip_and_overwrite() {
        let conn = Connection::open_in_memory().expect("open");
        init_schema(&conn).expect("schema");

        assert!(settings_get_json(&conn, "setup.timetable")
            .expect("get")
            .is_none());

        settings_set_json(&conn, "setup.timetable", &json!({ "maxPeriodsPerDay": 6 }))
            .expect("set");
        settings_set_json(&conn, "setup.timetable", &json!({ "maxPeriodsPerDay": 9 }))
            .expect("overwrite");

        let saved = settings_get_json(&conn, "setup.timetable")
            .expect("get")
            .expect("value");
        assert_eq!(saved["maxPeriodsPerDay"].as_i64(), Some(9));
    }

    #[test]
    fn notes_column_is_backfilled_on_old_databases() {
        let conn = Connection::open_in_memory().expect("open");
        // The pre-notes table shape, as shipped before the column existed.
        conn.execute(
            "CREATE TABLE timetable_entries(
                id TEXT PRIMARY KEY,
                class_id TEXT NOT NULL,
                weekday INTEGER NOT NULL,
                period INTEGER NOT NULL,
                start_time TEXT NOT NULL,
                end_time TEXT NOT NULL,
                subject_name TEXT NOT NULL,
                teacher_id TEXT NOT NULL,
                room TEXT,
                is_substitute INTEGER NOT NULL DEFAULT 0,
                original_teacher_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )
        .expect("old table");
        assert!(!table_has_column(&conn, "timetable_entries", "notes").expect("probe"));

        init_schema(&conn).expect("schema");
        assert!(table_has_column(&conn, "timetable_entries", "notes").expect("probe"));
    }
}
