use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::schedule::Weekday;

/// One scheduled teaching period: a class, on a weekday, at a period
/// ordinal, with a teacher and optionally a room. The subject name is a
/// denormalized copy validated against the class roster at write time.
#[derive(Debug, Clone)]
pub struct TimetableEntry {
    pub id: String,
    pub class_id: String,
    pub weekday: Weekday,
    pub period: i64,
    pub start_time: String,
    pub end_time: String,
    pub subject_name: String,
    pub teacher_id: String,
    pub room: Option<String>,
    pub notes: Option<String>,
    pub is_substitute: bool,
    pub original_teacher_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

const ENTRY_COLS: &str = "id, class_id, weekday, period, start_time, end_time, subject_name, \
                          teacher_id, room, notes, is_substitute, original_teacher_id, \
                          created_at, updated_at";

fn entry_from_row(r: &Row) -> rusqlite::Result<TimetableEntry> {
    let weekday_ord: i64 = r.get(2)?;
    let weekday = Weekday::from_ord(weekday_ord).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Integer,
            format!("weekday ordinal {} out of range", weekday_ord).into(),
        )
    })?;
    Ok(TimetableEntry {
        id: r.get(0)?,
        class_id: r.get(1)?,
        weekday,
        period: r.get(3)?,
        start_time: r.get(4)?,
        end_time: r.get(5)?,
        subject_name: r.get(6)?,
        teacher_id: r.get(7)?,
        room: r.get(8)?,
        notes: r.get(9)?,
        is_substitute: r.get::<_, i64>(10)? != 0,
        original_teacher_id: r.get(11)?,
        created_at: r.get(12)?,
        updated_at: r.get(13)?,
    })
}

/// Unconditional insert. Callers run conflict validation first; the
/// UNIQUE slot indexes still veto a raced write with a constraint error.
pub fn insert(conn: &Connection, e: &TimetableEntry) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO timetable_entries(
            id, class_id, weekday, period, start_time, end_time, subject_name,
            teacher_id, room, notes, is_substitute, original_teacher_id,
            created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            e.id,
            e.class_id,
            e.weekday.ord(),
            e.period,
            e.start_time,
            e.end_time,
            e.subject_name,
            e.teacher_id,
            e.room,
            e.notes,
            e.is_substitute as i64,
            e.original_teacher_id,
            e.created_at,
            e.updated_at,
        ],
    )?;
    Ok(())
}

/// Full-row replacement of an existing entry; created_at is preserved.
/// Returns false when the id is unknown.
pub fn replace(conn: &Connection, e: &TimetableEntry) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE timetable_entries SET
            class_id = ?, weekday = ?, period = ?, start_time = ?, end_time = ?,
            subject_name = ?, teacher_id = ?, room = ?, notes = ?,
            is_substitute = ?, original_teacher_id = ?, updated_at = ?
         WHERE id = ?",
        params![
            e.class_id,
            e.weekday.ord(),
            e.period,
            e.start_time,
            e.end_time,
            e.subject_name,
            e.teacher_id,
            e.room,
            e.notes,
            e.is_substitute as i64,
            e.original_teacher_id,
            e.updated_at,
            e.id,
        ],
    )?;
    Ok(changed == 1)
}

/// Deletes by id, handing back the removed row for display. None when
/// the id is unknown; nothing else is touched in that case.
pub fn remove(conn: &Connection, id: &str) -> rusqlite::Result<Option<TimetableEntry>> {
    let Some(existing) = get(conn, id)? else {
        return Ok(None);
    };
    conn.execute("DELETE FROM timetable_entries WHERE id = ?", [id])?;
    Ok(Some(existing))
}

pub fn get(conn: &Connection, id: &str) -> rusqlite::Result<Option<TimetableEntry>> {
    conn.query_row(
        &format!("SELECT {} FROM timetable_entries WHERE id = ?", ENTRY_COLS),
        [id],
        entry_from_row,
    )
    .optional()
}

pub fn find_by_class_slot(
    conn: &Connection,
    class_id: &str,
    weekday: Weekday,
    period: i64,
    exclude_id: Option<&str>,
) -> rusqlite::Result<Option<TimetableEntry>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM timetable_entries
             WHERE class_id = ?1 AND weekday = ?2 AND period = ?3
               AND (?4 IS NULL OR id <> ?4)",
            ENTRY_COLS
        ),
        params![class_id, weekday.ord(), period, exclude_id],
        entry_from_row,
    )
    .optional()
}

pub fn find_by_teacher_slot(
    conn: &Connection,
    teacher_id: &str,
    weekday: Weekday,
    period: i64,
    exclude_id: Option<&str>,
) -> rusqlite::Result<Option<TimetableEntry>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM timetable_entries
             WHERE teacher_id = ?1 AND weekday = ?2 AND period = ?3
               AND (?4 IS NULL OR id <> ?4)",
            ENTRY_COLS
        ),
        params![teacher_id, weekday.ord(), period, exclude_id],
        entry_from_row,
    )
    .optional()
}

pub fn find_by_room_slot(
    conn: &Connection,
    room: &str,
    weekday: Weekday,
    period: i64,
    exclude_id: Option<&str>,
) -> rusqlite::Result<Option<TimetableEntry>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM timetable_entries
             WHERE room = ?1 AND weekday = ?2 AND period = ?3
               AND (?4 IS NULL OR id <> ?4)",
            ENTRY_COLS
        ),
        params![room, weekday.ord(), period, exclude_id],
        entry_from_row,
    )
    .optional()
}

pub fn list_by_class(conn: &Connection, class_id: &str) -> rusqlite::Result<Vec<TimetableEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM timetable_entries WHERE class_id = ? ORDER BY weekday, period",
        ENTRY_COLS
    ))?;
    let rows = stmt.query_map([class_id], entry_from_row)?;
    rows.collect()
}

pub fn list_by_teacher(conn: &Connection, teacher_id: &str) -> rusqlite::Result<Vec<TimetableEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM timetable_entries WHERE teacher_id = ? ORDER BY weekday, period",
        ENTRY_COLS
    ))?;
    let rows = stmt.query_map([teacher_id], entry_from_row)?;
    rows.collect()
}

#[derive(Debug, Default, Clone)]
pub struct EntryFilter {
    pub class_id: Option<String>,
    pub teacher_id: Option<String>,
    pub weekday: Option<Weekday>,
    pub period: Option<i64>,
    pub room: Option<String>,
}

/// Filtered page in canonical (weekday, period) order with the unpaged
/// total for pagination metadata. `page` is 1-based.
pub fn list_filtered(
    conn: &Connection,
    filter: &EntryFilter,
    page: i64,
    limit: i64,
) -> rusqlite::Result<(Vec<TimetableEntry>, i64)> {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut args: Vec<Value> = Vec::new();
    if let Some(v) = &filter.class_id {
        clauses.push("class_id = ?");
        args.push(Value::Text(v.clone()));
    }
    if let Some(v) = &filter.teacher_id {
        clauses.push("teacher_id = ?");
        args.push(Value::Text(v.clone()));
    }
    if let Some(day) = filter.weekday {
        clauses.push("weekday = ?");
        args.push(Value::Integer(day.ord()));
    }
    if let Some(p) = filter.period {
        clauses.push("period = ?");
        args.push(Value::Integer(p));
    }
    if let Some(v) = &filter.room {
        clauses.push("room = ?");
        args.push(Value::Text(v.clone()));
    }
    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM timetable_entries{}", where_sql),
        params_from_iter(args.iter()),
        |r| r.get(0),
    )?;

    let mut data_args = args;
    data_args.push(Value::Integer(limit));
    data_args.push(Value::Integer((page - 1) * limit));
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM timetable_entries{} ORDER BY weekday, period, id LIMIT ? OFFSET ?",
        ENTRY_COLS, where_sql
    ))?;
    let rows = stmt
        .query_map(params_from_iter(data_args.iter()), entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok((rows, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn.execute(
            "INSERT INTO classes(id, name, created_at) VALUES('c1', '8D', ''), ('c2', '9A', '')",
            [],
        )
        .expect("seed classes");
        conn.execute(
            "INSERT INTO teachers(id, name, created_at) VALUES('t1', 'Keller', ''), ('t2', 'Ryan', '')",
            [],
        )
        .expect("seed teachers");
        conn
    }

    fn sample(id: &str, class: &str, day: Weekday, period: i64, teacher: &str) -> TimetableEntry {
        TimetableEntry {
            id: id.to_string(),
            class_id: class.to_string(),
            weekday: day,
            period,
            start_time: "08:00".to_string(),
            end_time: "08:45".to_string(),
            subject_name: "Math".to_string(),
            teacher_id: teacher.to_string(),
            room: None,
            notes: None,
            is_substitute: false,
            original_teacher_id: None,
            created_at: "2025-09-01T00:00:00+00:00".to_string(),
            updated_at: "2025-09-01T00:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn insert_then_get_round_trips_all_fields() {
        let conn = test_conn();
        let mut e = sample("e1", "c1", Weekday::Wed, 3, "t1");
        e.room = Some("R1".to_string());
        e.notes = Some("bring calculators".to_string());
        e.is_substitute = true;
        e.original_teacher_id = Some("t2".to_string());
        insert(&conn, &e).expect("insert");

        let got = get(&conn, "e1").expect("get").expect("entry exists");
        assert_eq!(got.class_id, "c1");
        assert_eq!(got.weekday, Weekday::Wed);
        assert_eq!(got.period, 3);
        assert_eq!(got.room.as_deref(), Some("R1"));
        assert_eq!(got.notes.as_deref(), Some("bring calculators"));
        assert!(got.is_substitute);
        assert_eq!(got.original_teacher_id.as_deref(), Some("t2"));
    }

    #[test]
    fn slot_finders_honor_the_exclusion_id() {
        let conn = test_conn();
        insert(&conn, &sample("e1", "c1", Weekday::Mon, 1, "t1")).expect("insert");

        let hit = find_by_class_slot(&conn, "c1", Weekday::Mon, 1, None).expect("query");
        assert_eq!(hit.map(|e| e.id), Some("e1".to_string()));

        let excluded =
            find_by_class_slot(&conn, "c1", Weekday::Mon, 1, Some("e1")).expect("query");
        assert!(excluded.is_none());

        let other_slot = find_by_teacher_slot(&conn, "t1", Weekday::Mon, 2, None).expect("query");
        assert!(other_slot.is_none());
    }

    #[test]
    fn roomless_entries_never_match_a_room_lookup() {
        let conn = test_conn();
        insert(&conn, &sample("e1", "c1", Weekday::Mon, 1, "t1")).expect("insert");
        let hit = find_by_room_slot(&conn, "R1", Weekday::Mon, 1, None).expect("query");
        assert!(hit.is_none());
    }

    #[test]
    fn unique_indexes_reject_a_raced_second_writer() {
        let conn = test_conn();
        insert(&conn, &sample("e1", "c1", Weekday::Mon, 1, "t1")).expect("insert");

        // Same class slot, different teacher.
        let class_clash = sample("e2", "c1", Weekday::Mon, 1, "t2");
        assert!(insert(&conn, &class_clash).is_err());

        // Same teacher slot, different class.
        let teacher_clash = sample("e3", "c2", Weekday::Mon, 1, "t1");
        assert!(insert(&conn, &teacher_clash).is_err());

        // Same room slot.
        let mut roomed = sample("e4", "c2", Weekday::Tue, 1, "t1");
        roomed.room = Some("R1".to_string());
        insert(&conn, &roomed).expect("insert roomed");
        let mut room_clash = sample("e5", "c1", Weekday::Tue, 1, "t2");
        room_clash.room = Some("R1".to_string());
        assert!(insert(&conn, &room_clash).is_err());
    }

    #[test]
    fn missing_rooms_do_not_collide_with_each_other() {
        let conn = test_conn();
        insert(&conn, &sample("e1", "c1", Weekday::Mon, 1, "t1")).expect("insert");
        // Second roomless entry in the same (weekday, period) is fine.
        insert(&conn, &sample("e2", "c2", Weekday::Mon, 1, "t2")).expect("insert");
    }

    #[test]
    fn replace_moves_the_entry_to_a_new_slot() {
        let conn = test_conn();
        insert(&conn, &sample("e1", "c1", Weekday::Mon, 1, "t1")).expect("insert");
        let mut moved = sample("e1", "c1", Weekday::Fri, 6, "t1");
        moved.updated_at = "2025-09-02T00:00:00+00:00".to_string();
        assert!(replace(&conn, &moved).expect("replace"));

        let got = get(&conn, "e1").expect("get").expect("entry");
        assert_eq!(got.weekday, Weekday::Fri);
        assert_eq!(got.period, 6);
        assert_eq!(got.created_at, "2025-09-01T00:00:00+00:00");
        assert_eq!(got.updated_at, "2025-09-02T00:00:00+00:00");

        let ghost = sample("missing", "c1", Weekday::Mon, 1, "t1");
        assert!(!replace(&conn, &ghost).expect("replace missing"));
    }

    #[test]
    fn remove_returns_the_row_and_leaves_nothing_behind() {
        let conn = test_conn();
        insert(&conn, &sample("e1", "c1", Weekday::Mon, 1, "t1")).expect("insert");
        let removed = remove(&conn, "e1").expect("remove").expect("row");
        assert_eq!(removed.id, "e1");
        assert!(get(&conn, "e1").expect("get").is_none());
        assert!(remove(&conn, "e1").expect("second remove").is_none());
    }

    #[test]
    fn list_filtered_orders_by_weekday_then_period_and_pages() {
        let conn = test_conn();
        insert(&conn, &sample("a", "c1", Weekday::Sat, 1, "t1")).expect("insert");
        insert(&conn, &sample("b", "c1", Weekday::Mon, 2, "t1")).expect("insert");
        insert(&conn, &sample("c", "c1", Weekday::Mon, 1, "t2")).expect("insert");
        insert(&conn, &sample("d", "c2", Weekday::Tue, 1, "t2")).expect("insert");

        let (all, total) = list_filtered(&conn, &EntryFilter::default(), 1, 50).expect("list");
        assert_eq!(total, 4);
        let ids: Vec<&str> = all.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "d", "a"]);

        let (page2, total2) = list_filtered(&conn, &EntryFilter::default(), 2, 3).expect("list");
        assert_eq!(total2, 4);
        assert_eq!(page2.len(), 1);
        assert_eq!(page2[0].id, "a");

        let filter = EntryFilter {
            class_id: Some("c1".to_string()),
            weekday: Some(Weekday::Mon),
            ..Default::default()
        };
        let (mon_c1, mon_total) = list_filtered(&conn, &filter, 1, 50).expect("list");
        assert_eq!(mon_total, 2);
        assert_eq!(mon_c1[0].id, "c");
        assert_eq!(mon_c1[1].id, "b");
    }

    #[test]
    fn list_by_class_and_teacher_use_week_order() {
        let conn = test_conn();
        insert(&conn, &sample("a", "c1", Weekday::Wed, 2, "t1")).expect("insert");
        insert(&conn, &sample("b", "c1", Weekday::Mon, 4, "t2")).expect("insert");
        insert(&conn, &sample("c", "c2", Weekday::Mon, 4, "t1")).expect("insert");

        let for_class: Vec<String> = list_by_class(&conn, "c1")
            .expect("list")
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(for_class, vec!["b".to_string(), "a".to_string()]);

        let for_teacher: Vec<String> = list_by_teacher(&conn, "t1")
            .expect("list")
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(for_teacher, vec!["c".to_string(), "a".to_string()]);
    }
}
