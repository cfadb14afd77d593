use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use crate::store::TimetableEntry;

/// School weekdays in their fixed timetable order. Sunday has no slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
}

impl Weekday {
    pub const ALL: [Weekday; 6] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
    ];

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mon" => Some(Self::Mon),
            "tue" => Some(Self::Tue),
            "wed" => Some(Self::Wed),
            "thu" => Some(Self::Thu),
            "fri" => Some(Self::Fri),
            "sat" => Some(Self::Sat),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mon => "mon",
            Self::Tue => "tue",
            Self::Wed => "wed",
            Self::Thu => "thu",
            Self::Fri => "fri",
            Self::Sat => "sat",
        }
    }

    /// Position in the fixed Mon..Sat order; also the stored column value.
    pub fn ord(self) -> i64 {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
        }
    }

    pub fn from_ord(ord: i64) -> Option<Self> {
        Self::ALL.get(usize::try_from(ord).ok()?).copied()
    }
}

/// A timetable entry joined with the display names callers want to see.
/// Assembled read-side only; the entry store never consults the class or
/// teacher directories on its write path.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub id: String,
    pub class_id: String,
    pub class_name: String,
    pub weekday: Weekday,
    pub period: i64,
    pub start_time: String,
    pub end_time: String,
    pub subject_name: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub room: Option<String>,
    pub notes: Option<String>,
    pub is_substitute: bool,
    pub original_teacher_id: Option<String>,
    pub original_teacher_name: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn name_map(conn: &Connection, table: &str) -> rusqlite::Result<HashMap<String, String>> {
    let sql = format!("SELECT id, name FROM {}", table);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    rows.collect()
}

/// Joins stored entries with class/teacher display names.
pub fn resolve_views(
    conn: &Connection,
    entries: Vec<TimetableEntry>,
) -> rusqlite::Result<Vec<EntryView>> {
    let class_names = name_map(conn, "classes")?;
    let teacher_names = name_map(conn, "teachers")?;
    let views = entries
        .into_iter()
        .map(|e| {
            let class_name = class_names.get(&e.class_id).cloned().unwrap_or_default();
            let teacher_name = teacher_names.get(&e.teacher_id).cloned().unwrap_or_default();
            let original_teacher_name = e
                .original_teacher_id
                .as_ref()
                .and_then(|id| teacher_names.get(id).cloned());
            EntryView {
                id: e.id,
                class_id: e.class_id,
                class_name,
                weekday: e.weekday,
                period: e.period,
                start_time: e.start_time,
                end_time: e.end_time,
                subject_name: e.subject_name,
                teacher_id: e.teacher_id,
                teacher_name,
                room: e.room,
                notes: e.notes,
                is_substitute: e.is_substitute,
                original_teacher_id: e.original_teacher_id,
                original_teacher_name,
                created_at: e.created_at,
                updated_at: e.updated_at,
            }
        })
        .collect();
    Ok(views)
}

pub fn resolve_view(conn: &Connection, entry: TimetableEntry) -> rusqlite::Result<EntryView> {
    let mut views = resolve_views(conn, vec![entry])?;
    Ok(views.remove(0))
}

/// Buckets entries into the six weekdays, each bucket sorted ascending by
/// period. Days with no entries are present as empty arrays so view
/// consumers can always render a full week.
pub fn build_grid(entries: &[EntryView]) -> Map<String, Value> {
    let mut grid = Map::new();
    for day in Weekday::ALL {
        let mut bucket: Vec<&EntryView> = entries.iter().filter(|e| e.weekday == day).collect();
        bucket.sort_by_key(|e| e.period);
        let items: Vec<Value> = bucket
            .into_iter()
            .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
            .collect();
        grid.insert(day.as_str().to_string(), Value::Array(items));
    }
    grid
}

/// Ascending complement of `booked` within 1..=max_period. Bookings past
/// the maximum stay visible in the grid but do not create free slots.
pub fn free_periods(max_period: i64, booked: &[i64]) -> Vec<i64> {
    (1..=max_period).filter(|p| !booked.contains(p)).collect()
}

/// Free periods per weekday for one teacher's week, as a wire-ready map.
pub fn free_periods_by_day(max_period: i64, entries: &[EntryView]) -> Map<String, Value> {
    let mut out = Map::new();
    for day in Weekday::ALL {
        let booked: Vec<i64> = entries
            .iter()
            .filter(|e| e.weekday == day)
            .map(|e| e.period)
            .collect();
        out.insert(
            day.as_str().to_string(),
            json!(free_periods(max_period, &booked)),
        );
    }
    out
}

/// Splits a week into (regular, substitute) halves, preserving the
/// incoming (weekday, period) order in both.
pub fn partition_substitutes(entries: &[EntryView]) -> (Vec<EntryView>, Vec<EntryView>) {
    let mut regular = Vec::new();
    let mut substitute = Vec::new();
    for e in entries {
        if e.is_substitute {
            substitute.push(e.clone());
        } else {
            regular.push(e.clone());
        }
    }
    (regular, substitute)
}
