use rusqlite::Connection;

use crate::schedule::Weekday;
use crate::store::{self, TimetableEntry};

/// The mutual-exclusion dimension a slot claim collided on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    Class,
    Teacher,
    Room,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::Class => "class",
            ConflictKind::Teacher => "teacher",
            ConflictKind::Room => "room",
        }
    }
}

/// A detected collision, carrying the already-booked entry so callers
/// can report which booking is in the way.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub entry: TimetableEntry,
}

/// The slot an entry wants to occupy. `room` is None for roomless
/// lessons, which never contend for rooms.
#[derive(Debug, Clone, Copy)]
pub struct SlotClaim<'a> {
    pub class_id: &'a str,
    pub teacher_id: &'a str,
    pub room: Option<&'a str>,
    pub weekday: Weekday,
    pub period: i64,
}

/// Probes the three exclusion dimensions in fixed order (class, then
/// teacher, then room) and reports the first collision. `exclude_id`
/// lets an update ignore the entry being rewritten, so keeping or
/// partially changing a slot never collides with itself.
pub fn check_slot(
    conn: &Connection,
    claim: SlotClaim,
    exclude_id: Option<&str>,
) -> rusqlite::Result<Option<Conflict>> {
    if let Some(entry) =
        store::find_by_class_slot(conn, claim.class_id, claim.weekday, claim.period, exclude_id)?
    {
        return Ok(Some(Conflict { kind: ConflictKind::Class, entry }));
    }
    if let Some(entry) = store::find_by_teacher_slot(
        conn,
        claim.teacher_id,
        claim.weekday,
        claim.period,
        exclude_id,
    )? {
        return Ok(Some(Conflict { kind: ConflictKind::Teacher, entry }));
    }
    if let Some(room) = claim.room {
        if let Some(entry) =
            store::find_by_room_slot(conn, room, claim.weekday, claim.period, exclude_id)?
        {
            return Ok(Some(Conflict { kind: ConflictKind::Room, entry }));
        }
    }
    Ok(None)
}

/// Maps a UNIQUE violation from the slot indexes back to its dimension.
/// A write can still trip the indexes after validation passed when two
/// writers race; the caller turns that into the same conflict answer a
/// pre-checked collision gets. Non-slot constraint errors return None.
pub fn classify_unique_violation(err: &rusqlite::Error) -> Option<ConflictKind> {
    let rusqlite::Error::SqliteFailure(code, Some(message)) = err else {
        return None;
    };
    if code.code != rusqlite::ErrorCode::ConstraintViolation {
        return None;
    }
    if !message.contains("UNIQUE constraint failed") {
        return None;
    }
    if message.contains("timetable_entries.class_id") {
        Some(ConflictKind::Class)
    } else if message.contains("timetable_entries.teacher_id") {
        Some(ConflictKind::Teacher)
    } else if message.contains("timetable_entries.room") {
        Some(ConflictKind::Room)
    } else {
        None
    }
}
