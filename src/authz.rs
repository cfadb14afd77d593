use rusqlite::{params, Connection};

/// Who is asking for a student timetable. Wire values are lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequesterRole {
    Admin,
    Staff,
    Student,
    Guardian,
}

impl RequesterRole {
    pub fn parse(raw: &str) -> Option<RequesterRole> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "admin" => Some(RequesterRole::Admin),
            "staff" => Some(RequesterRole::Staff),
            "student" => Some(RequesterRole::Student),
            "guardian" => Some(RequesterRole::Guardian),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequesterRole::Admin => "admin",
            RequesterRole::Staff => "staff",
            RequesterRole::Student => "student",
            RequesterRole::Guardian => "guardian",
        }
    }
}

/// School staff see every timetable. A student sees only their own and
/// a guardian only students linked to them in the guardian register.
pub fn can_view_student_timetable(
    conn: &Connection,
    role: RequesterRole,
    requester_id: &str,
    student_id: &str,
) -> rusqlite::Result<bool> {
    match role {
        RequesterRole::Admin | RequesterRole::Staff => Ok(true),
        RequesterRole::Student => Ok(requester_id == student_id),
        RequesterRole::Guardian => {
            let linked: i64 = conn.query_row(
                "SELECT COUNT(*) FROM student_guardians
                 WHERE student_id = ? AND guardian_ref = ?",
                params![student_id, requester_id],
                |r| r.get(0),
            )?;
            Ok(linked > 0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        db::init_schema(&conn).expect("init schema");
        conn.execute(
            "INSERT INTO classes(id, name, created_at) VALUES('c1', '8D', '')",
            [],
        )
        .expect("seed class");
        conn.execute(
            "INSERT INTO students(id, name, class_id, created_at)
             VALUES('s1', 'Mina', 'c1', ''), ('s2', 'Theo', 'c1', '')",
            [],
        )
        .expect("seed students");
        conn.execute(
            "INSERT INTO student_guardians(student_id, guardian_ref) VALUES('s1', 'g1')",
            [],
        )
        .expect("seed guardian link");
        conn
    }

    #[test]
    fn parse_accepts_known_roles_case_insensitively() {
        assert_eq!(RequesterRole::parse(" Admin "), Some(RequesterRole::Admin));
        assert_eq!(RequesterRole::parse("GUARDIAN"), Some(RequesterRole::Guardian));
        assert_eq!(RequesterRole::parse("principal"), None);
        assert_eq!(RequesterRole::parse(""), None);
    }

    #[test]
    fn staff_roles_see_everyone() {
        let conn = test_conn();
        for role in [RequesterRole::Admin, RequesterRole::Staff] {
            assert!(can_view_student_timetable(&conn, role, "anyone", "s1").expect("gate"));
            assert!(can_view_student_timetable(&conn, role, "anyone", "s2").expect("gate"));
        }
    }

    #[test]
    fn students_see_only_themselves() {
        let conn = test_conn();
        assert!(can_view_student_timetable(&conn, RequesterRole::Student, "s1", "s1").expect("gate"));
        assert!(!can_view_student_timetable(&conn, RequesterRole::Student, "s2", "s1").expect("gate"));
    }

    #[test]
    fn guardians_see_only_linked_students() {
        let conn = test_conn();
        assert!(
            can_view_student_timetable(&conn, RequesterRole::Guardian, "g1", "s1").expect("gate")
        );
        assert!(
            !can_view_student_timetable(&conn, RequesterRole::Guardian, "g1", "s2").expect("gate")
        );
        assert!(
            !can_view_student_timetable(&conn, RequesterRole::Guardian, "g2", "s1").expect("gate")
        );
    }
}
