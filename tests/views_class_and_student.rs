use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

struct Fixture {
    class_id: String,
    pupil_id: String,
    classless_id: String,
}

const GUARDIAN_REF: &str = "guardian-lee";

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, prefix: &str) -> Fixture {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let class = request_ok(stdin, reader, "s2", "classes.create", json!({ "name": "8D" }));
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s3",
        "classes.subjects.add",
        json!({ "classId": class_id, "name": "Math" }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "s4",
        "teachers.create",
        json!({ "name": "Keller" }),
    );
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId");

    for (id, weekday, period) in [("s5", "mon", 2), ("s6", "mon", 1), ("s7", "wed", 3)] {
        let _ = request_ok(
            stdin,
            reader,
            id,
            "timetable.createEntry",
            json!({
                "classId": class_id,
                "weekday": weekday,
                "period": period,
                "startTime": "08:00",
                "endTime": "08:45",
                "subjectName": "Math",
                "teacherId": teacher_id,
            }),
        );
    }

    let pupil = request_ok(
        stdin,
        reader,
        "s8",
        "students.create",
        json!({ "name": "Omar Lee", "classId": class_id }),
    );
    let pupil_id = pupil["studentId"].as_str().expect("studentId").to_string();
    let _ = request_ok(
        stdin,
        reader,
        "s9",
        "students.guardians.add",
        json!({ "studentId": pupil_id, "guardianRef": GUARDIAN_REF }),
    );
    let classless = request_ok(
        stdin,
        reader,
        "s10",
        "students.create",
        json!({ "name": "Nina Odum" }),
    );
    Fixture {
        class_id,
        pupil_id,
        classless_id: classless["studentId"].as_str().expect("studentId").to_string(),
    }
}

#[test]
fn class_week_always_carries_six_day_buckets() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let f = seed(&mut stdin, &mut reader, "timetabled-class-week");

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.classWeek",
        json!({ "classId": f.class_id }),
    );
    assert_eq!(view["class"]["name"].as_str(), Some("8D"));

    let grid = view["grid"].as_object().expect("grid object");
    for day in ["mon", "tue", "wed", "thu", "fri", "sat"] {
        assert!(grid.contains_key(day), "missing bucket for {}", day);
    }
    // Empty days are present as empty lists, not omitted.
    assert_eq!(grid["tue"].as_array().map(|a| a.len()), Some(0));

    let monday: Vec<i64> = grid["mon"]
        .as_array()
        .expect("mon bucket")
        .iter()
        .map(|e| e["period"].as_i64().expect("period"))
        .collect();
    assert_eq!(monday, vec![1, 2]);

    assert_eq!(view["entries"].as_array().map(|a| a.len()), Some(3));
}

#[test]
fn class_week_for_an_unknown_class_is_not_found() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _f = seed(&mut stdin, &mut reader, "timetabled-class-week-miss");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.classWeek",
        json!({ "classId": "ghost-class" }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("not_found"));
}

#[test]
fn student_week_mirrors_the_class_grid() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let f = seed(&mut stdin, &mut reader, "timetabled-student-week");

    let view = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.studentWeek",
        json!({
            "studentId": f.pupil_id,
            "requesterRole": "admin",
            "requesterId": "office-1",
        }),
    );
    assert_eq!(view["student"]["name"].as_str(), Some("Omar Lee"));
    assert_eq!(view["class"]["id"].as_str(), Some(f.class_id.as_str()));
    assert_eq!(
        view["grid"]["mon"].as_array().map(|a| a.len()),
        Some(2),
        "the pupil sees the class bookings"
    );
}

#[test]
fn the_viewing_gate_checks_each_role() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let f = seed(&mut stdin, &mut reader, "timetabled-student-gate");

    let params = |role: &str, requester: &str| {
        json!({
            "studentId": f.pupil_id,
            "requesterRole": role,
            "requesterId": requester,
        })
    };

    // Pupils see themselves.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.studentWeek",
        params("student", &f.pupil_id),
    );

    // A different pupil is turned away.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.studentWeek",
        params("student", "someone-else"),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("forbidden"));
    assert_eq!(
        e.get("details")
            .and_then(|d| d.get("requesterRole"))
            .and_then(|v| v.as_str()),
        Some("student")
    );

    // Linked guardians pass, unlinked ones do not.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.studentWeek",
        params("guardian", GUARDIAN_REF),
    );
    let e = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.studentWeek",
        params("guardian", "guardian-stranger"),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("forbidden"));

    // Staff need no link at all.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.studentWeek",
        params("staff", "sec-1"),
    );

    let e = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "timetable.studentWeek",
        params("janitor", "j-1"),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("bad_params"));
}

#[test]
fn an_unknown_student_is_reported_before_the_gate_runs() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _f = seed(&mut stdin, &mut reader, "timetabled-student-unknown");

    // Even a requester who would be turned away learns only not_found.
    let e = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.studentWeek",
        json!({
            "studentId": "ghost-student",
            "requesterRole": "student",
            "requesterId": "someone-else",
        }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("not_found"));
}

#[test]
fn a_student_without_a_class_cannot_be_projected() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let f = seed(&mut stdin, &mut reader, "timetabled-student-classless");

    let e = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.studentWeek",
        json!({
            "studentId": f.classless_id,
            "requesterRole": "admin",
            "requesterId": "office-1",
        }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("bad_params"));
}
