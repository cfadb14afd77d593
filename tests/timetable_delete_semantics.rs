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

fn seed_entry(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let workspace = temp_dir("timetabled-delete");
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
    let teacher_id = teacher["teacherId"].as_str().expect("teacherId").to_string();
    let created = request_ok(
        stdin,
        reader,
        "s5",
        "timetable.createEntry",
        json!({
            "classId": class_id,
            "weekday": "fri",
            "period": 3,
            "startTime": "10:00",
            "endTime": "10:45",
            "subjectName": "Math",
            "teacherId": teacher_id,
            "room": "R7",
        }),
    );
    created["entry"]["id"].as_str().expect("id").to_string()
}

#[test]
fn delete_returns_the_removed_entry_and_frees_its_slot() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let entry_id = seed_entry(&mut stdin, &mut reader);

    let removed = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.deleteEntry",
        json!({ "entryId": entry_id }),
    );
    let removed = removed.get("removed").expect("removed entry");
    assert_eq!(
        removed.get("id").and_then(|v| v.as_str()),
        Some(entry_id.as_str())
    );
    // The snapshot keeps its joined names even though the row is gone.
    assert_eq!(
        removed.get("className").and_then(|v| v.as_str()),
        Some("8D")
    );
    assert_eq!(
        removed.get("teacherName").and_then(|v| v.as_str()),
        Some("Keller")
    );

    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.getEntry",
        json!({ "entryId": entry_id }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("not_found"));

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.listEntries",
        json!({}),
    );
    assert_eq!(
        list.get("pagination")
            .and_then(|p| p.get("totalItems"))
            .and_then(|v| v.as_i64()),
        Some(0)
    );
}

#[test]
fn deleting_twice_reports_not_found_the_second_time() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let entry_id = seed_entry(&mut stdin, &mut reader);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.deleteEntry",
        json!({ "entryId": entry_id }),
    );
    let e = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.deleteEntry",
        json!({ "entryId": entry_id }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("not_found"));
}

#[test]
fn deleting_an_unknown_entry_changes_nothing() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _entry_id = seed_entry(&mut stdin, &mut reader);

    let e = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "timetable.deleteEntry",
        json!({ "entryId": "ghost-entry" }),
    );
    assert_eq!(e.get("code").and_then(|v| v.as_str()), Some("not_found"));

    let list = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.listEntries",
        json!({}),
    );
    assert_eq!(
        list.get("pagination")
            .and_then(|p| p.get("totalItems"))
            .and_then(|v| v.as_i64()),
        Some(1)
    );
}
