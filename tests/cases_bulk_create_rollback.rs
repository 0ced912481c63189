use rusqlite::Connection;
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

fn db_path(workspace: &PathBuf) -> PathBuf {
    workspace.join("casework.sqlite3")
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_caseworkd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn caseworkd");
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

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, value))
        .to_string()
}

struct Seed {
    division_id: String,
    status_id: String,
    priority_id: String,
    assignee_id: String,
    student_id: String,
}

fn seed_workspace(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Seed {
    let _ = request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let division = request_ok(
        stdin,
        reader,
        "s2",
        "divisions.create",
        json!({ "name": "Advising" }),
    );
    let status = request_ok(
        stdin,
        reader,
        "s3",
        "caseStatuses.create",
        json!({ "name": "Open" }),
    );
    let priority = request_ok(
        stdin,
        reader,
        "s4",
        "casePriorities.create",
        json!({ "name": "High" }),
    );
    let creator = request_ok(
        stdin,
        reader,
        "s5",
        "users.create",
        json!({ "name": "Dana Ruiz" }),
    );
    let assignee = request_ok(
        stdin,
        reader,
        "s6",
        "users.create",
        json!({ "name": "Lee Osei" }),
    );
    let student = request_ok(
        stdin,
        reader,
        "s7",
        "students.create",
        json!({ "lastName": "Alvarez", "firstName": "Mia" }),
    );
    let _ = request_ok(
        stdin,
        reader,
        "s8",
        "session.signIn",
        json!({ "userId": str_field(&creator, "userId") }),
    );
    Seed {
        division_id: str_field(&division, "divisionId"),
        status_id: str_field(&status, "statusId"),
        priority_id: str_field(&priority, "priorityId"),
        assignee_id: str_field(&assignee, "userId"),
        student_id: str_field(&student, "studentId"),
    }
}

fn assert_no_cases(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, id: &str) {
    let listed = request_ok(stdin, reader, id, "cases.list", json!({}));
    assert_eq!(
        listed.get("cases").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(0),
        "rollback left case rows behind"
    );
}

// Counted straight from the database; cases.list cannot see orphaned
// assignment rows.
fn assert_empty_case_tables(workspace: &PathBuf) {
    let conn = Connection::open(db_path(workspace)).expect("open workspace db");
    let case_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM cases", [], |r| r.get(0))
        .expect("count cases");
    assert_eq!(case_rows, 0, "rollback left case rows behind");
    let assignment_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM case_assignments", [], |r| r.get(0))
        .expect("count assignments");
    assert_eq!(assignment_rows, 0, "rollback left assignment rows behind");
}

#[test]
fn invalid_record_type_rolls_back_the_whole_batch() {
    let workspace = temp_dir("caseworkd-rollback-type");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_workspace(&mut stdin, &mut reader, &workspace);

    // The valid student comes first so its insert has happened before the
    // bad entry is reached.
    let failed = request(
        &mut stdin,
        &mut reader,
        "1",
        "cases.bulkCreate",
        json!({
            "records": [
                { "type": "student", "id": seed.student_id },
                { "type": "staff", "id": "anything" }
            ],
            "divisionId": seed.division_id,
            "statusId": seed.status_id,
            "priorityId": seed.priority_id,
            "assignedToId": seed.assignee_id
        }),
    );
    assert_eq!(failed.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        failed
            .get("error")
            .and_then(|v| v.get("code"))
            .and_then(|v| v.as_str()),
        Some("invalid_record_type")
    );
    assert_eq!(
        failed
            .get("error")
            .and_then(|v| v.get("message"))
            .and_then(|v| v.as_str()),
        Some("record must be of type student or prospect")
    );
    let notification = failed
        .get("error")
        .and_then(|v| v.get("details"))
        .and_then(|v| v.get("notification"))
        .cloned()
        .expect("failure notification");
    assert_eq!(
        notification.get("level").and_then(|v| v.as_str()),
        Some("danger")
    );
    assert_eq!(
        notification.get("title").and_then(|v| v.as_str()),
        Some("Something went wrong")
    );

    assert_no_cases(&mut stdin, &mut reader, "2");
    assert_empty_case_tables(&workspace);

    // The dropped transaction must leave the connection usable.
    let retry = request(
        &mut stdin,
        &mut reader,
        "3",
        "cases.bulkCreate",
        json!({
            "records": [{ "type": "student", "id": seed.student_id }],
            "divisionId": seed.division_id,
            "statusId": seed.status_id,
            "priorityId": seed.priority_id,
            "assignedToId": seed.assignee_id
        }),
    );
    assert_eq!(retry.get("ok").and_then(|v| v.as_bool()), Some(true));

    let conn = Connection::open(db_path(&workspace)).expect("open workspace db");
    let case_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM cases", [], |r| r.get(0))
        .expect("count cases");
    assert_eq!(case_rows, 1);
    let assignment_rows: i64 = conn
        .query_row("SELECT COUNT(*) FROM case_assignments", [], |r| r.get(0))
        .expect("count assignments");
    assert_eq!(assignment_rows, 1);
}

#[test]
fn missing_respondent_rolls_back_the_whole_batch() {
    let workspace = temp_dir("caseworkd-rollback-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let seed = seed_workspace(&mut stdin, &mut reader, &workspace);

    let failed = request(
        &mut stdin,
        &mut reader,
        "1",
        "cases.bulkCreate",
        json!({
            "records": [
                { "type": "student", "id": seed.student_id },
                { "type": "prospect", "id": "no-such-prospect" }
            ],
            "divisionId": seed.division_id,
            "statusId": seed.status_id,
            "priorityId": seed.priority_id,
            "assignedToId": seed.assignee_id
        }),
    );
    assert_eq!(failed.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        failed
            .get("error")
            .and_then(|v| v.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );
    assert!(failed
        .get("error")
        .and_then(|v| v.get("details"))
        .and_then(|v| v.get("notification"))
        .is_some());

    assert_no_cases(&mut stdin, &mut reader, "2");
    assert_empty_case_tables(&workspace);
}
