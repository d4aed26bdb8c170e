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
    let exe = env!("CARGO_BIN_EXE_bulletind");
    let mut child = Command::new(exe)
        .env_remove("BULLETIND_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn bulletind");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or(json!({}))
}

fn select_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, workspace: &PathBuf) {
    let _ = request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
}

fn create_class(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let class = request_ok(stdin, reader, "c", "classes.create", json!({ "name": "CM2" }));
    class["classId"].as_str().expect("classId").to_string()
}

#[test]
fn settings_defaults_and_validation() {
    let workspace = temp_dir("bulletin-settings");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);

    let defaults = request_ok(&mut stdin, &mut reader, "g", "settings.get", json!({}));
    assert_eq!(defaults["engine"]["semesterMatching"].as_str(), Some("permissive"));
    assert_eq!(defaults["engine"]["scalePolicy"].as_str(), Some("live"));
    assert_eq!(defaults["engine"]["averaging"].as_str(), Some("reference"));
    assert_eq!(defaults["engine"]["referenceScale"].as_f64(), Some(20.0));
    assert_eq!(defaults["engine"]["passMark"].as_f64(), Some(10.0));
    assert_eq!(defaults["matricule"]["prefix"].as_str(), Some("ELV"));

    let bad_value = request(
        &mut stdin,
        &mut reader,
        "u1",
        "settings.update",
        json!({ "section": "engine", "patch": { "semesterMatching": "sometimes" } }),
    );
    assert_eq!(bad_value["error"]["code"].as_str(), Some("bad_params"));

    let unknown_field = request(
        &mut stdin,
        &mut reader,
        "u2",
        "settings.update",
        json!({ "section": "engine", "patch": { "roundTo": 3 } }),
    );
    assert_eq!(unknown_field["error"]["code"].as_str(), Some("bad_params"));

    let unknown_section = request(
        &mut stdin,
        &mut reader,
        "u3",
        "settings.update",
        json!({ "section": "printing", "patch": {} }),
    );
    assert_eq!(unknown_section["error"]["code"].as_str(), Some("bad_params"));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "u4",
        "settings.update",
        json!({ "section": "engine", "patch": { "passMark": 12 } }),
    );
    assert_eq!(updated["settings"]["passMark"].as_f64(), Some(12.0));
    let reread = request_ok(&mut stdin, &mut reader, "g2", "settings.get", json!({}));
    assert_eq!(reread["engine"]["passMark"].as_f64(), Some(12.0));
    assert_eq!(reread["engine"]["semesterMatching"].as_str(), Some("permissive"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn strict_semester_matching_excludes_untagged_grades() {
    let workspace = temp_dir("bulletin-strict-matching");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let class_id = create_class(&mut stdin, &mut reader);
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "s",
        "students.create",
        json!({ "classId": class_id, "lastName": "Sow", "firstName": "Binta" }),
    );
    let student_id = student["studentId"].as_str().expect("studentId").to_string();
    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "sj",
        "subjects.create",
        json!({ "classId": class_id, "name": "Histoire" }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let mut exams = Vec::new();
    for (title, exam_type, sem) in [
        ("Devoir 1", "devoir", Some("1")),
        ("Devoir libre", "devoir", None),
        ("Composition 1", "composition", Some("1")),
    ] {
        let e = request_ok(
            &mut stdin,
            &mut reader,
            title,
            "exams.create",
            json!({ "classId": class_id, "title": title, "examType": exam_type, "semester": sem }),
        );
        exams.push(e["examId"].as_str().expect("examId").to_string());
    }
    for (exam_id, value) in exams.iter().zip([12.0, 4.0, 16.0]) {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            "g",
            "grades.upsert",
            json!({ "studentId": student_id, "subjectId": subject_id, "examId": exam_id, "value": value }),
        );
    }

    let scope = json!({ "classId": class_id, "scope": { "semester": 1 } });
    let permissive = request_ok(&mut stdin, &mut reader, "r1", "calc.classResults", scope.clone());
    // Devoirs 12 and 4 average to 8, blended with the 16 composition.
    assert_eq!(permissive["rows"][0]["overallAverage"].as_f64(), Some(12.0));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "u",
        "settings.update",
        json!({ "section": "engine", "patch": { "semesterMatching": "strict" } }),
    );
    let strict = request_ok(&mut stdin, &mut reader, "r2", "calc.classResults", scope);
    assert_eq!(strict["rows"][0]["overallAverage"].as_f64(), Some(14.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn generated_matricules_increment_and_follow_settings() {
    let workspace = temp_dir("bulletin-matricule");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, &workspace);
    let class_id = create_class(&mut stdin, &mut reader);

    let mut issued = Vec::new();
    for (i, last) in ["Kane", "Mbaye"].iter().enumerate() {
        let s = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": "Ali" }),
        );
        issued.push(s["matricule"].as_str().expect("matricule").to_string());
    }
    assert!(issued[0].starts_with("ELV-"), "{}", issued[0]);
    assert!(issued[0].ends_with("-0001"), "{}", issued[0]);
    assert!(issued[1].ends_with("-0002"), "{}", issued[1]);
    assert_eq!(issued[0].len(), "ELV-2026-0001".len());

    let explicit = request_ok(
        &mut stdin,
        &mut reader,
        "s-explicit",
        "students.create",
        json!({ "classId": class_id, "lastName": "Seck", "firstName": "Omar", "matricule": "MANUEL-1" }),
    );
    assert_eq!(explicit["matricule"].as_str(), Some("MANUEL-1"));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "cfg",
        "settings.update",
        json!({ "section": "matricule", "patch": { "prefix": "STU", "includeYear": false, "padding": 3 } }),
    );
    let next = request_ok(
        &mut stdin,
        &mut reader,
        "s-new",
        "students.create",
        json!({ "classId": class_id, "lastName": "Thiam", "firstName": "Fatou" }),
    );
    assert_eq!(next["matricule"].as_str(), Some("STU-001"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
