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

struct Fixture {
    class_id: String,
    subject_id: String,
    students: Vec<String>,
}

/// One class, one subject (coefficient 2, out of 20), four active students and
/// one inactive student.
fn setup_class(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let class = request_ok(
        stdin,
        reader,
        "c",
        "classes.create",
        json!({ "name": "5eme B", "schoolId": "lycee-1" }),
    );
    let class_id = class["classId"].as_str().expect("classId").to_string();
    let subject = request_ok(
        stdin,
        reader,
        "sj",
        "subjects.create",
        json!({ "classId": class_id, "name": "Français", "coefficient": 2, "maxScore": 20 }),
    );
    let subject_id = subject["subjectId"].as_str().expect("subjectId").to_string();

    let mut students = Vec::new();
    for (i, last) in ["Ba", "Cisse", "Diop", "Fall"].iter().enumerate() {
        let s = request_ok(
            stdin,
            reader,
            &format!("st{}", i),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": "X" }),
        );
        students.push(s["studentId"].as_str().expect("studentId").to_string());
    }
    let inactive = request_ok(
        stdin,
        reader,
        "st-inactive",
        "students.create",
        json!({ "classId": class_id, "lastName": "Gueye", "firstName": "Y", "active": false }),
    );
    students.push(inactive["studentId"].as_str().expect("studentId").to_string());

    Fixture {
        class_id,
        subject_id,
        students,
    }
}

fn create_exam(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_id: &str,
    title: &str,
    exam_type: Option<&str>,
    semester: Option<&str>,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("exam-{}", title),
        "exams.create",
        json!({ "classId": class_id, "title": title, "examType": exam_type, "semester": semester }),
    );
    res["examId"].as_str().expect("examId").to_string()
}

fn put_grade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
    subject_id: &str,
    exam_id: &str,
    value: f64,
) {
    let _ = request_ok(
        stdin,
        reader,
        "g",
        "grades.upsert",
        json!({
            "studentId": student_id,
            "subjectId": subject_id,
            "examId": exam_id,
            "value": value
        }),
    );
}

fn row<'a>(results: &'a serde_json::Value, student_id: &str) -> &'a serde_json::Value {
    results["rows"]
        .as_array()
        .expect("rows")
        .iter()
        .find(|r| r["studentId"].as_str() == Some(student_id))
        .unwrap_or_else(|| panic!("row for {}", student_id))
}

#[test]
fn exam_scope_ranks_the_cohort_and_leaves_ungraded_last() {
    let workspace = temp_dir("bulletin-class-results");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = setup_class(&mut stdin, &mut reader);
    let exam_id = create_exam(
        &mut stdin,
        &mut reader,
        &fx.class_id,
        "Devoir 1",
        Some("devoir"),
        Some("1"),
    );
    put_grade(&mut stdin, &mut reader, &fx.students[0], &fx.subject_id, &exam_id, 14.0);
    put_grade(&mut stdin, &mut reader, &fx.students[1], &fx.subject_id, &exam_id, 16.0);
    put_grade(&mut stdin, &mut reader, &fx.students[2], &fx.subject_id, &exam_id, 10.0);
    // Inactive students are outside the cohort even with grades.
    put_grade(&mut stdin, &mut reader, &fx.students[4], &fx.subject_id, &exam_id, 20.0);

    let results = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "calc.classResults",
        json!({ "classId": fx.class_id, "scope": { "examId": exam_id } }),
    );

    assert_eq!(results["scope"]["kind"].as_str(), Some("exam"));
    assert_eq!(results["scope"]["mode"].as_str(), Some("single"));
    assert_eq!(results["totalStudents"].as_u64(), Some(4));
    assert_eq!(results["rankedStudents"].as_u64(), Some(3));

    let a = row(&results, &fx.students[0]);
    let b = row(&results, &fx.students[1]);
    let c = row(&results, &fx.students[2]);
    let d = row(&results, &fx.students[3]);
    assert_eq!(a["rank"].as_u64(), Some(2));
    assert_eq!(b["rank"].as_u64(), Some(1));
    assert_eq!(c["rank"].as_u64(), Some(3));
    assert!(d["rank"].is_null());

    assert_eq!(a["overallAverage"].as_f64(), Some(14.0));
    assert_eq!(a["totalPoints"].as_f64(), Some(28.0));
    assert_eq!(a["appreciation"].as_str(), Some("Très Bien"));
    assert_eq!(b["appreciation"].as_str(), Some("Excellent"));
    assert_eq!(c["appreciation"].as_str(), Some("Assez Bien"));
    assert_eq!(d["hasGrades"].as_bool(), Some(false));
    assert_eq!(d["appreciation"].as_str(), Some("N/A"));

    let rows = results["rows"].as_array().expect("rows");
    assert_eq!(rows.last().and_then(|r| r["studentId"].as_str()), Some(fx.students[3].as_str()));
    assert!(rows.iter().all(|r| r["studentId"].as_str() != Some(fx.students[4].as_str())));

    assert_eq!(results["stats"]["classAverage"].as_f64(), Some(13.33));
    assert_eq!(results["stats"]["highest"].as_f64(), Some(16.0));
    assert_eq!(results["stats"]["lowest"].as_f64(), Some(10.0));
    assert_eq!(results["stats"]["passCount"].as_u64(), Some(3));

    let bulletin = request_ok(
        &mut stdin,
        &mut reader,
        "sb",
        "reports.studentBulletin",
        json!({ "classId": fx.class_id, "studentId": fx.students[0], "scope": { "examId": exam_id } }),
    );
    assert_eq!(bulletin["rank"].as_u64(), Some(2));
    assert_eq!(bulletin["totalStudents"].as_u64(), Some(4));
    assert_eq!(bulletin["perSubject"][0]["weightedPoints"].as_f64(), Some(28.0));
    assert_eq!(bulletin["perSubject"][0]["classAverage"].as_f64(), Some(13.33));

    let outside = request(
        &mut stdin,
        &mut reader,
        "sb2",
        "reports.studentBulletin",
        json!({ "classId": fx.class_id, "studentId": fx.students[4], "scope": { "examId": exam_id } }),
    );
    assert_eq!(outside["error"]["code"].as_str(), Some("not_found"));

    let class_bulletin = request_ok(
        &mut stdin,
        &mut reader,
        "cb",
        "reports.classBulletin",
        json!({ "classId": fx.class_id, "scope": { "examId": exam_id } }),
    );
    assert_eq!(class_bulletin["students"].as_array().map(|v| v.len()), Some(4));
    assert_eq!(class_bulletin["legend"].as_array().map(|v| v.len()), Some(7));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn semester_scope_blends_devoir_and_composition_averages() {
    let workspace = temp_dir("bulletin-semester-scope");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = setup_class(&mut stdin, &mut reader);
    let d1 = create_exam(&mut stdin, &mut reader, &fx.class_id, "Devoir 1", Some("devoir"), Some("1er_semestre"));
    let d2 = create_exam(&mut stdin, &mut reader, &fx.class_id, "Devoir 2", Some("devoir"), Some("S1"));
    let c1 = create_exam(
        &mut stdin,
        &mut reader,
        &fx.class_id,
        "Composition du 1er semestre",
        Some("composition"),
        Some("1"),
    );
    let other = create_exam(&mut stdin, &mut reader, &fx.class_id, "Oral", Some("oral"), Some("1"));
    let s2 = create_exam(&mut stdin, &mut reader, &fx.class_id, "Devoir S2", Some("devoir"), Some("2"));

    let s = &fx.students[0];
    put_grade(&mut stdin, &mut reader, s, &fx.subject_id, &d1, 10.0);
    put_grade(&mut stdin, &mut reader, s, &fx.subject_id, &d2, 14.0);
    put_grade(&mut stdin, &mut reader, s, &fx.subject_id, &c1, 16.0);
    put_grade(&mut stdin, &mut reader, s, &fx.subject_id, &other, 2.0);
    put_grade(&mut stdin, &mut reader, s, &fx.subject_id, &s2, 3.0);

    let results = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "calc.classResults",
        json!({ "classId": fx.class_id, "scope": { "semester": 1 } }),
    );
    assert_eq!(results["scope"]["kind"].as_str(), Some("semester"));
    assert_eq!(results["scope"]["mode"].as_str(), Some("composition"));
    let line = &row(&results, s)["perSubject"][0];
    assert_eq!(line["devoirAvg"].as_f64(), Some(12.0));
    assert_eq!(line["compositionAvg"].as_f64(), Some(16.0));
    assert_eq!(line["combinedAvg"].as_f64(), Some(14.0));
    assert_eq!(row(&results, s)["overallAverage"].as_f64(), Some(14.0));

    let single = request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "calc.classResults",
        json!({ "classId": fx.class_id, "scope": { "semester": "1er semestre", "mode": "single" } }),
    );
    // Mean of 10, 14, 16 and 2.
    assert_eq!(row(&single, s)["overallAverage"].as_f64(), Some(10.5));

    let trimester = request_ok(
        &mut stdin,
        &mut reader,
        "r3",
        "calc.classResults",
        json!({ "classId": fx.class_id, "scope": { "semester": "T2" } }),
    );
    assert_eq!(trimester["scope"]["index"].as_u64(), Some(2));
    assert_eq!(trimester["scope"]["label"].as_str(), Some("2eme_trimestre"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn composition_exam_keeps_devoir_and_composition_components() {
    let workspace = temp_dir("bulletin-composition-exam");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = setup_class(&mut stdin, &mut reader);
    let exam_id = create_exam(
        &mut stdin,
        &mut reader,
        &fx.class_id,
        "Composition 1",
        Some("composition"),
        Some("1"),
    );
    let s = &fx.students[0];

    let devoir = request_ok(
        &mut stdin,
        &mut reader,
        "gd",
        "grades.upsert",
        json!({ "studentId": s, "subjectId": fx.subject_id, "examId": exam_id, "examType": "devoir", "value": 8 }),
    );
    let composition = request_ok(
        &mut stdin,
        &mut reader,
        "gc",
        "grades.upsert",
        json!({ "studentId": s, "subjectId": fx.subject_id, "examId": exam_id, "examType": "Composition", "value": 12 }),
    );
    assert_eq!(devoir["created"].as_bool(), Some(true));
    assert_eq!(composition["created"].as_bool(), Some(true));
    assert_ne!(devoir["gradeId"], composition["gradeId"]);

    // Re-entering the devoir replaces only the devoir record.
    let corrected = request_ok(
        &mut stdin,
        &mut reader,
        "gd2",
        "grades.upsert",
        json!({ "studentId": s, "subjectId": fx.subject_id, "examId": exam_id, "examType": "devoir", "value": 6 }),
    );
    assert_eq!(corrected["created"].as_bool(), Some(false));
    assert_eq!(corrected["gradeId"], devoir["gradeId"]);

    let results = request_ok(
        &mut stdin,
        &mut reader,
        "r",
        "calc.classResults",
        json!({ "classId": fx.class_id, "scope": { "examId": exam_id } }),
    );
    assert_eq!(results["scope"]["mode"].as_str(), Some("composition"));
    let line = &row(&results, s)["perSubject"][0];
    assert_eq!(line["devoirAvg"].as_f64(), Some(6.0));
    assert_eq!(line["compositionAvg"].as_f64(), Some(12.0));
    assert_eq!(line["combinedAvg"].as_f64(), Some(9.0));

    let bulletin = request_ok(
        &mut stdin,
        &mut reader,
        "sb",
        "reports.studentBulletin",
        json!({ "classId": fx.class_id, "studentId": s, "scope": { "examId": exam_id } }),
    );
    assert_eq!(bulletin["perSubject"][0]["devoir"].as_f64(), Some(6.0));
    assert_eq!(bulletin["perSubject"][0]["composition"].as_f64(), Some(12.0));
    assert_eq!(bulletin["overallAverage"].as_f64(), Some(9.0));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn scope_validation_errors() {
    let workspace = temp_dir("bulletin-scope-errors");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let fx = setup_class(&mut stdin, &mut reader);

    let missing = request(
        &mut stdin,
        &mut reader,
        "e1",
        "calc.classResults",
        json!({ "classId": fx.class_id, "scope": {} }),
    );
    assert_eq!(missing["error"]["code"].as_str(), Some("bad_params"));

    let bad_mode = request(
        &mut stdin,
        &mut reader,
        "e2",
        "calc.classResults",
        json!({ "classId": fx.class_id, "scope": { "semester": 1, "mode": "median" } }),
    );
    assert_eq!(bad_mode["error"]["code"].as_str(), Some("bad_params"));

    let unknown_exam = request(
        &mut stdin,
        &mut reader,
        "e3",
        "calc.classResults",
        json!({ "classId": fx.class_id, "scope": { "examId": "nope" } }),
    );
    assert_eq!(unknown_exam["error"]["code"].as_str(), Some("not_found"));

    let unknown_class = request(
        &mut stdin,
        &mut reader,
        "e4",
        "calc.classResults",
        json!({ "classId": "nope", "scope": { "semester": 1 } }),
    );
    assert_eq!(unknown_class["error"]["code"].as_str(), Some("not_found"));

    let appreciation = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "calc.appreciation",
        json!({ "grade": 14, "maxScale": 20 }),
    );
    assert_eq!(appreciation["appreciation"].as_str(), Some("Très Bien"));
    let zero_scale = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "calc.appreciation",
        json!({ "grade": 14, "maxScale": 0 }),
    );
    assert_eq!(zero_scale["appreciation"].as_str(), Some("N/A"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
