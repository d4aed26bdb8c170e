use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use uuid::Uuid;

pub const DB_FILE_NAME: &str = "bulletin.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            school_id TEXT NOT NULL DEFAULT ''
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            matricule TEXT,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_students_matricule(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_matricule ON students(matricule)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            coefficient REAL,
            max_score REAL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id),
            UNIQUE(class_id, name)
        )",
        [],
    )?;
    ensure_subjects_max_score(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            title TEXT NOT NULL,
            exam_type TEXT,
            semester TEXT,
            date TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_class ON exams(class_id)",
        [],
    )?;

    // exam_id and semester are nullable; the upsert key is matched with IS.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            exam_id TEXT,
            school_id TEXT NOT NULL DEFAULT '',
            grade_value REAL,
            max_grade REAL,
            coefficient REAL,
            exam_type TEXT,
            semester TEXT,
            updated_at TEXT,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(exam_id) REFERENCES exams(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_subject ON grades(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_exam ON grades(exam_id)",
        [],
    )?;
    ensure_grades_exam_type_normalized(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_record_key
         ON grades(student_id, subject_id, exam_id, semester, exam_type)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_matricule(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "matricule")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN matricule TEXT", [])?;
    Ok(())
}

fn ensure_subjects_max_score(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "subjects", "max_score")? {
        return Ok(());
    }
    // Older workspaces graded everything out of 20.
    conn.execute("ALTER TABLE subjects ADD COLUMN max_score REAL", [])?;
    conn.execute("UPDATE subjects SET max_score = 20 WHERE max_score IS NULL", [])?;
    Ok(())
}

fn ensure_grades_exam_type_normalized(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "UPDATE grades SET exam_type = NULLIF(lower(trim(exam_type)), '')
         WHERE exam_type IS NOT NULL AND exam_type IS NOT NULLIF(lower(trim(exam_type)), '')",
        [],
    )?;
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
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GradeInput {
    pub student_id: String,
    pub subject_id: String,
    pub exam_id: Option<String>,
    pub school_id: String,
    pub grade_value: f64,
    pub max_grade: Option<f64>,
    pub coefficient: Option<f64>,
    /// Part of the record identity; see `normalize_exam_type`.
    pub exam_type: Option<String>,
    /// Already canonical.
    pub semester: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created(String),
    Updated(String),
}

impl UpsertOutcome {
    pub fn id(&self) -> &str {
        match self {
            UpsertOutcome::Created(id) | UpsertOutcome::Updated(id) => id,
        }
    }
}

/// Trimmed and lowercased so `Devoir` and `devoir ` name the same record.
pub fn normalize_exam_type(raw: Option<&str>) -> Option<String> {
    raw.map(|t| t.trim().to_lowercase()).filter(|t| !t.is_empty())
}

/// Inserts or replaces the grade keyed by student, subject, exam, semester and
/// exam type. A composition exam holds one devoir and one composition record.
pub fn upsert_grade(conn: &Connection, g: &GradeInput, now: &str) -> anyhow::Result<UpsertOutcome> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM grades
             WHERE student_id = ? AND subject_id = ? AND exam_id IS ? AND semester IS ?
               AND exam_type IS ?",
            (
                &g.student_id,
                &g.subject_id,
                &g.exam_id,
                &g.semester,
                &g.exam_type,
            ),
            |r| r.get(0),
        )
        .optional()?;

    if let Some(id) = existing {
        conn.execute(
            "UPDATE grades
             SET grade_value = ?, max_grade = ?, coefficient = ?, exam_type = ?,
                 school_id = ?, updated_at = ?
             WHERE id = ?",
            (
                g.grade_value,
                g.max_grade,
                g.coefficient,
                &g.exam_type,
                &g.school_id,
                now,
                &id,
            ),
        )?;
        return Ok(UpsertOutcome::Updated(id));
    }

    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO grades(
            id, student_id, subject_id, exam_id, school_id,
            grade_value, max_grade, coefficient, exam_type, semester, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &id,
            &g.student_id,
            &g.subject_id,
            &g.exam_id,
            &g.school_id,
            g.grade_value,
            g.max_grade,
            g.coefficient,
            &g.exam_type,
            &g.semester,
            now,
        ],
    )?;
    Ok(UpsertOutcome::Created(id))
}
