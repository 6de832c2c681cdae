use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("gradeimport.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            name TEXT NOT NULL,
            class_name TEXT,
            created_at TEXT,
            updated_at TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_student_id ON students(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_name)",
        [],
    )?;
    // Workspaces created before import tracking lack the source column.
    ensure_students_source(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            date TEXT NOT NULL,
            subject TEXT,
            scope TEXT NOT NULL,
            created_at TEXT,
            UNIQUE(title, exam_type, date)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_records(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_ref TEXT NOT NULL,
            student_id TEXT NOT NULL,
            name TEXT NOT NULL,
            class_name TEXT,
            subject TEXT NOT NULL,
            exam_title TEXT NOT NULL,
            exam_type TEXT NOT NULL,
            exam_date TEXT NOT NULL,
            exam_scope TEXT NOT NULL,
            score REAL,
            total_score REAL,
            subject_total_score REAL,
            original_grade TEXT,
            rank_in_class INTEGER,
            rank_in_grade INTEGER,
            percentile REAL,
            z_score REAL,
            grade_level TEXT,
            extra_json TEXT NOT NULL DEFAULT '{}',
            match_type TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_ref) REFERENCES students(id),
            UNIQUE(exam_id, student_ref, subject)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_exam ON grade_records(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grade_records_student ON grade_records(student_ref)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mapping_cache(
            signature TEXT PRIMARY KEY,
            headers_json TEXT NOT NULL,
            mapping_json TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS custom_fields(
            key TEXT PRIMARY KEY,
            label TEXT NOT NULL UNIQUE,
            origin_header TEXT NOT NULL,
            created_at TEXT
        )",
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

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<Value>> {
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

pub fn settings_set_json(conn: &Connection, key: &str, value: &Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_students_source(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "source")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN source TEXT NOT NULL DEFAULT 'directory'",
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
