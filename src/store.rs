use crate::catalog::CustomField;
use crate::commit::{GradeKey, GradeRecord, GradeStore};
use crate::db;
use crate::mapping::{HeaderMapping, MappingCache};
use crate::matching::{ExamScope, FileStudent, SystemStudent};
use crate::session::ExamInfo;
use anyhow::Context;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const LAST_MAPPING_KEY: &str = "import.lastConfirmedMapping";

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Read access to the student directory.
pub trait StudentDirectory {
    fn list_students(&self, class_names: Option<&[String]>) -> anyhow::Result<Vec<SystemStudent>>;
}

/// `(label, origin header) -> key`, invoked on explicit reviewer confirmation.
pub trait CustomFieldRegistry {
    fn list_fields(&self) -> anyhow::Result<Vec<CustomField>>;
    fn create_field(&self, label: &str, origin_header: &str) -> anyhow::Result<CustomField>;
}

pub struct SqliteWorkspace<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteWorkspace<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

fn student_from_row(r: &Row<'_>) -> rusqlite::Result<SystemStudent> {
    Ok(SystemStudent {
        id: r.get(0)?,
        name: r.get(1)?,
        student_id: r.get(2)?,
        class_name: r.get(3)?,
    })
}

impl StudentDirectory for SqliteWorkspace<'_> {
    fn list_students(&self, class_names: Option<&[String]>) -> anyhow::Result<Vec<SystemStudent>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, student_id, class_name FROM students ORDER BY class_name, student_id, id",
        )?;
        let all = stmt
            .query_map([], student_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(match class_names {
            Some(classes) => all
                .into_iter()
                .filter(|s| {
                    s.class_name
                        .as_ref()
                        .map(|c| classes.iter().any(|x| x == c))
                        .unwrap_or(false)
                })
                .collect(),
            None => all,
        })
    }
}

impl CustomFieldRegistry for SqliteWorkspace<'_> {
    fn list_fields(&self) -> anyhow::Result<Vec<CustomField>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, label, origin_header FROM custom_fields ORDER BY created_at, key")?;
        let rows = stmt
            .query_map([], |r| {
                Ok(CustomField {
                    key: r.get(0)?,
                    label: r.get(1)?,
                    origin_header: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Registering an existing label returns the field already stored.
    fn create_field(&self, label: &str, origin_header: &str) -> anyhow::Result<CustomField> {
        let label = label.trim();
        if label.is_empty() {
            anyhow::bail!("custom field label must not be empty");
        }
        if let Some(existing) = self
            .conn
            .query_row(
                "SELECT key, label, origin_header FROM custom_fields WHERE label = ?",
                [label],
                |r| {
                    Ok(CustomField {
                        key: r.get(0)?,
                        label: r.get(1)?,
                        origin_header: r.get(2)?,
                    })
                },
            )
            .optional()?
        {
            return Ok(existing);
        }
        let field = CustomField {
            key: format!("custom_{}", Uuid::new_v4().simple()),
            label: label.to_string(),
            origin_header: origin_header.trim().to_string(),
        };
        self.conn.execute(
            "INSERT INTO custom_fields(key, label, origin_header, created_at) VALUES(?, ?, ?, ?)",
            (&field.key, &field.label, &field.origin_header, now()),
        )?;
        Ok(field)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentInput {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub student_id: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
}

/// Inserts or updates directory students. Matches on `id`, then on a
/// non-empty `student_id`. Returns the stored ids in input order.
pub fn upsert_students(conn: &Connection, students: &[StudentInput]) -> anyhow::Result<Vec<String>> {
    let tx = conn.unchecked_transaction()?;
    let mut ids = Vec::with_capacity(students.len());
    for s in students {
        let name = s.name.trim();
        if name.is_empty() {
            anyhow::bail!("student name must not be empty");
        }
        let sid = s.student_id.as_deref().map(str::trim).unwrap_or("");
        let class = s
            .class_name
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());

        let existing: Option<String> = match s.id.as_deref() {
            Some(id) => tx
                .query_row("SELECT id FROM students WHERE id = ?", [id], |r| r.get(0))
                .optional()?,
            None if !sid.is_empty() => tx
                .query_row("SELECT id FROM students WHERE student_id = ?", [sid], |r| r.get(0))
                .optional()?,
            None => None,
        };
        let id = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE students SET name = ?, student_id = ?, class_name = ?, updated_at = ? WHERE id = ?",
                    params![name, sid, class, now(), id],
                )?;
                id
            }
            None => {
                let id = s.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
                tx.execute(
                    "INSERT INTO students(id, student_id, name, class_name, created_at, updated_at, source)
                     VALUES(?, ?, ?, ?, ?, ?, 'directory')",
                    params![id, sid, name, class, now(), now()],
                )?;
                id
            }
        };
        ids.push(id);
    }
    tx.commit()?;
    Ok(ids)
}

/// Mapping cache over the `mapping_cache` table. Reads are best-effort: a
/// corrupt row is treated as a miss.
pub struct SqliteMappingCache<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteMappingCache<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl MappingCache for SqliteMappingCache<'_> {
    fn get(&self, signature: &str) -> Option<HeaderMapping> {
        let raw: Option<String> = match self
            .conn
            .query_row(
                "SELECT mapping_json FROM mapping_cache WHERE signature = ?",
                [signature],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => {
                log::warn!("mapping cache read failed: {}", e);
                return None;
            }
        };
        let raw = raw?;
        match serde_json::from_str::<HeaderMapping>(&raw) {
            Ok(m) => Some(m),
            Err(e) => {
                log::warn!("mapping cache entry {} is unreadable: {}", signature, e);
                None
            }
        }
    }

    fn put(&self, signature: &str, headers: &[String], mapping: &HeaderMapping) -> anyhow::Result<()> {
        self.conn.execute(
            "INSERT INTO mapping_cache(signature, headers_json, mapping_json, updated_at)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(signature) DO UPDATE SET
               headers_json = excluded.headers_json,
               mapping_json = excluded.mapping_json,
               updated_at = excluded.updated_at",
            (
                signature,
                serde_json::to_string(headers)?,
                serde_json::to_string(mapping)?,
                now(),
            ),
        )?;
        Ok(())
    }
}

pub fn save_last_confirmed_mapping(
    conn: &Connection,
    signature: &str,
    headers: &[String],
    mapping: &HeaderMapping,
) -> anyhow::Result<()> {
    db::settings_set_json(
        conn,
        LAST_MAPPING_KEY,
        &json!({
            "signature": signature,
            "headers": headers,
            "mapping": mapping,
            "savedAt": now(),
        }),
    )
}

const RECORD_COLUMNS: &str = "exam_id, student_ref, student_id, name, class_name, subject,
    exam_title, exam_type, exam_date, exam_scope, score, total_score, subject_total_score,
    original_grade, rank_in_class, rank_in_grade, percentile, z_score, grade_level,
    extra_json, match_type";

fn record_from_row(r: &Row<'_>) -> rusqlite::Result<GradeRecord> {
    let extra_json: String = r.get(19)?;
    Ok(GradeRecord {
        exam_id: r.get(0)?,
        student_ref: r.get(1)?,
        student_id: r.get(2)?,
        name: r.get(3)?,
        class_name: r.get(4)?,
        subject: r.get(5)?,
        exam_title: r.get(6)?,
        exam_type: r.get(7)?,
        exam_date: r.get(8)?,
        exam_scope: r.get(9)?,
        score: r.get(10)?,
        total_score: r.get(11)?,
        subject_total_score: r.get(12)?,
        original_grade: r.get(13)?,
        rank_in_class: r.get(14)?,
        rank_in_grade: r.get(15)?,
        percentile: r.get(16)?,
        z_score: r.get(17)?,
        grade_level: r.get(18)?,
        extra: serde_json::from_str::<BTreeMap<String, String>>(&extra_json).unwrap_or_default(),
        match_type: r.get(20)?,
    })
}

pub struct SqliteGradeStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteGradeStore<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn insert(&self, record: &GradeRecord) -> anyhow::Result<()> {
        self.conn.execute(
            &format!(
                "INSERT INTO grade_records(id, {}, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                RECORD_COLUMNS
            ),
            params![
                Uuid::new_v4().to_string(),
                record.exam_id,
                record.student_ref,
                record.student_id,
                record.name,
                record.class_name,
                record.subject,
                record.exam_title,
                record.exam_type,
                record.exam_date,
                record.exam_scope,
                record.score,
                record.total_score,
                record.subject_total_score,
                record.original_grade,
                record.rank_in_class,
                record.rank_in_grade,
                record.percentile,
                record.z_score,
                record.grade_level,
                serde_json::to_string(&record.extra)?,
                record.match_type,
                now(),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, key: &GradeKey) -> anyhow::Result<()> {
        self.conn.execute(
            "DELETE FROM grade_records WHERE exam_id = ? AND student_ref = ? AND subject = ?",
            (&key.exam_id, &key.student_ref, &key.subject),
        )?;
        Ok(())
    }
}

impl GradeStore for SqliteGradeStore<'_> {
    fn upsert_exam(&mut self, exam: &ExamInfo, scope: ExamScope) -> anyhow::Result<String> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM exams WHERE title = ? AND exam_type = ? AND date = ?",
                (&exam.title, &exam.exam_type, &exam.date),
                |r| r.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            self.conn.execute(
                "UPDATE exams SET subject = COALESCE(?, subject), scope = ? WHERE id = ?",
                params![exam.subject, scope.as_str(), id],
            )?;
            return Ok(id);
        }
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO exams(id, title, exam_type, date, subject, scope, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            params![id, exam.title, exam.exam_type, exam.date, exam.subject, scope.as_str(), now()],
        )?;
        Ok(id)
    }

    fn create_student(&mut self, student: &FileStudent) -> anyhow::Result<SystemStudent> {
        let created = SystemStudent {
            id: Uuid::new_v4().to_string(),
            name: student.name.trim().to_string(),
            student_id: student.student_id.clone().unwrap_or_default(),
            class_name: student.class_name.clone(),
        };
        self.conn
            .execute(
                "INSERT INTO students(id, student_id, name, class_name, created_at, updated_at, source)
                 VALUES(?, ?, ?, ?, ?, ?, 'import')",
                params![
                    created.id,
                    created.student_id,
                    created.name,
                    created.class_name,
                    now(),
                    now()
                ],
            )
            .with_context(|| format!("insert student {}", created.name))?;
        Ok(created)
    }

    fn find_record(&self, key: &GradeKey) -> anyhow::Result<Option<GradeRecord>> {
        let rec = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM grade_records WHERE exam_id = ? AND student_ref = ? AND subject = ?",
                    RECORD_COLUMNS
                ),
                (&key.exam_id, &key.student_ref, &key.subject),
                record_from_row,
            )
            .optional()?;
        Ok(rec)
    }

    fn insert_record(&mut self, record: &GradeRecord) -> anyhow::Result<()> {
        self.insert(record)
    }

    fn update_record(&mut self, record: &GradeRecord) -> anyhow::Result<()> {
        self.conn.execute(
            "UPDATE grade_records SET
               student_id = ?, name = ?, class_name = ?, exam_title = ?, exam_type = ?,
               exam_date = ?, exam_scope = ?, score = ?, total_score = ?, subject_total_score = ?,
               original_grade = ?, rank_in_class = ?, rank_in_grade = ?, percentile = ?,
               z_score = ?, grade_level = ?, extra_json = ?, match_type = ?, updated_at = ?
             WHERE exam_id = ? AND student_ref = ? AND subject = ?",
            params![
                record.student_id,
                record.name,
                record.class_name,
                record.exam_title,
                record.exam_type,
                record.exam_date,
                record.exam_scope,
                record.score,
                record.total_score,
                record.subject_total_score,
                record.original_grade,
                record.rank_in_class,
                record.rank_in_grade,
                record.percentile,
                record.z_score,
                record.grade_level,
                serde_json::to_string(&record.extra)?,
                record.match_type,
                now(),
                record.exam_id,
                record.student_ref,
                record.subject,
            ],
        )?;
        Ok(())
    }

    fn replace_record(&mut self, record: &GradeRecord) -> anyhow::Result<()> {
        self.conn.execute_batch("SAVEPOINT replace_row")?;
        let res = self
            .delete(&record.key())
            .and_then(|_| self.insert(record));
        match res {
            Ok(()) => {
                self.conn.execute_batch("RELEASE replace_row")?;
                Ok(())
            }
            Err(e) => {
                self.conn
                    .execute_batch("ROLLBACK TO replace_row; RELEASE replace_row")?;
                Err(e)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamRow {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub exam_type: String,
    pub date: String,
    pub subject: Option<String>,
    pub scope: String,
    pub record_count: i64,
}

pub fn list_exams(conn: &Connection) -> anyhow::Result<Vec<ExamRow>> {
    let mut stmt = conn.prepare(
        "SELECT e.id, e.title, e.exam_type, e.date, e.subject, e.scope,
                (SELECT COUNT(*) FROM grade_records g WHERE g.exam_id = e.id)
         FROM exams e
         ORDER BY e.date DESC, e.title",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(ExamRow {
                id: r.get(0)?,
                title: r.get(1)?,
                exam_type: r.get(2)?,
                date: r.get(3)?,
                subject: r.get(4)?,
                scope: r.get(5)?,
                record_count: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_grade_records(conn: &Connection, exam_id: Option<&str>) -> anyhow::Result<Vec<GradeRecord>> {
    let sql = format!(
        "SELECT {} FROM grade_records
         WHERE (?1 IS NULL OR exam_id = ?1)
         ORDER BY exam_id, class_name, student_id, name, subject",
        RECORD_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([exam_id], record_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
