use crate::catalog::{self, FieldCatalog};
use crate::error::ImportError;
use crate::mapping::HeaderMapping;
use crate::matching::{ExactKind, ExamScope, FileStudent, FuzzyChoice, MatchRecord, MatchReport, SystemStudent};
use crate::session::ExamInfo;
use crate::table::{CellValue, ParsedFile};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Merge,
    Replace,
    AddOnly,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "merge" => Some(Self::Merge),
            "replace" => Some(Self::Replace),
            "add_only" => Some(Self::AddOnly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Replace => "replace",
            Self::AddOnly => "add_only",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NewStudentStrategy {
    Create,
    Ignore,
}

impl NewStudentStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "ignore" => Some(Self::Ignore),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeKey {
    pub exam_id: String,
    pub student_ref: String,
    pub subject: String,
}

/// A normalized grade row as stored, keyed by (exam, student, subject).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub exam_id: String,
    pub student_ref: String,
    pub student_id: String,
    pub name: String,
    pub class_name: Option<String>,
    pub subject: String,
    pub exam_title: String,
    pub exam_type: String,
    pub exam_date: String,
    pub exam_scope: String,
    pub score: Option<f64>,
    pub total_score: Option<f64>,
    pub subject_total_score: Option<f64>,
    pub original_grade: Option<String>,
    pub rank_in_class: Option<i64>,
    pub rank_in_grade: Option<i64>,
    pub percentile: Option<f64>,
    pub z_score: Option<f64>,
    pub grade_level: Option<String>,
    pub extra: BTreeMap<String, String>,
    pub match_type: String,
}

impl GradeRecord {
    pub fn key(&self) -> GradeKey {
        GradeKey {
            exam_id: self.exam_id.clone(),
            student_ref: self.student_ref.clone(),
            subject: self.subject.clone(),
        }
    }
}

/// Fields present on `incoming` win; fields it leaves blank keep the stored value.
pub fn merge_records(existing: &GradeRecord, incoming: &GradeRecord) -> GradeRecord {
    let mut extra = existing.extra.clone();
    extra.extend(incoming.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    GradeRecord {
        class_name: incoming.class_name.clone().or_else(|| existing.class_name.clone()),
        score: incoming.score.or(existing.score),
        total_score: incoming.total_score.or(existing.total_score),
        subject_total_score: incoming.subject_total_score.or(existing.subject_total_score),
        original_grade: incoming
            .original_grade
            .clone()
            .or_else(|| existing.original_grade.clone()),
        rank_in_class: incoming.rank_in_class.or(existing.rank_in_class),
        rank_in_grade: incoming.rank_in_grade.or(existing.rank_in_grade),
        percentile: incoming.percentile.or(existing.percentile),
        z_score: incoming.z_score.or(existing.z_score),
        grade_level: incoming.grade_level.clone().or_else(|| existing.grade_level.clone()),
        extra,
        ..incoming.clone()
    }
}

/// Write target of a commit. Implementations report each call's failure
/// independently; `replace_record` must delete and insert as one unit.
pub trait GradeStore {
    fn upsert_exam(&mut self, exam: &ExamInfo, scope: ExamScope) -> anyhow::Result<String>;
    fn create_student(&mut self, student: &FileStudent) -> anyhow::Result<SystemStudent>;
    fn find_record(&self, key: &GradeKey) -> anyhow::Result<Option<GradeRecord>>;
    fn insert_record(&mut self, record: &GradeRecord) -> anyhow::Result<()>;
    fn update_record(&mut self, record: &GradeRecord) -> anyhow::Result<()>;
    fn replace_record(&mut self, record: &GradeRecord) -> anyhow::Result<()>;
}

/// Everything a commit needs, borrowed from a session at final confirmation.
pub struct CommitPlan<'a> {
    pub file: &'a ParsedFile,
    pub mapping: &'a HeaderMapping,
    pub catalog: &'a FieldCatalog,
    pub exam_info: &'a ExamInfo,
    pub exam_scope: ExamScope,
    pub merge_strategy: MergeStrategy,
    pub new_student_strategy: NewStudentStrategy,
    pub file_students: &'a [FileStudent],
    pub row_students: &'a [Option<usize>],
    pub report: &'a MatchReport,
    pub choices: &'a BTreeMap<usize, FuzzyChoice>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowFailure {
    pub row: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub exam_id: String,
    pub total_rows: usize,
    pub inserted: usize,
    pub updated: usize,
    pub replaced: usize,
    pub skipped_existing: usize,
    pub dropped_new: usize,
    pub held_fuzzy: usize,
    pub rejected: usize,
    pub failed: usize,
    pub created_students: usize,
    pub failures: Vec<RowFailure>,
}

impl CommitSummary {
    pub fn written(&self) -> usize {
        self.inserted + self.updated + self.replaced
    }
}

enum RowStudent {
    Existing(SystemStudent, &'static str),
    New,
    Held,
}

fn row_student(record: &MatchRecord, choices: &BTreeMap<usize, FuzzyChoice>) -> RowStudent {
    match record {
        MatchRecord::ExactMatch {
            kind,
            system_student,
            ..
        } => {
            let tag = match kind {
                ExactKind::ById => "exact_by_id",
                ExactKind::ByName => "exact_by_name",
            };
            RowStudent::Existing(system_student.clone(), tag)
        }
        MatchRecord::FuzzyMatch {
            file_index,
            candidates,
            ..
        } => match choices.get(file_index) {
            Some(FuzzyChoice::Confirmed { system_student_id }) => candidates
                .iter()
                .find(|c| &c.system_student.id == system_student_id)
                .map(|c| RowStudent::Existing(c.system_student.clone(), "fuzzy_confirmed"))
                .unwrap_or(RowStudent::Held),
            Some(FuzzyChoice::Rejected) => RowStudent::New,
            None => RowStudent::Held,
        },
        MatchRecord::NewStudent { .. } => RowStudent::New,
        MatchRecord::MissingStudent { .. } => RowStudent::Held,
    }
}

fn number(c: &CellValue) -> Option<f64> {
    c.as_number()
}

fn integer(c: &CellValue) -> Option<i64> {
    c.as_number().map(|n| n.round() as i64)
}

/// Translates one row through the mapping and stamps it with the exam.
fn build_record(
    plan: &CommitPlan<'_>,
    row: &[CellValue],
    exam_id: &str,
    student: &SystemStudent,
    match_type: &str,
) -> GradeRecord {
    let mut rec = GradeRecord {
        exam_id: exam_id.to_string(),
        student_ref: student.id.clone(),
        student_id: student.student_id.clone(),
        name: student.name.clone(),
        class_name: student.class_name.clone(),
        exam_title: plan.exam_info.title.clone(),
        exam_type: plan.exam_info.exam_type.clone(),
        exam_date: plan.exam_info.date.clone(),
        exam_scope: plan.exam_scope.as_str().to_string(),
        match_type: match_type.to_string(),
        ..Default::default()
    };
    let mut subject = None;

    for (idx, entry) in plan.mapping.entries().iter().enumerate() {
        let Some(key) = entry.target.field_key() else {
            continue;
        };
        let Some(cell) = row.get(idx) else {
            continue;
        };
        if cell.is_empty() {
            continue;
        }
        match key {
            catalog::SUBJECT => subject = cell.non_empty_text(),
            catalog::CLASS_NAME => {
                if rec.class_name.is_none() {
                    rec.class_name = cell.non_empty_text();
                }
            }
            catalog::GRADE_LEVEL => rec.grade_level = cell.non_empty_text(),
            catalog::SCORE => rec.score = number(cell),
            catalog::TOTAL_SCORE => rec.total_score = number(cell),
            catalog::SUBJECT_TOTAL_SCORE => rec.subject_total_score = number(cell),
            catalog::ORIGINAL_GRADE => rec.original_grade = cell.non_empty_text(),
            catalog::RANK_IN_CLASS => rec.rank_in_class = integer(cell),
            catalog::RANK_IN_GRADE => rec.rank_in_grade = integer(cell),
            catalog::PERCENTILE => rec.percentile = number(cell),
            catalog::Z_SCORE => rec.z_score = number(cell),
            k if plan.catalog.is_custom(k) => {
                if let Some(v) = cell.non_empty_text() {
                    rec.extra.insert(k.to_string(), v);
                }
            }
            // identity and exam columns are taken from the match and the exam
            _ => {}
        }
    }

    rec.subject = subject
        .or_else(|| {
            plan.exam_info
                .subject
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "total".to_string());
    rec
}

enum Outcome {
    Inserted,
    Updated,
    Replaced,
    Skipped,
}

fn apply_record(
    store: &mut dyn GradeStore,
    strategy: MergeStrategy,
    record: &GradeRecord,
) -> anyhow::Result<Outcome> {
    let existing = store.find_record(&record.key())?;
    match (strategy, existing) {
        (_, None) => {
            store.insert_record(record)?;
            Ok(Outcome::Inserted)
        }
        (MergeStrategy::AddOnly, Some(_)) => Ok(Outcome::Skipped),
        (MergeStrategy::Merge, Some(old)) => {
            store.update_record(&merge_records(&old, record))?;
            Ok(Outcome::Updated)
        }
        (MergeStrategy::Replace, Some(_)) => {
            store.replace_record(record)?;
            Ok(Outcome::Replaced)
        }
    }
}

/// Applies every committable row. Only a failure to save the exam aborts the
/// commit; row-level failures are counted and listed in the summary.
pub fn execute_commit(
    plan: &CommitPlan<'_>,
    store: &mut dyn GradeStore,
) -> Result<CommitSummary, ImportError> {
    let exam_id = store
        .upsert_exam(plan.exam_info, plan.exam_scope)
        .map_err(|e| ImportError::Commit(format!("exam could not be saved: {:#}", e)))?;

    let mut summary = CommitSummary {
        exam_id: exam_id.clone(),
        total_rows: plan.file.rows.len(),
        ..Default::default()
    };
    let mut created: HashMap<usize, SystemStudent> = HashMap::new();

    for (row_idx, row) in plan.file.rows.iter().enumerate() {
        let row_no = row_idx + 1;
        let Some(file_idx) = plan.row_students.get(row_idx).copied().flatten() else {
            summary.rejected += 1;
            summary.failures.push(RowFailure {
                row: row_no,
                reason: "row has no student name".into(),
            });
            continue;
        };
        let Some(record) = plan.report.record_for(file_idx) else {
            summary.rejected += 1;
            summary.failures.push(RowFailure {
                row: row_no,
                reason: "row has no identity match".into(),
            });
            continue;
        };

        let (student, match_type) = match row_student(record, plan.choices) {
            RowStudent::Existing(s, tag) => (s, tag),
            RowStudent::Held => {
                summary.held_fuzzy += 1;
                continue;
            }
            RowStudent::New => match plan.new_student_strategy {
                NewStudentStrategy::Ignore => {
                    summary.dropped_new += 1;
                    continue;
                }
                NewStudentStrategy::Create => {
                    if let Some(s) = created.get(&file_idx) {
                        (s.clone(), "new")
                    } else {
                        let Some(fs) = plan.file_students.get(file_idx) else {
                            summary.rejected += 1;
                            summary.failures.push(RowFailure {
                                row: row_no,
                                reason: "row student is missing from the file projection".into(),
                            });
                            continue;
                        };
                        match store.create_student(fs) {
                            Ok(s) => {
                                summary.created_students += 1;
                                created.insert(file_idx, s.clone());
                                (s, "new")
                            }
                            Err(e) => {
                                log::warn!("row {}: student could not be created: {:#}", row_no, e);
                                summary.failed += 1;
                                summary.failures.push(RowFailure {
                                    row: row_no,
                                    reason: format!("student could not be created: {:#}", e),
                                });
                                continue;
                            }
                        }
                    }
                }
            },
        };

        let rec = build_record(plan, row, &exam_id, &student, match_type);
        match apply_record(store, plan.merge_strategy, &rec) {
            Ok(Outcome::Inserted) => summary.inserted += 1,
            Ok(Outcome::Updated) => summary.updated += 1,
            Ok(Outcome::Replaced) => summary.replaced += 1,
            Ok(Outcome::Skipped) => summary.skipped_existing += 1,
            Err(e) => {
                log::warn!("row {}: grade write failed: {:#}", row_no, e);
                summary.failed += 1;
                summary.failures.push(RowFailure {
                    row: row_no,
                    reason: format!("{:#}", e),
                });
            }
        }
    }

    log::info!(
        "commit {} ({}): {} written ({} inserted, {} updated, {} replaced), {} skipped, {} held, {} dropped, {} rejected, {} failed",
        exam_id,
        plan.merge_strategy.as_str(),
        summary.written(),
        summary.inserted,
        summary.updated,
        summary.replaced,
        summary.skipped_existing,
        summary.held_fuzzy,
        summary.dropped_new,
        summary.rejected,
        summary.failed
    );
    Ok(summary)
}
