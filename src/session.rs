use crate::catalog::{self, CustomField, FieldCatalog};
use crate::commit::{CommitPlan, CommitSummary, MergeStrategy, NewStudentStrategy};
use crate::config::ImportConfig;
use crate::error::ImportError;
use crate::mapping::{confidence_tier, ConfidenceTier, HeaderMapping, MappingSource, MappingTarget, Resolution};
use crate::matching::{
    dedupe_file_students, resolve_identities, scope_directory, ExamScope, FileStudent, FuzzyChoice,
    MatchOptions, MatchRecord, MatchReport, SystemStudent,
};
use crate::suggest::Suggestion;
use crate::table::ParsedFile;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Preview,
    ExamMetadata,
    MappingReview,
    StudentStrategy,
    FinalConfirm,
    Committed,
    Cancelled,
}

impl Step {
    pub fn number(self) -> Option<u8> {
        match self {
            Step::Preview => Some(1),
            Step::ExamMetadata => Some(2),
            Step::MappingReview => Some(3),
            Step::StudentStrategy => Some(4),
            Step::FinalConfirm => Some(5),
            Step::Committed | Step::Cancelled => None,
        }
    }

    pub fn from_number(n: u64) -> Option<Step> {
        match n {
            1 => Some(Step::Preview),
            2 => Some(Step::ExamMetadata),
            3 => Some(Step::MappingReview),
            4 => Some(Step::StudentStrategy),
            5 => Some(Step::FinalConfirm),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Preview => "preview",
            Step::ExamMetadata => "exam_metadata",
            Step::MappingReview => "mapping_review",
            Step::StudentStrategy => "student_strategy",
            Step::FinalConfirm => "final_confirm",
            Step::Committed => "committed",
            Step::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Step::Committed | Step::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamInfo {
    pub title: String,
    #[serde(rename = "type")]
    pub exam_type: String,
    pub date: String,
    #[serde(default)]
    pub subject: Option<String>,
}

fn normalize_date(s: &str) -> String {
    let t = s.trim();
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"] {
        if let Ok(d) = chrono::NaiveDate::parse_from_str(t, fmt) {
            return d.format("%Y-%m-%d").to_string();
        }
    }
    t.to_string()
}

impl ExamInfo {
    /// Defaults the title to the file name without its extension.
    pub fn for_file(file_name: &str) -> Self {
        let stem = match file_name.rfind('.') {
            Some(i) if i > 0 => &file_name[..i],
            _ => file_name,
        };
        ExamInfo {
            title: stem.trim().to_string(),
            ..Default::default()
        }
    }

    pub fn normalized(self) -> Self {
        ExamInfo {
            title: self.title.trim().to_string(),
            exam_type: self.exam_type.trim().to_string(),
            date: normalize_date(&self.date),
            subject: self
                .subject
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }

    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.title.trim().is_empty() {
            out.push("title");
        }
        if self.exam_type.trim().is_empty() {
            out.push("type");
        }
        if self.date.trim().is_empty() {
            out.push("date");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub code: &'static str,
    pub message: String,
}

fn notice(code: &'static str, message: impl Into<String>) -> Notice {
    Notice {
        code,
        message: message.into(),
    }
}

/// The identity resolution computed for one mapping revision, together with
/// the directory snapshot it ran against.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityState {
    pub revision: u64,
    pub file_students: Vec<FileStudent>,
    pub row_students: Vec<Option<usize>>,
    pub directory: Rc<Vec<SystemStudent>>,
    pub report: MatchReport,
}

#[derive(Debug, Clone)]
pub struct ImportSession {
    pub id: String,
    pub step: Step,
    pub file: Rc<ParsedFile>,
    pub signature: String,
    pub exam_info: ExamInfo,
    pub mapping: HeaderMapping,
    pub confidence: ConfidenceTier,
    pub mapping_from_cache: bool,
    pub mapping_revision: u64,
    pub auto_skipped_mapping: bool,
    pub manual_headers: BTreeSet<String>,
    pub pending_suggestions: BTreeSet<String>,
    pub identity: Option<Rc<IdentityState>>,
    pub merge_strategy: Option<MergeStrategy>,
    pub new_student_strategy: Option<NewStudentStrategy>,
    pub exam_scope: ExamScope,
    pub fuzzy_choices: BTreeMap<usize, FuzzyChoice>,
    pub commit_in_flight: bool,
    pub last_commit: Option<CommitSummary>,
    pub warnings: Vec<Notice>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Advance,
    GoBack(Step),
    SetExamInfo(ExamInfo),
    SetMapping {
        header: String,
        target: MappingTarget,
    },
    SuggestionsRequested(Vec<String>),
    SuggestionArrived {
        header: String,
        suggestion: Option<Suggestion>,
    },
    CustomFieldCreated {
        header: String,
        field: CustomField,
    },
    SetStrategies {
        merge: Option<MergeStrategy>,
        new_student: Option<NewStudentStrategy>,
        scope: Option<ExamScope>,
    },
    ResolveFuzzy {
        file_index: usize,
        choice: Option<FuzzyChoice>,
    },
    BeginCommit,
    CommitFinished(CommitSummary),
    CommitFailed(String),
    Cancel,
}

impl SessionEvent {
    fn action(&self) -> &'static str {
        match self {
            SessionEvent::Advance => "advance",
            SessionEvent::GoBack(_) => "go back",
            SessionEvent::SetExamInfo(_) => "set exam info",
            SessionEvent::SetMapping { .. } => "set mapping",
            SessionEvent::SuggestionsRequested(_) => "request suggestions",
            SessionEvent::SuggestionArrived { .. } => "apply suggestion",
            SessionEvent::CustomFieldCreated { .. } => "create custom field",
            SessionEvent::SetStrategies { .. } => "set strategies",
            SessionEvent::ResolveFuzzy { .. } => "resolve fuzzy match",
            SessionEvent::BeginCommit => "commit",
            SessionEvent::CommitFinished(_) => "finish commit",
            SessionEvent::CommitFailed(_) => "fail commit",
            SessionEvent::Cancel => "cancel",
        }
    }
}

/// Read-only inputs of a transition.
pub struct SessionContext<'a> {
    pub directory: &'a [SystemStudent],
    pub catalog: &'a FieldCatalog,
    pub config: &'a ImportConfig,
}

pub fn match_options(config: &ImportConfig) -> MatchOptions {
    MatchOptions {
        similarity_threshold: config.similarity_threshold,
        candidate_cap: config.candidate_cap,
    }
}

/// Projects every row through the mapping. Rows without a name project to
/// `None`; the rest point at their deduplicated file student.
pub fn project_students(file: &ParsedFile, mapping: &HeaderMapping) -> (Vec<FileStudent>, Vec<Option<usize>>) {
    let col = |field: &str| mapping.header_for(field).and_then(|h| file.header_index(h));
    let name_col = col(catalog::NAME);
    let id_col = col(catalog::STUDENT_ID);
    let class_col = col(catalog::CLASS_NAME);

    let mut projected = Vec::new();
    let mut positions = Vec::with_capacity(file.rows.len());
    for row in &file.rows {
        let text = |c: Option<usize>| c.and_then(|i| row.get(i)).and_then(|v| v.non_empty_text());
        match text(name_col) {
            Some(name) => {
                positions.push(Some(projected.len()));
                projected.push(FileStudent {
                    name,
                    student_id: text(id_col),
                    class_name: text(class_col),
                });
            }
            None => positions.push(None),
        }
    }

    let (distinct, index) = dedupe_file_students(&projected);
    let rows = positions
        .into_iter()
        .map(|p| p.map(|i| index[i]))
        .collect();
    (distinct, rows)
}

fn invalid(step: Step, action: &'static str, reason: impl Into<String>) -> ImportError {
    ImportError::InvalidTransition {
        step: step.as_str(),
        action,
        reason: reason.into(),
    }
}

impl ImportSession {
    /// Starts a session at the preview step from a validated file and its
    /// resolved mapping.
    pub fn open(
        file: ParsedFile,
        resolution: Resolution,
        config: &ImportConfig,
    ) -> Result<ImportSession, ImportError> {
        if file.rows.is_empty() {
            return Err(ImportError::Input("file has no data rows".into()));
        }
        if !resolution.mapping.covers(&file.headers) {
            return Err(ImportError::Input("mapping does not cover the file headers".into()));
        }
        Ok(ImportSession {
            id: uuid::Uuid::new_v4().to_string(),
            step: Step::Preview,
            exam_info: ExamInfo::for_file(&file.file_name),
            file: Rc::new(file),
            signature: resolution.signature,
            mapping: resolution.mapping,
            confidence: resolution.confidence,
            mapping_from_cache: resolution.from_cache,
            mapping_revision: 0,
            auto_skipped_mapping: false,
            manual_headers: BTreeSet::new(),
            pending_suggestions: BTreeSet::new(),
            identity: None,
            merge_strategy: None,
            new_student_strategy: None,
            exam_scope: config.default_exam_scope,
            fuzzy_choices: BTreeMap::new(),
            commit_in_flight: false,
            last_commit: None,
            warnings: Vec::new(),
        })
    }

    pub fn report(&self) -> Option<&MatchReport> {
        self.identity.as_ref().map(|i| &i.report)
    }

    pub fn pending_fuzzy(&self) -> usize {
        self.report()
            .map(|r| r.pending_fuzzy(&self.fuzzy_choices))
            .unwrap_or(0)
    }

    /// Borrows the session as a commit plan. Only valid at final confirmation.
    pub fn commit_plan<'a>(&'a self, catalog: &'a FieldCatalog) -> Result<CommitPlan<'a>, ImportError> {
        let action = "commit";
        if self.step != Step::FinalConfirm {
            return Err(invalid(self.step, action, "commit is only possible at final confirmation"));
        }
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| invalid(self.step, action, "students have not been matched"))?;
        let (Some(merge), Some(new_students)) = (self.merge_strategy, self.new_student_strategy) else {
            return Err(invalid(self.step, action, "strategies are not chosen"));
        };
        Ok(CommitPlan {
            file: &self.file,
            mapping: &self.mapping,
            catalog,
            exam_info: &self.exam_info,
            exam_scope: self.exam_scope,
            merge_strategy: merge,
            new_student_strategy: new_students,
            file_students: &identity.file_students,
            row_students: &identity.row_students,
            report: &identity.report,
            choices: &self.fuzzy_choices,
        })
    }

    fn mapping_changed(&mut self, catalog: &FieldCatalog) {
        self.mapping_revision += 1;
        self.confidence = confidence_tier(&self.mapping, catalog);
        self.identity = None;
        self.fuzzy_choices.clear();
    }

    fn ensure_identity(&mut self, ctx: &SessionContext<'_>) {
        if let Some(identity) = &self.identity {
            if identity.revision == self.mapping_revision {
                return;
            }
        }
        let (file_students, row_students) = project_students(&self.file, &self.mapping);
        let directory = scope_directory(ctx.directory, &file_students, self.exam_scope);
        let options = match_options(ctx.config);
        let probe = resolve_identities(&file_students, &directory, &BTreeMap::new(), &options);

        // Keep only decisions that still name a fuzzy record and one of its candidates.
        self.fuzzy_choices.retain(|idx, choice| match probe.record_for(*idx) {
            Some(MatchRecord::FuzzyMatch { candidates, .. }) => match choice {
                FuzzyChoice::Rejected => true,
                FuzzyChoice::Confirmed { system_student_id } => candidates
                    .iter()
                    .any(|c| &c.system_student.id == system_student_id),
            },
            _ => false,
        });
        let report = if self.fuzzy_choices.is_empty() {
            probe
        } else {
            resolve_identities(&file_students, &directory, &self.fuzzy_choices, &options)
        };
        self.identity = Some(Rc::new(IdentityState {
            revision: self.mapping_revision,
            file_students,
            row_students,
            directory: Rc::new(directory),
            report,
        }));
    }

    fn suggestion_applies(&self, header: &str) -> bool {
        match self.mapping.get(header) {
            Some(e) => {
                matches!(e.target, MappingTarget::Ignored | MappingTarget::PendingCustom { .. })
                    || e.source == MappingSource::Suggestion
            }
            None => false,
        }
    }
}

/// Computes the session that follows `event`. The input session is never
/// modified; a rejected event leaves it as the current state.
pub fn reduce(
    session: &ImportSession,
    event: SessionEvent,
    ctx: &SessionContext<'_>,
) -> Result<ImportSession, ImportError> {
    let step = session.step;
    let action = event.action();
    if step.is_terminal() {
        return Err(invalid(step, action, "the session is closed"));
    }
    if session.commit_in_flight
        && !matches!(event, SessionEvent::CommitFinished(_) | SessionEvent::CommitFailed(_))
    {
        return Err(ImportError::CommitInFlight);
    }

    let mut next = session.clone();
    next.warnings.clear();

    match event {
        SessionEvent::Advance => match step {
            Step::Preview => {
                if next.file.rows.is_empty() {
                    return Err(ImportError::Input("file has no data rows".into()));
                }
                next.step = Step::ExamMetadata;
            }
            Step::ExamMetadata => {
                let missing = next.exam_info.missing_fields();
                if !missing.is_empty() {
                    return Err(invalid(
                        step,
                        action,
                        format!("exam {} required", missing.join(", ")),
                    ));
                }
                if next.confidence == ConfidenceTier::High
                    && ctx.config.auto_skip_high_confidence
                    && next.mapping.is_claimed(catalog::NAME)
                {
                    next.step = Step::StudentStrategy;
                    next.auto_skipped_mapping = true;
                    next.warnings.push(notice(
                        "mapping_auto_skipped",
                        "column mapping was recognised with high confidence; go back to review it",
                    ));
                } else {
                    next.step = Step::MappingReview;
                }
            }
            Step::MappingReview => {
                if !next.mapping.is_claimed(catalog::NAME) {
                    return Err(ImportError::MappingIncomplete(
                        "map a column to the student name".into(),
                    ));
                }
                if !next.mapping.is_claimed(catalog::STUDENT_ID) {
                    next.warnings.push(notice(
                        "student_id_unmapped",
                        "no student id column; students will be matched by name only",
                    ));
                }
                next.step = Step::StudentStrategy;
            }
            Step::StudentStrategy => {
                if next.merge_strategy.is_none() || next.new_student_strategy.is_none() {
                    return Err(invalid(step, action, "choose a merge and a new-student strategy"));
                }
                next.ensure_identity(ctx);
                let pending = next.pending_fuzzy();
                if pending > 0 {
                    next.warnings.push(notice(
                        "resolution_ambiguous",
                        ImportError::ResolutionAmbiguous { pending }.to_string(),
                    ));
                }
                next.step = Step::FinalConfirm;
            }
            Step::FinalConfirm => return Err(invalid(step, action, "use commit to finish the import")),
            Step::Committed | Step::Cancelled => return Err(invalid(step, action, "the session is closed")),
        },

        SessionEvent::GoBack(target) => {
            if target.is_terminal() || target >= step {
                return Err(invalid(step, action, format!("cannot go back to {}", target.as_str())));
            }
            next.step = target;
            if target <= Step::StudentStrategy {
                next.identity = None;
            }
            if target <= Step::MappingReview {
                next.auto_skipped_mapping = false;
            }
        }

        SessionEvent::SetExamInfo(info) => {
            next.exam_info = info.normalized();
        }

        SessionEvent::SetMapping { header, target } => {
            if step > Step::MappingReview {
                return Err(invalid(step, action, "go back to the mapping step first"));
            }
            if let Some(key) = target.field_key() {
                if !ctx.catalog.contains(key) {
                    return Err(invalid(step, action, format!("unknown field: {}", key)));
                }
            }
            let displaced = next
                .mapping
                .assign(&header, target, MappingSource::Manual)
                .map_err(|e| invalid(step, action, e))?;
            if let Some(other) = displaced {
                next.manual_headers.remove(&other);
                next.warnings.push(notice(
                    "mapping_displaced",
                    format!("{} is no longer mapped", other),
                ));
            }
            next.pending_suggestions.remove(&header);
            next.manual_headers.insert(header);
            next.mapping_changed(ctx.catalog);
        }

        SessionEvent::SuggestionsRequested(headers) => {
            if step > Step::MappingReview {
                return Err(invalid(step, action, "go back to the mapping step first"));
            }
            for h in headers {
                if next.mapping.get(&h).is_none() {
                    return Err(invalid(step, action, format!("unknown header: {}", h)));
                }
                if !next.manual_headers.contains(&h) {
                    next.pending_suggestions.insert(h);
                }
            }
        }

        SessionEvent::SuggestionArrived { header, suggestion } => {
            next.pending_suggestions.remove(&header);
            let Some(suggestion) = suggestion else {
                return Ok(next);
            };
            if next.manual_headers.contains(&header) {
                log::debug!("suggestion for {:?} ignored: header confirmed manually", header);
                next.warnings.push(notice(
                    "suggestion_ignored",
                    format!("{} was already confirmed", header),
                ));
                return Ok(next);
            }
            if step > Step::MappingReview || !next.suggestion_applies(&header) {
                next.warnings.push(notice(
                    "suggestion_ignored",
                    format!("suggestion for {} arrived too late", header),
                ));
                return Ok(next);
            }
            let target = match suggestion {
                Suggestion::Field { key } => {
                    if !ctx.catalog.contains(&key) {
                        next.warnings.push(notice("suggestion_ignored", format!("unknown field: {}", key)));
                        return Ok(next);
                    }
                    if next.mapping.header_for(&key).is_some_and(|h| h != header) {
                        next.warnings.push(notice(
                            "suggestion_ignored",
                            format!("{} is already mapped to another column", key),
                        ));
                        return Ok(next);
                    }
                    MappingTarget::Field { key }
                }
                Suggestion::NewField { label } => MappingTarget::PendingCustom { label },
            };
            if next.mapping.get(&header).map(|e| &e.target) == Some(&target) {
                return Ok(next);
            }
            next.mapping
                .assign(&header, target, MappingSource::Suggestion)
                .map_err(|e| invalid(step, action, e))?;
            next.mapping_changed(ctx.catalog);
        }

        SessionEvent::CustomFieldCreated { header, field } => {
            if step > Step::MappingReview {
                return Err(invalid(step, action, "go back to the mapping step first"));
            }
            if !ctx.catalog.contains(&field.key) {
                return Err(invalid(step, action, format!("field {} is not registered", field.key)));
            }
            next.mapping
                .assign(&header, MappingTarget::Field { key: field.key }, MappingSource::Manual)
                .map_err(|e| invalid(step, action, e))?;
            next.pending_suggestions.remove(&header);
            next.manual_headers.insert(header);
            next.mapping_changed(ctx.catalog);
        }

        SessionEvent::SetStrategies {
            merge,
            new_student,
            scope,
        } => {
            if step > Step::StudentStrategy {
                return Err(invalid(step, action, "go back to the strategy step first"));
            }
            if let Some(m) = merge {
                next.merge_strategy = Some(m);
            }
            if let Some(n) = new_student {
                next.new_student_strategy = Some(n);
            }
            if let Some(s) = scope {
                if s != next.exam_scope {
                    next.exam_scope = s;
                    next.identity = None;
                }
            }
        }

        SessionEvent::ResolveFuzzy { file_index, choice } => {
            if step != Step::FinalConfirm {
                return Err(invalid(step, action, "fuzzy matches are resolved at final confirmation"));
            }
            let Some(identity) = next.identity.clone() else {
                return Err(invalid(step, action, "students have not been matched"));
            };
            let Some(MatchRecord::FuzzyMatch { candidates, .. }) = identity.report.record_for(file_index) else {
                return Err(invalid(step, action, format!("file student {} is not a fuzzy match", file_index)));
            };
            match choice {
                Some(FuzzyChoice::Confirmed { system_student_id }) => {
                    if !candidates.iter().any(|c| c.system_student.id == system_student_id) {
                        return Err(invalid(
                            step,
                            action,
                            format!("{} is not a candidate", system_student_id),
                        ));
                    }
                    next.fuzzy_choices
                        .insert(file_index, FuzzyChoice::Confirmed { system_student_id });
                }
                Some(FuzzyChoice::Rejected) => {
                    next.fuzzy_choices.insert(file_index, FuzzyChoice::Rejected);
                }
                None => {
                    next.fuzzy_choices.remove(&file_index);
                }
            }
            let report = resolve_identities(
                &identity.file_students,
                &identity.directory,
                &next.fuzzy_choices,
                &match_options(ctx.config),
            );
            next.identity = Some(Rc::new(IdentityState {
                report,
                ..(*identity).clone()
            }));
        }

        SessionEvent::BeginCommit => {
            if step != Step::FinalConfirm {
                return Err(invalid(step, action, "commit is only possible at final confirmation"));
            }
            if next.identity.is_none() {
                return Err(invalid(step, action, "students have not been matched"));
            }
            next.commit_in_flight = true;
        }

        SessionEvent::CommitFinished(summary) => {
            if !next.commit_in_flight {
                return Err(invalid(step, action, "no commit is in flight"));
            }
            next.commit_in_flight = false;
            if summary.held_fuzzy > 0 {
                next.warnings.push(notice(
                    "resolution_ambiguous",
                    format!("{} row(s) held back pending fuzzy confirmation", summary.held_fuzzy),
                ));
            }
            next.last_commit = Some(summary);
            next.step = Step::Committed;
        }

        SessionEvent::CommitFailed(message) => {
            if !next.commit_in_flight {
                return Err(invalid(step, action, "no commit is in flight"));
            }
            next.commit_in_flight = false;
            next.warnings.push(notice("commit_error", message));
        }

        SessionEvent::Cancel => {
            next.step = Step::Cancelled;
        }
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::{resolve_headers, MemoryMappingCache};
    use crate::table::CellValue;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    fn file(headers: &[&str], rows: Vec<Vec<CellValue>>) -> ParsedFile {
        ParsedFile::new("期中考试.xlsx", headers.iter().map(|h| h.to_string()).collect(), rows).expect("file")
    }

    fn open(f: ParsedFile) -> ImportSession {
        let res = resolve_headers(
            &f.headers,
            &f.rows,
            &FieldCatalog::builtin(),
            &MemoryMappingCache::new(),
            &ImportConfig::default(),
        );
        ImportSession::open(f, res, &ImportConfig::default()).expect("open")
    }

    fn high_confidence_file() -> ParsedFile {
        file(
            &["学号", "姓名", "班级", "分数"],
            vec![
                vec![text("1001"), text("张三"), text("1班"), text("88")],
                vec![text("1002"), text("李小四"), text("1班"), text("92")],
            ],
        )
    }

    fn low_confidence_file() -> ParsedFile {
        file(
            &["A", "B"],
            vec![vec![text("x1"), text("y1")], vec![text("x2"), text("y2")]],
        )
    }

    fn directory() -> Vec<SystemStudent> {
        vec![
            SystemStudent {
                id: "s1".into(),
                name: "张三".into(),
                student_id: "1001".into(),
                class_name: Some("1班".into()),
            },
            SystemStudent {
                id: "s2".into(),
                name: "李晓四".into(),
                student_id: "2002".into(),
                class_name: Some("1班".into()),
            },
        ]
    }

    struct Env {
        catalog: FieldCatalog,
        config: ImportConfig,
        directory: Vec<SystemStudent>,
    }

    impl Env {
        fn new() -> Self {
            Env {
                catalog: FieldCatalog::builtin(),
                config: ImportConfig::default(),
                directory: directory(),
            }
        }

        fn ctx(&self) -> SessionContext<'_> {
            SessionContext {
                directory: &self.directory,
                catalog: &self.catalog,
                config: &self.config,
            }
        }

        fn apply(&self, s: &ImportSession, e: SessionEvent) -> ImportSession {
            reduce(s, e, &self.ctx()).expect("transition")
        }
    }

    fn exam() -> ExamInfo {
        ExamInfo {
            title: "期中考试".into(),
            exam_type: "期中".into(),
            date: "2024/4/20".into(),
            subject: Some("数学".into()),
        }
    }

    fn strategies() -> SessionEvent {
        SessionEvent::SetStrategies {
            merge: Some(MergeStrategy::Merge),
            new_student: Some(NewStudentStrategy::Create),
            scope: None,
        }
    }

    fn to_final(env: &Env, s: ImportSession) -> ImportSession {
        let s = env.apply(&s, SessionEvent::Advance);
        let s = env.apply(&s, SessionEvent::SetExamInfo(exam()));
        let s = env.apply(&s, SessionEvent::Advance);
        let s = env.apply(&s, strategies());
        env.apply(&s, SessionEvent::Advance)
    }

    #[test]
    fn high_confidence_skips_mapping_review() {
        let env = Env::new();
        let s = open(high_confidence_file());
        assert_eq!(s.confidence, ConfidenceTier::High);
        assert_eq!(s.exam_info.title, "期中考试");

        let s = env.apply(&s, SessionEvent::Advance);
        let s = env.apply(&s, SessionEvent::SetExamInfo(exam()));
        assert_eq!(s.exam_info.date, "2024-04-20");
        let s = env.apply(&s, SessionEvent::Advance);
        assert_eq!(s.step, Step::StudentStrategy);
        assert!(s.auto_skipped_mapping);
        assert_eq!(s.warnings[0].code, "mapping_auto_skipped");

        let back = env.apply(&s, SessionEvent::GoBack(Step::MappingReview));
        assert_eq!(back.step, Step::MappingReview);
        assert!(!back.auto_skipped_mapping);
    }

    #[test]
    fn auto_skip_can_be_disabled() {
        let mut env = Env::new();
        env.config.auto_skip_high_confidence = false;
        let s = open(high_confidence_file());
        let s = env.apply(&s, SessionEvent::Advance);
        let s = env.apply(&s, SessionEvent::SetExamInfo(exam()));
        let s = env.apply(&s, SessionEvent::Advance);
        assert_eq!(s.step, Step::MappingReview);
    }

    #[test]
    fn exam_info_is_required() {
        let env = Env::new();
        let s = env.apply(&open(high_confidence_file()), SessionEvent::Advance);
        let err = reduce(&s, SessionEvent::Advance, &env.ctx()).unwrap_err();
        assert_eq!(err.code(), "invalid_transition");
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn name_mapping_blocks_mapping_review() {
        let env = Env::new();
        let s = open(low_confidence_file());
        assert_eq!(s.confidence, ConfidenceTier::Low);
        let s = env.apply(&s, SessionEvent::Advance);
        let s = env.apply(&s, SessionEvent::SetExamInfo(exam()));
        let s = env.apply(&s, SessionEvent::Advance);
        assert_eq!(s.step, Step::MappingReview);

        let err = reduce(&s, SessionEvent::Advance, &env.ctx()).unwrap_err();
        assert!(matches!(err, ImportError::MappingIncomplete(_)));

        let s = env.apply(
            &s,
            SessionEvent::SetMapping {
                header: "A".into(),
                target: MappingTarget::field("name"),
            },
        );
        let s = env.apply(&s, SessionEvent::Advance);
        assert_eq!(s.step, Step::StudentStrategy);
        assert!(s.warnings.iter().any(|w| w.code == "student_id_unmapped"));
    }

    #[test]
    fn strategies_are_required_before_final_confirm() {
        let env = Env::new();
        let s = open(high_confidence_file());
        let s = env.apply(&s, SessionEvent::Advance);
        let s = env.apply(&s, SessionEvent::SetExamInfo(exam()));
        let s = env.apply(&s, SessionEvent::Advance);
        assert!(reduce(&s, SessionEvent::Advance, &env.ctx()).is_err());

        let s = env.apply(&s, strategies());
        let s = env.apply(&s, SessionEvent::Advance);
        assert_eq!(s.step, Step::FinalConfirm);
        let report = s.report().expect("report");
        assert_eq!(report.statistics.exact_match_count, 1);
        assert_eq!(report.fuzzy_matches().count(), 1);
        assert!(s.warnings.iter().any(|w| w.code == "resolution_ambiguous"));
    }

    #[test]
    fn going_back_drops_the_report_but_keeps_choices() {
        let env = Env::new();
        let s = to_final(&env, open(high_confidence_file()));
        let s = env.apply(
            &s,
            SessionEvent::ResolveFuzzy {
                file_index: 1,
                choice: Some(FuzzyChoice::Confirmed {
                    system_student_id: "s2".into(),
                }),
            },
        );
        assert_eq!(s.pending_fuzzy(), 0);
        assert!(s.report().expect("report").missing_students.is_empty());

        let back = env.apply(&s, SessionEvent::GoBack(Step::ExamMetadata));
        assert!(back.report().is_none());
        assert_eq!(back.fuzzy_choices.len(), 1);
        assert_eq!(back.merge_strategy, Some(MergeStrategy::Merge));

        let again = env.apply(&back, SessionEvent::Advance);
        let again = env.apply(&again, SessionEvent::Advance);
        assert_eq!(again.report(), s.report());
    }

    #[test]
    fn mapping_change_clears_choices() {
        let env = Env::new();
        let s = to_final(&env, open(high_confidence_file()));
        let s = env.apply(
            &s,
            SessionEvent::ResolveFuzzy {
                file_index: 1,
                choice: Some(FuzzyChoice::Rejected),
            },
        );
        let s = env.apply(&s, SessionEvent::GoBack(Step::MappingReview));
        let s = env.apply(
            &s,
            SessionEvent::SetMapping {
                header: "分数".into(),
                target: MappingTarget::Ignored,
            },
        );
        assert!(s.fuzzy_choices.is_empty());
        assert!(s.manual_headers.contains("分数"));
    }

    #[test]
    fn fuzzy_choice_must_name_a_candidate() {
        let env = Env::new();
        let s = to_final(&env, open(high_confidence_file()));
        let bad = SessionEvent::ResolveFuzzy {
            file_index: 1,
            choice: Some(FuzzyChoice::Confirmed {
                system_student_id: "s1".into(),
            }),
        };
        assert!(reduce(&s, bad, &env.ctx()).is_err());
        let not_fuzzy = SessionEvent::ResolveFuzzy {
            file_index: 0,
            choice: Some(FuzzyChoice::Rejected),
        };
        assert!(reduce(&s, not_fuzzy, &env.ctx()).is_err());
    }

    #[test]
    fn suggestion_never_overwrites_manual_header() {
        let env = Env::new();
        let s = open(low_confidence_file());
        let s = env.apply(&s, SessionEvent::SuggestionsRequested(vec!["A".into(), "B".into()]));
        assert_eq!(s.pending_suggestions.len(), 2);
        let s = env.apply(
            &s,
            SessionEvent::SetMapping {
                header: "A".into(),
                target: MappingTarget::field("name"),
            },
        );
        assert!(!s.pending_suggestions.contains("A"));

        let s = env.apply(
            &s,
            SessionEvent::SuggestionArrived {
                header: "A".into(),
                suggestion: Some(Suggestion::Field {
                    key: "student_id".into(),
                }),
            },
        );
        assert_eq!(s.mapping.field_of("A"), Some("name"));
        assert_eq!(s.warnings[0].code, "suggestion_ignored");

        let s = env.apply(
            &s,
            SessionEvent::SuggestionArrived {
                header: "B".into(),
                suggestion: Some(Suggestion::Field { key: "score".into() }),
            },
        );
        assert_eq!(s.mapping.field_of("B"), Some("score"));
        assert!(s.pending_suggestions.is_empty());

        let again = env.apply(
            &s,
            SessionEvent::SuggestionArrived {
                header: "B".into(),
                suggestion: Some(Suggestion::Field { key: "score".into() }),
            },
        );
        assert_eq!(again.mapping, s.mapping);
        assert_eq!(again.mapping_revision, s.mapping_revision);
    }

    #[test]
    fn new_field_suggestion_marks_pending_custom() {
        let env = Env::new();
        let s = open(low_confidence_file());
        let s = env.apply(
            &s,
            SessionEvent::SuggestionArrived {
                header: "B".into(),
                suggestion: Some(Suggestion::NewField {
                    label: "B (grade)".into(),
                }),
            },
        );
        assert_eq!(
            s.mapping.get("B").map(|e| e.target.clone()),
            Some(MappingTarget::PendingCustom {
                label: "B (grade)".into()
            })
        );

        let field = CustomField {
            key: "custom_b".into(),
            label: "B (grade)".into(),
            origin_header: "B".into(),
        };
        let mut env = env;
        env.catalog.extend(field.clone());
        let s = env.apply(
            &s,
            SessionEvent::CustomFieldCreated {
                header: "B".into(),
                field,
            },
        );
        assert_eq!(s.mapping.field_of("B"), Some("custom_b"));
        assert!(s.manual_headers.contains("B"));
    }

    #[test]
    fn second_commit_and_cancel_are_rejected_while_in_flight() {
        let env = Env::new();
        let s = to_final(&env, open(high_confidence_file()));
        let s = env.apply(&s, SessionEvent::BeginCommit);
        assert!(s.commit_in_flight);
        assert!(matches!(
            reduce(&s, SessionEvent::BeginCommit, &env.ctx()),
            Err(ImportError::CommitInFlight)
        ));
        assert!(matches!(
            reduce(&s, SessionEvent::Cancel, &env.ctx()),
            Err(ImportError::CommitInFlight)
        ));

        let failed = env.apply(&s, SessionEvent::CommitFailed("locked".into()));
        assert!(!failed.commit_in_flight);
        assert_eq!(failed.step, Step::FinalConfirm);

        let done = env.apply(&s, SessionEvent::CommitFinished(CommitSummary::default()));
        assert_eq!(done.step, Step::Committed);
        assert!(reduce(&done, SessionEvent::Cancel, &env.ctx()).is_err());
    }

    #[test]
    fn cancel_is_allowed_between_steps() {
        let env = Env::new();
        let s = env.apply(&open(high_confidence_file()), SessionEvent::Advance);
        let s = env.apply(&s, SessionEvent::Cancel);
        assert_eq!(s.step, Step::Cancelled);
    }

    #[test]
    fn cannot_go_forward_with_go_back() {
        let env = Env::new();
        let s = open(high_confidence_file());
        assert!(reduce(&s, SessionEvent::GoBack(Step::FinalConfirm), &env.ctx()).is_err());
    }

    #[test]
    fn rejected_event_leaves_session_untouched() {
        let env = Env::new();
        let s = env.apply(&open(high_confidence_file()), SessionEvent::Advance);
        let before = s.step;
        let _ = reduce(&s, SessionEvent::Advance, &env.ctx());
        assert_eq!(s.step, before);
    }

    #[test]
    fn projection_skips_nameless_rows() {
        let f = file(
            &["姓名", "分数"],
            vec![
                vec![text("张三"), text("1")],
                vec![CellValue::Empty, text("2")],
                vec![text("张三"), text("3")],
            ],
        );
        let s = open(f);
        let (students, rows) = project_students(&s.file, &s.mapping);
        assert_eq!(students.len(), 1);
        assert_eq!(rows, vec![Some(0), None, Some(0)]);
    }
}
