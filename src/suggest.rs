use crate::catalog::{self, FieldCatalog};
use crate::error::ImportError;
use crate::mapping::normalize_header;
use crate::table::CellValue;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Suggestion {
    Field { key: String },
    NewField { label: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SuggestionRequest {
    pub header: String,
    pub sample: Vec<CellValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionOutcome {
    pub header: String,
    pub suggestion: Option<Suggestion>,
    pub attempts: usize,
    pub fell_back: bool,
    pub error: Option<String>,
}

/// A per-header suggestion provider. `Ok(None)` means "no opinion".
pub trait SuggestionSource: Sync {
    fn name(&self) -> &'static str;
    fn suggest(
        &self,
        header: &str,
        sample: &[CellValue],
        catalog: &FieldCatalog,
    ) -> anyhow::Result<Option<Suggestion>>;
}

static LETTER_GRADE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([A-Fa-f][+-]?|[优良中差]|及格|不及格)$").expect("letter grade regex"));

const KEYWORD_RULES: &[(&[&str], &str)] = &[
    (&["学号", "编号", "id"], catalog::STUDENT_ID),
    (&["姓名", "名字", "name"], catalog::NAME),
    (&["科目", "学科", "subject"], catalog::SUBJECT),
    (&["日期", "时间", "date"], catalog::EXAM_DATE),
];

/// Keyword rules over the header text, plus sample-driven proposals for new
/// fields. Always available and never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRuleSource;

impl LocalRuleSource {
    fn keyword_field(norm: &str) -> Option<&'static str> {
        let has = |ws: &[&str]| ws.iter().any(|w| norm.contains(w));
        let rank = has(&["排名", "名次", "排", "rank"]);
        if rank && has(&["班", "class"]) {
            return Some(catalog::RANK_IN_CLASS);
        }
        if rank && has(&["校", "级", "grade", "school"]) {
            return Some(catalog::RANK_IN_GRADE);
        }
        if has(&["班级", "班", "class"]) {
            return Some(catalog::CLASS_NAME);
        }
        if has(&["考试", "exam", "测试"]) {
            if has(&["类型", "type", "性质"]) {
                return Some(catalog::EXAM_TYPE);
            }
            if has(&["标题", "名称", "title"]) {
                return Some(catalog::EXAM_TITLE);
            }
        }
        for (words, field) in KEYWORD_RULES {
            if has(words) {
                return Some(field);
            }
        }
        if has(&["分数", "成绩", "得分", "score"]) {
            return Some(catalog::SCORE);
        }
        None
    }
}

impl SuggestionSource for LocalRuleSource {
    fn name(&self) -> &'static str {
        "local"
    }

    fn suggest(
        &self,
        header: &str,
        sample: &[CellValue],
        catalog: &FieldCatalog,
    ) -> anyhow::Result<Option<Suggestion>> {
        let norm = normalize_header(header);
        if let Some(field) = Self::keyword_field(&norm) {
            if catalog.contains(field) {
                return Ok(Some(Suggestion::Field {
                    key: field.to_string(),
                }));
            }
        }

        let values = sample.iter().filter(|c| !c.is_empty()).collect::<Vec<_>>();
        if values.is_empty() {
            return Ok(None);
        }
        if values.iter().all(|c| LETTER_GRADE_RE.is_match(&c.as_text())) {
            return Ok(Some(Suggestion::NewField {
                label: format!("{} (grade)", header.trim()),
            }));
        }
        if values
            .iter()
            .all(|c| matches!(c.as_number(), Some(n) if (0.0..=1.0).contains(&n)) && c.is_number())
        {
            return Ok(Some(Suggestion::NewField {
                label: format!("{} (ratio)", header.trim()),
            }));
        }
        Ok(None)
    }
}

fn ask_with_retries(
    source: &dyn SuggestionSource,
    req: &SuggestionRequest,
    catalog: &FieldCatalog,
    retries: usize,
) -> SuggestionOutcome {
    let mut last_err = None;
    for attempt in 1..=retries + 1 {
        match source.suggest(&req.header, &req.sample, catalog) {
            Ok(suggestion) => {
                return SuggestionOutcome {
                    header: req.header.clone(),
                    suggestion,
                    attempts: attempt,
                    fell_back: false,
                    error: None,
                };
            }
            Err(e) => {
                log::warn!(
                    "suggestion source {} failed for {:?} (attempt {}): {:#}",
                    source.name(),
                    req.header,
                    attempt,
                    e
                );
                last_err = Some(
                    ImportError::ExternalService(format!("{}: {:#}", source.name(), e)).to_string(),
                );
            }
        }
    }
    // Local rules cannot fail.
    let suggestion = LocalRuleSource
        .suggest(&req.header, &req.sample, catalog)
        .unwrap_or(None);
    SuggestionOutcome {
        header: req.header.clone(),
        suggestion,
        attempts: retries + 1,
        fell_back: true,
        error: last_err,
    }
}

/// Asks `source` about every request, `batch_size` headers at a time. The
/// calls of one batch run on scoped threads and all finish before the next
/// batch starts. Outcomes come back in request order.
pub fn run_batches(
    source: &dyn SuggestionSource,
    requests: &[SuggestionRequest],
    catalog: &FieldCatalog,
    batch_size: usize,
    retries: usize,
) -> Vec<SuggestionOutcome> {
    let batch_size = batch_size.max(1);
    let mut out = Vec::with_capacity(requests.len());
    for batch in requests.chunks(batch_size) {
        let results = std::thread::scope(|scope| {
            let handles = batch
                .iter()
                .map(|req| scope.spawn(move || ask_with_retries(source, req, catalog, retries)))
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .zip(batch)
                .map(|(h, req)| {
                    h.join().unwrap_or_else(|_| SuggestionOutcome {
                        header: req.header.clone(),
                        suggestion: None,
                        attempts: 0,
                        fell_back: false,
                        error: Some("suggestion worker panicked".into()),
                    })
                })
                .collect::<Vec<_>>()
        });
        out.extend(results);
    }
    out
}
