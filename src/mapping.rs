use crate::catalog::{self, FieldCatalog, ESSENTIAL_FIELDS};
use crate::config::ImportConfig;
use crate::table::CellValue;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MappingTarget {
    Field { key: String },
    Ignored,
    PendingCustom { label: String },
}

impl MappingTarget {
    pub fn field(key: impl Into<String>) -> Self {
        MappingTarget::Field { key: key.into() }
    }

    pub fn field_key(&self) -> Option<&str> {
        match self {
            MappingTarget::Field { key } => Some(key.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingSource {
    Cache,
    Alias,
    Compound,
    Content,
    NumericFallback,
    Suggestion,
    Manual,
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    pub header: String,
    pub target: MappingTarget,
    pub source: MappingSource,
}

/// One entry per file header, in file order. A field key is the target of at
/// most one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderMapping {
    entries: Vec<MappingEntry>,
}

impl HeaderMapping {
    pub fn all_ignored(headers: &[String]) -> Self {
        HeaderMapping {
            entries: headers
                .iter()
                .map(|h| MappingEntry {
                    header: h.clone(),
                    target: MappingTarget::Ignored,
                    source: MappingSource::Default,
                })
                .collect(),
        }
    }

    pub fn entries(&self) -> &[MappingEntry] {
        &self.entries
    }

    pub fn get(&self, header: &str) -> Option<&MappingEntry> {
        self.entries.iter().find(|e| e.header == header)
    }

    #[cfg(test)]
    pub fn field_of(&self, header: &str) -> Option<&str> {
        self.get(header).and_then(|e| e.target.field_key())
    }

    pub fn header_for(&self, field: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.target.field_key() == Some(field))
            .map(|e| e.header.as_str())
    }

    pub fn is_claimed(&self, field: &str) -> bool {
        self.header_for(field).is_some()
    }

    pub fn mapped_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.target.field_key().is_some())
            .count()
    }

    pub fn covers(&self, headers: &[String]) -> bool {
        self.entries.len() == headers.len()
            && self.entries.iter().zip(headers).all(|(e, h)| &e.header == h)
    }

    /// Rule-driven claim: only an ignored header may take an unclaimed field.
    fn claim(&mut self, idx: usize, field: &str, source: MappingSource) -> bool {
        if self.is_claimed(field) {
            return false;
        }
        let Some(entry) = self.entries.get_mut(idx) else {
            return false;
        };
        if entry.target != MappingTarget::Ignored {
            return false;
        }
        entry.target = MappingTarget::field(field);
        entry.source = source;
        true
    }

    /// Reviewer-driven assignment. Moving a field onto this header releases it
    /// from whichever header held it; that header is returned.
    pub fn assign(
        &mut self,
        header: &str,
        target: MappingTarget,
        source: MappingSource,
    ) -> Result<Option<String>, String> {
        let idx = self
            .entries
            .iter()
            .position(|e| e.header == header)
            .ok_or_else(|| format!("unknown header: {}", header))?;
        let mut displaced = None;
        if let Some(key) = target.field_key() {
            if let Some(other) = self
                .entries
                .iter_mut()
                .enumerate()
                .find(|(i, e)| *i != idx && e.target.field_key() == Some(key))
                .map(|(_, e)| e)
            {
                other.target = MappingTarget::Ignored;
                other.source = source;
                displaced = Some(other.header.clone());
            }
        }
        let entry = &mut self.entries[idx];
        entry.target = target;
        entry.source = source;
        Ok(displaced)
    }

    fn with_source(mut self, source: MappingSource) -> Self {
        for e in &mut self.entries {
            e.source = source;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceTier {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub signature: String,
    pub mapping: HeaderMapping,
    pub confidence: ConfidenceTier,
    pub from_cache: bool,
}

/// Last-writer-wins store of confirmed mappings keyed by header signature.
pub trait MappingCache {
    fn get(&self, signature: &str) -> Option<HeaderMapping>;
    fn put(&self, signature: &str, headers: &[String], mapping: &HeaderMapping) -> anyhow::Result<()>;
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryMappingCache {
    entries: std::cell::RefCell<std::collections::HashMap<String, HeaderMapping>>,
}

#[cfg(test)]
impl MemoryMappingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }
}

#[cfg(test)]
impl MappingCache for MemoryMappingCache {
    fn get(&self, signature: &str) -> Option<HeaderMapping> {
        self.entries.borrow().get(signature).cloned()
    }

    fn put(&self, signature: &str, _headers: &[String], mapping: &HeaderMapping) -> anyhow::Result<()> {
        self.entries
            .borrow_mut()
            .insert(signature.to_string(), mapping.clone());
        Ok(())
    }
}

/// SHA-256 over the ordered headers joined by the unit separator, hex encoded.
pub fn header_signature(headers: &[String]) -> String {
    let mut hasher = Sha256::new();
    for (i, h) in headers.iter().enumerate() {
        if i > 0 {
            hasher.update([0x1f]);
        }
        hasher.update(h.as_bytes());
    }
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Lowercased, with whitespace and punctuation (ASCII and CJK) removed.
pub fn normalize_header(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

const FIELD_ALIASES: &[(&str, &[&str])] = &[
    (
        catalog::STUDENT_ID,
        &[
            "学号", "学生编号", "学生学号", "学籍号", "考号", "考生号", "准考证号", "报名号", "编号",
            "id", "studentid", "studentno", "studentnumber",
        ],
    ),
    (
        catalog::NAME,
        &[
            "姓名", "学生姓名", "考生姓名", "学员姓名", "名字", "学生", "考生", "name", "studentname",
            "fullname",
        ],
    ),
    (
        catalog::CLASS_NAME,
        &[
            "班级", "班级名称", "所在班级", "行政班", "行政班级", "教学班", "班组", "班", "class",
            "classname",
        ],
    ),
    (catalog::GRADE_LEVEL, &["年级", "所在年级", "gradelevel"]),
    (
        catalog::SUBJECT,
        &["科目", "考试科目", "科目名称", "学科", "课程", "课程名称", "subject", "course"],
    ),
    (
        catalog::SCORE,
        &["分数", "成绩", "得分", "考试成绩", "原始分", "成绩分数", "score", "mark", "points"],
    ),
    (
        catalog::TOTAL_SCORE,
        &["总分", "总成绩", "总分数", "全科总分", "合计", "total", "totalscore"],
    ),
    (
        catalog::SUBJECT_TOTAL_SCORE,
        &["满分", "科目满分", "卷面满分", "fullmark", "maxscore", "subjecttotal"],
    ),
    (
        catalog::ORIGINAL_GRADE,
        &["等级", "等级评定", "成绩等级", "评级", "等第", "grade", "level", "lettergrade"],
    ),
    (
        catalog::RANK_IN_CLASS,
        &["班级排名", "班排名", "班内排名", "班级名次", "班排", "classrank"],
    ),
    (
        catalog::RANK_IN_GRADE,
        &[
            "年级排名", "年级名次", "校排名", "学校排名", "全校排名", "全级排名", "总排名", "年排",
            "校排", "校名", "graderank", "schoolrank",
        ],
    ),
    (
        catalog::EXAM_TITLE,
        &["考试标题", "考试名称", "测试名称", "测验名称", "examtitle", "examname"],
    ),
    (
        catalog::EXAM_TYPE,
        &["考试类型", "考试性质", "考试种类", "examtype"],
    ),
    (
        catalog::EXAM_DATE,
        &["考试日期", "考试时间", "测试日期", "日期", "date", "examdate"],
    ),
    (catalog::EXAM_SCOPE, &["考试范围", "examscope"]),
    (catalog::PERCENTILE, &["百分位", "百分位数", "percentile"]),
    (catalog::Z_SCORE, &["标准分", "z分数", "zscore"]),
];

const CLASS_RANK_TOKEN: &str = "班名";
const CLASS_SCOPE_TOKENS: &[&str] = &["班", "class"];
const GRADE_SCOPE_TOKENS: &[&str] = &["校", "年级", "级", "全校", "school", "grade"];
const TOTAL_SCORE_TOKENS: &[&str] = &["总分", "分数", "total", "score"];
// 等级 carries 级 and "score grade" carries grade, so these win over scope.
const LETTER_GRADE_TOKENS: &[&str] = &["等级", "等第", "评级", "lettergrade", "scoregrade"];

static ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{5,12}$").expect("id regex"));
static ID_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(G|S|XS|STU|XH|J)[\d-]+$").expect("id prefix regex"));
static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}[-/.]\d{1,2}[-/.]\d{1,2}$").expect("date regex"));
static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\x{4e00}-\x{9fa5}]{2,4}$").expect("name regex"));
static CLASS_DIGITS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").expect("class regex"));
static CLASS_NUMERAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[一二三四五六七八九十]$").expect("class numeral regex"));
static CLASS_PAREN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+[(（][a-zA-Z][)）]$").expect("class paren regex"));

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

fn compound_field(norm: &str) -> Option<&'static str> {
    if norm.contains(CLASS_RANK_TOKEN) {
        return Some(catalog::RANK_IN_CLASS);
    }
    if !contains_any(norm, TOTAL_SCORE_TOKENS) {
        return None;
    }
    if contains_any(norm, LETTER_GRADE_TOKENS) {
        return Some(catalog::ORIGINAL_GRADE);
    }
    // 班级 also contains 级, so class scope is checked first.
    if contains_any(norm, CLASS_SCOPE_TOKENS) {
        return Some(catalog::RANK_IN_CLASS);
    }
    if contains_any(norm, GRADE_SCOPE_TOKENS) {
        return Some(catalog::RANK_IN_GRADE);
    }
    None
}

fn exact_alias(norm: &str, catalog: &FieldCatalog) -> Option<String> {
    for (field, aliases) in FIELD_ALIASES {
        if aliases.iter().any(|a| *a == norm) {
            return Some(field.to_string());
        }
    }
    catalog
        .custom_fields()
        .iter()
        .find(|f| normalize_header(&f.label) == norm || normalize_header(&f.origin_header) == norm)
        .map(|f| f.key.clone())
}

fn contained_alias(norm: &str) -> Option<&'static str> {
    if norm.chars().count() < 2 {
        return None;
    }
    for (field, aliases) in FIELD_ALIASES {
        for a in aliases.iter() {
            if a.chars().count() < 2 {
                continue;
            }
            if norm.contains(*a) || a.contains(norm) {
                return Some(*field);
            }
        }
    }
    None
}

/// The field a header's text points at, ignoring who already claimed it.
pub fn expected_field(header: &str, catalog: &FieldCatalog) -> Option<String> {
    let norm = normalize_header(header);
    if norm.is_empty() {
        return None;
    }
    compound_field(&norm)
        .map(str::to_string)
        .or_else(|| exact_alias(&norm, catalog))
        .or_else(|| contained_alias(&norm).map(str::to_string))
}

fn all_match(sample: &[&CellValue], pred: impl Fn(&CellValue) -> bool) -> bool {
    !sample.is_empty() && sample.iter().all(|c| pred(c))
}

fn is_id_shaped(c: &CellValue) -> bool {
    let t = c.as_text();
    ID_RE.is_match(&t) || ID_PREFIX_RE.is_match(&t)
}

fn is_score_shaped(c: &CellValue) -> bool {
    matches!(c, CellValue::Number(n) if (0.0..=100.0).contains(n))
}

fn is_date_shaped(c: &CellValue) -> bool {
    DATE_RE.is_match(&c.as_text())
}

fn is_name_shaped(c: &CellValue) -> bool {
    let t = c.as_text();
    NAME_RE.is_match(&t) && !t.contains('班')
}

fn is_class_label(c: &CellValue) -> bool {
    let t = c.as_text();
    t.contains('班') || CLASS_NUMERAL_RE.is_match(&t) || CLASS_PAREN_RE.is_match(&t)
}

const MAX_CLASS_NUMBER: u32 = 50;

/// Bare class numbers are small and repeat down the column. A column of
/// distinct or large numbers is left for the numeric score fallback.
fn is_class_number_column(sample: &[&CellValue]) -> bool {
    let small = all_match(sample, |c| {
        let t = c.as_text();
        CLASS_DIGITS_RE.is_match(&t)
            && matches!(t.parse::<u32>(), Ok(n) if (1..=MAX_CLASS_NUMBER).contains(&n))
    });
    if !small {
        return false;
    }
    let distinct = sample
        .iter()
        .map(|c| c.as_text().into_owned())
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    distinct * 2 <= sample.len()
}

fn id_column(sample: &[&CellValue]) -> bool {
    all_match(sample, is_id_shaped)
}

fn score_column(sample: &[&CellValue]) -> bool {
    all_match(sample, is_score_shaped)
}

fn date_column(sample: &[&CellValue]) -> bool {
    all_match(sample, is_date_shaped)
}

fn name_column(sample: &[&CellValue]) -> bool {
    all_match(sample, is_name_shaped)
}

fn class_column(sample: &[&CellValue]) -> bool {
    all_match(sample, is_class_label) || is_class_number_column(sample)
}

const CONTENT_RULES: &[(&str, fn(&[&CellValue]) -> bool)] = &[
    (catalog::STUDENT_ID, id_column),
    (catalog::SCORE, score_column),
    (catalog::EXAM_DATE, date_column),
    (catalog::NAME, name_column),
    (catalog::CLASS_NAME, class_column),
];

fn column_sample<'a>(rows: &'a [Vec<CellValue>], col: usize, limit: usize) -> Vec<&'a CellValue> {
    rows.iter()
        .filter_map(|r| r.get(col))
        .filter(|c| !c.is_empty())
        .take(limit)
        .collect()
}

fn numeric_ratio(rows: &[Vec<CellValue>], col: usize, limit: usize) -> f64 {
    let sample = rows.iter().take(limit).collect::<Vec<_>>();
    if sample.is_empty() {
        return 0.0;
    }
    let numeric = sample
        .iter()
        .filter(|r| r.get(col).and_then(|c| c.as_number()).is_some())
        .count();
    numeric as f64 / sample.len() as f64
}

pub fn confidence_tier(mapping: &HeaderMapping, catalog: &FieldCatalog) -> ConfidenceTier {
    let essentials = ESSENTIAL_FIELDS
        .iter()
        .filter(|f| mapping.is_claimed(f))
        .count();
    let expected_ignored = mapping.entries().iter().any(|e| {
        e.target == MappingTarget::Ignored && expected_field(&e.header, catalog).is_some()
    });
    if essentials == ESSENTIAL_FIELDS.len() && !expected_ignored {
        return ConfidenceTier::High;
    }

    let id_or_name = mapping.is_claimed(catalog::STUDENT_ID) || mapping.is_claimed(catalog::NAME);
    let score = mapping.is_claimed(catalog::SCORE);
    let total = mapping.entries().len().max(1) as f64;
    let essential_ratio = essentials as f64 / ESSENTIAL_FIELDS.len() as f64;
    let header_ratio = mapping.mapped_count() as f64 / total;
    if (id_or_name && score) || (essential_ratio >= 0.75 && header_ratio >= 0.6) {
        ConfidenceTier::Medium
    } else {
        ConfidenceTier::Low
    }
}

fn cached_mapping_usable(cached: &HeaderMapping, headers: &[String], catalog: &FieldCatalog) -> bool {
    cached.covers(headers)
        && cached
            .entries()
            .iter()
            .filter_map(|e| e.target.field_key())
            .all(|k| catalog.contains(k))
}

/// Runs the resolution rules in priority order: cache, compound tokens and
/// aliases, content shapes, then the single numeric column fallback.
pub fn resolve_headers(
    headers: &[String],
    rows: &[Vec<CellValue>],
    catalog: &FieldCatalog,
    cache: &dyn MappingCache,
    config: &ImportConfig,
) -> Resolution {
    let signature = header_signature(headers);

    if let Some(cached) = cache.get(&signature) {
        if cached_mapping_usable(&cached, headers, catalog) {
            log::debug!("mapping cache hit for {}", signature);
            let mapping = cached.with_source(MappingSource::Cache);
            let confidence = confidence_tier(&mapping, catalog);
            return Resolution {
                signature,
                mapping,
                confidence,
                from_cache: true,
            };
        }
        log::warn!("discarding stale cached mapping for {}", signature);
    }

    let mut mapping = HeaderMapping::all_ignored(headers);
    let normalized = headers.iter().map(|h| normalize_header(h)).collect::<Vec<_>>();

    for (idx, norm) in normalized.iter().enumerate() {
        if norm.is_empty() {
            continue;
        }
        if let Some(field) = compound_field(norm) {
            if mapping.claim(idx, field, MappingSource::Compound) {
                continue;
            }
        }
        if let Some(field) = exact_alias(norm, catalog) {
            mapping.claim(idx, &field, MappingSource::Alias);
        }
    }
    for (idx, norm) in normalized.iter().enumerate() {
        if mapping.entries[idx].target != MappingTarget::Ignored {
            continue;
        }
        if let Some(field) = contained_alias(norm) {
            mapping.claim(idx, field, MappingSource::Alias);
        }
    }

    for idx in 0..headers.len() {
        if mapping.entries[idx].target != MappingTarget::Ignored {
            continue;
        }
        let sample = column_sample(rows, idx, config.sample_size);
        for (field, shaped) in CONTENT_RULES {
            if mapping.is_claimed(field) || !shaped(&sample) {
                continue;
            }
            if mapping.claim(idx, field, MappingSource::Content) {
                log::debug!("header {:?} inferred as {} from content", headers[idx], field);
                break;
            }
        }
    }

    if !mapping.is_claimed(catalog::SCORE) {
        let numeric = (0..headers.len())
            .filter(|&idx| mapping.entries[idx].target == MappingTarget::Ignored)
            .filter(|&idx| numeric_ratio(rows, idx, config.sample_size) >= config.numeric_fallback_ratio)
            .collect::<Vec<_>>();
        if let [only] = numeric.as_slice() {
            mapping.claim(*only, catalog::SCORE, MappingSource::NumericFallback);
        }
    }

    let confidence = confidence_tier(&mapping, catalog);
    log::debug!(
        "resolved {} headers, {} mapped, confidence {:?}",
        headers.len(),
        mapping.mapped_count(),
        confidence
    );
    Resolution {
        signature,
        mapping,
        confidence,
        from_cache: false,
    }
}
