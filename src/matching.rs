use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStudent {
    pub name: String,
    pub student_id: Option<String>,
    pub class_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStudent {
    pub id: String,
    pub name: String,
    pub student_id: String,
    pub class_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExactKind {
    ById,
    ByName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamScope {
    Class,
    Grade,
}

impl ExamScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "class" => Some(Self::Class),
            "grade" => Some(Self::Grade),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Class => "class",
            Self::Grade => "grade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub system_student: SystemStudent,
    pub similarity: f64,
    pub reason: String,
    pub class_agrees: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MatchRecord {
    ExactMatch {
        kind: ExactKind,
        #[serde(rename = "fileIndex")]
        file_index: usize,
        #[serde(rename = "fileStudent")]
        file_student: FileStudent,
        #[serde(rename = "systemStudent")]
        system_student: SystemStudent,
    },
    FuzzyMatch {
        #[serde(rename = "fileIndex")]
        file_index: usize,
        #[serde(rename = "fileStudent")]
        file_student: FileStudent,
        candidates: Vec<Candidate>,
    },
    NewStudent {
        #[serde(rename = "fileIndex")]
        file_index: usize,
        #[serde(rename = "fileStudent")]
        file_student: FileStudent,
    },
    MissingStudent {
        #[serde(rename = "systemStudent")]
        system_student: SystemStudent,
    },
}

impl MatchRecord {
    pub fn file_index(&self) -> Option<usize> {
        match self {
            MatchRecord::ExactMatch { file_index, .. }
            | MatchRecord::FuzzyMatch { file_index, .. }
            | MatchRecord::NewStudent { file_index, .. } => Some(*file_index),
            MatchRecord::MissingStudent { .. } => None,
        }
    }
}

/// A reviewer's decision on one fuzzy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum FuzzyChoice {
    Confirmed {
        #[serde(rename = "systemStudentId")]
        system_student_id: String,
    },
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    pub similarity_threshold: f64,
    pub candidate_cap: usize,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            candidate_cap: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStats {
    pub file_students: usize,
    pub exact: usize,
    pub fuzzy: usize,
    pub new_students: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStatistics {
    pub total_file_students: usize,
    pub total_system_students: usize,
    pub exact_match_count: usize,
    pub exact_by_id_count: usize,
    pub exact_by_name_count: usize,
    pub fuzzy_match_count: usize,
    pub confirmed_fuzzy_count: usize,
    pub rejected_fuzzy_count: usize,
    pub new_student_count: usize,
    pub missing_student_count: usize,
    pub match_rate: f64,
    pub by_class: BTreeMap<String, ClassStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchAdvice {
    pub recommendations: Vec<String>,
    pub warnings: Vec<String>,
    pub actions: Vec<String>,
}

/// `records` holds one entry per file student, in file-student order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReport {
    pub records: Vec<MatchRecord>,
    pub missing_students: Vec<MatchRecord>,
    pub statistics: MatchStatistics,
}

impl MatchReport {
    pub fn record_for(&self, file_index: usize) -> Option<&MatchRecord> {
        self.records.get(file_index)
    }

    #[cfg(test)]
    pub fn exact_matches(&self) -> impl Iterator<Item = &MatchRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r, MatchRecord::ExactMatch { .. }))
    }

    pub fn fuzzy_matches(&self) -> impl Iterator<Item = &MatchRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r, MatchRecord::FuzzyMatch { .. }))
    }

    #[cfg(test)]
    pub fn new_students(&self) -> impl Iterator<Item = &MatchRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r, MatchRecord::NewStudent { .. }))
    }

    pub fn pending_fuzzy(&self, choices: &BTreeMap<usize, FuzzyChoice>) -> usize {
        self.fuzzy_matches()
            .filter_map(|r| r.file_index())
            .filter(|i| !choices.contains_key(i))
            .count()
    }

    pub fn advice(&self, choices: &BTreeMap<usize, FuzzyChoice>) -> MatchAdvice {
        let s = &self.statistics;
        let mut recommendations = Vec::new();
        let mut warnings = Vec::new();
        let mut actions = Vec::new();

        if s.match_rate >= 0.9 {
            recommendations.push("match rate is high; the import can proceed".to_string());
        } else if s.match_rate >= 0.7 {
            recommendations.push("match rate is moderate; review the fuzzy matches".to_string());
        } else {
            warnings.push(format!(
                "match rate is low ({:.0}%); check the student id and name columns",
                s.match_rate * 100.0
            ));
        }

        let pending = self.pending_fuzzy(choices);
        if pending > 0 {
            actions.push(format!("confirm or reject {} fuzzy match(es)", pending));
        }
        if s.total_file_students > 0 {
            let new_ratio = s.new_student_count as f64 / s.total_file_students as f64;
            if new_ratio > 0.2 {
                warnings.push(format!(
                    "{} new student(s) ({:.0}% of the file)",
                    s.new_student_count,
                    new_ratio * 100.0
                ));
                actions.push("decide whether new students should be created".to_string());
            }
        }
        if s.total_system_students > 0 {
            let missing_ratio = s.missing_student_count as f64 / s.total_system_students as f64;
            if missing_ratio > 0.1 {
                warnings.push(format!(
                    "{} directory student(s) have no row in this file",
                    s.missing_student_count
                ));
            }
        }

        MatchAdvice {
            recommendations,
            warnings,
            actions,
        }
    }
}

/// Trimmed, lowercased, inner whitespace removed.
pub fn normalize_name(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn normalize_opt(s: &Option<String>) -> String {
    s.as_deref().map(normalize_name).unwrap_or_default()
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a = a.chars().collect::<Vec<_>>();
    let b = b.chars().collect::<Vec<_>>();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut prev = (0..=b.len()).collect::<Vec<_>>();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            cur[j + 1] = (prev[j + 1] + 1).min(cur[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

/// `1 - distance / max_len` over characters of the normalized names.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_name(a);
    let b = normalize_name(b);
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

fn class_agrees(file: &FileStudent, system: &SystemStudent) -> bool {
    match (&file.class_name, &system.class_name) {
        (Some(f), Some(s)) => {
            let f = normalize_name(f);
            !f.is_empty() && f == normalize_name(s)
        }
        _ => false,
    }
}

fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.system_student.id.cmp(&b.system_student.id))
    });
}

fn candidate(file: &FileStudent, system: &SystemStudent, similarity: f64, reason: &str) -> Candidate {
    let agrees = class_agrees(file, system);
    let reason = if agrees {
        format!("{}, same class", reason)
    } else {
        reason.to_string()
    };
    Candidate {
        system_student: system.clone(),
        similarity,
        reason,
        class_agrees: agrees,
    }
}

/// Deduplicates row projections. Returns the distinct students plus, per input,
/// the index of its distinct student.
pub fn dedupe_file_students(rows: &[FileStudent]) -> (Vec<FileStudent>, Vec<usize>) {
    let mut seen: HashMap<(String, String, String), usize> = HashMap::new();
    let mut out = Vec::new();
    let mut index = Vec::with_capacity(rows.len());
    for r in rows {
        let key = (
            normalize_name(&r.name),
            normalize_opt(&r.student_id),
            normalize_opt(&r.class_name),
        );
        let idx = *seen.entry(key).or_insert_with(|| {
            out.push(r.clone());
            out.len() - 1
        });
        index.push(idx);
    }
    (out, index)
}

/// With class scope the directory is narrowed to the classes named in the
/// file. A file without class values keeps the whole directory.
pub fn scope_directory(
    system: &[SystemStudent],
    file_students: &[FileStudent],
    scope: ExamScope,
) -> Vec<SystemStudent> {
    if scope == ExamScope::Grade {
        return system.to_vec();
    }
    let classes = file_students
        .iter()
        .filter_map(|f| f.class_name.as_deref())
        .map(normalize_name)
        .filter(|c| !c.is_empty())
        .collect::<HashSet<_>>();
    if classes.is_empty() {
        return system.to_vec();
    }
    system
        .iter()
        .filter(|s| {
            s.class_name
                .as_deref()
                .map(|c| classes.contains(&normalize_name(c)))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

fn classify(
    index: usize,
    file: &FileStudent,
    system: &[SystemStudent],
    by_id: &HashMap<String, usize>,
    by_name: &HashMap<String, Vec<usize>>,
    options: &MatchOptions,
) -> MatchRecord {
    if let Some(sid) = file.student_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(&i) = by_id.get(sid) {
            return MatchRecord::ExactMatch {
                kind: ExactKind::ById,
                file_index: index,
                file_student: file.clone(),
                system_student: system[i].clone(),
            };
        }
    }

    let norm = normalize_name(&file.name);
    if let Some(hits) = by_name.get(&norm) {
        if let [only] = hits.as_slice() {
            return MatchRecord::ExactMatch {
                kind: ExactKind::ByName,
                file_index: index,
                file_student: file.clone(),
                system_student: system[*only].clone(),
            };
        }
        let same_class = hits
            .iter()
            .filter(|&&i| class_agrees(file, &system[i]))
            .collect::<Vec<_>>();
        if let [only] = same_class.as_slice() {
            return MatchRecord::ExactMatch {
                kind: ExactKind::ByName,
                file_index: index,
                file_student: file.clone(),
                system_student: system[**only].clone(),
            };
        }
        let mut candidates = hits
            .iter()
            .map(|&i| candidate(file, &system[i], 1.0, "same name"))
            .collect::<Vec<_>>();
        sort_candidates(&mut candidates);
        candidates.truncate(options.candidate_cap);
        return MatchRecord::FuzzyMatch {
            file_index: index,
            file_student: file.clone(),
            candidates,
        };
    }

    let mut candidates = system
        .iter()
        .filter_map(|s| {
            let sim = name_similarity(&file.name, &s.name);
            if sim < options.similarity_threshold {
                return None;
            }
            let reason = format!("name similarity {:.0}%", sim * 100.0);
            Some(candidate(file, s, sim, &reason))
        })
        .collect::<Vec<_>>();
    sort_candidates(&mut candidates);
    candidates.truncate(options.candidate_cap);

    if candidates.is_empty() {
        MatchRecord::NewStudent {
            file_index: index,
            file_student: file.clone(),
        }
    } else {
        MatchRecord::FuzzyMatch {
            file_index: index,
            file_student: file.clone(),
            candidates,
        }
    }
}

/// Classifies every file student against the directory. `confirmed` carries
/// reviewer decisions keyed by file-student index; it only affects the
/// missing list and the statistics, never the classification itself.
pub fn resolve_identities(
    file_students: &[FileStudent],
    system_students: &[SystemStudent],
    confirmed: &BTreeMap<usize, FuzzyChoice>,
    options: &MatchOptions,
) -> MatchReport {
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
    for (i, s) in system_students.iter().enumerate() {
        let sid = s.student_id.trim();
        if !sid.is_empty() {
            by_id.entry(sid.to_string()).or_insert(i);
        }
        let name = normalize_name(&s.name);
        if !name.is_empty() {
            by_name.entry(name).or_default().push(i);
        }
    }

    let records = file_students
        .iter()
        .enumerate()
        .map(|(i, f)| classify(i, f, system_students, &by_id, &by_name, options))
        .collect::<Vec<_>>();

    let mut matched: BTreeSet<&str> = BTreeSet::new();
    let mut stats = MatchStatistics {
        total_file_students: file_students.len(),
        total_system_students: system_students.len(),
        ..Default::default()
    };
    for r in &records {
        let class_key = match r {
            MatchRecord::ExactMatch { file_student, .. }
            | MatchRecord::FuzzyMatch { file_student, .. }
            | MatchRecord::NewStudent { file_student, .. } => file_student
                .class_name
                .clone()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_default(),
            MatchRecord::MissingStudent { .. } => String::new(),
        };
        let class = stats.by_class.entry(class_key).or_default();
        class.file_students += 1;
        match r {
            MatchRecord::ExactMatch {
                kind,
                system_student,
                ..
            } => {
                class.exact += 1;
                stats.exact_match_count += 1;
                match kind {
                    ExactKind::ById => stats.exact_by_id_count += 1,
                    ExactKind::ByName => stats.exact_by_name_count += 1,
                }
                matched.insert(system_student.id.as_str());
            }
            MatchRecord::FuzzyMatch {
                file_index,
                candidates,
                ..
            } => {
                class.fuzzy += 1;
                stats.fuzzy_match_count += 1;
                match confirmed.get(file_index) {
                    Some(FuzzyChoice::Confirmed { system_student_id }) => {
                        if let Some(c) = candidates
                            .iter()
                            .find(|c| &c.system_student.id == system_student_id)
                        {
                            stats.confirmed_fuzzy_count += 1;
                            matched.insert(c.system_student.id.as_str());
                        }
                    }
                    Some(FuzzyChoice::Rejected) => stats.rejected_fuzzy_count += 1,
                    None => {}
                }
            }
            MatchRecord::NewStudent { .. } => {
                class.new_students += 1;
                stats.new_student_count += 1;
            }
            MatchRecord::MissingStudent { .. } => {}
        }
    }

    let missing_students = system_students
        .iter()
        .filter(|s| !matched.contains(s.id.as_str()))
        .map(|s| MatchRecord::MissingStudent {
            system_student: s.clone(),
        })
        .collect::<Vec<_>>();
    stats.missing_student_count = missing_students.len();
    stats.match_rate = if stats.total_file_students == 0 {
        0.0
    } else {
        stats.exact_match_count as f64 / stats.total_file_students as f64
    };

    log::debug!(
        "identity resolution: {} exact, {} fuzzy, {} new, {} missing",
        stats.exact_match_count,
        stats.fuzzy_match_count,
        stats.new_student_count,
        stats.missing_student_count
    );

    MatchReport {
        records,
        missing_students,
        statistics: stats,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs(name: &str, sid: Option<&str>, class: Option<&str>) -> FileStudent {
        FileStudent {
            name: name.into(),
            student_id: sid.map(str::to_string),
            class_name: class.map(str::to_string),
        }
    }

    fn ss(id: &str, name: &str, sid: &str, class: Option<&str>) -> SystemStudent {
        SystemStudent {
            id: id.into(),
            name: name.into(),
            student_id: sid.into(),
            class_name: class.map(str::to_string),
        }
    }

    fn resolve(files: &[FileStudent], system: &[SystemStudent]) -> MatchReport {
        resolve_identities(files, system, &BTreeMap::new(), &MatchOptions::default())
    }

    #[test]
    fn matching_id_is_exact_by_id() {
        let r = resolve(
            &[fs("王伟", Some("20230099"), None)],
            &[ss("s1", "王伟", "20230099", None)],
        );
        assert!(matches!(
            &r.records[0],
            MatchRecord::ExactMatch { kind: ExactKind::ById, system_student, .. } if system_student.id == "s1"
        ));
        assert_eq!(r.statistics.match_rate, 1.0);
        assert!(r.missing_students.is_empty());
    }

    #[test]
    fn half_similar_two_char_names_are_new_students() {
        assert_eq!(name_similarity("王玥", "王月"), 0.5);
        let r = resolve(&[fs("王玥", None, None)], &[ss("s1", "王月", "1", None)]);
        assert!(matches!(r.records[0], MatchRecord::NewStudent { .. }));
        assert_eq!(r.statistics.new_student_count, 1);
        assert_eq!(r.missing_students.len(), 1);
    }

    #[test]
    fn unique_name_matches_when_id_is_absent_or_unknown() {
        let r = resolve(
            &[fs(" 李 四", Some("999"), None)],
            &[ss("s1", "李四", "1001", None)],
        );
        assert!(matches!(
            r.records[0],
            MatchRecord::ExactMatch { kind: ExactKind::ByName, .. }
        ));
    }

    #[test]
    fn duplicate_names_narrow_by_class_or_go_fuzzy() {
        let system = [
            ss("s2", "张伟", "2", Some("2班")),
            ss("s1", "张伟", "1", Some("1班")),
        ];
        let r = resolve(&[fs("张伟", None, Some("1班"))], &system);
        assert!(matches!(
            &r.records[0],
            MatchRecord::ExactMatch { kind: ExactKind::ByName, system_student, .. } if system_student.id == "s1"
        ));

        let r = resolve(&[fs("张伟", None, Some("3班"))], &system);
        match &r.records[0] {
            MatchRecord::FuzzyMatch { candidates, .. } => {
                let ids = candidates.iter().map(|c| c.system_student.id.as_str()).collect::<Vec<_>>();
                assert_eq!(ids, vec!["s1", "s2"]);
                assert!(candidates.iter().all(|c| c.similarity == 1.0));
            }
            other => panic!("expected fuzzy, got {:?}", other),
        }
    }

    #[test]
    fn fuzzy_candidates_are_sorted_capped_and_above_threshold() {
        let system = [
            ss("d", "欧阳明华", "4", None),
            ss("c", "欧阳明", "3", None),
            ss("b", "欧阳明辉", "2", None),
            ss("a", "欧阳明慧", "1", Some("1班")),
            ss("e", "李雷", "5", None),
        ];
        let r = resolve(&[fs("欧阳明晖", None, Some("1班"))], &system);
        let MatchRecord::FuzzyMatch { candidates, .. } = &r.records[0] else {
            panic!("expected fuzzy");
        };
        assert_eq!(candidates.len(), 3);
        let ids = candidates.iter().map(|c| c.system_student.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(candidates.iter().all(|c| (0.6..=1.0).contains(&c.similarity)));
        assert!(candidates[0].class_agrees);
        assert!(candidates[0].reason.contains("same class"));
        assert_eq!(candidates[0].similarity, candidates[1].similarity);
    }

    #[test]
    fn every_file_student_lands_in_one_bucket() {
        let files = [
            fs("王伟", Some("1"), None),
            fs("赵小雨", None, None),
            fs("陌生人", None, None),
        ];
        let system = [ss("s1", "王伟", "1", None), ss("s2", "赵晓雨", "2", None)];
        let r = resolve(&files, &system);
        let total = r.exact_matches().count() + r.fuzzy_matches().count() + r.new_students().count();
        assert_eq!(total, files.len());
        assert_eq!(r.fuzzy_matches().count(), 1);
        assert_eq!(r.new_students().count(), 1);
    }

    #[test]
    fn confirmed_fuzzy_removes_student_from_missing() {
        let files = [fs("赵小雨", None, None)];
        let system = [ss("s2", "赵晓雨", "2", None)];
        let mut choices = BTreeMap::new();
        let opts = MatchOptions::default();
        let before = resolve_identities(&files, &system, &choices, &opts);
        assert_eq!(before.missing_students.len(), 1);

        choices.insert(
            0,
            FuzzyChoice::Confirmed {
                system_student_id: "s2".into(),
            },
        );
        let after = resolve_identities(&files, &system, &choices, &opts);
        assert!(after.missing_students.is_empty());
        assert_eq!(after.statistics.confirmed_fuzzy_count, 1);
        assert_eq!(after.records, before.records);
    }

    #[test]
    fn resolution_is_repeatable() {
        let files = [fs("赵小雨", None, None), fs("王伟", None, None)];
        let system = [ss("s2", "赵晓雨", "2", None), ss("s1", "王伟", "1", None)];
        assert_eq!(resolve(&files, &system), resolve(&files, &system));
    }

    #[test]
    fn empty_file_has_zero_match_rate() {
        let r = resolve(&[], &[ss("s1", "王伟", "1", None)]);
        assert_eq!(r.statistics.match_rate, 0.0);
        assert_eq!(r.missing_students.len(), 1);
    }

    #[test]
    fn similarity_bounds() {
        assert_eq!(name_similarity("张三", "张三"), 1.0);
        assert_eq!(name_similarity("", ""), 1.0);
        assert_eq!(name_similarity("abc", ""), 0.0);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }

    #[test]
    fn dedupe_keeps_row_index() {
        let rows = [
            fs("张三", Some("1"), None),
            fs("李四", None, None),
            fs(" 张三", Some("1 "), None),
        ];
        let (distinct, index) = dedupe_file_students(&rows);
        assert_eq!(distinct.len(), 2);
        assert_eq!(index, vec![0, 1, 0]);
    }

    #[test]
    fn class_scope_narrows_directory() {
        let system = [ss("s1", "a", "1", Some("1班")), ss("s2", "b", "2", Some("2班"))];
        let files = [fs("x", None, Some("1班"))];
        assert_eq!(scope_directory(&system, &files, ExamScope::Class).len(), 1);
        assert_eq!(scope_directory(&system, &files, ExamScope::Grade).len(), 2);
        assert_eq!(scope_directory(&system, &[fs("x", None, None)], ExamScope::Class).len(), 2);
    }

    #[test]
    fn advice_flags_low_match_rate_and_pending_fuzzy() {
        let files = [fs("赵小雨", None, None), fs("陌生人", None, None)];
        let system = [ss("s2", "赵晓雨", "2", None)];
        let r = resolve(&files, &system);
        let advice = r.advice(&BTreeMap::new());
        assert!(!advice.warnings.is_empty());
        assert!(advice.actions.iter().any(|a| a.contains("fuzzy")));
    }
}
