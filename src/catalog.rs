use serde::{Deserialize, Serialize};

pub const STUDENT_ID: &str = "student_id";
pub const NAME: &str = "name";
pub const CLASS_NAME: &str = "class_name";
pub const GRADE_LEVEL: &str = "grade_level";
pub const SUBJECT: &str = "subject";
pub const EXAM_TITLE: &str = "exam_title";
pub const EXAM_TYPE: &str = "exam_type";
pub const EXAM_DATE: &str = "exam_date";
pub const EXAM_SCOPE: &str = "exam_scope";
pub const SCORE: &str = "score";
pub const TOTAL_SCORE: &str = "total_score";
pub const SUBJECT_TOTAL_SCORE: &str = "subject_total_score";
pub const ORIGINAL_GRADE: &str = "original_grade";
pub const RANK_IN_CLASS: &str = "rank_in_class";
pub const RANK_IN_GRADE: &str = "rank_in_grade";
pub const PERCENTILE: &str = "percentile";
pub const Z_SCORE: &str = "z_score";

/// Fields the confidence tier is judged on.
pub const ESSENTIAL_FIELDS: [&str; 4] = [STUDENT_ID, NAME, SCORE, CLASS_NAME];

const BUILTIN_FIELDS: &[(&str, &str)] = &[
    (STUDENT_ID, "学号"),
    (NAME, "姓名"),
    (CLASS_NAME, "班级"),
    (GRADE_LEVEL, "年级"),
    (SUBJECT, "科目"),
    (EXAM_TITLE, "考试标题"),
    (EXAM_TYPE, "考试类型"),
    (EXAM_DATE, "考试日期"),
    (EXAM_SCOPE, "考试范围"),
    (SCORE, "分数"),
    (TOTAL_SCORE, "总分"),
    (SUBJECT_TOTAL_SCORE, "科目满分"),
    (ORIGINAL_GRADE, "等级"),
    (RANK_IN_CLASS, "班级排名"),
    (RANK_IN_GRADE, "年级排名"),
    (PERCENTILE, "百分位"),
    (Z_SCORE, "标准分"),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomField {
    pub key: String,
    pub label: String,
    pub origin_header: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub key: String,
    pub label: String,
    pub custom: bool,
}

/// Canonical field key -> display label. Built-ins first, then custom fields
/// in registration order.
#[derive(Debug, Clone, Default)]
pub struct FieldCatalog {
    custom: Vec<CustomField>,
}

impl FieldCatalog {
    #[cfg(test)]
    pub fn builtin() -> Self {
        Self::default()
    }

    pub fn with_custom(custom: Vec<CustomField>) -> Self {
        let mut c = Self::default();
        for f in custom {
            c.extend(f);
        }
        c
    }

    pub fn is_builtin(key: &str) -> bool {
        BUILTIN_FIELDS.iter().any(|(k, _)| *k == key)
    }

    pub fn contains(&self, key: &str) -> bool {
        Self::is_builtin(key) || self.custom.iter().any(|f| f.key == key)
    }

    #[cfg(test)]
    pub fn label(&self, key: &str) -> Option<&str> {
        BUILTIN_FIELDS
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, l)| *l)
            .or_else(|| {
                self.custom
                    .iter()
                    .find(|f| f.key == key)
                    .map(|f| f.label.as_str())
            })
    }

    /// Adds a custom field. Re-registering an existing key replaces its label.
    pub fn extend(&mut self, field: CustomField) {
        if Self::is_builtin(&field.key) {
            return;
        }
        if let Some(existing) = self.custom.iter_mut().find(|f| f.key == field.key) {
            *existing = field;
        } else {
            self.custom.push(field);
        }
    }

    pub fn custom_fields(&self) -> &[CustomField] {
        &self.custom
    }

    pub fn is_custom(&self, key: &str) -> bool {
        self.custom.iter().any(|f| f.key == key)
    }

    pub fn fields(&self) -> Vec<FieldInfo> {
        let mut out = BUILTIN_FIELDS
            .iter()
            .map(|(k, l)| FieldInfo {
                key: k.to_string(),
                label: l.to_string(),
                custom: false,
            })
            .collect::<Vec<_>>();
        out.extend(self.custom.iter().map(|f| FieldInfo {
            key: f.key.clone(),
            label: f.label.clone(),
            custom: true,
        }));
        out
    }
}
