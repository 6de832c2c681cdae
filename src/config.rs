use crate::db;
use crate::matching::ExamScope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const SETTINGS_KEY: &str = "setup.import";

/// Tunables of the import engine, persisted as one JSON object in `settings`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConfig {
    pub similarity_threshold: f64,
    pub candidate_cap: usize,
    pub sample_size: usize,
    pub numeric_fallback_ratio: f64,
    pub suggestion_batch_size: usize,
    pub suggestion_retries: usize,
    pub auto_skip_high_confidence: bool,
    pub default_exam_scope: ExamScope,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            candidate_cap: 3,
            sample_size: 10,
            numeric_fallback_ratio: 0.8,
            suggestion_batch_size: 3,
            suggestion_retries: 2,
            auto_skip_high_confidence: true,
            default_exam_scope: ExamScope::Class,
        }
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool().ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_usize_range(v: &Value, key: &str, min: usize, max: usize) -> Result<usize, String> {
    let n = v
        .as_u64()
        .ok_or_else(|| format!("{} must be a non-negative integer", key))? as usize;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_f64_range(v: &Value, key: &str, min: f64, max: f64) -> Result<f64, String> {
    let n = v.as_f64().ok_or_else(|| format!("{} must be a number", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

impl ImportConfig {
    /// Applies a camelCase patch. Unknown keys and out-of-range values are
    /// rejected and leave `self` untouched.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>) -> Result<(), String> {
        let mut next = self.clone();
        for (k, v) in patch {
            match k.as_str() {
                "similarityThreshold" => next.similarity_threshold = parse_f64_range(v, k, 0.0, 1.0)?,
                "candidateCap" => next.candidate_cap = parse_usize_range(v, k, 1, 10)?,
                "sampleSize" => next.sample_size = parse_usize_range(v, k, 1, 100)?,
                "numericFallbackRatio" => {
                    next.numeric_fallback_ratio = parse_f64_range(v, k, 0.5, 1.0)?
                }
                "suggestionBatchSize" => next.suggestion_batch_size = parse_usize_range(v, k, 1, 10)?,
                "suggestionRetries" => next.suggestion_retries = parse_usize_range(v, k, 0, 5)?,
                "autoSkipHighConfidence" => next.auto_skip_high_confidence = parse_bool(v, k)?,
                "defaultExamScope" => {
                    let s = v
                        .as_str()
                        .ok_or_else(|| format!("{} must be string", k))?
                        .trim()
                        .to_ascii_lowercase();
                    next.default_exam_scope = ExamScope::parse(&s)
                        .ok_or_else(|| "defaultExamScope must be one of: class, grade".to_string())?;
                }
                _ => return Err(format!("unknown import field: {}", k)),
            }
        }
        *self = next;
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Defaults overlaid with the saved object. Saved keys are applied one by
    /// one so a single stale value does not discard the rest.
    pub fn load(conn: &rusqlite::Connection) -> anyhow::Result<ImportConfig> {
        let mut cfg = ImportConfig::default();
        if let Some(saved) = db::settings_get_json(conn, SETTINGS_KEY)? {
            if let Some(obj) = saved.as_object() {
                for (k, v) in obj {
                    let mut one = Map::new();
                    one.insert(k.clone(), v.clone());
                    if let Err(msg) = cfg.apply_patch(&one) {
                        log::warn!("ignoring saved import setting {}: {}", k, msg);
                    }
                }
            }
        }
        Ok(cfg)
    }

    pub fn save(&self, conn: &rusqlite::Connection) -> anyhow::Result<()> {
        db::settings_set_json(conn, SETTINGS_KEY, &self.to_json())
    }
}
