use crate::catalog::FieldCatalog;
use crate::config::ImportConfig;
use crate::error::ImportError;
use crate::mapping::MappingTarget;
use crate::matching::SystemStudent;
use crate::session::Notice;
use crate::store::{self, StudentDirectory};
use crate::table::{CellValue, ParsedFile};
use rusqlite::Connection;
use serde_json::Value;

pub fn get_required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing params.{}", key))
}

pub fn get_optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub fn parse_string_list(v: &Value, key: &str) -> Result<Vec<String>, String> {
    let arr = v.as_array().ok_or_else(|| format!("{} must be an array", key))?;
    arr.iter()
        .map(|x| {
            x.as_str()
                .map(str::to_string)
                .ok_or_else(|| format!("{} must contain strings", key))
        })
        .collect()
}

/// Rows may be arrays of cells in header order or objects keyed by header.
pub fn parse_rows(v: &Value, headers: &[String]) -> Result<Vec<Vec<CellValue>>, ImportError> {
    let Some(arr) = v.as_array() else {
        return Err(ImportError::Input("rows must be an array".into()));
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, row) in arr.iter().enumerate() {
        match row {
            Value::Array(cells) => out.push(cells.iter().map(CellValue::from_json).collect()),
            Value::Object(obj) => out.push(
                headers
                    .iter()
                    .map(|h| obj.get(h).map(CellValue::from_json).unwrap_or(CellValue::Empty))
                    .collect(),
            ),
            _ => {
                return Err(ImportError::Input(format!(
                    "row {} must be an array or an object",
                    i + 1
                )))
            }
        }
    }
    Ok(out)
}

/// Reads `fileName`, `headers` and `rows` into a validated file.
pub fn parse_file(params: &Value) -> Result<ParsedFile, ImportError> {
    let file_name = get_optional_str(params, "fileName").unwrap_or("import");
    let headers = params
        .get("headers")
        .ok_or_else(|| ImportError::Input("missing headers".into()))
        .and_then(|v| parse_string_list(v, "headers").map_err(ImportError::Input))?;
    let rows = match params.get("rows") {
        Some(v) => parse_rows(v, &headers)?,
        None => Vec::new(),
    };
    ParsedFile::new(file_name, headers, rows)
}

/// `null` or `"ignored"` ignores the column, any other string names a field,
/// and objects use the tagged form.
pub fn parse_target(v: &Value) -> Result<MappingTarget, String> {
    match v {
        Value::Null => Ok(MappingTarget::Ignored),
        Value::String(s) if s.trim() == "ignored" => Ok(MappingTarget::Ignored),
        Value::String(s) if s.trim().is_empty() => Err("target must not be empty".into()),
        Value::String(s) => Ok(MappingTarget::field(s.trim())),
        Value::Object(_) => {
            serde_json::from_value(v.clone()).map_err(|e| format!("invalid target: {}", e))
        }
        _ => Err("target must be a string, an object or null".into()),
    }
}

pub fn load_catalog(conn: &Connection) -> anyhow::Result<FieldCatalog> {
    let ws = store::SqliteWorkspace::new(conn);
    Ok(FieldCatalog::with_custom(store::CustomFieldRegistry::list_fields(&ws)?))
}

pub fn load_context(conn: &Connection) -> anyhow::Result<(FieldCatalog, ImportConfig)> {
    Ok((load_catalog(conn)?, ImportConfig::load(conn)?))
}

/// A directory read failure leaves matching with an empty directory and a
/// notice for the caller.
pub fn load_directory(conn: &Connection) -> (Vec<SystemStudent>, Option<Notice>) {
    match store::SqliteWorkspace::new(conn).list_students(None) {
        Ok(v) => (v, None),
        Err(e) => {
            let unavailable = ImportError::ExternalService(format!("student directory: {:#}", e));
            log::warn!("{}", unavailable);
            (
                Vec::new(),
                Some(Notice {
                    code: "directory_unavailable",
                    message: unavailable.to_string(),
                }),
            )
        }
    }
}
