use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;

use crate::error::ImportError;

/// One spreadsheet cell as handed over by the file parser.
///
/// `Number` is reserved for cells the spreadsheet itself typed as numeric.
/// CSV and pasted text always arrive as `Text`, even when the text is digits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellValue {
    Number(f64),
    Text(String),
    Empty,
}

impl CellValue {
    pub fn from_json(v: &serde_json::Value) -> CellValue {
        match v {
            serde_json::Value::Null => CellValue::Empty,
            serde_json::Value::Number(n) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Empty),
            serde_json::Value::String(s) => CellValue::Text(s.clone()),
            serde_json::Value::Bool(b) => CellValue::Text(b.to_string()),
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(s) => s.trim().is_empty(),
            CellValue::Number(n) => n.is_nan(),
        }
    }

    pub fn is_number(&self) -> bool {
        matches!(self, CellValue::Number(n) if n.is_finite())
    }

    /// Display text of the cell. Integral numbers print without a fraction so
    /// that numeric ID columns read the same as their text form.
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            CellValue::Empty => Cow::Borrowed(""),
            CellValue::Text(s) => Cow::Borrowed(s.trim()),
            CellValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    Cow::Owned(format!("{}", *n as i64))
                } else {
                    Cow::Owned(n.to_string())
                }
            }
        }
    }

    /// Lenient numeric reading: typed numbers, or text that parses as a float.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            CellValue::Empty => None,
            CellValue::Number(n) if n.is_finite() => Some(*n),
            CellValue::Number(_) => None,
            CellValue::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }

    pub fn non_empty_text(&self) -> Option<String> {
        if self.is_empty() {
            None
        } else {
            Some(self.as_text().into_owned())
        }
    }
}

/// A parsed upload: headers plus rows whose cells align with the headers by index.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedFile {
    pub file_name: String,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<CellValue>>,
}

impl ParsedFile {
    /// Builds a file and rejects the inputs the parser contract rules out:
    /// no headers, blank or duplicate headers, no data rows.
    pub fn new(
        file_name: impl Into<String>,
        headers: Vec<String>,
        rows: Vec<Vec<CellValue>>,
    ) -> Result<ParsedFile, ImportError> {
        if headers.is_empty() {
            return Err(ImportError::Input("file has no header row".into()));
        }
        let mut seen = HashSet::new();
        for (i, h) in headers.iter().enumerate() {
            if h.trim().is_empty() {
                return Err(ImportError::Input(format!("header {} is blank", i + 1)));
            }
            if !seen.insert(h.as_str()) {
                return Err(ImportError::Input(format!("duplicate header: {}", h)));
            }
        }
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut r| {
                r.resize(width, CellValue::Empty);
                r
            })
            .filter(|r| r.iter().any(|c| !c.is_empty()))
            .collect::<Vec<_>>();
        if rows.is_empty() {
            return Err(ImportError::Input("file has no data rows".into()));
        }
        Ok(ParsedFile {
            file_name: file_name.into(),
            headers,
            rows,
        })
    }

    pub fn header_index(&self, header: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == header)
    }

    pub fn cell(&self, row: usize, header: &str) -> Option<&CellValue> {
        let idx = self.header_index(header)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// First `limit` non-empty cells of a column, in row order.
    pub fn column_sample(&self, col: usize, limit: usize) -> Vec<&CellValue> {
        self.rows
            .iter()
            .filter_map(|r| r.get(col))
            .filter(|c| !c.is_empty())
            .take(limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> CellValue {
        CellValue::Text(s.to_string())
    }

    #[test]
    fn rejects_duplicate_and_blank_headers() {
        let dup = ParsedFile::new("a.csv", vec!["姓名".into(), "姓名".into()], vec![vec![text("x")]]);
        assert!(matches!(dup, Err(ImportError::Input(_))));
        let blank = ParsedFile::new("a.csv", vec!["姓名".into(), " ".into()], vec![vec![text("x")]]);
        assert!(matches!(blank, Err(ImportError::Input(_))));
    }

    #[test]
    fn drops_blank_rows_and_pads_short_rows() {
        let f = ParsedFile::new(
            "a.csv",
            vec!["姓名".into(), "分数".into()],
            vec![vec![text("张三")], vec![text(" "), CellValue::Empty]],
        )
        .expect("file");
        assert_eq!(f.rows.len(), 1);
        assert_eq!(f.rows[0].len(), 2);
        assert_eq!(f.cell(0, "分数"), Some(&CellValue::Empty));
    }

    #[test]
    fn rows_of_only_blanks_are_an_input_error() {
        let f = ParsedFile::new("a.csv", vec!["姓名".into()], vec![vec![CellValue::Empty]]);
        assert!(matches!(f, Err(ImportError::Input(_))));
    }

    #[test]
    fn integral_numbers_read_as_plain_digits() {
        assert_eq!(CellValue::Number(20230001.0).as_text(), "20230001");
        assert_eq!(CellValue::Number(88.5).as_text(), "88.5");
        assert_eq!(text(" 92 ").as_number(), Some(92.0));
        assert!(!text("92").is_number());
    }
}
