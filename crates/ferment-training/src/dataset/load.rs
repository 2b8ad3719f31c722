use super::DatasetRecord;
use crate::config::DatasetFormat;
use crate::error::{DatasetError, DatasetResult};
use serde_json::{Map, Value};
use std::ops::Range;
use std::path::Path;

/// Split expression: `train`, `train[a:b]`, `train[:n]`, `train[n:]`, `train[:10%]`.
///
/// Local files only carry a `train` split, matching how single-file datasets are
/// exposed by the usual dataset loaders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub name: String,
    pub start: Option<Bound>,
    pub end: Option<Bound>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Index(usize),
    Percent(u8),
}

impl Bound {
    fn parse(raw: &str) -> Result<Option<Self>, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(None);
        }
        if let Some(pct) = raw.strip_suffix('%') {
            let value: u8 = pct.trim().parse().map_err(|_| format!("invalid percentage `{raw}`"))?;
            if value > 100 {
                return Err(format!("percentage `{raw}` is above 100"));
            }
            return Ok(Some(Self::Percent(value)));
        }
        raw.parse().map(|n| Some(Self::Index(n))).map_err(|_| format!("invalid index `{raw}`"))
    }

    fn resolve(self, len: usize) -> usize {
        match self {
            Self::Index(n) => n.min(len),
            Self::Percent(p) => len * usize::from(p) / 100,
        }
    }
}

impl Split {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        let Some(open) = raw.find('[') else {
            if raw.is_empty() {
                return Err("split name is empty".to_string());
            }
            return Ok(Self { name: raw.to_string(), start: None, end: None });
        };

        let name = raw[..open].trim();
        let body = raw[open + 1..].strip_suffix(']').ok_or_else(|| format!("unterminated slice in `{raw}`"))?;
        let (start, end) = body.split_once(':').ok_or_else(|| format!("slice in `{raw}` needs `start:end`"))?;
        if name.is_empty() {
            return Err("split name is empty".to_string());
        }

        Ok(Self { name: name.to_string(), start: Bound::parse(start)?, end: Bound::parse(end)? })
    }

    /// Row range selected out of `len` rows.
    pub fn range(&self, len: usize) -> Range<usize> {
        let start = self.start.map_or(0, |b| b.resolve(len));
        let end = self.end.map_or(len, |b| b.resolve(len));
        start..end.max(start)
    }
}

/// Load the raw records of a dataset file, restricted to `split`.
pub fn load_records(path: &Path, format: DatasetFormat, split: &str) -> DatasetResult<Vec<DatasetRecord>> {
    let load_error = |message: String| DatasetError::Load { path: path.display().to_string(), message };

    let split = Split::parse(split).map_err(load_error)?;
    if split.name != "train" {
        return Err(load_error(format!("split `{}` not found (local files only provide `train`)", split.name)));
    }

    if !path.is_file() {
        return Err(load_error("file does not exist or is not a regular file".to_string()));
    }
    let contents = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;

    let values = match format {
        DatasetFormat::Json => parse_json(&contents).map_err(load_error)?,
        DatasetFormat::Jsonl => parse_jsonl(&contents).map_err(load_error)?,
        DatasetFormat::Csv => parse_csv(&contents).map_err(load_error)?,
    };

    let range = split.range(values.len());
    let records: Vec<DatasetRecord> = values
        .into_iter()
        .enumerate()
        .skip(range.start)
        .take(range.len())
        .map(|(index, value)| DatasetRecord { index, value })
        .collect();

    tracing::info!(path = %path.display(), records = records.len(), "dataset loaded");
    Ok(records)
}

/// A JSON array of records, or JSON Lines when the document is not an array.
fn parse_json(contents: &str) -> Result<Vec<Value>, String> {
    if contents.trim_start().starts_with('[') {
        return serde_json::from_str::<Vec<Value>>(contents).map_err(|e| format!("invalid JSON array: {e}"));
    }
    parse_jsonl(contents)
}

fn parse_jsonl(contents: &str) -> Result<Vec<Value>, String> {
    let mut values = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(line).map_err(|e| format!("failed to parse jsonl line {}: {}", idx + 1, e))?;
        values.push(value);
    }
    if values.is_empty() && !contents.trim().is_empty() {
        return Err("no records found".to_string());
    }
    Ok(values)
}

fn parse_csv(contents: &str) -> Result<Vec<Value>, String> {
    let mut reader = csv::Reader::from_reader(contents.as_bytes());
    let headers = reader.headers().map_err(|e| format!("invalid CSV header: {e}"))?.clone();

    let mut values = Vec::new();
    for (idx, row) in reader.records().enumerate() {
        let row = row.map_err(|e| format!("invalid CSV row {}: {}", idx + 1, e))?;
        let object: Map<String, Value> = headers
            .iter()
            .zip(row.iter())
            .map(|(key, value)| (key.to_string(), Value::String(value.to_string())))
            .collect();
        values.push(Value::Object(object));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(temp: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = temp.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_missing_file_is_load_error_with_path() {
        let err = load_records(Path::new("/nowhere/missing.json"), DatasetFormat::Json, "train").unwrap_err();
        match err {
            DatasetError::Load { path, .. } => assert!(path.ends_with("missing.json")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_json_detects_array_and_lines() {
        let temp = TempDir::new().unwrap();
        let array = write(&temp, "a.json", r#"[{"a": 1}, {"a": 2}]"#);
        let lines = write(&temp, "b.json", "{\"a\": 1}\n\n{\"a\": 2}\n{\"a\": 3}\n");

        assert_eq!(load_records(&array, DatasetFormat::Json, "train").unwrap().len(), 2);
        assert_eq!(load_records(&lines, DatasetFormat::Json, "train").unwrap().len(), 3);
    }

    #[test]
    fn test_jsonl_reports_bad_line() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "bad.jsonl", "{\"a\": 1}\nnot json\n");
        let err = load_records(&path, DatasetFormat::Jsonl, "train").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_csv_rows_become_objects() {
        let temp = TempDir::new().unwrap();
        let path = write(&temp, "d.csv", "instruction,response\nhi,hello\nbye,see you\n");
        let records = load_records(&path, DatasetFormat::Csv, "train").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].value["response"], "see you");
    }

    #[test]
    fn test_split_slices_keep_source_indices() {
        let temp = TempDir::new().unwrap();
        let body: String = (0..10).map(|i| format!("{{\"i\": {i}}}\n")).collect();
        let path = write(&temp, "d.jsonl", &body);

        let records = load_records(&path, DatasetFormat::Jsonl, "train[2:5]").unwrap();
        assert_eq!(records.iter().map(|r| r.index).collect::<Vec<_>>(), vec![2, 3, 4]);

        let records = load_records(&path, DatasetFormat::Jsonl, "train[:50%]").unwrap();
        assert_eq!(records.len(), 5);

        assert!(load_records(&path, DatasetFormat::Jsonl, "validation").is_err());
    }

    #[test]
    fn test_split_parse_errors() {
        assert!(Split::parse("train[1").is_err());
        assert!(Split::parse("train[x:]").is_err());
        assert!(Split::parse("train[:120%]").is_err());
        assert!(Split::parse("").is_err());
        assert_eq!(Split::parse("train[3:]").unwrap().range(10), 3..10);
    }
}
