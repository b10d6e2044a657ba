// 🏗️ Parsing collaborator
// Turns raw upload bytes into headers + row records. The engine itself never
// touches bytes; it only consumes `ParsedFile`.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::Path;

/// One source row keyed by source header
pub type Record = Map<String, Value>;

// ============================================================================
// FILE TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Csv,
    Json,
    Spreadsheet,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Csv => "csv",
            FileType::Json => "json",
            FileType::Spreadsheet => "spreadsheet",
        }
    }

    /// Detect from a file name's extension
    pub fn from_file_name(name: &str) -> Option<FileType> {
        let ext = Path::new(name).extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "csv" => Some(FileType::Csv),
            "json" => Some(FileType::Json),
            "xlsx" | "xls" | "ods" => Some(FileType::Spreadsheet),
            _ => None,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PARSED FILE
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedFile {
    /// Headers in source order (duplicates preserved)
    pub headers: Vec<String>,
    pub rows: Vec<Record>,
}

impl ParsedFile {
    pub fn new(headers: Vec<String>, rows: Vec<Record>) -> Self {
        ParsedFile { headers, rows }
    }
}

/// The boundary the engine consumes
pub trait FileParser: Send + Sync {
    fn parse(&self, bytes: &[u8], file_type: FileType) -> Result<ParsedFile>;
}

// ============================================================================
// DEFAULT PARSER (CSV + JSON)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DefaultParser;

impl DefaultParser {
    pub fn new() -> Self {
        DefaultParser
    }

    fn parse_csv(&self, bytes: &[u8]) -> Result<ParsedFile> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(bytes);

        let headers: Vec<String> = rdr
            .headers()
            .context("Failed to read CSV header row")?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut rows = Vec::new();
        for (idx, result) in rdr.records().enumerate() {
            let record = result.with_context(|| format!("Failed to read CSV row {}", idx + 1))?;

            // Blank lines come through as a single empty field
            if record.iter().all(|f| f.trim().is_empty()) {
                continue;
            }

            let mut row = Record::new();
            for (i, header) in headers.iter().enumerate() {
                // First occurrence of a duplicated header keeps its value
                if row.contains_key(header) {
                    continue;
                }
                let value = record.get(i).unwrap_or("");
                row.insert(header.clone(), Value::String(value.to_string()));
            }
            rows.push(row);
        }

        Ok(ParsedFile { headers, rows })
    }

    fn parse_json(&self, bytes: &[u8]) -> Result<ParsedFile> {
        let value: Value = serde_json::from_slice(bytes).context("Failed to parse JSON upload")?;

        let items = match value {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("data").or_else(|| obj.remove("rows")) {
                Some(Value::Array(items)) => items,
                _ => bail!("JSON upload must be an array of objects or {{\"data\": [...]}}"),
            },
            _ => bail!("JSON upload must be an array of objects"),
        };

        let mut headers: Vec<String> = Vec::new();
        let mut rows = Vec::with_capacity(items.len());

        for (idx, item) in items.into_iter().enumerate() {
            let obj = match item {
                Value::Object(obj) => obj,
                other => return Err(anyhow!("JSON row {} is not an object: {}", idx + 1, other)),
            };

            // Header order = first-seen key order across rows
            for key in obj.keys() {
                if !headers.contains(key) {
                    headers.push(key.clone());
                }
            }
            rows.push(obj);
        }

        Ok(ParsedFile { headers, rows })
    }
}

impl FileParser for DefaultParser {
    fn parse(&self, bytes: &[u8], file_type: FileType) -> Result<ParsedFile> {
        match file_type {
            FileType::Csv => self.parse_csv(bytes),
            FileType::Json => self.parse_json(bytes),
            FileType::Spreadsheet => bail!("spreadsheet uploads need a spreadsheet-capable parser"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_type_detection() {
        assert_eq!(FileType::from_file_name("items.CSV"), Some(FileType::Csv));
        assert_eq!(FileType::from_file_name("items.json"), Some(FileType::Json));
        assert_eq!(FileType::from_file_name("items.xlsx"), Some(FileType::Spreadsheet));
        assert_eq!(FileType::from_file_name("items"), None);

        // Only comma-separated text is parsed as CSV
        assert_eq!(FileType::from_file_name("items.tsv"), None);
        assert_eq!(FileType::from_file_name("items.txt"), None);
    }

    #[test]
    fn test_parse_csv() {
        let data = b"Product Name,price,SKU\nWidget,9.99,W-1\n\nGadget,19.50,G-2\n";
        let parsed = DefaultParser::new().parse(data, FileType::Csv).unwrap();

        assert_eq!(parsed.headers, vec!["Product Name", "price", "SKU"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[1]["price"], Value::String("19.50".to_string()));
    }

    #[test]
    fn test_parse_csv_duplicate_headers_keep_first() {
        let data = b"Product Name,price,Product Name\nWidget,1,Other\n";
        let parsed = DefaultParser::new().parse(data, FileType::Csv).unwrap();

        assert_eq!(parsed.headers.len(), 3);
        assert_eq!(parsed.rows[0]["Product Name"], Value::String("Widget".to_string()));
    }

    #[test]
    fn test_parse_json_array_and_envelope() {
        let parser = DefaultParser::new();

        let parsed = parser
            .parse(br#"[{"name": "A", "price": 1}, {"name": "B", "sku": "x"}]"#, FileType::Json)
            .unwrap();
        assert_eq!(parsed.headers, vec!["name", "price", "sku"]);
        assert_eq!(parsed.rows.len(), 2);

        let parsed = parser.parse(br#"{"data": [{"name": "A"}]}"#, FileType::Json).unwrap();
        assert_eq!(parsed.rows.len(), 1);

        assert!(parser.parse(br#"{"name": "A"}"#, FileType::Json).is_err());
        assert!(parser.parse(br#"[1, 2]"#, FileType::Json).is_err());
    }

    #[test]
    fn test_spreadsheet_unsupported() {
        assert!(DefaultParser::new().parse(b"", FileType::Spreadsheet).is_err());
    }
}
