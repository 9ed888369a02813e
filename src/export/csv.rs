// CSV Export Engine
// Delimited text encoding of result pages

use super::{ExportError, ExportOptions, PageFormatter};
use crate::db::{CellValue, Row};
use std::io::Write;

/// Field separator and quote character resolved from [`ExportOptions`]
#[derive(Debug, Clone, Copy)]
struct Dialect {
    delimiter: char,
    quote: char,
}

impl Dialect {
    fn from_options(options: &ExportOptions) -> Self {
        let first = |value: &Option<String>, fallback| {
            value.as_deref().and_then(|s| s.chars().next()).unwrap_or(fallback)
        };
        Self {
            delimiter: first(&options.delimiter, ','),
            quote: first(&options.quote_char, '"'),
        }
    }

    /// Quote `value` when it holds the delimiter, the quote or a line break
    fn escape(&self, value: &str) -> String {
        let special = |c: char| c == self.delimiter || c == self.quote || c == '\n' || c == '\r';
        if !value.contains(special) {
            return value.to_string();
        }
        let doubled: String = [self.quote, self.quote].iter().collect();
        format!("{q}{}{q}", value.replace(self.quote, &doubled), q = self.quote)
    }

    fn write_record<I>(&self, out: &mut dyn Write, fields: I) -> Result<(), ExportError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut separator = None;
        for field in fields {
            if let Some(delimiter) = separator {
                write!(out, "{}", delimiter)?;
            }
            out.write_all(field.as_bytes())?;
            separator = Some(self.delimiter);
        }
        out.write_all(b"\n")?;
        Ok(())
    }
}

/// CSV encoder for result pages
pub struct CsvExporter {
    options: ExportOptions,
    dialect: Dialect,
}

impl CsvExporter {
    pub fn new(options: ExportOptions) -> Self {
        let dialect = Dialect::from_options(&options);
        Self { options, dialect }
    }

    pub fn with_default_options() -> Self {
        Self::new(ExportOptions::default())
    }

    fn render(&self, value: &CellValue) -> String {
        match value {
            CellValue::Null if self.options.null_as_string => "NULL".to_string(),
            CellValue::Null => String::new(),
            // Whole floats keep a decimal so they don't read back as integers
            CellValue::Float(f) if f.is_finite() && f.fract() == 0.0 => format!("{:.1}", f),
            CellValue::Binary(bytes) => {
                let shown = &bytes[..bytes.len().min(MAX_BINARY_BYTES)];
                let mut hex = shown.iter().fold(String::from("0x"), |mut acc, b| {
                    acc.push_str(&format!("{:02X}", b));
                    acc
                });
                if bytes.len() > MAX_BINARY_BYTES {
                    hex.push_str("...");
                }
                hex
            }
            other => self.dialect.escape(&other.as_text().unwrap_or_default()),
        }
    }
}

/// Blobs longer than this are truncated in CSV output
const MAX_BINARY_BYTES: usize = 100;

impl PageFormatter for CsvExporter {
    fn format(&self, header: &[String], rows: &[Row], out: &mut dyn Write) -> Result<(), ExportError> {
        if self.options.include_headers {
            self.dialect
                .write_record(out, header.iter().map(|name| self.dialect.escape(name)))?;
        }
        for row in rows {
            self.dialect.write_record(out, row.iter().map(|cell| self.render(cell)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<String> {
        vec!["id".to_string(), "name".to_string(), "value".to_string()]
    }

    fn sample_rows() -> Vec<Row> {
        vec![
            vec![
                CellValue::Int(1),
                CellValue::String("Alice".to_string()),
                CellValue::Float(100.5),
            ],
            vec![
                CellValue::Int(2),
                CellValue::String("Bob, Jr.".to_string()), // Contains comma
                CellValue::Null,
            ],
            vec![
                CellValue::Int(3),
                CellValue::String("Charlie \"The Great\"".to_string()),
                CellValue::Float(200.0),
            ],
        ]
    }

    #[test]
    fn test_csv_page_basic() {
        let exporter = CsvExporter::with_default_options();
        let csv = exporter.format_to_string(&sample_header(), &sample_rows()).unwrap();

        assert!(csv.starts_with("id,name,value\n"));
        assert!(csv.contains("1,Alice,100.5"));
        assert!(csv.contains("\"Bob, Jr.\""));
        assert!(csv.contains("\"Charlie \"\"The Great\"\"\""));
        assert!(csv.contains("2,\"Bob, Jr.\",NULL"));
        assert!(csv.contains("3,\"Charlie \"\"The Great\"\"\",200.0"));
    }

    #[test]
    fn test_csv_page_without_headers_and_empty_nulls() {
        let exporter = CsvExporter::new(ExportOptions {
            include_headers: false,
            null_as_string: false,
            ..Default::default()
        });
        let csv = exporter.format_to_string(&sample_header(), &sample_rows()).unwrap();

        assert!(csv.starts_with("1,Alice,100.5"));
        assert!(csv.contains("2,\"Bob, Jr.\",\n"));
    }

    #[test]
    fn test_csv_custom_delimiter() {
        let exporter = CsvExporter::new(ExportOptions {
            delimiter: Some(";".to_string()),
            ..Default::default()
        });
        let csv = exporter.format_to_string(&sample_header(), &sample_rows()).unwrap();

        assert!(csv.contains("id;name;value"));
        assert!(csv.contains("1;Alice;100.5"));
        // Commas no longer force quoting
        assert!(csv.contains("2;Bob, Jr.;NULL"));
    }

    #[test]
    fn test_csv_binary_as_hex() {
        let exporter = CsvExporter::with_default_options();
        let csv = exporter
            .format_to_string(&["blob".to_string()], &[vec![CellValue::Binary(vec![0xca, 0xfe])]])
            .unwrap();
        assert_eq!(csv, "blob\n0xCAFE\n");

        let long = CellValue::Binary(vec![0xab; MAX_BINARY_BYTES + 1]);
        let csv = CsvExporter::with_default_options()
            .format_to_string(&["blob".to_string()], &[vec![long]])
            .unwrap();
        assert!(csv.trim_end().ends_with("AB..."));
    }

    #[test]
    fn test_csv_custom_quote_and_line_breaks() {
        let exporter = CsvExporter::new(ExportOptions {
            quote_char: Some("'".to_string()),
            include_headers: false,
            ..Default::default()
        });
        let csv = exporter
            .format_to_string(&["note".to_string()], &[vec![CellValue::String("it's\nfine".to_string())]])
            .unwrap();
        assert_eq!(csv, "'it''s\nfine'\n");
    }
}
