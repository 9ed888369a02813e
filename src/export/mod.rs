// Export Module
// Page formatters: the boundary where cached rows become CSV or JSON text

pub mod csv;
pub mod json;

pub use csv::CsvExporter;
pub use json::JsonExporter;

use crate::db::{Call, CallState, DatabaseError, Row};
use serde::{Deserialize, Serialize};
use std::io::Write;
use thiserror::Error;

/// Export format options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn formatter(self, options: ExportOptions) -> Box<dyn PageFormatter> {
        match self {
            ExportFormat::Csv => Box::new(CsvExporter::new(options)),
            ExportFormat::Json => Box::new(JsonExporter::new(options)),
        }
    }
}

/// Export options for customizing output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Include column headers (CSV) or use them as JSON keys
    pub include_headers: bool,
    /// Pretty print JSON output
    pub pretty_print: bool,
    /// Delimiter for CSV (default: comma)
    pub delimiter: Option<String>,
    /// Quote character for CSV (default: double quote)
    pub quote_char: Option<String>,
    /// Include NULL values as "NULL" string or empty
    pub null_as_string: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_headers: true,
            pretty_print: false,
            delimiter: Some(",".to_string()),
            quote_char: Some("\"".to_string()),
            null_as_string: true,
        }
    }
}

/// Export errors
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Export cancelled")]
    Cancelled,

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Turns a header and a run of rows into an output encoding. The engine
/// never knows which encoding it is feeding.
pub trait PageFormatter: Send + Sync {
    fn format(&self, header: &[String], rows: &[Row], out: &mut dyn Write) -> Result<(), ExportError>;

    fn format_to_string(&self, header: &[String], rows: &[Row]) -> Result<String, ExportError> {
        let mut output = Vec::new();
        self.format(header, rows, &mut output)?;
        String::from_utf8(output).map_err(|e| ExportError::SerializationError(e.to_string()))
    }
}

impl Call {
    /// Fetch page `index` and hand it to `formatter`
    pub async fn format_page(
        &self,
        index: usize,
        size: usize,
        formatter: &dyn PageFormatter,
        out: &mut dyn Write,
    ) -> Result<usize, ExportError> {
        let page = self.get_page(index, size).await?;
        formatter.format(&self.header(), &page.rows, out)?;
        Ok(page.rows.len())
    }
}

/// Drain the whole result of `call` and format every row. Failed and
/// canceled calls produce an error instead of a partial document.
pub async fn export_call(
    call: &Call,
    formatter: &dyn PageFormatter,
    out: &mut dyn Write,
) -> Result<usize, ExportError> {
    match call.archive_all().await {
        CallState::Archived => {}
        CallState::Canceled => return Err(ExportError::Cancelled),
        state => {
            let reason = call
                .error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| format!("call ended in state {}", state));
            return Err(ExportError::QueryFailed(reason));
        }
    }

    let total = call.rows_cached();
    let page = call.get_page(0, total.max(1)).await?;
    formatter.format(&call.header(), &page.rows, out)?;
    out.flush()?;
    Ok(page.rows.len())
}
