// JSON Export Engine
// Encodes result pages as an array of row objects keyed by column name

use super::{ExportError, ExportOptions, PageFormatter};
use crate::db::{CellValue, Row};
use serde_json::{json, Map, Value};
use std::io::Write;

/// JSON encoder for result pages
pub struct JsonExporter {
    options: ExportOptions,
}

impl JsonExporter {
    pub fn new(options: ExportOptions) -> Self {
        Self { options }
    }

    pub fn with_default_options() -> Self {
        Self::new(ExportOptions {
            pretty_print: true,
            ..Default::default()
        })
    }

    /// An object keyed by column name, or a positional array when headers
    /// are switched off
    fn row_value(&self, header: &[String], row: &[CellValue]) -> Value {
        if !self.options.include_headers {
            return Value::Array(row.iter().map(cell_value).collect());
        }
        let fields: Map<String, Value> = header
            .iter()
            .zip(row)
            .map(|(name, cell)| (name.clone(), cell_value(cell)))
            .collect();
        Value::Object(fields)
    }
}

impl PageFormatter for JsonExporter {
    fn format(&self, header: &[String], rows: &[Row], out: &mut dyn Write) -> Result<(), ExportError> {
        let document = Value::Array(rows.iter().map(|row| self.row_value(header, row)).collect());

        let written = if self.options.pretty_print {
            serde_json::to_writer_pretty(&mut *out, &document)
        } else {
            serde_json::to_writer(&mut *out, &document)
        };
        written.map_err(|e| ExportError::SerializationError(e.to_string()))?;

        writeln!(out)?;
        Ok(())
    }
}

fn cell_value(cell: &CellValue) -> Value {
    match cell {
        CellValue::Null => Value::Null,
        CellValue::Bool(b) => Value::Bool(*b),
        CellValue::Int(i) => json!(i),
        // JSON numbers cannot carry these
        CellValue::Float(f) if f.is_nan() => json!("NaN"),
        CellValue::Float(f) if f.is_infinite() => {
            let text = if *f > 0.0 { "Infinity" } else { "-Infinity" };
            Value::String(text.to_string())
        }
        CellValue::Float(f) => json!(f),
        CellValue::String(text) | CellValue::DateTime(text) => Value::String(text.clone()),
        CellValue::Binary(bytes) => json!({
            "_type": "binary",
            "encoding": "base64",
            "data": base64_encode(bytes),
        }),
    }
}

/// Standard base64 with padding
fn base64_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

    let mut encoded = String::with_capacity(data.len().div_ceil(3) * 4);
    for chunk in data.chunks(3) {
        let group = chunk
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, byte)| acc | (u32::from(*byte) << (16 - 8 * i)));

        // n input bytes produce n + 1 significant characters
        for i in 0..4 {
            if i <= chunk.len() {
                let index = (group >> (18 - 6 * i)) & 0x3f;
                encoded.push(ALPHABET[index as usize] as char);
            } else {
                encoded.push('=');
            }
        }
    }
    encoded
}
