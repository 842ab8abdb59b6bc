//! CSV downloads
//!
//! Small quote- and CRLF-tolerant reader for the CSV files published by the
//! state and research sources. Cells are kept as strings; adapters decide how
//! to interpret them.

use serde_json::Value;
use std::mem::take;

use super::{FetchError, HttpTransport};
use crate::models::Record;

/// Split CSV text into rows of fields
///
/// Blank lines are skipped; an unterminated quote runs to the end of input.
pub fn parse_rows(text: &str, sep: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut field = String::new();
    let mut row = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.trim_start_matches('\u{feff}').chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            c if c == sep && !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(take(&mut field));
                if row.len() == 1 && row[0].is_empty() {
                    row.clear();
                } else {
                    rows.push(take(&mut row));
                }
            }
            _ => field.push(ch),
        }
    }

    row.push(field);
    if !(row.len() == 1 && row[0].is_empty()) {
        rows.push(row);
    }

    rows
}

/// Parse CSV text with a header row into records
///
/// Empty cells become `null`; short rows are padded with `null`. A row with
/// more cells than the header is an error naming its line.
pub fn parse_csv(text: &str) -> Result<Vec<Record>, String> {
    let mut rows = parse_rows(text, ',').into_iter();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();

    rows.enumerate()
        .map(|(i, row)| {
            if row.len() > header.len() {
                return Err(format!(
                    "row {} has {} fields, header has {}",
                    i + 2,
                    row.len(),
                    header.len()
                ));
            }
            let mut record = Record::new();
            for (pos, name) in header.iter().enumerate() {
                let value = match row.get(pos).map(|s| s.trim()) {
                    Some("") | None => Value::Null,
                    Some(cell) => Value::String(cell.to_string()),
                };
                record.insert(name.clone(), value);
            }
            Ok(record)
        })
        .collect()
}

/// Download and parse a CSV file
pub async fn fetch_csv(http: &dyn HttpTransport, url: &str) -> Result<Vec<Record>, FetchError> {
    let body = http.get(url, &[]).await?;
    parse_csv(&body).map_err(|message| FetchError::Decode {
        url: url.to_string(),
        message,
    })
}

/// Read a cell as a number, accepting thousands separators
pub fn number(record: &Record, column: &str) -> Option<f64> {
    match record.get(column)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

/// Read a cell as text
pub fn text<'r>(record: &'r Record, column: &str) -> Option<&'r str> {
    record.get(column).and_then(Value::as_str)
}
