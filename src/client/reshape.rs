//! Long-to-wide reshaping and joining of endpoint responses

use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

use super::ClientError;
use crate::models::Frame;

/// Secondary date dimension folded into variable names before pivoting
pub const META_DATE_COLUMN: &str = "meta_date";

const VALUE_COLUMN: &str = "value";

/// Name of the column holding variable names, if the frame is long
fn variable_column(frame: &Frame) -> Option<&'static str> {
    ["variable", "variable_name"]
        .into_iter()
        .find(|c| frame.has_column(c))
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fold `meta_date` into the variable name as `{variable}_{meta_date}`
///
/// The `meta_date` column is removed. Rows with a null `meta_date` keep
/// their variable name unchanged. Frames without both columns are returned
/// as they are.
pub fn fold_meta_date(frame: Frame) -> Frame {
    let (Some(var_col), Some(meta_idx)) = (
        variable_column(&frame),
        frame.column_index(META_DATE_COLUMN),
    ) else {
        return frame;
    };
    let Some(var_idx) = frame.column_index(var_col) else {
        return frame;
    };

    let columns: Vec<String> = frame
        .columns()
        .iter()
        .filter(|c| *c != META_DATE_COLUMN)
        .cloned()
        .collect();
    let mut folded = Frame::new(columns);

    for row in frame.rows() {
        let mut row = row.clone();
        let meta = row[meta_idx].clone();
        if !meta.is_null() {
            let folded = format!("{}_{}", cell_text(&row[var_idx]), cell_text(&meta));
            row[var_idx] = Value::String(folded);
        }
        row.remove(meta_idx);
        folded.push_row(row);
    }

    folded
}

/// Pivot long data to wide
///
/// The index is every column except the variable column and `value`; index
/// rows keep first-seen order and variable columns are sorted. A second
/// value for the same index and variable is an error. Frames without a
/// variable column are already wide: they are returned with `fallback_keys`
/// (those present) as key columns.
pub fn long_to_wide(
    frame: Frame,
    endpoint: &str,
    fallback_keys: &[String],
) -> Result<Frame, ClientError> {
    let frame = fold_meta_date(frame);
    let reshape_error = |message: String| ClientError::Reshape {
        endpoint: endpoint.to_string(),
        message,
    };

    let Some(var_col) = variable_column(&frame) else {
        let keys = fallback_keys
            .iter()
            .filter(|k| frame.has_column(k))
            .cloned()
            .collect();
        return Ok(frame.with_key_columns(keys));
    };
    let var_idx = frame
        .column_index(var_col)
        .ok_or_else(|| reshape_error(format!("missing {}", var_col)))?;
    let value_idx = frame
        .column_index(VALUE_COLUMN)
        .ok_or_else(|| {
            reshape_error(format!("long data has a {} column but no value column", var_col))
        })?;

    let index_positions: Vec<usize> = (0..frame.columns().len())
        .filter(|&i| i != var_idx && i != value_idx)
        .collect();
    let index_columns: Vec<String> = index_positions
        .iter()
        .map(|&i| frame.columns()[i].clone())
        .collect();

    let variables: Vec<String> = frame
        .rows()
        .iter()
        .map(|row| cell_text(&row[var_idx]))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let variable_pos: HashMap<&str, usize> = variables
        .iter()
        .enumerate()
        .map(|(i, v)| (v.as_str(), index_positions.len() + i))
        .collect();

    let mut columns = index_columns.clone();
    columns.extend(variables.iter().cloned());
    let width = columns.len();

    let mut wide_rows: Vec<Vec<Value>> = Vec::new();
    let mut row_of_key: HashMap<String, usize> = HashMap::new();

    for row in frame.rows() {
        let index_values: Vec<Value> = index_positions.iter().map(|&i| row[i].clone()).collect();
        let key = Value::Array(index_values.clone()).to_string();
        let slot = *row_of_key.entry(key).or_insert_with(|| {
            let mut wide = index_values;
            wide.resize(width, Value::Null);
            wide_rows.push(wide);
            wide_rows.len() - 1
        });

        let variable = cell_text(&row[var_idx]);
        let col = variable_pos[variable.as_str()];
        let cell = &mut wide_rows[slot][col];
        if !cell.is_null() {
            return Err(reshape_error(format!(
                "duplicate value for {} at index {}",
                variable,
                Value::Array(index_positions.iter().map(|&i| row[i].clone()).collect())
            )));
        }
        *cell = row[value_idx].clone();
    }

    let mut wide = Frame::new(columns).with_key_columns(index_columns);
    for row in wide_rows {
        wide.push_row(row);
    }
    Ok(wide)
}

/// Inner join two wide frames on the key columns they share
///
/// Result columns are the left columns followed by the right frame's
/// non-shared columns; a right column whose name is already taken gets a
/// `_{right_endpoint}` suffix. Rows come out in left order, then right order.
pub fn inner_join(left: &Frame, right: &Frame, right_endpoint: &str) -> Result<Frame, ClientError> {
    let shared: Vec<String> = left
        .key_columns()
        .iter()
        .filter(|k| right.key_columns().contains(k))
        .cloned()
        .collect();
    if shared.is_empty() {
        return Err(ClientError::Reshape {
            endpoint: right_endpoint.to_string(),
            message: format!(
                "no shared key columns to join on (left keys [{}], right keys [{}])",
                left.key_columns().join(", "),
                right.key_columns().join(", ")
            ),
        });
    }

    let positions = |frame: &Frame, names: &[String]| -> Vec<usize> {
        names.iter().filter_map(|n| frame.column_index(n)).collect()
    };
    let left_on = positions(left, &shared);
    let right_on = positions(right, &shared);
    let right_rest: Vec<usize> = (0..right.columns().len())
        .filter(|i| !right_on.contains(i))
        .collect();

    let mut columns: Vec<String> = left.columns().to_vec();
    for &i in &right_rest {
        let name = &right.columns()[i];
        if columns.contains(name) {
            columns.push(format!("{}_{}", name, right_endpoint));
        } else {
            columns.push(name.clone());
        }
    }

    let mut keys: Vec<String> = left.key_columns().to_vec();
    keys.extend(
        right
            .key_columns()
            .iter()
            .filter(|k| !shared.contains(k))
            .cloned(),
    );

    let join_key = |row: &[Value], on: &[usize]| -> String {
        Value::Array(on.iter().map(|&i| row[i].clone()).collect()).to_string()
    };
    let mut right_index: HashMap<String, Vec<usize>> = HashMap::new();
    for (r, row) in right.rows().iter().enumerate() {
        right_index.entry(join_key(row, &right_on)).or_default().push(r);
    }

    let mut joined = Frame::new(columns).with_key_columns(keys);
    for left_row in left.rows() {
        let Some(matches) = right_index.get(&join_key(left_row, &left_on)) else {
            continue;
        };
        for &r in matches {
            let right_row = &right.rows()[r];
            let mut row = left_row.clone();
            row.extend(right_rest.iter().map(|&i| right_row[i].clone()));
            joined.push_row(row);
        }
    }

    Ok(joined)
}
