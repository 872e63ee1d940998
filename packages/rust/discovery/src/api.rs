//! Discovery API payload parsing.
//!
//! The portal's data table is backed by `GET {api}/{MM}/{YYYY}`, which returns
//! DataTables JSON: `{"data": [row, ...]}` (some deployments send the bare
//! array). Rows embed HTML anchor fragments; we only need their hrefs.

use std::sync::LazyLock;

use domharvest_shared::{HarvestError, Result};
use scraper::{Html, Selector};
use serde_json::Value;

/// Every anchor carrying an href.
static ANCHOR_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

/// Column holding the link cell in the default DataTables layout.
const LINK_COLUMN: &str = "0";

/// Parse a raw API body and return every anchor href, in row order.
pub fn parse_payload(body: &str) -> Result<Vec<String>> {
    let payload: Value = serde_json::from_str(body)
        .map_err(|e| HarvestError::parse(format!("discovery payload is not JSON: {e}")))?;
    extract_hrefs(&payload)
}

/// Walk a decoded payload and collect anchor hrefs from each row.
pub fn extract_hrefs(payload: &Value) -> Result<Vec<String>> {
    let rows = match payload {
        Value::Array(rows) => rows,
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(rows)) => rows,
            Some(other) => {
                return Err(HarvestError::parse(format!(
                    "discovery payload 'data' is not an array: {}",
                    kind_of(other)
                )));
            }
            None => {
                return Err(HarvestError::parse(
                    "discovery payload has no 'data' array",
                ));
            }
        },
        other => {
            return Err(HarvestError::parse(format!(
                "unexpected discovery payload: {}",
                kind_of(other)
            )));
        }
    };

    let mut hrefs = Vec::new();
    for row in rows {
        for fragment in row_fragments(row) {
            hrefs.extend(anchor_hrefs(fragment));
        }
    }
    Ok(hrefs)
}

/// HTML fragments worth scanning in one row.
fn row_fragments(row: &Value) -> Vec<&str> {
    match row {
        Value::String(s) => vec![s.as_str()],
        Value::Object(map) => match map.get(LINK_COLUMN).and_then(Value::as_str) {
            Some(cell) => vec![cell],
            None => map.values().filter_map(Value::as_str).collect(),
        },
        Value::Array(cells) => cells.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

/// Hrefs of all anchors in an HTML fragment.
fn anchor_hrefs(fragment: &str) -> Vec<String> {
    let html = Html::parse_fragment(fragment);
    html.select(&ANCHOR_SELECTOR)
        .filter_map(|a| a.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty())
        .map(String::from)
        .collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
