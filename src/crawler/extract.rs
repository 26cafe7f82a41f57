//! Response-path selectors and page extraction.
//!
//! Sources describe their payloads with dotted paths (`data.pageInfo.total`);
//! this module resolves them and turns list and detail responses into
//! `DrugBase` and `DetailRow` values.

use crate::config::{DetailFields, DrugFields, SourceConfig};
use crate::crawler::FetchError;
use crate::item::{DetailRow, DrugBase};
use serde_json::Value;

/// A parsed list page
#[derive(Debug, Clone)]
pub struct ListPage {
    pub drugs: Vec<DrugBase>,
    /// Records on the page, keyless ones included
    pub record_count: usize,
    pub current_page: Option<u32>,
    pub total_pages: Option<u32>,
    /// Cursor for the next page; `None` or empty ends a cursor traversal
    pub next_cursor: Option<String>,
}

/// A parsed detail page
#[derive(Debug, Clone)]
pub struct DetailPage {
    pub rows: Vec<DetailRow>,
    pub total_pages: Option<u32>,
}

/// Extract a value from nested JSON using dot-notation path.
pub fn extract_path<'a>(data: &'a Value, path: &str) -> &'a Value {
    if path.is_empty() {
        return data;
    }

    let mut current = data;
    for key in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(key).unwrap_or(&Value::Null),
            Value::Array(arr) => match key.parse::<usize>() {
                Ok(idx) => arr.get(idx).unwrap_or(&Value::Null),
                Err(_) => &Value::Null,
            },
            _ => &Value::Null,
        };
    }

    current
}

/// Renders a scalar as text; blank strings, null and containers give `None`
pub fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Reads a non-negative integer that may be encoded as number or string
pub fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Reads a signed integer that may be encoded as number or string
pub fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn optional_field(record: &Value, path: Option<&String>) -> Option<String> {
    path.and_then(|p| value_as_string(extract_path(record, p)))
}

fn read_u32(data: &Value, path: Option<&String>) -> Option<u32> {
    path.and_then(|p| value_as_u64(extract_path(data, p)))
        .map(|n| n.min(u32::MAX as u64) as u32)
}

/// Total pages from an explicit selector, else derived from a total count
fn total_pages(
    data: &Value,
    pages_path: Option<&String>,
    count_path: Option<&String>,
    page_size: u32,
) -> Option<u32> {
    read_u32(data, pages_path).or_else(|| {
        let count = read_u32(data, count_path)?;
        let size = page_size.max(1);
        Some(count.div_ceil(size))
    })
}

/// Builds a DrugBase from one list record
///
/// Returns `None` when the record has no drug key.
pub fn drug_from_record(fields: &DrugFields, record: &Value) -> Option<DrugBase> {
    let drug_key = value_as_string(extract_path(record, &fields.drug_key))?;
    Some(DrugBase {
        drug_key,
        drug_name: optional_field(record, fields.drug_name.as_ref()),
        dosage_form: optional_field(record, fields.dosage_form.as_ref()),
        spec: optional_field(record, fields.spec.as_ref()),
        package: optional_field(record, fields.package.as_ref()),
        manufacturer: optional_field(record, fields.manufacturer.as_ref()),
        price: optional_field(record, fields.price.as_ref()),
        raw: record.clone(),
    })
}

/// Builds a DetailRow from one detail record
pub fn row_from_record(fields: &DetailFields, record: &Value) -> DetailRow {
    DetailRow {
        hospital_name: optional_field(record, fields.hospital_name.as_ref()),
        hospital_code: optional_field(record, fields.hospital_code.as_ref()),
        region: optional_field(record, fields.region.as_ref()),
        price: optional_field(record, fields.price.as_ref()),
        inventory: optional_field(record, fields.inventory.as_ref()),
        time: optional_field(record, fields.time.as_ref()),
        raw: record.clone(),
    }
}

/// Parses a list response
///
/// # Errors
///
/// A missing record array is a Logic error unless the response reports a
/// total of zero. A non-empty page on which no record carries a drug key is
/// a Logic error as well; individual keyless records are dropped.
pub fn parse_list_page(source: &SourceConfig, data: &Value, url: &str) -> Result<ListPage, FetchError> {
    let list = &source.list;
    let total_pages = total_pages(
        data,
        list.total_pages_path.as_ref(),
        list.total_count_path.as_ref(),
        list.page_size,
    );

    let records = match extract_path(data, &list.items_path) {
        Value::Array(records) => records.as_slice(),
        Value::Null if total_pages == Some(0) => &[],
        Value::Null => {
            return Err(FetchError::logic(
                url,
                format!("list response has no '{}'", list.items_path),
            ))
        }
        other => {
            return Err(FetchError::logic(
                url,
                format!("'{}' is not an array but {}", list.items_path, kind_of(other)),
            ))
        }
    };

    let mut drugs = Vec::with_capacity(records.len());
    for record in records {
        match drug_from_record(&source.drug_fields, record) {
            Some(drug) => drugs.push(drug),
            None => tracing::warn!(
                "Source {} dropped list record without '{}'",
                source.id,
                source.drug_fields.drug_key
            ),
        }
    }

    if drugs.is_empty() && !records.is_empty() {
        return Err(FetchError::logic(
            url,
            format!("no record carries '{}'", source.drug_fields.drug_key),
        ));
    }

    Ok(ListPage {
        record_count: records.len(),
        drugs,
        current_page: read_u32(data, list.page_path.as_ref()),
        total_pages,
        next_cursor: list
            .cursor_path
            .as_ref()
            .and_then(|p| value_as_string(extract_path(data, p))),
    })
}

/// Parses a detail response; a missing record array means no records
pub fn parse_detail_page(source: &SourceConfig, data: &Value, url: &str) -> Result<DetailPage, FetchError> {
    let detail = &source.detail;
    let rows = match extract_path(data, &detail.items_path) {
        Value::Array(records) => records
            .iter()
            .map(|r| row_from_record(&source.detail_fields, r))
            .collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(FetchError::logic(
                url,
                format!("'{}' is not an array but {}", detail.items_path, kind_of(other)),
            ))
        }
    };

    Ok(DetailPage {
        rows,
        total_pages: total_pages(
            data,
            detail.total_pages_path.as_ref(),
            detail.total_count_path.as_ref(),
            detail.page_size,
        ),
    })
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
