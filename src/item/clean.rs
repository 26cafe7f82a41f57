//! Cleaning boundary between the driver and the persistence pipeline
//!
//! Items that fail validation here are Data errors: they are dropped with a
//! warning and never retried.

use crate::item::fingerprint::is_fingerprint;
use crate::item::Item;
use thiserror::Error;

/// Schema violations detected at the cleaning boundary
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("malformed fingerprint '{0}'")]
    BadFingerprint(String),
}

/// Normalizes an item and checks the fields the sink relies on
///
/// Optional text fields are trimmed and blank values become `None`.
pub fn clean_item(mut item: Item) -> Result<Item, DataError> {
    item.drug_key = item.drug_key.trim().to_string();
    if item.drug_key.is_empty() {
        return Err(DataError::MissingField("drug_key"));
    }
    if item.source_id.trim().is_empty() {
        return Err(DataError::MissingField("source_id"));
    }
    if item.table.is_empty() {
        return Err(DataError::MissingField("table"));
    }
    if !is_fingerprint(&item.md5_id) {
        return Err(DataError::BadFingerprint(item.md5_id));
    }

    for field in [
        &mut item.drug_name,
        &mut item.dosage_form,
        &mut item.spec,
        &mut item.package,
        &mut item.manufacturer,
        &mut item.price,
        &mut item.hospital_name,
        &mut item.hospital_code,
        &mut item.region,
        &mut item.detail_price,
        &mut item.inventory,
        &mut item.detail_time,
    ] {
        normalize(field);
    }

    Ok(item)
}

fn normalize(field: &mut Option<String>) {
    *field = field
        .take()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());
}
