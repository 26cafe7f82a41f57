//! Harvested records
//!
//! - `DrugBase`: one drug from a list page
//! - `DetailRow`: one hospital record from a detail page
//! - `Item`: the flattened, fingerprinted pair that gets persisted
//! - `clean_item`: the Data-error boundary in front of the pipeline

mod clean;
mod fingerprint;
mod model;

pub use clean::{clean_item, DataError};
pub use fingerprint::{fingerprint, is_fingerprint, FIELD_SEPARATOR};
pub use model::{DetailRow, DrugBase, Item, ItemContext};
