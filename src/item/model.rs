use crate::item::fingerprint::fingerprint;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};

/// One drug as returned by a list endpoint
///
/// Shared read-only by every detail request spawned for the drug.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DrugBase {
    /// Site-specific primary identifier
    pub drug_key: String,
    pub drug_name: Option<String>,
    pub dosage_form: Option<String>,
    pub spec: Option<String>,
    pub package: Option<String>,
    pub manufacturer: Option<String>,
    pub price: Option<String>,

    /// The list record as received
    pub raw: Value,
}

impl DrugBase {
    /// Creates a DrugBase carrying only its key
    pub fn from_key(drug_key: impl Into<String>) -> Self {
        Self {
            drug_key: drug_key.into(),
            drug_name: None,
            dosage_form: None,
            spec: None,
            package: None,
            manufacturer: None,
            price: None,
            raw: Value::Null,
        }
    }
}

/// One hospital or pharmacy record attached to a drug
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetailRow {
    pub hospital_name: Option<String>,
    pub hospital_code: Option<String>,
    pub region: Option<String>,
    pub price: Option<String>,
    pub inventory: Option<String>,
    pub time: Option<String>,

    /// The detail record as received
    pub raw: Value,
}

/// Where an item was harvested from
#[derive(Debug, Clone, Copy)]
pub struct ItemContext<'a> {
    pub table: &'a str,
    pub source_id: &'a str,
    pub url: &'a str,
    /// List page the drug was found on
    pub page_no: u32,
}

/// The flattened persistence record: drug fields, hospital fields and
/// system fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Item {
    /// Destination fact table
    pub table: String,
    pub source_id: String,
    pub md5_id: String,

    pub drug_key: String,
    pub drug_name: Option<String>,
    pub dosage_form: Option<String>,
    pub spec: Option<String>,
    pub package: Option<String>,
    pub manufacturer: Option<String>,
    pub price: Option<String>,

    pub hospital_name: Option<String>,
    pub hospital_code: Option<String>,
    pub region: Option<String>,
    pub detail_price: Option<String>,
    pub inventory: Option<String>,
    pub detail_time: Option<String>,

    /// False for the synthetic row of a drug without detail records
    pub has_record: bool,
    /// `{"drug": …, "detail": …}` as JSON text
    pub source_data: String,
    pub url: Option<String>,
    pub page_no: u32,
    pub collect_time: DateTime<Utc>,
}

impl Item {
    /// Merges a drug with one of its detail rows
    ///
    /// Passing `None` as the row builds the synthetic `has_record = false`
    /// item of a drug with no detail records.
    pub fn from_pair(ctx: &ItemContext<'_>, drug: &DrugBase, row: Option<&DetailRow>) -> Self {
        let detail = row.cloned().unwrap_or_default();
        let source_data = json!({
            "drug": drug.raw,
            "detail": detail.raw,
        })
        .to_string();

        let mut item = Self {
            table: ctx.table.to_string(),
            source_id: ctx.source_id.to_string(),
            md5_id: String::new(),
            drug_key: drug.drug_key.clone(),
            drug_name: drug.drug_name.clone(),
            dosage_form: drug.dosage_form.clone(),
            spec: drug.spec.clone(),
            package: drug.package.clone(),
            manufacturer: drug.manufacturer.clone(),
            price: drug.price.clone(),
            hospital_name: detail.hospital_name,
            hospital_code: detail.hospital_code,
            region: detail.region,
            detail_price: detail.price,
            inventory: detail.inventory,
            detail_time: detail.time,
            has_record: row.is_some(),
            source_data,
            url: Some(ctx.url.to_string()).filter(|u| !u.is_empty()),
            page_no: ctx.page_no,
            collect_time: Utc::now(),
        };
        item.md5_id = fingerprint(item.business_key());
        item
    }

    /// The canonical field tuple the fingerprint is computed over
    pub fn business_key(&self) -> [Option<&str>; 6] {
        [
            self.hospital_name.as_deref(),
            self.drug_name.as_deref(),
            self.dosage_form.as_deref(),
            self.spec.as_deref(),
            self.package.as_deref(),
            self.manufacturer.as_deref(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_drug() -> DrugBase {
        DrugBase {
            drug_key: "A1".to_string(),
            drug_name: Some("阿莫西林".to_string()),
            dosage_form: Some("胶囊".to_string()),
            spec: Some("0.25g".to_string()),
            package: Some("24粒/盒".to_string()),
            manufacturer: Some("某某制药".to_string()),
            price: Some("12.5".to_string()),
            raw: json!({"drugId": "A1"}),
        }
    }

    fn ctx() -> ItemContext<'static> {
        ItemContext {
            table: "gd_drug_hospital",
            source_id: "gd",
            url: "https://api.example.gov/detail",
            page_no: 3,
        }
    }

    #[test]
    fn test_from_pair_merges_fields() {
        let drug = sample_drug();
        let row = DetailRow {
            hospital_name: Some("协和医院".to_string()),
            region: Some("广州".to_string()),
            raw: json!({"hospitalName": "协和医院"}),
            ..DetailRow::default()
        };

        let item = Item::from_pair(&ctx(), &drug, Some(&row));

        assert_eq!(item.table, "gd_drug_hospital");
        assert_eq!(item.drug_key, "A1");
        assert_eq!(item.hospital_name.as_deref(), Some("协和医院"));
        assert_eq!(item.region.as_deref(), Some("广州"));
        assert_eq!(item.page_no, 3);
        assert!(item.has_record);
        assert_eq!(item.md5_id, "b488baff355fcffe99f8ce5e39fcba1c");

        let data: Value = serde_json::from_str(&item.source_data).unwrap();
        assert_eq!(data["drug"]["drugId"], "A1");
        assert_eq!(data["detail"]["hospitalName"], "协和医院");
    }

    #[test]
    fn test_synthetic_item_without_detail() {
        let item = Item::from_pair(&ctx(), &sample_drug(), None);

        assert!(!item.has_record);
        assert!(item.hospital_name.is_none());
        let data: Value = serde_json::from_str(&item.source_data).unwrap();
        assert!(data["detail"].is_null());
        assert_eq!(item.md5_id.len(), 32);
    }

    #[test]
    fn test_same_business_tuple_same_fingerprint() {
        let drug = sample_drug();
        let mut other = sample_drug();
        other.drug_key = "different-key".to_string();
        other.price = Some("99".to_string());
        other.raw = json!({"unrelated": true});

        let a = Item::from_pair(&ctx(), &drug, None);
        let b = Item::from_pair(&ctx(), &other, None);
        assert_eq!(a.md5_id, b.md5_id);
    }

    #[test]
    fn test_from_key() {
        let drug = DrugBase::from_key("K3");
        assert_eq!(drug.drug_key, "K3");
        assert!(drug.drug_name.is_none());
        assert!(drug.raw.is_null());
    }
}
