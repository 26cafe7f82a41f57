use chrono::{DateTime, Utc};
use serde_json::Value;

/// Traversal stage an audit event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    List,
    Detail,
    Error,
}

impl Stage {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Detail => "detail",
            Self::Error => "error",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "list" => Some(Self::List),
            "detail" => Some(Self::Detail),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// One append-only row of `crawl_audit`
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEvent {
    pub event_id: String,
    pub spider: String,
    pub run_id: i64,
    pub stage: Stage,
    pub page_no: u32,
    pub total_pages: Option<u32>,
    pub items_found: u32,
    pub items_stored: u32,
    /// Request parameters echoed back
    pub params: Value,
    pub api_url: String,
    pub success: bool,
    pub error_message: Option<String>,
    /// Links a detail event to the list event that spawned it
    pub parent_event_id: Option<String>,
    /// Drug key for detail events
    pub reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_roundtrip() {
        for stage in &[Stage::List, Stage::Detail, Stage::Error] {
            assert_eq!(Stage::from_db_string(stage.to_db_string()), Some(*stage));
        }
        assert_eq!(Stage::from_db_string("token"), None);
    }
}
