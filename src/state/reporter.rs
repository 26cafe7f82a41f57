use crate::pipeline::PipelineHandle;
use crate::state::{AuditEvent, ProgressStatus, ProgressUpdate, Stage};
use crate::storage::Record;
use chrono::Utc;
use serde_json::Value;

/// A page that was fetched and processed
#[derive(Debug, Clone)]
pub struct PageReport {
    pub stage: Stage,
    pub page_no: u32,
    pub total_pages: Option<u32>,
    pub items_found: u32,
    pub items_stored: u32,
    pub params: Value,
    pub api_url: String,
    pub parent_event_id: Option<String>,
    pub reference_id: Option<String>,
}

/// A page that failed for good
#[derive(Debug, Clone)]
pub struct PageFailure {
    /// Stage of the request that failed
    pub stage: Stage,
    pub page_no: u32,
    pub params: Value,
    pub api_url: String,
    pub error: String,
    pub parent_event_id: Option<String>,
    pub reference_id: Option<String>,
}

/// Receives the driver's page transitions
pub trait Reporter: Send {
    /// Records a processed page and returns its event id
    fn page_ok(&mut self, report: PageReport) -> String;

    /// Records a failed page and returns its event id
    fn page_error(&mut self, failure: PageFailure) -> String;

    /// Records the final status of the source
    fn finish(&mut self, status: ProgressStatus);
}

/// Reporter writing audit and progress records through the pipeline
pub struct PipelineReporter {
    source: String,
    run_id: i64,
    seq: u64,
    pipeline: PipelineHandle,
}

impl PipelineReporter {
    pub fn new(source: impl Into<String>, run_id: i64, pipeline: PipelineHandle) -> Self {
        Self {
            source: source.into(),
            run_id,
            seq: 0,
            pipeline,
        }
    }

    fn next_event_id(&mut self) -> String {
        self.seq += 1;
        format!("{}-{}-{}", self.run_id, self.source, self.seq)
    }

    fn emit(&self, record: Record) {
        if !self.pipeline.send(record) {
            tracing::warn!("Pipeline closed, dropping status record for {}", self.source);
        }
    }
}

impl Reporter for PipelineReporter {
    fn page_ok(&mut self, report: PageReport) -> String {
        let event_id = self.next_event_id();

        let mut progress = ProgressUpdate::new(&self.source, self.run_id, ProgressStatus::Running);
        progress.current_stage = Some(report.stage.to_db_string().to_string());
        progress.items_delta = u64::from(report.items_stored);
        if report.stage == Stage::List {
            progress.completed_tasks = Some(report.page_no);
            progress.total_tasks = report.total_pages;
        }

        self.emit(Record::Audit(AuditEvent {
            event_id: event_id.clone(),
            spider: self.source.clone(),
            run_id: self.run_id,
            stage: report.stage,
            page_no: report.page_no,
            total_pages: report.total_pages,
            items_found: report.items_found,
            items_stored: report.items_stored,
            params: report.params,
            api_url: report.api_url,
            success: true,
            error_message: None,
            parent_event_id: report.parent_event_id,
            reference_id: report.reference_id,
            created_at: Utc::now(),
        }));
        self.emit(Record::Progress(progress));

        event_id
    }

    fn page_error(&mut self, failure: PageFailure) -> String {
        let event_id = self.next_event_id();

        let mut progress = ProgressUpdate::new(&self.source, self.run_id, ProgressStatus::Running);
        progress.errors_delta = 1;

        self.emit(Record::Audit(AuditEvent {
            event_id: event_id.clone(),
            spider: self.source.clone(),
            run_id: self.run_id,
            stage: Stage::Error,
            page_no: failure.page_no,
            total_pages: None,
            items_found: 0,
            items_stored: 0,
            params: failure.params,
            api_url: failure.api_url,
            success: false,
            error_message: Some(format!(
                "{} request failed: {}",
                failure.stage.to_db_string(),
                failure.error
            )),
            parent_event_id: failure.parent_event_id,
            reference_id: failure.reference_id,
            created_at: Utc::now(),
        }));
        self.emit(Record::Progress(progress));

        event_id
    }

    fn finish(&mut self, status: ProgressStatus) {
        let mut progress = ProgressUpdate::new(&self.source, self.run_id, status);
        progress.current_stage = Some("done".to_string());
        self.emit(Record::Progress(progress));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::storage::{SqliteStorage, Storage};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn list_page(page_no: u32) -> PageReport {
        PageReport {
            stage: Stage::List,
            page_no,
            total_pages: Some(2),
            items_found: 3,
            items_stored: 0,
            params: json!({"pageNo": page_no}),
            api_url: "https://api.example.gov/list".to_string(),
            parent_event_id: None,
            reference_id: None,
        }
    }

    #[tokio::test]
    async fn test_events_reach_audit_and_progress_tables() {
        let storage = Arc::new(Mutex::new(SqliteStorage::new_in_memory().unwrap()));
        let pipeline = PipelineHandle::spawn(storage.clone(), PipelineConfig::default());
        let mut reporter = PipelineReporter::new("gd", 7, pipeline.clone());

        let list_event = reporter.page_ok(list_page(1));
        assert_eq!(list_event, "7-gd-1");

        reporter.page_ok(PageReport {
            stage: Stage::Detail,
            page_no: 1,
            total_pages: None,
            items_found: 2,
            items_stored: 2,
            params: json!({"drugId": "A1"}),
            api_url: "https://api.example.gov/detail".to_string(),
            parent_event_id: Some(list_event.clone()),
            reference_id: Some("A1".to_string()),
        });
        reporter.page_error(PageFailure {
            stage: Stage::Detail,
            page_no: 1,
            params: json!({"drugId": "B2"}),
            api_url: "https://api.example.gov/detail".to_string(),
            error: "connection reset".to_string(),
            parent_event_id: Some(list_event.clone()),
            reference_id: Some("B2".to_string()),
        });
        reporter.page_ok(list_page(2));
        reporter.finish(ProgressStatus::Finished);

        pipeline.close().await.unwrap();

        let storage = storage.lock().unwrap();
        assert_eq!(storage.count_audit("gd", Some(Stage::List)).unwrap(), 2);
        assert_eq!(storage.count_audit("gd", Some(Stage::Detail)).unwrap(), 1);
        assert_eq!(storage.count_audit("gd", Some(Stage::Error)).unwrap(), 1);

        let events = storage.audit_events("gd").unwrap();
        assert_eq!(events[1].parent_event_id.as_deref(), Some("7-gd-1"));
        assert!(!events[2].success);
        assert!(events[2]
            .error_message
            .as_deref()
            .unwrap()
            .contains("connection reset"));

        let progress = storage.load_progress("gd").unwrap().unwrap();
        assert_eq!(progress.status, ProgressStatus::Finished);
        assert_eq!(progress.completed_tasks, 2);
        assert_eq!(progress.total_tasks, 2);
        assert_eq!(progress.items_scraped, 2);
        assert_eq!(progress.errors_count, 1);
    }
}
