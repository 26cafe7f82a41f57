use crate::item::DrugBase;
use std::sync::Arc;

/// One unit of work for the scheduler
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    /// Index of the owning source
    pub lane: usize,
    pub kind: RequestKind,
    /// 1-based attempt number of the next execution
    pub attempt: u32,
}

impl CrawlRequest {
    pub fn new(lane: usize, kind: RequestKind) -> Self {
        Self {
            lane,
            kind,
            attempt: 1,
        }
    }

    /// The same request, one attempt later
    pub fn retry(&self) -> Self {
        Self {
            lane: self.lane,
            kind: self.kind.clone(),
            attempt: self.attempt + 1,
        }
    }

    pub fn page(&self) -> u32 {
        match &self.kind {
            RequestKind::List(list) => list.page,
            RequestKind::Detail(detail) => detail.page,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RequestKind {
    List(ListRequest),
    Detail(DetailRequest),
}

/// A list page of one traversal
#[derive(Debug, Clone)]
pub struct ListRequest {
    /// Traversal index within the source
    pub traversal: usize,
    /// Search term of a keyword-seeded traversal
    pub keyword: Option<String>,
    pub page: u32,
    /// Cursor echoed from the previous page
    pub cursor: Option<String>,
}

/// A detail page of one drug
#[derive(Debug, Clone)]
pub struct DetailRequest {
    pub drug: Arc<DrugBase>,
    pub page: u32,
    /// List page the drug was found on
    pub list_page: u32,
    /// Audit event of that list page
    pub parent_event_id: Option<String>,
}
