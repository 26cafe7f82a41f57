/// Lifecycle of a source's progress row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgressStatus {
    Running,
    Paused,
    Error,
    Finished,
}

impl ProgressStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Finished => "finished",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "error" => Some(Self::Error),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }

    /// Returns true if this status ends the source's run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error | Self::Finished)
    }
}

/// An upsert against the `spider_progress` row of one source
///
/// `None` task counters leave the stored values untouched; deltas are added
/// to the stored counters of the same run.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub source: String,
    pub run_id: i64,
    pub status: ProgressStatus,
    pub completed_tasks: Option<u32>,
    pub total_tasks: Option<u32>,
    pub current_stage: Option<String>,
    pub items_delta: u64,
    pub errors_delta: u64,
}

impl ProgressUpdate {
    pub fn new(source: impl Into<String>, run_id: i64, status: ProgressStatus) -> Self {
        Self {
            source: source.into(),
            run_id,
            status,
            completed_tasks: None,
            total_tasks: None,
            current_stage: None,
            items_delta: 0,
            errors_delta: 0,
        }
    }
}

/// The stored progress row of one source
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub spider_name: String,
    pub run_id: i64,
    pub status: ProgressStatus,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub progress_percent: f64,
    pub current_stage: Option<String>,
    pub items_scraped: u64,
    pub errors_count: u64,
    pub last_updated: String,
}
