use thiserror::Error;

/// Failure of one request, classified for the retry controller
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    /// Connection, DNS, timeout, read error, HTTP 429/408/5xx
    #[error("network error on {url}: {message}")]
    Network { url: String, message: String },

    /// Upstream asked the client to start over: retry code, missing token,
    /// expected element missing
    #[error("logic error on {url}: {message}")]
    Logic { url: String, message: String },

    /// Other HTTP 4xx, unparseable body, rejected response code
    #[error("fatal error on {url}: {message}")]
    Fatal { url: String, message: String },
}

impl FetchError {
    pub fn network(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn logic(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Logic {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn fatal(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fatal {
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Network { url, .. } | Self::Logic { url, .. } | Self::Fatal { url, .. } => url,
        }
    }

    /// Short class name used in logs
    pub fn class(&self) -> &'static str {
        match self {
            Self::Network { .. } => "network",
            Self::Logic { .. } => "logic",
            Self::Fatal { .. } => "fatal",
        }
    }
}
