use crate::config::{EngineConfig, SourceConfig};
use crate::crawler::fetcher::build_http_client;
use crate::crawler::FetchError;
use std::sync::{Arc, RwLock};

/// One generation of a source's HTTP state
///
/// The client carries the cookie jar, so swapping the client discards every
/// cookie and pooled connection the upstream associated with us.
#[derive(Debug)]
pub struct Session {
    pub client: reqwest::Client,
    pub generation: u64,
}

/// The replaceable HTTP session of one source
pub struct SourceSession {
    inner: RwLock<Arc<Session>>,
    engine: EngineConfig,
    source: SourceConfig,
}

impl SourceSession {
    pub fn new(engine: &EngineConfig, source: &SourceConfig) -> Result<Self, FetchError> {
        let client = build_http_client(engine, source)?;
        Ok(Self {
            inner: RwLock::new(Arc::new(Session {
                client,
                generation: 0,
            })),
            engine: engine.clone(),
            source: source.clone(),
        })
    }

    /// The session requests should use right now
    pub fn current(&self) -> Arc<Session> {
        match self.inner.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Replaces the session that failed with a fresh one
    ///
    /// Several requests can fail on the same generation at once; only the
    /// first reset swaps the client, later ones see a newer generation and
    /// keep it.
    pub fn reset(&self, failed_generation: u64) -> Result<u64, FetchError> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.generation != failed_generation {
            return Ok(guard.generation);
        }

        let client = build_http_client(&self.engine, &self.source)?;
        let generation = failed_generation + 1;
        *guard = Arc::new(Session { client, generation });

        tracing::debug!(
            "Source {} session reset to generation {}",
            self.source.id,
            generation
        );
        Ok(generation)
    }
}
