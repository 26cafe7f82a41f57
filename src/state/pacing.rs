use std::time::Duration;
use tokio::time::Instant;

/// Tracks request pacing for one source
///
/// Enforces the minimum delay between two consecutive requests to the same
/// source (the source's `delay_seconds`).
#[derive(Debug, Clone)]
pub struct SourcePacing {
    /// Minimum time between two requests
    pub min_delay: Duration,

    /// Number of requests dispatched to this source in the current run
    pub request_count: u64,

    /// Timestamp of the last dispatched request
    pub last_request_time: Option<Instant>,
}

impl SourcePacing {
    /// Creates a new SourcePacing with the given minimum delay
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            request_count: 0,
            last_request_time: None,
        }
    }

    /// Checks if a request can be made to this source at `now`
    pub fn can_request(&self, now: Instant) -> bool {
        self.time_until_next_request(now).is_none()
    }

    /// Records that a request was dispatched
    pub fn record_request(&mut self, now: Instant) {
        self.request_count += 1;
        self.last_request_time = Some(now);
    }

    /// Calculates the time until the next request can be made
    ///
    /// Returns None if a request can be made now, or the duration to wait otherwise.
    pub fn time_until_next_request(&self, now: Instant) -> Option<Duration> {
        let last = self.last_request_time?;
        let elapsed = now.saturating_duration_since(last);
        if elapsed < self.min_delay {
            Some(self.min_delay - elapsed)
        } else {
            None
        }
    }

    /// Instant at which the next request may be dispatched, if after `now`
    pub fn next_allowed(&self, now: Instant) -> Option<Instant> {
        self.time_until_next_request(now).map(|wait| now + wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_request_initially() {
        let pacing = SourcePacing::new(Duration::from_secs(1));
        assert!(pacing.can_request(Instant::now()));
        assert!(pacing.next_allowed(Instant::now()).is_none());
    }

    #[test]
    fn test_cannot_request_too_soon() {
        let mut pacing = SourcePacing::new(Duration::from_secs(1));
        let now = Instant::now();
        pacing.record_request(now);

        assert!(!pacing.can_request(now));
        assert!(!pacing.can_request(now + Duration::from_millis(500)));
        assert!(pacing.can_request(now + Duration::from_millis(1100)));
    }

    #[test]
    fn test_zero_delay_never_waits() {
        let mut pacing = SourcePacing::new(Duration::ZERO);
        let now = Instant::now();
        pacing.record_request(now);
        assert!(pacing.can_request(now));
        assert!(pacing.next_allowed(now).is_none());
    }

    #[test]
    fn test_record_request() {
        let mut pacing = SourcePacing::new(Duration::ZERO);
        let now = Instant::now();

        pacing.record_request(now);
        pacing.record_request(now);

        assert_eq!(pacing.request_count, 2);
        assert_eq!(pacing.last_request_time, Some(now));
    }

    #[test]
    fn test_time_until_next_request() {
        let mut pacing = SourcePacing::new(Duration::from_millis(1000));
        let now = Instant::now();

        assert!(pacing.time_until_next_request(now).is_none());

        pacing.record_request(now);
        assert_eq!(
            pacing.time_until_next_request(now),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(
            pacing.time_until_next_request(now + Duration::from_millis(500)),
            Some(Duration::from_millis(500))
        );
        assert!(pacing
            .time_until_next_request(now + Duration::from_millis(1100))
            .is_none());
        assert_eq!(
            pacing.next_allowed(now + Duration::from_millis(300)),
            Some(now + Duration::from_millis(1000))
        );
        assert!(pacing
            .next_allowed(now + Duration::from_millis(1000))
            .is_none());
    }
}
