//! Scheduler for pacing and admitting requests
//!
//! This module handles:
//! - Per-source ready queues (detail pages ahead of list pages)
//! - Global and per-source concurrency limiting via semaphores
//! - Minimum delays between requests to the same source
//! - Delayed re-enqueue for backoff (a wake-up deadline, never a sleep)
//! - Round-robin fairness across sources
//!
//! The scheduler never blocks: `next_ready` hands out what can run now and
//! `next_wakeup` tells the caller when to ask again.

use crate::crawler::request::{CrawlRequest, RequestKind};
use crate::state::SourcePacing;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// A request waiting for its wake-up deadline
#[derive(Debug)]
struct Delayed {
    wake: Instant,
    seq: u64,
    request: CrawlRequest,
}

// Earliest deadline first; ties broken by insertion order
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake
            .cmp(&self.wake)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.wake == other.wake && self.seq == other.seq
    }
}

impl Eq for Delayed {}

/// Ready queues and limits of one source
struct Lane {
    details: VecDeque<CrawlRequest>,
    lists: VecDeque<CrawlRequest>,
    pacing: SourcePacing,
    semaphore: Arc<Semaphore>,
}

impl Lane {
    fn is_empty(&self) -> bool {
        self.details.is_empty() && self.lists.is_empty()
    }

    fn len(&self) -> usize {
        self.details.len() + self.lists.len()
    }

    fn push(&mut self, request: CrawlRequest) {
        match request.kind {
            RequestKind::Detail(_) => self.details.push_back(request),
            RequestKind::List(_) => self.lists.push_back(request),
        }
    }

    fn pop(&mut self) -> Option<CrawlRequest> {
        self.details.pop_front().or_else(|| self.lists.pop_front())
    }
}

/// A request admitted for execution with its permits
///
/// Dropping the dispatch releases the source and global slots.
pub struct Dispatch {
    pub request: CrawlRequest,
    _lane_permit: OwnedSemaphorePermit,
    _global_permit: OwnedSemaphorePermit,
}

impl Dispatch {
    /// Releases both slots and returns the request
    pub fn into_request(self) -> CrawlRequest {
        self.request
    }
}

/// Scheduler admitting requests under pacing and concurrency limits
pub struct Scheduler {
    lanes: Vec<Lane>,
    delayed: BinaryHeap<Delayed>,
    global_semaphore: Arc<Semaphore>,
    cursor: usize,
    seq: u64,
    closed: bool,
}

impl Scheduler {
    /// Creates a scheduler with a global in-flight cap
    pub fn new(global_concurrency: usize) -> Self {
        Self {
            lanes: Vec::new(),
            delayed: BinaryHeap::new(),
            global_semaphore: Arc::new(Semaphore::new(global_concurrency.max(1))),
            cursor: 0,
            seq: 0,
            closed: false,
        }
    }

    /// Registers a source and returns its lane index
    ///
    /// # Arguments
    ///
    /// * `concurrency` - Maximum requests in flight for this source
    /// * `min_delay` - Minimum time between two requests to this source
    pub fn add_lane(&mut self, concurrency: usize, min_delay: Duration) -> usize {
        self.lanes.push(Lane {
            details: VecDeque::new(),
            lists: VecDeque::new(),
            pacing: SourcePacing::new(min_delay),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
        });
        self.lanes.len() - 1
    }

    /// Queues a request for immediate dispatch
    ///
    /// Returns the request back if the scheduler is closed.
    pub fn enqueue(&mut self, request: CrawlRequest) -> Result<(), CrawlRequest> {
        if self.closed || request.lane >= self.lanes.len() {
            return Err(request);
        }
        self.lanes[request.lane].push(request);
        Ok(())
    }

    /// Queues a request that may not run before `wake`
    pub fn enqueue_at(&mut self, request: CrawlRequest, wake: Instant) -> Result<(), CrawlRequest> {
        if self.closed || request.lane >= self.lanes.len() {
            return Err(request);
        }
        self.seq += 1;
        self.delayed.push(Delayed {
            wake,
            seq: self.seq,
            request,
        });
        Ok(())
    }

    /// Moves delayed requests whose deadline passed into their lanes
    fn promote_due(&mut self, now: Instant) {
        while self.delayed.peek().map_or(false, |d| d.wake <= now) {
            if let Some(delayed) = self.delayed.pop() {
                let lane = delayed.request.lane;
                self.lanes[lane].push(delayed.request);
            }
        }
    }

    /// Returns the next request that can run at `now`
    ///
    /// Lanes are visited round-robin starting after the last lane served. A
    /// lane is skipped while its pacing delay runs or its slots are taken.
    pub fn next_ready(&mut self, now: Instant) -> Option<Dispatch> {
        if self.closed {
            return None;
        }
        self.promote_due(now);

        let count = self.lanes.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let lane = &mut self.lanes[index];

            if lane.is_empty() || !lane.pacing.can_request(now) {
                continue;
            }

            let lane_permit = match Arc::clone(&lane.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => continue,
            };
            let global_permit = Arc::clone(&self.global_semaphore).try_acquire_owned().ok()?;

            let request = lane.pop()?;
            lane.pacing.record_request(now);
            self.cursor = index + 1;

            tracing::trace!("Dispatching {:?} on lane {}", request.kind, index);
            return Some(Dispatch {
                request,
                _lane_permit: lane_permit,
                _global_permit: global_permit,
            });
        }

        None
    }

    /// Earliest instant after `now` at which a queued request could become ready
    ///
    /// Requests blocked only by concurrency slots do not contribute; they
    /// become ready when a running request finishes. Delayed requests
    /// already due are moved into their lanes first.
    pub fn next_wakeup(&mut self, now: Instant) -> Option<Instant> {
        self.promote_due(now);
        if self.global_semaphore.available_permits() == 0 {
            return self.delayed.peek().map(|d| d.wake);
        }

        let paced = self
            .lanes
            .iter()
            .filter(|lane| !lane.is_empty() && lane.semaphore.available_permits() > 0)
            .filter_map(|lane| lane.pacing.next_allowed(now));
        let delayed = self.delayed.peek().map(|d| d.wake);

        paced.chain(delayed).min()
    }

    /// Removes queued requests of one lane matching `predicate`
    ///
    /// Returns the removed requests so the caller can account for them.
    pub fn purge<F>(&mut self, lane: usize, mut predicate: F) -> Vec<CrawlRequest>
    where
        F: FnMut(&CrawlRequest) -> bool,
    {
        let Some(target) = self.lanes.get_mut(lane) else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        for queue in [&mut target.details, &mut target.lists] {
            let (drop, keep): (VecDeque<_>, VecDeque<_>) = queue.drain(..).partition(|r| predicate(r));
            *queue = keep;
            removed.extend(drop);
        }

        let mut kept = BinaryHeap::with_capacity(self.delayed.len());
        for delayed in std::mem::take(&mut self.delayed) {
            if delayed.request.lane == lane && predicate(&delayed.request) {
                removed.push(delayed.request);
            } else {
                kept.push(delayed);
            }
        }
        self.delayed = kept;

        removed
    }

    /// Refuses further enqueues and returns every queued request
    pub fn close(&mut self) -> Vec<CrawlRequest> {
        self.closed = true;

        let mut abandoned = Vec::new();
        for lane in &mut self.lanes {
            abandoned.extend(lane.details.drain(..));
            abandoned.extend(lane.lists.drain(..));
        }
        abandoned.extend(self.delayed.drain().map(|d| d.request));
        abandoned
    }

    /// Number of queued and delayed requests
    pub fn pending(&self) -> usize {
        self.lanes.iter().map(Lane::len).sum::<usize>() + self.delayed.len()
    }

    /// Number of queued and delayed requests of one lane
    pub fn lane_pending(&self, lane: usize) -> usize {
        let queued = self.lanes.get(lane).map_or(0, Lane::len);
        queued
            + self
                .delayed
                .iter()
                .filter(|d| d.request.lane == lane)
                .count()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::request::{DetailRequest, ListRequest};
    use crate::item::DrugBase;

    fn list(lane: usize, page: u32) -> CrawlRequest {
        CrawlRequest::new(
            lane,
            RequestKind::List(ListRequest {
                traversal: 0,
                keyword: None,
                page,
                cursor: None,
            }),
        )
    }

    fn detail(lane: usize, key: &str) -> CrawlRequest {
        CrawlRequest::new(
            lane,
            RequestKind::Detail(DetailRequest {
                drug: Arc::new(DrugBase::from_key(key)),
                page: 1,
                list_page: 1,
                parent_event_id: None,
            }),
        )
    }

    #[test]
    fn test_empty_scheduler() {
        let mut scheduler = Scheduler::new(4);
        scheduler.add_lane(2, Duration::ZERO);

        assert!(scheduler.is_idle());
        assert!(scheduler.next_ready(Instant::now()).is_none());
        assert!(scheduler.next_wakeup(Instant::now()).is_none());
    }

    #[test]
    fn test_details_before_lists() {
        let mut scheduler = Scheduler::new(4);
        let lane = scheduler.add_lane(4, Duration::ZERO);
        scheduler.enqueue(list(lane, 2)).unwrap();
        scheduler.enqueue(detail(lane, "A1")).unwrap();

        let now = Instant::now();
        let first = scheduler.next_ready(now).unwrap();
        assert!(matches!(first.request.kind, RequestKind::Detail(_)));
        let second = scheduler.next_ready(now).unwrap();
        assert_eq!(second.request.page(), 2);
    }

    #[test]
    fn test_lane_concurrency_cap() {
        let mut scheduler = Scheduler::new(10);
        let lane = scheduler.add_lane(1, Duration::ZERO);
        scheduler.enqueue(list(lane, 1)).unwrap();
        scheduler.enqueue(list(lane, 2)).unwrap();

        let now = Instant::now();
        let first = scheduler.next_ready(now).unwrap();
        assert!(scheduler.next_ready(now).is_none());

        drop(first);
        assert!(scheduler.next_ready(now).is_some());
    }

    #[test]
    fn test_global_concurrency_cap() {
        let mut scheduler = Scheduler::new(1);
        let a = scheduler.add_lane(4, Duration::ZERO);
        let b = scheduler.add_lane(4, Duration::ZERO);
        scheduler.enqueue(list(a, 1)).unwrap();
        scheduler.enqueue(list(b, 1)).unwrap();

        let now = Instant::now();
        let held = scheduler.next_ready(now).unwrap();
        assert!(scheduler.next_ready(now).is_none());
        assert_eq!(scheduler.pending(), 1);

        drop(held);
        assert!(scheduler.next_ready(now).is_some());
    }

    #[test]
    fn test_round_robin_across_lanes() {
        let mut scheduler = Scheduler::new(10);
        let a = scheduler.add_lane(10, Duration::ZERO);
        let b = scheduler.add_lane(10, Duration::ZERO);
        for page in 1..=3 {
            scheduler.enqueue(list(a, page)).unwrap();
            scheduler.enqueue(list(b, page)).unwrap();
        }

        let now = Instant::now();
        let mut order = Vec::new();
        let mut held = Vec::new();
        while let Some(dispatch) = scheduler.next_ready(now) {
            order.push(dispatch.request.lane);
            held.push(dispatch);
        }
        assert_eq!(order, vec![a, b, a, b, a, b]);
    }

    #[test]
    fn test_pacing_delays_next_request() {
        let mut scheduler = Scheduler::new(10);
        let lane = scheduler.add_lane(10, Duration::from_millis(500));
        scheduler.enqueue(list(lane, 1)).unwrap();
        scheduler.enqueue(list(lane, 2)).unwrap();

        let now = Instant::now();
        let _first = scheduler.next_ready(now).unwrap();
        assert!(scheduler.next_ready(now).is_none());
        assert_eq!(
            scheduler.next_wakeup(now),
            Some(now + Duration::from_millis(500))
        );
        assert!(scheduler
            .next_ready(now + Duration::from_millis(500))
            .is_some());
    }

    #[test]
    fn test_zero_delay_lane_reports_no_past_wakeup() {
        let mut scheduler = Scheduler::new(10);
        let lane = scheduler.add_lane(10, Duration::ZERO);
        scheduler.enqueue(list(lane, 1)).unwrap();

        let now = Instant::now();
        let _held = scheduler.next_ready(now).unwrap();
        scheduler.enqueue(list(lane, 2)).unwrap();

        // Ready right away, so there is nothing to wait for
        let later = now + Duration::from_millis(5);
        assert!(scheduler.next_wakeup(later).is_none());
        assert!(scheduler.next_ready(later).is_some());
    }

    #[test]
    fn test_slot_blocked_lane_has_no_wakeup() {
        let mut scheduler = Scheduler::new(10);
        let lane = scheduler.add_lane(1, Duration::from_millis(100));
        scheduler.enqueue(list(lane, 1)).unwrap();
        scheduler.enqueue(list(lane, 2)).unwrap();

        let now = Instant::now();
        let held = scheduler.next_ready(now).unwrap();
        assert!(scheduler.next_wakeup(now).is_none());
        assert!(scheduler
            .next_wakeup(now + Duration::from_secs(1))
            .is_none());

        drop(held);
        assert_eq!(
            scheduler.next_wakeup(now),
            Some(now + Duration::from_millis(100))
        );
    }

    #[test]
    fn test_global_cap_only_wakes_for_delayed() {
        let mut scheduler = Scheduler::new(1);
        let a = scheduler.add_lane(4, Duration::ZERO);
        let b = scheduler.add_lane(4, Duration::ZERO);
        scheduler.enqueue(list(a, 1)).unwrap();
        scheduler.enqueue(list(b, 1)).unwrap();

        let now = Instant::now();
        let _held = scheduler.next_ready(now).unwrap();
        assert!(scheduler.next_wakeup(now).is_none());

        let wake = now + Duration::from_secs(1);
        scheduler.enqueue_at(list(a, 2), wake).unwrap();
        assert_eq!(scheduler.next_wakeup(now), Some(wake));
    }

    #[test]
    fn test_dispatch_holds_slot_until_released() {
        let mut scheduler = Scheduler::new(10);
        let lane = scheduler.add_lane(1, Duration::ZERO);
        scheduler.enqueue(list(lane, 1)).unwrap();
        scheduler.enqueue(list(lane, 2)).unwrap();

        let now = Instant::now();
        let dispatch = scheduler.next_ready(now).unwrap();
        assert!(scheduler.next_ready(now).is_none());

        let request = dispatch.into_request();
        assert_eq!(request.page(), 1);
        assert!(scheduler.next_ready(now).is_some());
    }

    #[test]
    fn test_delayed_request_waits_for_deadline() {
        let mut scheduler = Scheduler::new(10);
        let lane = scheduler.add_lane(10, Duration::ZERO);
        let now = Instant::now();
        let wake = now + Duration::from_secs(2);
        scheduler.enqueue_at(list(lane, 1), wake).unwrap();

        assert!(scheduler.next_ready(now).is_none());
        assert_eq!(scheduler.next_wakeup(now), Some(wake));
        assert!(!scheduler.is_idle());

        let dispatch = scheduler.next_ready(wake).unwrap();
        assert_eq!(dispatch.request.page(), 1);
    }

    #[test]
    fn test_close_refuses_and_drains() {
        let mut scheduler = Scheduler::new(10);
        let lane = scheduler.add_lane(10, Duration::ZERO);
        scheduler.enqueue(list(lane, 1)).unwrap();
        scheduler
            .enqueue_at(list(lane, 2), Instant::now() + Duration::from_secs(5))
            .unwrap();

        let abandoned = scheduler.close();
        assert_eq!(abandoned.len(), 2);
        assert!(scheduler.is_idle());
        assert!(scheduler.enqueue(list(lane, 3)).is_err());
        assert!(scheduler.next_ready(Instant::now()).is_none());
    }

    #[test]
    fn test_purge_removes_matching_requests() {
        let mut scheduler = Scheduler::new(10);
        let a = scheduler.add_lane(10, Duration::ZERO);
        let b = scheduler.add_lane(10, Duration::ZERO);
        scheduler.enqueue(list(a, 1)).unwrap();
        scheduler.enqueue(list(a, 2)).unwrap();
        scheduler.enqueue(detail(a, "K1")).unwrap();
        scheduler
            .enqueue_at(list(a, 3), Instant::now() + Duration::from_secs(1))
            .unwrap();
        scheduler.enqueue(list(b, 1)).unwrap();

        let removed = scheduler.purge(a, |r| matches!(r.kind, RequestKind::List(_)));
        assert_eq!(removed.len(), 3);
        assert!(removed.iter().all(|r| r.lane == a));
        assert_eq!(scheduler.lane_pending(a), 1);
        assert_eq!(scheduler.lane_pending(b), 1);
    }
}
