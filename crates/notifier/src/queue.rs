//! Dispatch queue — one bounded FIFO lane per channel.
//!
//! Each lane enforces its channel's concurrency limit: a request is only
//! handed out while fewer than `concurrency_limit` sends are in flight. The
//! returned [`InFlight`] lease frees the slot when dropped. Cancelling
//! removes the entry at once.
//!
//! Entries are ordered by a per-lane logical submission clock, with the
//! request id as tie-breaker. Retries are reinserted at the back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use herald_common::types::{Channel, ChannelState, NotificationRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("{channel} queue is full ({capacity} pending)")]
    QueueFull { channel: Channel, capacity: usize },

    #[error("no queue configured for channel {0}")]
    UnknownChannel(Channel),

    #[error("{0} queue is closed")]
    Closed(Channel),
}

/// Per-lane state, guarded by the lane lock.
struct LaneState {
    channel_state: ChannelState,
    entries: BTreeMap<(u64, Uuid), NotificationRequest>,
    /// Sequence number of each queued id, the key half `entries` is sorted by.
    index: HashMap<Uuid, u64>,
    next_seq: u64,
    closed: bool,
}

struct Lane {
    capacity: usize,
    state: Mutex<LaneState>,
    notify: Notify,
}

impl Lane {
    fn insert(&self, request: NotificationRequest, enforce_capacity: bool) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let channel = state.channel_state.channel;
        if state.closed {
            return Err(QueueError::Closed(channel));
        }
        if enforce_capacity && state.entries.len() >= self.capacity {
            return Err(QueueError::QueueFull {
                channel,
                capacity: self.capacity,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        if let Some(stale) = state.index.insert(request.id, seq) {
            state.entries.remove(&(stale, request.id));
        }
        state.entries.insert((seq, request.id), request);
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    /// Pop the oldest entry if a concurrency slot is free.
    fn try_take(&self) -> Take {
        let mut state = self.state.lock();
        if state.closed {
            return Take::Closed;
        }
        if state.channel_state.in_flight >= state.channel_state.concurrency_limit {
            return Take::Empty;
        }

        match state.entries.pop_first() {
            Some((_, request)) => {
                state.index.remove(&request.id);
                state.channel_state.in_flight += 1;
                Take::Ready(request)
            }
            None => Take::Empty,
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.channel_state.in_flight = state.channel_state.in_flight.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }
}

enum Take {
    Ready(NotificationRequest),
    Empty,
    Closed,
}

/// A request handed to a worker. Holds one concurrency slot of its lane.
pub struct InFlight {
    request: NotificationRequest,
    lane: Arc<Lane>,
}

impl InFlight {
    pub fn request(&self) -> &NotificationRequest {
        &self.request
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.lane.release();
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight")
            .field("request_id", &self.request.id)
            .field("channel", &self.request.channel)
            .finish()
    }
}

/// Bounded per-channel queues with concurrency limits.
pub struct DispatchQueue {
    lanes: HashMap<Channel, Arc<Lane>>,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self {
            lanes: HashMap::new(),
        }
    }

    /// Register a lane for `channel`. Replaces any existing lane.
    pub fn add_lane(&mut self, channel: Channel, concurrency_limit: usize, capacity: usize) {
        let lane = Lane {
            capacity,
            state: Mutex::new(LaneState {
                channel_state: ChannelState {
                    channel,
                    concurrency_limit: concurrency_limit.max(1),
                    in_flight: 0,
                },
                entries: BTreeMap::new(),
                index: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            notify: Notify::new(),
        };
        self.lanes.insert(channel, Arc::new(lane));
    }

    pub fn has_lane(&self, channel: Channel) -> bool {
        self.lanes.contains_key(&channel)
    }

    fn lane(&self, channel: Channel) -> Result<&Arc<Lane>, QueueError> {
        self.lanes
            .get(&channel)
            .ok_or(QueueError::UnknownChannel(channel))
    }

    /// Enqueue a newly submitted request. Fails without side effects when
    /// the lane's backlog is at capacity.
    pub fn enqueue(&self, request: NotificationRequest) -> Result<(), QueueError> {
        self.lane(request.channel)?.insert(request, true)
    }

    /// Reinsert a request for another attempt. Not subject to capacity.
    pub fn requeue(&self, request: NotificationRequest) -> Result<(), QueueError> {
        self.lane(request.channel)?.insert(request, false)
    }

    /// Wait for the next request on `channel`. Returns `None` once the lane
    /// is closed or does not exist.
    pub async fn dequeue(&self, channel: Channel) -> Option<InFlight> {
        let lane = self.lanes.get(&channel)?;
        loop {
            let notified = lane.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match lane.try_take() {
                Take::Ready(request) => {
                    return Some(InFlight {
                        request,
                        lane: Arc::clone(lane),
                    });
                }
                Take::Closed => return None,
                Take::Empty => notified.await,
            }
        }
    }

    /// Remove a queued request. Returns `false` if it is not queued.
    pub fn cancel(&self, channel: Channel, id: Uuid) -> bool {
        let Some(lane) = self.lanes.get(&channel) else {
            return false;
        };
        let mut state = lane.state.lock();
        let Some(seq) = state.index.remove(&id) else {
            return false;
        };
        state.entries.remove(&(seq, id)).is_some()
    }

    /// Number of queued requests.
    pub fn backlog(&self, channel: Channel) -> usize {
        self.lanes
            .get(&channel)
            .map(|lane| lane.state.lock().entries.len())
            .unwrap_or(0)
    }

    pub fn channel_state(&self, channel: Channel) -> Option<ChannelState> {
        self.lanes
            .get(&channel)
            .map(|lane| lane.state.lock().channel_state)
    }

    /// Ids in dequeue order.
    pub fn snapshot(&self, channel: Channel) -> Vec<Uuid> {
        self.lanes
            .get(&channel)
            .map(|lane| lane.state.lock().entries.keys().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    /// Close every lane and wake all waiting workers.
    pub fn close(&self) {
        for lane in self.lanes.values() {
            lane.state.lock().closed = true;
            lane.notify.notify_waiters();
        }
    }
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::NotificationPayload;
    use std::time::Duration;

    fn request(channel: Channel) -> NotificationRequest {
        NotificationRequest::new(channel, "+15550100", NotificationPayload::new("t", "b"))
    }

    fn queue(limit: usize, capacity: usize) -> DispatchQueue {
        let mut q = DispatchQueue::new();
        q.add_lane(Channel::Sms, limit, capacity);
        q
    }

    #[tokio::test]
    async fn test_fifo_within_channel() {
        let q = queue(10, 10);
        let reqs: Vec<_> = (0..5).map(|_| request(Channel::Sms)).collect();
        for r in &reqs {
            q.enqueue(r.clone()).unwrap();
        }
        for r in &reqs {
            let lease = q.dequeue(Channel::Sms).await.unwrap();
            assert_eq!(lease.request().id, r.id);
        }
    }

    #[test]
    fn test_queue_full_does_not_mutate() {
        let q = queue(1, 2);
        q.enqueue(request(Channel::Sms)).unwrap();
        q.enqueue(request(Channel::Sms)).unwrap();
        let before = q.snapshot(Channel::Sms);

        let err = q.enqueue(request(Channel::Sms)).unwrap_err();
        assert_eq!(
            err,
            QueueError::QueueFull {
                channel: Channel::Sms,
                capacity: 2
            }
        );
        assert_eq!(q.snapshot(Channel::Sms), before);
        assert_eq!(q.backlog(Channel::Sms), 2);
    }

    #[test]
    fn test_requeue_bypasses_capacity() {
        let q = queue(1, 1);
        q.enqueue(request(Channel::Sms)).unwrap();
        q.requeue(request(Channel::Sms)).unwrap();
        assert_eq!(q.backlog(Channel::Sms), 2);
    }

    #[test]
    fn test_unknown_channel() {
        let q = queue(1, 1);
        assert_eq!(
            q.enqueue(request(Channel::Email)).unwrap_err(),
            QueueError::UnknownChannel(Channel::Email)
        );
    }

    #[tokio::test]
    async fn test_concurrency_limit_blocks_until_release() {
        let q = queue(1, 10);
        q.enqueue(request(Channel::Sms)).unwrap();
        q.enqueue(request(Channel::Sms)).unwrap();

        let first = q.dequeue(Channel::Sms).await.unwrap();
        assert_eq!(q.channel_state(Channel::Sms).unwrap().in_flight, 1);

        let blocked = tokio::time::timeout(Duration::from_millis(50), q.dequeue(Channel::Sms)).await;
        assert!(blocked.is_err(), "second dequeue must wait for a free slot");

        drop(first);
        assert_eq!(q.channel_state(Channel::Sms).unwrap().in_flight, 0);
        let second = q.dequeue(Channel::Sms).await.unwrap();
        assert_eq!(q.channel_state(Channel::Sms).unwrap().in_flight, 1);
        drop(second);
    }

    #[tokio::test]
    async fn test_cancelled_entries_are_skipped() {
        let q = queue(10, 2);
        let a = request(Channel::Sms);
        let b = request(Channel::Sms);
        q.enqueue(a.clone()).unwrap();
        q.enqueue(b.clone()).unwrap();

        assert!(q.cancel(Channel::Sms, a.id));
        assert!(!q.cancel(Channel::Sms, a.id));
        assert_eq!(q.backlog(Channel::Sms), 1);
        // Cancelled entries free their capacity slot
        q.enqueue(request(Channel::Sms)).unwrap();

        let lease = q.dequeue(Channel::Sms).await.unwrap();
        assert_eq!(lease.request().id, b.id);
    }

    #[test]
    fn test_cancel_on_stalled_lane_frees_storage() {
        let q = queue(1, 4);
        for _ in 0..1_000 {
            let r = request(Channel::Sms);
            q.enqueue(r.clone()).unwrap();
            assert!(q.cancel(Channel::Sms, r.id));
        }

        assert_eq!(q.backlog(Channel::Sms), 0);
        assert!(q.snapshot(Channel::Sms).is_empty());
        let lane = &q.lanes[&Channel::Sms];
        let state = lane.state.lock();
        assert!(state.entries.is_empty());
        assert!(state.index.is_empty());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let q = Arc::new(queue(1, 1));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue(Channel::Sms).await.is_none() })
        };
        tokio::task::yield_now().await;
        q.close();
        assert!(waiter.await.unwrap());
        assert!(matches!(
            q.enqueue(request(Channel::Sms)),
            Err(QueueError::Closed(Channel::Sms))
        ));
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiting_worker() {
        let q = Arc::new(queue(1, 4));
        let waiter = {
            let q = Arc::clone(&q);
            tokio::spawn(async move { q.dequeue(Channel::Sms).await.map(|l| l.request().id) })
        };
        tokio::task::yield_now().await;
        let r = request(Channel::Sms);
        q.enqueue(r.clone()).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(r.id));
    }
}
