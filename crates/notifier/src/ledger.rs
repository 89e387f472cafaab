//! In-memory delivery ledger.
//!
//! Tracks the state machine and the append-only attempt history of every
//! request. Active requests move to a bounded archive once they reach a
//! terminal state; the archive keeps their history for status queries.
//!
//! Every state change returns the [`DeliveryEvent`] describing it so the
//! caller can forward it downstream.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use herald_common::types::{
    AttemptOutcome, Channel, DeliveryAttempt, DeliveryEvent, DeliveryState, ErrorKind,
    NotificationRequest,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("request {0} already exists")]
    Duplicate(Uuid),

    #[error("request {0} is not active")]
    NotActive(Uuid),

    #[error("request {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: DeliveryState,
        to: DeliveryState,
    },
}

#[derive(Debug)]
struct Record {
    channel: Channel,
    state: DeliveryState,
    attempts: Vec<DeliveryAttempt>,
}

impl Record {
    fn event(
        &self,
        id: Uuid,
        attempt_number: Option<u32>,
        error_kind: Option<ErrorKind>,
        retry_after: Option<Duration>,
    ) -> DeliveryEvent {
        DeliveryEvent {
            request_id: id,
            channel: self.channel,
            state: self.state,
            attempt_number,
            error_kind,
            retry_after,
            at: Utc::now(),
        }
    }
}

/// How a pending attempt ended.
#[derive(Debug, Clone)]
pub enum Resolution {
    Sent,
    /// Failed; another attempt follows after `retry_after`.
    Retry {
        kind: ErrorKind,
        detail: String,
        retry_after: Duration,
    },
    Abandon {
        kind: ErrorKind,
        detail: String,
    },
}

pub struct DeliveryLedger {
    active: HashMap<Uuid, Record>,
    archive: HashMap<Uuid, Record>,
    archive_order: VecDeque<Uuid>,
    archive_capacity: usize,
}

impl DeliveryLedger {
    pub fn new(archive_capacity: usize) -> Self {
        Self {
            active: HashMap::new(),
            archive: HashMap::new(),
            archive_order: VecDeque::new(),
            archive_capacity,
        }
    }

    /// Record a new submission and move it to `Queued`.
    ///
    /// Returns the `Submitted` and `Queued` events.
    pub fn register(
        &mut self,
        request: &NotificationRequest,
    ) -> Result<[DeliveryEvent; 2], LedgerError> {
        if self.active.contains_key(&request.id) || self.archive.contains_key(&request.id) {
            return Err(LedgerError::Duplicate(request.id));
        }

        let mut record = Record {
            channel: request.channel,
            state: DeliveryState::Submitted,
            attempts: Vec::new(),
        };
        let submitted = record.event(request.id, None, None, None);
        record.state = DeliveryState::Queued;
        let queued = record.event(request.id, None, None, None);

        self.active.insert(request.id, record);
        Ok([submitted, queued])
    }

    /// Drop a request whose enqueue was rejected. Leaves no trace.
    pub fn forget(&mut self, id: Uuid) {
        self.active.remove(&id);
    }

    /// Start a new attempt: `Queued` → `InFlight`, append a pending attempt.
    pub fn begin_attempt(&mut self, id: Uuid) -> Result<(u32, DeliveryEvent), LedgerError> {
        let record = self.transition(id, DeliveryState::InFlight)?;
        let attempt_number = record.attempts.len() as u32 + 1;
        record.attempts.push(DeliveryAttempt {
            request_id: id,
            attempt_number,
            started_at: Utc::now(),
            outcome: AttemptOutcome::Pending,
            error_kind: None,
            detail: None,
        });
        let event = record.event(id, Some(attempt_number), None, None);
        Ok((attempt_number, event))
    }

    /// Close the pending attempt of an in-flight request.
    pub fn resolve_attempt(
        &mut self,
        id: Uuid,
        resolution: Resolution,
    ) -> Result<DeliveryEvent, LedgerError> {
        let (next, outcome, kind, detail, retry_after) = match resolution {
            Resolution::Sent => (DeliveryState::Sent, AttemptOutcome::Sent, None, None, None),
            Resolution::Retry {
                kind,
                detail,
                retry_after,
            } => (
                DeliveryState::RetryScheduled,
                AttemptOutcome::Failed,
                Some(kind),
                Some(detail),
                Some(retry_after),
            ),
            Resolution::Abandon { kind, detail } => (
                DeliveryState::Abandoned,
                AttemptOutcome::Abandoned,
                Some(kind),
                Some(detail),
                None,
            ),
        };

        let record = self.transition(id, next)?;
        let attempt_number = match record.attempts.last_mut() {
            Some(attempt) if attempt.outcome == AttemptOutcome::Pending => {
                attempt.outcome = outcome;
                attempt.error_kind = kind;
                attempt.detail = detail;
                attempt.attempt_number
            }
            _ => return Err(LedgerError::NotActive(id)),
        };
        let event = record.event(id, Some(attempt_number), kind, retry_after);

        if next.is_terminal() {
            self.archive_request(id);
        }
        Ok(event)
    }

    /// `RetryScheduled` → `Queued` once the backoff elapsed.
    pub fn requeue(&mut self, id: Uuid) -> Result<DeliveryEvent, LedgerError> {
        let record = self.transition(id, DeliveryState::Queued)?;
        let attempt_number = record.attempts.last().map(|a| a.attempt_number);
        Ok(record.event(id, attempt_number, None, None))
    }

    /// Abandon a request that has not started sending.
    ///
    /// Appends an `Abandoned` attempt with `ErrorKind::Cancelled`. Returns
    /// the event and the state the request was cancelled from.
    pub fn cancel(&mut self, id: Uuid) -> Result<(DeliveryState, DeliveryEvent), LedgerError> {
        let previous = self
            .active
            .get(&id)
            .map(|r| r.state)
            .ok_or(LedgerError::NotActive(id))?;
        if !matches!(
            previous,
            DeliveryState::Queued | DeliveryState::RetryScheduled
        ) {
            return Err(LedgerError::InvalidTransition {
                id,
                from: previous,
                to: DeliveryState::Abandoned,
            });
        }

        let record = self.transition(id, DeliveryState::Abandoned)?;
        let attempt_number = record.attempts.len() as u32 + 1;
        record.attempts.push(DeliveryAttempt {
            request_id: id,
            attempt_number,
            started_at: Utc::now(),
            outcome: AttemptOutcome::Abandoned,
            error_kind: Some(ErrorKind::Cancelled),
            detail: Some("cancelled before send".to_string()),
        });
        let event = record.event(id, Some(attempt_number), Some(ErrorKind::Cancelled), None);
        self.archive_request(id);
        Ok((previous, event))
    }

    pub fn state(&self, id: Uuid) -> Option<DeliveryState> {
        self.active
            .get(&id)
            .or_else(|| self.archive.get(&id))
            .map(|r| r.state)
    }

    pub fn attempts(&self, id: Uuid) -> Option<Vec<DeliveryAttempt>> {
        self.active
            .get(&id)
            .or_else(|| self.archive.get(&id))
            .map(|r| r.attempts.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn archived_count(&self) -> usize {
        self.archive.len()
    }

    fn transition(&mut self, id: Uuid, next: DeliveryState) -> Result<&mut Record, LedgerError> {
        let record = self.active.get_mut(&id).ok_or(LedgerError::NotActive(id))?;
        if !record.state.can_transition_to(next) {
            return Err(LedgerError::InvalidTransition {
                id,
                from: record.state,
                to: next,
            });
        }
        record.state = next;
        Ok(record)
    }

    fn archive_request(&mut self, id: Uuid) {
        let Some(record) = self.active.remove(&id) else {
            return;
        };
        self.archive.insert(id, record);
        self.archive_order.push_back(id);

        while self.archive_order.len() > self.archive_capacity {
            if let Some(oldest) = self.archive_order.pop_front() {
                self.archive.remove(&oldest);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_common::types::NotificationPayload;

    fn request() -> NotificationRequest {
        NotificationRequest::new(Channel::Email, "a@example.com", NotificationPayload::new("t", "b"))
    }

    fn retry(kind: ErrorKind) -> Resolution {
        Resolution::Retry {
            kind,
            detail: "boom".into(),
            retry_after: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_register_emits_submitted_then_queued() {
        let mut ledger = DeliveryLedger::new(10);
        let req = request();
        let [a, b] = ledger.register(&req).unwrap();
        assert_eq!(a.state, DeliveryState::Submitted);
        assert_eq!(b.state, DeliveryState::Queued);
        assert_eq!(ledger.state(req.id), Some(DeliveryState::Queued));
        assert_eq!(ledger.register(&req).unwrap_err(), LedgerError::Duplicate(req.id));
    }

    #[test]
    fn test_attempt_numbers_increase_by_one() {
        let mut ledger = DeliveryLedger::new(10);
        let req = request();
        ledger.register(&req).unwrap();

        for expected in 1..=3 {
            let (n, _) = ledger.begin_attempt(req.id).unwrap();
            assert_eq!(n, expected);
            ledger.resolve_attempt(req.id, retry(ErrorKind::Transient)).unwrap();
            ledger.requeue(req.id).unwrap();
        }
        ledger.begin_attempt(req.id).unwrap();
        let event = ledger.resolve_attempt(req.id, Resolution::Sent).unwrap();
        assert_eq!(event.state, DeliveryState::Sent);
        assert_eq!(event.attempt_number, Some(4));

        let attempts = ledger.attempts(req.id).unwrap();
        let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        let terminal = attempts.iter().filter(|a| a.outcome.is_terminal()).count();
        assert_eq!(terminal, 1);
        assert_eq!(ledger.active_count(), 0);
        assert_eq!(ledger.archived_count(), 1);
    }

    #[test]
    fn test_abandon_preserves_error_kind() {
        let mut ledger = DeliveryLedger::new(10);
        let req = request();
        ledger.register(&req).unwrap();
        ledger.begin_attempt(req.id).unwrap();
        let event = ledger
            .resolve_attempt(
                req.id,
                Resolution::Abandon {
                    kind: ErrorKind::Permanent,
                    detail: "invalid recipient".into(),
                },
            )
            .unwrap();
        assert_eq!(event.error_kind, Some(ErrorKind::Permanent));

        let attempts = ledger.attempts(req.id).unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].outcome, AttemptOutcome::Abandoned);
        assert_eq!(attempts[0].error_kind, Some(ErrorKind::Permanent));
    }

    #[test]
    fn test_cannot_send_without_begin() {
        let mut ledger = DeliveryLedger::new(10);
        let req = request();
        ledger.register(&req).unwrap();
        assert!(matches!(
            ledger.resolve_attempt(req.id, Resolution::Sent),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_cancel_only_before_in_flight() {
        let mut ledger = DeliveryLedger::new(10);
        let queued = request();
        ledger.register(&queued).unwrap();
        let (prev, event) = ledger.cancel(queued.id).unwrap();
        assert_eq!(prev, DeliveryState::Queued);
        assert_eq!(event.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(ledger.state(queued.id), Some(DeliveryState::Abandoned));
        // A worker that already dequeued it must not start it
        assert!(ledger.begin_attempt(queued.id).is_err());

        let in_flight = request();
        ledger.register(&in_flight).unwrap();
        ledger.begin_attempt(in_flight.id).unwrap();
        assert!(matches!(
            ledger.cancel(in_flight.id),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_cancel_during_backoff_blocks_requeue() {
        let mut ledger = DeliveryLedger::new(10);
        let req = request();
        ledger.register(&req).unwrap();
        ledger.begin_attempt(req.id).unwrap();
        ledger.resolve_attempt(req.id, retry(ErrorKind::Timeout)).unwrap();

        let (prev, _) = ledger.cancel(req.id).unwrap();
        assert_eq!(prev, DeliveryState::RetryScheduled);
        assert_eq!(ledger.requeue(req.id), Err(LedgerError::NotActive(req.id)));

        let attempts = ledger.attempts(req.id).unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].attempt_number, 2);
        assert_eq!(attempts[1].outcome, AttemptOutcome::Abandoned);
    }

    #[test]
    fn test_archive_is_bounded() {
        let mut ledger = DeliveryLedger::new(2);
        let reqs: Vec<_> = (0..3).map(|_| request()).collect();
        for req in &reqs {
            ledger.register(req).unwrap();
            ledger.cancel(req.id).unwrap();
        }
        assert_eq!(ledger.archived_count(), 2);
        assert!(ledger.attempts(reqs[0].id).is_none());
        assert!(ledger.attempts(reqs[2].id).is_some());
    }

    #[test]
    fn test_forget_removes_rejected_submission() {
        let mut ledger = DeliveryLedger::new(2);
        let req = request();
        ledger.register(&req).unwrap();
        ledger.forget(req.id);
        assert!(ledger.state(req.id).is_none());
        assert!(ledger.register(&req).is_ok());
    }
}
