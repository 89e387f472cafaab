//! Delivery coordinator — drives every request through its state machine.
//!
//! ```text
//! Submitted → Queued → InFlight → Sent
//!                ↑          ├───→ RetryScheduled ─(backoff)─┐
//!                │          └───→ Abandoned                 │
//!                └──────────────────────────────────────────┘
//! ```
//!
//! Each channel gets a queue lane, a connection supervisor and a fixed pool
//! of workers. Workers wait for the supervisor to report the transport up,
//! take the next request off the lane, and hand the outcome to the retry
//! policy. Every transition is recorded in the ledger and forwarded to the
//! configured event sinks, in the order it happened.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use herald_common::config::{ChannelLimits, DispatchConfig};
use herald_common::types::{
    Channel, ChannelState, DeliveryAttempt, DeliveryEvent, DeliveryState, NotificationRequest,
};

use crate::ledger::{DeliveryLedger, LedgerError, Resolution};
use crate::queue::{DispatchQueue, InFlight, QueueError};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::sink::EventSink;
use crate::supervisor::ConnectionSupervisor;
use crate::transport::{ChannelTransport, TransportError};

/// Why a submission was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("{channel} queue is full ({capacity} pending)")]
    QueueFull { channel: Channel, capacity: usize },

    #[error("channel {0} is not configured")]
    ChannelUnavailable(Channel),

    #[error("request {0} was already submitted")]
    Duplicate(Uuid),

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("request {0} not found")]
    NotFound(Uuid),

    #[error("request {id} is {state} and can no longer be cancelled")]
    NotCancellable { id: Uuid, state: DeliveryState },
}

struct ChannelRuntime {
    transport: Arc<dyn ChannelTransport>,
    supervisor: Arc<ConnectionSupervisor>,
    limits: ChannelLimits,
}

struct Inner {
    queue: DispatchQueue,
    /// Lock order: ledger before any queue lane.
    ledger: Mutex<DeliveryLedger>,
    policy: RetryPolicy,
    channels: HashMap<Channel, ChannelRuntime>,
    events: mpsc::UnboundedSender<DeliveryEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    accepting: AtomicBool,
}

/// Builds a [`DeliveryCoordinator`] from configuration, transports and sinks.
pub struct CoordinatorBuilder {
    config: DispatchConfig,
    transports: Vec<Arc<dyn ChannelTransport>>,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CoordinatorBuilder {
    /// Register the transport for its channel. A later transport for the
    /// same channel replaces the earlier one.
    pub fn transport(mut self, transport: Arc<dyn ChannelTransport>) -> Self {
        self.transports.retain(|t| t.channel() != transport.channel());
        self.transports.push(transport);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> DeliveryCoordinator {
        let mut queue = DispatchQueue::new();
        let mut channels = HashMap::new();

        for transport in self.transports {
            let channel = transport.channel();
            let limits = self.config.limits(channel);
            queue.add_lane(channel, limits.concurrency_limit, limits.queue_capacity);
            let supervisor = Arc::new(ConnectionSupervisor::new(
                transport.clone(),
                self.config.reconnect.clone(),
                self.config.heartbeat_interval,
            ));
            channels.insert(
                channel,
                ChannelRuntime {
                    transport,
                    supervisor,
                    limits,
                },
            );
        }

        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            queue,
            ledger: Mutex::new(DeliveryLedger::new(self.config.archive_capacity)),
            policy: RetryPolicy::new(self.config.retry),
            channels,
            events,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            accepting: AtomicBool::new(true),
        });

        DeliveryCoordinator {
            inner,
            sinks: self.sinks,
            pending_events: Mutex::new(Some(events_rx)),
            dispatcher: Mutex::new(None),
            events_done: CancellationToken::new(),
        }
    }
}

/// Entry point of the dispatch core.
pub struct DeliveryCoordinator {
    inner: Arc<Inner>,
    sinks: Vec<Arc<dyn EventSink>>,
    pending_events: Mutex<Option<mpsc::UnboundedReceiver<DeliveryEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    events_done: CancellationToken,
}

impl DeliveryCoordinator {
    pub fn builder(config: DispatchConfig) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            transports: Vec::new(),
            sinks: Vec::new(),
        }
    }

    /// Channels with a registered transport.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self.inner.channels.keys().copied().collect();
        channels.sort();
        channels
    }

    /// Spawn the event dispatcher, one supervisor and the worker pool per
    /// channel. Calling it again is a no-op.
    pub fn start(&self) {
        let Some(events_rx) = self.pending_events.lock().take() else {
            tracing::warn!("Delivery coordinator already started");
            return;
        };

        let dispatcher = tokio::spawn(dispatch_events(
            events_rx,
            self.sinks.clone(),
            self.events_done.clone(),
        ));
        *self.dispatcher.lock() = Some(dispatcher);

        for (channel, runtime) in &self.inner.channels {
            let supervisor = runtime.supervisor.clone();
            self.inner
                .tracker
                .spawn(supervisor.run(self.inner.shutdown.clone()));

            for worker_id in 0..runtime.limits.workers {
                self.inner
                    .tracker
                    .spawn(run_worker(self.inner.clone(), *channel, worker_id));
            }

            tracing::info!(
                channel = %channel,
                workers = runtime.limits.workers,
                concurrency_limit = runtime.limits.concurrency_limit,
                queue_capacity = runtime.limits.queue_capacity,
                send_timeout_ms = runtime.limits.send_timeout.as_millis() as u64,
                "Channel dispatch started"
            );
        }
    }

    /// Accept a request for delivery. Never blocks.
    pub fn submit(&self, request: NotificationRequest) -> Result<Uuid, SubmitError> {
        self.inner.submit(request)
    }

    /// Attempt history of a request, oldest first.
    pub fn get_status(&self, id: Uuid) -> Option<Vec<DeliveryAttempt>> {
        self.inner.ledger.lock().attempts(id)
    }

    pub fn state(&self, id: Uuid) -> Option<DeliveryState> {
        self.inner.ledger.lock().state(id)
    }

    /// Abandon a request that is queued or waiting for a retry.
    pub fn cancel(&self, id: Uuid) -> Result<(), CancelError> {
        self.inner.cancel(id)
    }

    pub fn channel_state(&self, channel: Channel) -> Option<ChannelState> {
        self.inner.queue.channel_state(channel)
    }

    /// Requests waiting in a channel's queue.
    pub fn backlog(&self, channel: Channel) -> usize {
        self.inner.queue.backlog(channel)
    }

    /// Requests that have not reached a terminal state.
    pub fn active_count(&self) -> usize {
        self.inner.ledger.lock().active_count()
    }

    pub fn is_available(&self, channel: Channel) -> bool {
        self.inner
            .channels
            .get(&channel)
            .is_some_and(|rt| rt.supervisor.is_available())
    }

    /// Stop intake, let in-flight sends finish, close every transport and
    /// flush outstanding events to the sinks.
    ///
    /// Requests still queued or waiting for a retry stay in their state.
    pub async fn shutdown(&self) {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Delivery coordinator shutting down");

        self.inner.shutdown.cancel();
        self.inner.queue.close();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        self.events_done.cancel();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Event dispatcher panicked");
            }
        }

        let ledger = self.inner.ledger.lock();
        tracing::info!(
            unfinished = ledger.active_count(),
            archived = ledger.archived_count(),
            "Delivery coordinator stopped"
        );
    }
}

impl Inner {
    fn emit(&self, event: DeliveryEvent) {
        // Receiver only goes away once the dispatcher has drained.
        let _ = self.events.send(event);
    }

    fn submit(&self, request: NotificationRequest) -> Result<Uuid, SubmitError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }
        let id = request.id;
        let channel = request.channel;
        if !self.queue.has_lane(channel) {
            return Err(SubmitError::ChannelUnavailable(channel));
        }

        let mut ledger = self.ledger.lock();
        let events = ledger
            .register(&request)
            .map_err(|_| SubmitError::Duplicate(id))?;

        match self.queue.enqueue(request) {
            Ok(()) => {
                for event in events {
                    self.emit(event);
                }
                tracing::debug!(request_id = %id, channel = %channel, "Request queued");
                Ok(id)
            }
            Err(err) => {
                ledger.forget(id);
                tracing::warn!(request_id = %id, channel = %channel, error = %err, "Request rejected");
                Err(match err {
                    QueueError::QueueFull { channel, capacity } => {
                        SubmitError::QueueFull { channel, capacity }
                    }
                    QueueError::UnknownChannel(channel) => SubmitError::ChannelUnavailable(channel),
                    QueueError::Closed(_) => SubmitError::ShuttingDown,
                })
            }
        }
    }

    fn cancel(&self, id: Uuid) -> Result<(), CancelError> {
        let mut ledger = self.ledger.lock();
        let (previous, event) = ledger.cancel(id).map_err(|e| match e {
            LedgerError::InvalidTransition { id, from, .. } => {
                CancelError::NotCancellable { id, state: from }
            }
            _ => match ledger.state(id) {
                Some(state) => CancelError::NotCancellable { id, state },
                None => CancelError::NotFound(id),
            },
        })?;

        let channel = event.channel;
        if previous == DeliveryState::Queued {
            self.queue.cancel(channel, id);
        }
        self.emit(event);
        tracing::info!(request_id = %id, channel = %channel, from = %previous, "Request cancelled");
        Ok(())
    }

    /// Run one attempt for a dequeued request.
    async fn attempt(self: &Arc<Self>, runtime: &ChannelRuntime, lease: InFlight) {
        let request = lease.request().clone();
        let id = request.id;
        let channel = request.channel;

        let attempt = {
            let mut ledger = self.ledger.lock();
            match ledger.begin_attempt(id) {
                Ok((attempt, event)) => {
                    self.emit(event);
                    attempt
                }
                Err(e) => {
                    // Cancelled between dequeue and start.
                    tracing::debug!(request_id = %id, error = %e, "Skipping request");
                    return;
                }
            }
        };

        let timeout = runtime.limits.send_timeout;
        let send = runtime.transport.send(&request.recipient, &request.payload);
        let result = match tokio::time::timeout(timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(format!(
                "send exceeded {} ms",
                timeout.as_millis()
            ))),
        };

        match result {
            Ok(()) => {
                self.resolve(id, Resolution::Sent);
                tracing::info!(request_id = %id, channel = %channel, attempt, "Notification sent");
            }
            Err(err) => {
                if matches!(err, TransportError::Unavailable(_)) {
                    runtime.supervisor.report_down(&err.to_string());
                }
                let kind = err.kind();
                let detail = err.to_string();

                match self.policy.decide_with_hint(kind, attempt, err.retry_after()) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::warn!(
                            request_id = %id,
                            channel = %channel,
                            attempt,
                            error_kind = %kind,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %detail,
                            "Delivery failed, retry scheduled"
                        );
                        self.resolve(
                            id,
                            Resolution::Retry {
                                kind,
                                detail,
                                retry_after: delay,
                            },
                        );
                        self.schedule_retry(request, delay);
                    }
                    RetryDecision::Abandon => {
                        tracing::error!(
                            request_id = %id,
                            channel = %channel,
                            attempt,
                            error_kind = %kind,
                            error = %detail,
                            "Delivery abandoned"
                        );
                        self.resolve(id, Resolution::Abandon { kind, detail });
                    }
                }
            }
        }

        drop(lease);
    }

    fn resolve(&self, id: Uuid, resolution: Resolution) {
        let mut ledger = self.ledger.lock();
        match ledger.resolve_attempt(id, resolution) {
            Ok(event) => self.emit(event),
            Err(e) => tracing::error!(request_id = %id, error = %e, "Failed to record attempt outcome"),
        }
    }

    fn schedule_retry(self: &Arc<Self>, request: NotificationRequest, delay: Duration) {
        let inner = Arc::clone(self);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = inner.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.requeue(request),
            }
        });
    }

    /// Backoff elapsed: put the request back at the end of its lane.
    fn requeue(&self, request: NotificationRequest) {
        let id = request.id;
        let mut ledger = self.ledger.lock();
        let event = match ledger.requeue(id) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(request_id = %id, error = %e, "Retry dropped");
                return;
            }
        };

        match self.queue.requeue(request) {
            Ok(()) => self.emit(event),
            Err(e) => {
                tracing::warn!(request_id = %id, error = %e, "Could not requeue retry");
            }
        }
    }
}

async fn run_worker(inner: Arc<Inner>, channel: Channel, worker_id: usize) {
    let Some(runtime) = inner.channels.get(&channel) else {
        return;
    };
    let mut availability = runtime.supervisor.availability();
    tracing::debug!(channel = %channel, worker_id, "Worker started");

    loop {
        if !availability.wait(&inner.shutdown).await {
            break;
        }

        let lease = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            lease = inner.queue.dequeue(channel) => lease,
        };
        let Some(lease) = lease else {
            break;
        };

        inner.attempt(runtime, lease).await;
    }

    tracing::debug!(channel = %channel, worker_id, "Worker stopped");
}

async fn dispatch_events(
    mut rx: mpsc::UnboundedReceiver<DeliveryEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
    done: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => match event {
                Some(event) => publish(&sinks, &event).await,
                None => break,
            },
            _ = done.cancelled() => {
                while let Ok(event) = rx.try_recv() {
                    publish(&sinks, &event).await;
                }
                break;
            }
        }
    }
}

async fn publish(sinks: &[Arc<dyn EventSink>], event: &DeliveryEvent) {
    for sink in sinks {
        if let Err(e) = sink.publish(event).await {
            tracing::warn!(
                request_id = %event.request_id,
                state = %event.state,
                error = %e,
                "Event sink publish failed"
            );
        }
    }
}
