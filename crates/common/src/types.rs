use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Outbound delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Telegram,
    Email,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Telegram, Channel::Email, Channel::Sms];

    /// Upper-case name used for per-channel environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Channel::Telegram => "TELEGRAM",
            Channel::Email => "EMAIL",
            Channel::Sms => "SMS",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Telegram => write!(f, "telegram"),
            Channel::Email => write!(f, "email"),
            Channel::Sms => write!(f, "sms"),
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "telegram" => Ok(Channel::Telegram),
            "email" => Ok(Channel::Email),
            "sms" => Ok(Channel::Sms),
            other => Err(AppError::Validation(format!("unknown channel '{}'", other))),
        }
    }
}

/// Notification priority. Carried on the request and rendered by transports;
/// queue order stays FIFO regardless of priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// Failure classification shared by transports, the retry policy and the
/// delivery history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network blip, 5xx, throttling.
    Transient,
    /// Invalid recipient, auth rejection.
    Permanent,
    Timeout,
    QueueFull,
    /// Transport connection not established.
    AdapterUnavailable,
    /// Cancelled by the caller before the send started.
    Cancelled,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::QueueFull => write!(f, "queue_full"),
            ErrorKind::AdapterUnavailable => write!(f, "adapter_unavailable"),
            ErrorKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Pending,
    Sent,
    /// Failed, another attempt is scheduled.
    Failed,
    Abandoned,
}

impl AttemptOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptOutcome::Sent | AttemptOutcome::Abandoned)
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptOutcome::Pending => write!(f, "pending"),
            AttemptOutcome::Sent => write!(f, "sent"),
            AttemptOutcome::Failed => write!(f, "failed"),
            AttemptOutcome::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Lifecycle state of a request inside the dispatch core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Submitted,
    Queued,
    InFlight,
    Sent,
    RetryScheduled,
    Abandoned,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Sent | DeliveryState::Abandoned)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: DeliveryState) -> bool {
        use DeliveryState::*;
        matches!(
            (self, next),
            (Submitted, Queued)
                | (Queued, InFlight)
                | (Queued, Abandoned)
                | (InFlight, Sent)
                | (InFlight, RetryScheduled)
                | (InFlight, Abandoned)
                | (RetryScheduled, Queued)
                | (RetryScheduled, Abandoned)
        )
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryState::Submitted => write!(f, "submitted"),
            DeliveryState::Queued => write!(f, "queued"),
            DeliveryState::InFlight => write!(f, "in_flight"),
            DeliveryState::Sent => write!(f, "sent"),
            DeliveryState::RetryScheduled => write!(f, "retry_scheduled"),
            DeliveryState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// Human-readable message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    /// Short title, used as the email subject and the Telegram heading
    pub title: String,
    /// Message body
    pub body: String,
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

/// A notification submitted for delivery. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub channel: Channel,
    /// Chat id, email address or phone number depending on the channel
    pub recipient: String,
    pub payload: NotificationPayload,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub priority: Priority,
}

impl NotificationRequest {
    pub fn new(
        channel: Channel,
        recipient: impl Into<String>,
        payload: NotificationPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel,
            recipient: recipient.into(),
            payload,
            created_at: Utc::now(),
            priority: Priority::Normal,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// One entry of a request's append-only delivery history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub request_id: Uuid,
    /// Starts at 1, increases by exactly 1 per attempt
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<ErrorKind>,
    /// Last transport error message, if any
    pub detail: Option<String>,
}

/// Per-channel concurrency bookkeeping owned by the dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelState {
    pub channel: Channel,
    pub concurrency_limit: usize,
    pub in_flight: usize,
}

/// Append-only record emitted on every delivery state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub request_id: Uuid,
    pub channel: Channel,
    pub state: DeliveryState,
    pub attempt_number: Option<u32>,
    pub error_kind: Option<ErrorKind>,
    /// Backoff before the next attempt, set on `RetryScheduled`
    #[serde(with = "duration_ms", default)]
    pub retry_after: Option<Duration>,
    pub at: DateTime<Utc>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// Boundary validation for requests arriving from upstream callers.
///
/// Checks only what can be checked without contacting the channel: the
/// recipient is present and plausibly shaped, and the body is not empty.
pub fn validate_request(request: &NotificationRequest) -> Result<(), AppError> {
    let recipient = request.recipient.trim();
    if recipient.is_empty() {
        return Err(AppError::Validation(format!(
            "request {} has no {} recipient",
            request.id, request.channel
        )));
    }
    if request.payload.body.trim().is_empty() {
        return Err(AppError::Validation(format!(
            "request {} has an empty body",
            request.id
        )));
    }

    let shaped = match request.channel {
        Channel::Telegram => {
            recipient.starts_with('@') || recipient.trim_start_matches('-').parse::<i64>().is_ok()
        }
        Channel::Email => {
            let mut parts = recipient.splitn(2, '@');
            matches!((parts.next(), parts.next()), (Some(l), Some(d)) if !l.is_empty() && d.contains('.'))
        }
        Channel::Sms => {
            let digits = recipient.trim_start_matches('+');
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
        }
    };

    if !shaped {
        return Err(AppError::Validation(format!(
            "'{}' is not a valid {} recipient",
            recipient, request.channel
        )));
    }
    Ok(())
}
