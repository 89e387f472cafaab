//! Telegram Bot API transport.
//!
//! Messages go out through `POST /bot<token>/sendMessage`. The session is a
//! long-poll loop on `getUpdates` that answers `/start` with the chat id a
//! user has to register to receive notifications. The session is considered
//! open while that loop is healthy.
//!
//! Error mapping: 429 is rate limiting (honours `parameters.retry_after`),
//! 5xx is transient, 400/403/404 are permanent (unknown chat, bot blocked),
//! 401 is permanent and also marks the session down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;

use herald_common::config::{Secret, TelegramSettings};
use herald_common::types::{Channel, NotificationPayload};

use super::{ChannelTransport, TransportError};

/// Telegram `sendMessage` text limit (characters).
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Appended when a message had to be cut.
const TRUNCATION_MARKER: &str = "\n\n[truncated]";

/// Delay after a failed `/start` reply before polling resumes.
const POLL_ERROR_PAUSE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    chat: Chat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// State shared between the transport and its long-poll task.
struct BotApi {
    client: Client,
    base_url: String,
    token: Secret,
    open: AtomicBool,
    /// Next `getUpdates` offset. Survives reconnects so confirmed updates
    /// are not replayed.
    offset: AtomicI64,
}

impl BotApi {
    fn method_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.base_url.trim_end_matches('/'),
            self.token.expose(),
            method
        )
    }

    async fn send_message(&self, chat_id: serde_json::Value, text: &str) -> Result<(), TransportError> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        let response = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(classify_request_error)?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        let result = classify_response(status, &raw);

        if status == StatusCode::UNAUTHORIZED {
            self.open.store(false, Ordering::SeqCst);
        }
        result
    }
}

/// Telegram notification transport.
pub struct TelegramTransport {
    api: Arc<BotApi>,
    poll_timeout: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramTransport {
    pub fn new(settings: &TelegramSettings) -> Self {
        Self {
            api: Arc::new(BotApi {
                client: Client::new(),
                base_url: settings.api_url.clone(),
                token: settings.bot_token.clone(),
                open: AtomicBool::new(false),
                offset: AtomicI64::new(0),
            }),
            poll_timeout: Duration::from_secs(settings.poll_timeout_secs),
            poller: Mutex::new(None),
        }
    }

    fn stop_poller(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl ChannelTransport for TelegramTransport {
    fn channel(&self) -> Channel {
        Channel::Telegram
    }

    async fn open(&self) -> Result<(), TransportError> {
        self.stop_poller();

        let response = self
            .api
            .client
            .get(self.api.method_url("getMe"))
            .send()
            .await
            .map_err(classify_request_error)?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        classify_response(status, &text)?;

        let me: ApiResponse<BotUser> = serde_json::from_str(&text)
            .map_err(|e| TransportError::Transient(format!("unexpected getMe response: {}", e)))?;
        if let Some(bot) = me.result {
            tracing::info!(
                bot_id = bot.id,
                username = bot.username.as_deref().unwrap_or(""),
                "Telegram bot session opened"
            );
        }

        self.api.open.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(poll_updates(Arc::clone(&self.api), self.poll_timeout));
        *self.poller.lock() = Some(handle);
        Ok(())
    }

    async fn close(&self) {
        self.stop_poller();
        if self.api.open.swap(false, Ordering::SeqCst) {
            tracing::info!("Telegram bot session closed");
        }
    }

    fn is_open(&self) -> bool {
        self.api.open.load(Ordering::SeqCst)
    }

    async fn send(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> Result<(), TransportError> {
        let chat_id = parse_chat_id(recipient)?;
        let text = render_message(payload);
        self.api.send_message(chat_id, &text).await?;

        tracing::debug!(chat_id = recipient, "Telegram message sent");
        Ok(())
    }
}

impl Drop for TelegramTransport {
    fn drop(&mut self) {
        self.stop_poller();
    }
}

/// Long-poll loop. Marks the session down and exits on any polling error;
/// the supervisor reopens it.
async fn poll_updates(api: Arc<BotApi>, poll_timeout: Duration) {
    loop {
        let offset = api.offset.load(Ordering::SeqCst);
        let response = api
            .client
            .get(api.method_url("getUpdates"))
            .query(&[("offset", offset), ("timeout", poll_timeout.as_secs() as i64)])
            .timeout(poll_timeout + Duration::from_secs(10))
            .send()
            .await;

        let updates = match response {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                match classify_response(status, &text).and_then(|_| {
                    serde_json::from_str::<ApiResponse<Vec<Update>>>(&text).map_err(|e| {
                        TransportError::Transient(format!("unexpected getUpdates response: {}", e))
                    })
                }) {
                    Ok(parsed) => parsed.result.unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!(error = %e, "Telegram long-poll failed, session down");
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %classify_request_error(e),
                    "Telegram long-poll failed, session down"
                );
                break;
            }
        };

        for update in updates {
            api.offset.fetch_max(update.update_id + 1, Ordering::SeqCst);
            let Some(message) = update.message else {
                continue;
            };
            let Some(text) = message.text.as_deref() else {
                continue;
            };

            if is_start_command(text) {
                let chat_id = message.chat.id;
                let reply = format!(
                    "You are registered!\nYour notification ID: {}",
                    chat_id
                );
                if let Err(e) = api.send_message(json!(chat_id), &reply).await {
                    tracing::warn!(chat_id, error = %e, "Failed to answer /start");
                    tokio::time::sleep(POLL_ERROR_PAUSE).await;
                } else {
                    tracing::info!(chat_id, "Registered Telegram chat via /start");
                }
            }
        }
    }

    api.open.store(false, Ordering::SeqCst);
}

/// `/start`, `/start@my_bot` and `/start <payload>` all count.
fn is_start_command(text: &str) -> bool {
    text.split_whitespace()
        .next()
        .map(|cmd| cmd.split('@').next() == Some("/start"))
        .unwrap_or(false)
}

/// Numeric chat ids are sent as numbers, `@channel` usernames as strings.
fn parse_chat_id(recipient: &str) -> Result<serde_json::Value, TransportError> {
    let recipient = recipient.trim();
    if let Ok(id) = recipient.parse::<i64>() {
        return Ok(json!(id));
    }
    if recipient.len() > 1 && recipient.starts_with('@') {
        return Ok(json!(recipient));
    }
    Err(TransportError::Permanent(format!(
        "'{}' is not a Telegram chat id",
        recipient
    )))
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Length of `c` once escaped.
fn escaped_len(c: char) -> usize {
    match c {
        '&' => 5,
        '<' | '>' => 4,
        _ => 1,
    }
}

/// Longest prefix of `text` whose escaped form fits in `budget` characters,
/// with that escaped length.
fn fit_escaped(text: &str, budget: usize) -> (&str, usize) {
    let mut used = 0;
    for (i, c) in text.char_indices() {
        let n = escaped_len(c);
        if used + n > budget {
            return (&text[..i], used);
        }
        used += n;
    }
    (text, used)
}

fn render_message(payload: &NotificationPayload) -> String {
    render_within(&payload.title, &payload.body, TELEGRAM_MESSAGE_LIMIT)
}

/// Render `title` in bold above `body`, within `limit` characters.
///
/// Cuts are made on the raw text before escaping, so an entity is never
/// split and the closing `</b>` is always present.
fn render_within(title: &str, body: &str, limit: usize) -> String {
    let has_title = !title.trim().is_empty();
    let frame = if has_title { "<b></b>\n\n".len() } else { 0 };

    let (_, title_len) = fit_escaped(title, usize::MAX);
    let (_, body_len) = fit_escaped(body, usize::MAX);
    let fits = frame + title_len + body_len <= limit;

    let mut budget = if fits {
        limit
    } else {
        limit.saturating_sub(TRUNCATION_MARKER.len())
    };

    let mut text = String::new();
    if has_title {
        let (kept, used) = fit_escaped(title, budget.saturating_sub(frame));
        text.push_str("<b>");
        text.push_str(&escape_html(kept));
        text.push_str("</b>\n\n");
        budget = budget.saturating_sub(frame + used);
    }
    let (kept, _) = fit_escaped(body, budget);
    text.push_str(&escape_html(kept));

    if !fits {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

/// Map a Bot API HTTP response to a delivery result.
fn classify_response(status: StatusCode, body: &str) -> Result<(), TransportError> {
    let parsed: Option<ApiResponse<serde_json::Value>> = serde_json::from_str(body).ok();
    let description = parsed
        .as_ref()
        .and_then(|r| r.description.clone())
        .unwrap_or_else(|| status.to_string());

    if status.is_success() {
        return match parsed {
            Some(r) if !r.ok => Err(TransportError::Transient(description)),
            _ => Ok(()),
        };
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = parsed
                .and_then(|r| r.parameters)
                .and_then(|p| p.retry_after)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(1));
            Err(TransportError::RateLimited {
                message: description,
                retry_after,
            })
        }
        StatusCode::BAD_REQUEST
        | StatusCode::UNAUTHORIZED
        | StatusCode::FORBIDDEN
        | StatusCode::NOT_FOUND => Err(TransportError::Permanent(description)),
        s if s.is_server_error() => Err(TransportError::Transient(description)),
        _ => Err(TransportError::Transient(description)),
    }
}

/// Map a reqwest failure. The URL is stripped because it embeds the token.
fn classify_request_error(err: reqwest::Error) -> TransportError {
    let timeout = err.is_timeout();
    let connect = err.is_connect();
    let message = err.without_url().to_string();
    if timeout {
        TransportError::Timeout(message)
    } else if connect {
        TransportError::Unavailable(message)
    } else {
        TransportError::Transient(message)
    }
}
