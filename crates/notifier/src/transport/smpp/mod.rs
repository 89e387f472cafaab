//! SMS transport over an SMPP 3.4 transmitter session.
//!
//! One TCP session is bound per transport. Requests are serialized through
//! the session mutex and each one waits for its matching response, so a
//! sequence number is never outstanding twice. A send abandoned halfway
//! through an exchange leaves the session poisoned; the next caller drops it
//! and reports the channel unavailable so the supervisor rebinds.

pub mod pdu;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use herald_common::config::SmppSettings;
use herald_common::types::{Channel, NotificationPayload};

use super::{ChannelTransport, TransportError};
use pdu::{Header, Pdu, PduError, command, status};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const UNBIND_TIMEOUT: Duration = Duration::from_secs(2);

/// A bound SMPP session.
struct Session {
    stream: TcpStream,
    sequence: u32,
    /// Set while a request is awaiting its response.
    poisoned: bool,
}

impl Session {
    fn next_sequence(&mut self) -> u32 {
        self.sequence = if self.sequence >= 0x7FFF_FFFF {
            1
        } else {
            self.sequence + 1
        };
        self.sequence
    }

    async fn read_pdu(&mut self) -> Result<Pdu, TransportError> {
        let mut raw = [0u8; pdu::HEADER_LEN];
        self.stream
            .read_exact(&mut raw)
            .await
            .map_err(|e| TransportError::Unavailable(format!("SMPP read failed: {}", e)))?;
        let header = Header::decode(&raw).map_err(protocol_error)?;

        let mut body = BytesMut::zeroed(header.body_len());
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(|e| TransportError::Unavailable(format!("SMPP read failed: {}", e)))?;
        Ok(Pdu {
            header,
            body: body.freeze(),
        })
    }

    async fn write_pdu(&mut self, bytes: &Bytes) -> Result<(), TransportError> {
        self.stream
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::Unavailable(format!("SMPP write failed: {}", e)))
    }

    /// Write a request and wait for the response carrying its sequence number.
    ///
    /// Requests initiated by the SMSC while we wait are answered inline.
    async fn exchange(
        &mut self,
        request: Bytes,
        sequence: u32,
        response_id: u32,
    ) -> Result<Pdu, TransportError> {
        self.poisoned = true;
        self.write_pdu(&request).await?;

        loop {
            let frame = self.read_pdu().await?;
            let header = frame.header;

            if header.sequence_number == sequence
                && (header.command_id == response_id || header.command_id == command::GENERIC_NACK)
            {
                self.poisoned = false;
                return Ok(frame);
            }

            match header.command_id {
                command::ENQUIRE_LINK => {
                    let resp = pdu::empty_response(command::ENQUIRE_LINK, header.sequence_number);
                    self.write_pdu(&resp).await?;
                }
                command::DELIVER_SM => {
                    let resp = pdu::deliver_sm_resp(header.sequence_number);
                    self.write_pdu(&resp).await?;
                }
                command::UNBIND => {
                    let resp = pdu::empty_response(command::UNBIND, header.sequence_number);
                    let _ = self.write_pdu(&resp).await;
                    return Err(TransportError::Unavailable(
                        "SMSC unbound the session".to_string(),
                    ));
                }
                other if !pdu::is_response(other) => {
                    tracing::debug!(
                        command_id = %format!("{:#010x}", other),
                        sequence = header.sequence_number,
                        "Rejecting unsupported SMPP request"
                    );
                    let nack = pdu::generic_nack(header.sequence_number, status::INVALID_COMMAND_ID);
                    self.write_pdu(&nack).await?;
                }
                other => {
                    tracing::debug!(
                        command_id = %format!("{:#010x}", other),
                        sequence = header.sequence_number,
                        "Ignoring stray SMPP response"
                    );
                }
            }
        }
    }
}

fn protocol_error(err: PduError) -> TransportError {
    TransportError::Unavailable(format!("SMPP protocol error: {}", err))
}

/// Map a non-OK `submit_sm_resp` status.
fn classify_status(code: u32) -> TransportError {
    let message = format!("{} ({:#x})", pdu::status_name(code), code);
    match code {
        status::THROTTLED | status::MSG_QUEUE_FULL | status::SYSTEM_ERROR => {
            TransportError::Transient(message)
        }
        _ => TransportError::Permanent(message),
    }
}

/// Map a non-OK `bind_transmitter_resp` status.
fn classify_bind_status(code: u32) -> TransportError {
    let message = format!("bind rejected: {} ({:#x})", pdu::status_name(code), code);
    match code {
        status::INVALID_PASSWORD | status::INVALID_SYSTEM_ID => TransportError::Permanent(message),
        _ => TransportError::Unavailable(message),
    }
}

/// Text put on the wire for a payload. SMS carries the body only.
fn render_text(payload: &NotificationPayload) -> &str {
    &payload.body
}

/// SMS notification transport.
pub struct SmsTransport {
    settings: SmppSettings,
    session: Mutex<Option<Session>>,
    open: AtomicBool,
}

impl SmsTransport {
    pub fn new(settings: SmppSettings) -> Self {
        Self {
            settings,
            session: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    async fn bind(&self) -> Result<Session, TransportError> {
        let addr = format!("{}:{}", self.settings.host, self.settings.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| TransportError::Timeout(format!("connect to SMSC {} timed out", addr)))?
            .map_err(|e| TransportError::Unavailable(format!("connect to SMSC {}: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);

        let mut session = Session {
            stream,
            sequence: 0,
            poisoned: false,
        };
        let sequence = session.next_sequence();
        let request = pdu::bind_transmitter(
            sequence,
            &pdu::BindTransmitter {
                system_id: &self.settings.system_id,
                password: self.settings.password.expose(),
                system_type: &self.settings.system_type,
                address_range: &self.settings.source_addr,
            },
        );
        let resp = session
            .exchange(request, sequence, command::BIND_TRANSMITTER_RESP)
            .await?;
        if !resp.header.is_ok() {
            return Err(classify_bind_status(resp.header.command_status));
        }

        tracing::info!(
            smsc = %addr,
            system_id = %self.settings.system_id,
            "SMPP transmitter bound"
        );
        Ok(session)
    }

    /// Drop the session after a failed exchange.
    fn discard(&self, slot: &mut Option<Session>) {
        if slot.take().is_some() {
            tracing::warn!("SMPP session dropped");
        }
        self.open.store(false, Ordering::SeqCst);
    }

    /// Borrow the live session, discarding it if a previous exchange was interrupted.
    fn usable<'a>(
        &self,
        slot: &'a mut Option<Session>,
    ) -> Result<&'a mut Session, TransportError> {
        if slot.as_ref().is_some_and(|s| s.poisoned) {
            self.discard(slot);
            return Err(TransportError::Unavailable(
                "SMPP session interrupted mid-exchange".to_string(),
            ));
        }
        slot.as_mut()
            .ok_or_else(|| TransportError::Unavailable("SMPP session not bound".to_string()))
    }
}

#[async_trait]
impl ChannelTransport for SmsTransport {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn open(&self) -> Result<(), TransportError> {
        let mut slot = self.session.lock().await;
        if let Some(mut old) = slot.take() {
            let _ = old.stream.shutdown().await;
        }
        self.open.store(false, Ordering::SeqCst);

        let session = self.bind().await?;
        *slot = Some(session);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        let mut slot = self.session.lock().await;
        self.open.store(false, Ordering::SeqCst);
        let Some(mut session) = slot.take() else {
            return;
        };

        if !session.poisoned {
            let sequence = session.next_sequence();
            let unbind = session.exchange(pdu::unbind(sequence), sequence, command::UNBIND_RESP);
            if tokio::time::timeout(UNBIND_TIMEOUT, unbind).await.is_err() {
                tracing::debug!("SMSC did not answer unbind");
            }
        }
        let _ = session.stream.shutdown().await;
        tracing::info!("SMPP session closed");
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        let mut slot = self.session.lock().await;
        let session = self.usable(&mut slot)?;
        let sequence = session.next_sequence();
        let result = session
            .exchange(pdu::enquire_link(sequence), sequence, command::ENQUIRE_LINK_RESP)
            .await;

        match result {
            Ok(resp) if resp.header.is_ok() => Ok(()),
            Ok(resp) => Err(TransportError::Unavailable(format!(
                "enquire_link rejected: {:#x}",
                resp.header.command_status
            ))),
            Err(e) => {
                self.discard(&mut slot);
                Err(e)
            }
        }
    }

    async fn send(
        &self,
        recipient: &str,
        payload: &NotificationPayload,
    ) -> Result<(), TransportError> {
        let text = render_text(payload);

        let mut slot = self.session.lock().await;
        let session = self.usable(&mut slot)?;
        let sequence = session.next_sequence();
        let request = pdu::submit_sm(
            sequence,
            &pdu::SubmitSm {
                source_addr: &self.settings.source_addr,
                destination_addr: recipient.trim(),
                text,
            },
        )
        .map_err(|e| TransportError::Permanent(e.to_string()))?;

        let result = session
            .exchange(request, sequence, command::SUBMIT_SM_RESP)
            .await;
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.discard(&mut slot);
                return Err(e);
            }
        };

        if !resp.header.is_ok() {
            return Err(classify_status(resp.header.command_status));
        }
        let message_id = pdu::submit_sm_resp_message_id(&resp).map_err(protocol_error)?;
        tracing::debug!(
            recipient,
            message_id = message_id.as_deref().unwrap_or(""),
            "SMS submitted"
        );
        Ok(())
    }
}
