//! SMPP 3.4 PDU codec for the subset a transmitter needs.
//!
//! Every PDU starts with a 16-byte header:
//! `command_length | command_id | command_status | sequence_number`
//! (all big-endian u32). Strings in bodies are NUL-terminated octets.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 16;

/// Largest PDU we accept from the SMSC.
pub const MAX_PDU_LEN: usize = 64 * 1024;

/// Largest `short_message` payload in octets.
pub const MAX_SHORT_MESSAGE: usize = 254;

pub const INTERFACE_VERSION: u8 = 0x34;

pub mod command {
    pub const GENERIC_NACK: u32 = 0x8000_0000;
    pub const BIND_TRANSMITTER: u32 = 0x0000_0002;
    pub const BIND_TRANSMITTER_RESP: u32 = 0x8000_0002;
    pub const SUBMIT_SM: u32 = 0x0000_0004;
    pub const SUBMIT_SM_RESP: u32 = 0x8000_0004;
    pub const DELIVER_SM: u32 = 0x0000_0005;
    pub const DELIVER_SM_RESP: u32 = 0x8000_0005;
    pub const UNBIND: u32 = 0x0000_0006;
    pub const UNBIND_RESP: u32 = 0x8000_0006;
    pub const ENQUIRE_LINK: u32 = 0x0000_0015;
    pub const ENQUIRE_LINK_RESP: u32 = 0x8000_0015;
}

pub mod status {
    pub const OK: u32 = 0x0000_0000;
    pub const INVALID_MSG_LEN: u32 = 0x0000_0001;
    pub const INVALID_COMMAND_ID: u32 = 0x0000_0003;
    pub const SYSTEM_ERROR: u32 = 0x0000_0008;
    pub const INVALID_SOURCE: u32 = 0x0000_000A;
    pub const INVALID_DEST: u32 = 0x0000_000B;
    pub const BIND_FAILED: u32 = 0x0000_000D;
    pub const INVALID_PASSWORD: u32 = 0x0000_000E;
    pub const INVALID_SYSTEM_ID: u32 = 0x0000_000F;
    pub const MSG_QUEUE_FULL: u32 = 0x0000_0014;
    pub const THROTTLED: u32 = 0x0000_0058;
}

/// Data coding scheme for `short_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataCoding {
    /// SMSC default alphabet, used for plain ASCII text
    Default,
    /// UCS-2 big-endian
    Ucs2,
}

impl DataCoding {
    pub fn code(&self) -> u8 {
        match self {
            DataCoding::Default => 0x00,
            DataCoding::Ucs2 => 0x08,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PduError {
    #[error("PDU length {0} out of range")]
    BadLength(usize),

    #[error("truncated PDU body")]
    Truncated,

    #[error("missing NUL terminator")]
    Unterminated,

    #[error("message of {0} octets exceeds short_message limit")]
    MessageTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command_length: u32,
    pub command_id: u32,
    pub command_status: u32,
    pub sequence_number: u32,
}

impl Header {
    /// Decode a header and validate the announced length.
    pub fn decode(mut buf: &[u8]) -> Result<Self, PduError> {
        if buf.len() < HEADER_LEN {
            return Err(PduError::Truncated);
        }
        let header = Header {
            command_length: buf.get_u32(),
            command_id: buf.get_u32(),
            command_status: buf.get_u32(),
            sequence_number: buf.get_u32(),
        };
        let len = header.command_length as usize;
        if !(HEADER_LEN..=MAX_PDU_LEN).contains(&len) {
            return Err(PduError::BadLength(len));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> usize {
        self.command_length as usize - HEADER_LEN
    }

    pub fn is_ok(&self) -> bool {
        self.command_status == status::OK
    }
}

/// A complete PDU as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub header: Header,
    pub body: Bytes,
}

/// Bind credentials for `bind_transmitter`.
#[derive(Debug, Clone)]
pub struct BindTransmitter<'a> {
    pub system_id: &'a str,
    pub password: &'a str,
    pub system_type: &'a str,
    pub address_range: &'a str,
}

/// Parameters of a `submit_sm`.
#[derive(Debug, Clone)]
pub struct SubmitSm<'a> {
    pub source_addr: &'a str,
    pub destination_addr: &'a str,
    pub text: &'a str,
}

fn frame(command_id: u32, command_status: u32, sequence: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32((HEADER_LEN + body.len()) as u32);
    buf.put_u32(command_id);
    buf.put_u32(command_status);
    buf.put_u32(sequence);
    buf.put_slice(body);
    buf.freeze()
}

fn put_cstr(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Type of number / numbering plan for an address.
fn address_ton_npi(addr: &str) -> (u8, u8) {
    let digits = addr.trim_start_matches('+');
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        if addr.starts_with('+') {
            (0x01, 0x01) // international, ISDN
        } else {
            (0x00, 0x01) // unknown, ISDN
        }
    } else {
        (0x05, 0x00) // alphanumeric sender id
    }
}

fn strip_plus(addr: &str) -> &str {
    addr.strip_prefix('+').unwrap_or(addr)
}

/// Pick the data coding and encode the text.
pub fn encode_text(text: &str) -> (DataCoding, Vec<u8>) {
    if text.is_ascii() {
        (DataCoding::Default, text.as_bytes().to_vec())
    } else {
        let bytes = text
            .encode_utf16()
            .flat_map(|unit| unit.to_be_bytes())
            .collect();
        (DataCoding::Ucs2, bytes)
    }
}

pub fn bind_transmitter(sequence: u32, bind: &BindTransmitter<'_>) -> Bytes {
    let mut body = BytesMut::new();
    put_cstr(&mut body, bind.system_id);
    put_cstr(&mut body, bind.password);
    put_cstr(&mut body, bind.system_type);
    body.put_u8(INTERFACE_VERSION);
    let (ton, npi) = if bind.address_range.is_empty() {
        (0, 0)
    } else {
        address_ton_npi(bind.address_range)
    };
    body.put_u8(ton);
    body.put_u8(npi);
    put_cstr(&mut body, bind.address_range);
    frame(command::BIND_TRANSMITTER, status::OK, sequence, &body)
}

pub fn submit_sm(sequence: u32, submit: &SubmitSm<'_>) -> Result<Bytes, PduError> {
    let (coding, message) = encode_text(submit.text);
    if message.len() > MAX_SHORT_MESSAGE {
        return Err(PduError::MessageTooLong(message.len()));
    }

    let mut body = BytesMut::new();
    put_cstr(&mut body, ""); // service_type
    let (src_ton, src_npi) = address_ton_npi(submit.source_addr);
    body.put_u8(src_ton);
    body.put_u8(src_npi);
    put_cstr(&mut body, strip_plus(submit.source_addr));
    let (dst_ton, dst_npi) = address_ton_npi(submit.destination_addr);
    body.put_u8(dst_ton);
    body.put_u8(dst_npi);
    put_cstr(&mut body, strip_plus(submit.destination_addr));
    body.put_u8(0); // esm_class
    body.put_u8(0); // protocol_id
    body.put_u8(0); // priority_flag
    put_cstr(&mut body, ""); // schedule_delivery_time
    put_cstr(&mut body, ""); // validity_period
    body.put_u8(0); // registered_delivery
    body.put_u8(0); // replace_if_present_flag
    body.put_u8(coding.code());
    body.put_u8(0); // sm_default_msg_id
    body.put_u8(message.len() as u8);
    body.put_slice(&message);
    Ok(frame(command::SUBMIT_SM, status::OK, sequence, &body))
}

pub fn enquire_link(sequence: u32) -> Bytes {
    frame(command::ENQUIRE_LINK, status::OK, sequence, &[])
}

pub fn unbind(sequence: u32) -> Bytes {
    frame(command::UNBIND, status::OK, sequence, &[])
}

/// Whether `command_id` is a response (high bit set).
pub fn is_response(command_id: u32) -> bool {
    command_id & command::GENERIC_NACK != 0
}

/// Empty-bodied response to a request PDU (enquire_link, unbind).
pub fn empty_response(command_id: u32, sequence: u32) -> Bytes {
    frame(command_id | command::GENERIC_NACK, status::OK, sequence, &[])
}

/// `deliver_sm_resp` carries an empty message_id.
pub fn deliver_sm_resp(sequence: u32) -> Bytes {
    frame(command::DELIVER_SM_RESP, status::OK, sequence, &[0])
}

/// Negative acknowledgement for a request we cannot handle.
pub fn generic_nack(sequence: u32, command_status: u32) -> Bytes {
    frame(command::GENERIC_NACK, command_status, sequence, &[])
}

/// Read a NUL-terminated string from the front of `buf`.
pub fn read_cstr(buf: &mut Bytes) -> Result<String, PduError> {
    let end = buf
        .iter()
        .position(|b| *b == 0)
        .ok_or(PduError::Unterminated)?;
    let value = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(value)
}

/// `message_id` of a `submit_sm_resp`. Error responses may omit the body.
pub fn submit_sm_resp_message_id(pdu: &Pdu) -> Result<Option<String>, PduError> {
    if pdu.body.is_empty() {
        return Ok(None);
    }
    let mut body = pdu.body.clone();
    read_cstr(&mut body).map(Some)
}

/// Human-readable name for the command statuses we classify.
pub fn status_name(code: u32) -> &'static str {
    match code {
        status::OK => "ESME_ROK",
        status::INVALID_MSG_LEN => "ESME_RINVMSGLEN",
        status::INVALID_COMMAND_ID => "ESME_RINVCMDID",
        status::SYSTEM_ERROR => "ESME_RSYSERR",
        status::INVALID_SOURCE => "ESME_RINVSRCADR",
        status::INVALID_DEST => "ESME_RINVDSTADR",
        status::BIND_FAILED => "ESME_RBINDFAIL",
        status::INVALID_PASSWORD => "ESME_RINVPASWD",
        status::INVALID_SYSTEM_ID => "ESME_RINVSYSID",
        status::MSG_QUEUE_FULL => "ESME_RMSGQFUL",
        status::THROTTLED => "ESME_RTHROTTLED",
        _ => "ESME_UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(pdu: &Bytes) -> (Header, Bytes) {
        let header = Header::decode(pdu).unwrap();
        assert_eq!(header.command_length as usize, pdu.len());
        (header, pdu.slice(HEADER_LEN..))
    }

    #[test]
    fn test_bind_transmitter_layout() {
        let pdu = bind_transmitter(
            1,
            &BindTransmitter {
                system_id: "otp",
                password: "pw",
                system_type: "",
                address_range: "",
            },
        );
        let (header, body) = split(&pdu);
        assert_eq!(header.command_id, command::BIND_TRANSMITTER);
        assert_eq!(header.sequence_number, 1);
        assert_eq!(&body[..], b"otp\0pw\0\0\x34\x00\x00\0");
    }

    #[test]
    fn test_submit_sm_ascii() {
        let pdu = submit_sm(
            7,
            &SubmitSm {
                source_addr: "OTPService",
                destination_addr: "+79001234567",
                text: "Code: 123456",
            },
        )
        .unwrap();
        let (header, mut body) = split(&pdu);
        assert_eq!(header.command_id, command::SUBMIT_SM);
        assert_eq!(header.sequence_number, 7);

        assert_eq!(read_cstr(&mut body).unwrap(), ""); // service_type
        assert_eq!(body.get_u8(), 0x05); // alphanumeric source
        assert_eq!(body.get_u8(), 0x00);
        assert_eq!(read_cstr(&mut body).unwrap(), "OTPService");
        assert_eq!(body.get_u8(), 0x01); // international destination
        assert_eq!(body.get_u8(), 0x01);
        assert_eq!(read_cstr(&mut body).unwrap(), "79001234567");
        body.advance(3); // esm_class, protocol_id, priority_flag
        assert_eq!(read_cstr(&mut body).unwrap(), "");
        assert_eq!(read_cstr(&mut body).unwrap(), "");
        body.advance(2); // registered_delivery, replace_if_present
        assert_eq!(body.get_u8(), DataCoding::Default.code());
        body.advance(1); // sm_default_msg_id
        assert_eq!(body.get_u8() as usize, "Code: 123456".len());
        assert_eq!(&body[..], b"Code: 123456");
    }

    #[test]
    fn test_encode_text_ucs2_for_non_ascii() {
        let (coding, bytes) = encode_text("Код");
        assert_eq!(coding, DataCoding::Ucs2);
        assert_eq!(bytes, vec![0x04, 0x1A, 0x04, 0x3E, 0x04, 0x34]);
    }

    #[test]
    fn test_submit_sm_rejects_long_message() {
        let text = "x".repeat(MAX_SHORT_MESSAGE + 1);
        let err = submit_sm(
            1,
            &SubmitSm {
                source_addr: "1234",
                destination_addr: "5678",
                text: &text,
            },
        )
        .unwrap_err();
        assert_eq!(err, PduError::MessageTooLong(MAX_SHORT_MESSAGE + 1));
    }

    #[test]
    fn test_header_rejects_bad_length() {
        let mut raw = BytesMut::new();
        raw.put_u32(8);
        raw.put_u32(command::ENQUIRE_LINK);
        raw.put_u32(0);
        raw.put_u32(1);
        assert_eq!(Header::decode(&raw), Err(PduError::BadLength(8)));
        assert_eq!(Header::decode(&raw[..10]), Err(PduError::Truncated));
    }

    #[test]
    fn test_submit_sm_resp_message_id() {
        let raw = frame(command::SUBMIT_SM_RESP, status::OK, 3, b"msg-42\0");
        let (header, body) = split(&raw);
        let pdu = Pdu { header, body };
        assert_eq!(
            submit_sm_resp_message_id(&pdu).unwrap(),
            Some("msg-42".to_string())
        );

        let raw = frame(command::SUBMIT_SM_RESP, status::THROTTLED, 4, &[]);
        let (header, body) = split(&raw);
        assert_eq!(submit_sm_resp_message_id(&Pdu { header, body }).unwrap(), None);
    }

    #[test]
    fn test_empty_response_sets_response_bit() {
        let (header, body) = split(&empty_response(command::ENQUIRE_LINK, 9));
        assert_eq!(header.command_id, command::ENQUIRE_LINK_RESP);
        assert_eq!(header.sequence_number, 9);
        assert!(body.is_empty());
    }

    #[test]
    fn test_bind_transmitter_address_range() {
        let pdu = bind_transmitter(
            2,
            &BindTransmitter {
                system_id: "otp",
                password: "pw",
                system_type: "",
                address_range: "OTPService",
            },
        );
        let (_, body) = split(&pdu);
        assert_eq!(&body[..], b"otp\0pw\0\0\x34\x05\x00OTPService\0");
    }

    #[test]
    fn test_generic_nack() {
        let (header, body) = split(&generic_nack(9, status::INVALID_COMMAND_ID));
        assert_eq!(header.command_id, command::GENERIC_NACK);
        assert_eq!(header.command_status, status::INVALID_COMMAND_ID);
        assert_eq!(header.sequence_number, 9);
        assert!(body.is_empty());
        assert!(is_response(header.command_id));
        assert!(!is_response(command::SUBMIT_SM));
    }

    #[test]
    fn test_read_cstr_unterminated() {
        let mut buf = Bytes::from_static(b"abc");
        assert_eq!(read_cstr(&mut buf), Err(PduError::Unterminated));
    }
}
