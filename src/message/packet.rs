//! Wire framings: RFC 7252 §3 over UDP, RFC 8323 over TCP and WebSocket,
//! with RFC 8974 extended token lengths on all three.
//!
//! Decoding is deliberately forgiving: once the fixed header is readable,
//! any later malformation yields a partial [`Message`] flagged with
//! `has_format_error` so the matcher can still decide to RST a confirmable
//! by its message id. Only an unreadable header is an outright error.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::header::MessageClass;
use super::Message;
use crate::error::FormatError;

/// Which transport framing a byte buffer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Udp,
    Tcp,
    WebSocket,
}

const PAYLOAD_MARKER: u8 = 0xFF;

/// Token lengths 9..=12 have no wire representation: the base nibble stops
/// at 8 and the RFC 8974 extensions start at 13.
pub(crate) fn token_nibble(len: usize) -> u8 {
    match len {
        0..=12 => len as u8,
        13..=268 => 13,
        _ => 14,
    }
}

fn validate_token_length(len: usize) -> Result<(), FormatError> {
    match len {
        0..=8 | 13..=268 | 269..=65804 => Ok(()),
        n => Err(FormatError::InvalidTokenLength(n)),
    }
}

fn push_token_extension(buf: &mut Vec<u8>, len: usize) {
    match token_nibble(len) {
        13 => buf.push((len - 13) as u8),
        14 => buf.extend_from_slice(&((len - 269) as u16).to_be_bytes()),
        _ => {}
    }
}

/// Serializes the option multiset as a delta-length-value sequence with the
/// 13/14 nibble spills (offsets 13 and 269).
fn encode_options(message: &Message) -> Result<Vec<u8>, FormatError> {
    let mut options_bytes: Vec<u8> = Vec::new();
    let mut last_number: u16 = 0;

    for (number, values) in message.options() {
        for value in values.iter() {
            let delta = (number - last_number) as usize;
            let length = value.len();

            let mut byte: u8 = 0;
            if delta <= 12 {
                byte |= (delta << 4) as u8;
            } else if delta < 269 {
                byte |= 13 << 4;
            } else {
                byte |= 14 << 4;
            }
            if length <= 12 {
                byte |= length as u8;
            } else if length < 269 {
                byte |= 13;
            } else if length < 65805 {
                byte |= 14;
            } else {
                return Err(FormatError::InvalidOptionLength);
            }
            options_bytes.push(byte);

            if delta > 12 && delta < 269 {
                options_bytes.push((delta - 13) as u8);
            } else if delta >= 269 {
                options_bytes.extend_from_slice(&((delta - 269) as u16).to_be_bytes());
            }

            if length > 12 && length < 269 {
                options_bytes.push((length - 13) as u8);
            } else if length >= 269 {
                options_bytes.extend_from_slice(&((length - 269) as u16).to_be_bytes());
            }

            options_bytes.extend_from_slice(value);
            last_number = *number;
        }
    }

    Ok(options_bytes)
}

/// Parses options and payload starting at `idx`, mutating `message` in
/// place so a parse error still leaves the prefix available.
fn parse_options_and_payload(
    buf: &[u8],
    mut idx: usize,
    message: &mut Message,
) -> Result<(), FormatError> {
    let mut number: u16 = 0;

    while idx < buf.len() {
        let byte = buf[idx];
        if byte == PAYLOAD_MARKER {
            idx += 1;
            if idx >= buf.len() {
                return Err(FormatError::PayloadMarkerWithoutPayload);
            }
            message.payload = buf[idx..].to_vec();
            return Ok(());
        }

        let mut delta = (byte >> 4) as usize;
        let mut length = (byte & 0x0F) as usize;
        idx += 1;

        match delta {
            13 => {
                if idx >= buf.len() {
                    return Err(FormatError::InvalidOptionDelta);
                }
                delta = buf[idx] as usize + 13;
                idx += 1;
            }
            14 => {
                if idx + 1 >= buf.len() {
                    return Err(FormatError::InvalidOptionDelta);
                }
                delta = u16::from_be_bytes([buf[idx], buf[idx + 1]]) as usize + 269;
                idx += 2;
            }
            15 => return Err(FormatError::InvalidOptionDelta),
            _ => {}
        }

        match length {
            13 => {
                if idx >= buf.len() {
                    return Err(FormatError::InvalidOptionLength);
                }
                length = buf[idx] as usize + 13;
                idx += 1;
            }
            14 => {
                if idx + 1 >= buf.len() {
                    return Err(FormatError::InvalidOptionLength);
                }
                length = u16::from_be_bytes([buf[idx], buf[idx + 1]]) as usize + 269;
                idx += 2;
            }
            15 => return Err(FormatError::InvalidOptionLength),
            _ => {}
        }

        number = number
            .checked_add(delta as u16)
            .ok_or(FormatError::InvalidOptionDelta)?;

        let end = idx + length;
        if end > buf.len() {
            return Err(FormatError::InvalidOptionLength);
        }
        message.add_option_raw(number, buf[idx..end].to_vec());
        idx = end;
    }

    Ok(())
}

/// Encodes a message for the given framing.
pub fn encode(message: &Message, framing: Framing) -> Result<Vec<u8>, FormatError> {
    match framing {
        Framing::Udp => encode_udp(message),
        Framing::Tcp => encode_framed(message, false),
        Framing::WebSocket => encode_framed(message, true),
    }
}

/// Decodes a complete datagram or frame for the given framing.
pub fn decode(buf: &[u8], framing: Framing) -> Result<Message, FormatError> {
    match framing {
        Framing::Udp => decode_udp(buf),
        Framing::Tcp => decode_framed(buf, false),
        Framing::WebSocket => decode_framed(buf, true),
    }
}

fn encode_udp(message: &Message) -> Result<Vec<u8>, FormatError> {
    let token = message.get_token();
    validate_token_length(token.len())?;
    let options_bytes = encode_options(message)?;

    let has_payload = message.header.code != MessageClass::Empty && !message.payload.is_empty();

    let mut buf =
        Vec::with_capacity(4 + 2 + token.len() + options_bytes.len() + 1 + message.payload.len());
    let type_bits = message.header.get_type() as u8;
    buf.push(message.header.get_version() << 6 | (type_bits << 4) & 0x30 | token_nibble(token.len()));
    buf.push(message.header.code.into());
    buf.extend_from_slice(&message.header.message_id.to_be_bytes());
    push_token_extension(&mut buf, token.len());
    buf.extend_from_slice(token);
    buf.extend_from_slice(&options_bytes);
    if has_payload {
        buf.push(PAYLOAD_MARKER);
        buf.extend_from_slice(&message.payload);
    }

    Ok(buf)
}

fn decode_udp(buf: &[u8]) -> Result<Message, FormatError> {
    if buf.len() < 4 {
        return Err(FormatError::Truncated);
    }

    let mut message = Message::new();
    message.header.set_version(buf[0] >> 6);
    message.header.set_type(match (buf[0] >> 4) & 0x03 {
        0 => super::header::MessageType::Confirmable,
        1 => super::header::MessageType::NonConfirmable,
        2 => super::header::MessageType::Acknowledgement,
        _ => super::header::MessageType::Reset,
    });
    let tkl_nibble = buf[0] & 0x0F;
    message.header.code = MessageClass::from(buf[1]);
    message.header.message_id = u16::from_be_bytes([buf[2], buf[3]]);

    if message.header.get_version() != 1 {
        message.has_format_error = true;
        return Ok(message);
    }

    let mut idx = 4;
    let token_length = match tkl_nibble {
        0..=8 => tkl_nibble as usize,
        13 => {
            if idx >= buf.len() {
                message.has_format_error = true;
                return Ok(message);
            }
            idx += 1;
            buf[idx - 1] as usize + 13
        }
        14 => {
            if idx + 1 >= buf.len() {
                message.has_format_error = true;
                return Ok(message);
            }
            idx += 2;
            u16::from_be_bytes([buf[idx - 2], buf[idx - 1]]) as usize + 269
        }
        // 9..=12 lack the RFC 8974 indication and 15 is reserved.
        _ => {
            message.has_format_error = true;
            return Ok(message);
        }
    };

    if idx + token_length > buf.len() {
        message.has_format_error = true;
        return Ok(message);
    }
    message.set_token(buf[idx..idx + token_length].to_vec());
    idx += token_length;

    if let Err(cause) = parse_options_and_payload(buf, idx, &mut message) {
        log::debug!("inbound message malformed: {}", cause);
        message.has_format_error = true;
        return Ok(message);
    }

    // An empty message is the four header bytes and nothing else.
    if message.header.code == MessageClass::Empty
        && (!message.get_token().is_empty() || message.option_count() > 0 || !message.payload.is_empty())
    {
        message.has_format_error = true;
    }

    Ok(message)
}

/// Shared RFC 8323 encoder; WebSocket frames force the length field to 0
/// because the frame itself bounds the message.
fn encode_framed(message: &Message, websocket: bool) -> Result<Vec<u8>, FormatError> {
    let token = message.get_token();
    validate_token_length(token.len())?;
    let options_bytes = encode_options(message)?;

    let has_payload = message.header.code != MessageClass::Empty && !message.payload.is_empty();
    let body_len = if websocket {
        0
    } else {
        options_bytes.len() + if has_payload { 1 + message.payload.len() } else { 0 }
    };

    let mut buf = Vec::with_capacity(8 + token.len() + options_bytes.len() + message.payload.len());

    let len_nibble: u8 = if websocket || body_len <= 12 {
        body_len as u8
    } else if body_len < 269 {
        13
    } else if body_len < 65805 {
        14
    } else {
        15
    };
    buf.push(len_nibble << 4 | token_nibble(token.len()));
    match len_nibble {
        13 => buf.push((body_len - 13) as u8),
        14 => buf.extend_from_slice(&((body_len - 269) as u16).to_be_bytes()),
        15 => buf.extend_from_slice(&((body_len - 65805) as u32).to_be_bytes()),
        _ => {}
    }
    buf.push(message.header.code.into());
    push_token_extension(&mut buf, token.len());
    buf.extend_from_slice(token);
    buf.extend_from_slice(&options_bytes);
    if has_payload {
        buf.push(PAYLOAD_MARKER);
        buf.extend_from_slice(&message.payload);
    }

    Ok(buf)
}

fn decode_framed(buf: &[u8], websocket: bool) -> Result<Message, FormatError> {
    if buf.len() < 2 {
        return Err(FormatError::Truncated);
    }

    let len_nibble = buf[0] >> 4;
    let tkl_nibble = buf[0] & 0x0F;
    let mut idx = 1;

    // Skip the length extension; the frame boundary already told us the
    // total size, so the value is only consumed, not trusted.
    idx += match len_nibble {
        13 => 1,
        14 => 2,
        15 => 4,
        _ => 0,
    };
    if idx >= buf.len() {
        return Err(FormatError::Truncated);
    }

    let mut message = Message::new();
    message.header.set_type(super::header::MessageType::NonConfirmable);
    message.header.code = MessageClass::from(buf[idx]);
    idx += 1;

    if websocket && len_nibble != 0 {
        message.has_format_error = true;
        return Ok(message);
    }

    let token_length = match tkl_nibble {
        0..=8 => tkl_nibble as usize,
        13 => {
            if idx >= buf.len() {
                message.has_format_error = true;
                return Ok(message);
            }
            idx += 1;
            buf[idx - 1] as usize + 13
        }
        14 => {
            if idx + 1 >= buf.len() {
                message.has_format_error = true;
                return Ok(message);
            }
            idx += 2;
            u16::from_be_bytes([buf[idx - 2], buf[idx - 1]]) as usize + 269
        }
        _ => {
            message.has_format_error = true;
            return Ok(message);
        }
    };

    if idx + token_length > buf.len() {
        message.has_format_error = true;
        return Ok(message);
    }
    message.set_token(buf[idx..idx + token_length].to_vec());
    idx += token_length;

    if let Err(cause) = parse_options_and_payload(buf, idx, &mut message) {
        log::debug!("inbound frame malformed: {}", cause);
        message.has_format_error = true;
    }

    Ok(message)
}

/// `tokio_util` codec adapting the RFC 8323 framing to a byte stream;
/// handles partial frames by reporting how many more bytes are needed.
pub struct StreamCodec;

/// Returns the total frame size once enough bytes are present to know it.
fn frame_length(buf: &[u8]) -> Option<usize> {
    if buf.is_empty() {
        return None;
    }

    let len_nibble = (buf[0] >> 4) as usize;
    let tkl_nibble = (buf[0] & 0x0F) as usize;
    let len_ext = match len_nibble {
        13 => 1,
        14 => 2,
        15 => 4,
        _ => 0,
    };
    let tkl_ext = match tkl_nibble {
        13 => 1,
        14 => 2,
        _ => 0,
    };

    // byte0 + length extension + code + token-length extension
    let fixed = 1 + len_ext + 1 + tkl_ext;
    if buf.len() < fixed {
        return None;
    }

    let body_len = match len_nibble {
        13 => buf[1] as usize + 13,
        14 => u16::from_be_bytes([buf[1], buf[2]]) as usize + 269,
        15 => u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize + 65805,
        n => n,
    };
    let token_len = match tkl_nibble {
        13 => buf[1 + len_ext + 1] as usize + 13,
        14 => u16::from_be_bytes([buf[1 + len_ext + 1], buf[1 + len_ext + 2]]) as usize + 269,
        n => n,
    };

    Some(fixed + token_len + body_len)
}

impl Decoder for StreamCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        let needed = match frame_length(src) {
            Some(n) => n,
            None => return Ok(None),
        };
        if src.len() < needed {
            src.reserve(needed - src.len());
            return Ok(None);
        }

        let frame = src.split_to(needed);
        decode_framed(&frame, false)
            .map(Some)
            .map_err(|cause| std::io::Error::new(std::io::ErrorKind::InvalidData, cause))
    }
}

impl Encoder<Message> for StreamCodec {
    type Error = std::io::Error;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = encode_framed(&message, false)
            .map_err(|cause| std::io::Error::new(std::io::ErrorKind::InvalidData, cause))?;
        dst.extend_from_slice(&bytes);
        Ok(())
    }
}
