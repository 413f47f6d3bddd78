//! CoAP datagram encoding and decoding.

use std::time::SystemTime;

use super::{Code, Message, MsgType, OPT_MAX_AGE, OPT_URI_PATH, OPT_URI_QUERY, VERSION};
use crate::error::{CoreError, Result};

/// Encode a message into wire bytes.
///
/// Options are emitted in ascending option-number order as the format
/// requires: Uri-Path (11), Max-Age (14), Uri-Query (15).
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    if message.token.len() > 8 {
        return Err(CoreError::Framing(format!(
            "Token too long: {} bytes (max 8)",
            message.token.len()
        )));
    }

    let mut buf = Vec::with_capacity(16 + message.payload.len());

    buf.push((VERSION << 6) | (message.kind.as_bits() << 4) | message.token.len() as u8);
    buf.push(message.code.as_byte());
    buf.extend_from_slice(&message.message_id.to_be_bytes());
    buf.extend_from_slice(&message.token);

    let mut last_option = 0u16;

    for segment in message.uri_path.split('/').filter(|s| !s.is_empty()) {
        write_option(&mut buf, &mut last_option, OPT_URI_PATH, segment.as_bytes());
    }

    if let Some(max_age) = message.max_age {
        write_option(&mut buf, &mut last_option, OPT_MAX_AGE, &uint_bytes(max_age));
    }

    if let Some(query) = &message.uri_query {
        if !query.is_empty() {
            write_option(&mut buf, &mut last_option, OPT_URI_QUERY, query.as_bytes());
        }
    }

    if !message.payload.is_empty() {
        buf.push(0xFF);
        buf.extend_from_slice(&message.payload);
    }

    Ok(buf)
}

/// Parse wire bytes into a message.
///
/// Returns a framing error on any malformed input; the session drops the
/// frame and keeps reading.
pub fn parse(bytes: &[u8]) -> Result<Message> {
    if bytes.len() < 4 {
        return Err(CoreError::Framing(format!(
            "Datagram too short: {} bytes",
            bytes.len()
        )));
    }

    let version = bytes[0] >> 6;
    if version != VERSION {
        return Err(CoreError::Framing(format!("Bad version: {version}")));
    }

    let kind = MsgType::from_bits(bytes[0] >> 4);
    let token_len = (bytes[0] & 0x0F) as usize;
    if token_len > 8 {
        return Err(CoreError::Framing(format!("Bad token length: {token_len}")));
    }

    let code = Code::from_byte(bytes[1]);
    let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);

    let mut pos = 4;
    if pos + token_len > bytes.len() {
        return Err(CoreError::Framing("Token truncated".to_string()));
    }
    let token = bytes[pos..pos + token_len].to_vec();
    pos += token_len;

    let mut path_segments: Vec<String> = Vec::new();
    let mut query_items: Vec<String> = Vec::new();
    let mut max_age = None;
    let mut option_number = 0u16;

    while pos < bytes.len() && bytes[pos] != 0xFF {
        let byte = bytes[pos];
        pos += 1;

        let (delta, consumed) = read_option_field(bytes, pos, byte >> 4)?;
        pos += consumed;
        let (length, consumed) = read_option_field(bytes, pos, byte & 0x0F)?;
        pos += consumed;

        option_number = option_number
            .checked_add(delta)
            .ok_or_else(|| CoreError::Framing("Option delta overflow".to_string()))?;

        let length = length as usize;
        if pos + length > bytes.len() {
            return Err(CoreError::Framing("Option value truncated".to_string()));
        }
        let value = &bytes[pos..pos + length];
        pos += length;

        match option_number {
            OPT_URI_PATH => {
                path_segments.push(String::from_utf8_lossy(value).into_owned());
            }
            OPT_MAX_AGE => {
                max_age = Some(uint_from_bytes(value));
            }
            OPT_URI_QUERY => {
                query_items.push(String::from_utf8_lossy(value).into_owned());
            }
            // Unknown elective options are skipped
            _ => {}
        }
    }

    let payload = if pos < bytes.len() {
        // 0xFF marker must be followed by at least one payload byte
        if pos + 1 >= bytes.len() {
            return Err(CoreError::Framing("Payload marker with no payload".to_string()));
        }
        bytes[pos + 1..].to_vec()
    } else {
        Vec::new()
    };

    Ok(Message {
        kind,
        code,
        message_id,
        token,
        uri_path: path_segments.join("/"),
        uri_query: if query_items.is_empty() {
            None
        } else {
            Some(query_items.join("&"))
        },
        max_age,
        payload,
        timestamp: SystemTime::now(),
    })
}

/// Append one option, computing the delta from the previous option number.
fn write_option(buf: &mut Vec<u8>, last_option: &mut u16, number: u16, value: &[u8]) {
    let delta = number - *last_option;
    *last_option = number;

    let (delta_nibble, delta_ext) = option_field(delta);
    let (len_nibble, len_ext) = option_field(value.len() as u16);

    buf.push((delta_nibble << 4) | len_nibble);
    buf.extend_from_slice(&delta_ext);
    buf.extend_from_slice(&len_ext);
    buf.extend_from_slice(value);
}

/// Nibble + extension-byte encoding for option deltas and lengths.
fn option_field(value: u16) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, (value - 269).to_be_bytes().to_vec())
    }
}

/// Decode an option delta or length from its nibble and extension bytes.
/// Returns (value, extension bytes consumed).
fn read_option_field(bytes: &[u8], pos: usize, nibble: u8) -> Result<(u16, usize)> {
    match nibble {
        0..=12 => Ok((nibble as u16, 0)),
        13 => {
            if pos >= bytes.len() {
                return Err(CoreError::Framing("Option extension truncated".to_string()));
            }
            Ok((bytes[pos] as u16 + 13, 1))
        }
        14 => {
            if pos + 2 > bytes.len() {
                return Err(CoreError::Framing("Option extension truncated".to_string()));
            }
            Ok((u16::from_be_bytes([bytes[pos], bytes[pos + 1]]) + 269, 2))
        }
        _ => Err(CoreError::Framing("Reserved option nibble 15".to_string())),
    }
}

/// Shortest big-endian representation of a CoAP uint option value.
fn uint_bytes(value: u32) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

fn uint_from_bytes(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32)
}
