// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `for(;;);[...]` text framing.
//!
//! Every server payload is a JSON array preceded by the marker `for(;;);`.
//! A response may carry several such segments back to back. Segment ends are
//! found by parsing the JSON, so the marker appearing inside a string value
//! never splits a payload.

use serde::de::IgnoredAny;
use serde_json::Value;
use tracing::debug;

use crate::error::DecodeError;
use crate::message::ServerMessage;

/// Marker preceding every JSON payload segment.
pub const PREFIX: &str = "for(;;);";

/// Wraps one JSON message as `for(;;);[<json>]`.
pub fn wrap(json: &str) -> String {
    let mut out = String::with_capacity(PREFIX.len() + json.len() + 2);
    out.push_str(PREFIX);
    out.push('[');
    out.push_str(json);
    out.push(']');
    out
}

/// Splits a single or concatenated framed response into its JSON arrays.
///
/// Whitespace between segments is tolerated; anything else outside a segment
/// is an error.
pub fn split_payloads(raw: &str) -> Result<Vec<&str>, DecodeError> {
    let mut rest = raw.trim_start();
    if rest.is_empty() {
        return Err(DecodeError::Empty);
    }
    let mut out = Vec::new();
    while !rest.is_empty() {
        let offset = raw.len() - rest.len();
        let body = rest
            .strip_prefix(PREFIX)
            .ok_or(DecodeError::MissingPrefix { offset })?
            .trim_start();
        if !body.starts_with('[') {
            return Err(DecodeError::NotAnArray);
        }
        let mut stream = serde_json::Deserializer::from_str(body).into_iter::<IgnoredAny>();
        match stream.next() {
            Some(Ok(_)) => {}
            Some(Err(err)) => return Err(DecodeError::Json(err.to_string())),
            None => return Err(DecodeError::Empty),
        }
        let end = stream.byte_offset();
        out.push(&body[..end]);
        rest = body[end..].trim_start();
    }
    Ok(out)
}

/// Splits and decodes a whole response.
///
/// All-or-nothing: if any segment or record is malformed nothing is returned.
pub fn decode_response(raw: &str) -> Result<Vec<ServerMessage>, DecodeError> {
    let mut messages = Vec::new();
    for segment in split_payloads(raw)? {
        let items: Vec<Value> =
            serde_json::from_str(segment).map_err(|e| DecodeError::Json(e.to_string()))?;
        for item in &items {
            messages.push(ServerMessage::from_json(item)?);
        }
    }
    debug!(messages = messages.len(), bytes = raw.len(), "decoded response");
    Ok(messages)
}
