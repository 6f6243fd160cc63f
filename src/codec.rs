//! Stateless codec between [`Frame`] and the STOMP wire representation.
//!
//! The transport is message-framed: one raw transport message carries at
//! most one frame, so encode/decode work on whole payloads rather than a
//! byte-stream buffer. The codec injects no headers; `content-length` and
//! `content-type` are owned by the request-population chain.

use crate::error::StompError;
use crate::frame::{Frame, FrameType, Headers, headers};
use crate::transport::RawMessage;

/// Items produced by [`decode`].
///
/// A `StompItem` is either a typed frame or a heartbeat marker. Heartbeats
/// carry no payload and must never be handed to type-specific routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StompItem {
    Frame(Frame),
    Heartbeat,
}

/// Encode a frame into its wire form:
/// `TYPE\n` + `key:value\n` per header in insertion order + `\n` + body + `\0`.
pub fn encode(frame: &Frame) -> RawMessage {
    let body = frame.body.as_deref().unwrap_or("");
    let mut out = String::with_capacity(body.len() + 64);
    out.push_str(frame.frame_type.as_str());
    out.push('\n');
    for (k, v) in frame.headers.iter() {
        out.push_str(k);
        out.push(':');
        out.push_str(v);
        out.push('\n');
    }
    out.push('\n');
    out.push_str(body);
    out.push('\0');
    RawMessage::Text(out)
}

/// The client-to-server heartbeat pulse: a bare LF.
pub fn heartbeat() -> RawMessage {
    RawMessage::Text("\n".to_string())
}

/// Decode one raw transport message into a frame or heartbeat marker.
///
/// `trim_headers` selects the version-dependent treatment of header values:
/// STOMP 1.0 engines strip surrounding whitespace, 1.1/1.2 preserve it
/// byte-exact.
pub fn decode(raw: &RawMessage, trim_headers: bool) -> Result<StompItem, StompError> {
    let data: &str = match raw {
        RawMessage::Text(s) => s.as_str(),
        RawMessage::Binary(b) => std::str::from_utf8(b)
            .map_err(|e| StompError::MalformedFrame(format!("payload is not valid UTF-8: {e}")))?,
    };

    if data.is_empty() || data.starts_with('\n') || data.starts_with('\0') || data == "\r\n" {
        return Ok(StompItem::Heartbeat);
    }

    let line_end = data
        .find('\n')
        .ok_or_else(|| StompError::MalformedFrame("missing EOL after command line".to_string()))?;
    let command = strip_cr(&data[..line_end]);
    let frame_type = FrameType::parse(command)
        .ok_or_else(|| StompError::MalformedFrame(format!("unknown frame type: {command}")))?;

    let mut rest = &data[line_end + 1..];
    let mut parsed = Headers::new();
    loop {
        let line_end = rest.find('\n').ok_or_else(|| {
            StompError::MalformedFrame("missing blank line after headers".to_string())
        })?;
        let line = strip_cr(&rest[..line_end]);
        rest = &rest[line_end + 1..];
        if line.is_empty() {
            break;
        }
        let colon = line.find(':').ok_or_else(|| {
            StompError::MalformedFrame(format!("header line without ':' delimiter: {line}"))
        })?;
        let value = &line[colon + 1..];
        let value = if trim_headers { value.trim() } else { value };
        // first occurrence wins on duplicate keys
        parsed.set_if_absent(&line[..colon], value);
    }

    let nul = rest
        .rfind('\0')
        .ok_or_else(|| StompError::MalformedFrame("missing NUL terminator".to_string()))?;
    let mut body = &rest[..nul];

    if let Some(declared) = parsed.get(headers::CONTENT_LENGTH) {
        let length: i64 = declared.trim().parse().map_err(|_| {
            StompError::MalformedFrame(format!("invalid content-length: {declared}"))
        })?;
        if length < 0 {
            return Err(StompError::MalformedFrame(format!(
                "negative content-length: {length}"
            )));
        }
        let length = length as usize;
        if length > body.len() {
            return Err(StompError::MalformedFrame(format!(
                "content-length {length} exceeds payload length {}",
                body.len()
            )));
        }
        body = body.get(..length).ok_or_else(|| {
            StompError::MalformedFrame(format!(
                "content-length {length} splits a UTF-8 character"
            ))
        })?;
    }

    let content_type = parsed.get(headers::CONTENT_TYPE).map(str::to_string);
    Ok(StompItem::Frame(Frame {
        frame_type,
        headers: parsed,
        body: if body.is_empty() {
            None
        } else {
            Some(body.to_string())
        },
        content_type,
    }))
}

fn strip_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}
