//! Wire framing for the streaming connection.
//!
//! Messages travel inside a length-prefixed text envelope:
//! `~m~<decimal-length>~m~<payload>` where the length counts payload bytes.
//! A single socket message may carry several envelopes back to back.
//!
//! Two payload forms are recognized by pattern rather than being full
//! structured messages: the heartbeat probe `~h~<decimal>` and any payload
//! carrying the `no_session` signal. [`classify`] turns these into
//! [`FramePayload`] variants so the transport can synthesize structured
//! messages for them.

use anyhow::{bail, Result};
use serde_json::Value;

/// Envelope marker separating the length prefix from the payload.
const MARKER: &str = "~m~";

/// Heartbeat probe marker.
const HEARTBEAT: &str = "~h~";

/// A decoded frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePayload {
    /// Heartbeat probe carrying its decimal counter. Must be echoed back
    /// verbatim as an acknowledgement.
    Heartbeat(String),
    /// The server signalled that no authenticated session exists.
    NoSession,
    /// A structured JSON message.
    Message(Value),
}

/// Wrap a payload in the `~m~<len>~m~` envelope.
#[must_use]
pub fn encode(payload: &str) -> String {
    format!("{MARKER}{}{MARKER}{payload}", payload.len())
}

/// Render a heartbeat payload for echoing back.
#[must_use]
pub fn heartbeat(counter: &str) -> String {
    format!("{HEARTBEAT}{counter}")
}

/// Decode every envelope in a socket message, in order.
///
/// # Errors
///
/// Returns an error if the text does not start with a well-formed envelope
/// or a declared length overruns the available bytes.
pub fn decode(text: &str) -> Result<Vec<&str>> {
    let mut payloads = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        let Some(after_marker) = rest.strip_prefix(MARKER) else {
            bail!("malformed frame: expected '{MARKER}' prefix in {text:?}");
        };
        let digits_end = after_marker
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after_marker.len());
        let Some(body) = after_marker[digits_end..].strip_prefix(MARKER) else {
            bail!("malformed frame: missing closing '{MARKER}' in {text:?}");
        };
        let len: usize = after_marker[..digits_end].parse().unwrap_or(body.len());
        let Some(payload) = body.get(..len) else {
            bail!("malformed frame: declared length {len} splits or exceeds payload in {text:?}");
        };
        payloads.push(payload);
        rest = &body[len..];
    }

    Ok(payloads)
}

/// Classify a decoded payload into its structured form.
///
/// # Errors
///
/// Returns an error if the payload is neither a recognized special form
/// nor valid JSON.
pub fn classify(payload: &str) -> Result<FramePayload> {
    if let Some(counter) = payload.strip_prefix(HEARTBEAT) {
        if !counter.is_empty() && counter.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(FramePayload::Heartbeat(counter.to_string()));
        }
    }
    if payload.contains("no_session") {
        return Ok(FramePayload::NoSession);
    }
    let value: Value = serde_json::from_str(payload)?;
    Ok(FramePayload::Message(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_prefixes_byte_length() {
        assert_eq!(encode("hello"), "~m~5~m~hello");
        assert_eq!(encode(""), "~m~0~m~");
    }

    #[test]
    fn test_decode_single_frame() {
        let payloads = decode("~m~5~m~hello").unwrap();
        assert_eq!(payloads, vec!["hello"]);
    }

    #[test]
    fn test_decode_batched_frames_in_order() {
        let payloads = decode("~m~5~m~hello~m~3~m~abc").unwrap();
        assert_eq!(payloads, vec!["hello", "abc"]);
    }

    #[test]
    fn test_decode_rejects_missing_prefix() {
        assert!(decode("hello").is_err());
    }

    #[test]
    fn test_decode_rejects_overrun_length() {
        assert!(decode("~m~99~m~short").is_err());
    }

    #[test]
    fn test_decode_rejects_length_inside_multibyte_char() {
        // A length landing mid-character must error, not panic.
        assert!(decode("~m~1~m~é").is_err());
        assert_eq!(decode("~m~2~m~é").unwrap(), vec!["é"]);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let msg = r#"{"api":"room.register","msgid":1}"#;
        assert_eq!(decode(&encode(msg)).unwrap(), vec![msg]);
    }

    #[test]
    fn test_classify_heartbeat() {
        assert_eq!(
            classify("~h~4921").unwrap(),
            FramePayload::Heartbeat("4921".to_string())
        );
    }

    #[test]
    fn test_classify_no_session() {
        assert_eq!(classify("no_session").unwrap(), FramePayload::NoSession);
    }

    #[test]
    fn test_classify_json_message() {
        let payload = classify(r#"{"msgid":3,"success":true}"#).unwrap();
        assert_eq!(
            payload,
            FramePayload::Message(json!({"msgid": 3, "success": true}))
        );
    }

    #[test]
    fn test_classify_garbage_is_error() {
        assert!(classify("~z~nonsense").is_err());
    }
}
