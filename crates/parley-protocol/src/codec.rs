//! Codec for encoding and decoding Parley envelopes.
//!
//! Envelopes travel as JSON text, both on client connections and on the
//! presence store's pub/sub bus.

use thiserror::Error;

use crate::envelope::Envelope;

/// Maximum encoded envelope size (64 KiB).
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds maximum size.
    #[error("Envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    EnvelopeTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode an envelope to JSON text.
///
/// # Errors
///
/// Returns an error if the envelope is too large or encoding fails.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope)?;

    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode an envelope from JSON bytes.
///
/// # Errors
///
/// Returns an error if the data is too large or not a JSON envelope.
pub fn decode(data: &[u8]) -> Result<Envelope, ProtocolError> {
    if data.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::EnvelopeTooLarge(data.len()));
    }

    Ok(serde_json::from_slice(data)?)
}

/// Decode an envelope, falling back to the zero-valued envelope.
///
/// Malformed input is not an error here: the caller gets an envelope with
/// every field empty.
#[must_use]
pub fn decode_lenient(data: &[u8]) -> Envelope {
    decode(data).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::MessageKind;

    #[test]
    fn test_wire_field_names() {
        let envelope = Envelope::text("lobby", "alice", "hi", 1_700_000_000);
        let text = encode(&envelope).unwrap();

        assert_eq!(
            text,
            r#"{"Content":"hi","Channel":"lobby","From":"alice","Type":"text","TimeStamp":1700000000}"#
        );
    }

    #[test]
    fn test_timestamp_only_on_text() {
        let text = encode(&Envelope::joined("lobby", "bob")).unwrap();
        assert!(!text.contains("TimeStamp"));
        assert!(text.contains(r#""Type":"joined""#));
    }

    #[test]
    fn test_decode_client_payload() {
        let payload = br#"{"From":"bob","Channel":"lobby","Content":"hello","Type":"text"}"#;
        let envelope = decode(payload).unwrap();

        assert_eq!(envelope.from, "bob");
        assert_eq!(envelope.content, "hello");
        assert_eq!(envelope.kind, MessageKind::Text);
        assert!(envelope.timestamp.is_none());
    }

    #[test]
    fn test_decode_partial_and_unknown_type() {
        let envelope = decode(br#"{"Content":"hey","Type":"shout"}"#).unwrap();
        assert_eq!(envelope.content, "hey");
        assert_eq!(envelope.kind, MessageKind::Unknown);
        assert!(envelope.channel.is_empty());
    }

    #[test]
    fn test_decode_lenient_malformed() {
        assert!(decode(b"not json").is_err());
        assert!(decode_lenient(b"not json").is_empty());
        assert!(decode_lenient(br#"{"Content": 5}"#).is_empty());
    }

    #[test]
    fn test_envelope_too_large() {
        let envelope = Envelope::text("lobby", "alice", "x".repeat(MAX_ENVELOPE_SIZE), 0);

        match encode(&envelope) {
            Err(ProtocolError::EnvelopeTooLarge(_)) => {}
            other => panic!("Expected EnvelopeTooLarge error, got {:?}", other),
        }
    }
}
