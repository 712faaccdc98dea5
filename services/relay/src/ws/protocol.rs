//! Defines the wire protocol of the telephony media stream.
//!
//! The provider sends JSON text frames tagged with an `event` field; the
//! relay sends back `media` frames addressed by the stream SID captured from
//! the `start` event.

use serde::{Deserialize, Serialize};

/// An inbound frame from the telephony media stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyEvent {
    /// Opens the stream and assigns the correlation id for the call leg.
    Start { start: StartPayload },
    /// A chunk of caller audio, base64-encoded in the negotiated codec.
    Media { media: MediaPayload },
    /// The provider has stopped the stream.
    Stop,
    /// Any other event kind (e.g. `mark`, `connected`); currently inert.
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct StartPayload {
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
}

/// An outbound frame to the telephony media stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundFrame {
    Media {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        media: OutboundMediaPayload,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMediaPayload {
    pub payload: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_start_event() {
        let raw = json!({"event": "start", "start": {"streamSid": "MZ123"}}).to_string();
        match serde_json::from_str::<TelephonyEvent>(&raw).unwrap() {
            TelephonyEvent::Start { start } => assert_eq!(start.stream_sid, "MZ123"),
            other => panic!("expected start event, got {other:?}"),
        }
    }

    #[test]
    fn parses_media_event() {
        let raw = json!({"event": "media", "media": {"payload": "AAAA"}}).to_string();
        match serde_json::from_str::<TelephonyEvent>(&raw).unwrap() {
            TelephonyEvent::Media { media } => assert_eq!(media.payload, "AAAA"),
            other => panic!("expected media event, got {other:?}"),
        }
    }

    #[test]
    fn parses_stop_event_with_extra_fields() {
        let raw = json!({"event": "stop", "stop": {"accountSid": "AC1"}}).to_string();
        assert!(matches!(
            serde_json::from_str::<TelephonyEvent>(&raw).unwrap(),
            TelephonyEvent::Stop
        ));
    }

    #[test]
    fn unknown_event_kinds_fall_through_to_other() {
        let raw = json!({"event": "mark", "mark": {"name": "greeting"}}).to_string();
        assert!(matches!(
            serde_json::from_str::<TelephonyEvent>(&raw).unwrap(),
            TelephonyEvent::Other
        ));
    }

    #[test]
    fn unparseable_frame_is_an_error() {
        assert!(serde_json::from_str::<TelephonyEvent>("not json").is_err());
    }

    #[test]
    fn outbound_media_frame_shape_is_exact() {
        let frame = OutboundFrame::Media {
            stream_sid: "MZ123".to_string(),
            media: OutboundMediaPayload {
                payload: "BBBB".to_string(),
            },
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"event": "media", "streamSid": "MZ123", "media": {"payload": "BBBB"}})
        );
    }
}
