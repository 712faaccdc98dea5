//! Pure transforms between the telephony and backend audio envelopes.
//!
//! Both sides are configured for the same narrow-band codec, so payloads are
//! wrapped, never transcoded. The outbound transform still round-trips the
//! base64 so a malformed delta is caught here instead of reaching the
//! provider.

use crate::ws::{
    backend::ClientEvent,
    protocol::{OutboundFrame, OutboundMediaPayload},
};
use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD};

/// Wraps a telephony audio payload into a backend input-buffer append.
pub fn to_backend_append(payload: &str) -> ClientEvent {
    ClientEvent::InputAudioBufferAppend {
        audio: payload.to_string(),
    }
}

/// Wraps a backend audio delta into a telephony media frame addressed to the
/// given stream SID. Fails on a payload that is not valid base64.
pub fn to_telephony_media(delta: &str, stream_sid: &str) -> Result<OutboundFrame> {
    let decoded = STANDARD
        .decode(delta)
        .context("Audio delta is not valid base64")?;
    Ok(OutboundFrame::Media {
        stream_sid: stream_sid.to_string(),
        media: OutboundMediaPayload {
            payload: STANDARD.encode(decoded),
        },
    })
}
