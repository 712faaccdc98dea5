//! WebSocket Relay Core
//!
//! This module contains the bidirectional streaming relay between a telephony
//! media stream and the realtime speech-to-speech backend. It is structured
//! into submodules for clarity:
//!
//! - `protocol`: Wire format of the telephony media-stream events.
//! - `backend`: Wire format of the backend events, session negotiation, and
//!   the backend WebSocket connection.
//! - `codec`: Pure transforms between the two audio envelopes.
//! - `session`: The per-call coordinator that runs both relay directions and
//!   drives teardown.

pub mod backend;
pub mod codec;
pub mod protocol;
pub mod session;

pub use session::media_stream_handler;
