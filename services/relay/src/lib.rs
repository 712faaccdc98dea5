//! Callbridge Relay Library Crate
//!
//! This library contains all the core logic for the telephony voice-agent
//! relay: configuration, the call-setup HTTP handlers, and the WebSocket
//! session logic that bridges a telephony media stream to a realtime
//! speech-to-speech backend. The `bin/relay.rs` binary is a thin wrapper
//! around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
