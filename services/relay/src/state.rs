//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources handed to every handler: the loaded configuration and
//! the instructions text injected into each backend session.

use crate::config::Config;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// The business system prompt sent to the backend as session instructions.
    /// Loaded from a file at startup; never hard-coded in the relay.
    pub instructions: Arc<String>,
}
