//! Axum Handlers for the Call-Setup HTTP Surface
//!
//! These endpoints sit in front of the relay: a health check and the
//! call-setup webhook that answers the telephony provider with a
//! call-control (TwiML) document pointing it at the `/media-stream`
//! WebSocket endpoint.

use axum::{
    extract::State,
    http::{HeaderMap, header},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;

use crate::state::AppState;

/// Health-check endpoint.
pub async fn index() -> Json<serde_json::Value> {
    Json(json!({ "message": "Telephony media stream relay is running!" }))
}

/// Answers the provider's incoming-call webhook with a call-control document
/// that greets the caller and connects the call audio to `/media-stream`.
pub async fn incoming_call(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let body = call_control_document(&state.config.welcome_message, host);
    ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
}

fn call_control_document(welcome_message: &str, host: &str) -> String {
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<Response>",
            "<Say voice=\"Polly.Danielle-Neural\">{}</Say>",
            "<Pause length=\"1\"/>",
            "<Connect><Stream url=\"wss://{}/media-stream\"/></Connect>",
            "</Response>"
        ),
        escape_xml(welcome_message),
        host
    )
}

fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_points_stream_at_media_endpoint() {
        let doc = call_control_document("Welcome.", "relay.example.com");
        assert!(doc.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(doc.contains("<Say voice=\"Polly.Danielle-Neural\">Welcome.</Say>"));
        assert!(doc.contains("<Stream url=\"wss://relay.example.com/media-stream\"/>"));
    }

    #[test]
    fn welcome_message_is_escaped() {
        let doc = call_control_document("Smith & Sons <est. 1920>", "localhost");
        assert!(doc.contains("Smith &amp; Sons &lt;est. 1920&gt;"));
    }
}
