//! Manages the lifecycle of a single call session.
//!
//! Each accepted media stream gets one coordinator that opens the backend
//! connection, negotiates the session, then runs two relay tasks
//! concurrently: inbound (telephony audio to the backend input buffer) and
//! outbound (backend audio deltas back to the telephony stream). Whichever
//! task finishes first triggers teardown of both connections.
//!
//! The relay loops are generic over text-frame streams and sinks so the
//! relay semantics can be exercised without sockets. No timeouts are imposed
//! here: a backend that stops responding without erroring leaves both tasks
//! parked on their reads until the transport itself fails.

use crate::{
    state::AppState,
    ws::{backend, codec, protocol::TelephonyEvent},
};
use anyhow::{Context, Result};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{
    Sink, SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{fmt, future::ready, sync::Arc};
use tokio::{
    sync::{Mutex, watch},
    task::JoinError,
};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// The lifecycle of one call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Axum handler to upgrade the media-stream HTTP request to a WebSocket.
pub async fn media_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Entry point for an accepted media stream connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let call_id: u32 = rand::random();
    let span = info_span!("call_session", %call_id);
    async move {
        if let Err(e) = run_call_session(socket, state).await {
            error!(error = ?e, "Call session terminated with error.");
        }
        info!("Call session finished.");
    }
    .instrument(span)
    .await
}

/// Opens and configures the backend session, then relays audio in both
/// directions until either side disconnects.
async fn run_call_session(socket: WebSocket, state: Arc<AppState>) -> Result<()> {
    info!(state = %SessionState::Connecting, "Media stream connected. Opening backend session...");

    let backend_ws = backend::connect(&state.config).await?;
    let (backend_tx, backend_rx) = backend_ws.split();
    let mut backend_tx = backend_sink(backend_tx);

    // The session configuration must reach the backend before any audio does.
    // A failure here is fatal; there is no retry.
    let update = backend::session_update(&state.config, &state.instructions);
    backend_tx
        .send(serde_json::to_string(&update)?)
        .await
        .context("Failed to send session configuration to backend")?;
    info!(state = %SessionState::Active, "Session configured. Relaying audio...");

    let (socket_tx, socket_rx) = socket.split();
    run_relay(
        telephony_frames(socket_rx),
        telephony_sink(socket_tx),
        backend_frames(backend_rx),
        backend_tx,
    )
    .await
}

/// Runs both relay tasks concurrently; as soon as the first one returns,
/// closes both connections and cancels the sibling so it cannot linger.
async fn run_relay<TR, TW, BR, BW>(
    telephony_rx: TR,
    telephony_tx: TW,
    backend_rx: BR,
    backend_tx: BW,
) -> Result<()>
where
    TR: Stream<Item = Result<String>> + Unpin + Send + 'static,
    TW: Sink<String, Error = anyhow::Error> + Unpin + Send + 'static,
    BR: Stream<Item = Result<String>> + Unpin + Send + 'static,
    BW: Sink<String, Error = anyhow::Error> + Unpin + Send + 'static,
{
    let telephony_tx = Arc::new(Mutex::new(telephony_tx));
    let backend_tx = Arc::new(Mutex::new(backend_tx));

    // Single-writer cell for the correlation id: the inbound task resolves it
    // from the start event, the outbound task only reads it.
    let (sid_tx, sid_rx) = watch::channel::<Option<String>>(None);

    let mut inbound =
        tokio::spawn(inbound_relay(telephony_rx, backend_tx.clone(), sid_tx).in_current_span());
    let mut outbound =
        tokio::spawn(outbound_relay(backend_rx, telephony_tx.clone(), sid_rx).in_current_span());

    tokio::select! {
        res = &mut inbound => {
            info!(state = %SessionState::Closing, "Telephony side finished first. Tearing down...");
            report_exit("inbound", res);
            close_quietly(&telephony_tx).await;
            close_quietly(&backend_tx).await;
            outbound.abort();
            report_exit("outbound", outbound.await);
        }
        res = &mut outbound => {
            info!(state = %SessionState::Closing, "Backend side finished first. Tearing down...");
            report_exit("outbound", res);
            close_quietly(&telephony_tx).await;
            close_quietly(&backend_tx).await;
            inbound.abort();
            report_exit("inbound", inbound.await);
        }
    }

    info!(state = %SessionState::Closed, "Both connections closed.");
    Ok(())
}

/// Consumes the telephony stream: forwards caller audio to the backend and
/// captures the stream SID from the start event. An unparseable frame is
/// fatal; the provider's framing is assumed reliable.
async fn inbound_relay<R, W>(
    mut telephony_rx: R,
    backend_tx: Arc<Mutex<W>>,
    stream_sid: watch::Sender<Option<String>>,
) -> Result<()>
where
    R: Stream<Item = Result<String>> + Unpin,
    W: Sink<String, Error = anyhow::Error> + Unpin,
{
    while let Some(frame) = telephony_rx.next().await {
        let frame = frame.context("Error receiving from telephony stream")?;
        let event: TelephonyEvent =
            serde_json::from_str(&frame).context("Unparseable telephony frame")?;
        match event {
            TelephonyEvent::Media { media } => {
                let append = codec::to_backend_append(&media.payload);
                backend_tx
                    .lock()
                    .await
                    .send(serde_json::to_string(&append)?)
                    .await
                    .context("Failed to forward audio to backend")?;
            }
            TelephonyEvent::Start { start } => {
                // First start wins; a repeated start cannot re-address frames
                // that were already forwarded.
                let captured = stream_sid.send_if_modified(|current| {
                    if current.is_none() {
                        *current = Some(start.stream_sid.clone());
                        true
                    } else {
                        false
                    }
                });
                if captured {
                    info!(stream_sid = %start.stream_sid, "Incoming stream has started.");
                } else {
                    warn!(stream_sid = %start.stream_sid, "Ignoring repeated start event.");
                }
            }
            TelephonyEvent::Stop | TelephonyEvent::Other => {}
        }
    }
    info!("Telephony stream closed.");
    Ok(())
}

/// Consumes the backend event stream: logs the allow-listed kinds and
/// forwards audio deltas to the telephony stream. A malformed event or delta
/// is dropped; losing one delta degrades audio but must not end the call.
async fn outbound_relay<R, W>(
    mut backend_rx: R,
    telephony_tx: Arc<Mutex<W>>,
    stream_sid: watch::Receiver<Option<String>>,
) -> Result<()>
where
    R: Stream<Item = Result<String>> + Unpin,
    W: Sink<String, Error = anyhow::Error> + Unpin,
{
    while let Some(frame) = backend_rx.next().await {
        let frame = frame.context("Error receiving from backend stream")?;
        let event: backend::ServerEvent = match serde_json::from_str(&frame) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Discarding unparseable backend event.");
                continue;
            }
        };
        if backend::LOG_EVENT_TYPES.contains(&event.kind()) {
            info!(kind = event.kind(), "Received backend event.");
        }
        match event {
            backend::ServerEvent::SessionUpdated => {
                info!("Session configuration acknowledged by backend.");
            }
            backend::ServerEvent::ResponseAudioDelta { delta: Some(delta) } => {
                let sid = stream_sid.borrow().clone();
                let Some(sid) = sid else {
                    // The delta raced the start event; without a stream SID
                    // the frame is unaddressable, so it is dropped.
                    warn!("Dropping audio delta received before the stream SID was captured.");
                    continue;
                };
                match codec::to_telephony_media(&delta, &sid) {
                    Ok(media_frame) => {
                        telephony_tx
                            .lock()
                            .await
                            .send(serde_json::to_string(&media_frame)?)
                            .await
                            .context("Failed to forward audio to telephony stream")?;
                    }
                    Err(e) => warn!(error = %e, "Discarding malformed audio delta."),
                }
            }
            _ => {}
        }
    }
    info!("Backend stream closed.");
    Ok(())
}

fn report_exit(side: &str, result: std::result::Result<Result<()>, JoinError>) {
    match result {
        Ok(Ok(())) => info!(side, "Relay task finished."),
        Ok(Err(e)) => warn!(side, error = ?e, "Relay task failed."),
        Err(e) if e.is_cancelled() => debug!(side, "Relay task cancelled."),
        Err(e) => error!(side, error = ?e, "Relay task panicked."),
    }
}

/// Closes a connection sink, swallowing the error if it is already closed.
async fn close_quietly<W>(sink: &Mutex<W>)
where
    W: Sink<String, Error = anyhow::Error> + Unpin,
{
    if let Err(e) = sink.lock().await.close().await {
        debug!(error = %e, "Connection was already closed.");
    }
}

fn telephony_frames(
    socket_rx: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<String>> + Unpin + Send + 'static {
    socket_rx.filter_map(|msg| {
        ready(match msg {
            Ok(Message::Text(text)) => Some(Ok(text.to_string())),
            Ok(_) => None,
            Err(e) => Some(Err(anyhow::Error::from(e))),
        })
    })
}

fn telephony_sink(
    socket_tx: SplitSink<WebSocket, Message>,
) -> impl Sink<String, Error = anyhow::Error> + Unpin + Send + 'static {
    socket_tx.with(|frame: String| ready(Ok::<_, anyhow::Error>(Message::Text(frame.into()))))
}

fn backend_frames(
    backend_rx: SplitStream<backend::BackendStream>,
) -> impl Stream<Item = Result<String>> + Unpin + Send + 'static {
    backend_rx.filter_map(|msg| {
        ready(match msg {
            Ok(WsMessage::Text(text)) => Some(Ok(text.to_string())),
            Ok(_) => None,
            Err(e) => Some(Err(anyhow::Error::from(e))),
        })
    })
}

fn backend_sink(
    backend_tx: SplitSink<backend::BackendStream, WsMessage>,
) -> impl Sink<String, Error = anyhow::Error> + Unpin + Send + 'static {
    backend_tx.with(|frame: String| ready(Ok::<_, anyhow::Error>(WsMessage::Text(frame.into()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{channel::mpsc, stream};
    use serde_json::{Value, json};
    use std::time::Duration;
    use tokio::time::timeout;

    fn sink_pair() -> (
        impl Sink<String, Error = anyhow::Error> + Unpin + Send + 'static,
        mpsc::UnboundedReceiver<String>,
    ) {
        let (tx, rx) = mpsc::unbounded::<String>();
        (tx.sink_map_err(anyhow::Error::from), rx)
    }

    fn frames(raw: Vec<Value>) -> impl Stream<Item = Result<String>> + Unpin + Send + 'static {
        stream::iter(raw.into_iter().map(|v| Ok(v.to_string())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn media_frames_become_backend_appends() {
        let telephony_rx = frames(vec![
            json!({"event": "start", "start": {"streamSid": "SID1"}}),
            json!({"event": "media", "media": {"payload": "AAAA"}}),
        ]);
        let (backend_tx, mut backend_rx) = sink_pair();
        let (sid_tx, sid_rx) = watch::channel::<Option<String>>(None);

        inbound_relay(telephony_rx, Arc::new(Mutex::new(backend_tx)), sid_tx)
            .await
            .unwrap();

        assert_eq!(sid_rx.borrow().as_deref(), Some("SID1"));
        let sent: Value = serde_json::from_str(&backend_rx.next().await.unwrap()).unwrap();
        assert_eq!(sent["type"], "input_audio_buffer.append");
        assert_eq!(sent["audio"], "AAAA");
        assert!(
            matches!(backend_rx.try_next(), Ok(None)),
            "exactly one append expected"
        );
    }

    #[tokio::test]
    async fn stop_and_unknown_events_are_inert() {
        let telephony_rx = frames(vec![
            json!({"event": "stop", "stop": {}}),
            json!({"event": "mark", "mark": {"name": "x"}}),
        ]);
        let (backend_tx, mut backend_rx) = sink_pair();
        let (sid_tx, _sid_rx) = watch::channel::<Option<String>>(None);

        inbound_relay(telephony_rx, Arc::new(Mutex::new(backend_tx)), sid_tx)
            .await
            .unwrap();
        assert!(matches!(backend_rx.try_next(), Ok(None)));
    }

    #[tokio::test]
    async fn repeated_start_event_is_ignored() {
        let telephony_rx = frames(vec![
            json!({"event": "start", "start": {"streamSid": "SID1"}}),
            json!({"event": "start", "start": {"streamSid": "SID2"}}),
        ]);
        let (backend_tx, _backend_rx) = sink_pair();
        let (sid_tx, sid_rx) = watch::channel::<Option<String>>(None);

        inbound_relay(telephony_rx, Arc::new(Mutex::new(backend_tx)), sid_tx)
            .await
            .unwrap();
        assert_eq!(sid_rx.borrow().as_deref(), Some("SID1"));
    }

    #[tokio::test]
    async fn unparseable_telephony_frame_is_fatal() {
        let telephony_rx = stream::iter(vec![Ok::<_, anyhow::Error>("not json".to_string())]);
        let (backend_tx, _backend_rx) = sink_pair();
        let (sid_tx, _sid_rx) = watch::channel::<Option<String>>(None);

        let result = inbound_relay(telephony_rx, Arc::new(Mutex::new(backend_tx)), sid_tx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn audio_deltas_are_forwarded_with_captured_sid() {
        let backend_rx = frames(vec![
            json!({"type": "response.audio.delta", "delta": "BBBB"}),
        ]);
        let (telephony_tx, mut telephony_rx) = sink_pair();
        let (_sid_tx, sid_rx) = watch::channel(Some("SID1".to_string()));

        outbound_relay(backend_rx, Arc::new(Mutex::new(telephony_tx)), sid_rx)
            .await
            .unwrap();

        let sent: Value = serde_json::from_str(&telephony_rx.next().await.unwrap()).unwrap();
        assert_eq!(
            sent,
            json!({"event": "media", "streamSid": "SID1", "media": {"payload": "BBBB"}})
        );
        assert!(
            matches!(telephony_rx.try_next(), Ok(None)),
            "exactly one frame expected"
        );
    }

    #[tokio::test]
    async fn delta_before_start_is_dropped() {
        let backend_rx = frames(vec![
            json!({"type": "response.audio.delta", "delta": "BBBB"}),
        ]);
        let (telephony_tx, mut telephony_rx) = sink_pair();
        let (_sid_tx, sid_rx) = watch::channel::<Option<String>>(None);

        outbound_relay(backend_rx, Arc::new(Mutex::new(telephony_tx)), sid_rx)
            .await
            .unwrap();
        assert!(matches!(telephony_rx.try_next(), Ok(None)));
    }

    #[tokio::test]
    async fn malformed_delta_is_dropped_and_the_task_continues() {
        let backend_rx = frames(vec![
            json!({"type": "response.audio.delta", "delta": "!!!not-base64!!!"}),
            json!({"type": "response.audio.delta", "delta": "BBBB"}),
        ]);
        let (telephony_tx, mut telephony_rx) = sink_pair();
        let (_sid_tx, sid_rx) = watch::channel(Some("SID1".to_string()));

        outbound_relay(backend_rx, Arc::new(Mutex::new(telephony_tx)), sid_rx)
            .await
            .unwrap();

        let sent: Value = serde_json::from_str(&telephony_rx.next().await.unwrap()).unwrap();
        assert_eq!(sent["media"]["payload"], "BBBB");
        assert!(matches!(telephony_rx.try_next(), Ok(None)));
    }

    #[tokio::test]
    async fn unparseable_and_inert_backend_events_do_not_emit_frames() {
        let backend_rx = stream::iter(vec![
            Ok::<_, anyhow::Error>("not json".to_string()),
            Ok(json!({"type": "session.created"}).to_string()),
            Ok(json!({"type": "rate_limits.updated"}).to_string()),
            Ok(json!({"type": "response.function_call_arguments.delta"}).to_string()),
        ]);
        let (telephony_tx, mut telephony_rx) = sink_pair();
        let (_sid_tx, sid_rx) = watch::channel(Some("SID1".to_string()));

        outbound_relay(backend_rx, Arc::new(Mutex::new(telephony_tx)), sid_rx)
            .await
            .unwrap();
        assert!(matches!(telephony_rx.try_next(), Ok(None)));
    }

    #[tokio::test]
    async fn end_to_end_audio_round_trip() {
        let (sid_tx, sid_rx) = watch::channel::<Option<String>>(None);

        let telephony_rx = frames(vec![
            json!({"event": "start", "start": {"streamSid": "SID1"}}),
            json!({"event": "media", "media": {"payload": "AAAA"}}),
        ]);
        let (backend_tx, mut backend_out) = sink_pair();
        inbound_relay(telephony_rx, Arc::new(Mutex::new(backend_tx)), sid_tx)
            .await
            .unwrap();

        let append: Value = serde_json::from_str(&backend_out.next().await.unwrap()).unwrap();
        assert_eq!(
            append,
            json!({"type": "input_audio_buffer.append", "audio": "AAAA"})
        );

        let backend_rx = frames(vec![
            json!({"type": "response.audio.delta", "delta": "BBBB"}),
        ]);
        let (telephony_tx, mut telephony_out) = sink_pair();
        outbound_relay(backend_rx, Arc::new(Mutex::new(telephony_tx)), sid_rx)
            .await
            .unwrap();

        let media: Value = serde_json::from_str(&telephony_out.next().await.unwrap()).unwrap();
        assert_eq!(
            media,
            json!({"event": "media", "streamSid": "SID1", "media": {"payload": "BBBB"}})
        );
    }

    #[tokio::test]
    async fn telephony_disconnect_tears_down_the_backend_side() {
        // Telephony hangs up immediately; the backend side would otherwise
        // wait forever on its pending stream.
        let telephony_rx = stream::iter(Vec::<Result<String>>::new());
        let (telephony_tx, _telephony_out) = sink_pair();
        let backend_rx = stream::pending::<Result<String>>();
        let (backend_tx, mut backend_out) = sink_pair();

        let result = timeout(
            Duration::from_secs(1),
            run_relay(telephony_rx, telephony_tx, backend_rx, backend_tx),
        )
        .await
        .expect("teardown must complete within the bound");
        assert!(result.is_ok());
        assert_eq!(backend_out.next().await, None, "backend sink must be closed");
    }

    #[tokio::test]
    async fn backend_disconnect_tears_down_the_telephony_side() {
        let telephony_rx = stream::pending::<Result<String>>();
        let (telephony_tx, mut telephony_out) = sink_pair();
        let backend_rx = stream::iter(Vec::<Result<String>>::new());
        let (backend_tx, _backend_out) = sink_pair();

        let result = timeout(
            Duration::from_secs(1),
            run_relay(telephony_rx, telephony_tx, backend_rx, backend_tx),
        )
        .await
        .expect("teardown must complete within the bound");
        assert!(result.is_ok());
        assert_eq!(telephony_out.next().await, None, "telephony sink must be closed");
    }

    #[tokio::test]
    async fn closing_an_already_closed_connection_is_quiet() {
        let (sink, _rx) = sink_pair();
        let sink = Mutex::new(sink);
        close_quietly(&sink).await;
        close_quietly(&sink).await;
    }
}
