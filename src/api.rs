use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, Stream, StreamExt,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::broker::{Broker, BrokerError, BrokerStats};
use crate::message::Message;
use crate::subscriber::{Deliver, DeliveryError, Subscription};
use crate::waiter::WaitOutcome;

/// Response header carrying the message sequence number.
pub const SEQ_HEADER: HeaderName = HeaderName::from_static("x-message-seq");

/// Events buffered between a subscriber's forward task and its SSE body.
const SSE_BUFFER: usize = 16;

#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    /// Used when a long poll does not pass `timeout_ms`.
    pub long_poll_timeout: Duration,
    /// Upper bound on a client-supplied `timeout_ms`.
    pub max_long_poll_timeout: Duration,
    pub keep_alive: Duration,
}

impl AppState {
    pub fn new(broker: Broker) -> Self {
        Self {
            broker,
            long_poll_timeout: Duration::from_secs(5),
            max_long_poll_timeout: Duration::from_secs(60),
            keep_alive: Duration::from_secs(15),
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.to_string() }));
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

fn message_response(message: &Message) -> Response {
    let content_type = match message.as_text() {
        Some(_) => "text/plain; charset=utf-8",
        None => "application/octet-stream",
    };
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (SEQ_HEADER, message.seq().to_string()),
        ],
        message.payload().clone(),
    )
        .into_response()
}

/// Short poll: answer immediately with whatever is stored.
async fn short_poll(State(state): State<AppState>) -> Response {
    match state.broker.latest() {
        Some(message) => message_response(&message),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct LongPollParams {
    timeout_ms: Option<u64>,
}

/// Long poll. If the client disconnects, axum drops this future and the
/// pending waiter is cancelled with it.
async fn long_poll(State(state): State<AppState>, Query(params): Query<LongPollParams>) -> Response {
    let timeout = params
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(state.long_poll_timeout)
        .min(state.max_long_poll_timeout);

    match state.broker.await_message(timeout).await {
        Ok(WaitOutcome::Message(message)) => message_response(&message),
        Ok(WaitOutcome::Timeout | WaitOutcome::Cancelled) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn send_message(State(state): State<AppState>, body: Bytes) -> StatusCode {
    state.broker.publish(body);
    StatusCode::NO_CONTENT
}

async fn stats(State(state): State<AppState>) -> Json<BrokerStats> {
    Json(state.broker.stats())
}

/// Writes messages as SSE events into the response body channel.
struct SseSink {
    tx: mpsc::Sender<Event>,
}

impl Deliver for SseSink {
    async fn deliver(&mut self, message: Message) -> Result<(), DeliveryError> {
        // SSE has no way to carry a bare carriage return inside data
        let data = message.text_lossy().replace("\r\n", "\n").replace('\r', "\n");
        let event = Event::default()
            .id(message.seq().to_string())
            .event("message")
            .data(data);
        self.tx.send(event).await.map_err(|_| DeliveryError::Disconnected)
    }

    /// The body stream owns the receiver, so this fires when the client
    /// hangs up even if nothing is being published.
    async fn closed(&self) {
        self.tx.closed().await
    }
}

async fn subscribe(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, BrokerError> {
    let subscription = state.broker.subscribe()?;
    let (tx, rx) = mpsc::channel(SSE_BUFFER);

    // Ends when the client goes away or the subscriber is closed; either
    // way the body stream then finishes.
    tokio::spawn(subscription.forward(SseSink { tx }));

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

/// Writes messages as websocket frames: text when the payload is UTF-8,
/// binary otherwise.
struct WsSink {
    tx: SplitSink<WebSocket, WsMessage>,
}

impl Deliver for WsSink {
    async fn deliver(&mut self, message: Message) -> Result<(), DeliveryError> {
        let frame = match message.as_text() {
            Some(text) => WsMessage::Text(text.to_owned().into()),
            None => WsMessage::Binary(message.payload().clone()),
        };
        self.tx
            .send(frame)
            .await
            .map_err(|e| DeliveryError::Transport(Box::new(e)))
    }
}

async fn websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    // Subscribe before upgrading so capacity errors reach the client as a
    // plain HTTP response.
    let subscription = match state.broker.subscribe() {
        Ok(subscription) => subscription,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| async move {
        let (ws_tx, ws_rx) = socket.split();
        handle_websocket(ws_tx, ws_rx, subscription, state.broker).await
    })
}

async fn handle_websocket(
    ws_tx: SplitSink<WebSocket, WsMessage>,
    mut ws_rx: SplitStream<WebSocket>,
    subscription: Subscription,
    broker: Broker,
) {
    let id = subscription.id();
    tracing::debug!(subscriber = %id, "websocket connected");

    // Task: broker -> WebSocket
    let mut tx_task = tokio::spawn(subscription.forward(WsSink { tx: ws_tx }));

    // Task: WebSocket -> broker
    let mut rx_task = tokio::spawn(async move {
        let shutdown = broker.shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            let msg = tokio::select! {
                _ = &mut shutdown => break,
                msg = ws_rx.next() => msg,
            };
            let data = match msg {
                Some(Ok(WsMessage::Text(text))) => Bytes::copy_from_slice(text.as_str().as_bytes()),
                Some(Ok(WsMessage::Binary(data))) => data,
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => continue,
            };
            broker.publish(data);
        }
    });

    // Wait for either task to finish, then abort the other
    tokio::select! {
        _ = &mut tx_task => rx_task.abort(),
        _ = &mut rx_task => tx_task.abort(),
    }
    tracing::debug!(subscriber = %id, "websocket disconnected");
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/short", get(short_poll))
        .route("/long", get(long_poll))
        .route("/send-message", post(send_message))
        .route("/subscribe", get(subscribe))
        .route("/websocket", get(websocket))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
