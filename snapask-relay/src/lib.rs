pub mod analyzer;
pub mod broadcast;
pub mod capture;
pub mod config;
pub mod pipeline;
pub mod registry;
pub mod router;

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use snapask_core::{
    Hello, MAX_INBOUND_MESSAGE_BYTES, PartyId, ServerMessage, WS_PATH, Welcome, encode_message,
    parse_hello,
};
use tokio::{net::TcpListener, sync::mpsc};
use tracing::{debug, error, info, warn};

use crate::{
    analyzer::VisionAnalyzer,
    broadcast::ResultBroadcaster,
    capture::ScreenCapturer,
    pipeline::{Pipeline, PipelineConfig},
    registry::{ConnectionId, ConnectionRegistry},
    router::CommandRouter,
};

#[derive(Clone)]
pub struct AppState {
    registry: ConnectionRegistry,
    router: CommandRouter,
    broadcaster: ResultBroadcaster,
    pipeline: Pipeline,
    next_connection_id: Arc<AtomicU64>,
}

impl AppState {
    /// Wires registry, router, pipeline and broadcaster together and starts the pipeline.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        capturer: Arc<dyn ScreenCapturer>,
        analyzer: Arc<dyn VisionAnalyzer>,
        config: PipelineConfig,
    ) -> Self {
        let registry = ConnectionRegistry::new();
        let broadcaster = ResultBroadcaster::new(registry.clone());
        let pipeline = Pipeline::new(capturer, analyzer, broadcaster.clone(), config);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let router = CommandRouter::new(registry.clone(), queue_tx);
        pipeline.spawn(queue_rx);

        Self {
            registry,
            router,
            broadcaster,
            pipeline,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

/// Hard transport limit. Frames between `MAX_INBOUND_MESSAGE_BYTES` and this size still reach
/// the command parser and are rejected with a reply; anything larger closes the socket.
const MAX_TRANSPORT_FRAME_BYTES: usize = 4 * MAX_INBOUND_MESSAGE_BYTES;

/// Per-socket command budget: burst size and tokens regained per second.
const RATE_LIMIT_BURST: f64 = 6.0;
const RATE_LIMIT_REFILL_PER_SEC: f64 = 1.0;

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn per_socket() -> Self {
        Self::new(RATE_LIMIT_BURST, RATE_LIMIT_REFILL_PER_SEC)
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.registry.counts().await;
    Json(serde_json::json!({
        "controllers": counts.controllers,
        "overlays": counts.overlays,
        "overlay_present": state.registry.overlay_present(),
        "latest_artifact": state.pipeline.latest_artifact().map(|a| a.info(false)),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_TRANSPORT_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let connection_id: ConnectionId = state.next_connection_id.fetch_add(1, Ordering::SeqCst);
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();

    // Split sockets only flush queued Pongs when the write half sends, so ping periodically
    // to keep idle phones and proxies from dropping the connection.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    let Some(message) = msg else { break };
                    let text = match encode_message(&message) {
                        Ok(text) => text,
                        Err(err) => {
                            error!("failed to serialize outbound message: {}", err);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "client disconnected before hello".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()));
    let hello = match first_message.and_then(|message| parse_hello_message(&message)) {
        Ok(hello) => hello,
        Err(err) => {
            send_task.abort();
            return Err(err);
        }
    };

    let party_id = match state
        .registry
        .register(connection_id, hello.role, hello.name.clone(), outbound_tx.clone())
        .await
    {
        Ok(party_id) => party_id,
        Err(err) => {
            send_task.abort();
            return Err(err.to_string());
        }
    };

    let welcome = Welcome {
        party_id,
        role: hello.role,
        latest_artifact: state.pipeline.latest_artifact().map(|a| a.info(false)),
    };
    let _ = outbound_tx.send(ServerMessage::Welcome(welcome));
    info!(
        party_id,
        connection_id,
        role = %hello.role,
        name = hello.name.as_deref().unwrap_or("-"),
        "party joined"
    );

    let mut rate_limiter = TokenBucket::per_socket();

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(party_id, "websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Text(text) => {
                handle_text_frame(&state, connection_id, party_id, text.as_str(), &mut rate_limiter)
                    .await;
            }
            Message::Binary(_) => {
                state
                    .broadcaster
                    .reject(party_id, "commands must be JSON text frames")
                    .await;
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    if let Err(err) = state.registry.unregister(party_id).await {
        warn!(party_id, "unregister failed: {}", err);
    }
    send_task.abort();
    info!(party_id, "party left");
    Ok(())
}

async fn handle_text_frame(
    state: &AppState,
    connection_id: ConnectionId,
    party_id: PartyId,
    text: &str,
    rate_limiter: &mut TokenBucket,
) {
    // A repeated hello on a live socket is a duplicate registration, not a command.
    if let Ok(hello) = parse_hello(text) {
        let (tx, _) = mpsc::unbounded_channel();
        if let Err(err) = state
            .registry
            .register(connection_id, hello.role, hello.name, tx)
            .await
        {
            state.broadcaster.reject(party_id, err.to_string()).await;
        }
        return;
    }

    if !rate_limiter.consume(1.0) {
        warn!(party_id, "rate limit exceeded");
        state
            .broadcaster
            .reject(party_id, "rate limit exceeded")
            .await;
        return;
    }

    match state.router.submit(text, party_id).await {
        Ok(command) => debug!(party_id, seq = command.seq, "command accepted"),
        Err(err) => {
            warn!(party_id, "command rejected: {}", err);
            state.broadcaster.reject(party_id, err.to_string()).await;
        }
    }
}

fn parse_hello_message(message: &Message) -> Result<Hello, String> {
    let text = match message {
        Message::Text(text) => text,
        _ => return Err("first message must be a JSON hello text frame".to_owned()),
    };
    parse_hello(text.as_str()).map_err(|err| err.to_string())
}
