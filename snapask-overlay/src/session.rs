use std::time::Duration;

use futures::{SinkExt, StreamExt};
use snapask_core::{
    CommandRequest, Hello, Role, ServerMessage, decode_server_message, encode_message,
};
use tokio::{sync::mpsc, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::view_state::OverlayEvent;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);

/// Doubling reconnect delay, 1 s up to 30 s, reset after every successful connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    current: Duration,
}

impl ReconnectBackoff {
    pub const INITIAL: Duration = Duration::from_secs(1);
    pub const MAX: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub name: Option<String>,
}

/// Keeps an overlay connection to the relay open forever.
///
/// Server messages become [`OverlayEvent`]s on `events`; commands from `commands` are written
/// to the socket while connected. Returns once the event receiver is gone.
pub async fn run_session(
    config: SessionConfig,
    events: std::sync::mpsc::Sender<OverlayEvent>,
    mut commands: mpsc::UnboundedReceiver<CommandRequest>,
) {
    let mut backoff = ReconnectBackoff::new();

    loop {
        info!(server_url = %config.server_url, "connecting");
        match timeout(CONNECT_TIMEOUT, connect_async(config.server_url.as_str())).await {
            Ok(Ok((ws_stream, _))) => {
                backoff.reset();
                // Anything queued while offline belonged to a view that has since moved on.
                while commands.try_recv().is_ok() {}

                if !drive_connection(ws_stream, &config, &events, &mut commands).await {
                    return;
                }
            }
            Ok(Err(err)) => warn!("connect failed: {err}"),
            Err(_) => warn!("connect timed out after {:?}", CONNECT_TIMEOUT),
        }

        let delay = backoff.next_delay();
        if events
            .send(OverlayEvent::Disconnected { retry_in: delay })
            .is_err()
        {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

/// Runs one connection until it drops. Returns `false` when the session should stop.
async fn drive_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    config: &SessionConfig,
    events: &std::sync::mpsc::Sender<OverlayEvent>,
    commands: &mut mpsc::UnboundedReceiver<CommandRequest>,
) -> bool {
    let (mut ws_write, mut ws_read) = ws_stream.split();

    let hello = Hello {
        role: Role::Overlay,
        name: config.name.clone(),
    };
    let hello = match encode_message(&hello) {
        Ok(text) => text,
        Err(err) => {
            warn!("failed to encode hello: {err}");
            return true;
        }
    };
    if let Err(err) = ws_write.send(Message::Text(hello.into())).await {
        warn!("failed to send hello: {err}");
        return true;
    }

    loop {
        tokio::select! {
            next = ws_read.next() => {
                let message = match next {
                    Some(Ok(message)) => message,
                    Some(Err(err)) => {
                        warn!("read failed: {err}");
                        return true;
                    }
                    None => return true,
                };

                let text = match message {
                    Message::Text(text) => text,
                    Message::Close(_) => return true,
                    _ => continue,
                };
                let event = match decode_server_message(text.as_str()) {
                    Ok(ServerMessage::Welcome(welcome)) => {
                        info!(party_id = welcome.party_id, "connected");
                        OverlayEvent::Connected {
                            latest_artifact: welcome.latest_artifact,
                        }
                    }
                    Ok(ServerMessage::Result(result)) => {
                        debug!(seq = ?result.seq, success = result.success, "result received");
                        OverlayEvent::Result(result)
                    }
                    Err(err) => {
                        warn!("ignoring server message: {err}");
                        continue;
                    }
                };
                if events.send(event).is_err() {
                    return false;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else { return false };
                let text = match encode_message(&command) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("failed to encode command: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_write.send(Message::Text(text.into())).await {
                    warn!("send failed: {err}");
                    return true;
                }
                debug!(kind = %command.kind, "command sent");
            }
        }
    }
}

/// Question sent by the send-query hotkey: the prompt prefix followed by the clipboard text.
pub fn compose_question(prefix: &str, clipboard: Option<&str>) -> String {
    format!("{prefix}{}", clipboard.unwrap_or_default())
        .trim()
        .to_owned()
}
