use std::time::Duration;

use snapask_core::{ArtifactInfo, CommandRequest, ResultMessage, Seq, accept_result_seq};
use tracing::{debug, warn};

use crate::hotkeys::HotkeyAction;

/// Pixels moved per scroll hotkey press.
pub const SCROLL_STEP_PX: f32 = 30.0;

pub const STATUS_WAITING: &str = "Waiting...";
pub const STATUS_CONNECTED: &str = "Connected to server";
pub const STATUS_LOADING: &str = "Thinking...";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Hidden,
    VisibleIdle,
    VisibleLoading,
    VisibleAnswered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentPhase {
    Idle,
    Loading,
    Answered,
}

/// Everything the overlay reacts to, delivered through one ordered queue.
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayEvent {
    Show,
    Hide,
    /// Send-query hotkey, already carrying the composed question text.
    SendQuery { question: String },
    ScrollUp,
    ScrollDown,
    Result(ResultMessage),
    Connected { latest_artifact: Option<ArtifactInfo> },
    Disconnected { retry_in: Duration },
}

impl OverlayEvent {
    /// Maps a hotkey press to an event. `question` is only consulted for send-query.
    pub fn from_hotkey(action: HotkeyAction, question: impl FnOnce() -> String) -> Self {
        match action {
            HotkeyAction::Show => OverlayEvent::Show,
            HotkeyAction::Hide => OverlayEvent::Hide,
            HotkeyAction::SendQuery => OverlayEvent::SendQuery {
                question: question(),
            },
            HotkeyAction::ScrollUp => OverlayEvent::ScrollUp,
            HotkeyAction::ScrollDown => OverlayEvent::ScrollDown,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OverlayViewState {
    visible: bool,
    phase: ContentPhase,
    answer: String,
    scroll_offset: f32,
    max_scroll: f32,
    status: String,
    connected: bool,
    last_shown: Option<Seq>,
    last_artifact: Option<ArtifactInfo>,
}

impl Default for OverlayViewState {
    fn default() -> Self {
        Self::new()
    }
}

impl OverlayViewState {
    pub fn new() -> Self {
        Self {
            visible: true,
            phase: ContentPhase::Idle,
            answer: String::new(),
            scroll_offset: 0.0,
            max_scroll: 0.0,
            status: STATUS_WAITING.to_owned(),
            connected: false,
            last_shown: None,
            last_artifact: None,
        }
    }

    pub fn state(&self) -> OverlayState {
        if !self.visible {
            return OverlayState::Hidden;
        }
        match self.phase {
            ContentPhase::Idle => OverlayState::VisibleIdle,
            ContentPhase::Loading => OverlayState::VisibleLoading,
            ContentPhase::Answered => OverlayState::VisibleAnswered,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn scroll_offset(&self) -> f32 {
        self.scroll_offset
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn last_artifact(&self) -> Option<&ArtifactInfo> {
        self.last_artifact.as_ref()
    }

    /// Text for the main panel.
    pub fn display_text(&self) -> &str {
        match self.phase {
            ContentPhase::Idle => &self.status,
            ContentPhase::Loading => STATUS_LOADING,
            ContentPhase::Answered => &self.answer,
        }
    }

    /// Called by the renderer after layout so scrolling stays within the content.
    pub fn set_content_extent(&mut self, content_height: f32, viewport_height: f32) {
        self.max_scroll = (content_height - viewport_height).max(0.0);
        self.scroll_offset = self.scroll_offset.clamp(0.0, self.max_scroll);
    }

    /// Applies one event. Returns the command to send when the event asks for one.
    pub fn apply(&mut self, event: OverlayEvent) -> Option<CommandRequest> {
        match event {
            OverlayEvent::Show => {
                self.visible = true;
                None
            }
            OverlayEvent::Hide => {
                self.visible = false;
                None
            }
            OverlayEvent::SendQuery { question } => self.send_query(question),
            OverlayEvent::ScrollUp => {
                self.scroll_by(-SCROLL_STEP_PX);
                None
            }
            OverlayEvent::ScrollDown => {
                self.scroll_by(SCROLL_STEP_PX);
                None
            }
            OverlayEvent::Result(result) => {
                self.apply_result(result);
                None
            }
            OverlayEvent::Connected { latest_artifact } => {
                // Sequence numbers and the stored screenshot belong to one relay process; a
                // reconnect may land on a restarted relay that counts from 1 again.
                self.connected = true;
                self.status = STATUS_CONNECTED.to_owned();
                self.last_shown = None;
                self.last_artifact = latest_artifact;
                None
            }
            OverlayEvent::Disconnected { retry_in } => {
                self.connected = false;
                self.status = format!(
                    "Connection lost. Retrying in {} seconds...",
                    retry_in.as_secs()
                );
                // A query in flight on the dropped connection will never be answered.
                if self.phase == ContentPhase::Loading {
                    self.phase = ContentPhase::Idle;
                }
                None
            }
        }
    }

    fn send_query(&mut self, question: String) -> Option<CommandRequest> {
        if !matches!(
            self.state(),
            OverlayState::VisibleIdle | OverlayState::VisibleAnswered
        ) {
            debug!(state = ?self.state(), "send-query ignored");
            return None;
        }
        if !self.connected {
            debug!("send-query ignored while disconnected");
            return None;
        }
        if self.last_artifact.is_none() {
            self.status = "No screenshot captured yet".to_owned();
            return None;
        }
        let question = question.trim();
        if question.is_empty() {
            return None;
        }

        self.phase = ContentPhase::Loading;
        Some(CommandRequest::query(question))
    }

    fn scroll_by(&mut self, delta: f32) {
        if self.state() != OverlayState::VisibleAnswered {
            return;
        }
        self.scroll_offset = (self.scroll_offset + delta).clamp(0.0, self.max_scroll);
    }

    fn apply_result(&mut self, result: ResultMessage) {
        match result.seq {
            Some(seq) => {
                if let Err(err) = accept_result_seq(&mut self.last_shown, seq) {
                    warn!("{}", err);
                    return;
                }
            }
            // Rejections are only ever addressed to us; they answer our own query.
            None if self.phase != ContentPhase::Loading => {
                self.status = format!("Error: {}", result.error.unwrap_or_default());
                return;
            }
            None => {}
        }

        if let Some(artifact) = result.artifact.clone() {
            self.last_artifact = Some(artifact);
        }

        self.answer = if result.success {
            match result.answer {
                Some(answer) => answer,
                None => "Screenshot captured".to_owned(),
            }
        } else {
            format!(
                "Error: {}",
                result.error.as_deref().unwrap_or("unknown error")
            )
        };
        self.phase = ContentPhase::Answered;
        self.scroll_offset = 0.0;
    }
}
