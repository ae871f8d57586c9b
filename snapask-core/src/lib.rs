use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAX_INBOUND_MESSAGE_BYTES: usize = 16 * 1024;
pub const MAX_QUESTION_BYTES: usize = 8 * 1024;
pub const MAX_PARTY_NAME_LEN: usize = 64;
pub const WS_PATH: &str = "/ws";

pub type PartyId = u64;
pub type Seq = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Mobile browser session; may issue every command kind.
    Controller,
    /// Desktop overlay; may only re-query the last screenshot.
    Overlay,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Controller => write!(f, "controller"),
            Role::Overlay => write!(f, "overlay"),
        }
    }
}

/// First frame on every socket. Unknown fields are refused so a command is never taken for one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Hello {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandKind {
    #[serde(rename = "capture")]
    Capture,
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "capture+query")]
    CaptureQuery,
}

impl CommandKind {
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Capture => "capture",
            CommandKind::Query => "query",
            CommandKind::CaptureQuery => "capture+query",
        }
    }

    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "capture" => Some(CommandKind::Capture),
            "query" => Some(CommandKind::Query),
            "capture+query" => Some(CommandKind::CaptureQuery),
            _ => None,
        }
    }

    /// Whether executing this kind takes a fresh screenshot.
    pub fn captures(self) -> bool {
        matches!(self, CommandKind::Capture | CommandKind::CaptureQuery)
    }

    pub fn requires_question(self) -> bool {
        matches!(self, CommandKind::Query | CommandKind::CaptureQuery)
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated inbound command, before the relay assigns it a sequence number.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandRequest {
    pub kind: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

impl CommandRequest {
    pub fn capture() -> Self {
        Self {
            kind: CommandKind::Capture,
            question: None,
        }
    }

    pub fn query(question: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Query,
            question: Some(question.into()),
        }
    }

    pub fn capture_and_query(question: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::CaptureQuery,
            question: Some(question.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub captured_at_unix_ms: u64,
    pub device_id: String,
    pub byte_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_png_base64: Option<String>,
}

impl ArtifactInfo {
    /// Metadata-only copy, for recipients that never render the screenshot.
    pub fn without_image(&self) -> Self {
        Self {
            image_png_base64: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<Seq>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactInfo>,
}

impl ResultMessage {
    pub fn answered(seq: Seq, answer: impl Into<String>, artifact: Option<ArtifactInfo>) -> Self {
        Self {
            seq: Some(seq),
            success: true,
            answer: Some(answer.into()),
            error: None,
            artifact,
        }
    }

    pub fn captured(seq: Seq, artifact: ArtifactInfo) -> Self {
        Self {
            seq: Some(seq),
            success: true,
            answer: None,
            error: None,
            artifact: Some(artifact),
        }
    }

    pub fn failed(seq: Seq, error: impl Into<String>) -> Self {
        Self {
            seq: Some(seq),
            success: false,
            answer: None,
            error: Some(error.into()),
            artifact: None,
        }
    }

    /// A command refused before it was sequenced; carries no `seq`.
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            seq: None,
            success: false,
            answer: None,
            error: Some(error.into()),
            artifact: None,
        }
    }

    pub fn is_rejection(&self) -> bool {
        self.seq.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Welcome {
    pub party_id: PartyId,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_artifact: Option<ArtifactInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome(Welcome),
    Result(ResultMessage),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("malformed command: {0}")]
    Malformed(String),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("message exceeds {max} bytes")]
    MessageTooLarge { max: usize },
    #[error("invalid hello: {0}")]
    InvalidHello(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("stale result: got seq {seq}, already showing {last_shown}")]
    StaleResult { seq: Seq, last_shown: Seq },
}

#[derive(Deserialize)]
struct RawCommand {
    kind: serde_json::Value,
    #[serde(default)]
    question: Option<serde_json::Value>,
}

/// Validates one inbound command frame.
///
/// The kind is checked before the question so that an unknown kind is always reported as
/// malformed, regardless of which other fields are present.
pub fn parse_command(raw: &str) -> Result<CommandRequest, CommandError> {
    if raw.len() > MAX_INBOUND_MESSAGE_BYTES {
        return Err(CommandError::Malformed(format!(
            "message exceeds {MAX_INBOUND_MESSAGE_BYTES} bytes"
        )));
    }

    let parsed: RawCommand = serde_json::from_str(raw)
        .map_err(|err| CommandError::Malformed(format!("invalid JSON: {err}")))?;

    let kind_text = parsed
        .kind
        .as_str()
        .ok_or_else(|| CommandError::Malformed("`kind` must be a string".to_owned()))?;
    let kind = CommandKind::from_wire(kind_text)
        .ok_or_else(|| CommandError::Malformed(format!("unknown command kind `{kind_text}`")))?;

    if !kind.requires_question() {
        return Ok(CommandRequest {
            kind,
            question: None,
        });
    }

    let question = match parsed.question {
        None | Some(serde_json::Value::Null) => return Err(CommandError::MissingField("question")),
        Some(serde_json::Value::String(text)) => text,
        Some(_) => {
            return Err(CommandError::Malformed(
                "`question` must be a string".to_owned(),
            ));
        }
    };

    let question = question.trim();
    if question.is_empty() {
        return Err(CommandError::MissingField("question"));
    }
    if question.len() > MAX_QUESTION_BYTES {
        return Err(CommandError::Malformed(format!(
            "question exceeds {MAX_QUESTION_BYTES} bytes"
        )));
    }

    Ok(CommandRequest {
        kind,
        question: Some(question.to_owned()),
    })
}

pub fn parse_hello(raw: &str) -> Result<Hello, CoreError> {
    if raw.len() > MAX_INBOUND_MESSAGE_BYTES {
        return Err(CoreError::MessageTooLarge {
            max: MAX_INBOUND_MESSAGE_BYTES,
        });
    }

    let mut hello: Hello =
        serde_json::from_str(raw).map_err(|err| CoreError::InvalidHello(err.to_string()))?;
    if let Some(name) = hello.name.take() {
        let name = name.trim();
        if name.len() > MAX_PARTY_NAME_LEN {
            return Err(CoreError::InvalidHello(format!(
                "name longer than {MAX_PARTY_NAME_LEN} bytes"
            )));
        }
        if !name.is_empty() {
            hello.name = Some(name.to_owned());
        }
    }
    Ok(hello)
}

pub fn encode_message<T: Serialize>(message: &T) -> Result<String, CoreError> {
    serde_json::to_string(message).map_err(|err| CoreError::Serialization(err.to_string()))
}

pub fn decode_server_message(raw: &str) -> Result<ServerMessage, CoreError> {
    serde_json::from_str(raw).map_err(|err| CoreError::Serialization(err.to_string()))
}

/// Staleness rule: a result older than the newest one already shown is refused.
///
/// Equal sequence numbers are accepted so delivery order only needs to be non-decreasing.
pub fn accept_result_seq(last_shown: &mut Option<Seq>, seq: Seq) -> Result<(), CoreError> {
    if let Some(previous) = *last_shown
        && seq < previous
    {
        return Err(CoreError::StaleResult {
            seq,
            last_shown: previous,
        });
    }

    *last_shown = Some(seq);
    Ok(())
}
