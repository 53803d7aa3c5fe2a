//! Inbound agent events and the fixed tool-call mapping.
//!
//! Tool calls are deserialized strictly: a malformed or unknown call is an
//! ignored event, never a best-effort text scrape.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::session::WidgetType;

/// A structured instruction from the agent directing the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub name: String,
    pub args: serde_json::Value,
}

/// Inbound message surfaced to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    SessionStarted { session_id: String },
    /// Advisory speech/text fragment; rendered, never actionable.
    Speech { text: String },
    ToolCall(ToolCall),
    /// Terminal: the channel failed or was interrupted. The bridge does not
    /// reconnect; re-entering the live screen opens a fresh channel.
    ChannelClosed { reason: String },
}

/// Controller-level action a tool call maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    SetStage { stage_id: String },
    ShowWidget { widget: WidgetType },
    HighlightField { widget: WidgetType, field: String },
    Say { text: String },
}

#[derive(Debug, Deserialize)]
struct SetStageArgs {
    stage_id: String,
}

#[derive(Debug, Deserialize)]
struct ShowWidgetArgs {
    widget: WidgetType,
}

#[derive(Debug, Deserialize)]
struct HighlightFieldArgs {
    widget: WidgetType,
    field: String,
}

#[derive(Debug, Deserialize)]
struct SayArgs {
    text: String,
}

/// Fixed, total mapping from tool name to session command.
///
/// Any name outside the fixed set, or args that fail strict deserialization,
/// yields `None` (logged, not fatal).
pub fn map_tool_call(call: &ToolCall) -> Option<SessionCommand> {
    let command = match call.name.as_str() {
        "set_stage" => serde_json::from_value::<SetStageArgs>(call.args.clone())
            .ok()
            .map(|a| SessionCommand::SetStage { stage_id: a.stage_id }),
        "show_widget" => serde_json::from_value::<ShowWidgetArgs>(call.args.clone())
            .ok()
            .map(|a| SessionCommand::ShowWidget { widget: a.widget }),
        "highlight_field" => serde_json::from_value::<HighlightFieldArgs>(call.args.clone())
            .ok()
            .map(|a| SessionCommand::HighlightField {
                widget: a.widget,
                field: a.field,
            }),
        "say" => serde_json::from_value::<SayArgs>(call.args.clone())
            .ok()
            .map(|a| SessionCommand::Say { text: a.text }),
        _ => None,
    };
    if command.is_none() {
        tracing::debug!(tool = %call.name, "Ignoring unknown or malformed tool call");
    }
    command
}

/// A tool the agent may call, declared once at channel open.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDeclaration {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

/// The fixed tool set declared to the agent.
pub fn declarations() -> Vec<ToolDeclaration> {
    vec![
        ToolDeclaration {
            name: "set_stage",
            description: "Advance the intake flow to the named stage",
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "stage_id": { "type": "string" } },
                "required": ["stage_id"]
            }),
        },
        ToolDeclaration {
            name: "show_widget",
            description: "Open the named data-capture form",
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "widget": { "type": "string" } },
                "required": ["widget"]
            }),
        },
        ToolDeclaration {
            name: "highlight_field",
            description: "Focus a field in the open form",
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "widget": { "type": "string" },
                    "field": { "type": "string" }
                },
                "required": ["widget", "field"]
            }),
        },
        ToolDeclaration {
            name: "say",
            description: "Display a short message to the patient",
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"]
            }),
        },
    ]
}

/// Wire-level inbound frame. Audio never reaches the session loop; the
/// connection routes it straight into the audio session.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AgentFrame {
    SessionStarted { session_id: String },
    Speech { text: String },
    Audio { pcm: Vec<u8> },
    ToolCall(ToolCall),
    Error { message: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    SessionStarted {
        session_id: String,
    },
    Speech {
        text: String,
    },
    AudioChunk {
        audio_base_64: String,
    },
    ToolCall {
        name: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    Error {
        message: String,
    },
}

/// Parse one inbound frame. Unknown or malformed frames yield `None` and are
/// dropped by the caller.
pub(crate) fn parse_frame(text: &str) -> Option<AgentFrame> {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("Dropping unparseable agent frame: {e}");
            return None;
        }
    };
    match frame {
        WireFrame::SessionStarted { session_id } => Some(AgentFrame::SessionStarted { session_id }),
        WireFrame::Speech { text } => Some(AgentFrame::Speech { text }),
        WireFrame::AudioChunk { audio_base_64 } => {
            match base64::engine::general_purpose::STANDARD.decode(&audio_base_64) {
                Ok(pcm) => Some(AgentFrame::Audio { pcm }),
                Err(e) => {
                    tracing::debug!("Dropping audio frame with invalid base64: {e}");
                    None
                }
            }
        }
        WireFrame::ToolCall { name, args } => Some(AgentFrame::ToolCall(ToolCall { name, args })),
        WireFrame::Error { message } => Some(AgentFrame::Error { message }),
    }
}
