//! Agent bridge — duplex channel to the conversational agent service.
//!
//! Translates the websocket audio/text/event stream into the session
//! vocabulary: `AgentEvent`s in, user input and acknowledgments out.

pub mod audio;
pub mod connection;
pub mod event;

pub use audio::{AudioSession, PlaybackChunk};
pub use connection::{BridgeConfig, BridgeHandle, SessionContext, open};
pub use event::{AgentEvent, SessionCommand, ToolCall, ToolDeclaration, map_tool_call};
