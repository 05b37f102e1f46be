use serde::{Deserialize, Serialize};

/// Default event name assigned to frames that carry none.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// Server-push frame as carried on the wire.
///
/// Payloads are passed through untouched; this layer never interprets
/// `data` beyond routing on the event name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct EventFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl EventFrame {
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Event name used for listener routing, defaulting unnamed frames
    /// to [`DEFAULT_EVENT_NAME`].
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or(DEFAULT_EVENT_NAME)
    }
}
