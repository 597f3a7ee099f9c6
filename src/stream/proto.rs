use serde::Deserialize;

/// Inbound push-server frame, discriminated by its `type` field.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename = "@heart@")]
    Heartbeat,
    Init {
        client_id: String,
    },
    Order {
        message: String,
    },
    /// Any other well-formed frame type.
    #[serde(other)]
    Other,
}

impl ServerMessage {
    /// Classifies one complete logical message.
    ///
    /// Frames that are not JSON objects with a known shape yield `None`; they
    /// are dropped without being treated as errors.
    pub fn classify(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}
