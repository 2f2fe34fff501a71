use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use tokio::sync::mpsc;

use crate::error::{EncodeFrameSnafu, PeerUnavailableSnafu, WidgetResult};

/// Messages exchanged with the embedding document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FrameMessage {
    #[serde(rename = "WIDGET_READY")]
    WidgetReady,
    #[serde(rename = "TOGGLE_CHAT")]
    ToggleChat {
        #[serde(rename = "isOpen")]
        is_open: bool,
    },
    #[serde(rename = "CREATE_CHAT_WINDOW")]
    CreateChatWindow { src: String },
    #[serde(rename = "SCROLL_PASSTHROUGH")]
    ScrollPassthrough {
        #[serde(rename = "deltaY")]
        delta_y: f64,
    },
}

impl FrameMessage {
    /// Decodes an untyped message; anything outside the protocol yields `None`.
    pub fn decode(value: Value) -> Option<Self> {
        match serde_json::from_value(value) {
            Ok(message) => Some(message),
            Err(error) => {
                tracing::debug!(error = %error, "ignoring frame message outside the protocol");
                None
            }
        }
    }

    pub fn encode(&self) -> WidgetResult<Value> {
        serde_json::to_value(self).context(EncodeFrameSnafu {
            stage: "encode-frame-message",
        })
    }
}

/// Outbound half of the cross-frame channel.
///
/// Delivery is fire-and-forget: callers log failures and move on.
pub trait FramePort: Send + Sync {
    fn post(&self, message: &FrameMessage) -> WidgetResult<()>;
}

/// Port backed by a channel of encoded messages, read by whatever hosts the frame.
#[derive(Debug, Clone)]
pub struct ChannelPort {
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelPort {
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl FramePort for ChannelPort {
    fn post(&self, message: &FrameMessage) -> WidgetResult<()> {
        let encoded = message.encode()?;
        self.tx.send(encoded).ok().context(PeerUnavailableSnafu {
            stage: "post-frame-message",
        })
    }
}

/// Port for a frame that is not embedded anywhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedPort;

impl FramePort for DetachedPort {
    fn post(&self, _message: &FrameMessage) -> WidgetResult<()> {
        PeerUnavailableSnafu {
            stage: "post-frame-message",
        }
        .fail()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn messages_use_the_page_facing_shape() {
        assert_eq!(
            FrameMessage::ToggleChat { is_open: true }.encode().expect("encode"),
            json!({"type": "TOGGLE_CHAT", "isOpen": true})
        );
        assert_eq!(
            FrameMessage::WidgetReady.encode().expect("encode"),
            json!({"type": "WIDGET_READY"})
        );
        assert_eq!(
            FrameMessage::decode(json!({"type": "SCROLL_PASSTHROUGH", "deltaY": -12.5})),
            Some(FrameMessage::ScrollPassthrough { delta_y: -12.5 })
        );
    }

    #[test]
    fn foreign_messages_are_ignored() {
        assert_eq!(FrameMessage::decode(json!({"type": "RESIZE", "height": 10})), None);
        assert_eq!(FrameMessage::decode(json!("WIDGET_READY")), None);
    }

    #[test]
    fn closed_channel_reports_missing_peer() {
        let (port, rx) = ChannelPort::pair();
        drop(rx);
        assert!(port.post(&FrameMessage::WidgetReady).is_err());
        assert!(DetachedPort.post(&FrameMessage::WidgetReady).is_err());
    }
}
