use kbchat_llm::{BackendError, ConversationRecord, StreamEventMapped};

use crate::chat::message::{ChatBoxId, ConversationId, MessageId, StreamTarget};

/// Work delivered back to the orchestrator's event loop.
#[derive(Debug)]
pub enum Inbound {
    /// One mapped event from a running exchange.
    Stream(StreamEventMapped),
    /// The reader for an exchange finished; any exchange still current never got a terminal event.
    StreamClosed(StreamTarget),
    /// Result of the background conversation upsert started by `ensure_conversation`.
    ConversationPersisted {
        id: ConversationId,
        result: Result<ConversationRecord, BackendError>,
    },
}

/// Observable outcome of handling one [`Inbound`] item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatNotice {
    AnswerUpdated {
        box_id: ChatBoxId,
        message_id: MessageId,
    },
    AnswerCompleted {
        box_id: ChatBoxId,
        message_id: MessageId,
    },
    /// The exchange failed. `restore_input` carries the typed text when the
    /// optimistic answer was rolled back so the user can retry.
    ExchangeFailed {
        box_id: ChatBoxId,
        error: String,
        restore_input: Option<String>,
    },
    ConversationPersisted {
        id: ConversationId,
    },
    ConversationPersistFailed {
        id: ConversationId,
        error: String,
    },
}

impl ChatNotice {
    /// Returns true for notices that end an exchange.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AnswerCompleted { .. } | Self::ExchangeFailed { .. }
        )
    }
}
