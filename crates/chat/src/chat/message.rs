use std::fmt;
use std::str::FromStr;

use kbchat_llm::{ConversationRecord, Role as WireRole};
use snafu::ResultExt;
use uuid::Uuid;

use super::error::{ChatError, ChatResult, InvalidIdSnafu};
use super::reference::Reference;

/// Namespace used to derive the paired answer id from a question id.
const ANSWER_ID_NAMESPACE: &[u8] = b"kbchat-answer";

// Macro keeps all uuid-backed ids structurally identical.
macro_rules! define_uuid_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v4() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn parse(raw: &str) -> ChatResult<Self> {
                let parsed = Uuid::parse_str(raw).context(InvalidIdSnafu {
                    stage: "parse-chat-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            // The backend expects the 32-character hex form without dashes.
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0.simple())
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = ChatError;

            fn from_str(raw: &str) -> ChatResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_uuid_id!(ConversationId, "conversation-id");
define_uuid_id!(MessageId, "message-id");

impl MessageId {
    /// Id of the assistant slot paired with a user question.
    ///
    /// Deterministic, so a regenerated answer lands in the same slot.
    pub fn answer_for(question: MessageId) -> Self {
        Self(Uuid::new_v5(&question.0, ANSWER_ID_NAMESPACE))
    }
}

/// Identifier of one parallel chat box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatBoxId(pub u64);

impl ChatBoxId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one request/response exchange.
///
/// This must change on every send/regenerate so stale chunks can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExchangeId(pub u64);

impl ExchangeId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Stream routing key used for stale-chunk rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTarget {
    pub box_id: ChatBoxId,
    pub exchange_id: ExchangeId,
}

impl StreamTarget {
    pub const fn new(box_id: ChatBoxId, exchange_id: ExchangeId) -> Self {
        Self {
            box_id,
            exchange_id,
        }
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    Pending,
    Streaming(ExchangeId),
    Done,
    Error(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    /// Uploaded document ids attached to a question.
    pub files: Vec<String>,
    pub reference: Option<Reference>,
    /// Owning box, set only in multi-box mode.
    pub chat_box_id: Option<ChatBoxId>,
    pub status: MessageStatus,
}

impl Message {
    pub fn new(id: MessageId, role: Role, content: impl Into<String>, status: MessageStatus) -> Self {
        Self {
            id,
            role,
            content: content.into(),
            files: Vec::new(),
            reference: None,
            chat_box_id: None,
            status,
        }
    }

    pub fn user(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, Role::User, content, MessageStatus::Done)
    }

    pub fn assistant(id: MessageId, content: impl Into<String>) -> Self {
        Self::new(id, Role::Assistant, content, MessageStatus::Done)
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_chat_box(mut self, chat_box_id: Option<ChatBoxId>) -> Self {
        self.chat_box_id = chat_box_id;
        self
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming(_))
    }
}

/// A persisted conversation as returned by the conversation endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub name: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn from_record(record: &ConversationRecord) -> ChatResult<Self> {
        let messages = record
            .message
            .iter()
            .map(|wire| {
                // Foreign ids that are not uuids still map to a stable id.
                let id = MessageId::parse(&wire.id).unwrap_or_else(|_| {
                    MessageId::new(Uuid::new_v5(&Uuid::NAMESPACE_OID, wire.id.as_bytes()))
                });
                let role = match wire.role {
                    WireRole::User => Role::User,
                    WireRole::Assistant => Role::Assistant,
                };
                Message::new(id, role, wire.content.clone(), MessageStatus::Done)
                    .with_files(wire.doc_ids.clone())
            })
            .collect();

        Ok(Self {
            id: ConversationId::parse(&record.id)?,
            name: record.name.clone(),
            messages,
        })
    }
}

/// Transient accumulated answer for the in-flight exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamAnswer {
    pub id: MessageId,
    pub exchange_id: ExchangeId,
    /// Accumulated text so far, never a delta.
    pub answer: String,
    pub reference: Option<Reference>,
    pub audio: Option<String>,
    pub chat_box_id: Option<ChatBoxId>,
    pub done: bool,
}

impl StreamAnswer {
    pub fn placeholder(
        id: MessageId,
        exchange_id: ExchangeId,
        chat_box_id: Option<ChatBoxId>,
    ) -> Self {
        Self {
            id,
            exchange_id,
            answer: String::new(),
            reference: None,
            audio: None,
            chat_box_id,
            done: false,
        }
    }

    pub fn status(&self) -> MessageStatus {
        if self.done {
            MessageStatus::Done
        } else {
            MessageStatus::Streaming(self.exchange_id)
        }
    }

    pub fn to_message(&self) -> Message {
        Message {
            id: self.id,
            role: Role::Assistant,
            content: self.answer.clone(),
            files: Vec::new(),
            reference: self.reference.clone(),
            chat_box_id: self.chat_box_id,
            status: self.status(),
        }
    }
}

/// Stream state boundary for one chat box.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Streaming(StreamTarget),
    Done(StreamTarget),
    Error {
        target: StreamTarget,
        message: String,
    },
    Cancelled(StreamTarget),
}

/// State transition input for stream lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Start(StreamTarget),
    Complete(StreamTarget),
    Fail {
        target: StreamTarget,
        message: String,
    },
    Cancel(StreamTarget),
    ResetToIdle,
}

/// Rejection reason for illegal stream transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyStreaming {
        active: StreamTarget,
        attempted: StreamTarget,
    },
    NoActiveStream,
    SessionMismatch {
        active: StreamTarget,
        attempted: StreamTarget,
    },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn active_target(&self) -> Option<StreamTarget> {
        match self {
            Self::Streaming(target) => Some(*target),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => None,
        }
    }

    /// Returns true when incoming stream data matches the active exchange.
    pub fn accepts_stream_event(&self, target: StreamTarget) -> bool {
        matches!(self, Self::Streaming(active) if *active == target)
    }

    /// Applies one transition deterministically.
    ///
    /// Non-streaming states may start a new exchange directly. Any terminal transition
    /// (`Complete`/`Fail`/`Cancel`) must match the currently active exchange exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Start(target) => self.apply_start(target),
            StreamTransition::Complete(target) => {
                self.apply_terminal(target, || Self::Done(target))
            }
            StreamTransition::Fail { target, message } => {
                self.apply_terminal(target, || Self::Error { target, message })
            }
            StreamTransition::Cancel(target) => {
                self.apply_terminal(target, || Self::Cancelled(target))
            }
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_start(&self, target: StreamTarget) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active != target => {
                Err(StreamTransitionRejection::AlreadyStreaming {
                    active: *active,
                    attempted: target,
                })
            }
            Self::Streaming(_) => Ok(self.clone()),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Ok(Self::Streaming(target))
            }
        }
    }

    fn apply_terminal(
        &self,
        target: StreamTarget,
        next: impl FnOnce() -> StreamState,
    ) -> StreamTransitionResult {
        match self {
            Self::Streaming(active) if *active == target => Ok(next()),
            Self::Streaming(active) => Err(StreamTransitionRejection::SessionMismatch {
                active: *active,
                attempted: target,
            }),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Cancelled(_) => {
                Err(StreamTransitionRejection::NoActiveStream)
            }
        }
    }
}
