/// Messages pushed into and emitted by the orchestrator's event loop.
pub mod events;
pub mod error;
/// Domain entities and deterministic stream state boundaries.
pub mod message;
pub mod orchestrator;
pub mod reference;
mod regenerate;
pub mod registry;
pub mod store;

pub use error::{ChatError, ChatResult};
pub use events::{ChatNotice, Inbound};
pub use message::{
    ChatBoxId, Conversation, ConversationId, ExchangeId, Message, MessageId, MessageStatus, Role,
    StreamAnswer, StreamState, StreamTarget, StreamTransition, StreamTransitionRejection,
    StreamTransitionResult,
};
pub use orchestrator::{
    BoxFailure, ConversationBinding, DispatchReport, EnsuredConversation, OrchestratorConfig,
    SessionOrchestrator, StartedExchange,
};
pub use reference::{Citation, DocumentAggregate, Reference, ReferenceChunk, citation_indices};
pub use registry::{ChatBoxConfig, ChatBoxEntry, ChatBoxRegistry, MAX_CHAT_BOXES};
pub use store::MessageStore;
