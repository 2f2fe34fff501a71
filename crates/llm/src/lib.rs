use std::sync::Arc;

mod backend;
mod decode;
mod http_adapter;

pub use backend::{
    AnswerChunk, AnswerStream, BackendConfig, BackendError, BackendResult, BoxFuture, BoxKey,
    ChatBackend, CompletionRequest, ConversationRecord, ConversationUpsert,
    DEFAULT_COMPLETION_PATH, DEFAULT_CONVERSATION_PATH, DEFAULT_UPLOAD_PATH, ExchangeId,
    ModelParams, Role, StreamEventMapped, StreamEventPayload, StreamHandle, StreamRequest,
    StreamTarget, StreamWorker, UploadFile, WireMessage, make_event_stream,
};
pub use decode::{DecodedFrame, Envelope, decode_frame};
pub use http_adapter::HttpBackend;

pub fn create_backend(config: BackendConfig) -> BackendResult<Arc<dyn ChatBackend>> {
    Ok(Arc::new(HttpBackend::new(config)?))
}
