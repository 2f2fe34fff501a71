use snafu::Snafu;

use super::message::{ChatBoxId, MessageId, StreamTransitionRejection};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("chat id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("message {id} already exists in this session"))]
    DuplicateMessageId { stage: &'static str, id: MessageId },
    #[snafu(display("message {id} was not found"))]
    MessageNotFound { stage: &'static str, id: MessageId },
    #[snafu(display("chat box {box_id:?} is not registered"))]
    UnknownChatBox {
        stage: &'static str,
        box_id: ChatBoxId,
    },
    #[snafu(display("at most {limit} chat boxes can be open at once"))]
    TooManyChatBoxes { stage: &'static str, limit: usize },
    #[snafu(display("cannot send an empty message"))]
    EmptyInput { stage: &'static str },
    #[snafu(display("no conversation is bound to this session"))]
    ConversationUnbound { stage: &'static str },
    #[snafu(display("message {id} has no preceding question to regenerate from"))]
    NoQuestionToRegenerate { stage: &'static str, id: MessageId },
    #[snafu(display("stream transition rejected on `{stage}`: {rejection:?}"))]
    StreamRejected {
        stage: &'static str,
        rejection: StreamTransitionRejection,
    },
    #[snafu(display("backend call failed on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: kbchat_llm::BackendError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;
