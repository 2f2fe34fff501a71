use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WidgetError {
    #[snafu(display("page url '{raw}' is invalid on `{stage}`: {source}"))]
    InvalidPageUrl {
        stage: &'static str,
        raw: String,
        source: url::ParseError,
    },
    #[snafu(display("failed to encode frame message on `{stage}`: {source}"))]
    EncodeFrame {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("no peer frame is listening on `{stage}`"))]
    PeerUnavailable { stage: &'static str },
    #[snafu(display("notification failed on `{stage}`: {message}"))]
    Notify {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("`{mode}` frames carry no conversation, rejected on `{stage}`"))]
    NoConversation {
        stage: &'static str,
        mode: &'static str,
    },
    #[snafu(display("embedded session failed on `{stage}`, {source}"))]
    Session {
        stage: &'static str,
        source: kbchat::chat::ChatError,
    },
    #[snafu(display("backend setup failed on `{stage}`, {source}"))]
    Backend {
        stage: &'static str,
        source: kbchat_llm::BackendError,
    },
}

pub type WidgetResult<T> = Result<T, WidgetError>;
