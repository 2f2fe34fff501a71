use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_COMPLETION_PATH: &str = "/v1/conversation/completion";
pub const DEFAULT_CONVERSATION_PATH: &str = "/v1/conversation/set";
pub const DEFAULT_UPLOAD_PATH: &str = "/v1/document/upload_and_parse";

/// Lane key for one chat box on the wire side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxKey(pub u64);

impl BoxKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Generation number of one request/response exchange.
///
/// Allocated fresh for every send so chunks from a superseded exchange can be rejected.
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
    pub box_key: BoxKey,
    pub exchange_id: ExchangeId,
}

impl StreamTarget {
    pub const fn new(box_key: BoxKey, exchange_id: ExchangeId) -> Self {
        Self {
            box_key,
            exchange_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub api_key: String,
    pub completion_path: String,
    pub conversation_path: String,
    pub upload_path: String,
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            completion_path: DEFAULT_COMPLETION_PATH.to_string(),
            conversation_path: DEFAULT_CONVERSATION_PATH.to_string(),
            upload_path: DEFAULT_UPLOAD_PATH.to_string(),
        }
    }

    pub fn with_completion_path(mut self, path: impl Into<String>) -> Self {
        self.completion_path = path.into().trim().to_string();
        self
    }

    pub fn with_conversation_path(mut self, path: impl Into<String>) -> Self {
        self.conversation_path = path.into().trim().to_string();
        self
    }

    pub fn with_upload_path(mut self, path: impl Into<String>) -> Self {
        self.upload_path = path.into().trim().to_string();
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub doc_ids: Vec<String>,
}

impl WireMessage {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            doc_ids: Vec::new(),
        }
    }

    pub fn with_doc_ids(mut self, doc_ids: Vec<String>) -> Self {
        self.doc_ids = doc_ids;
        self
    }
}

/// Sampling parameters forwarded next to `llm_id`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// JSON body posted to the completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub conversation_id: String,
    pub messages: Vec<WireMessage>,
    pub reasoning: bool,
    pub internet: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_id: Option<String>,
    #[serde(flatten)]
    pub params: ModelParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub target: StreamTarget,
    pub body: CompletionRequest,
}

impl StreamRequest {
    pub fn new(
        target: StreamTarget,
        conversation_id: impl Into<String>,
        messages: Vec<WireMessage>,
    ) -> Self {
        Self {
            target,
            body: CompletionRequest {
                conversation_id: conversation_id.into(),
                messages,
                reasoning: false,
                internet: false,
                llm_id: None,
                params: ModelParams::default(),
            },
        }
    }

    pub fn with_model(mut self, llm_id: impl Into<String>, params: ModelParams) -> Self {
        self.body.llm_id = Some(llm_id.into());
        self.body.params = params;
        self
    }

    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.body.reasoning = reasoning;
        self
    }

    pub fn with_internet(mut self, internet: bool) -> Self {
        self.body.internet = internet;
        self
    }
}

/// One incremental answer object decoded from the completions stream.
///
/// `answer` is the accumulated text so far, not a delta.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AnswerChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub reference: Option<serde_json::Value>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub audio_binary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationUpsert {
    pub dialog_id: String,
    pub name: String,
    pub is_new: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub message: Vec<WireMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: Vec<WireMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: None,
            bytes,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventPayload {
    Answer(AnswerChunk),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEventMapped {
    pub target: StreamTarget,
    pub payload: StreamEventPayload,
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type StreamWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("backend base URL is empty"))]
    MissingBaseUrl { stage: &'static str },
    #[snafu(display("stream request for {target:?} has no messages"))]
    EmptyMessageSet {
        stage: &'static str,
        target: StreamTarget,
    },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    Http {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("endpoint returned status {status} on `{stage}`: {body}"))]
    Status {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("endpoint reported error code {code} on `{stage}`: {message}"))]
    Application {
        stage: &'static str,
        code: i64,
        message: String,
    },
    #[snafu(display("failed to decode response on `{stage}`, {source}"))]
    Decode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("response on `{stage}` carried no data"))]
    MissingPayload { stage: &'static str },
    #[snafu(display("event stream broke on `{stage}`: {message}"))]
    EventStream {
        stage: &'static str,
        message: String,
    },
}

/// Receiving half of one exchange. Dropping it cancels the exchange.
pub struct AnswerStream {
    target: StreamTarget,
    events: mpsc::UnboundedReceiver<StreamEventMapped>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct StreamHandle {
    pub stream: AnswerStream,
    pub worker: StreamWorker,
}

impl AnswerStream {
    pub(crate) fn new(
        target: StreamTarget,
        events: mpsc::UnboundedReceiver<StreamEventMapped>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            target,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn target(&self) -> StreamTarget {
        self.target
    }

    pub async fn recv(&mut self) -> Option<StreamEventMapped> {
        self.events.recv().await
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

pub trait ChatBackend: Send + Sync {
    fn stream_completion(&self, request: StreamRequest) -> BackendResult<StreamHandle>;
    fn upsert_conversation<'a>(
        &'a self,
        request: ConversationUpsert,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>>;
    fn upload_files<'a>(
        &'a self,
        conversation_id: Option<String>,
        files: Vec<UploadFile>,
    ) -> BoxFuture<'a, BackendResult<Vec<String>>>;
}

/// Builds the channel pair behind one exchange.
///
/// Public so in-process backends can drive an [`AnswerStream`] directly.
pub fn make_event_stream(
    target: StreamTarget,
) -> (
    mpsc::UnboundedSender<StreamEventMapped>,
    AnswerStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        AnswerStream::new(target, event_rx, cancel_tx),
        cancel_rx,
    )
}
