use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use super::backend::{
    ApplicationSnafu, BackendConfig, BackendError, BackendResult, BoxFuture, ChatBackend,
    ConversationRecord, ConversationUpsert, DecodeSnafu, EmptyMessageSetSnafu, HttpSnafu,
    MissingBaseUrlSnafu, MissingPayloadSnafu, StatusSnafu, StreamEventMapped,
    StreamEventPayload, StreamHandle, StreamRequest, StreamTarget, StreamWorker, UploadFile,
    make_event_stream,
};
use super::decode::{DecodedFrame, decode_envelope, decode_frame};

/// What the worker loop should do after forwarding one decoded frame.
enum FrameFlow {
    Continue,
    Finished,
    Failed,
    ReceiverGone,
}

/// `ChatBackend` speaking the knowledge-base HTTP API through reqwest.
pub struct HttpBackend {
    config: BackendConfig,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        ensure!(
            !config.base_url.is_empty(),
            MissingBaseUrlSnafu {
                stage: "http-backend-new",
            }
        );

        let client = reqwest::Client::builder()
            .build()
            .context(HttpSnafu {
                stage: "build-client",
            })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn authorized(
        builder: reqwest::RequestBuilder,
        api_key: &str,
    ) -> reqwest::RequestBuilder {
        if api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(api_key)
        }
    }

    async fn read_envelope<T: DeserializeOwned>(
        response: reqwest::Response,
        stage: &'static str,
    ) -> BackendResult<T> {
        let status = response.status();
        let body = response.text().await.context(HttpSnafu { stage })?;

        if !status.is_success() {
            return StatusSnafu {
                stage,
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        let envelope = decode_envelope::<T>(&body).context(DecodeSnafu { stage })?;
        if !envelope.is_success() {
            return ApplicationSnafu {
                stage,
                code: envelope.code,
                message: envelope.message,
            }
            .fail();
        }

        match envelope.data {
            Some(data) => Ok(data),
            None => MissingPayloadSnafu { stage }.fail(),
        }
    }

    async fn open_stream(
        client: &reqwest::Client,
        url: &str,
        api_key: &str,
        request: &StreamRequest,
    ) -> BackendResult<reqwest::Response> {
        let builder = Self::authorized(client.post(url), api_key).json(&request.body);
        let response = builder.send().await.context(HttpSnafu {
            stage: "open-stream",
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return StatusSnafu {
                stage: "open-stream-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    fn emit_error_event(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        error: BackendError,
    ) {
        let _ = event_tx.send(StreamEventMapped {
            target,
            payload: StreamEventPayload::Error(error.to_string()),
        });
    }

    fn forward_frame(
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
        frame: DecodedFrame,
    ) -> FrameFlow {
        match frame {
            DecodedFrame::Answer(chunk) => {
                let mapped = StreamEventMapped {
                    target,
                    payload: StreamEventPayload::Answer(chunk),
                };
                if event_tx.send(mapped).is_err() {
                    FrameFlow::ReceiverGone
                } else {
                    FrameFlow::Continue
                }
            }
            DecodedFrame::End => FrameFlow::Finished,
            DecodedFrame::Failure { code, message } => {
                tracing::warn!(
                    target = ?target,
                    code,
                    message = %message,
                    "completion stream reported an application error"
                );
                Self::emit_error_event(
                    event_tx,
                    target,
                    BackendError::Application {
                        stage: "stream-envelope",
                        code,
                        message,
                    },
                );
                FrameFlow::Failed
            }
        }
    }

    /// Replies that are not an event stream carry one envelope, usually an error.
    fn is_plain_json(response: &reqwest::Response) -> bool {
        response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/json"))
    }

    async fn forward_json_reply(
        response: reqwest::Response,
        event_tx: &mpsc::UnboundedSender<StreamEventMapped>,
        target: StreamTarget,
    ) -> FrameFlow {
        let body = match response.text().await {
            Ok(body) => body,
            Err(source) => {
                let error = BackendError::Http {
                    stage: "read-json-reply",
                    source,
                };
                Self::emit_error_event(event_tx, target, error);
                return FrameFlow::Failed;
            }
        };

        match decode_frame(&body) {
            Some(frame) => Self::forward_frame(event_tx, target, frame),
            None => {
                let error = BackendError::MissingPayload {
                    stage: "read-json-reply",
                };
                Self::emit_error_event(event_tx, target, error);
                FrameFlow::Failed
            }
        }
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        url: String,
        api_key: String,
        request: StreamRequest,
        event_tx: mpsc::UnboundedSender<StreamEventMapped>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let target = request.target;

        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!(target = ?target, "exchange cancelled before the response opened");
                return;
            }
            opened = Self::open_stream(&client, &url, &api_key, &request) => match opened {
                Ok(response) => response,
                Err(error) => {
                    tracing::error!(
                        target = ?target,
                        url = %url,
                        error = %error,
                        "failed to open completion stream"
                    );
                    Self::emit_error_event(&event_tx, target, error);
                    return;
                }
            },
        };

        if Self::is_plain_json(&response) {
            match Self::forward_json_reply(response, &event_tx, target).await {
                FrameFlow::Continue | FrameFlow::Finished => {
                    let _ = event_tx.send(StreamEventMapped {
                        target,
                        payload: StreamEventPayload::Done,
                    });
                }
                FrameFlow::Failed | FrameFlow::ReceiverGone => {}
            }
            return;
        }

        let mut stream = response.bytes_stream().eventsource();
        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    // Dropping the body stream below aborts the underlying connection.
                    tracing::debug!(target = ?target, "completion stream cancelled");
                    break;
                }
                next_event = stream.next() => {
                    let event = match next_event {
                        Some(Ok(event)) => event,
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(
                                target = ?target,
                                error = %source,
                                "completion stream failed mid-transfer"
                            );
                            let error = BackendError::EventStream {
                                stage: "stream-event",
                                message: source.to_string(),
                            };
                            Self::emit_error_event(&event_tx, target, error);
                            break;
                        }
                        None => break,
                    };

                    let Some(frame) = decode_frame(&event.data) else {
                        continue;
                    };
                    match Self::forward_frame(&event_tx, target, frame) {
                        FrameFlow::Continue => {}
                        FrameFlow::Finished => break,
                        FrameFlow::Failed => {
                            stream_failed = true;
                            break;
                        }
                        FrameFlow::ReceiverGone => return,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEventMapped {
                target,
                payload: StreamEventPayload::Done,
            });
        }
    }

    async fn post_conversation(&self, request: ConversationUpsert) -> BackendResult<ConversationRecord> {
        let url = self.config.endpoint(&self.config.conversation_path);
        let response = Self::authorized(self.client.post(&url), &self.config.api_key)
            .json(&request)
            .send()
            .await
            .context(HttpSnafu {
                stage: "send-conversation-upsert",
            })?;

        Self::read_envelope(response, "read-conversation-upsert").await
    }

    async fn post_files(
        &self,
        conversation_id: Option<String>,
        files: Vec<UploadFile>,
    ) -> BackendResult<Vec<String>> {
        let mut form = Form::new();
        for file in files {
            let mut part = Part::bytes(file.bytes).file_name(file.file_name);
            if let Some(mime_type) = file.mime_type.as_deref() {
                part = part.mime_str(mime_type).context(HttpSnafu {
                    stage: "build-upload-part",
                })?;
            }
            form = form.part("file", part);
        }
        if let Some(conversation_id) = conversation_id {
            form = form.text("conversation_id", conversation_id);
        }

        let url = self.config.endpoint(&self.config.upload_path);
        let response = Self::authorized(self.client.post(&url), &self.config.api_key)
            .multipart(form)
            .send()
            .await
            .context(HttpSnafu {
                stage: "send-upload",
            })?;

        Self::read_envelope(response, "read-upload").await
    }
}

impl ChatBackend for HttpBackend {
    fn stream_completion(&self, request: StreamRequest) -> BackendResult<StreamHandle> {
        ensure!(
            !request.body.messages.is_empty(),
            EmptyMessageSetSnafu {
                stage: "stream-completion",
                target: request.target,
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let worker: StreamWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.endpoint(&self.config.completion_path),
            self.config.api_key.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(StreamHandle { stream, worker })
    }

    fn upsert_conversation<'a>(
        &'a self,
        request: ConversationUpsert,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>> {
        Box::pin(self.post_conversation(request))
    }

    fn upload_files<'a>(
        &'a self,
        conversation_id: Option<String>,
        files: Vec<UploadFile>,
    ) -> BoxFuture<'a, BackendResult<Vec<String>>> {
        Box::pin(self.post_files(conversation_id, files))
    }
}
