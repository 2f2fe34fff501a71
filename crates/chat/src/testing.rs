//! In-process [`ChatBackend`] driven by the test body.
//!
//! Every `stream_completion` call records its request and hands the event
//! sender to the test, which then scripts chunks, completion or failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kbchat_llm::{
    AnswerChunk, BackendError, BackendResult, BoxFuture, ChatBackend, ConversationRecord,
    ConversationUpsert, StreamEventMapped, StreamEventPayload, StreamHandle, StreamRequest,
    StreamTarget, StreamWorker, UploadFile, WireMessage, make_event_stream,
};
use serde_json::Value;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One exchange opened against a [`ScriptedBackend`].
#[derive(Debug)]
pub struct ScriptedExchange {
    pub request: StreamRequest,
    event_tx: mpsc::UnboundedSender<StreamEventMapped>,
    cancelled: Arc<AtomicBool>,
}

impl ScriptedExchange {
    pub fn target(&self) -> StreamTarget {
        self.request.target
    }

    /// Emits the accumulated answer text so far.
    pub fn answer(&self, text: &str) -> bool {
        self.emit(StreamEventPayload::Answer(AnswerChunk {
            answer: text.to_string(),
            ..AnswerChunk::default()
        }))
    }

    pub fn answer_with_reference(&self, text: &str, reference: Value) -> bool {
        self.emit(StreamEventPayload::Answer(AnswerChunk {
            answer: text.to_string(),
            reference: Some(reference),
            ..AnswerChunk::default()
        }))
    }

    pub fn done(&self) -> bool {
        self.emit(StreamEventPayload::Done)
    }

    pub fn fail(&self, message: &str) -> bool {
        self.emit(StreamEventPayload::Error(message.to_string()))
    }

    /// Event for this exchange, for injecting directly into an orchestrator.
    pub fn event(&self, payload: StreamEventPayload) -> StreamEventMapped {
        StreamEventMapped {
            target: self.target(),
            payload,
        }
    }

    /// True once the consumer dropped the stream or the worker saw the cancel signal.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.event_tx.is_closed()
    }

    fn emit(&self, payload: StreamEventPayload) -> bool {
        self.event_tx.send(self.event(payload)).is_ok()
    }
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    exchanges: Mutex<Vec<Arc<ScriptedExchange>>>,
    upserts: Mutex<Vec<ConversationUpsert>>,
    uploads: Mutex<Vec<(Option<String>, Vec<String>)>>,
    fail_upserts: AtomicBool,
    reject_streams: AtomicBool,
    rejected_models: Mutex<Vec<String>>,
    upsert_history: Mutex<Option<Vec<WireMessage>>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn exchange(&self, index: usize) -> Option<Arc<ScriptedExchange>> {
        lock(&self.exchanges).get(index).cloned()
    }

    pub fn exchange_count(&self) -> usize {
        lock(&self.exchanges).len()
    }

    pub fn upserts(&self) -> Vec<ConversationUpsert> {
        lock(&self.upserts).clone()
    }

    /// Conversation id and file names of every upload call.
    pub fn uploads(&self) -> Vec<(Option<String>, Vec<String>)> {
        lock(&self.uploads).clone()
    }

    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    pub fn set_reject_streams(&self, reject: bool) {
        self.reject_streams.store(reject, Ordering::SeqCst);
    }

    /// Makes successful upserts answer with `history` instead of echoing the request.
    pub fn set_upsert_history(&self, history: Vec<WireMessage>) {
        *lock(&self.upsert_history) = Some(history);
    }

    /// Refuses streams whose request selects `llm_id`.
    pub fn reject_model(&self, llm_id: impl Into<String>) {
        lock(&self.rejected_models).push(llm_id.into());
    }

    fn rejects(&self, request: &StreamRequest) -> bool {
        if self.reject_streams.load(Ordering::SeqCst) {
            return true;
        }
        request
            .body
            .llm_id
            .as_ref()
            .is_some_and(|llm_id| lock(&self.rejected_models).contains(llm_id))
    }
}

impl ChatBackend for ScriptedBackend {
    fn stream_completion(&self, request: StreamRequest) -> BackendResult<StreamHandle> {
        if self.rejects(&request) {
            return Err(BackendError::Status {
                stage: "scripted-stream",
                status: 503,
                body: "unavailable".to_string(),
            });
        }

        let (event_tx, stream, cancel_rx) = make_event_stream(request.target);
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_flag = Arc::clone(&cancelled);
        let worker: StreamWorker = Box::pin(async move {
            if cancel_rx.await.is_ok() {
                worker_flag.store(true, Ordering::SeqCst);
            }
        });

        lock(&self.exchanges).push(Arc::new(ScriptedExchange {
            request,
            event_tx,
            cancelled,
        }));

        Ok(StreamHandle { stream, worker })
    }

    fn upsert_conversation<'a>(
        &'a self,
        request: ConversationUpsert,
    ) -> BoxFuture<'a, BackendResult<ConversationRecord>> {
        Box::pin(async move {
            lock(&self.upserts).push(request.clone());
            if self.fail_upserts.load(Ordering::SeqCst) {
                return Err(BackendError::Application {
                    stage: "scripted-upsert",
                    code: 102,
                    message: "dialog not found".to_string(),
                });
            }
            let message = lock(&self.upsert_history)
                .clone()
                .unwrap_or(request.message);
            Ok(ConversationRecord {
                id: request.conversation_id.unwrap_or_default(),
                name: request.name,
                message,
            })
        })
    }

    fn upload_files<'a>(
        &'a self,
        conversation_id: Option<String>,
        files: Vec<UploadFile>,
    ) -> BoxFuture<'a, BackendResult<Vec<String>>> {
        Box::pin(async move {
            let names: Vec<String> = files.iter().map(|file| file.file_name.clone()).collect();
            let ids = (0..names.len()).map(|index| format!("doc-{index}")).collect();
            lock(&self.uploads).push((conversation_id, names));
            Ok(ids)
        })
    }
}
