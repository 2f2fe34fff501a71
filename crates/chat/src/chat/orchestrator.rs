use std::sync::Arc;

use kbchat_llm::{
    BoxKey, ChatBackend, ConversationRecord, ConversationUpsert, ExchangeId as WireExchangeId,
    Role as WireRole, StreamEventMapped, StreamEventPayload, StreamHandle, StreamRequest,
    StreamTarget as WireStreamTarget, UploadFile, WireMessage,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::error::{
    BackendSnafu, ChatError, ChatResult, ConversationUnboundSnafu, EmptyInputSnafu,
    MessageNotFoundSnafu, StreamRejectedSnafu, UnknownChatBoxSnafu,
};
use super::events::{ChatNotice, Inbound};
use super::message::{
    ChatBoxId, Conversation, ConversationId, ExchangeId, Message, MessageId, MessageStatus, Role,
    StreamAnswer, StreamState, StreamTarget, StreamTransition,
};
use super::reference::Reference;
use super::registry::{ActiveExchange, ChatBoxConfig, ChatBoxEntry, ChatBoxRegistry};

/// Conversation names sent to the backend are cut to this many characters.
const MAX_CONVERSATION_NAME_CHARS: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrchestratorConfig {
    pub dialog_id: String,
    pub prologue: Option<String>,
    pub reasoning: bool,
    pub internet: bool,
}

/// Conversation identity as seen by the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationBinding {
    #[default]
    Unbound,
    /// Bound optimistically while the initial upsert is in flight.
    Persisting(ConversationId),
    /// Bound, but the initial upsert failed; the next send retries it.
    Unpersisted(ConversationId),
    Persisted(ConversationId),
}

impl ConversationBinding {
    pub fn id(&self) -> Option<ConversationId> {
        match self {
            Self::Unbound => None,
            Self::Persisting(id) | Self::Unpersisted(id) | Self::Persisted(id) => Some(*id),
        }
    }

    pub fn is_new(&self) -> bool {
        !matches!(self, Self::Persisted(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnsuredConversation {
    pub id: ConversationId,
    pub created: bool,
    /// Messages that precede the first turn of a freshly created conversation.
    pub history: Vec<Message>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartedExchange {
    pub box_id: ChatBoxId,
    pub exchange_id: ExchangeId,
    pub question_id: MessageId,
    pub answer_id: MessageId,
}

/// A box whose exchange could not be started by a send.
#[derive(Debug)]
pub struct BoxFailure {
    pub box_id: ChatBoxId,
    pub error: ChatError,
}

#[derive(Debug)]
pub struct DispatchReport {
    pub conversation_id: ConversationId,
    pub started: Vec<StartedExchange>,
    /// Boxes skipped because no model is selected.
    pub skipped: Vec<ChatBoxId>,
    pub failed: Vec<BoxFailure>,
}

/// Owns conversation identity and fans sends out to one or many chat boxes.
///
/// All state changes happen on the caller's task: spawned exchange readers only
/// forward events into an internal queue drained by [`SessionOrchestrator::pump`].
pub struct SessionOrchestrator {
    backend: Arc<dyn ChatBackend>,
    config: OrchestratorConfig,
    multi_box: bool,
    binding: ConversationBinding,
    /// Name sent with every upsert of the bound conversation, taken from its first question.
    conversation_name: String,
    boxes: ChatBoxRegistry,
    next_exchange_id: u64,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
}

impl SessionOrchestrator {
    /// Single-box session using the dialog's default model.
    pub fn single(backend: Arc<dyn ChatBackend>, config: OrchestratorConfig) -> Self {
        Self::with_registry(
            backend,
            config,
            false,
            ChatBoxRegistry::with_primary(ChatBoxConfig::default()),
        )
    }

    /// Multi-box session, one box per config (at most three).
    pub fn multi(
        backend: Arc<dyn ChatBackend>,
        config: OrchestratorConfig,
        boxes: Vec<ChatBoxConfig>,
    ) -> ChatResult<Self> {
        let mut registry = ChatBoxRegistry::new();
        for box_config in boxes {
            registry.add(box_config)?;
        }
        Ok(Self::with_registry(backend, config, true, registry))
    }

    fn with_registry(
        backend: Arc<dyn ChatBackend>,
        config: OrchestratorConfig,
        multi_box: bool,
        boxes: ChatBoxRegistry,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            backend,
            config,
            multi_box,
            binding: ConversationBinding::Unbound,
            conversation_name: String::new(),
            boxes,
            next_exchange_id: 1,
            inbound_tx,
            inbound_rx,
        }
    }

    /// Returns the current conversation binding.
    pub fn binding(&self) -> ConversationBinding {
        self.binding
    }

    /// Returns the bound conversation id, persisted or not.
    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.binding.id()
    }

    pub fn is_multi_box(&self) -> bool {
        self.multi_box
    }

    /// Returns the oldest box, the one a single-box session sends through.
    pub fn primary_box_id(&self) -> Option<ChatBoxId> {
        self.boxes.iter().next().map(|entry| entry.id)
    }

    pub fn box_ids(&self) -> Vec<ChatBoxId> {
        self.boxes.ids()
    }

    pub fn box_config(&self, box_id: ChatBoxId) -> Option<&ChatBoxConfig> {
        self.boxes.get(box_id).map(|entry| &entry.config)
    }

    /// Returns the stream state of a box.
    pub fn stream_state(&self, box_id: ChatBoxId) -> Option<&StreamState> {
        self.boxes.get(box_id).map(|entry| &entry.stream_state)
    }

    /// Returns the messages of a box; an unknown box has none.
    pub fn messages(&self, box_id: ChatBoxId) -> &[Message] {
        self.boxes
            .get(box_id)
            .map(|entry| entry.store.messages())
            .unwrap_or(&[])
    }

    /// True when no box has an exchange in flight; gates the input control.
    pub fn all_idle(&self) -> bool {
        self.boxes.all_idle()
    }

    /// Returns true when the box has no exchange in flight or no longer exists.
    pub fn is_box_idle(&self, box_id: ChatBoxId) -> bool {
        self.boxes.get(box_id).is_none_or(ChatBoxEntry::is_idle)
    }

    /// Adds a box and switches the session to multi-box mode.
    pub fn add_box(&mut self, config: ChatBoxConfig) -> ChatResult<ChatBoxId> {
        let id = self.boxes.add(config)?;
        self.multi_box = true;
        Ok(id)
    }

    /// Removes a box, cancelling its exchange. Returns false for an unknown box.
    pub fn remove_box(&mut self, box_id: ChatBoxId) -> bool {
        match self.boxes.remove(box_id) {
            Some(mut entry) => {
                Self::cancel_entry(&mut entry);
                true
            }
            None => false,
        }
    }

    /// Makes the box set match `ids` exactly, cancelling exchanges of dropped boxes.
    pub fn sync_boxes(&mut self, ids: &[ChatBoxId]) -> ChatResult<()> {
        for mut entry in self.boxes.sync_to(ids)? {
            tracing::debug!(box_id = ?entry.id, "pruning chat box");
            Self::cancel_entry(&mut entry);
        }
        Ok(())
    }

    pub fn set_box_config(&mut self, box_id: ChatBoxId, config: ChatBoxConfig) -> ChatResult<()> {
        let entry = self.boxes.get_mut(box_id).context(UnknownChatBoxSnafu {
            stage: "set-box-config",
            box_id,
        })?;
        entry.config = config;
        Ok(())
    }

    /// Binds a conversation id, creating one if none is bound yet.
    ///
    /// The id is bound before the upsert is even issued, so a second send that
    /// arrives while persistence is pending reuses it.
    pub fn ensure_conversation(&mut self, first_message_text: &str) -> EnsuredConversation {
        match self.binding {
            ConversationBinding::Persisting(id) | ConversationBinding::Persisted(id) => {
                EnsuredConversation {
                    id,
                    created: false,
                    history: Vec::new(),
                }
            }
            ConversationBinding::Unpersisted(id) => {
                self.spawn_persist(id);
                EnsuredConversation {
                    id,
                    created: false,
                    history: Vec::new(),
                }
            }
            ConversationBinding::Unbound => {
                let id = ConversationId::new_v4();
                self.conversation_name = first_message_text
                    .trim()
                    .chars()
                    .take(MAX_CONVERSATION_NAME_CHARS)
                    .collect();
                self.spawn_persist(id);
                EnsuredConversation {
                    id,
                    created: true,
                    history: self.prologue_history(id),
                }
            }
        }
    }

    /// Sends one user input to every eligible box.
    ///
    /// Boxes are independent: a box whose exchange cannot start is recorded in
    /// [`DispatchReport::failed`] and the remaining boxes still receive the
    /// question. The send only fails as a whole when no exchange started.
    pub fn dispatch_send(&mut self, text: &str, files: Vec<String>) -> ChatResult<DispatchReport> {
        let text = text.trim();
        ensure!(!text.is_empty(), EmptyInputSnafu {
            stage: "dispatch-send"
        });

        let ensured = self.ensure_conversation(text);
        let mut report = DispatchReport {
            conversation_id: ensured.id,
            started: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
        };

        for box_id in self.boxes.ids() {
            let tag = self.box_tag(box_id);
            let multi_box = self.multi_box;
            let Some(entry) = self.boxes.get_mut(box_id) else {
                continue;
            };

            if multi_box && !entry.config.has_model() {
                tracing::debug!(box_id = ?box_id, "skipping chat box without a selected model");
                report.skipped.push(box_id);
                continue;
            }

            // A new send supersedes whatever is still streaming into this box.
            Self::cancel_entry(entry);

            if ensured.created {
                entry.store.set_derived_messages(
                    ensured
                        .history
                        .iter()
                        .cloned()
                        .map(|message| message.with_chat_box(tag))
                        .collect(),
                );
            }

            let question_id = MessageId::new_v4();
            let queued = entry.store.add_newest_question(
                Message::user(question_id, text)
                    .with_files(files.clone())
                    .with_chat_box(tag),
            );
            let started = queued.and_then(|()| self.start_exchange(box_id, question_id, None));

            match started {
                Ok(started) => report.started.push(started),
                Err(error) => {
                    tracing::warn!(box_id = ?box_id, error = %error, "chat box did not start");
                    report.failed.push(BoxFailure { box_id, error });
                }
            }
        }

        if report.started.is_empty() && !report.failed.is_empty() {
            return Err(report.failed.remove(0).error);
        }
        Ok(report)
    }

    /// Opens one exchange answering `question_id`, which must already be in the box store.
    ///
    /// `history` overrides the store contents sent to the backend.
    pub(crate) fn start_exchange(
        &mut self,
        box_id: ChatBoxId,
        question_id: MessageId,
        history: Option<Vec<Message>>,
    ) -> ChatResult<StartedExchange> {
        let conversation_id = self.binding.id().context(ConversationUnboundSnafu {
            stage: "start-exchange",
        })?;
        let tag = self.box_tag(box_id);
        let exchange_id = self.alloc_exchange_id();
        let target = StreamTarget::new(box_id, exchange_id);

        let entry = self.boxes.get_mut(box_id).context(UnknownChatBoxSnafu {
            stage: "start-exchange",
            box_id,
        })?;
        let input_text = entry
            .store
            .get(question_id)
            .map(|question| question.content.clone())
            .context(MessageNotFoundSnafu {
                stage: "start-exchange",
                id: question_id,
            })?;

        let history = history.unwrap_or_else(|| entry.store.messages().to_vec());
        let wire_messages = wire_history(&history);

        entry.stream_state = entry
            .stream_state
            .apply(StreamTransition::Start(target))
            .map_err(|rejection| {
                StreamRejectedSnafu {
                    stage: "start-exchange",
                    rejection,
                }
                .build()
            })?;

        let answer_id = MessageId::answer_for(question_id);
        entry
            .store
            .add_newest_answer(&StreamAnswer::placeholder(answer_id, exchange_id, tag));

        let mut request = StreamRequest::new(
            wire_target(target),
            conversation_id.to_string(),
            wire_messages,
        )
        .with_reasoning(self.config.reasoning)
        .with_internet(self.config.internet);
        if let Some(llm_id) = entry
            .config
            .llm_id
            .as_deref()
            .filter(|llm_id| !llm_id.trim().is_empty())
        {
            request = request.with_model(llm_id, entry.config.params.clone());
        }

        let handle = match self.backend.stream_completion(request) {
            Ok(handle) => handle,
            Err(source) => {
                tracing::error!(
                    box_id = ?box_id,
                    exchange_id = ?exchange_id,
                    error = %source,
                    "failed to start exchange"
                );
                Self::rollback_answer(entry, answer_id);
                Self::transition(
                    entry,
                    StreamTransition::Fail {
                        target,
                        message: source.to_string(),
                    },
                );
                return Err(ChatError::Backend {
                    stage: "start-exchange",
                    source,
                });
            }
        };

        let StreamHandle { mut stream, worker } = handle;
        let worker_task = tokio::spawn(worker);
        let inbound_tx = self.inbound_tx.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if inbound_tx.send(Inbound::Stream(event)).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(Inbound::StreamClosed(target));
        });

        entry.active = Some(ActiveExchange {
            target,
            question_id,
            answer_id,
            input_text,
            published: false,
            worker_task,
            reader_task,
        });

        tracing::debug!(
            box_id = ?box_id,
            exchange_id = ?exchange_id,
            conversation_id = %conversation_id,
            "exchange started"
        );

        Ok(StartedExchange {
            box_id,
            exchange_id,
            question_id,
            answer_id,
        })
    }

    /// User-initiated cancel. Published partial content stays; an empty answer slot is removed.
    pub fn cancel(&mut self, box_id: ChatBoxId) -> bool {
        match self.boxes.get_mut(box_id) {
            Some(entry) => Self::cancel_entry(entry),
            None => false,
        }
    }

    /// Cancels the exchange of every box.
    pub fn cancel_all(&mut self) {
        for entry in self.boxes.iter_mut() {
            Self::cancel_entry(entry);
        }
    }

    /// Deletes one message from a box.
    pub fn remove_message(&mut self, box_id: ChatBoxId, id: MessageId) -> Option<Message> {
        self.boxes
            .get_mut(box_id)
            .and_then(|entry| entry.store.remove_message_by_id(id))
    }

    /// Binds an existing persisted conversation and replaces every box's messages.
    pub fn load_conversation(&mut self, id: ConversationId, messages: Vec<Message>) {
        self.cancel_all();
        self.binding = ConversationBinding::Persisted(id);
        self.conversation_name.clear();

        let multi_box = self.multi_box;
        for entry in self.boxes.iter_mut() {
            let tag = multi_box.then_some(entry.id);
            entry.store.set_derived_messages(
                messages
                    .iter()
                    .cloned()
                    .map(|message| message.with_chat_box(tag))
                    .collect(),
            );
            entry.stream_state = StreamState::Idle;
        }
    }

    /// Clears every box and unbinds the conversation id.
    pub fn reset(&mut self) {
        self.cancel_all();
        self.binding = ConversationBinding::Unbound;
        self.conversation_name.clear();
        for entry in self.boxes.iter_mut() {
            entry.store.clear();
            entry.stream_state = StreamState::Idle;
        }
    }

    pub async fn upload_files(&self, files: Vec<UploadFile>) -> ChatResult<Vec<String>> {
        let conversation_id = self.binding.id().map(|id| id.to_string());
        self.backend
            .upload_files(conversation_id, files)
            .await
            .context(BackendSnafu {
                stage: "upload-files",
            })
    }

    /// Waits for the next queued item and applies it.
    pub async fn pump(&mut self) -> Option<ChatNotice> {
        let inbound = self.inbound_rx.recv().await?;
        self.handle_inbound(inbound)
    }

    /// Drains queued work until every box is idle.
    pub async fn run_until_idle(&mut self) -> Vec<ChatNotice> {
        let mut notices = Vec::new();
        while !self.all_idle() {
            if let Some(notice) = self.pump().await {
                notices.push(notice);
            }
        }
        notices
    }

    pub fn handle_inbound(&mut self, inbound: Inbound) -> Option<ChatNotice> {
        match inbound {
            Inbound::Stream(event) => self.handle_stream_event(event),
            Inbound::StreamClosed(target) => {
                let entry = self.boxes.get_mut(target.box_id)?;
                if !entry.is_current(target) {
                    return None;
                }
                Self::fail_exchange(
                    entry,
                    target,
                    "stream ended before a terminal event".to_string(),
                )
            }
            Inbound::ConversationPersisted { id, result } => {
                self.handle_conversation_persisted(id, result)
            }
        }
    }

    fn handle_stream_event(&mut self, event: StreamEventMapped) -> Option<ChatNotice> {
        let target = chat_target(event.target);
        let tag = self.box_tag(target.box_id);

        let Some(entry) = self.boxes.get_mut(target.box_id) else {
            tracing::debug!(target = ?target, "dropping event for a removed chat box");
            return None;
        };

        if !entry.is_current(target) {
            // Strict target equality keeps superseded exchanges out of the store.
            tracing::debug!(target = ?target, "dropping stale stream event");
            return None;
        }

        match event.payload {
            StreamEventPayload::Answer(chunk) => {
                let active = entry.active.as_mut()?;
                let answer = StreamAnswer {
                    id: active.answer_id,
                    exchange_id: target.exchange_id,
                    answer: chunk.answer,
                    reference: chunk.reference.and_then(Reference::from_value),
                    audio: chunk.audio_binary,
                    chat_box_id: tag,
                    done: false,
                };
                active.published |= !answer.answer.is_empty();
                entry.store.add_newest_answer(&answer);

                Some(ChatNotice::AnswerUpdated {
                    box_id: target.box_id,
                    message_id: answer.id,
                })
            }
            StreamEventPayload::Done => {
                let active = entry.active.take()?;
                Self::transition(entry, StreamTransition::Complete(target));
                entry.store.set_status(active.answer_id, MessageStatus::Done);
                let answer_id = active.answer_id;
                active.abort();

                tracing::debug!(target = ?target, "exchange completed");
                Some(ChatNotice::AnswerCompleted {
                    box_id: target.box_id,
                    message_id: answer_id,
                })
            }
            StreamEventPayload::Error(message) => Self::fail_exchange(entry, target, message),
        }
    }

    fn handle_conversation_persisted(
        &mut self,
        id: ConversationId,
        result: Result<ConversationRecord, kbchat_llm::BackendError>,
    ) -> Option<ChatNotice> {
        if self.binding != ConversationBinding::Persisting(id) {
            tracing::debug!(
                conversation_id = %id,
                "ignoring persistence result for a conversation that is no longer bound"
            );
            return None;
        }

        match result {
            Ok(record) => {
                let bound = match Conversation::from_record(&record) {
                    Ok(conversation) => {
                        if conversation.id != id {
                            tracing::info!(
                                conversation_id = %id,
                                assigned = %conversation.id,
                                "backend assigned a different conversation id"
                            );
                        }
                        self.reconcile_initial_history(&conversation.messages);
                        conversation.id
                    }
                    Err(error) => {
                        tracing::warn!(
                            conversation_id = %id,
                            error = %error,
                            "keeping local conversation id, persisted record is unreadable"
                        );
                        id
                    }
                };
                self.binding = ConversationBinding::Persisted(bound);
                Some(ChatNotice::ConversationPersisted { id: bound })
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %id,
                    error = %error,
                    "failed to persist new conversation"
                );
                self.binding = ConversationBinding::Unpersisted(id);
                Some(ChatNotice::ConversationPersistFailed {
                    id,
                    error: error.to_string(),
                })
            }
        }
    }

    /// Replaces the seeded lead-in of every box with the history the backend created.
    ///
    /// The lead-in is everything before the first user message. An empty
    /// returned history keeps the local seed.
    fn reconcile_initial_history(&mut self, history: &[Message]) {
        if history.is_empty() {
            return;
        }

        let multi_box = self.multi_box;
        for entry in self.boxes.iter_mut() {
            let messages = entry.store.messages();
            let lead_in = messages
                .iter()
                .position(|message| message.role == Role::User)
                .unwrap_or(messages.len());
            let matches = lead_in == history.len()
                && messages[..lead_in]
                    .iter()
                    .zip(history)
                    .all(|(local, remote)| local.role == remote.role && local.content == remote.content);
            if matches {
                continue;
            }

            tracing::info!(
                box_id = ?entry.id,
                local = lead_in,
                remote = history.len(),
                "replacing seeded history with the persisted one"
            );
            let tag = multi_box.then_some(entry.id);
            let reconciled = history
                .iter()
                .cloned()
                .map(|message| message.with_chat_box(tag))
                .chain(messages[lead_in..].iter().cloned())
                .collect();
            entry.store.set_derived_messages(reconciled);
        }
    }

    fn fail_exchange(
        entry: &mut ChatBoxEntry,
        target: StreamTarget,
        message: String,
    ) -> Option<ChatNotice> {
        let active = entry.active.take()?;
        Self::transition(
            entry,
            StreamTransition::Fail {
                target,
                message: message.clone(),
            },
        );

        let restore_input = if active.published {
            entry
                .store
                .set_status(active.answer_id, MessageStatus::Error(message.clone()));
            tracing::warn!(target = ?target, error = %message, "exchange failed after partial answer");
            None
        } else {
            Self::rollback_answer(entry, active.answer_id);
            tracing::warn!(target = ?target, error = %message, "exchange failed; rolled back answer");
            Some(active.input_text.clone())
        };
        active.abort();

        Some(ChatNotice::ExchangeFailed {
            box_id: target.box_id,
            error: message,
            restore_input,
        })
    }

    fn cancel_entry(entry: &mut ChatBoxEntry) -> bool {
        let Some(active) = entry.active.take() else {
            return false;
        };
        Self::transition(entry, StreamTransition::Cancel(active.target));
        if active.published {
            entry
                .store
                .set_status(active.answer_id, MessageStatus::Cancelled);
        } else {
            Self::rollback_answer(entry, active.answer_id);
        }
        tracing::debug!(
            target = ?active.target,
            question_id = %active.question_id,
            "exchange cancelled"
        );
        active.abort();
        true
    }

    fn rollback_answer(entry: &mut ChatBoxEntry, answer_id: MessageId) {
        let answer_is_last = entry
            .store
            .last()
            .is_some_and(|message| message.id == answer_id && message.role == Role::Assistant);
        if answer_is_last {
            entry.store.remove_latest_message();
        } else {
            entry.store.remove_message_by_id(answer_id);
        }
    }

    fn transition(entry: &mut ChatBoxEntry, transition: StreamTransition) {
        match entry.stream_state.apply(transition) {
            Ok(next_state) => entry.stream_state = next_state,
            Err(rejection) => {
                tracing::warn!(box_id = ?entry.id, rejection = ?rejection, "stream transition rejected");
            }
        }
    }

    fn spawn_persist(&mut self, id: ConversationId) {
        let request = ConversationUpsert {
            dialog_id: self.config.dialog_id.clone(),
            name: self.conversation_name.clone(),
            is_new: true,
            conversation_id: Some(id.to_string()),
            message: wire_history(&self.prologue_history(id)),
        };

        let backend = Arc::clone(&self.backend);
        let inbound_tx = self.inbound_tx.clone();
        tokio::spawn(async move {
            let result = backend.upsert_conversation(request).await;
            let _ = inbound_tx.send(Inbound::ConversationPersisted { id, result });
        });

        self.binding = ConversationBinding::Persisting(id);
    }

    fn prologue_history(&self, id: ConversationId) -> Vec<Message> {
        let Some(prologue) = self
            .config
            .prologue
            .as_deref()
            .map(str::trim)
            .filter(|prologue| !prologue.is_empty())
        else {
            return Vec::new();
        };

        // Derived from the conversation id so retries resend the same message id.
        let prologue_id = MessageId::new(Uuid::new_v5(&id.as_uuid(), b"prologue"));
        vec![Message::assistant(prologue_id, prologue)]
    }

    pub(super) fn boxes_mut(&mut self) -> &mut ChatBoxRegistry {
        &mut self.boxes
    }

    fn box_tag(&self, box_id: ChatBoxId) -> Option<ChatBoxId> {
        self.multi_box.then_some(box_id)
    }

    fn alloc_exchange_id(&mut self) -> ExchangeId {
        let id = ExchangeId::new(self.next_exchange_id);
        self.next_exchange_id = self.next_exchange_id.saturating_add(1);
        id
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn wire_history(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        // Empty assistant slots are placeholders, never real turns.
        .filter(|message| !(message.role == Role::Assistant && message.content.trim().is_empty()))
        .map(|message| {
            let role = match message.role {
                Role::User => WireRole::User,
                Role::Assistant => WireRole::Assistant,
            };
            WireMessage::new(message.id.to_string(), role, message.content.clone())
                .with_doc_ids(message.files.clone())
        })
        .collect()
}

fn wire_target(target: StreamTarget) -> WireStreamTarget {
    WireStreamTarget::new(
        BoxKey::new(target.box_id.0),
        WireExchangeId::new(target.exchange_id.0),
    )
}

fn chat_target(target: WireStreamTarget) -> StreamTarget {
    StreamTarget::new(
        ChatBoxId::new(target.box_key.0),
        ExchangeId::new(target.exchange_id.0),
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kbchat_llm::{AnswerChunk, ModelParams};
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;
    use crate::testing::ScriptedBackend;

    const PROLOGUE: &str = "Hi! How can I help?";

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            dialog_id: "dialog-1".to_string(),
            prologue: Some(PROLOGUE.to_string()),
            reasoning: false,
            internet: false,
        }
    }

    fn model(llm_id: &str) -> ChatBoxConfig {
        ChatBoxConfig::with_model(llm_id, ModelParams::default())
    }

    /// Next notice about an exchange, skipping persistence bookkeeping.
    async fn next_notice(orchestrator: &mut SessionOrchestrator) -> ChatNotice {
        timeout(Duration::from_secs(1), async {
            loop {
                match orchestrator.pump().await {
                    Some(ChatNotice::ConversationPersisted { .. }) | None => continue,
                    Some(notice) => return notice,
                }
            }
        })
        .await
        .expect("notice before timeout")
    }

    fn contents(messages: &[Message]) -> Vec<&str> {
        messages.iter().map(|message| message.content.as_str()).collect()
    }

    fn wire_contents(request: &StreamRequest) -> Vec<&str> {
        request
            .body
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect()
    }

    #[tokio::test]
    async fn accumulated_chunks_land_in_one_answer() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        let report = orchestrator.dispatch_send("Hello", Vec::new()).expect("send");
        assert_eq!(report.started.len(), 1);
        assert!(!orchestrator.all_idle());

        let exchange = backend.exchange(0).expect("exchange");
        assert_eq!(wire_contents(&exchange.request), vec![PROLOGUE, "Hello"]);
        assert_eq!(
            exchange.request.body.conversation_id,
            report.conversation_id.to_string()
        );
        assert_eq!(exchange.request.body.llm_id, None);

        exchange.answer("Hi");
        exchange.answer("Hi there");
        exchange.done();

        assert!(matches!(
            next_notice(&mut orchestrator).await,
            ChatNotice::AnswerUpdated { .. }
        ));
        assert!(matches!(
            next_notice(&mut orchestrator).await,
            ChatNotice::AnswerUpdated { .. }
        ));
        assert_eq!(
            next_notice(&mut orchestrator).await,
            ChatNotice::AnswerCompleted {
                box_id,
                message_id: report.started[0].answer_id,
            }
        );

        let messages = orchestrator.messages(box_id);
        assert_eq!(contents(messages), vec![PROLOGUE, "Hello", "Hi there"]);
        assert_eq!(messages[2].status, MessageStatus::Done);
        assert_eq!(messages[2].chat_box_id, None);
        assert!(orchestrator.all_idle());
    }

    #[tokio::test]
    async fn failure_before_any_text_rolls_back_and_restores_input() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        orchestrator.dispatch_send("Hello", Vec::new()).expect("send");
        backend.exchange(0).expect("exchange").fail("model offline");

        assert_eq!(
            next_notice(&mut orchestrator).await,
            ChatNotice::ExchangeFailed {
                box_id,
                error: "model offline".to_string(),
                restore_input: Some("Hello".to_string()),
            }
        );
        assert_eq!(contents(orchestrator.messages(box_id)), vec![PROLOGUE, "Hello"]);
        assert!(orchestrator.all_idle());
    }

    #[tokio::test]
    async fn failure_after_partial_text_keeps_it_marked_as_error() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        orchestrator.dispatch_send("Hello", Vec::new()).expect("send");
        let exchange = backend.exchange(0).expect("exchange");
        exchange.answer("Partial");
        exchange.fail("connection reset");

        next_notice(&mut orchestrator).await;
        assert!(matches!(
            next_notice(&mut orchestrator).await,
            ChatNotice::ExchangeFailed {
                restore_input: None,
                ..
            }
        ));

        let last = orchestrator.messages(box_id).last().expect("answer");
        assert_eq!(last.content, "Partial");
        assert_eq!(
            last.status,
            MessageStatus::Error("connection reset".to_string())
        );
    }

    #[tokio::test]
    async fn cancel_keeps_partial_text_and_drops_late_chunks() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        orchestrator.dispatch_send("Hello", Vec::new()).expect("send");
        let exchange = backend.exchange(0).expect("exchange");
        exchange.answer("Hi");
        next_notice(&mut orchestrator).await;

        assert!(orchestrator.cancel(box_id));
        assert!(orchestrator.all_idle());
        assert!(!orchestrator.cancel(box_id));

        exchange.answer("Hi there, too late");
        exchange.done();
        let late = timeout(Duration::from_millis(50), orchestrator.pump()).await;
        assert!(!matches!(late, Ok(Some(_))));
        assert!(exchange.is_cancelled());

        let injected = orchestrator.handle_inbound(Inbound::Stream(exchange.event(
            StreamEventPayload::Answer(AnswerChunk {
                answer: "zzz".to_string(),
                ..AnswerChunk::default()
            }),
        )));
        assert_eq!(injected, None);

        let last = orchestrator.messages(box_id).last().expect("answer");
        assert_eq!(last.content, "Hi");
        assert_eq!(last.status, MessageStatus::Cancelled);
    }

    #[tokio::test]
    async fn new_send_supersedes_live_exchange() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        orchestrator.dispatch_send("first", Vec::new()).expect("first send");
        orchestrator.dispatch_send("second", Vec::new()).expect("second send");

        let stale = backend.exchange(0).expect("first exchange");
        let live = backend.exchange(1).expect("second exchange");
        assert_eq!(wire_contents(&live.request), vec![PROLOGUE, "first", "second"]);

        stale.answer("stale");
        live.answer("fresh");
        assert!(matches!(
            next_notice(&mut orchestrator).await,
            ChatNotice::AnswerUpdated { .. }
        ));

        assert_eq!(
            contents(orchestrator.messages(box_id)),
            vec![PROLOGUE, "first", "second", "fresh"]
        );
    }

    #[tokio::test]
    async fn concurrent_sends_share_one_conversation_and_one_upsert() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());

        let first = orchestrator.dispatch_send("one", Vec::new()).expect("first");
        let second = orchestrator.dispatch_send("two", Vec::new()).expect("second");
        let id = first.conversation_id;
        assert_eq!(second.conversation_id, id);
        assert_eq!(orchestrator.binding(), ConversationBinding::Persisting(id));

        let notice = timeout(Duration::from_secs(1), orchestrator.pump())
            .await
            .expect("persistence result");
        assert_eq!(notice, Some(ChatNotice::ConversationPersisted { id }));
        assert_eq!(orchestrator.binding(), ConversationBinding::Persisted(id));

        let upserts = backend.upserts();
        assert_eq!(upserts.len(), 1);
        assert!(upserts[0].is_new);
        assert_eq!(upserts[0].dialog_id, "dialog-1");
        assert_eq!(upserts[0].name, "one");
        assert_eq!(upserts[0].conversation_id, Some(id.to_string()));
        assert_eq!(upserts[0].message.len(), 1);

        for index in 0..2 {
            let exchange = backend.exchange(index).expect("exchange");
            assert_eq!(exchange.request.body.conversation_id, id.to_string());
        }
    }

    #[tokio::test]
    async fn failed_persistence_is_retried_with_the_same_id() {
        let backend = ScriptedBackend::new();
        backend.set_fail_upserts(true);
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());

        let report = orchestrator.dispatch_send("one", Vec::new()).expect("send");
        let id = report.conversation_id;
        let notice = timeout(Duration::from_secs(1), orchestrator.pump())
            .await
            .expect("persistence result");
        assert!(matches!(
            notice,
            Some(ChatNotice::ConversationPersistFailed { id: failed, .. }) if failed == id
        ));
        assert_eq!(orchestrator.binding(), ConversationBinding::Unpersisted(id));

        backend.set_fail_upserts(false);
        let retry = orchestrator.dispatch_send("two", Vec::new()).expect("retry");
        assert_eq!(retry.conversation_id, id);
        let notice = timeout(Duration::from_secs(1), orchestrator.pump())
            .await
            .expect("persistence result");
        assert_eq!(notice, Some(ChatNotice::ConversationPersisted { id }));

        let upserts = backend.upserts();
        assert_eq!(upserts.len(), 2);
        assert_eq!(upserts[0].conversation_id, upserts[1].conversation_id);
        assert_eq!(upserts[0].message, upserts[1].message);
        assert_eq!(upserts[0].name, "one");
        assert_eq!(upserts[1].name, "one");
    }

    #[tokio::test]
    async fn persisted_history_replaces_the_seeded_prologue() {
        let backend = ScriptedBackend::new();
        backend.set_upsert_history(vec![WireMessage::new(
            "server-prologue",
            WireRole::Assistant,
            "Welcome back!",
        )]);
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        let report = orchestrator.dispatch_send("Hello", Vec::new()).expect("send");
        let id = report.conversation_id;
        assert_eq!(contents(orchestrator.messages(box_id)), vec![PROLOGUE, "Hello", ""]);

        let notice = timeout(Duration::from_secs(1), orchestrator.pump())
            .await
            .expect("persistence result");
        assert_eq!(notice, Some(ChatNotice::ConversationPersisted { id }));
        assert_eq!(
            contents(orchestrator.messages(box_id)),
            vec!["Welcome back!", "Hello", ""]
        );

        let exchange = backend.exchange(0).expect("exchange");
        exchange.answer("Hi");
        exchange.done();
        next_notice(&mut orchestrator).await;
        assert!(next_notice(&mut orchestrator).await.is_terminal());
        assert_eq!(
            contents(orchestrator.messages(box_id)),
            vec!["Welcome back!", "Hello", "Hi"]
        );
    }

    #[tokio::test]
    async fn echoed_history_leaves_the_store_untouched() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        orchestrator.dispatch_send("Hello", Vec::new()).expect("send");
        let before = orchestrator.messages(box_id).to_vec();
        timeout(Duration::from_secs(1), orchestrator.pump())
            .await
            .expect("persistence result");
        assert_eq!(orchestrator.messages(box_id), before.as_slice());
    }

    #[tokio::test]
    async fn multi_box_send_skips_boxes_without_a_model() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::multi(
            backend.clone(),
            config(),
            vec![model("model-a"), model("model-b"), ChatBoxConfig::default()],
        )
        .expect("three boxes");
        let ids = orchestrator.box_ids();

        let report = orchestrator.dispatch_send("Compare", Vec::new()).expect("send");
        assert_eq!(report.started.len(), 2);
        assert_eq!(report.skipped, vec![ids[2]]);
        assert_eq!(backend.exchange_count(), 2);

        let first = backend.exchange(0).expect("first");
        let second = backend.exchange(1).expect("second");
        assert_eq!(first.request.body.llm_id.as_deref(), Some("model-a"));
        assert_eq!(second.request.body.llm_id.as_deref(), Some("model-b"));

        first.answer("from a");
        first.done();
        second.answer("from b");
        for _ in 0..3 {
            next_notice(&mut orchestrator).await;
        }
        assert!(!orchestrator.all_idle());
        assert!(orchestrator.is_box_idle(ids[0]));

        second.done();
        assert!(next_notice(&mut orchestrator).await.is_terminal());
        assert!(orchestrator.all_idle());

        for (box_id, expected) in [(ids[0], "from a"), (ids[1], "from b")] {
            let messages = orchestrator.messages(box_id);
            assert_eq!(contents(messages), vec![PROLOGUE, "Compare", expected]);
            assert!(
                messages
                    .iter()
                    .all(|message| message.chat_box_id == Some(box_id))
            );
        }
        assert!(orchestrator.messages(ids[2]).is_empty());
    }

    #[tokio::test]
    async fn removed_box_ignores_its_stream_and_stops_gating_idle() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::multi(
            backend.clone(),
            config(),
            vec![model("model-a"), model("model-b")],
        )
        .expect("two boxes");
        let ids = orchestrator.box_ids();
        orchestrator.dispatch_send("Compare", Vec::new()).expect("send");

        assert!(orchestrator.remove_box(ids[1]));
        let removed = backend.exchange(1).expect("removed exchange");
        assert_eq!(
            orchestrator.handle_inbound(Inbound::Stream(removed.event(StreamEventPayload::Done))),
            None
        );

        let kept = backend.exchange(0).expect("kept exchange");
        kept.answer("only a");
        kept.done();
        let notices = timeout(Duration::from_secs(1), orchestrator.run_until_idle())
            .await
            .expect("idle");
        assert!(notices.iter().any(ChatNotice::is_terminal));
        assert_eq!(orchestrator.box_ids(), vec![ids[0]]);
    }

    #[tokio::test]
    async fn stream_closed_without_terminal_event_fails_the_exchange() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let report = orchestrator.dispatch_send("Hello", Vec::new()).expect("send");
        let started = report.started[0];

        let notice = orchestrator.handle_inbound(Inbound::StreamClosed(StreamTarget::new(
            started.box_id,
            started.exchange_id,
        )));
        assert!(matches!(
            notice,
            Some(ChatNotice::ExchangeFailed {
                restore_input: Some(ref text),
                ..
            }) if text == "Hello"
        ));
        assert!(orchestrator.all_idle());
    }

    #[tokio::test]
    async fn one_refusing_box_does_not_starve_the_others() {
        let backend = ScriptedBackend::new();
        backend.reject_model("model-b");
        let mut orchestrator = SessionOrchestrator::multi(
            backend.clone(),
            config(),
            vec![model("model-a"), model("model-b"), model("model-c")],
        )
        .expect("three boxes");
        let ids = orchestrator.box_ids();

        let report = orchestrator.dispatch_send("Compare", Vec::new()).expect("send");
        let started: Vec<ChatBoxId> = report.started.iter().map(|started| started.box_id).collect();
        assert_eq!(started, vec![ids[0], ids[2]]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].box_id, ids[1]);
        assert!(matches!(report.failed[0].error, ChatError::Backend { .. }));

        for box_id in &ids {
            let messages = orchestrator.messages(*box_id);
            assert_eq!(contents(&messages[..2]), vec![PROLOGUE, "Compare"]);
        }
        assert_eq!(orchestrator.messages(ids[0]).len(), 3);
        assert_eq!(orchestrator.messages(ids[1]).len(), 2);
        assert_eq!(orchestrator.messages(ids[2]).len(), 3);
        assert!(orchestrator.is_box_idle(ids[1]));
        assert!(!orchestrator.is_box_idle(ids[2]));
    }

    #[tokio::test]
    async fn every_box_refusing_fails_the_send_but_keeps_boxes_in_step() {
        let backend = ScriptedBackend::new();
        backend.set_reject_streams(true);
        let mut orchestrator = SessionOrchestrator::multi(
            backend.clone(),
            config(),
            vec![model("model-a"), model("model-b"), model("model-c")],
        )
        .expect("three boxes");

        let result = orchestrator.dispatch_send("Compare", Vec::new());
        assert!(matches!(result, Err(ChatError::Backend { .. })));
        for box_id in orchestrator.box_ids() {
            assert_eq!(contents(orchestrator.messages(box_id)), vec![PROLOGUE, "Compare"]);
        }
        assert!(orchestrator.all_idle());
    }

    #[tokio::test]
    async fn backend_refusal_rolls_back_the_answer_slot() {
        let backend = ScriptedBackend::new();
        backend.set_reject_streams(true);
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        let result = orchestrator.dispatch_send("Hello", Vec::new());
        assert!(matches!(result, Err(ChatError::Backend { .. })));
        assert_eq!(contents(orchestrator.messages(box_id)), vec![PROLOGUE, "Hello"]);
        assert!(orchestrator.all_idle());
    }

    #[tokio::test]
    async fn empty_input_is_rejected_without_binding() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend, config());

        assert!(matches!(
            orchestrator.dispatch_send("   ", Vec::new()),
            Err(ChatError::EmptyInput { .. })
        ));
        assert_eq!(orchestrator.binding(), ConversationBinding::Unbound);
    }

    #[tokio::test]
    async fn reset_unbinds_and_clears_every_box() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        let first = orchestrator.dispatch_send("Hello", Vec::new()).expect("send");
        let exchange = backend.exchange(0).expect("exchange");
        exchange.answer("Hi");
        next_notice(&mut orchestrator).await;

        orchestrator.reset();
        assert_eq!(orchestrator.binding(), ConversationBinding::Unbound);
        assert!(orchestrator.messages(box_id).is_empty());
        assert!(orchestrator.all_idle());
        assert_eq!(
            orchestrator.handle_inbound(Inbound::Stream(exchange.event(StreamEventPayload::Done))),
            None
        );

        let second = orchestrator.dispatch_send("Again", Vec::new()).expect("send");
        assert_ne!(second.conversation_id, first.conversation_id);
    }

    #[tokio::test]
    async fn loaded_conversation_is_not_persisted_again() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");
        let id = ConversationId::new_v4();
        let question = MessageId::new_v4();

        orchestrator.load_conversation(
            id,
            vec![
                Message::user(question, "earlier"),
                Message::assistant(MessageId::answer_for(question), "reply"),
            ],
        );
        assert_eq!(orchestrator.binding(), ConversationBinding::Persisted(id));

        let report = orchestrator.dispatch_send("next", Vec::new()).expect("send");
        assert_eq!(report.conversation_id, id);
        tokio::task::yield_now().await;
        assert!(backend.upserts().is_empty());

        let exchange = backend.exchange(0).expect("exchange");
        assert_eq!(wire_contents(&exchange.request), vec!["earlier", "reply", "next"]);
        assert_eq!(contents(orchestrator.messages(box_id)).len(), 4);
    }

    #[tokio::test]
    async fn attachments_travel_as_doc_ids_and_uploads_carry_the_conversation() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());

        let doc_ids = orchestrator
            .upload_files(vec![UploadFile::new("notes.pdf", b"%PDF".to_vec())])
            .await
            .expect("upload");
        assert_eq!(doc_ids, vec!["doc-0".to_string()]);

        let report = orchestrator
            .dispatch_send("Summarize", doc_ids.clone())
            .expect("send");
        orchestrator
            .upload_files(vec![UploadFile::new("more.txt", b"text".to_vec())])
            .await
            .expect("second upload");

        let uploads = backend.uploads();
        assert_eq!(uploads[0], (None, vec!["notes.pdf".to_string()]));
        assert_eq!(uploads[1].0, Some(report.conversation_id.to_string()));

        let exchange = backend.exchange(0).expect("exchange");
        let question = exchange.request.body.messages.last().expect("question");
        assert_eq!(question.doc_ids, doc_ids);
    }

    #[tokio::test]
    async fn reference_payload_is_attached_to_the_answer() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(backend.clone(), config());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        orchestrator.dispatch_send("Cite", Vec::new()).expect("send");
        backend.exchange(0).expect("exchange").answer_with_reference(
            "See ##0$$",
            json!({"chunks": [{"chunk_id": "c0", "doc_id": "d0", "docnm_kwd": "a.pdf"}]}),
        );
        next_notice(&mut orchestrator).await;

        let answer = orchestrator.messages(box_id).last().expect("answer");
        let reference = answer.reference.as_ref().expect("reference");
        assert_eq!(reference.chunks.len(), 1);
        assert!(answer.is_streaming());
    }
}
