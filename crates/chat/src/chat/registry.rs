use kbchat_llm::ModelParams;
use snafu::ensure;
use tokio::task::JoinHandle;

use super::error::{ChatResult, TooManyChatBoxesSnafu};
use super::message::{ChatBoxId, MessageId, StreamState, StreamTarget};
use super::store::MessageStore;

/// Upper bound of side-by-side chat boxes.
pub const MAX_CHAT_BOXES: usize = 3;

/// Model selection owned by one chat box.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatBoxConfig {
    pub llm_id: Option<String>,
    pub params: ModelParams,
}

impl ChatBoxConfig {
    /// Creates a config that selects `llm_id`.
    pub fn with_model(llm_id: impl Into<String>, params: ModelParams) -> Self {
        Self {
            llm_id: Some(llm_id.into()),
            params,
        }
    }

    /// Returns true when a non-blank model id is selected.
    pub fn has_model(&self) -> bool {
        self.llm_id
            .as_deref()
            .is_some_and(|llm_id| !llm_id.trim().is_empty())
    }
}

/// Bookkeeping for the exchange currently streaming into a box.
#[derive(Debug)]
pub(crate) struct ActiveExchange {
    pub target: StreamTarget,
    pub question_id: MessageId,
    pub answer_id: MessageId,
    /// Typed text restored to the input on rollback.
    pub input_text: String,
    /// True once any non-empty answer text reached the store.
    pub published: bool,
    pub worker_task: JoinHandle<()>,
    pub reader_task: JoinHandle<()>,
}

impl ActiveExchange {
    /// Stops both tasks; dropping the stream handle signals the worker as well.
    pub fn abort(self) {
        self.reader_task.abort();
        self.worker_task.abort();
    }
}

#[derive(Debug)]
pub struct ChatBoxEntry {
    pub id: ChatBoxId,
    pub config: ChatBoxConfig,
    pub store: MessageStore,
    pub stream_state: StreamState,
    pub(crate) active: Option<ActiveExchange>,
}

impl ChatBoxEntry {
    fn new(id: ChatBoxId, config: ChatBoxConfig) -> Self {
        Self {
            id,
            config,
            store: MessageStore::new(),
            stream_state: StreamState::Idle,
            active: None,
        }
    }

    /// Returns true when no exchange is streaming into this box.
    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    /// Returns true when an event for `target` belongs to the live exchange.
    pub(crate) fn is_current(&self, target: StreamTarget) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| active.target == target)
            && self.stream_state.accepts_stream_event(target)
    }
}

/// Per-box state keyed by the current box id set.
#[derive(Debug, Default)]
pub struct ChatBoxRegistry {
    entries: Vec<ChatBoxEntry>,
    next_box_id: u64,
}

impl ChatBoxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding one box, the single-box layout.
    pub fn with_primary(config: ChatBoxConfig) -> Self {
        Self {
            entries: vec![ChatBoxEntry::new(ChatBoxId::new(0), config)],
            next_box_id: 1,
        }
    }

    pub fn add(&mut self, config: ChatBoxConfig) -> ChatResult<ChatBoxId> {
        ensure!(
            self.entries.len() < MAX_CHAT_BOXES,
            TooManyChatBoxesSnafu {
                stage: "registry-add",
                limit: MAX_CHAT_BOXES,
            }
        );

        let id = ChatBoxId::new(self.next_box_id);
        self.next_box_id = self.next_box_id.saturating_add(1);
        self.entries.push(ChatBoxEntry::new(id, config));
        Ok(id)
    }

    pub fn remove(&mut self, id: ChatBoxId) -> Option<ChatBoxEntry> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Prunes entries whose id is not in `ids`, returning the removed entries.
    ///
    /// Ids in `ids` that are not registered yet are added with a default config,
    /// as long as the box cap allows it.
    pub fn sync_to(&mut self, ids: &[ChatBoxId]) -> ChatResult<Vec<ChatBoxEntry>> {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.entries.len() {
            if ids.contains(&self.entries[index].id) {
                index += 1;
            } else {
                removed.push(self.entries.remove(index));
            }
        }

        for id in ids {
            if self.get(*id).is_some() {
                continue;
            }
            ensure!(
                self.entries.len() < MAX_CHAT_BOXES,
                TooManyChatBoxesSnafu {
                    stage: "registry-sync",
                    limit: MAX_CHAT_BOXES,
                }
            );
            self.entries.push(ChatBoxEntry::new(*id, ChatBoxConfig::default()));
            self.next_box_id = self.next_box_id.max(id.0.saturating_add(1));
        }

        Ok(removed)
    }

    /// Looks up a box by id.
    pub fn get(&self, id: ChatBoxId) -> Option<&ChatBoxEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn get_mut(&mut self, id: ChatBoxId) -> Option<&mut ChatBoxEntry> {
        self.entries.iter_mut().find(|entry| entry.id == id)
    }

    /// Returns box ids in creation order.
    pub fn ids(&self) -> Vec<ChatBoxId> {
        self.entries.iter().map(|entry| entry.id).collect()
    }

    /// Iterates boxes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &ChatBoxEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ChatBoxEntry> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Logical AND of every box's done flag.
    pub fn all_idle(&self) -> bool {
        self.entries.iter().all(ChatBoxEntry::is_idle)
    }
}
