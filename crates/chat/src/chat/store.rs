use std::collections::HashSet;

use snafu::{OptionExt, ensure};

use super::error::{ChatResult, DuplicateMessageIdSnafu, MessageNotFoundSnafu};
use super::message::{Message, MessageId, MessageStatus, Role, StreamAnswer};

/// Ordered message log of one session (or one chat box in multi-box mode).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns messages in display order, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the newest message.
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Finds a message by id.
    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Returns the index of `id` in display order.
    pub fn position(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|message| message.id == id)
    }

    pub fn add_newest_question(&mut self, message: Message) -> ChatResult<()> {
        ensure!(
            self.get(message.id).is_none(),
            DuplicateMessageIdSnafu {
                stage: "add-newest-question",
                id: message.id,
            }
        );
        self.messages.push(message);
        Ok(())
    }

    /// Publishes the latest accumulated answer.
    ///
    /// The answer's slot is replaced wholesale, so repeated calls with growing
    /// content never duplicate text.
    pub fn add_newest_answer(&mut self, answer: &StreamAnswer) {
        let slot = match self.messages.last() {
            Some(last) if last.id == answer.id && last.role == Role::Assistant => {
                Some(self.messages.len() - 1)
            }
            _ => self
                .messages
                .iter()
                .position(|message| message.id == answer.id && message.role == Role::Assistant),
        };

        match slot {
            Some(index) => {
                let message = &mut self.messages[index];
                message.content.clone_from(&answer.answer);
                message.reference.clone_from(&answer.reference);
                message.status = answer.status();
            }
            None => self.messages.push(answer.to_message()),
        }
    }

    /// Drops the last message, used to roll back an optimistic send.
    pub fn remove_latest_message(&mut self) -> Option<Message> {
        self.messages.pop()
    }

    pub fn remove_message_by_id(&mut self, id: MessageId) -> Option<Message> {
        let index = self.position(id)?;
        Some(self.messages.remove(index))
    }

    /// Truncates everything after (not including) `id`; returns how many were removed.
    pub fn remove_messages_after_current_message(&mut self, id: MessageId) -> ChatResult<usize> {
        let index = self.position(id).context(MessageNotFoundSnafu {
            stage: "remove-messages-after-current",
            id,
        })?;
        let removed = self.messages.len() - (index + 1);
        self.messages.truncate(index + 1);
        Ok(removed)
    }

    /// Bulk replace, used when loading a persisted conversation or clearing.
    ///
    /// Later entries repeating an earlier `(id, role)` pair are dropped.
    pub fn set_derived_messages(&mut self, messages: Vec<Message>) {
        let mut seen = HashSet::with_capacity(messages.len());
        let total = messages.len();
        self.messages = messages
            .into_iter()
            .filter(|message| seen.insert((message.id, message.role)))
            .collect();

        let dropped = total - self.messages.len();
        if dropped > 0 {
            tracing::warn!(dropped, "dropped duplicate messages while loading history");
        }
    }

    /// Drops every message.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn set_status(&mut self, id: MessageId, status: MessageStatus) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|message| message.id == id && message.role == Role::Assistant)
        {
            Some(message) => {
                message.status = status;
                true
            }
            None => false,
        }
    }
}
