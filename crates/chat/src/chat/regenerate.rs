use snafu::{OptionExt, ensure};

use super::error::{ChatResult, NoQuestionToRegenerateSnafu, UnknownChatBoxSnafu};
use super::message::{ChatBoxId, Message, MessageId, Role};
use super::orchestrator::{SessionOrchestrator, StartedExchange};

impl SessionOrchestrator {
    /// Re-asks the question at (or answered by) `message_id` in one box.
    ///
    /// Everything after the question is truncated and a fresh exchange streams into
    /// the question's answer slot. The question itself is left untouched.
    pub fn regenerate(
        &mut self,
        box_id: ChatBoxId,
        message_id: MessageId,
    ) -> ChatResult<StartedExchange> {
        ensure!(
            self.box_config(box_id).is_some(),
            UnknownChatBoxSnafu {
                stage: "regenerate",
                box_id,
            }
        );
        let question_id = question_for(self.messages(box_id), message_id).context(
            NoQuestionToRegenerateSnafu {
                stage: "regenerate",
                id: message_id,
            },
        )?;

        self.cancel(box_id);

        let entry = self.boxes_mut().get_mut(box_id).context(UnknownChatBoxSnafu {
            stage: "regenerate",
            box_id,
        })?;
        let removed = entry.store.remove_messages_after_current_message(question_id)?;
        let history = entry.store.messages().to_vec();
        tracing::debug!(
            box_id = ?box_id,
            question_id = %question_id,
            removed,
            "regenerating answer"
        );

        self.start_exchange(box_id, question_id, Some(history))
    }
}

/// Nearest user message at or before `message_id`.
fn question_for(messages: &[Message], message_id: MessageId) -> Option<MessageId> {
    let index = messages.iter().position(|message| message.id == message_id)?;
    messages[..=index]
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|question| question.id)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use crate::chat::error::ChatError;
    use crate::chat::events::ChatNotice;
    use crate::chat::message::MessageStatus;
    use crate::chat::orchestrator::OrchestratorConfig;
    use crate::testing::ScriptedBackend;

    use super::*;

    async fn finish(orchestrator: &mut SessionOrchestrator) -> Vec<ChatNotice> {
        timeout(Duration::from_secs(1), orchestrator.run_until_idle())
            .await
            .expect("idle before timeout")
    }

    #[tokio::test]
    async fn regenerating_an_answer_truncates_after_its_question() {
        let backend = ScriptedBackend::new();
        let mut orchestrator =
            SessionOrchestrator::single(backend.clone(), OrchestratorConfig::default());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        let first = orchestrator.dispatch_send("Q1", Vec::new()).expect("first");
        let exchange = backend.exchange(0).expect("first exchange");
        exchange.answer("A1");
        exchange.done();
        finish(&mut orchestrator).await;

        orchestrator.dispatch_send("Q2", Vec::new()).expect("second");
        let exchange = backend.exchange(1).expect("second exchange");
        exchange.answer("A2");
        exchange.done();
        finish(&mut orchestrator).await;

        let answer_id = first.started[0].answer_id;
        let started = orchestrator.regenerate(box_id, answer_id).expect("regenerate");
        assert_eq!(started.question_id, first.started[0].question_id);
        assert_eq!(started.answer_id, answer_id);

        let regenerated = backend.exchange(2).expect("regenerated exchange");
        let sent: Vec<&str> = regenerated
            .request
            .body
            .messages
            .iter()
            .map(|message| message.content.as_str())
            .collect();
        assert_eq!(sent, vec!["Q1"]);

        regenerated.answer("A1 again");
        regenerated.done();
        finish(&mut orchestrator).await;

        let messages = orchestrator.messages(box_id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "Q1");
        assert_eq!(messages[0].id, first.started[0].question_id);
        assert_eq!(messages[1].id, answer_id);
        assert_eq!(messages[1].content, "A1 again");
        assert_eq!(messages[1].status, MessageStatus::Done);
    }

    #[tokio::test]
    async fn regenerating_a_live_exchange_cancels_it_first() {
        let backend = ScriptedBackend::new();
        let mut orchestrator =
            SessionOrchestrator::single(backend.clone(), OrchestratorConfig::default());
        let box_id = orchestrator.primary_box_id().expect("primary box");

        let report = orchestrator.dispatch_send("Q1", Vec::new()).expect("send");
        let question_id = report.started[0].question_id;
        let stale = backend.exchange(0).expect("first exchange");

        orchestrator.regenerate(box_id, question_id).expect("regenerate");
        stale.answer("stale");
        let fresh = backend.exchange(1).expect("second exchange");
        fresh.answer("fresh");
        fresh.done();
        finish(&mut orchestrator).await;

        let last = orchestrator.messages(box_id).last().expect("answer");
        assert_eq!(last.content, "fresh");
    }

    #[tokio::test]
    async fn regenerate_without_a_question_is_rejected() {
        let backend = ScriptedBackend::new();
        let mut orchestrator = SessionOrchestrator::single(
            backend,
            OrchestratorConfig {
                prologue: Some("Welcome".to_string()),
                ..OrchestratorConfig::default()
            },
        );
        let box_id = orchestrator.primary_box_id().expect("primary box");

        orchestrator.dispatch_send("Q1", Vec::new()).expect("send");
        let prologue_id = orchestrator.messages(box_id)[0].id;

        assert!(matches!(
            orchestrator.regenerate(box_id, prologue_id),
            Err(ChatError::NoQuestionToRegenerate { .. })
        ));
        assert!(matches!(
            orchestrator.regenerate(box_id, MessageId::new_v4()),
            Err(ChatError::NoQuestionToRegenerate { .. })
        ));
    }
}
