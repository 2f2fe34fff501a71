use std::sync::Arc;

use kbchat::chat::{ChatNotice, DispatchReport, Message, OrchestratorConfig, SessionOrchestrator};
use kbchat::settings::ClientSettings;
use kbchat_llm::ChatBackend;
use snafu::{ResultExt, ensure};

use crate::bridge::{WidgetBridge, WidgetState};
use crate::error::{BackendSnafu, NoConversationSnafu, SessionSnafu, WidgetResult};
use crate::mode::WidgetParams;
use crate::notify::Notifier;
use crate::protocol::FramePort;

/// One widget frame together with the conversation it shows.
pub struct EmbeddedChat {
    orchestrator: SessionOrchestrator,
    bridge: WidgetBridge,
    params: WidgetParams,
}

impl EmbeddedChat {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        config: OrchestratorConfig,
        bridge: WidgetBridge,
        params: WidgetParams,
    ) -> Self {
        Self {
            orchestrator: SessionOrchestrator::single(backend, config),
            bridge,
            params,
        }
    }

    /// Builds the frame from its page URL, routing completions through the shared embed if any.
    pub fn connect(
        settings: &ClientSettings,
        page_url: &str,
        port: Arc<dyn FramePort>,
        notifier: Arc<dyn Notifier>,
    ) -> WidgetResult<Self> {
        let (bridge, params) = WidgetBridge::from_page_url(page_url, port, notifier)?;

        let mut backend_config = settings.backend_config();
        if let Some(path) = params.completion_path() {
            backend_config = backend_config.with_completion_path(path);
        }
        let backend = kbchat_llm::create_backend(backend_config).context(BackendSnafu {
            stage: "connect-embedded-chat",
        })?;

        tracing::debug!(
            mode = params.mode.as_str(),
            shared = params.shared_id.is_some(),
            "embedded chat connected"
        );
        Ok(Self::new(backend, settings.orchestrator_config(), bridge, params))
    }

    /// Returns the frame state machine.
    pub fn bridge(&self) -> &WidgetBridge {
        &self.bridge
    }

    pub fn bridge_mut(&mut self) -> &mut WidgetBridge {
        &mut self.bridge
    }

    /// Returns the conversation behind this frame.
    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.orchestrator
    }

    pub fn orchestrator_mut(&mut self) -> &mut SessionOrchestrator {
        &mut self.orchestrator
    }

    /// Returns the parameters parsed from the page URL.
    pub fn params(&self) -> &WidgetParams {
        &self.params
    }

    /// Sends one question from this frame's input.
    ///
    /// Frames that only carry the toggle have no input and refuse to send.
    pub fn send(&mut self, text: &str, files: Vec<String>) -> WidgetResult<DispatchReport> {
        let mode = self.bridge.mode();
        ensure!(
            !mode.delegates_visibility(),
            NoConversationSnafu {
                stage: "embedded-send",
                mode: mode.as_str(),
            }
        );

        self.orchestrator
            .dispatch_send(text, files)
            .context(SessionSnafu { stage: "embedded-send" })
    }

    /// Applies the next session event and feeds completions to the unread badge.
    pub async fn pump(&mut self) -> Option<ChatNotice> {
        let notice = self.orchestrator.pump().await?;
        if let ChatNotice::AnswerCompleted { message_id, .. } = notice {
            self.bridge.on_answer_completed(message_id);
        }
        Some(notice)
    }

    /// Messages the conversation panel should draw right now.
    ///
    /// Nothing when the frame renders no panel; in-flight partials are hidden
    /// when streaming is off.
    pub fn visible_messages(&self) -> Vec<&Message> {
        if !self.bridge.render_plan().conversation_panel {
            return Vec::new();
        }

        let Some(box_id) = self.orchestrator.primary_box_id() else {
            return Vec::new();
        };
        self.orchestrator
            .messages(box_id)
            .iter()
            .filter(|message| self.params.streaming || !message.is_streaming())
            .collect()
    }

    /// Page unload: stops every exchange and returns the final widget state.
    pub fn teardown(mut self) -> WidgetState {
        self.orchestrator.reset();
        self.bridge.teardown()
    }
}
