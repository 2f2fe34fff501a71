use std::sync::Arc;
use std::time::Duration;

use kbchat::chat::MessageId;
use serde_json::Value;
use url::Url;

use crate::error::WidgetResult;
use crate::mode::{WidgetMode, WidgetParams, window_src};
use crate::notify::{Chime, Notifier, play_best_effort};
use crate::protocol::{FrameMessage, FramePort};
use crate::scroll::ScrollEdgeTracker;

/// Delay between first paint and `WIDGET_READY`.
pub const READY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetState {
    pub mode: WidgetMode,
    /// Local panel visibility. Only `full` mode changes it.
    pub open: bool,
    pub minimized: bool,
    pub ready: bool,
    /// Visibility of the page-owned frame in `button`/`master` mode, as last requested or reported.
    pub external_open: bool,
    pub unread: usize,
    pub last_seen_message: Option<MessageId>,
}

/// What the frame should draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPlan {
    pub toggle_button: bool,
    pub conversation_panel: bool,
    pub unread_badge: Option<usize>,
}

/// Mode state machine and cross-frame signalling for one widget frame.
pub struct WidgetBridge {
    state: WidgetState,
    page_url: Url,
    child_window_requested: bool,
    scroll: ScrollEdgeTracker,
    port: Arc<dyn FramePort>,
    notifier: Arc<dyn Notifier>,
}

impl WidgetBridge {
    pub fn new(
        page_url: Url,
        mode: WidgetMode,
        port: Arc<dyn FramePort>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            state: WidgetState {
                mode,
                open: mode == WidgetMode::Window,
                minimized: false,
                ready: false,
                external_open: false,
                unread: 0,
                last_seen_message: None,
            },
            page_url,
            child_window_requested: false,
            scroll: ScrollEdgeTracker::new(),
            port,
            notifier,
        }
    }

    /// Resolves the mode from the page URL; it never changes afterwards.
    pub fn from_page_url(
        raw: &str,
        port: Arc<dyn FramePort>,
        notifier: Arc<dyn Notifier>,
    ) -> WidgetResult<(Self, WidgetParams)> {
        let (page_url, params) = WidgetParams::from_page_url(raw)?;
        Ok((Self::new(page_url, params.mode, port, notifier), params))
    }

    pub fn mode(&self) -> WidgetMode {
        self.state.mode
    }

    pub fn state(&self) -> &WidgetState {
        &self.state
    }

    /// Whether the conversation is on screen, in this frame or in the page-owned one.
    pub fn is_panel_visible(&self) -> bool {
        let mode = self.state.mode;
        if mode.delegates_visibility() {
            return self.state.external_open;
        }
        match mode {
            WidgetMode::Full => self.state.open && !self.state.minimized,
            _ => true,
        }
    }

    /// What this frame draws: frames that delegate visibility only carry the toggle.
    pub fn render_plan(&self) -> RenderPlan {
        let mode = self.state.mode;
        let toggle_button = mode != WidgetMode::Window;
        let conversation_panel = !mode.delegates_visibility() && self.is_panel_visible();

        RenderPlan {
            toggle_button,
            conversation_panel,
            unread_badge: (toggle_button && self.state.unread > 0).then_some(self.state.unread),
        }
    }

    /// Emits `WIDGET_READY` after the first-paint delay, once per frame.
    pub async fn announce_ready(&mut self) {
        if self.state.ready {
            return;
        }
        tokio::time::sleep(READY_DELAY).await;
        self.mark_ready();
    }

    pub fn mark_ready(&mut self) {
        if self.state.ready {
            return;
        }
        self.state.ready = true;
        self.post(FrameMessage::WidgetReady);
    }

    /// Toggle-button activation.
    pub fn toggle(&mut self) {
        let mode = self.state.mode;
        if mode.delegates_visibility() {
            self.toggle_page_frame();
            return;
        }

        match mode {
            WidgetMode::Full => {
                let open = !self.state.open;
                self.set_open(open);
            }
            _ => tracing::debug!(mode = mode.as_str(), "no toggle in this mode"),
        }
    }

    fn toggle_page_frame(&mut self) {
        let is_open = !self.state.external_open;
        self.state.external_open = is_open;

        if is_open && self.state.mode == WidgetMode::Master && !self.child_window_requested {
            self.child_window_requested = true;
            self.post(FrameMessage::CreateChatWindow {
                src: window_src(&self.page_url),
            });
        }
        self.post(FrameMessage::ToggleChat { is_open });

        if is_open {
            self.on_opened();
        }
    }

    /// Opens or closes the inline panel. Only meaningful in `full` mode.
    pub fn set_open(&mut self, open: bool) {
        if self.state.mode != WidgetMode::Full {
            tracing::debug!(mode = self.state.mode.as_str(), "panel visibility is not local");
            return;
        }

        let was_visible = self.is_panel_visible();
        self.state.open = open;
        if open {
            self.state.minimized = false;
            if !was_visible {
                self.on_opened();
            }
        }
    }

    /// Hides the inline panel without closing the conversation.
    pub fn minimize(&mut self) {
        if self.state.mode == WidgetMode::Full && self.state.open {
            self.state.minimized = true;
        }
    }

    pub fn restore(&mut self) {
        if self.state.minimized {
            self.state.minimized = false;
            self.on_opened();
        }
    }

    /// Single entry point for messages from the embedding page.
    pub fn on_frame_message(&mut self, message: FrameMessage) {
        match (message, self.state.mode) {
            (FrameMessage::ToggleChat { is_open }, mode) if mode.delegates_visibility() => {
                self.state.external_open = is_open;
                if is_open {
                    self.state.unread = 0;
                }
            }
            (FrameMessage::ToggleChat { is_open }, WidgetMode::Full) => self.set_open(is_open),
            (message, mode) => {
                tracing::debug!(
                    message = ?message,
                    mode = mode.as_str(),
                    "ignoring frame message"
                );
            }
        }
    }

    pub fn on_raw_message(&mut self, value: Value) {
        if let Some(message) = FrameMessage::decode(value) {
            self.on_frame_message(message);
        }
    }

    /// Counts a completed answer toward the badge when nobody is looking.
    pub fn on_answer_completed(&mut self, message_id: MessageId) {
        if self.state.last_seen_message == Some(message_id) {
            return;
        }
        self.state.last_seen_message = Some(message_id);

        if !self.is_panel_visible() {
            self.state.unread += 1;
        }
        play_best_effort(self.notifier.as_ref(), Chime::Response);
    }

    /// Wheel gesture over the message list with its current geometry.
    pub fn on_scroll(&mut self, offset: f32, max_offset: f32, delta_y: f32) {
        if !self.render_plan().conversation_panel {
            return;
        }
        self.scroll.update(offset, max_offset);
        if let Some(message) = self.scroll.passthrough(delta_y) {
            self.post(message);
        }
    }

    pub fn scroll(&self) -> &ScrollEdgeTracker {
        &self.scroll
    }

    /// Page unload; returns the final state.
    pub fn teardown(self) -> WidgetState {
        tracing::debug!(mode = self.state.mode.as_str(), "widget torn down");
        self.state
    }

    fn on_opened(&mut self) {
        self.state.unread = 0;
        self.scroll.reset();
        play_best_effort(self.notifier.as_ref(), Chime::Open);
    }

    fn post(&self, message: FrameMessage) {
        if let Err(error) = self.port.post(&message) {
            tracing::debug!(message = ?message, error = %error, "frame message undeliverable");
        }
    }
}
