#![deny(unsafe_code)]

//! Embeddable chat widget: display modes, the cross-frame protocol and the
//! session glue between a frame and its conversation.

pub mod bridge;
pub mod error;
pub mod mode;
pub mod notify;
pub mod protocol;
pub mod scroll;
pub mod session;

pub use bridge::{READY_DELAY, RenderPlan, WidgetBridge, WidgetState};
pub use error::{WidgetError, WidgetResult};
pub use mode::{SharedSource, WidgetMode, WidgetParams, window_src};
pub use notify::{Chime, Notifier, NullNotifier};
pub use protocol::{ChannelPort, DetachedPort, FrameMessage, FramePort};
pub use scroll::ScrollEdgeTracker;
pub use session::EmbeddedChat;
