use crate::error::WidgetResult;

/// Audible affordances the widget may play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chime {
    Open,
    Response,
}

pub trait Notifier: Send + Sync {
    fn play(&self, chime: Chime) -> WidgetResult<()>;
}

/// Notifier for hosts without audio.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn play(&self, _chime: Chime) -> WidgetResult<()> {
        Ok(())
    }
}

/// Plays `chime`, swallowing any failure.
pub(crate) fn play_best_effort(notifier: &dyn Notifier, chime: Chime) {
    if let Err(error) = notifier.play(chime) {
        tracing::debug!(chime = ?chime, error = %error, "notification skipped");
    }
}
