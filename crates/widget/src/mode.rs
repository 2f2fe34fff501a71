use snafu::ResultExt;
use url::Url;

use crate::error::{InvalidPageUrlSnafu, WidgetResult};

/// Embedding topology, fixed for the lifetime of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WidgetMode {
    /// Toggle and conversation inline in one document.
    #[default]
    Full,
    /// Only a floating toggle; the embedding page owns the conversation frame.
    Button,
    /// Only the conversation panel, always open.
    Window,
    /// Only a toggle that asks the page for a companion `window` frame.
    Master,
}

impl WidgetMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "full" => Some(Self::Full),
            "button" => Some(Self::Button),
            "window" => Some(Self::Window),
            "master" => Some(Self::Master),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Button => "button",
            Self::Window => "window",
            Self::Master => "master",
        }
    }

    /// True when open/close is delegated to the embedding page.
    pub fn delegates_visibility(&self) -> bool {
        matches!(self, Self::Button | Self::Master)
    }
}

/// Where a shared embed was published from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SharedSource {
    #[default]
    Chat,
    Agent,
}

/// Query parameters the widget reads once at load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WidgetParams {
    pub mode: WidgetMode,
    /// When false only completed turns are shown.
    pub streaming: bool,
    pub shared_id: Option<String>,
    pub from: SharedSource,
    pub locale: Option<String>,
}

impl Default for WidgetParams {
    fn default() -> Self {
        Self {
            mode: WidgetMode::Full,
            streaming: true,
            shared_id: None,
            from: SharedSource::Chat,
            locale: None,
        }
    }
}

impl WidgetParams {
    pub fn from_page_url(raw: &str) -> WidgetResult<(Url, Self)> {
        let url = Url::parse(raw).context(InvalidPageUrlSnafu {
            stage: "parse-page-url",
            raw: raw.to_string(),
        })?;
        let params = Self::from_url(&url);
        Ok((url, params))
    }

    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();

        for (key, value) in url.query_pairs() {
            let value = value.trim();
            match &*key {
                "mode" => match WidgetMode::parse(value) {
                    Some(mode) => params.mode = mode,
                    None => {
                        tracing::debug!(mode = value, "unknown widget mode, using full");
                    }
                },
                "streaming" => params.streaming = parse_flag(value, true),
                "shared_id" if !value.is_empty() => params.shared_id = Some(value.to_string()),
                "from" => {
                    params.from = if value.eq_ignore_ascii_case("agent") {
                        SharedSource::Agent
                    } else {
                        SharedSource::Chat
                    };
                }
                "locale" if !value.is_empty() => params.locale = Some(value.to_string()),
                _ => {}
            }
        }

        params
    }

    /// Completions route for a shared embed, if this frame is one.
    pub fn completion_path(&self) -> Option<String> {
        let shared_id = self.shared_id.as_deref()?;
        Some(match self.from {
            SharedSource::Chat => format!("/api/v1/chatbots/{shared_id}/completions"),
            SharedSource::Agent => format!("/api/v1/agentbots/{shared_id}/completions"),
        })
    }
}

/// Same page URL with `mode=window`, every other parameter preserved.
pub fn window_src(page_url: &Url) -> String {
    let mut url = page_url.clone();
    let retained: Vec<(String, String)> = page_url
        .query_pairs()
        .filter(|(key, _)| *key != "mode")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("mode", WidgetMode::Window.as_str());
    url.to_string()
}

fn parse_flag(value: &str, fallback: bool) -> bool {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => true,
        "false" | "0" | "no" => false,
        _ => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_toggle_frames_delegate_visibility() {
        assert!(WidgetMode::Button.delegates_visibility());
        assert!(WidgetMode::Master.delegates_visibility());
        assert!(!WidgetMode::Full.delegates_visibility());
        assert!(!WidgetMode::Window.delegates_visibility());
    }

    #[test]
    fn reads_every_parameter_once() {
        let (_, params) = WidgetParams::from_page_url(
            "https://kb.example.com/chat/share?shared_id=abc&from=agent&mode=master&streaming=false&locale=de",
        )
        .expect("params");

        assert_eq!(params.mode, WidgetMode::Master);
        assert!(!params.streaming);
        assert_eq!(params.shared_id.as_deref(), Some("abc"));
        assert_eq!(params.from, SharedSource::Agent);
        assert_eq!(params.locale.as_deref(), Some("de"));
        assert_eq!(
            params.completion_path().as_deref(),
            Some("/api/v1/agentbots/abc/completions")
        );
    }

    #[test]
    fn missing_or_unknown_values_fall_back() {
        let (_, params) =
            WidgetParams::from_page_url("https://kb.example.com/?mode=popup&streaming=maybe")
                .expect("params");
        assert_eq!(params, WidgetParams::default());
        assert_eq!(params.completion_path(), None);

        assert!(WidgetParams::from_page_url("not a url").is_err());
    }

    #[test]
    fn window_src_swaps_only_the_mode() {
        let url = Url::parse("https://kb.example.com/share?shared_id=abc&mode=master&locale=en")
            .expect("url");
        let src = Url::parse(&window_src(&url)).expect("src");

        let pairs: Vec<(String, String)> = src
            .query_pairs()
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("shared_id".to_string(), "abc".to_string()),
                ("locale".to_string(), "en".to_string()),
                ("mode".to_string(), "window".to_string()),
            ]
        );
        assert_eq!(src.path(), "/share");
    }
}
