use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use kbchat_llm::{
    BackendConfig, DEFAULT_COMPLETION_PATH, DEFAULT_CONVERSATION_PATH, DEFAULT_UPLOAD_PATH,
    ModelParams,
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::{ChatBoxConfig, OrchestratorConfig};

pub const DEFAULT_BASE_URL: &str = "http://localhost:9380";
pub const SETTINGS_DIRECTORY_NAME: &str = "kbchat";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "KBCHAT_";

/// Model selection used when a chat box has no explicit choice.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub llm_id: String,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ModelSettings {
    fn normalized(mut self) -> Option<Self> {
        self.llm_id = self.llm_id.trim().to_string();
        if self.llm_id.is_empty() {
            return None;
        }

        Some(self)
    }

    pub fn params(&self) -> ModelParams {
        ModelParams {
            temperature: self.temperature,
            top_p: self.top_p,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            max_tokens: self.max_tokens,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub base_url: String,
    pub api_key: String,
    pub dialog_id: String,
    pub prologue: Option<String>,
    pub reasoning: bool,
    pub internet: bool,
    pub default_model: Option<ModelSettings>,
    pub completion_path: String,
    pub conversation_path: String,
    pub upload_path: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            dialog_id: String::new(),
            prologue: None,
            reasoning: false,
            internet: false,
            default_model: None,
            completion_path: DEFAULT_COMPLETION_PATH.to_string(),
            conversation_path: DEFAULT_CONVERSATION_PATH.to_string(),
            upload_path: DEFAULT_UPLOAD_PATH.to_string(),
        }
    }
}

impl ClientSettings {
    /// Usable once a dialog is selected.
    pub fn is_valid(&self) -> bool {
        !self.dialog_id.trim().is_empty()
    }

    pub fn normalized(mut self) -> Self {
        self.base_url = non_blank_or(&self.base_url, DEFAULT_BASE_URL);
        self.api_key = self.api_key.trim().to_string();
        self.dialog_id = self.dialog_id.trim().to_string();
        self.prologue = self
            .prologue
            .map(|prologue| prologue.trim().to_string())
            .filter(|prologue| !prologue.is_empty());
        self.default_model = self.default_model.and_then(ModelSettings::normalized);
        self.completion_path = non_blank_or(&self.completion_path, DEFAULT_COMPLETION_PATH);
        self.conversation_path = non_blank_or(&self.conversation_path, DEFAULT_CONVERSATION_PATH);
        self.upload_path = non_blank_or(&self.upload_path, DEFAULT_UPLOAD_PATH);
        self
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.base_url, &self.api_key)
            .with_completion_path(&self.completion_path)
            .with_conversation_path(&self.conversation_path)
            .with_upload_path(&self.upload_path)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            dialog_id: self.dialog_id.clone(),
            prologue: self.prologue.clone(),
            reasoning: self.reasoning,
            internet: self.internet,
        }
    }

    pub fn default_box_config(&self) -> ChatBoxConfig {
        match &self.default_model {
            Some(model) => ChatBoxConfig::with_model(&model.llm_id, model.params()),
            None => ChatBoxConfig::default(),
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ClientSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".kbchat"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads settings from `config_path`, falling back to defaults on a parse error.
    pub fn new(config_path: PathBuf) -> Self {
        let settings = match Self::extract(&config_path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    path = ?config_path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                ClientSettings::default()
            }
        };

        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ClientSettings> {
        self.settings.load_full()
    }

    /// Re-reads every source. On failure the previous settings stay in place.
    pub fn reload(&self) -> SettingsResult<Arc<ClientSettings>> {
        let settings = Arc::new(Self::extract(&self.config_path)?);
        self.settings.store(Arc::clone(&settings));
        tracing::info!(path = ?self.config_path, "reloaded settings");
        Ok(settings)
    }

    fn extract(path: &Path) -> SettingsResult<ClientSettings> {
        let mut figment = Figment::from(Serialized::defaults(ClientSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract::<ClientSettings>()
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })?;

        Ok(settings.normalized())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to load settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

fn non_blank_or(value: &str, fallback: &str) -> String {
    let value = value.trim();
    if value.is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        Jail::expect_with(|jail| {
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();
            assert_eq!(settings.base_url, DEFAULT_BASE_URL);
            assert_eq!(settings.completion_path, DEFAULT_COMPLETION_PATH);
            assert!(!settings.is_valid());
            Ok(())
        });
    }

    #[test]
    fn file_and_environment_are_layered_and_normalized() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "settings.json",
                r#"{
                    "base_url": " https://kb.example.com/ ",
                    "dialog_id": "dialog-7",
                    "prologue": "   ",
                    "default_model": {"llm_id": "qwen-max", "temperature": 0.2},
                    "upload_path": ""
                }"#,
            )?;
            jail.set_env("KBCHAT_API_KEY", "secret");
            jail.set_env("KBCHAT_INTERNET", "true");

            let store = SettingsStore::new(jail.directory().join("settings.json"));
            let settings = store.settings();
            assert_eq!(settings.base_url, "https://kb.example.com/");
            assert_eq!(settings.api_key, "secret");
            assert!(settings.internet);
            assert_eq!(settings.prologue, None);
            assert_eq!(settings.upload_path, DEFAULT_UPLOAD_PATH);

            let box_config = settings.default_box_config();
            assert_eq!(box_config.llm_id.as_deref(), Some("qwen-max"));
            assert_eq!(box_config.params.temperature, Some(0.2));
            assert_eq!(settings.orchestrator_config().dialog_id, "dialog-7");
            Ok(())
        });
    }

    #[test]
    fn blank_default_model_is_dropped() {
        let settings = ClientSettings {
            default_model: Some(ModelSettings {
                llm_id: "  ".to_string(),
                ..ModelSettings::default()
            }),
            ..ClientSettings::default()
        }
        .normalized();

        assert_eq!(settings.default_model, None);
        assert!(!settings.default_box_config().has_model());
    }

    #[test]
    fn failed_reload_keeps_previous_settings() {
        Jail::expect_with(|jail| {
            jail.create_file("settings.json", r#"{"dialog_id": "first"}"#)?;
            let store = SettingsStore::new(jail.directory().join("settings.json"));
            assert_eq!(store.settings().dialog_id, "first");

            jail.create_file("settings.json", r#"{"dialog_id": "second"}"#)?;
            let reloaded = store.reload().expect("reload");
            assert_eq!(reloaded.dialog_id, "second");

            jail.create_file("settings.json", "{ not json")?;
            assert!(store.reload().is_err());
            assert_eq!(store.settings().dialog_id, "second");
            Ok(())
        });
    }
}
