pub mod state;

pub use state::{
    ClientSettings, ModelSettings, SettingsError, SettingsResult, SettingsStore,
};
