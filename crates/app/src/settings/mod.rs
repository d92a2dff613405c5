pub mod state;

pub use state::{ProviderSettings, SessionSettings, Settings, SettingsError, SettingsStore};
