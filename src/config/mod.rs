mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::config::settings::PartialSettings;

pub use settings::{
    EmulatorSettings, FeedbackSettings, HubSettings, LoggingSettings, ReceiverSettings, Settings,
    StreamSettings,
};


/// Loads the configuration from `config/default` and `HUBLINK__*`
/// environment variables, filling anything missing from the defaults.
pub fn load_config() -> Result<Settings, ConfigError> {
    load_from("config/default")
}

/// Same as [`load_config`] but reads the file at `path` (extension optional).
pub fn load_from(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("HUBLINK")
                .prefix_separator("__")
                .separator("__"),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}
