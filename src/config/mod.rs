mod settings;

use config::{Config, Environment, File};

use crate::utils::Result;
use settings::PartialSettings;

pub use settings::{BrokerSettings, ClientSettings, LogSettings, ServerSettings, Settings};

/// Default configuration file, resolved relative to the working directory
/// with any extension the `config` crate understands.
pub const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Prefix of environment overrides, e.g. `TIDEMQ__SERVER__PORT=1884`.
pub const ENV_PREFIX: &str = "TIDEMQ";

/// Loads the configuration from the default file and environment variables
/// and merges it over the built-in defaults.
pub fn load_config() -> Result<Settings> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

/// Like [`load_config`], reading the optional file `name` instead.
pub fn load_config_from(name: &str) -> Result<Settings> {
    let config = Config::builder()
        .add_source(File::with_name(name).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
