//! Config file
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Root folder to place the torrents files.
    pub download_dir: String,

    /// Port advertised to the tracker in announces.
    pub local_peer_port: u16,
}

pub static CONFIG: LazyLock<Config> =
    LazyLock::new(|| Config::load().unwrap());

impl Config {
    /// Try to load the configuration. Environment variables have privilege
    /// over values from the configuration file, which has privilege over
    /// the defaults.
    pub fn load() -> Result<Self, Error> {
        // remora.toml, the .toml part is omitted
        let config_file = std::env::var("XDG_CONFIG_HOME")
            .map(|v| format!("{v}/remora/config"))
            .unwrap_or_else(|_| "./remora".to_string());

        config::Config::builder()
            .add_source(config::File::with_name(&config_file).required(false))
            .add_source(config::Environment::with_prefix("REMORA"))
            .set_default("download_dir", "./downloads")
            .unwrap()
            .set_default("local_peer_port", 6881)
            .unwrap()
            .build()
            .map_err(|_| Error::ConfigError)?
            .try_deserialize::<Config>()
            .map_err(|_| Error::ConfigError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::load().unwrap();
        assert_eq!(config.local_peer_port, 6881);
        assert_eq!(config.download_dir, "./downloads");
    }
}
