use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub transcription: TranscriptionConfig,
    pub translation: TranslationConfig,
    pub agents: AgentsConfig,
    pub logging: LoggingConfig,
}

/// Connection parameters for the transcription streaming service.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptionConfig {
    pub host: String,
    pub port: u16,
    pub secret: String,
    pub encryption: bool,
    pub health_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentsConfig {
    /// Process-wide cap on concurrently registered agents.
    pub max: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl BotConfig {
    /// Load configuration from `babelbot.toml`, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var("BABELBOT_CONFIG").unwrap_or_else(|_| "babelbot.toml".to_string());

        let builder = config::Config::builder()
            .set_default("transcription.host", "localhost")?
            .set_default("transcription.port", 5000)?
            .set_default("transcription.secret", "")?
            .set_default("transcription.encryption", true)?
            .set_default("transcription.health_port", 8001)?
            .set_default("translation.url", "http://localhost:5001/translate")?
            .set_default("agents.max", 1)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "text")?;

        let builder = if Path::new(&config_path).exists() {
            builder.add_source(config::File::with_name(&config_path))
        } else {
            tracing::warn!("Config file '{}' not found, using defaults", config_path);
            builder
        };

        let settings = builder
            .add_source(
                config::Environment::with_prefix("BABELBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BotConfig = settings.try_deserialize()?;
        Ok(config)
    }
}

/// Install the process-wide tracing subscriber described by `config`.
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = match config.format.as_str() {
        "json" => fmt().with_env_filter(filter).json().try_init(),
        _ => fmt().with_env_filter(filter).try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("Failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults_and_env_override() {
        let config = BotConfig::load().unwrap();
        assert_eq!(config.transcription.port, 5000);
        assert!(config.transcription.encryption);
        assert_eq!(config.agents.max, 1);
        assert_eq!(config.logging.level, "info");

        std::env::set_var("BABELBOT_AGENTS__MAX", "7");
        let config = BotConfig::load().unwrap();
        assert_eq!(config.agents.max, 7);
        std::env::remove_var("BABELBOT_AGENTS__MAX");
    }

    #[test]
    fn test_init_tracing_is_single_shot() {
        let logging = LoggingConfig {
            level: "debug".to_string(),
            format: "text".to_string(),
        };
        init_tracing(&logging).unwrap();
        assert!(init_tracing(&logging).is_err());
    }
}
