use anyhow::{anyhow, Result};
use config::{Config, Environment, File};
use std::path::Path;
use tracing::{debug, info};

use super::runtime::EngineConfig;

/// Environment prefix, e.g. `REGIME__TRAINING__N_STATES=3`.
pub const ENV_PREFIX: &str = "REGIME";

/// Load the engine configuration from an optional TOML file layered under
/// environment overrides, then validate it.
pub fn load_config(path: &str) -> Result<EngineConfig> {
    // .env is optional
    let _ = dotenvy::dotenv();

    if Path::new(path).exists() {
        info!("Loading configuration from {}", path);
    } else {
        debug!("No configuration file at {}, using defaults", path);
    }

    let engine: EngineConfig = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    engine
        .validate()
        .map_err(|errors| anyhow!("Invalid configuration: {}", errors.join(", ")))?;

    Ok(engine)
}

/// Render a configuration as TOML, suitable for `init-config`.
pub fn render_config(engine: &EngineConfig) -> Result<String> {
    Ok(toml::to_string_pretty(engine)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let path = std::env::temp_dir().join(format!("regime-missing-{}.toml", uuid::Uuid::new_v4()));
        let engine = load_config(path.to_str().unwrap()).unwrap();
        assert_eq!(engine.training.n_states, EngineConfig::default().training.n_states);
    }

    #[test]
    fn test_rendered_config_reloads() {
        let mut engine = EngineConfig::default();
        engine.training.n_states = 3;
        engine.signal.threshold = 0.002;

        let rendered = render_config(&engine).unwrap();
        let path = std::env::temp_dir().join(format!("regime-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, rendered).unwrap();

        let loaded = load_config(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded.training.n_states, 3);
        assert_eq!(loaded.signal.threshold, 0.002);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let path = std::env::temp_dir().join(format!("regime-bad-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[training]\nn_states = 1\n").unwrap();

        let result = load_config(path.to_str().unwrap());
        std::fs::remove_file(&path).ok();

        assert!(result.is_err());
    }
}
