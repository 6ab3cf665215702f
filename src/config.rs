use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::{
    classifier::DEFAULT_CONFIDENCE_THRESHOLD, collector::CollectorConfig,
    features::NormalizerConfig, training::PollConfig,
};

pub const SERVER_URL_ENV: &str = "GESTURE_SERVER_URL";
pub const DATA_DIR_ENV: &str = "GESTURE_DATA_DIR";
pub const ASSETS_DIR_ENV: &str = "GESTURE_ASSETS_DIR";

const BUNDLED_MODEL_FILE: &str = "basic_gesture_model.onnx";
const BUNDLED_LABEL_MAP_FILE: &str = "basic_label_map.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server_url: String,
    pub data_dir: PathBuf,
    pub bundled_model: PathBuf,
    pub bundled_label_map: PathBuf,
    pub normalizer: NormalizerConfig,
    pub confidence_threshold: f32,
    pub collector: CollectorConfig,
    pub poll: PollConfig,
    pub http_timeout: Duration,
    /// Threads ONNX Runtime may use inside one inference call.
    pub inference_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let assets = default_assets_dir();
        Self {
            server_url: "http://localhost:8000".to_string(),
            data_dir: default_data_dir(),
            bundled_model: assets.join(BUNDLED_MODEL_FILE),
            bundled_label_map: assets.join(BUNDLED_LABEL_MAP_FILE),
            normalizer: NormalizerConfig::default(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            collector: CollectorConfig::default(),
            poll: PollConfig::default(),
            http_timeout: Duration::from_secs(30),
            inference_threads: 2,
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the `GESTURE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| env::var(key).ok());
        config
    }

    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.collector.target_count == 0 {
            bail!("collector.target_count must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.collector.admission_threshold) {
            bail!(
                "collector.admission_threshold {} is outside 0..=1",
                self.collector.admission_threshold
            );
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!(
                "confidence_threshold {} is outside 0..=1",
                self.confidence_threshold
            );
        }
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| var(key).filter(|value| !value.trim().is_empty());
        if let Some(url) = lookup(SERVER_URL_ENV) {
            self.server_url = url;
        }
        if let Some(dir) = lookup(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup(ASSETS_DIR_ENV) {
            let assets = PathBuf::from(dir);
            self.bundled_model = assets.join(BUNDLED_MODEL_FILE);
            self.bundled_label_map = assets.join(BUNDLED_LABEL_MAP_FILE);
        }
    }
}

fn default_assets_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("assets")
}

fn default_data_dir() -> PathBuf {
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("gesture-data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.collector.target_count, 100);
        assert_eq!(config.collector.admission_threshold, 0.5);
        assert_eq!(config.confidence_threshold, 0.5);
        assert_eq!(config.poll.interval, Duration::from_secs(5));
        assert!(config.bundled_label_map.ends_with("assets/basic_label_map.json"));
    }

    #[test]
    fn env_overrides_paths_and_url() {
        let mut config = EngineConfig::default();
        config.apply_env(|key| match key {
            SERVER_URL_ENV => Some("http://10.0.0.2:9000".to_string()),
            ASSETS_DIR_ENV => Some("/opt/gestures".to_string()),
            DATA_DIR_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.server_url, "http://10.0.0.2:9000");
        assert_eq!(
            config.bundled_model,
            Path::new("/opt/gestures/basic_gesture_model.onnx")
        );
        assert_eq!(config.data_dir, EngineConfig::default().data_dir);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(
            &path,
            r#"{"server_url": "http://trainer", "collector": {"target_count": 20}}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.server_url, "http://trainer");
        assert_eq!(config.collector.target_count, 20);
        assert_eq!(config.collector.admission_threshold, 0.5);
        assert_eq!(config.poll, PollConfig::default());
    }

    #[test]
    fn zero_target_count_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"collector": {"target_count": 0}}"#).unwrap();

        let err = EngineConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("target_count"));
    }

    #[test]
    fn thresholds_must_be_probabilities() {
        assert!(EngineConfig::default().validate().is_ok());

        let mut config = EngineConfig::default();
        config.confidence_threshold = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.collector.admission_threshold = 1.5;
        assert!(config.validate().is_err());
    }
}
