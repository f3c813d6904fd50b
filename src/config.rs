use std::{env, path::PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::module::{ModuleExports, ModuleSource};

pub const MODULE_KEY: &str = "STEPMESH_MODULE";
pub const TOLERANCE_KEY: &str = "STEPMESH_TOLERANCE";
pub const EXPORT_MEMORY_KEY: &str = "STEPMESH_EXPORT_MEMORY";
pub const EXPORT_MALLOC_KEY: &str = "STEPMESH_EXPORT_MALLOC";
pub const EXPORT_FREE_KEY: &str = "STEPMESH_EXPORT_FREE";
pub const EXPORT_CONVERT_KEY: &str = "STEPMESH_EXPORT_CONVERT";
pub const LOG_LEVEL_KEY: &str = "STEPMESH_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "STEPMESH_LOG_DIR";
pub const OTEL_ENDPOINT_KEY: &str = "STEPMESH_OTEL_ENDPOINT";

/// Default mesh tolerance when neither the request nor the config sets one.
pub const DEFAULT_TOLERANCE: f64 = 1e-2;

#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    /// A non-blank value for `key`, trimmed.
    pub async fn value(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) if path.exists() => match dotenvy::from_path(path) {
                Ok(()) => info!("Loaded .env from {}", path.display()),
                Err(err) => debug!("could not load .env from {}: {err}", path.display()),
            },
            Some(path) => debug!("no .env at {}", path.display()),
            None => {}
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        "EnvConfigManager".to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{0} is not set; point it at the kernel's .wasm file")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid { key: &'static str, value: String, reason: &'static str },
}

/// Everything a stepmesh process needs to start a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    pub module_path: Option<PathBuf>,
    pub exports: ModuleExports,
    pub tolerance: f64,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            module_path: None,
            exports: ModuleExports::default(),
            tolerance: DEFAULT_TOLERANCE,
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
        }
    }
}

impl BridgeConfig {
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let mut out = Self::default();

        if let Some(path) = config.value(MODULE_KEY).await {
            out.module_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = config.value(TOLERANCE_KEY).await {
            out.tolerance = parse_tolerance(TOLERANCE_KEY, &raw)?;
        }

        let exports = [
            (EXPORT_MEMORY_KEY, &mut out.exports.memory),
            (EXPORT_MALLOC_KEY, &mut out.exports.malloc),
            (EXPORT_FREE_KEY, &mut out.exports.free),
            (EXPORT_CONVERT_KEY, &mut out.exports.convert),
        ];
        for (key, slot) in exports {
            if let Some(name) = config.value(key).await {
                *slot = name;
            }
        }

        if let Some(level) = config.value(LOG_LEVEL_KEY).await {
            out.log_level = level;
        }
        out.log_dir = config.value(LOG_DIR_KEY).await.map(PathBuf::from);
        out.otel_endpoint = config.value(OTEL_ENDPOINT_KEY).await;

        Ok(out)
    }

    pub fn module_source(&self) -> Result<ModuleSource, ConfigError> {
        self.module_path
            .clone()
            .map(ModuleSource::File)
            .ok_or(ConfigError::Missing(MODULE_KEY))
    }
}

pub fn parse_tolerance(key: &'static str, raw: &str) -> Result<f64, ConfigError> {
    let invalid = |reason| ConfigError::Invalid { key, value: raw.to_string(), reason };
    let tolerance: f64 = raw.trim().parse().map_err(|_| invalid("not a number"))?;
    if !tolerance.is_finite() || tolerance <= 0.0 {
        return Err(invalid("must be greater than zero"));
    }
    Ok(tolerance)
}
