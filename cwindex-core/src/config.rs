//! Configuration parsing and management.

use cwindex_types::CodeIdSets;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Transformer `{name}` uses unknown code id set `{key}`")]
    UnknownCodeIdSet { name: String, key: String },
}

/// Main configuration struct matching the cwindex.yml schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub chain_id: String,

    /// Named sets of code ids, referenced by transformers and formulas
    #[serde(default)]
    pub code_ids: CodeIdSets,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub range: RangeConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub transformers: Vec<TransformerConfig>,

    // Internal: path to config file (for relative path resolution)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".cwindex")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeConfig {
    /// Upper bound on evaluations in one range computation
    #[serde(default = "default_max_evaluations")]
    pub max_evaluations: usize,
}

fn default_max_evaluations() -> usize {
    10_000
}

impl Default for RangeConfig {
    fn default() -> Self {
        Self {
            max_evaluations: default_max_evaluations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_batch_size() -> usize {
    500
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

/// A declarative transformer.
///
/// `code_id_keys` names code-id sets; when omitted the transformer applies
/// to every contract. Key paths are lists of string key parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformerConfig {
    /// Store the value of one or more exact keys under `name`.
    Item {
        name: String,
        #[serde(default)]
        code_id_keys: Option<Vec<String>>,
        /// Defaults to the single key `[name]`
        #[serde(default)]
        keys: Vec<Vec<String>>,
    },
    /// Store each entry of a map as `name:<entry key>`.
    Map {
        name: String,
        #[serde(default)]
        code_id_keys: Option<Vec<String>>,
        prefixes: Vec<Vec<String>>,
        #[serde(default)]
        numeric_key: bool,
    },
    /// Store the keys of a map with empty values as a list under `name`.
    MapList {
        name: String,
        #[serde(default)]
        code_id_keys: Option<Vec<String>>,
        map: Vec<String>,
    },
}

impl TransformerConfig {
    pub fn name(&self) -> &str {
        match self {
            TransformerConfig::Item { name, .. }
            | TransformerConfig::Map { name, .. }
            | TransformerConfig::MapList { name, .. } => name,
        }
    }

    pub fn code_id_keys(&self) -> Option<&[String]> {
        match self {
            TransformerConfig::Item { code_id_keys, .. }
            | TransformerConfig::Map { code_id_keys, .. }
            | TransformerConfig::MapList { code_id_keys, .. } => code_id_keys.as_deref(),
        }
    }
}

impl Config {
    /// A configuration with defaults for everything but the chain id
    pub fn new(chain_id: impl Into<String>) -> Self {
        Config {
            chain_id: chain_id.into(),
            code_ids: CodeIdSets::new(),
            data_dir: default_data_dir(),
            range: RangeConfig::default(),
            ingest: IngestConfig::default(),
            transformers: Vec::new(),
            config_path: None,
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&contents)?;

        // Store config file path for relative path resolution
        config.config_path = Some(path.to_path_buf());

        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chain_id.trim().is_empty() {
            return Err(ConfigError::MissingField("chain_id".to_string()));
        }
        let known: Vec<&str> = self.code_ids.names().collect();
        for transformer in &self.transformers {
            for key in transformer.code_id_keys().unwrap_or_default() {
                if !known.contains(&key.as_str()) {
                    return Err(ConfigError::UnknownCodeIdSet {
                        name: transformer.name().to_string(),
                        key: key.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Get the data directory, resolved relative to config file
    pub fn data_dir(&self) -> PathBuf {
        self.resolve_path(&self.data_dir)
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Resolve an arbitrary path relative to the config file location
    pub fn resolve_relative(&self, path: &Path) -> PathBuf {
        self.resolve_path(path)
    }

    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self.config_path.as_ref().and_then(|p| p.parent()) {
            Some(parent) => parent.join(path),
            None => path.to_path_buf(),
        }
    }
}
