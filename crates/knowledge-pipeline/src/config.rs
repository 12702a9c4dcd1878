//! Configuration for the ingestion pipeline

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::{SliceConfig, SliceType};

/// Environment variable naming a TOML config file
pub const CONFIG_ENV: &str = "KNOWLEDGE_PIPELINE_CONFIG";

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub slicing: SlicingConfig,
    #[serde(default)]
    pub local: LocalBackendConfig,
    /// Managed extraction service; files can only target it when present
    #[serde(default)]
    pub managed: Option<ManagedBackendConfig>,
    #[serde(default)]
    pub embeddings: EmbeddingConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl PipelineConfig {
    /// Read a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$KNOWLEDGE_PIPELINE_CONFIG`, falling back to defaults
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Reject inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.local.min_chunk_length == 0 || self.local.min_chunk_length > self.local.max_chunk_length {
            return Err(Error::Config(format!(
                "local chunk bounds [{}, {}] are invalid",
                self.local.min_chunk_length, self.local.max_chunk_length
            )));
        }
        let (min, max) = self.slicing.length_range;
        if min == 0 || min > max {
            return Err(Error::Config(format!(
                "default slice range [{}, {}] is invalid",
                min, max
            )));
        }
        if self.retrieval.default_top_n == 0 || self.retrieval.default_top_n > self.retrieval.max_top_n {
            return Err(Error::Config("retrieval.default_top_n must be within 1..=max_top_n".to_string()));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum upload size in bytes (default: 100MB)
    pub max_upload_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            max_upload_size: 100 * 1024 * 1024,
        }
    }
}

/// Where durable state lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Root of the local upload store
    pub documents_dir: PathBuf,
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("knowledge-pipeline")
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = data_dir();
        Self {
            database_path: base.join("pipeline.db"),
            documents_dir: base.join("documents"),
        }
    }
}

/// Splitting used when a request asks for the default config
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlicingConfig {
    pub separators: Vec<String>,
    pub length_range: (usize, usize),
}

impl Default for SlicingConfig {
    fn default() -> Self {
        Self {
            separators: vec!["\n".to_string()],
            length_range: (256, 1024),
        }
    }
}

impl SlicingConfig {
    pub fn default_slice_config(&self) -> SliceConfig {
        SliceConfig {
            slice_type: SliceType::Default,
            separators: self.separators.clone(),
            length_range: self.length_range,
        }
    }
}

/// Local backend limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalBackendConfig {
    pub min_chunk_length: usize,
    pub max_chunk_length: usize,
    pub supported_types: Vec<String>,
    /// Size limit for txt/md uploads
    pub text_size_limit: u64,
    /// Size limit for everything else
    pub other_size_limit: u64,
    /// Chunks containing any of these are flagged for audit
    pub blocked_terms: Vec<String>,
}

fn default_local_types() -> Vec<String> {
    ["txt", "md", "markdown", "csv", "json", "log"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            min_chunk_length: 16,
            max_chunk_length: 1024,
            supported_types: default_local_types(),
            text_size_limit: 10 * 1024 * 1024,
            other_size_limit: 100 * 1024 * 1024,
            blocked_terms: Vec::new(),
        }
    }
}

/// Managed document service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedBackendConfig {
    pub base_url: String,
    #[serde(default = "default_managed_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_managed_types")]
    pub supported_types: Vec<String>,
    #[serde(default = "default_image_size_limit")]
    pub image_size_limit: u64,
    #[serde(default = "default_managed_size_limit")]
    pub other_size_limit: u64,
    /// Character ceiling per text document
    #[serde(default = "default_max_char_count")]
    pub max_char_count: u64,
}

fn default_managed_timeout() -> u64 { 60 }
fn default_max_retries() -> u32 { 2 }
fn default_image_size_limit() -> u64 { 5 * 1024 * 1024 }
fn default_managed_size_limit() -> u64 { 20 * 1024 * 1024 }
fn default_max_char_count() -> u64 { 1_000_000 }

fn default_managed_types() -> Vec<String> {
    [
        "pdf", "doc", "docx", "txt", "md", "ppt", "pptx", "xls", "xlsx", "csv", "jpg", "jpeg",
        "png", "bmp",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl ManagedBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_managed_timeout(),
            max_retries: default_max_retries(),
            supported_types: default_managed_types(),
            image_size_limit: default_image_size_limit(),
            other_size_limit: default_managed_size_limit(),
            max_char_count: default_max_char_count(),
        }
    }
}

/// Embedding provider selection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Deterministic feature hashing, no model required
    #[default]
    Hash,
    /// Ollama embeddings endpoint
    Ollama,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub dimensions: usize,
    pub ollama_url: String,
    pub model: String,
    pub timeout_secs: u64,
    /// Concurrent chunk embeddings per file (default: CPU count, max 8)
    pub parallel_embeddings: Option<usize>,
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Hash,
            dimensions: 384,
            ollama_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            timeout_secs: 60,
            parallel_embeddings: None,
            max_retries: 2,
        }
    }
}

impl EmbeddingConfig {
    pub fn parallelism(&self) -> usize {
        self.parallel_embeddings
            .unwrap_or_else(|| num_cpus::get().min(8))
            .max(1)
    }
}

/// Worker timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// First poll delay while an embed waits on its parse
    pub wait_initial_ms: u64,
    /// Backoff ceiling for that wait
    pub wait_max_ms: u64,
    /// Base delay for backend retries, doubled per attempt
    pub retry_base_delay_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            wait_initial_ms: 100,
            wait_max_ms: 2_000,
            retry_base_delay_ms: 500,
        }
    }
}

/// Recovery sweeper
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub run_on_startup: bool,
    /// Periodic sweep; disabled when unset
    pub interval_secs: Option<u64>,
    /// Pending entries older than this are considered orphaned by the periodic sweep
    pub liveness_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            run_on_startup: true,
            interval_secs: None,
            liveness_secs: 900,
        }
    }
}

/// Hit test limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_n: usize,
    pub max_top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_n: 3,
            max_top_n: 20,
        }
    }
}
