// assets.rs: model catalog and the model asset cache.
//
// Generation refuses to start unless the configured model is cached. The
// model bytes themselves are never interpreted; the cache only has to
// answer "is it there" and be fillable and clearable.
//
// `FsAssetStore` fetches `<source>/<file>` into `<cache>/<file>`. The copy
// goes to a `.part` file first and is renamed into place, so a cache entry
// is either complete or absent.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use thiserror::Error;

use crate::profile::Tier;

pub const DEFAULT_MODEL_ID: &str = "tiny";

/// One downloadable model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub name: &'static str,
    /// Weakest tier the model is intended for.
    pub strength: Tier,
    pub size_hint: &'static str,
    pub file_name: &'static str,
    pub description: &'static str,
}

pub static MODELS: [ModelInfo; 3] = [
    ModelInfo {
        id: "tiny",
        name: "Tiny",
        strength: Tier::Low,
        size_hint: "~15 MB",
        file_name: "tiny-model.bin",
        description: "Fastest option for quick previews. Expect more noise and weak structure.",
    },
    ModelInfo {
        id: "base",
        name: "Base",
        strength: Tier::Medium,
        size_hint: "~150 MB",
        file_name: "base-model.bin",
        description: "Balanced quality with better coherence and fewer artifacts.",
    },
    ModelInfo {
        id: "xl",
        name: "XL",
        strength: Tier::High,
        size_hint: "~600 MB",
        file_name: "xl-model.bin",
        description: "Best clarity and detail, but the slowest and most memory-hungry.",
    },
];

/// Look up a model by id.
pub fn model(id: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.id == id)
}

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("model source {path} not found")]
    SourceMissing { path: PathBuf },

    #[error("asset I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> AssetError + '_ {
    move |source| AssetError::Io { path: path.to_path_buf(), source }
}

/// Cache of downloadable model assets.
#[async_trait]
pub trait ModelAssetStore: Send + Sync {
    async fn is_cached(&self, model_id: &str) -> bool;

    /// Fetch the model and store it in the cache. Returns its size in bytes.
    async fn fetch_and_cache(&self, model_id: &str) -> Result<u64, AssetError>;

    /// Total size of everything cached.
    async fn cached_bytes(&self) -> Result<u64, AssetError>;

    /// Drop every cached model.
    async fn clear(&self) -> Result<(), AssetError>;
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Directory-to-directory model cache.
#[derive(Debug, Clone)]
pub struct FsAssetStore {
    source_dir: PathBuf,
    cache_dir: PathBuf,
}

impl FsAssetStore {
    pub fn new(source_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        FsAssetStore { source_dir: source_dir.into(), cache_dir: cache_dir.into() }
    }

    fn cached_path(&self, info: &ModelInfo) -> PathBuf {
        self.cache_dir.join(info.file_name)
    }
}

#[async_trait]
impl ModelAssetStore for FsAssetStore {
    async fn is_cached(&self, model_id: &str) -> bool {
        let Some(info) = model(model_id) else {
            return false;
        };
        tokio::fs::metadata(self.cached_path(info))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn fetch_and_cache(&self, model_id: &str) -> Result<u64, AssetError> {
        let info = model(model_id).ok_or_else(|| AssetError::UnknownModel(model_id.to_string()))?;
        let source = self.source_dir.join(info.file_name);
        if !tokio::fs::try_exists(&source).await.map_err(io_err(&source))? {
            return Err(AssetError::SourceMissing { path: source });
        }

        tokio::fs::create_dir_all(&self.cache_dir).await.map_err(io_err(&self.cache_dir))?;
        let dest = self.cached_path(info);
        let partial = dest.with_extension("part");
        let size = tokio::fs::copy(&source, &partial).await.map_err(io_err(&partial))?;
        tokio::fs::rename(&partial, &dest).await.map_err(io_err(&dest))?;

        info!("cached model '{}' ({} bytes) at {}", info.id, size, dest.display());
        Ok(size)
    }

    async fn cached_bytes(&self) -> Result<u64, AssetError> {
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(&self.cache_dir)(e)),
        };
        let mut total = 0;
        while let Some(entry) = entries.next_entry().await.map_err(io_err(&self.cache_dir))? {
            let meta = entry.metadata().await.map_err(io_err(&entry.path()))?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    async fn clear(&self) -> Result<(), AssetError> {
        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => {
                debug!("cleared model cache {}", self.cache_dir.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&self.cache_dir)(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-memory store: `available` models can be fetched, fetched ones are cached.
#[derive(Debug, Default)]
pub struct MemoryAssetStore {
    available: HashMap<String, u64>,
    cached: Mutex<HashMap<String, u64>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `model_id` fetchable with the given size.
    pub fn with_available(mut self, model_id: &str, size: u64) -> Self {
        self.available.insert(model_id.to_string(), size);
        self
    }

    /// Start with `model_id` already cached.
    pub fn with_cached(self, model_id: &str, size: u64) -> Self {
        self.cached.lock().insert(model_id.to_string(), size);
        self
    }
}

#[async_trait]
impl ModelAssetStore for MemoryAssetStore {
    async fn is_cached(&self, model_id: &str) -> bool {
        self.cached.lock().contains_key(model_id)
    }

    async fn fetch_and_cache(&self, model_id: &str) -> Result<u64, AssetError> {
        let size = *self
            .available
            .get(model_id)
            .ok_or_else(|| AssetError::UnknownModel(model_id.to_string()))?;
        self.cached.lock().insert(model_id.to_string(), size);
        Ok(size)
    }

    async fn cached_bytes(&self) -> Result<u64, AssetError> {
        Ok(self.cached.lock().values().sum())
    }

    async fn clear(&self) -> Result<(), AssetError> {
        self.cached.lock().clear();
        Ok(())
    }
}
