use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::{atomic_write_bytes, sha256_bytes, sha256_file};

pub const MAPPING_EXTENSION: &str = "map";

/// A mapping as it sits in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredMapping {
    pub architecture_id: String,
    pub key: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Durable store of discovered mappings: `{root}/{architecture_id}/{key}.map`.
/// Entries are opaque bytes and are overwritten on every store.
#[derive(Debug, Clone)]
pub struct MappingCache {
    root: PathBuf,
}

impl MappingCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, architecture_id: &str, key: &str) -> PathBuf {
        self.root
            .join(architecture_id)
            .join(format!("{}.{}", key, MAPPING_EXTENSION))
    }

    pub fn lookup(&self, architecture_id: &str, key: &str) -> Result<Option<StoredMapping>> {
        let path = self.entry_path(architecture_id, key);
        if !path.is_file() {
            return Ok(None);
        }
        let size_bytes = fs::metadata(&path)?.len();
        Ok(Some(StoredMapping {
            architecture_id: architecture_id.to_string(),
            key: key.to_string(),
            sha256: sha256_file(&path)?,
            path,
            size_bytes,
        }))
    }

    /// Copies `artifact` into the store, replacing any earlier entry.
    pub fn store(&self, architecture_id: &str, key: &str, artifact: &Path) -> Result<StoredMapping> {
        let bytes = fs::read(artifact)
            .map_err(|e| anyhow!("cannot read mapping artifact {}: {}", artifact.display(), e))?;
        let path = self.entry_path(architecture_id, key);
        atomic_write_bytes(&path, &bytes)?;
        Ok(StoredMapping {
            architecture_id: architecture_id.to_string(),
            key: key.to_string(),
            path,
            size_bytes: bytes.len() as u64,
            sha256: sha256_bytes(&bytes),
        })
    }

    /// Every stored mapping, ordered by architecture then key.
    pub fn list(&self) -> Result<Vec<StoredMapping>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let walker = walkdir::WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(MAPPING_EXTENSION) {
                continue;
            }
            let (Some(key), Some(architecture_id)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.parent()
                    .and_then(|p| p.file_name())
                    .and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            out.push(StoredMapping {
                architecture_id: architecture_id.to_string(),
                key: key.to_string(),
                path: path.to_path_buf(),
                size_bytes: entry.metadata()?.len(),
                sha256: sha256_file(path)?,
            });
        }
        Ok(out)
    }
}
