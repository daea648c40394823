//! Persistent MeSH to ICD-10-CM memo, stored as a single JSON document.

use std::{
    collections::BTreeMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cache {path} is not valid JSON: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache {path}: entry {key:?} has an unsupported shape")]
    Shape { path: PathBuf, key: String },
}

/// Concepts and codes recorded for one MeSH identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub codes: Vec<String>,
}

impl CacheEntry {
    /// Build an entry with codes and concepts sorted and deduplicated.
    pub fn new<C, I>(concepts: C, codes: I) -> Self
    where
        C: IntoIterator<Item = String>,
        I: IntoIterator<Item = String>,
    {
        Self {
            concepts: sorted_unique(concepts),
            codes: sorted_unique(codes),
        }
    }
}

/// Lexicographically sorted set of non-empty values.
pub fn sorted_unique<I: IntoIterator<Item = String>>(values: I) -> Vec<String> {
    let mut out: Vec<String> = values.into_iter().filter(|v| !v.is_empty()).collect();
    out.sort();
    out.dedup();
    out
}

/// In-memory view of the cache file. Entries are never replaced once set.
#[derive(Debug, Default, Clone)]
pub struct CrosswalkCache {
    entries: BTreeMap<String, CacheEntry>,
}

impl CrosswalkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the cache file, normalising legacy flat-list entries.
    /// A missing file yields an empty cache.
    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no crosswalk cache yet");
                return Ok(Self::new());
            }
            Err(source) => {
                return Err(CacheError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Self::new());
        }
        let raw: BTreeMap<String, Value> =
            serde_json::from_str(&text).map_err(|source| CacheError::Json {
                path: path.to_path_buf(),
                source,
            })?;

        let mut entries = BTreeMap::new();
        let mut legacy = 0usize;
        for (key, value) in raw {
            let entry = match value {
                Value::Array(_) => {
                    legacy += 1;
                    let codes: Vec<String> = serde_json::from_value(value).map_err(|_| {
                        CacheError::Shape {
                            path: path.to_path_buf(),
                            key: key.clone(),
                        }
                    })?;
                    CacheEntry::new(Vec::<String>::new(), codes)
                }
                Value::Object(_) => {
                    let entry: CacheEntry =
                        serde_json::from_value(value).map_err(|_| CacheError::Shape {
                            path: path.to_path_buf(),
                            key: key.clone(),
                        })?;
                    CacheEntry::new(entry.concepts, entry.codes)
                }
                _ => {
                    return Err(CacheError::Shape {
                        path: path.to_path_buf(),
                        key,
                    })
                }
            };
            entries.insert(key, entry);
        }
        info!(path = %path.display(), entries = entries.len(), legacy, "loaded crosswalk cache");
        Ok(Self { entries })
    }

    /// Overwrite `path` with the whole cache, via a sibling temp file and rename.
    pub fn save(&self, path: &Path) -> Result<(), CacheError> {
        let io_err = |source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(&self.entries).map_err(|source| CacheError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        let tmp = tmp_path(path);
        {
            let mut file = fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(&body).map_err(io_err)?;
            file.write_all(b"\n").map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        fs::rename(&tmp, path).map_err(io_err)?;
        debug!(path = %path.display(), entries = self.entries.len(), "saved crosswalk cache");
        Ok(())
    }

    pub fn get(&self, mesh_id: &str) -> Option<&CacheEntry> {
        self.entries.get(mesh_id)
    }

    /// Insert `entry` unless `mesh_id` is already present.
    /// Returns `true` when the entry was stored.
    pub fn put(&mut self, mesh_id: &str, entry: CacheEntry) -> bool {
        if self.entries.contains_key(mesh_id) {
            return false;
        }
        self.entries.insert(mesh_id.to_string(), entry);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CacheEntry)> {
        self.entries.iter()
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
