//! Versioned Dictionary Store
//!
//! Maps `topic -> (dict_id, dictionary bytes)`. Versions are assigned
//! monotonically per topic on `install`; the store retains the current and
//! previous version so frames compressed just before a swap still decode,
//! and evicts anything older. `dict_id = 0` is reserved for "no dictionary"
//! and is never stored.
//!
//! ## On-disk layout
//!
//! ```text
//! <dict_dir>/<topic>.dict            current dictionary bytes
//! <dict_dir>/<topic>.meta            {"dict_id":N,"created_at":...,"size":N,"fallback":bool}
//! <dict_dir>/<topic>-<dict_id>.dict  optional versioned sidecar
//! ```
//!
//! `load_dir` is called at startup and may be called again to pick up newly
//! published dictionaries. The collector additionally calls `load_sidecar`
//! when a frame references a version that is not resident.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use wirepack_core::error::{Error, Result};
use wirepack_core::validate::validate_topic;

/// Versions kept per topic (current + previous).
pub const RETAINED_VERSIONS: usize = 2;

/// Metadata written next to each dictionary file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictMeta {
    pub dict_id: u32,
    pub created_at: DateTime<Utc>,
    pub size: usize,
    /// True when the trainer used the raw-prefix fallback; compression from
    /// such a dictionary is substantially worse.
    #[serde(default)]
    pub fallback: bool,
}

#[derive(Clone)]
struct DictVersion {
    dict_id: u32,
    bytes: Arc<[u8]>,
}

#[derive(Default)]
struct TopicDicts {
    /// Ascending by dict_id; at most `RETAINED_VERSIONS` entries.
    versions: Vec<DictVersion>,
}

/// Thread-safe, read-mostly dictionary store.
pub struct DictStore {
    dict_dir: PathBuf,
    topics: RwLock<HashMap<String, TopicDicts>>,
}

impl DictStore {
    pub fn new(dict_dir: impl Into<PathBuf>) -> Self {
        Self {
            dict_dir: dict_dir.into(),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Scan `dict_dir` for `<topic>.dict` / `<topic>.meta` pairs and install
    /// them. Returns the number of dictionaries loaded. Missing directory is
    /// not an error; a fresh deployment simply ships uncompressed-dictionary
    /// frames until dictionaries are published.
    pub fn load_dir(&self) -> Result<usize> {
        let entries = match std::fs::read_dir(&self.dict_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %self.dict_dir.display(), "dictionary directory not found");
                return Ok(0);
            }
            Err(e) => return Err(Error::Network(e)),
        };

        let mut loaded = 0;
        for entry in entries {
            let path = entry.map_err(Error::Network)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("dict") {
                continue;
            }
            let Some(topic) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // Versioned sidecars (`<topic>-<id>.dict`) are loaded on demand.
            if validate_topic(topic).is_err() {
                debug!(file = %path.display(), "skipping non-topic dictionary file");
                continue;
            }
            match self.load_pair(topic, &path) {
                Ok(meta) => {
                    if meta.fallback {
                        warn!(
                            topic,
                            dict_id = meta.dict_id,
                            "loaded raw-prefix fallback dictionary; compression will be degraded"
                        );
                    }
                    loaded += 1;
                }
                Err(e) => warn!(topic, error = %e, "failed to load dictionary"),
            }
        }
        info!(
            dir = %self.dict_dir.display(),
            count = loaded,
            "dictionary store loaded"
        );
        Ok(loaded)
    }

    fn load_pair(&self, topic: &str, dict_path: &Path) -> Result<DictMeta> {
        let meta_path = dict_path.with_extension("meta");
        let meta_raw = std::fs::read(&meta_path).map_err(Error::Network)?;
        let meta: DictMeta = serde_json::from_slice(&meta_raw)
            .map_err(|e| Error::FatalConfig(format!("{}: {}", meta_path.display(), e)))?;
        if meta.dict_id == 0 {
            return Err(Error::FatalConfig(format!(
                "{}: dict_id 0 is reserved",
                meta_path.display()
            )));
        }
        let bytes = std::fs::read(dict_path).map_err(Error::Network)?;
        self.install_with_id(topic, meta.dict_id, bytes);
        Ok(meta)
    }

    /// Current dictionary for a topic, if any.
    pub fn get(&self, topic: &str) -> Option<(u32, Arc<[u8]>)> {
        let topics = self.topics.read().unwrap();
        let current = topics.get(topic)?.versions.last()?;
        Some((current.dict_id, current.bytes.clone()))
    }

    /// A specific resident version.
    pub fn get_by_id(&self, topic: &str, dict_id: u32) -> Option<Arc<[u8]>> {
        let topics = self.topics.read().unwrap();
        topics
            .get(topic)?
            .versions
            .iter()
            .find(|v| v.dict_id == dict_id)
            .map(|v| v.bytes.clone())
    }

    /// Install new dictionary bytes, assigning the next id for the topic.
    /// Retains the previous version; older versions are evicted.
    pub fn install(&self, topic: &str, bytes: Vec<u8>) -> u32 {
        let mut topics = self.topics.write().unwrap();
        let entry = topics.entry(topic.to_string()).or_default();
        let next_id = entry.versions.last().map(|v| v.dict_id + 1).unwrap_or(1);
        entry.versions.push(DictVersion {
            dict_id: next_id,
            bytes: bytes.into(),
        });
        if entry.versions.len() > RETAINED_VERSIONS {
            let evict = entry.versions.len() - RETAINED_VERSIONS;
            entry.versions.drain(..evict);
        }
        debug!(topic, dict_id = next_id, "dictionary installed");
        next_id
    }

    /// Install bytes under an explicit id (disk load path). Keeps versions
    /// sorted and bounded.
    fn install_with_id(&self, topic: &str, dict_id: u32, bytes: Vec<u8>) {
        let mut topics = self.topics.write().unwrap();
        let entry = topics.entry(topic.to_string()).or_default();
        if entry.versions.iter().any(|v| v.dict_id == dict_id) {
            return;
        }
        entry.versions.push(DictVersion {
            dict_id,
            bytes: bytes.into(),
        });
        entry.versions.sort_by_key(|v| v.dict_id);
        if entry.versions.len() > RETAINED_VERSIONS {
            let evict = entry.versions.len() - RETAINED_VERSIONS;
            entry.versions.drain(..evict);
        }
    }

    /// Try to bring a non-resident `(topic, dict_id)` in from disk: either
    /// the current `<topic>.dict` (when its meta carries the id) or a
    /// versioned `<topic>-<id>.dict` sidecar.
    pub fn load_sidecar(&self, topic: &str, dict_id: u32) -> Result<Option<Arc<[u8]>>> {
        validate_topic(topic)?;
        if dict_id == 0 {
            return Ok(None);
        }

        let meta_path = self.dict_dir.join(format!("{}.meta", topic));
        if let Ok(raw) = std::fs::read(&meta_path) {
            if let Ok(meta) = serde_json::from_slice::<DictMeta>(&raw) {
                if meta.dict_id == dict_id {
                    let bytes = std::fs::read(self.dict_dir.join(format!("{}.dict", topic)))
                        .map_err(Error::Network)?;
                    self.install_with_id(topic, dict_id, bytes);
                    return Ok(self.get_by_id(topic, dict_id));
                }
            }
        }

        let sidecar = self.dict_dir.join(format!("{}-{}.dict", topic, dict_id));
        match std::fs::read(&sidecar) {
            Ok(bytes) => {
                self.install_with_id(topic, dict_id, bytes);
                info!(topic, dict_id, "dictionary loaded from sidecar");
                Ok(self.get_by_id(topic, dict_id))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Network(e)),
        }
    }

    /// Topics with at least one resident dictionary.
    pub fn topic_count(&self) -> usize {
        self.topics.read().unwrap().len()
    }
}
