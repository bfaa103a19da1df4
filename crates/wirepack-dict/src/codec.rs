//! Dictionary-Keyed Batch Codec
//!
//! Wraps the `zstd` bulk API with a small LRU of *digested* dictionaries.
//! Digesting (parsing the dictionary into the compressor's internal tables)
//! costs far more than a single batch compression, so the digested form is
//! cached per `(topic, dict_id)` and reused; the per-call compressor context
//! itself is cheap.
//!
//! `dict_id = 0` means no dictionary: the batch is compressed against an
//! empty dictionary at the configured level.
//!
//! The decode side allocates exactly `raw_len` and treats any deviation
//! (zstd error, overrun, short output) as a corrupt frame.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;
use tracing::trace;
use zstd::bulk::{Compressor, Decompressor};
use zstd::dict::{DecoderDictionary, EncoderDictionary};

use wirepack_core::error::{Error, Result};

/// Digested dictionaries retained per codec instance.
pub const DIGEST_CACHE_SIZE: usize = 16;

type DictKey = (String, u32);

/// Compresses joined batches against per-topic dictionaries.
pub struct BatchCompressor {
    level: i32,
    cache: Mutex<LruCache<DictKey, Arc<EncoderDictionary<'static>>>>,
}

impl BatchCompressor {
    pub fn new(level: i32) -> Self {
        let capacity =
            NonZeroUsize::new(DIGEST_CACHE_SIZE).expect("digest cache capacity must be > 0");
        Self {
            level,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    /// Compress a joined batch. `dict` must be the bytes for `dict_id`;
    /// `None` only when `dict_id == 0`.
    pub fn compress(
        &self,
        topic: &str,
        dict_id: u32,
        dict: Option<&[u8]>,
        batch: &[u8],
    ) -> Result<Vec<u8>> {
        match (dict_id, dict) {
            (0, _) => {
                let mut comp =
                    Compressor::new(self.level).map_err(|e| Error::Compression(e.to_string()))?;
                comp.compress(batch)
                    .map_err(|e| Error::Compression(e.to_string()))
            }
            (_, None) => Err(Error::Compression(format!(
                "dict_id {} referenced without dictionary bytes",
                dict_id
            ))),
            (_, Some(dict)) => {
                let digested = self.digested(topic, dict_id, dict);
                let mut comp = Compressor::with_prepared_dictionary(&digested)
                    .map_err(|e| Error::Compression(e.to_string()))?;
                comp.compress(batch)
                    .map_err(|e| Error::Compression(e.to_string()))
            }
        }
    }

    fn digested(&self, topic: &str, dict_id: u32, dict: &[u8]) -> Arc<EncoderDictionary<'static>> {
        let key = (topic.to_string(), dict_id);
        let mut cache = self.cache.lock().unwrap();
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }
        trace!(topic, dict_id, "digesting encoder dictionary");
        let digested = Arc::new(EncoderDictionary::copy(dict, self.level));
        cache.put(key, digested.clone());
        digested
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    #[cfg(test)]
    fn cache_contains(&self, topic: &str, dict_id: u32) -> bool {
        self.cache
            .lock()
            .unwrap()
            .contains(&(topic.to_string(), dict_id))
    }
}

/// Decompresses payloads, enforcing the advertised raw length exactly.
pub struct BatchDecompressor {
    cache: Mutex<LruCache<DictKey, Arc<DecoderDictionary<'static>>>>,
}

impl BatchDecompressor {
    pub fn new() -> Self {
        let capacity =
            NonZeroUsize::new(DIGEST_CACHE_SIZE).expect("digest cache capacity must be > 0");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Decompress `payload` into exactly `raw_len` bytes.
    pub fn decompress(
        &self,
        topic: &str,
        dict_id: u32,
        dict: Option<&[u8]>,
        payload: &[u8],
        raw_len: usize,
    ) -> Result<Vec<u8>> {
        let out = match (dict_id, dict) {
            (0, _) => {
                let mut dec = Decompressor::new().map_err(corrupt)?;
                dec.decompress(payload, raw_len).map_err(corrupt)?
            }
            (_, None) => {
                return Err(Error::UnknownDict {
                    topic: topic.to_string(),
                    dict_id,
                })
            }
            (_, Some(dict)) => {
                let digested = self.digested(topic, dict_id, dict);
                let mut dec = Decompressor::with_prepared_dictionary(&digested).map_err(corrupt)?;
                dec.decompress(payload, raw_len).map_err(corrupt)?
            }
        };
        if out.len() != raw_len {
            return Err(Error::CorruptFrame(format!(
                "decompressed to {} bytes, expected {}",
                out.len(),
                raw_len
            )));
        }
        Ok(out)
    }

    fn digested(&self, topic: &str, dict_id: u32, dict: &[u8]) -> Arc<DecoderDictionary<'static>> {
        let key = (topic.to_string(), dict_id);
        let mut cache = self.cache.lock().unwrap();
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }
        trace!(topic, dict_id, "digesting decoder dictionary");
        let digested = Arc::new(DecoderDictionary::copy(dict));
        cache.put(key, digested.clone());
        digested
    }
}

impl Default for BatchDecompressor {
    fn default() -> Self {
        Self::new()
    }
}

fn corrupt(e: std::io::Error) -> Error {
    Error::CorruptFrame(e.to_string())
}
