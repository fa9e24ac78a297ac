//! The `StarterConfig` instance shared across every forked stage via an
//! anonymous `MAP_SHARED` mapping, plus ingestion of the opaque engine
//! blob from the environment-chunk transport.
//!
//! The mapping holds the JSON-serialized form of [`crate::config::StarterConfig`]
//! prefixed by a 8-byte length; writers re-serialize and overwrite in place.
//! Since STAGE1 is the mapping's sole writer during its lifetime, and every
//! later stage only starts after STAGE1 has exited and been reaped, no lock
//! is needed (see this crate's concurrency notes).

use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};

use crate::config::StarterConfig;

pub const MAX_ENGINE_CONFIG_SIZE: usize = 16 * 1024 * 1024;
pub const MAX_ENGINE_CONFIG_CHUNK: usize = 4096;
const LEN_PREFIX: usize = std::mem::size_of::<u64>();

#[derive(Debug, thiserror::Error)]
pub enum EngineConfigError {
    #[error("mmap failed: {0}")]
    MmapFailed(nix::Error),
    #[error("munmap failed: {0}")]
    MunmapFailed(nix::Error),
    #[error("serialized config of {0} bytes exceeds mapping capacity of {1} bytes")]
    TooLarge(usize, usize),
    #[error("failed to serialize StarterConfig: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0} chunks requested, expected 1..={1}")]
    InvalidChunkCount(usize, usize),
    #[error("missing environment variable {0}")]
    MissingEnv(String),
    #[error("concatenated engine config of {0} bytes exceeds {1} byte limit")]
    EngineBlobTooLarge(usize, usize),
}

type Result<T> = std::result::Result<T, EngineConfigError>;

/// Owns the anonymous mapping backing a shared [`StarterConfig`]. Safe to
/// share across `fork()` because the mapping, not the pointer value, is
/// what matters: every forked process retains the same `MAP_SHARED` pages.
pub struct SharedConfig {
    ptr: NonNull<u8>,
    capacity: usize,
}

/// SAFETY: the mapping is `MAP_SHARED`, so concurrent access across forked
/// processes is exactly the intended use; within a single process this type
/// is still subject to the same single-writer discipline documented above.
unsafe impl Send for SharedConfig {}
unsafe impl Sync for SharedConfig {}

impl SharedConfig {
    /// Allocate a new anonymous shared mapping with room for `capacity`
    /// bytes of serialized config plus the length prefix.
    pub fn new(capacity: usize) -> Result<Self> {
        let len = NonZeroUsize::new(capacity + LEN_PREFIX).expect("capacity must be nonzero");
        let ptr = unsafe {
            mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(EngineConfigError::MmapFailed)?;
        Ok(Self {
            ptr: ptr.cast(),
            capacity,
        })
    }

    /// Serialize `config` and overwrite the mapping. Any process holding
    /// this mapping (via a shared fork) will see the update on its next
    /// [`SharedConfig::read`].
    pub fn write(&self, config: &StarterConfig) -> Result<()> {
        let bytes = serde_json::to_vec(config)?;
        if bytes.len() > self.capacity {
            return Err(EngineConfigError::TooLarge(bytes.len(), self.capacity));
        }
        unsafe {
            let base = self.ptr.as_ptr();
            base.cast::<u64>().write_unaligned(bytes.len() as u64);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(LEN_PREFIX), bytes.len());
        }
        Ok(())
    }

    /// Deserialize the current contents of the mapping.
    pub fn read(&self) -> Result<StarterConfig> {
        unsafe {
            let base = self.ptr.as_ptr();
            let len = base.cast::<u64>().read_unaligned() as usize;
            let slice = std::slice::from_raw_parts(base.add(LEN_PREFIX), len);
            Ok(serde_json::from_slice(slice)?)
        }
    }
}

impl Drop for SharedConfig {
    fn drop(&mut self) {
        let len = NonZeroUsize::new(self.capacity + LEN_PREFIX).expect("capacity must be nonzero");
        let _ = unsafe { munmap(self.ptr.cast(), len.get()) };
    }
}

/// Read `ENGINE_CONFIG_CHUNK_ENV` and `ENGINE_CONFIG_ENV1..N` and
/// concatenate them into the opaque blob this crate never itself parses.
pub fn ingest_engine_config_from_env() -> Result<Vec<u8>> {
    let count_str = std::env::var("ENGINE_CONFIG_CHUNK_ENV")
        .map_err(|_| EngineConfigError::MissingEnv("ENGINE_CONFIG_CHUNK_ENV".into()))?;
    let count: usize = count_str
        .parse()
        .map_err(|_| EngineConfigError::InvalidChunkCount(0, MAX_ENGINE_CONFIG_CHUNK))?;
    if count == 0 || count > MAX_ENGINE_CONFIG_CHUNK {
        return Err(EngineConfigError::InvalidChunkCount(count, MAX_ENGINE_CONFIG_CHUNK));
    }

    let mut blob = Vec::new();
    for i in 1..=count {
        let key = format!("ENGINE_CONFIG_ENV{i}");
        let chunk = std::env::var(&key).map_err(|_| EngineConfigError::MissingEnv(key))?;
        blob.extend_from_slice(chunk.as_bytes());
        if blob.len() > MAX_ENGINE_CONFIG_SIZE {
            return Err(EngineConfigError::EngineBlobTooLarge(
                blob.len(),
                MAX_ENGINE_CONFIG_SIZE,
            ));
        }
    }
    Ok(blob)
}

/// Overwrite every environment variable except `preserve` with an empty
/// string, rather than unsetting it, since some language runtimes cache
/// `environ` pointers and expect them to stay non-NULL.
pub fn cleanenv(preserve: &[&str]) {
    let keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in keys {
        if !preserve.contains(&key.as_str()) {
            std::env::set_var(&key, "");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Container;

    #[test]
    fn test_write_then_read_roundtrip() {
        let shared = SharedConfig::new(4096).unwrap();
        let mut config = StarterConfig::new();
        config.container = Container {
            pid: 42,
            ..Default::default()
        };
        shared.write(&config).unwrap();
        let got = shared.read().unwrap();
        assert_eq!(got.container.pid, 42);
    }

    #[test]
    fn test_write_rejects_oversize_payload() {
        let shared = SharedConfig::new(4).unwrap();
        let config = StarterConfig::new();
        let err = shared.write(&config).unwrap_err();
        assert!(matches!(err, EngineConfigError::TooLarge(_, _)));
    }

    #[test]
    #[serial_test::serial]
    fn test_ingest_engine_config_concatenates_chunks_in_order() {
        std::env::set_var("ENGINE_CONFIG_CHUNK_ENV", "2");
        std::env::set_var("ENGINE_CONFIG_ENV1", "hello ");
        std::env::set_var("ENGINE_CONFIG_ENV2", "world");
        let blob = ingest_engine_config_from_env().unwrap();
        assert_eq!(blob, b"hello world");
        std::env::remove_var("ENGINE_CONFIG_CHUNK_ENV");
        std::env::remove_var("ENGINE_CONFIG_ENV1");
        std::env::remove_var("ENGINE_CONFIG_ENV2");
    }
}
