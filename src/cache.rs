//! Specialization cache (§4.I): map an argument-configuration fingerprint to
//! a compiled [`Artifact`](crate::backend::Artifact), guaranteeing at most
//! one concurrent compile per fingerprint and caching both successes and
//! failures.
//!
//! The on-disk persistence layer follows the same shape as the teacher's
//! `srs_setup::{save_g1_srs, load_and_validate_g1_srs}`: a fixed magic and
//! version header, a length-prefixed payload, `std::fs`/`std::io` for the
//! actual bytes, and a `thiserror` error on any format mismatch.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

use crate::backend::{Artifact, BackendId, KernelMeta};
use crate::boundary::BoundaryMode;
use crate::grid::DType;

const DISK_MAGIC: &[u8; 8] = b"STNCLSPC";
const DISK_VERSION: u32 = 1;

/// The key a [`SpecializationCache`] memoizes on (§3): every argument that
/// changes the compiled artifact's shape or content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    ndim: usize,
    shape: Vec<usize>,
    dtype: DType,
    boundary: BoundaryMode,
    neighborhoods: Vec<Vec<Vec<i64>>>,
    ghost_depth: Vec<usize>,
    coefficients_digest: [u8; 32],
    backend: BackendId,
}

impl Fingerprint {
    /// Build a fingerprint from a kernel's metadata plus a content digest of
    /// its coefficients (the only part of a kernel not already reflected in
    /// `meta`/`neighborhoods`).
    pub fn new(meta: &KernelMeta, coefficients: &[f64], backend: BackendId) -> Self {
        let mut hasher = blake3::Hasher::new();
        for c in coefficients {
            hasher.update(&c.to_le_bytes());
        }
        Self {
            ndim: meta.grid_shape.len(),
            shape: meta.grid_shape.clone(),
            dtype: meta.dtype,
            boundary: meta.boundary,
            neighborhoods: meta.neighborhoods.iter().map(|n| n.offsets().to_vec()).collect(),
            ghost_depth: meta.ghost_depth.clone(),
            coefficients_digest: *hasher.finalize().as_bytes(),
            backend,
        }
    }

    /// A stable, content-addressed digest of this fingerprint, used as the
    /// on-disk record key.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.ndim.to_le_bytes());
        for s in &self.shape {
            hasher.update(&s.to_le_bytes());
        }
        hasher.update(&[self.dtype as u8]);
        hasher.update(&[self.boundary as u8]);
        for n in &self.neighborhoods {
            for off in n {
                for c in off {
                    hasher.update(&c.to_le_bytes());
                }
            }
        }
        for g in &self.ghost_depth {
            hasher.update(&g.to_le_bytes());
        }
        hasher.update(&self.coefficients_digest);
        hasher.update(self.backend.tag().as_bytes());
        *hasher.finalize().as_bytes()
    }
}

/// Errors raised by the cache itself (build failures are carried as
/// `String` inside [`CacheEntry::Failed`], not this type).
#[derive(Debug, Error)]
pub enum CacheError {
    /// Disk record was shorter than the fixed header.
    #[error("cache record truncated: got {got} bytes, need at least {need}")]
    Truncated {
        /// Bytes actually present.
        got: usize,
        /// Minimum bytes a valid record needs.
        need: usize,
    },
    /// Disk record's magic bytes didn't match.
    #[error("cache record has wrong magic {got:02x?}, expected {DISK_MAGIC:02x?}")]
    BadMagic {
        /// Magic bytes actually read.
        got: [u8; 8],
    },
    /// Disk record's version is newer than this build understands.
    #[error("cache record version {got} is unsupported (this build supports {DISK_VERSION})")]
    UnsupportedVersion {
        /// Version actually read.
        got: u32,
    },
    /// Underlying file I/O failed.
    #[error("cache record I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One cache slot's resolved state: a successful build, or a cached
/// failure reason (§4.I's "positive and negative caching").
#[derive(Clone)]
enum CacheEntry {
    Built(Arc<Artifact>),
    Failed(String),
}

type Slot = Arc<OnceLock<CacheEntry>>;

/// Optional bounded eviction policy layered on top of the cache's map.
/// Disabled (unbounded) unless a caller opts in.
#[derive(Debug, Clone)]
pub struct LruPolicy {
    capacity: usize,
}

impl LruPolicy {
    /// A policy that evicts the least-recently-used entry once more than
    /// `capacity` fingerprints are resident.
    pub fn bounded(capacity: usize) -> Self {
        Self { capacity }
    }
}

/// Maps argument-configuration fingerprints to compiled artifacts.
///
/// A cache miss acquires this fingerprint's slot (a lazily-initialized
/// [`OnceLock`]) under the map's lock, then releases the map lock before
/// running the (potentially slow) builder closure — concurrent misses on
/// the same fingerprint block on the same slot rather than racing to
/// rebuild, concurrent misses on different fingerprints proceed in
/// parallel.
pub struct SpecializationCache {
    entries: Mutex<HashMap<Fingerprint, Slot>>,
    order: Mutex<Vec<Fingerprint>>,
    lru: Option<LruPolicy>,
}

impl SpecializationCache {
    /// An empty cache with unbounded retention.
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()), order: Mutex::new(Vec::new()), lru: None }
    }

    /// An empty cache that evicts under `policy` once full.
    pub fn with_lru(policy: LruPolicy) -> Self {
        Self { entries: Mutex::new(HashMap::new()), order: Mutex::new(Vec::new()), lru: Some(policy) }
    }

    /// Number of fingerprints currently resident (built or failed).
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache mutex poisoned").len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the artifact for `fingerprint`, building it via `build` on a
    /// miss. Returns the cached failure reason (as a plain `String`, since
    /// build errors are not required to be `Clone`) on a cached or fresh
    /// failure.
    pub fn get_or_build(
        &self,
        fingerprint: Fingerprint,
        build: impl FnOnce() -> Result<Artifact, String>,
    ) -> Result<Arc<Artifact>, String> {
        let slot = {
            let mut entries = self.entries.lock().expect("cache mutex poisoned");
            entries.entry(fingerprint.clone()).or_insert_with(Arc::new).clone()
        };

        // `OnceLock::get_or_init` runs its closure at most once even under
        // concurrent callers on the same slot: every other caller blocks
        // until the first finishes, which is exactly the per-fingerprint
        // build lock §4.I requires. Calling `build` here, inside the
        // closure, is load-bearing — calling it beforehand would let every
        // concurrent miss perform its own (wasted) compile and only race to
        // decide whose result gets kept.
        let entry = slot.get_or_init(|| match build() {
            Ok(artifact) => CacheEntry::Built(Arc::new(artifact)),
            Err(reason) => CacheEntry::Failed(reason),
        });

        self.track_insertion(fingerprint);

        match entry {
            CacheEntry::Built(artifact) => Ok(artifact.clone()),
            CacheEntry::Failed(reason) => Err(reason.clone()),
        }
    }

    fn track_insertion(&self, fingerprint: Fingerprint) {
        let Some(policy) = &self.lru else { return };
        let mut order = self.order.lock().expect("cache order mutex poisoned");
        order.retain(|f| f != &fingerprint);
        order.push(fingerprint);
        if order.len() > policy.capacity {
            let evicted = order.remove(0);
            self.entries.lock().expect("cache mutex poisoned").remove(&evicted);
        }
    }
}

impl Default for SpecializationCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize a fingerprint's digest plus opaque `source`/`binary_blob`
/// bytes into the on-disk record format: `magic (8) | version (4) |
/// digest (32) | source_len (8) | source | blob_len (8) | blob`.
pub fn write_record(
    path: impl AsRef<Path>,
    fingerprint: &Fingerprint,
    source: &[u8],
    binary_blob: &[u8],
) -> Result<(), CacheError> {
    let mut out = Vec::new();
    out.extend_from_slice(DISK_MAGIC);
    out.extend_from_slice(&DISK_VERSION.to_le_bytes());
    out.extend_from_slice(&fingerprint.digest());
    out.extend_from_slice(&(source.len() as u64).to_le_bytes());
    out.extend_from_slice(source);
    out.extend_from_slice(&(binary_blob.len() as u64).to_le_bytes());
    out.extend_from_slice(binary_blob);
    std::fs::write(path, out)?;
    Ok(())
}

/// A decoded on-disk cache record.
pub struct DiskRecord {
    /// The fingerprint digest this record was written under.
    pub fingerprint_digest: [u8; 32],
    /// Generated source text, if the backend emits one.
    pub source: Vec<u8>,
    /// Opaque compiled payload (backend-specific).
    pub binary_blob: Vec<u8>,
}

/// Read and validate a record written by [`write_record`].
pub fn read_record(path: impl AsRef<Path>) -> Result<DiskRecord, CacheError> {
    let mut bytes = Vec::new();
    std::fs::File::open(path)?.read_to_end(&mut bytes)?;

    let header_len = 8 + 4 + 32 + 8;
    if bytes.len() < header_len {
        return Err(CacheError::Truncated { got: bytes.len(), need: header_len });
    }

    let mut magic = [0u8; 8];
    magic.copy_from_slice(&bytes[0..8]);
    if &magic != DISK_MAGIC {
        return Err(CacheError::BadMagic { got: magic });
    }

    let version = u32::from_le_bytes(bytes[8..12].try_into().expect("slice is 4 bytes"));
    if version != DISK_VERSION {
        return Err(CacheError::UnsupportedVersion { got: version });
    }

    let mut fingerprint_digest = [0u8; 32];
    fingerprint_digest.copy_from_slice(&bytes[12..44]);

    let source_len = u64::from_le_bytes(bytes[44..52].try_into().expect("slice is 8 bytes")) as usize;
    let source_start = 52;
    let source_end = source_start + source_len;
    if bytes.len() < source_end + 8 {
        return Err(CacheError::Truncated { got: bytes.len(), need: source_end + 8 });
    }
    let source = bytes[source_start..source_end].to_vec();

    let blob_len_start = source_end;
    let blob_len = u64::from_le_bytes(
        bytes[blob_len_start..blob_len_start + 8].try_into().expect("slice is 8 bytes"),
    ) as usize;
    let blob_start = blob_len_start + 8;
    let blob_end = blob_start + blob_len;
    if bytes.len() < blob_end {
        return Err(CacheError::Truncated { got: bytes.len(), need: blob_end });
    }
    let binary_blob = bytes[blob_start..blob_end].to_vec();

    Ok(DiskRecord { fingerprint_digest, source, binary_blob })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::neighborhood::Neighborhood;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta() -> KernelMeta {
        KernelMeta {
            neighborhoods: vec![Neighborhood::custom(vec![vec![0, 0], vec![1, 0]]).unwrap()],
            ghost_depth: vec![1, 0],
            boundary: BoundaryMode::Clamp,
            num_inputs: 1,
            grid_shape: vec![8, 8],
            dtype: DType::F64,
        }
    }

    #[test]
    fn same_inputs_produce_same_fingerprint_digest() {
        let a = Fingerprint::new(&meta(), &[1.0, 2.0], BackendId::Cpu);
        let b = Fingerprint::new(&meta(), &[1.0, 2.0], BackendId::Cpu);
        assert_eq!(a, b);
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn different_coefficients_produce_different_fingerprint() {
        let a = Fingerprint::new(&meta(), &[1.0, 2.0], BackendId::Cpu);
        let b = Fingerprint::new(&meta(), &[1.0, 3.0], BackendId::Cpu);
        assert_ne!(a, b);
    }

    #[test]
    fn write_then_read_record_roundtrips() {
        let fp = Fingerprint::new(&meta(), &[1.0, 2.0], BackendId::Cpu);
        let dir = std::env::temp_dir().join(format!("stencil-cache-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("record.bin");
        write_record(&path, &fp, b"// source", b"\x01\x02\x03").unwrap();
        let record = read_record(&path).unwrap();
        assert_eq!(record.fingerprint_digest, fp.digest());
        assert_eq!(record.source, b"// source");
        assert_eq!(record.binary_blob, vec![1, 2, 3]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn read_record_rejects_bad_magic() {
        let dir = std::env::temp_dir().join("stencil-cache-test-bad-magic");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.bin");
        std::fs::write(&path, b"NOTMAGIC\x00\x00\x00\x00").unwrap();
        assert!(matches!(read_record(&path), Err(CacheError::BadMagic { .. })));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn get_or_build_runs_builder_exactly_once_per_fingerprint() {
        let cache = SpecializationCache::new();
        let fp = Fingerprint::new(&meta(), &[1.0], BackendId::Reference);
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let _ = cache.get_or_build(fp.clone(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Artifact, _>("stub failure".to_string())
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn negative_cache_entry_is_replayed() {
        let cache = SpecializationCache::new();
        let fp = Fingerprint::new(&meta(), &[1.0], BackendId::Reference);
        let first = cache.get_or_build(fp.clone(), || Err("boom".to_string()));
        let second = cache.get_or_build(fp, || panic!("should not rebuild"));
        assert_eq!(first.unwrap_err(), "boom");
        assert_eq!(second.unwrap_err(), "boom");
    }

    #[test]
    fn lru_policy_evicts_oldest_fingerprint_past_capacity() {
        let cache = SpecializationCache::with_lru(LruPolicy::bounded(1));
        let fp_a = Fingerprint::new(&meta(), &[1.0], BackendId::Reference);
        let fp_b = Fingerprint::new(&meta(), &[2.0], BackendId::Reference);
        let _ = cache.get_or_build(fp_a.clone(), || Err("a".to_string()));
        let _ = cache.get_or_build(fp_b, || Err("b".to_string()));
        assert_eq!(cache.len(), 1);
    }
}
