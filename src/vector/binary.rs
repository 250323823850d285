// Binary sketches and the mmap'd coarse searcher
//
// A sketch is the sign-bit projection of a dense embedding into 256
// dimensions, packed into 32 bytes. Hamming distance over sketches
// approximates angular distance over the dense vectors, which makes an
// exhaustive popcount scan fast enough for cascade stage 1.

use crate::errors::{CodexLensError, Result};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SKETCH_BITS: usize = 256;
pub const SKETCH_BYTES: usize = SKETCH_BITS / 8;

pub const BINARY_MMAP_NAME: &str = "_binary_vectors.mmap";
pub const BINARY_META_NAME: &str = "_binary_vectors.mmap.meta.json";

/// Sidecar descriptor next to the mmap file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinaryMmapMeta {
    pub dimension: usize,
    pub count: usize,
    pub record_bytes: usize,
}

impl Default for BinaryMmapMeta {
    fn default() -> Self {
        Self {
            dimension: SKETCH_BITS,
            count: 0,
            record_bytes: SKETCH_BYTES,
        }
    }
}

/// Project a dense vector to 256 dimensions (mean-pooled buckets) and take
/// the sign bit per coordinate.
pub fn pack_sketch(dense: &[f32]) -> [u8; SKETCH_BYTES] {
    let mut sketch = [0_u8; SKETCH_BYTES];
    if dense.is_empty() {
        return sketch;
    }

    for bit in 0..SKETCH_BITS {
        // Bucket `bit` pools the dense coordinates mapped onto it; short
        // vectors wrap around so every bucket sees at least one value.
        let value = if dense.len() >= SKETCH_BITS {
            let start = bit * dense.len() / SKETCH_BITS;
            let end = ((bit + 1) * dense.len() / SKETCH_BITS).max(start + 1);
            dense[start..end.min(dense.len())].iter().sum::<f32>()
        } else {
            dense[bit % dense.len()]
        };

        if value > 0.0 {
            sketch[bit / 8] |= 1 << (bit % 8);
        }
    }

    sketch
}

/// Hamming distance via 64-bit popcount.
pub fn hamming(a: &[u8; SKETCH_BYTES], b: &[u8; SKETCH_BYTES]) -> u32 {
    let mut distance = 0;
    for i in 0..SKETCH_BYTES / 8 {
        let x = u64::from_le_bytes(a[i * 8..(i + 1) * 8].try_into().unwrap());
        let y = u64::from_le_bytes(b[i * 8..(i + 1) * 8].try_into().unwrap());
        distance += (x ^ y).count_ones();
    }
    distance
}

/// Appends sketches to the mmap file; record offset is the chunk id.
pub struct BinarySketchWriter {
    mmap_path: PathBuf,
    meta_path: PathBuf,
    meta: BinaryMmapMeta,
}

impl BinarySketchWriter {
    pub fn open(index_root: &Path) -> Result<Self> {
        std::fs::create_dir_all(index_root)?;
        let mmap_path = index_root.join(BINARY_MMAP_NAME);
        let meta_path = index_root.join(BINARY_META_NAME);

        let meta = if meta_path.is_file() {
            let text = std::fs::read_to_string(&meta_path)?;
            serde_json::from_str(&text)?
        } else {
            BinaryMmapMeta::default()
        };

        Ok(Self {
            mmap_path,
            meta_path,
            meta,
        })
    }

    pub fn count(&self) -> usize {
        self.meta.count
    }

    /// Append one record. The caller must pass the next sequential chunk
    /// id; gaps would desynchronize record offsets from ids.
    pub fn append(&mut self, chunk_id: usize, sketch: &[u8; SKETCH_BYTES]) -> Result<()> {
        if chunk_id != self.meta.count {
            return Err(CodexLensError::storage(format!(
                "binary sketch ids must be sequential: expected {}, got {chunk_id}",
                self.meta.count
            )));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.mmap_path)?;
        file.write_all(sketch)?;
        file.flush()?;

        self.meta.count += 1;
        std::fs::write(&self.meta_path, serde_json::to_string_pretty(&self.meta)?)?;
        Ok(())
    }

    /// Drop the record tail after a failed multi-artifact insert.
    pub fn truncate(&mut self, count: usize) -> Result<()> {
        let file = OpenOptions::new().write(true).open(&self.mmap_path)?;
        file.set_len((count * SKETCH_BYTES) as u64)?;
        self.meta.count = count;
        std::fs::write(&self.meta_path, serde_json::to_string_pretty(&self.meta)?)?;
        Ok(())
    }
}

/// Memory-mapped coarse searcher over all sketches of one project.
pub struct BinarySearcher {
    mmap: Mmap,
    count: usize,
}

impl BinarySearcher {
    /// `None` when the artifacts do not exist (callers degrade to the next
    /// stage-1 fallback rather than failing).
    pub fn open(index_root: &Path) -> Result<Option<Self>> {
        let mmap_path = index_root.join(BINARY_MMAP_NAME);
        let meta_path = index_root.join(BINARY_META_NAME);
        if !mmap_path.is_file() || !meta_path.is_file() {
            return Ok(None);
        }

        let meta: BinaryMmapMeta = serde_json::from_str(&std::fs::read_to_string(&meta_path)?)?;
        if meta.record_bytes != SKETCH_BYTES {
            return Err(CodexLensError::storage(format!(
                "unexpected binary record size {} in {}",
                meta.record_bytes,
                meta_path.display()
            )));
        }

        let file = std::fs::File::open(&mmap_path)?;
        // Zero-length files cannot be mapped; treat them as absent.
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        let mmap = unsafe { Mmap::map(&file)? };

        let count = meta.count.min(mmap.len() / SKETCH_BYTES);
        Ok(Some(Self { mmap, count }))
    }

    pub fn count(&self) -> usize {
        self.count
    }

    fn record(&self, chunk_id: usize) -> [u8; SKETCH_BYTES] {
        let start = chunk_id * SKETCH_BYTES;
        self.mmap[start..start + SKETCH_BYTES]
            .try_into()
            .expect("record bounds checked by count")
    }

    /// Exhaustive Hamming scan; returns the `top_k` closest
    /// `(chunk_id, distance)` pairs, nearest first.
    pub fn search_packed(&self, query: &[u8; SKETCH_BYTES], top_k: usize) -> Vec<(usize, u32)> {
        let mut scored: Vec<(usize, u32)> = (0..self.count)
            .map(|chunk_id| (chunk_id, hamming(query, &self.record(chunk_id))))
            .collect();
        scored.sort_by_key(|&(chunk_id, distance)| (distance, chunk_id));
        scored.truncate(top_k);
        scored
    }

    /// Pack the dense query vector and scan.
    pub fn search(&self, query_dense: &[f32], top_k: usize) -> Vec<(usize, u32)> {
        self.search_packed(&pack_sketch(query_dense), top_k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sketch_is_the_sign_of_the_projection() {
        let mut dense = vec![1.0_f32; SKETCH_BITS];
        dense[0] = -1.0;
        dense[255] = -1.0;

        let sketch = pack_sketch(&dense);
        assert_eq!(sketch[0] & 1, 0);
        assert_eq!(sketch[31] & 0b1000_0000, 0);
        assert_eq!(sketch[1], 0xFF);
    }

    #[test]
    fn hamming_matches_naive_bit_count() {
        let a = [0b1010_1010_u8; SKETCH_BYTES];
        let b = [0b0101_0101_u8; SKETCH_BYTES];
        assert_eq!(hamming(&a, &b), 256);
        assert_eq!(hamming(&a, &a), 0);

        let mut c = a;
        c[7] ^= 0b11;
        assert_eq!(hamming(&a, &c), 2);
    }

    #[test]
    fn writer_and_searcher_round_trip() {
        let dir = TempDir::new().unwrap();
        let mut writer = BinarySketchWriter::open(dir.path()).unwrap();

        let near = pack_sketch(&vec![1.0; SKETCH_BITS]);
        let mut far = near;
        for byte in far.iter_mut().take(16) {
            *byte = !*byte;
        }

        writer.append(0, &near).unwrap();
        writer.append(1, &far).unwrap();
        assert!(writer.append(5, &near).is_err());

        let searcher = BinarySearcher::open(dir.path()).unwrap().unwrap();
        assert_eq!(searcher.count(), 2);

        let hits = searcher.search_packed(&near, 2);
        assert_eq!(hits[0], (0, 0));
        assert_eq!(hits[1].0, 1);
        assert!(hits[1].1 > 0);
    }

    #[test]
    fn missing_artifacts_open_as_none() {
        let dir = TempDir::new().unwrap();
        assert!(BinarySearcher::open(dir.path()).unwrap().is_none());
    }
}
