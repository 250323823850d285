// Vector storage and embedding seams
//
// The centralized store keeps dense HNSW, binary sketches, and chunk
// metadata as one consistent triple per project index root.

pub mod binary;
pub mod embedder;
pub mod model_lock;
pub mod store;

pub use binary::{BinarySearcher, BinarySketchWriter, SKETCH_BITS, SKETCH_BYTES, hamming, pack_sketch};
pub use embedder::{EmbeddingProvider, HashEmbedder, cosine_similarity};
pub use model_lock::ModelLock;
pub use store::{ChunkCategory, ChunkMetadata, VECTORS_META_DB_NAME, VectorStore};
