//! Vector search core for image collections.
//!
//! Images and text queries are embedded into one vector space, stored in one
//! index file per (owner, collection), and searched across many collections
//! at once.
//!
//! # Architecture
//!
//! - `normalize`: unit-length scaling applied on both write and read paths
//! - `embeddings`: model seam plus batched image / text embedding
//! - `index`: in-memory ordered vector index with exact inner-product search
//! - `storage`: binary file I/O for one index
//! - `store`: per-collection lifecycle (create, append, search, delete)
//! - `ingest`: parallel file loading and single-append ingestion
//! - `query`: federated top-K merge across collections
//! - `engine`: composition of the above

pub mod embeddings;
pub mod engine;
mod index;
pub mod ingest;
pub mod normalize;
pub mod query;
mod storage;
pub mod store;

pub use engine::{EngineError, SearchEngine};
pub use ingest::{IngestFailure, IngestItem, IngestReport};
pub use query::{RankedResult, SearchTarget};
pub use store::StoreError;

/// Default embedding model: CLIP ViT-B/32, 512 dimensions
pub const DEFAULT_MODEL: &str = "clip-vit-b-32";

pub const DEFAULT_DIMENSIONS: usize = 512;
