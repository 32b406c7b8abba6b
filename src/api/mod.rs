//! Remote API boundary.
//!
//! The graph core never performs network I/O itself. Everything it
//! needs from the outside world arrives through the collaborator traits
//! in this module: node metadata, geographic tile membership, sequence
//! membership and heavy assets (image bytes and mesh geometry). The
//! traits are object-safe so implementations can be shared as
//! `Arc<dyn ...>` across the orchestrator and its background tasks.

mod clients;
mod error;
mod records;
mod types;

pub use clients::{ApiFuture, AssetLoader, MetadataClient, SequenceClient, TileClient};
pub use error::ApiError;
pub use records::{CoreNodeRecord, FillNodeRecord, MeshGeometry, TileFetchResult, TileRecord};
pub use types::{NodeKey, SequenceKey, TileId};
