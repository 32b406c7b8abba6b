//! Record types exchanged with API collaborators.

use crate::api::{NodeKey, SequenceKey, TileId};
use crate::coord::GeoPoint;

/// Minimal index entry for a node.
///
/// This is what a tile listing or an index fetch yields: enough to
/// place the node in the graph and compute candidate edges, nothing
/// more.
#[derive(Debug, Clone, PartialEq)]
pub struct CoreNodeRecord {
    /// Node key.
    pub key: NodeKey,
    /// Sequence this node was captured in, when known.
    pub sequence_key: Option<SequenceKey>,
    /// Capture position as reported by the camera.
    pub position: GeoPoint,
    /// Compass angle of the camera in degrees, clockwise from north.
    pub ca: f64,
}

/// Complete metadata for a node.
///
/// Produced by a fill fetch; required before assets can be cached
/// since the asset URLs live here.
#[derive(Debug, Clone, PartialEq)]
pub struct FillNodeRecord {
    /// Capture time, epoch milliseconds, when known.
    pub captured_at: Option<i64>,
    /// Reconstruction connected-component, when the node is merged.
    pub merge_cc: Option<u64>,
    /// SfM-adjusted position; preferred over the capture position.
    pub merged_position: Option<GeoPoint>,
    /// URL of the image asset.
    pub image_url: String,
    /// URL of the mesh asset.
    pub mesh_url: String,
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Whether the image is a full panorama.
    pub pano: bool,
}

/// Mesh geometry for a node.
///
/// Opaque to the graph core; the renderer interprets it.
#[derive(Clone, PartialEq, Default)]
pub struct MeshGeometry {
    /// Flat list of vertex coordinates, three per vertex.
    pub vertices: Vec<f32>,
    /// Flat list of vertex indices, three per triangle.
    pub faces: Vec<u32>,
}

impl std::fmt::Debug for MeshGeometry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshGeometry")
            .field("vertices", &(self.vertices.len() / 3))
            .field("faces", &(self.faces.len() / 3))
            .finish()
    }
}

/// One geographic tile and the nodes discovered in it.
#[derive(Debug, Clone, PartialEq)]
pub struct TileRecord {
    /// Tile identifier.
    pub id: TileId,
    /// Index entries for the nodes inside this tile.
    pub nodes: Vec<CoreNodeRecord>,
}

/// Result of a tile fetch for a node: the tiles covering its
/// location, each with the nodes discovered inside.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TileFetchResult {
    /// Tiles covering the requested node's location.
    pub tiles: Vec<TileRecord>,
}

impl TileFetchResult {
    /// Identifiers of all tiles in the result.
    pub fn tile_ids(&self) -> Vec<TileId> {
        self.tiles.iter().map(|t| t.id.clone()).collect()
    }
}
