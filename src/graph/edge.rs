//! Navigation edges.
//!
//! Two edge families exist: sequence edges (the capture order of a
//! sequence) and spatial edges (geometric adjacency). Both are computed
//! from already-cached data and are pure functions of their inputs.
//!
//! An edge set, once computed, is retained until the node is evicted.
//! Neighbors discovered after the computation do not invalidate it;
//! this mirrors the behavior of the system this crate models and is a
//! documented staleness trade-off, not an oversight.

use crate::api::NodeKey;
use crate::coord::{self, GeoPoint};

/// A navigation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Next node in the capture sequence.
    Next,
    /// Previous node in the capture sequence.
    Prev,
    /// Step along the viewing direction.
    StepForward,
    /// Step against the viewing direction.
    StepBackward,
    /// Step to the left of the viewing direction.
    StepLeft,
    /// Step to the right of the viewing direction.
    StepRight,
    /// Rotate the viewing direction left without moving far.
    TurnLeft,
    /// Rotate the viewing direction right without moving far.
    TurnRight,
    /// Reverse the viewing direction without moving far.
    TurnU,
}

impl Direction {
    /// Whether this direction navigates along the capture sequence.
    pub fn is_sequence(&self) -> bool {
        matches!(self, Direction::Next | Direction::Prev)
    }

    /// Whether this direction navigates the spatial graph.
    pub fn is_spatial(&self) -> bool {
        !self.is_sequence()
    }
}

/// A directed edge from one node to another.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Destination node.
    pub to: NodeKey,
    /// Direction of travel.
    pub direction: Direction,
    /// Ground distance to the destination in meters. Zero for
    /// sequence edges, which are not geometric.
    pub distance: f64,
}

/// A set of directed edges, at most one per direction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EdgeSet {
    edges: Vec<Edge>,
}

impl EdgeSet {
    /// An empty edge set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The edge in `direction`, if one exists.
    pub fn get(&self, direction: Direction) -> Option<&Edge> {
        self.edges.iter().find(|e| e.direction == direction)
    }

    /// Iterate over all edges.
    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    /// Number of edges in the set.
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the set holds no edges.
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Keep the better of the existing edge and `candidate` for the
    /// candidate's direction: nearer wins, key order breaks ties.
    fn offer(&mut self, candidate: Edge) {
        match self
            .edges
            .iter_mut()
            .find(|e| e.direction == candidate.direction)
        {
            Some(existing) => {
                let closer = candidate.distance < existing.distance;
                let tied = candidate.distance == existing.distance && candidate.to < existing.to;
                if closer || tied {
                    *existing = candidate;
                }
            }
            None => self.edges.push(candidate),
        }
    }
}

/// Tunables for spatial edge computation.
#[derive(Debug, Clone)]
pub struct SpatialEdgeConfig {
    /// Maximum ground distance for step edges in meters.
    pub max_step_distance: f64,
    /// Maximum ground distance for turn edges in meters.
    pub max_turn_distance: f64,
}

impl Default for SpatialEdgeConfig {
    fn default() -> Self {
        Self {
            max_step_distance: 20.0,
            max_turn_distance: 15.0,
        }
    }
}

/// Where the edges originate: the node's own pose.
#[derive(Debug, Clone)]
pub struct SpatialOrigin {
    /// Origin node key, excluded from candidates.
    pub key: NodeKey,
    /// Origin position.
    pub position: GeoPoint,
    /// Origin compass angle in degrees.
    pub ca: f64,
}

/// A neighbor considered for spatial edges.
///
/// Only full nodes qualify; the pose fields come from fill metadata.
#[derive(Debug, Clone)]
pub struct NeighborCandidate {
    /// Neighbor key.
    pub key: NodeKey,
    /// Neighbor position.
    pub position: GeoPoint,
    /// Neighbor compass angle in degrees.
    pub ca: f64,
    /// Whether the neighbor is a panorama.
    pub pano: bool,
}

/// Compute sequence edges for `key` from its cached sequence.
///
/// Returns Next/Prev edges to the adjacent keys of the sequence, or an
/// empty set when the key is absent from it.
pub fn compute_sequence_edges(key: &NodeKey, sequence: &[NodeKey]) -> EdgeSet {
    let mut edges = EdgeSet::empty();
    let Some(index) = sequence.iter().position(|k| k == key) else {
        return edges;
    };

    if index + 1 < sequence.len() {
        edges.offer(Edge {
            to: sequence[index + 1].clone(),
            direction: Direction::Next,
            distance: 0.0,
        });
    }
    if index > 0 {
        edges.offer(Edge {
            to: sequence[index - 1].clone(),
            direction: Direction::Prev,
            distance: 0.0,
        });
    }

    edges
}

/// Compute spatial edges from `origin` to the given neighbors.
///
/// Step edges bucket neighbors by the bearing towards them relative to
/// the origin's viewing direction; turn edges bucket nearby neighbors
/// by the difference between the two camera angles. Within a bucket
/// the nearest neighbor wins, key order breaking exact ties, so the
/// result is deterministic for a deterministic candidate order.
pub fn compute_spatial_edges(
    origin: &SpatialOrigin,
    neighbors: &[NeighborCandidate],
    config: &SpatialEdgeConfig,
) -> EdgeSet {
    let mut edges = EdgeSet::empty();

    for neighbor in neighbors {
        if neighbor.key == origin.key {
            continue;
        }

        let distance = coord::distance_meters(&origin.position, &neighbor.position);

        if distance <= config.max_step_distance {
            let bearing = coord::bearing_degrees(&origin.position, &neighbor.position);
            let relative = coord::normalize_angle(bearing - origin.ca);
            edges.offer(Edge {
                to: neighbor.key.clone(),
                direction: step_direction(relative),
                distance,
            });
        }

        if distance <= config.max_turn_distance {
            let delta = coord::normalize_angle(neighbor.ca - origin.ca);
            if let Some(direction) = turn_direction(delta) {
                edges.offer(Edge {
                    to: neighbor.key.clone(),
                    direction,
                    distance,
                });
            }
        }
    }

    edges
}

/// Step direction for a bearing relative to the viewing direction.
fn step_direction(relative: f64) -> Direction {
    if relative.abs() <= 45.0 {
        Direction::StepForward
    } else if relative.abs() >= 135.0 {
        Direction::StepBackward
    } else if relative > 0.0 {
        Direction::StepRight
    } else {
        Direction::StepLeft
    }
}

/// Turn direction for a camera-angle delta, if the delta is a turn.
fn turn_direction(delta: f64) -> Option<Direction> {
    let magnitude = delta.abs();
    if magnitude >= 135.0 {
        Some(Direction::TurnU)
    } else if magnitude >= 45.0 {
        Some(if delta > 0.0 {
            Direction::TurnRight
        } else {
            Direction::TurnLeft
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Roughly one meter of latitude in degrees.
    const LAT_METER: f64 = 1.0 / 111_195.0;

    fn origin() -> SpatialOrigin {
        SpatialOrigin {
            key: NodeKey::from("origin"),
            position: GeoPoint::new(52.0, 13.0),
            ca: 0.0,
        }
    }

    fn neighbor(key: &str, north_m: f64, east_m: f64, ca: f64) -> NeighborCandidate {
        let lat = 52.0 + north_m * LAT_METER;
        // Longitude degrees shrink with cos(lat).
        let lon = 13.0 + east_m * LAT_METER / 52.0_f64.to_radians().cos();
        NeighborCandidate {
            key: NodeKey::from(key),
            position: GeoPoint::new(lat, lon),
            ca,
            pano: false,
        }
    }

    #[test]
    fn test_sequence_edges_middle_of_sequence() {
        let seq: Vec<NodeKey> = ["a", "b", "c"].iter().map(|k| NodeKey::from(*k)).collect();
        let edges = compute_sequence_edges(&NodeKey::from("b"), &seq);

        assert_eq!(edges.get(Direction::Next).unwrap().to, NodeKey::from("c"));
        assert_eq!(edges.get(Direction::Prev).unwrap().to, NodeKey::from("a"));
    }

    #[test]
    fn test_sequence_edges_at_boundaries() {
        let seq: Vec<NodeKey> = ["a", "b"].iter().map(|k| NodeKey::from(*k)).collect();

        let first = compute_sequence_edges(&NodeKey::from("a"), &seq);
        assert!(first.get(Direction::Prev).is_none());
        assert_eq!(first.get(Direction::Next).unwrap().to, NodeKey::from("b"));

        let last = compute_sequence_edges(&NodeKey::from("b"), &seq);
        assert!(last.get(Direction::Next).is_none());
    }

    #[test]
    fn test_sequence_edges_key_not_in_sequence() {
        let seq: Vec<NodeKey> = vec![NodeKey::from("a")];
        let edges = compute_sequence_edges(&NodeKey::from("x"), &seq);
        assert!(edges.is_empty());
    }

    #[test]
    fn test_step_edges_cardinal_buckets() {
        let config = SpatialEdgeConfig::default();
        let neighbors = vec![
            neighbor("north", 10.0, 0.0, 0.0),
            neighbor("east", 0.0, 10.0, 0.0),
            neighbor("south", -10.0, 0.0, 0.0),
            neighbor("west", 0.0, -10.0, 0.0),
        ];

        let edges = compute_spatial_edges(&origin(), &neighbors, &config);

        assert_eq!(
            edges.get(Direction::StepForward).unwrap().to,
            NodeKey::from("north")
        );
        assert_eq!(
            edges.get(Direction::StepRight).unwrap().to,
            NodeKey::from("east")
        );
        assert_eq!(
            edges.get(Direction::StepBackward).unwrap().to,
            NodeKey::from("south")
        );
        assert_eq!(
            edges.get(Direction::StepLeft).unwrap().to,
            NodeKey::from("west")
        );
    }

    #[test]
    fn test_step_buckets_follow_viewing_direction() {
        let config = SpatialEdgeConfig::default();
        let mut o = origin();
        o.ca = 90.0; // looking east

        let neighbors = vec![neighbor("east", 0.0, 10.0, 90.0)];
        let edges = compute_spatial_edges(&o, &neighbors, &config);

        assert_eq!(
            edges.get(Direction::StepForward).unwrap().to,
            NodeKey::from("east")
        );
    }

    #[test]
    fn test_nearest_neighbor_wins_bucket() {
        let config = SpatialEdgeConfig::default();
        let neighbors = vec![
            neighbor("far", 15.0, 0.0, 0.0),
            neighbor("near", 5.0, 0.0, 0.0),
        ];

        let edges = compute_spatial_edges(&origin(), &neighbors, &config);
        assert_eq!(
            edges.get(Direction::StepForward).unwrap().to,
            NodeKey::from("near")
        );
    }

    #[test]
    fn test_neighbors_beyond_range_are_ignored() {
        let config = SpatialEdgeConfig::default();
        let neighbors = vec![neighbor("distant", 50.0, 0.0, 0.0)];

        let edges = compute_spatial_edges(&origin(), &neighbors, &config);
        assert!(edges.is_empty());
    }

    #[test]
    fn test_turn_edges_from_camera_angle_delta() {
        let config = SpatialEdgeConfig::default();
        let neighbors = vec![
            neighbor("right", 2.0, 0.0, 90.0),
            neighbor("left", 0.0, 2.0, -90.0),
            neighbor("around", -2.0, 0.0, 180.0),
        ];

        let edges = compute_spatial_edges(&origin(), &neighbors, &config);

        assert_eq!(
            edges.get(Direction::TurnRight).unwrap().to,
            NodeKey::from("right")
        );
        assert_eq!(
            edges.get(Direction::TurnLeft).unwrap().to,
            NodeKey::from("left")
        );
        assert_eq!(
            edges.get(Direction::TurnU).unwrap().to,
            NodeKey::from("around")
        );
    }

    #[test]
    fn test_origin_is_excluded_from_candidates() {
        let config = SpatialEdgeConfig::default();
        let mut same = neighbor("origin", 1.0, 0.0, 0.0);
        same.key = NodeKey::from("origin");

        let edges = compute_spatial_edges(&origin(), &[same], &config);
        assert!(edges.is_empty());
    }

    #[test]
    fn test_direction_families() {
        assert!(Direction::Next.is_sequence());
        assert!(Direction::Prev.is_sequence());
        assert!(Direction::StepForward.is_spatial());
        assert!(Direction::TurnU.is_spatial());
    }
}
