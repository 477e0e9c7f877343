//! The directed road network that vehicles travel on.
//!
//! The graph is built once from parsed map data and is immutable for the
//! lifetime of a simulation. One-way streets contribute a single directed
//! edge; two-way streets contribute a pair of anti-parallel edges.

use crate::geo::{self, GeoPos};
use petgraph::graph::{DiGraph, EdgeIndex, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};

/// Handle to a vertex of the road graph.
pub type VertexId = NodeIndex;

/// Handle to a directed edge of the road graph.
pub type RoadEdgeId = EdgeIndex;

/// The highway classification of a road segment.
///
/// Only the listed drivable classes are used for routing; everything else
/// (footways, cycleways, service roads and so on) maps to [`RoadClass::Other`]
/// and is kept in the graph but never traversed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoadClass {
    Motorway,
    Trunk,
    Primary,
    Secondary,
    Tertiary,
    MotorwayLink,
    TrunkLink,
    PrimaryLink,
    SecondaryLink,
    TertiaryLink,
    Unclassified,
    Road,
    Other,
}

impl RoadClass {
    /// Parses an OSM `highway` tag value.
    pub fn from_osm(tag: &str) -> Self {
        match tag {
            "motorway" => Self::Motorway,
            "trunk" => Self::Trunk,
            "primary" => Self::Primary,
            "secondary" => Self::Secondary,
            "tertiary" => Self::Tertiary,
            "motorway_link" => Self::MotorwayLink,
            "trunk_link" => Self::TrunkLink,
            "primary_link" => Self::PrimaryLink,
            "secondary_link" => Self::SecondaryLink,
            "tertiary_link" => Self::TertiaryLink,
            "unclassified" => Self::Unclassified,
            "road" => Self::Road,
            _ => Self::Other,
        }
    }

    /// Whether vehicles may drive on this class of road.
    pub fn is_drivable(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// The payload of a road-graph vertex.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VertexData {
    /// The source map node identifier.
    pub osm_id: i64,
    /// The vertex position.
    pub pos: GeoPos,
}

/// The payload of a directed road-graph edge.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EdgeData {
    /// The edge length in m.
    pub length_m: f64,
    /// The highway classification.
    pub class: RoadClass,
    /// Whether the underlying street is one-way.
    pub one_way: bool,
}

/// A directed, geographically embedded road network.
#[derive(Clone, Debug, Default)]
pub struct RoadGraph {
    graph: DiGraph<VertexData, EdgeData>,
}

impl RoadGraph {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a vertex at the given position.
    pub fn add_vertex(&mut self, osm_id: i64, lat: f64, lon: f64) -> VertexId {
        self.graph.add_node(VertexData {
            osm_id,
            pos: GeoPos::new(lat, lon),
        })
    }

    /// Adds a road between two vertices, computing its length from the
    /// vertex positions. Two-way roads produce a pair of anti-parallel
    /// edges; one-way roads a single edge from `from` to `to`.
    pub fn add_road(&mut self, from: VertexId, to: VertexId, class: RoadClass, one_way: bool) {
        let length_m = geo::distance(self.pos(from), self.pos(to));
        self.graph.add_edge(
            from,
            to,
            EdgeData {
                length_m,
                class,
                one_way,
            },
        );
        if !one_way {
            self.graph.add_edge(
                to,
                from,
                EdgeData {
                    length_m,
                    class,
                    one_way,
                },
            );
        }
    }

    /// Gets the position of a vertex.
    pub fn pos(&self, vertex: VertexId) -> GeoPos {
        self.graph[vertex].pos
    }

    /// Gets the payload of a vertex.
    pub fn vertex(&self, vertex: VertexId) -> &VertexData {
        &self.graph[vertex]
    }

    /// Gets the payload of an edge.
    pub fn edge(&self, edge: RoadEdgeId) -> &EdgeData {
        &self.graph[edge]
    }

    /// Gets the source and target vertices of an edge.
    pub fn edge_endpoints(&self, edge: RoadEdgeId) -> (VertexId, VertexId) {
        self.graph
            .edge_endpoints(edge)
            .expect("edge belongs to this graph")
    }

    /// Iterates over the drivable edges leaving a vertex,
    /// yielding the edge handle, its target vertex and its length.
    pub fn drivable_exits(
        &self,
        vertex: VertexId,
    ) -> impl Iterator<Item = (RoadEdgeId, VertexId, f64)> + '_ {
        self.graph
            .edges(vertex)
            .filter(|e| e.weight().class.is_drivable())
            .map(|e| (e.id(), e.target(), e.weight().length_m))
    }

    /// Whether the vertex has at least one drivable outgoing edge.
    pub fn has_drivable_exit(&self, vertex: VertexId) -> bool {
        self.drivable_exits(vertex).next().is_some()
    }

    /// All vertices with at least one drivable outgoing edge.
    /// These are the valid start and goal points for vehicles.
    pub fn drivable_vertices(&self) -> Vec<VertexId> {
        self.graph
            .node_indices()
            .filter(|v| self.has_drivable_exit(*v))
            .collect()
    }

    /// Finds the drivable vertex closest to a position, comparing squared
    /// offsets in degrees. Used to spawn vehicles near a clicked point.
    pub fn nearest_drivable_vertex(&self, pos: GeoPos) -> Option<VertexId> {
        self.graph
            .node_indices()
            .filter(|v| self.has_drivable_exit(*v))
            .min_by(|a, b| {
                let da = sq_degree_dist(self.pos(*a), pos);
                let db = sq_degree_dist(self.pos(*b), pos);
                da.total_cmp(&db)
            })
    }

    /// Iterates over all vertices.
    pub fn vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.graph.node_indices()
    }

    pub fn vertex_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }
}

fn sq_degree_dist(a: GeoPos, b: GeoPos) -> f64 {
    let d_lat = a.lat - b.lat;
    let d_lon = a.lon - b.lon;
    d_lat * d_lat + d_lon * d_lon
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn triangle() -> (RoadGraph, [VertexId; 3]) {
        let mut graph = RoadGraph::new();
        let a = graph.add_vertex(1, 48.5734, 7.7521);
        let b = graph.add_vertex(2, 48.5744, 7.7521);
        let c = graph.add_vertex(3, 48.5744, 7.7541);
        graph.add_road(a, b, RoadClass::Secondary, false);
        graph.add_road(b, c, RoadClass::Primary, true);
        graph.add_road(c, a, RoadClass::Other, false);
        (graph, [a, b, c])
    }

    #[test]
    fn two_way_roads_produce_edge_pairs() {
        let (graph, _) = triangle();
        // a<->b, b->c, c<->a
        assert_eq!(graph.edge_count(), 5);
    }

    #[test]
    fn edge_lengths_are_computed_from_positions() {
        let (graph, [a, b, _]) = triangle();
        let (edge, _, _) = graph.drivable_exits(a).next().unwrap();
        assert_approx_eq!(
            graph.edge(edge).length_m,
            geo::distance(graph.pos(a), graph.pos(b)),
            1e-9
        );
    }

    #[test]
    fn undrivable_classes_are_never_exits() {
        let (graph, [a, b, c]) = triangle();
        // c's only outgoing edges are the Other pair back to a.
        assert!(!graph.has_drivable_exit(c));
        assert!(graph.has_drivable_exit(a));
        assert!(graph.has_drivable_exit(b));
        assert_eq!(graph.drivable_vertices(), vec![a, b]);
    }

    #[test]
    fn nearest_drivable_vertex_skips_dead_ends() {
        let (graph, [_, b, c]) = triangle();
        // Query right on top of c, which has no drivable exit.
        let found = graph.nearest_drivable_vertex(graph.pos(c));
        assert_eq!(found, Some(b));
    }

    #[test]
    fn road_class_parsing() {
        assert_eq!(RoadClass::from_osm("motorway"), RoadClass::Motorway);
        assert_eq!(RoadClass::from_osm("tertiary_link"), RoadClass::TertiaryLink);
        assert_eq!(RoadClass::from_osm("footway"), RoadClass::Other);
        assert!(!RoadClass::from_osm("cycleway").is_drivable());
        assert!(RoadClass::from_osm("road").is_drivable());
    }
}
