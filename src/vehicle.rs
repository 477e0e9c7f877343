use crate::geo::{self, GeoPos};
use crate::graph::{RoadEdgeId, RoadGraph, VertexId};
use crate::util::History;
use crate::VehicleId;
use rand::Rng;
use smallvec::SmallVec;

/// How many recently departed vertices to remember for loop avoidance.
const HISTORY_CAPACITY: usize = 8;

/// Consecutive non-fresh edge selections tolerated before picking a new goal.
const STUCK_LIMIT: u32 = 3;

/// Low-pass coefficient applied to the heading each update.
const HEADING_SMOOTHING: f64 = 0.15;

/// Speed reduction factor applied per too-close neighbour.
const SLOW_FACTOR: f64 = 0.8;

/// Bounds the number of edges a vehicle may cross in a single update.
const MAX_CARRY_HOPS: u32 = 32;

/// Movements smaller than this do not affect the heading.
const MIN_MOVE_DEG: f64 = 1e-10;

/// A candidate outgoing edge: handle, target vertex, length in m.
type Exit = (RoadEdgeId, VertexId, f64);

/// A simulated vehicle wandering the road graph.
///
/// A vehicle is always either standing at `current_vertex`
/// (when `edge_length == 0`) or somewhere along `current_edge`
/// (when `0 <= position_on_edge <= edge_length`).
pub struct Vehicle {
    id: VehicleId,
    start: VertexId,
    goal: VertexId,
    current_vertex: VertexId,
    previous_vertex: Option<VertexId>,
    current_edge: Option<RoadEdgeId>,
    next_vertex: VertexId,
    /// Cached length of the current edge in m; zero while at a vertex.
    edge_length: f64,
    /// Distance travelled along the current edge in m.
    position_on_edge: f64,
    speed: f64,
    transmission_range: f64,
    collision_radius: f64,
    current_heading: f64,
    target_heading: f64,
    recent_vertices: History<VertexId>,
    stuck_counter: u32,
    /// Set when no drivable goal exists anywhere; the vehicle stops reporting
    /// movement and parks at its current vertex.
    inert: bool,
}

impl Vehicle {
    pub(crate) fn new(
        id: VehicleId,
        start: VertexId,
        goal: VertexId,
        speed: f64,
        transmission_range: f64,
        collision_radius: f64,
    ) -> Self {
        Self {
            id,
            start,
            goal,
            current_vertex: start,
            previous_vertex: None,
            current_edge: None,
            next_vertex: start,
            edge_length: 0.0,
            position_on_edge: 0.0,
            speed,
            transmission_range,
            collision_radius,
            current_heading: 0.0,
            target_heading: 0.0,
            recent_vertices: History::new(HISTORY_CAPACITY),
            stuck_counter: 0,
            inert: false,
        }
    }

    /// Advances the vehicle by `speed * dt` metres along the road graph,
    /// crossing into successor edges as needed, and updates the heading.
    pub(crate) fn update(&mut self, graph: &RoadGraph, dt: f64, rng: &mut impl Rng) {
        if self.inert {
            return;
        }
        if self.current_vertex == self.goal {
            self.destination_reached();
            return;
        }
        if self.edge_length <= 0.0 {
            self.pick_next_edge(graph, rng);
            if self.inert {
                return;
            }
        }

        let before = self.position(graph);
        self.position_on_edge += self.speed * dt;
        let after = self.position(graph);
        self.update_heading(before, after);

        let mut hops = 0;
        while self.position_on_edge >= self.edge_length {
            hops += 1;
            if hops > MAX_CARRY_HOPS {
                self.position_on_edge = self.position_on_edge.min(self.edge_length);
                return;
            }
            let overshoot = self.position_on_edge - self.edge_length;
            self.previous_vertex = Some(self.current_vertex);
            self.current_vertex = self.next_vertex;
            if self.current_vertex == self.goal {
                self.destination_reached();
                return;
            }
            self.pick_next_edge(graph, rng);
            if self.inert {
                return;
            }
            self.position_on_edge = overshoot;
        }
    }

    /// Chooses the next edge to travel from `current_vertex`.
    ///
    /// Candidates are bucketed into fresh targets, recently visited targets
    /// and the immediate backtrack, and drawn uniformly from the best
    /// non-empty bucket. With no candidates at all the vehicle turns around,
    /// and after repeated failures it picks an entirely new goal.
    fn pick_next_edge(&mut self, graph: &RoadGraph, rng: &mut impl Rng) {
        let mut fresh: SmallVec<[Exit; 4]> = SmallVec::new();
        let mut revisits: SmallVec<[Exit; 4]> = SmallVec::new();
        let mut backtrack: Option<Exit> = None;

        for (edge, target, length) in graph.drivable_exits(self.current_vertex) {
            if Some(target) == self.previous_vertex {
                backtrack = Some((edge, target, length));
            } else if self.recent_vertices.contains(&target) {
                revisits.push((edge, target, length));
            } else {
                fresh.push((edge, target, length));
            }
        }

        let selected = if !fresh.is_empty() {
            self.stuck_counter = 0;
            fresh[rng.gen_range(0..fresh.len())]
        } else if !revisits.is_empty() {
            self.stuck_counter += 1;
            revisits[rng.gen_range(0..revisits.len())]
        } else if let Some(back) = backtrack {
            self.stuck_counter += 1;
            back
        } else {
            // Dead end. Turn around, and after repeated failures re-goal.
            self.stuck_counter += 1;
            if self.stuck_counter > STUCK_LIMIT {
                self.pick_new_goal(graph, rng);
                if self.inert {
                    return;
                }
            }
            std::mem::swap(&mut self.start, &mut self.goal);
            self.previous_vertex = Some(self.current_vertex);
            self.next_vertex = self.start;
            self.current_edge = None;
            self.edge_length = 0.0;
            self.position_on_edge = 0.0;
            self.recent_vertices.clear();
            return;
        };

        self.recent_vertices.push(self.current_vertex);
        let (edge, target, length) = selected;
        self.current_edge = Some(edge);
        self.previous_vertex = Some(self.current_vertex);
        self.next_vertex = target;
        self.edge_length = length;
        self.position_on_edge = 0.0;
    }

    /// Replaces the goal with a random drivable vertex.
    /// Marks the vehicle inert when the graph offers none.
    fn pick_new_goal(&mut self, graph: &RoadGraph, rng: &mut impl Rng) {
        let candidates = graph.drivable_vertices();
        if candidates.is_empty() {
            self.inert = true;
            self.current_edge = None;
            self.edge_length = 0.0;
            self.position_on_edge = 0.0;
            return;
        }
        self.goal = candidates[rng.gen_range(0..candidates.len())];
        self.stuck_counter = 0;
        self.recent_vertices.clear();
        log::trace!("vehicle {:?} re-goaled to {:?}", self.id, self.goal);
    }

    fn destination_reached(&mut self) {
        std::mem::swap(&mut self.start, &mut self.goal);
        self.current_edge = None;
        self.edge_length = 0.0;
        self.position_on_edge = 0.0;
    }

    fn update_heading(&mut self, before: GeoPos, after: GeoPos) {
        let d_lat = after.lat - before.lat;
        let d_lon = after.lon - before.lon;
        if d_lat.abs() <= MIN_MOVE_DEG && d_lon.abs() <= MIN_MOVE_DEG {
            return;
        }
        // 0° is north, rotating clockwise.
        self.target_heading = geo::normalize_heading(d_lon.atan2(d_lat).to_degrees());
        let diff = geo::heading_delta(self.target_heading, self.current_heading);
        self.current_heading =
            geo::normalize_heading(self.current_heading + HEADING_SMOOTHING * diff);
    }

    /// The vehicle's position, interpolated along the current edge.
    pub fn position(&self, graph: &RoadGraph) -> GeoPos {
        let edge = match self.current_edge {
            Some(edge) if self.edge_length > 0.0 => edge,
            _ => return graph.pos(self.current_vertex),
        };
        let (source, target) = graph.edge_endpoints(edge);
        let s = graph.pos(source);
        let t = graph.pos(target);
        let tparam = (self.position_on_edge / self.edge_length).clamp(0.0, 1.0);
        GeoPos::new(
            s.lat + tparam * (t.lat - s.lat),
            s.lon + tparam * (t.lon - s.lon),
        )
    }

    /// Multiplies the speed by the slow-down factor.
    /// Applied once per neighbour inside the collision radius.
    pub(crate) fn slow_down(&mut self) {
        self.speed *= SLOW_FACTOR;
    }

    pub fn id(&self) -> VehicleId {
        self.id
    }

    /// The smoothed heading in degrees, 0° = north, clockwise.
    pub fn heading(&self) -> f64 {
        self.current_heading
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub(crate) fn set_speed(&mut self, speed: f64) {
        self.speed = speed;
    }

    pub fn transmission_range(&self) -> f64 {
        self.transmission_range
    }

    pub(crate) fn set_transmission_range(&mut self, range: f64) {
        self.transmission_range = range;
    }

    pub fn collision_radius(&self) -> f64 {
        self.collision_radius
    }

    /// Distance travelled along the current edge in m.
    pub fn position_on_edge(&self) -> f64 {
        self.position_on_edge
    }

    /// Length of the current edge in m, or zero while at a vertex.
    pub fn edge_length(&self) -> f64 {
        self.edge_length
    }

    pub fn is_inert(&self) -> bool {
        self.inert
    }
}
