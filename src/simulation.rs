use crate::geo::{self, GeoPos};
use crate::graph::RoadGraph;
use crate::interference::{AntennaNeighborhood, VehicleSnapshot};
use crate::spatial::SpatialIndex;
use crate::vehicle::Vehicle;
use crate::{VehicleId, VehicleSet};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Distribution;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Below this population the clustered index is not worth consulting and
/// the interference builder runs its exhaustive path.
pub const MIN_VEHICLES_FOR_INDEX: usize = 20;

/// Tunable simulation parameters with their interactive-UI defaults.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SimulationParams {
    /// Vehicle speed in m/s.
    pub vehicle_speed_mps: f64,
    /// Transmission range in m.
    pub transmission_range_m: f64,
    /// Distance below which vehicles brake for each other, in m.
    pub collision_radius_m: f64,
    /// Macro cell count for the spatial index.
    pub num_macro_cells: usize,
    /// Micro cells per macro cell.
    pub micros_per_macro: usize,
    /// Whether vehicles slow down near interference neighbours.
    pub collision_detection: bool,
    /// Whether builds also compute the transitive closure.
    pub compute_transitive: bool,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            vehicle_speed_mps: 14.0,
            transmission_range_m: 500.0,
            collision_radius_m: 5.0,
            num_macro_cells: 5,
            micros_per_macro: 20,
            collision_detection: true,
            compute_transitive: false,
        }
    }
}

/// A read-only view of one vehicle's pose, published to renderers.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VehiclePose {
    pub id: VehicleId,
    pub pos: GeoPos,
    pub heading_deg: f64,
}

/// The single-threaded heart of the simulation: the vehicle population,
/// the spatial index and every parameter mutation. The driver owns one of
/// these and is its only mutator.
pub struct Simulation {
    graph: Arc<RoadGraph>,
    vehicles: VehicleSet,
    /// Insertion order; population changes shrink from the tail.
    order: Vec<VehicleId>,
    spatial: Option<SpatialIndex>,
    params: SimulationParams,
    /// Adjacency of the last published interference graph, which feeds the
    /// collision slowdown.
    live_adjacency: HashMap<VehicleId, HashSet<VehicleId>>,
    rng: StdRng,
}

impl Simulation {
    pub fn new(graph: Arc<RoadGraph>, params: SimulationParams) -> Self {
        Self::seeded(graph, params, rand::random())
    }

    /// Creates a simulation with a fixed seed, for reproducible tests.
    pub fn seeded(graph: Arc<RoadGraph>, params: SimulationParams, seed: u64) -> Self {
        Self {
            graph,
            vehicles: VehicleSet::default(),
            order: Vec::new(),
            spatial: None,
            params,
            live_adjacency: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Advances every vehicle by `dt` seconds and reassigns the spatial
    /// index. A no-op when no vehicles exist.
    pub fn step(&mut self, dt: f64) {
        if self.vehicles.is_empty() {
            return;
        }

        if self.params.collision_detection && !self.live_adjacency.is_empty() {
            self.apply_collision_slowdowns();
        }

        let graph = Arc::clone(&self.graph);
        for &id in &self.order {
            self.vehicles[id].update(&graph, dt, &mut self.rng);
        }

        if self.spatial.is_some() {
            let positions = self.positions();
            if let Some(index) = self.spatial.as_mut() {
                index.assign_all(&positions);
            }
        }
    }

    /// Slows every vehicle once per interference neighbour inside its
    /// collision radius, using positions from the start of the tick.
    fn apply_collision_slowdowns(&mut self) {
        let graph = &self.graph;
        let positions: HashMap<VehicleId, GeoPos> = self
            .order
            .iter()
            .map(|&id| (id, self.vehicles[id].position(graph)))
            .collect();

        let mut crowded: Vec<(VehicleId, u32)> = Vec::new();
        for &id in &self.order {
            let Some(neighbors) = self.live_adjacency.get(&id) else {
                continue;
            };
            let Some(&pos) = positions.get(&id) else {
                continue;
            };
            let radius = self.vehicles[id].collision_radius();
            let count = neighbors
                .iter()
                .filter_map(|n| positions.get(n))
                .filter(|&&other| geo::distance(pos, other) <= radius)
                .count() as u32;
            if count > 0 {
                crowded.push((id, count));
            }
        }
        for (id, count) in crowded {
            for _ in 0..count {
                self.vehicles[id].slow_down();
            }
        }
    }

    /// Captures the per-vehicle value snapshots handed to the builder.
    pub fn snapshots(&self) -> Vec<VehicleSnapshot> {
        self.order
            .iter()
            .map(|&id| {
                let vehicle = &self.vehicles[id];
                VehicleSnapshot {
                    id,
                    pos: vehicle.position(&self.graph),
                    transmission_range_m: vehicle.transmission_range(),
                    micro_cell_id: self.spatial.as_ref().and_then(|s| s.micro_of(id)),
                }
            })
            .collect()
    }

    /// Captures the cell metadata matching a snapshot list, or `None`
    /// while the population is too small for the clustered index.
    pub fn antenna_neighborhood(
        &self,
        snapshots: &[VehicleSnapshot],
    ) -> Option<AntennaNeighborhood> {
        if self.vehicles.len() < MIN_VEHICLES_FOR_INDEX {
            return None;
        }
        let index = self.spatial.as_ref()?;
        AntennaNeighborhood::capture(snapshots, index)
    }

    /// Grows or shrinks the population to exactly `count` vehicles.
    /// New vehicles spawn at random drivable vertices; excess vehicles are
    /// removed from the tail.
    pub fn set_vehicle_count(&mut self, count: usize) {
        while self.order.len() > count {
            if let Some(id) = self.order.pop() {
                if let Some(index) = self.spatial.as_mut() {
                    index.remove(id);
                }
                self.vehicles.remove(id);
                self.live_adjacency.remove(&id);
            }
        }
        while self.order.len() < count {
            if self.spawn_random_vehicle().is_none() {
                log::warn!("no drivable vertices; cannot grow the population");
                break;
            }
        }
    }

    /// Spawns one vehicle with random drivable start and goal vertices.
    pub fn spawn_random_vehicle(&mut self) -> Option<VehicleId> {
        let candidates = self.graph.drivable_vertices();
        if candidates.is_empty() {
            return None;
        }
        let start = candidates[self.rng.gen_range(0..candidates.len())];
        let goal = candidates[self.rng.gen_range(0..candidates.len())];
        Some(self.insert_vehicle(start, goal))
    }

    /// Spawns one vehicle at the drivable vertex nearest the given
    /// position, with a random goal.
    pub fn spawn_vehicle_near(&mut self, pos: GeoPos) -> Option<VehicleId> {
        let start = self.graph.nearest_drivable_vertex(pos)?;
        let candidates = self.graph.drivable_vertices();
        let goal = candidates[self.rng.gen_range(0..candidates.len())];
        Some(self.insert_vehicle(start, goal))
    }

    fn insert_vehicle(
        &mut self,
        start: crate::graph::VertexId,
        goal: crate::graph::VertexId,
    ) -> VehicleId {
        let params = self.params;
        let id = self.vehicles.insert_with_key(|id| {
            Vehicle::new(
                id,
                start,
                goal,
                params.vehicle_speed_mps,
                params.transmission_range_m,
                params.collision_radius_m,
            )
        });
        self.order.push(id);
        if let Some(index) = self.spatial.as_mut() {
            index.assign(id, self.graph.pos(start));
        }
        id
    }

    /// Updates every vehicle's transmission range and refreshes the cell
    /// neighbour sets. The index part is a no-op until the index exists.
    pub fn set_transmission_range(&mut self, range: f64) {
        self.params.transmission_range_m = range;
        for (_, vehicle) in &mut self.vehicles {
            vehicle.set_transmission_range(range);
        }
        if let Some(index) = self.spatial.as_mut() {
            index.set_max_transmission_range(range);
        }
    }

    /// Updates every vehicle's speed.
    pub fn set_speed(&mut self, speed: f64) {
        self.params.vehicle_speed_mps = speed;
        for (_, vehicle) in &mut self.vehicles {
            vehicle.set_speed(speed);
        }
    }

    /// Randomly scales each vehicle's speed by a factor sampled from a
    /// normal distribution with mean 1 and the given standard deviation,
    /// clamped to [0.75, 1.25].
    pub fn randomise_speeds(&mut self, stddev: f64) {
        let Ok(distr) = rand_distr::Normal::new(1.0, stddev) else {
            return;
        };
        let base = self.params.vehicle_speed_mps;
        for (_, vehicle) in &mut self.vehicles {
            let factor: f64 = distr.sample(&mut self.rng).clamp(0.75, 1.25);
            vehicle.set_speed(base * factor);
        }
    }

    /// Rebuilds the spatial index with new cell counts. Zero counts select
    /// defaults scaled to the population. Does nothing while the
    /// population is below the index threshold.
    pub fn reconfigure_cells(&mut self, num_macro: usize, micros_per_macro: usize) {
        if self.vehicles.len() < MIN_VEHICLES_FOR_INDEX {
            log::info!(
                "not rebuilding spatial index for {} vehicles",
                self.vehicles.len()
            );
            return;
        }
        let num_macro = if num_macro == 0 {
            auto_macro_count(self.vehicles.len())
        } else {
            num_macro
        };
        let micros_per_macro = if micros_per_macro == 0 {
            auto_micro_count(self.vehicles.len())
        } else {
            micros_per_macro
        };
        self.params.num_macro_cells = num_macro;
        self.params.micros_per_macro = micros_per_macro;

        let positions = self.positions();
        self.spatial = Some(SpatialIndex::build(
            &positions,
            num_macro,
            micros_per_macro,
            self.params.transmission_range_m,
            &mut self.rng,
        ));
    }

    /// Builds the spatial index on first use, once the population is large
    /// enough. Later calls are no-ops.
    pub fn ensure_index(&mut self) {
        if self.spatial.is_some() || self.vehicles.len() < MIN_VEHICLES_FOR_INDEX {
            return;
        }
        let positions = self.positions();
        self.spatial = Some(SpatialIndex::build(
            &positions,
            self.params.num_macro_cells,
            self.params.micros_per_macro,
            self.params.transmission_range_m,
            &mut self.rng,
        ));
    }

    /// Feeds a freshly published adjacency back for collision avoidance.
    pub fn set_live_adjacency(&mut self, adjacency: HashMap<VehicleId, HashSet<VehicleId>>) {
        self.live_adjacency = adjacency;
    }

    pub fn set_collision_detection(&mut self, enabled: bool) {
        self.params.collision_detection = enabled;
    }

    pub fn set_compute_transitive(&mut self, enabled: bool) {
        self.params.compute_transitive = enabled;
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    /// Current `(id, position)` pairs in insertion order.
    pub fn positions(&self) -> Vec<(VehicleId, GeoPos)> {
        self.order
            .iter()
            .map(|&id| (id, self.vehicles[id].position(&self.graph)))
            .collect()
    }

    /// Current render poses in insertion order.
    pub fn poses(&self) -> Vec<VehiclePose> {
        self.order
            .iter()
            .map(|&id| {
                let vehicle = &self.vehicles[id];
                VehiclePose {
                    id,
                    pos: vehicle.position(&self.graph),
                    heading_deg: vehicle.heading(),
                }
            })
            .collect()
    }

    /// Returns an iterator over all the vehicles in the simulation.
    pub fn iter_vehicles(&self) -> impl Iterator<Item = &Vehicle> {
        self.order.iter().map(|id| &self.vehicles[*id])
    }

    /// Gets a reference to the vehicle with the given ID.
    pub fn get_vehicle(&self, vehicle_id: VehicleId) -> Option<&Vehicle> {
        self.vehicles.get(vehicle_id)
    }

    pub fn spatial_index(&self) -> Option<&SpatialIndex> {
        self.spatial.as_ref()
    }

    pub fn road_graph(&self) -> &Arc<RoadGraph> {
        &self.graph
    }
}

/// Default macro cell count for a population.
fn auto_macro_count(vehicles: usize) -> usize {
    match vehicles {
        0..=500 => 10,
        501..=2000 => 20,
        _ => 30,
    }
}

/// Default micro cells per macro for a population.
fn auto_micro_count(vehicles: usize) -> usize {
    match vehicles {
        0..=500 => 10,
        501..=2000 => 15,
        _ => 20,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::RoadClass;

    /// A 5x5 two-way street grid with ~111 m blocks.
    fn grid() -> Arc<RoadGraph> {
        let mut graph = RoadGraph::new();
        let mut ids = Vec::new();
        for row in 0..5 {
            for col in 0..5 {
                ids.push(graph.add_vertex(
                    (row * 5 + col) as i64,
                    48.57 + row as f64 * 0.001,
                    7.75 + col as f64 * 0.001,
                ));
            }
        }
        for row in 0..5 {
            for col in 0..5 {
                let i = row * 5 + col;
                if col + 1 < 5 {
                    graph.add_road(ids[i], ids[i + 1], RoadClass::Secondary, false);
                }
                if row + 1 < 5 {
                    graph.add_road(ids[i], ids[i + 5], RoadClass::Secondary, false);
                }
            }
        }
        Arc::new(graph)
    }

    #[test]
    fn population_tracks_the_requested_count() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 1);
        sim.set_vehicle_count(30);
        assert_eq!(sim.vehicle_count(), 30);
        sim.set_vehicle_count(12);
        assert_eq!(sim.vehicle_count(), 12);
        sim.set_vehicle_count(0);
        assert_eq!(sim.vehicle_count(), 0);
    }

    #[test]
    fn stepping_an_empty_simulation_is_a_no_op() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 1);
        sim.step(0.05);
        assert!(sim.snapshots().is_empty());
        assert!(sim.poses().is_empty());
    }

    #[test]
    fn index_waits_for_enough_vehicles() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 1);
        sim.set_vehicle_count(MIN_VEHICLES_FOR_INDEX - 1);
        sim.ensure_index();
        assert!(sim.spatial_index().is_none());

        sim.set_vehicle_count(MIN_VEHICLES_FOR_INDEX);
        sim.ensure_index();
        assert!(sim.spatial_index().is_some());
    }

    #[test]
    fn antenna_capture_needs_the_index() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 1);
        sim.set_vehicle_count(MIN_VEHICLES_FOR_INDEX);
        let snaps = sim.snapshots();
        // No index built yet, so there is no cell metadata to capture.
        assert!(sim.antenna_neighborhood(&snaps).is_none());
    }

    #[test]
    fn snapshots_carry_cells_after_index_build() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 2);
        sim.set_vehicle_count(25);
        sim.ensure_index();
        sim.step(0.05);
        for snap in sim.snapshots() {
            assert!(snap.micro_cell_id.is_some());
        }
    }

    #[test]
    fn zero_cell_counts_select_scaled_defaults() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 3);
        sim.set_vehicle_count(100);
        sim.reconfigure_cells(0, 0);
        assert_eq!(sim.params().num_macro_cells, 10);
        assert_eq!(sim.params().micros_per_macro, 10);
        // Duplicate starting positions can merge clusters, never add them.
        let macros = sim.spatial_index().unwrap().macros().len();
        assert!(macros >= 1 && macros <= 10);
    }

    #[test]
    fn transmission_range_reaches_every_vehicle() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 4);
        sim.set_vehicle_count(10);
        sim.set_transmission_range(123.0);
        for vehicle in sim.iter_vehicles() {
            assert_eq!(vehicle.transmission_range(), 123.0);
        }
    }

    #[test]
    fn randomised_speeds_stay_clamped() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 5);
        sim.set_vehicle_count(50);
        sim.randomise_speeds(0.5);
        let base = sim.params().vehicle_speed_mps;
        for vehicle in sim.iter_vehicles() {
            assert!(vehicle.speed() >= 0.75 * base - 1e-9);
            assert!(vehicle.speed() <= 1.25 * base + 1e-9);
        }
    }

    #[test]
    fn motion_preserves_edge_invariants() {
        let mut sim = Simulation::seeded(grid(), SimulationParams::default(), 6);
        sim.set_vehicle_count(40);
        sim.ensure_index();
        for _ in 0..200 {
            sim.step(0.05);
            for vehicle in sim.iter_vehicles() {
                assert!(vehicle.position_on_edge() >= 0.0);
                assert!(vehicle.position_on_edge() <= vehicle.edge_length());
                let h = vehicle.heading();
                assert!((0.0..360.0).contains(&h));
            }
        }
    }
}
