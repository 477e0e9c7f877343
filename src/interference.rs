//! The vehicle-to-vehicle interference graph and its builder.
//!
//! The builder is pure: it reads a snapshot of vehicle positions plus
//! optional cell metadata and produces a fresh graph, so it can run on a
//! worker thread while the simulation keeps moving vehicles.

use crate::geo;
use crate::spatial::{CellId, SpatialIndex};
use crate::VehicleId;
use itertools::Itertools;
use pathfinding::directed::bfs::bfs_reach;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

/// A tick-consistent copy of one vehicle's state, cheap to move across
/// threads.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub id: VehicleId,
    pub pos: geo::GeoPos,
    pub transmission_range_m: f64,
    /// The micro cell the vehicle was assigned to when the snapshot was
    /// taken, if the spatial index had one for it.
    pub micro_cell_id: Option<CellId>,
}

/// Cell metadata captured alongside a snapshot list.
///
/// Decouples the builder from the live spatial index: vehicle indices
/// refer to positions in the snapshot list, and the neighbour sets are
/// copied out of the index on the driver thread.
#[derive(Clone, Debug, Default)]
pub struct AntennaNeighborhood {
    /// Occupants per micro cell, as indices into the snapshot list.
    pub vehicles_per_cell: HashMap<CellId, Vec<usize>>,
    /// Neighbour cells per micro cell.
    pub cell_neighbors: HashMap<CellId, BTreeSet<CellId>>,
}

impl AntennaNeighborhood {
    /// Inverts a snapshot list into per-cell occupant indices and copies
    /// the index's neighbour sets.
    ///
    /// The cell-pruned pair walk is only sound when every vehicle sits
    /// within its cell's radius; k-means stragglers can violate that, so
    /// any out-of-cell vehicle (or one with no cell at all) yields `None`
    /// and the caller lets the builder compare every pair instead.
    pub fn capture(snapshots: &[VehicleSnapshot], index: &SpatialIndex) -> Option<Self> {
        let mut vehicles_per_cell: HashMap<CellId, Vec<usize>> = HashMap::new();
        for (i, snap) in snapshots.iter().enumerate() {
            let cell = snap.micro_cell_id?;
            let micro = index.micros().get(cell as usize)?;
            if geo::distance(snap.pos, micro.center) > micro.radius_m {
                log::debug!(
                    "vehicle {:?} is outside cell {}; disabling cell pruning this tick",
                    snap.id,
                    cell
                );
                return None;
            }
            vehicles_per_cell.entry(cell).or_default().push(i);
        }
        Some(Self {
            vehicles_per_cell,
            cell_neighbors: index.neighbor_map(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles_per_cell.is_empty()
    }
}

/// Counters describing one build.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct BuildStats {
    /// Distance comparisons performed.
    pub comparisons: usize,
    /// Average candidate neighbours considered per vehicle.
    pub avg_nearby: f64,
    /// Wall-clock build time in ms.
    pub build_time_ms: f64,
}

/// An undirected graph of vehicles within mutual transmission range,
/// with an optional transitive closure.
#[derive(Clone, Debug, Default)]
pub struct InterferenceGraph {
    adjacency: HashMap<VehicleId, HashSet<VehicleId>>,
    closure: HashMap<VehicleId, HashSet<VehicleId>>,
    stats: BuildStats,
}

impl InterferenceGraph {
    /// Builds the graph from a snapshot list.
    ///
    /// With usable cell metadata only pairs in the same or neighbouring
    /// cells are compared; otherwise every pair is compared. Either way a
    /// pair is linked iff its flat-projected distance is within both
    /// vehicles' transmission ranges, and each pair is considered exactly
    /// once.
    pub fn build(
        snapshots: &[VehicleSnapshot],
        antenna: Option<&AntennaNeighborhood>,
        compute_transitive: bool,
    ) -> Self {
        let started = Instant::now();
        let mut graph = Self::default();
        if snapshots.is_empty() {
            return graph;
        }

        for snap in snapshots {
            graph.adjacency.entry(snap.id).or_default();
        }

        // A vehicle without a cell would silently miss all its pairs in the
        // pruned walk, so any unassigned snapshot forces the exhaustive path.
        let all_assigned = snapshots.iter().all(|s| s.micro_cell_id.is_some());
        let mut comparisons = 0usize;
        match antenna {
            Some(info) if !info.is_empty() && all_assigned => {
                graph.build_pruned(snapshots, info, &mut comparisons);
            }
            _ => graph.build_all_pairs(snapshots, &mut comparisons),
        }

        if compute_transitive {
            graph.recompute_closure();
        }

        graph.stats = BuildStats {
            comparisons,
            avg_nearby: comparisons as f64 * 2.0 / snapshots.len() as f64,
            build_time_ms: started.elapsed().as_secs_f64() * 1000.0,
        };
        graph
    }

    /// Compares occupants within each cell, then across each cell pair
    /// (C, C') with C' a neighbour of C and C' > C so no pair repeats.
    fn build_pruned(
        &mut self,
        snapshots: &[VehicleSnapshot],
        info: &AntennaNeighborhood,
        comparisons: &mut usize,
    ) {
        for (&cell, indices) in &info.vehicles_per_cell {
            for (slot, &i) in indices.iter().enumerate() {
                let Some(a) = snapshots.get(i) else { continue };
                for &j in &indices[slot + 1..] {
                    let Some(b) = snapshots.get(j) else { continue };
                    *comparisons += 1;
                    self.link_if_mutual(a, b);
                }
            }

            let Some(neighbors) = info.cell_neighbors.get(&cell) else {
                continue;
            };
            for &other in neighbors {
                if other <= cell {
                    continue;
                }
                let Some(other_indices) = info.vehicles_per_cell.get(&other) else {
                    continue;
                };
                for &i in indices {
                    let Some(a) = snapshots.get(i) else { continue };
                    for &j in other_indices {
                        let Some(b) = snapshots.get(j) else { continue };
                        *comparisons += 1;
                        self.link_if_mutual(a, b);
                    }
                }
            }
        }
    }

    /// The exhaustive fallback, used when no usable cell metadata exists.
    fn build_all_pairs(&mut self, snapshots: &[VehicleSnapshot], comparisons: &mut usize) {
        for (a, b) in snapshots.iter().tuple_combinations() {
            *comparisons += 1;
            self.link_if_mutual(a, b);
        }
    }

    /// Links two vehicles when each lies within the other's range.
    /// The projected distance is measured from `a`, so the argument order
    /// must follow iteration order.
    fn link_if_mutual(&mut self, a: &VehicleSnapshot, b: &VehicleSnapshot) {
        let d = geo::plane_distance(a.pos, b.pos);
        if d <= a.transmission_range_m && d <= b.transmission_range_m {
            self.adjacency.entry(a.id).or_default().insert(b.id);
            self.adjacency.entry(b.id).or_default().insert(a.id);
        }
    }

    /// Recomputes the transitive closure of the current adjacency with one
    /// breadth-first traversal per vehicle. A vehicle is never a member of
    /// its own reachable set.
    pub fn recompute_closure(&mut self) {
        let adjacency = &self.adjacency;
        let mut closure = HashMap::with_capacity(adjacency.len());
        for &id in adjacency.keys() {
            let mut reachable: HashSet<VehicleId> = bfs_reach(id, |&v| {
                adjacency
                    .get(&v)
                    .into_iter()
                    .flatten()
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect();
            reachable.remove(&id);
            closure.insert(id, reachable);
        }
        self.closure = closure;
    }

    /// The vehicles directly within mutual range of the given vehicle.
    pub fn direct_neighbors(&self, vehicle: VehicleId) -> Option<&HashSet<VehicleId>> {
        self.adjacency.get(&vehicle)
    }

    /// The vehicles reachable over any number of hops, if the closure has
    /// been computed.
    pub fn reachable(&self, vehicle: VehicleId) -> Option<&HashSet<VehicleId>> {
        self.closure.get(&vehicle)
    }

    /// Whether two vehicles can communicate over any number of hops.
    /// Always false when the closure has not been computed.
    pub fn can_communicate(&self, a: VehicleId, b: VehicleId) -> bool {
        self.closure.get(&a).is_some_and(|set| set.contains(&b))
    }

    pub fn adjacency(&self) -> &HashMap<VehicleId, HashSet<VehicleId>> {
        &self.adjacency
    }

    pub fn closure(&self) -> &HashMap<VehicleId, HashSet<VehicleId>> {
        &self.closure
    }

    pub fn vehicle_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn stats(&self) -> &BuildStats {
        &self.stats
    }
}
