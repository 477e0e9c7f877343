//! A two-level clustered partition of the simulation area.
//!
//! Macro cells are placed with a one-shot k-means over vehicle density;
//! each macro cell is subdivided into a near-regular lattice of micro
//! cells. Every micro cell carries a precomputed set of neighbouring
//! micro cells that could hold vehicles within transmission range, which
//! is what lets the interference builder skip most vehicle pairs.

use crate::geo::{self, GeoPos};
use crate::VehicleId;
use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};
use slotmap::SecondaryMap;
use std::collections::{BTreeSet, HashMap};

/// Identifier of a macro or micro cell. Stable until the next rebuild.
pub type CellId = u32;

/// Iteration cap for the k-means clustering.
const MAX_KMEANS_ITERS: usize = 30;

/// A k-means cluster of vehicle positions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MacroCell {
    pub id: CellId,
    pub center: GeoPos,
    /// Distance from the center to the farthest member at build time, in m.
    pub radius_m: f64,
    /// The micro cells subdividing this cluster.
    pub micro_ids: Vec<CellId>,
}

/// One lattice cell inside a macro cell.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MicroCell {
    pub id: CellId,
    pub macro_id: CellId,
    pub center: GeoPos,
    pub radius_m: f64,
    /// Micro cells whose occupants could be within transmission range
    /// of occupants of this cell. Excludes the cell itself.
    pub neighbor_ids: BTreeSet<CellId>,
    /// Current occupants.
    pub vehicle_ids: Vec<VehicleId>,
}

/// The spatial index over all vehicles.
///
/// Cell layout is fixed at build time; only the vehicle assignment
/// changes from tick to tick.
#[derive(Clone, Debug, Default)]
pub struct SpatialIndex {
    macros: Vec<MacroCell>,
    micros: Vec<MicroCell>,
    vehicle_to_micro: SecondaryMap<VehicleId, CellId>,
    max_transmission_range: f64,
}

impl SpatialIndex {
    /// Clusters the given vehicle positions and builds the cell hierarchy,
    /// then assigns every vehicle to its nearest micro cell.
    pub fn build(
        positions: &[(VehicleId, GeoPos)],
        num_macro: usize,
        micros_per_macro: usize,
        max_transmission_range: f64,
        rng: &mut impl Rng,
    ) -> Self {
        let points: Vec<GeoPos> = positions.iter().map(|(_, p)| *p).collect();
        let clusters = kmeans(&points, num_macro, rng);

        let mut macros = Vec::with_capacity(clusters.len());
        let mut micros = Vec::new();
        for (i, cluster) in clusters.iter().enumerate() {
            let macro_id = i as CellId;
            let micro_ids =
                place_micros(&mut micros, macro_id, cluster, &points, micros_per_macro);
            macros.push(MacroCell {
                id: macro_id,
                center: cluster.center,
                radius_m: cluster.radius,
                micro_ids,
            });
        }

        let mut index = Self {
            macros,
            micros,
            vehicle_to_micro: SecondaryMap::new(),
            max_transmission_range,
        };
        index.update_neighborhoods();
        index.assign_all(positions);
        log::info!(
            "spatial index built: {} macro cells, {} micro cells, range {:.0} m",
            index.macros.len(),
            index.micros.len(),
            max_transmission_range
        );
        index
    }

    /// Recomputes every micro cell's neighbour set from the current
    /// maximum transmission range.
    ///
    /// Two cells are neighbours when their centers lie within
    /// `radius_a + radius_b + max_range` of each other, which guarantees
    /// that any in-range vehicle pair lands in the same or neighbouring
    /// cells.
    pub fn update_neighborhoods(&mut self) {
        for micro in &mut self.micros {
            micro.neighbor_ids.clear();
        }
        for i in 0..self.micros.len() {
            for j in (i + 1)..self.micros.len() {
                let reach = self.micros[i].radius_m
                    + self.micros[j].radius_m
                    + self.max_transmission_range;
                if geo::distance(self.micros[i].center, self.micros[j].center) <= reach {
                    let (a, b) = (self.micros[i].id, self.micros[j].id);
                    self.micros[i].neighbor_ids.insert(b);
                    self.micros[j].neighbor_ids.insert(a);
                }
            }
        }
    }

    /// Updates the range used for neighbour computation and refreshes
    /// all neighbour sets.
    pub fn set_max_transmission_range(&mut self, range: f64) {
        self.max_transmission_range = range;
        self.update_neighborhoods();
    }

    pub fn max_transmission_range(&self) -> f64 {
        self.max_transmission_range
    }

    /// Assigns one vehicle to its nearest micro cell.
    pub fn assign(&mut self, vehicle: VehicleId, pos: GeoPos) -> Option<CellId> {
        let nearest = self.nearest_micro(pos)?;
        if let Some(&old) = self.vehicle_to_micro.get(vehicle) {
            if old == nearest {
                return Some(nearest);
            }
            self.micros[old as usize].vehicle_ids.retain(|v| *v != vehicle);
        }
        self.micros[nearest as usize].vehicle_ids.push(vehicle);
        self.vehicle_to_micro.insert(vehicle, nearest);
        Some(nearest)
    }

    /// Reassigns every vehicle in one sweep. Used once per tick.
    pub fn assign_all(&mut self, positions: &[(VehicleId, GeoPos)]) {
        for micro in &mut self.micros {
            micro.vehicle_ids.clear();
        }
        self.vehicle_to_micro.clear();
        for (vehicle, pos) in positions {
            if let Some(cell) = self.nearest_micro(*pos) {
                self.micros[cell as usize].vehicle_ids.push(*vehicle);
                self.vehicle_to_micro.insert(*vehicle, cell);
            }
        }
    }

    /// Drops a vehicle from the index.
    pub fn remove(&mut self, vehicle: VehicleId) {
        if let Some(cell) = self.vehicle_to_micro.remove(vehicle) {
            self.micros[cell as usize].vehicle_ids.retain(|v| *v != vehicle);
        }
    }

    /// The micro cell a vehicle is currently assigned to.
    pub fn micro_of(&self, vehicle: VehicleId) -> Option<CellId> {
        self.vehicle_to_micro.get(vehicle).copied()
    }

    /// All vehicles in the given vehicle's cell and its neighbouring cells.
    /// May include the queried vehicle itself; order is unspecified.
    pub fn nearby(&self, vehicle: VehicleId) -> Vec<VehicleId> {
        let Some(&cell) = self.vehicle_to_micro.get(vehicle) else {
            return Vec::new();
        };
        let home = &self.micros[cell as usize];
        let mut out = home.vehicle_ids.clone();
        for &neighbor in &home.neighbor_ids {
            out.extend_from_slice(&self.micros[neighbor as usize].vehicle_ids);
        }
        out
    }

    /// The neighbour sets of all micro cells, keyed by cell id.
    pub fn neighbor_map(&self) -> HashMap<CellId, BTreeSet<CellId>> {
        self.micros
            .iter()
            .map(|m| (m.id, m.neighbor_ids.clone()))
            .collect()
    }

    pub fn macros(&self) -> &[MacroCell] {
        &self.macros
    }

    pub fn micros(&self) -> &[MicroCell] {
        &self.micros
    }

    fn nearest_micro(&self, pos: GeoPos) -> Option<CellId> {
        self.micros
            .iter()
            .min_by(|a, b| {
                geo::distance(pos, a.center).total_cmp(&geo::distance(pos, b.center))
            })
            .map(|m| m.id)
    }
}

struct Cluster {
    center: GeoPos,
    radius: f64,
    members: Vec<usize>,
}

/// One-shot k-means over vehicle positions.
/// Dead clusters are re-seeded at the farthest outlier.
fn kmeans(points: &[GeoPos], k: usize, rng: &mut impl Rng) -> Vec<Cluster> {
    if points.is_empty() {
        return Vec::new();
    }
    let k = k.clamp(1, points.len());

    let mut centers: Vec<GeoPos> = rand::seq::index::sample(rng, points.len(), k)
        .into_iter()
        .map(|i| points[i])
        .collect();
    let mut assignment = vec![0usize; points.len()];

    for _ in 0..MAX_KMEANS_ITERS {
        let mut changed = false;
        for (pi, point) in points.iter().enumerate() {
            let nearest = nearest_center(*point, &centers);
            if assignment[pi] != nearest {
                assignment[pi] = nearest;
                changed = true;
            }
        }

        let mut sums = vec![(0.0, 0.0, 0usize); k];
        for (pi, point) in points.iter().enumerate() {
            let sum = &mut sums[assignment[pi]];
            sum.0 += point.lat;
            sum.1 += point.lon;
            sum.2 += 1;
        }
        for (ci, (lat, lon, count)) in sums.into_iter().enumerate() {
            if count > 0 {
                centers[ci] = GeoPos::new(lat / count as f64, lon / count as f64);
            } else if let Some(outlier) = farthest_outlier(points, &assignment, &centers) {
                centers[ci] = points[outlier];
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }

    let mut clusters: Vec<Cluster> = centers
        .into_iter()
        .map(|center| Cluster {
            center,
            radius: 0.0,
            members: Vec::new(),
        })
        .collect();
    for (pi, point) in points.iter().enumerate() {
        let cluster = &mut clusters[assignment[pi]];
        cluster.members.push(pi);
        cluster.radius = cluster.radius.max(geo::distance(*point, cluster.center));
    }
    clusters.retain(|c| !c.members.is_empty());
    clusters
}

fn nearest_center(point: GeoPos, centers: &[GeoPos]) -> usize {
    centers
        .iter()
        .enumerate()
        .min_by(|a, b| {
            geo::distance(point, *a.1).total_cmp(&geo::distance(point, *b.1))
        })
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn farthest_outlier(points: &[GeoPos], assignment: &[usize], centers: &[GeoPos]) -> Option<usize> {
    points
        .iter()
        .enumerate()
        .max_by(|a, b| {
            let da = geo::distance(*a.1, centers[assignment[a.0]]);
            let db = geo::distance(*b.1, centers[assignment[b.0]]);
            da.total_cmp(&db)
        })
        .map(|(i, _)| i)
}

/// Lays a `ceil(sqrt(n))` square lattice over the cluster's bounding
/// rectangle and keeps the `n` points nearest the cluster center.
fn place_micros(
    micros: &mut Vec<MicroCell>,
    macro_id: CellId,
    cluster: &Cluster,
    points: &[GeoPos],
    micros_per_macro: usize,
) -> Vec<CellId> {
    let side = (micros_per_macro as f64).sqrt().ceil().max(1.0) as usize;

    let (lat_min, lat_max) = cluster
        .members
        .iter()
        .map(|&i| points[i].lat)
        .minmax()
        .into_option()
        .unwrap_or((cluster.center.lat, cluster.center.lat));
    let (lon_min, lon_max) = cluster
        .members
        .iter()
        .map(|&i| points[i].lon)
        .minmax()
        .into_option()
        .unwrap_or((cluster.center.lon, cluster.center.lon));

    let mut candidates: Vec<GeoPos> = (0..side)
        .cartesian_product(0..side)
        .map(|(row, col)| {
            let fr = if side > 1 {
                row as f64 / (side - 1) as f64
            } else {
                0.5
            };
            let fc = if side > 1 {
                col as f64 / (side - 1) as f64
            } else {
                0.5
            };
            GeoPos::new(
                lat_min + fr * (lat_max - lat_min),
                lon_min + fc * (lon_max - lon_min),
            )
        })
        .collect();
    candidates.sort_by(|a, b| {
        geo::distance(*a, cluster.center).total_cmp(&geo::distance(*b, cluster.center))
    });
    candidates.truncate(micros_per_macro);

    let radius = cluster.radius / side as f64;
    let mut ids = Vec::with_capacity(candidates.len());
    for center in candidates {
        let id = micros.len() as CellId;
        micros.push(MicroCell {
            id,
            macro_id,
            center,
            radius_m: radius,
            neighbor_ids: BTreeSet::new(),
            vehicle_ids: Vec::new(),
        });
        ids.push(id);
    }
    ids
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use slotmap::SlotMap;

    fn mint_ids(n: usize) -> Vec<VehicleId> {
        let mut set: SlotMap<VehicleId, ()> = SlotMap::with_key();
        (0..n).map(|_| set.insert(())).collect()
    }

    /// Two tight blobs of vehicles roughly 11 km apart.
    fn two_blobs() -> Vec<(VehicleId, GeoPos)> {
        let ids = mint_ids(20);
        let mut out = Vec::new();
        for (i, id) in ids.iter().enumerate() {
            let jitter = (i % 5) as f64 * 1e-4;
            let pos = if i < 10 {
                GeoPos::new(48.50 + jitter, 7.70 + jitter)
            } else {
                GeoPos::new(48.60 + jitter, 7.70 + jitter)
            };
            out.push((*id, pos));
        }
        out
    }

    #[test]
    fn kmeans_separates_distant_blobs() {
        let positions = two_blobs();
        let mut rng = StdRng::seed_from_u64(42);
        let index = SpatialIndex::build(&positions, 2, 4, 500.0, &mut rng);

        assert_eq!(index.macros().len(), 2);
        // Each macro radius is far smaller than the blob separation.
        for macro_cell in index.macros() {
            assert!(macro_cell.radius_m < 1_000.0);
        }
    }

    #[test]
    fn micro_count_honours_the_request() {
        let positions = two_blobs();
        let mut rng = StdRng::seed_from_u64(42);
        let index = SpatialIndex::build(&positions, 2, 4, 500.0, &mut rng);
        for macro_cell in index.macros() {
            assert_eq!(macro_cell.micro_ids.len(), 4);
        }
        assert_eq!(index.micros().len(), 8);
    }

    #[test]
    fn every_vehicle_gets_a_cell() {
        let positions = two_blobs();
        let mut rng = StdRng::seed_from_u64(42);
        let index = SpatialIndex::build(&positions, 2, 4, 500.0, &mut rng);
        for (vehicle, _) in &positions {
            assert!(index.micro_of(*vehicle).is_some());
        }
        let occupants: usize = index.micros().iter().map(|m| m.vehicle_ids.len()).sum();
        assert_eq!(occupants, positions.len());
    }

    #[test]
    fn distant_blobs_are_not_neighbours_at_short_range() {
        let positions = two_blobs();
        let mut rng = StdRng::seed_from_u64(42);
        let index = SpatialIndex::build(&positions, 2, 4, 500.0, &mut rng);

        // Cells of different macros are ~11 km apart; with a 500 m range
        // and sub-km radii they can never be neighbours.
        for micro in index.micros() {
            for &n in &micro.neighbor_ids {
                assert_eq!(index.micros()[n as usize].macro_id, micro.macro_id);
            }
        }
    }

    #[test]
    fn widening_the_range_adds_neighbours() {
        let positions = two_blobs();
        let mut rng = StdRng::seed_from_u64(42);
        let mut index = SpatialIndex::build(&positions, 2, 4, 500.0, &mut rng);

        let before: usize = index.micros().iter().map(|m| m.neighbor_ids.len()).sum();
        index.set_max_transmission_range(20_000.0);
        let after: usize = index.micros().iter().map(|m| m.neighbor_ids.len()).sum();
        assert!(after > before);
        // At 20 km everything neighbours everything else.
        let n = index.micros().len();
        assert_eq!(after, n * (n - 1));
    }

    #[test]
    fn nearby_includes_co_located_vehicles() {
        let positions = two_blobs();
        let mut rng = StdRng::seed_from_u64(42);
        let index = SpatialIndex::build(&positions, 2, 4, 500.0, &mut rng);

        let (first, _) = positions[0];
        let nearby = index.nearby(first);
        // All ten vehicles of the first blob share a cell neighbourhood.
        for (vehicle, pos) in &positions[..10] {
            assert!(
                nearby.contains(vehicle),
                "missing {vehicle:?} at {pos:?} in nearby set"
            );
        }
    }

    #[test]
    fn remove_clears_the_assignment() {
        let positions = two_blobs();
        let mut rng = StdRng::seed_from_u64(42);
        let mut index = SpatialIndex::build(&positions, 2, 4, 500.0, &mut rng);

        let (victim, _) = positions[3];
        index.remove(victim);
        assert!(index.micro_of(victim).is_none());
        for micro in index.micros() {
            assert!(!micro.vehicle_ids.contains(&victim));
        }
    }

    #[test]
    fn assign_moves_a_vehicle_between_cells() {
        let positions = two_blobs();
        let mut rng = StdRng::seed_from_u64(42);
        let mut index = SpatialIndex::build(&positions, 2, 4, 500.0, &mut rng);

        let (vehicle, _) = positions[0];
        let old = index.micro_of(vehicle).unwrap();
        // Jump to the other blob.
        let new = index.assign(vehicle, GeoPos::new(48.60, 7.70)).unwrap();
        assert_ne!(old, new);
        assert!(!index.micros()[old as usize].vehicle_ids.contains(&vehicle));
        assert!(index.micros()[new as usize].vehicle_ids.contains(&vehicle));
    }
}
