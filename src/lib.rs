use slotmap::{new_key_type, SlotMap};

pub mod geo;
pub mod graph;

mod driver;
mod interference;
mod simulation;
mod spatial;
mod util;
mod vehicle;

pub use driver::{Command, Driver, Event};
pub use graph::{RoadClass, RoadGraph, VertexId};
pub use interference::{AntennaNeighborhood, BuildStats, InterferenceGraph, VehicleSnapshot};
pub use simulation::{Simulation, SimulationParams, VehiclePose, MIN_VEHICLES_FOR_INDEX};
pub use spatial::{CellId, MacroCell, MicroCell, SpatialIndex};
pub use vehicle::Vehicle;

new_key_type! {
    /// A stable identifier for a vehicle in the simulation.
    pub struct VehicleId;
}

type VehicleSet = SlotMap<VehicleId, Vehicle>;
