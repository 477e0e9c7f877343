//! The owning driver thread of a running simulation.
//!
//! All vehicle mutation, parameter changes and result publication happen
//! on one thread, which multiplexes a command channel, the tick timer and
//! build results from a single background worker. Snapshots cross to the
//! worker as values and the finished graph moves back the same way, so no
//! locking is needed around the build itself.

use crate::geo::GeoPos;
use crate::graph::RoadGraph;
use crate::interference::{AntennaNeighborhood, InterferenceGraph, VehicleSnapshot};
use crate::simulation::{Simulation, SimulationParams, VehiclePose};
use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Commands accepted by the driver thread.
#[derive(Clone, Debug)]
pub enum Command {
    /// Begin ticking at the given interval.
    Start { tick_interval_ms: u64 },
    /// Halt the timer, wait for any in-flight build, then exit the thread.
    Stop,
    /// Stop the timer but keep all state.
    Pause,
    /// Restart the timer after a pause.
    Resume,
    TogglePause,
    /// Run a single tick by hand, typically while paused.
    StepOnce,
    /// Pause, remove every vehicle and clear the published graph.
    Reset,
    SetVehicleCount(usize),
    /// Spawn one vehicle at the drivable vertex nearest a position.
    SpawnVehicleNear { lat: f64, lon: f64 },
    /// Transmission range in m.
    SetTransmissionRange(f64),
    /// Vehicle speed in m/s.
    SetSpeed(f64),
    /// Simulated seconds per wall-clock second.
    SetSpeedMultiplier(f64),
    ReconfigureCells {
        num_macro: usize,
        micros_per_macro: usize,
    },
    EnableTransitiveClosure(bool),
    EnableCollisionDetection(bool),
}

/// Notifications sent to observers.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Started,
    Paused,
    Resumed,
    Stopped,
    VehicleCountChanged(usize),
    /// A tick completed; carries the simulated seconds just applied.
    Ticked { delta_seconds: f64 },
}

/// One unit of work for the build worker.
struct BuildJob {
    snapshots: Vec<VehicleSnapshot>,
    antenna: Option<AntennaNeighborhood>,
    compute_transitive: bool,
}

/// State shared with readers on other threads. Publication swaps the Arc
/// under a short-lived write lock; readers clone the Arc and go on.
#[derive(Default)]
struct SharedState {
    interference: RwLock<Arc<InterferenceGraph>>,
    poses: RwLock<Arc<Vec<VehiclePose>>>,
}

/// Handle to a running simulation driver.
///
/// Dropping the handle stops the driver and joins both threads.
pub struct Driver {
    cmd_tx: Sender<Command>,
    event_rx: Receiver<Event>,
    shared: Arc<SharedState>,
    driver_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl Driver {
    /// Spawns the driver and worker threads over the given road graph,
    /// with an initial vehicle population.
    pub fn spawn(graph: Arc<RoadGraph>, params: SimulationParams, vehicles: usize) -> Self {
        let (cmd_tx, cmd_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let (job_tx, job_rx) = unbounded::<BuildJob>();
        let (result_tx, result_rx) = unbounded::<InterferenceGraph>();
        let shared = Arc::new(SharedState::default());

        let worker_thread = std::thread::spawn(move || {
            while let Ok(job) = job_rx.recv() {
                let graph = InterferenceGraph::build(
                    &job.snapshots,
                    job.antenna.as_ref(),
                    job.compute_transitive,
                );
                if result_tx.send(graph).is_err() {
                    break;
                }
            }
        });

        let mut sim = Simulation::new(graph, params);
        sim.set_vehicle_count(vehicles);
        let state = Arc::clone(&shared);
        let driver_thread = std::thread::spawn(move || {
            DriverLoop {
                sim,
                shared: state,
                cmd_rx,
                event_tx,
                job_tx,
                result_rx,
                ticker: None,
                interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
                last_tick: Instant::now(),
                speed_multiplier: 1.0,
                running: false,
                paused: false,
                build_in_flight: false,
                deferred_cells: None,
            }
            .run();
        });

        Self {
            cmd_tx,
            event_rx,
            shared,
            driver_thread: Some(driver_thread),
            worker_thread: Some(worker_thread),
        }
    }

    /// Sends a command to the driver thread.
    pub fn command(&self, command: Command) {
        let _ = self.cmd_tx.send(command);
    }

    /// The observer event stream. Clones of the receiver compete for
    /// events, so give a single observer the stream.
    pub fn events(&self) -> Receiver<Event> {
        self.event_rx.clone()
    }

    /// The most recently published interference graph.
    pub fn interference_graph(&self) -> Arc<InterferenceGraph> {
        Arc::clone(&self.shared.interference.read().unwrap())
    }

    /// The most recently published vehicle poses.
    pub fn vehicles(&self) -> Arc<Vec<VehiclePose>> {
        Arc::clone(&self.shared.poses.read().unwrap())
    }

    /// Stops the driver, waits for any in-flight build and joins both
    /// threads.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        let _ = self.cmd_tx.send(Command::Stop);
        if let Some(handle) = self.driver_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

const DEFAULT_TICK_INTERVAL_MS: u64 = 50;

struct DriverLoop {
    sim: Simulation,
    shared: Arc<SharedState>,
    cmd_rx: Receiver<Command>,
    event_tx: Sender<Event>,
    job_tx: Sender<BuildJob>,
    result_rx: Receiver<InterferenceGraph>,
    /// Present while ticking; `None` while paused or stopped.
    ticker: Option<Receiver<Instant>>,
    interval: Duration,
    last_tick: Instant,
    speed_multiplier: f64,
    running: bool,
    paused: bool,
    build_in_flight: bool,
    /// A cell reconfiguration postponed until the in-flight build lands.
    deferred_cells: Option<(usize, usize)>,
}

/// What woke the driver loop up.
enum Wake {
    Command(Option<Command>),
    Timer,
    BuildDone(Option<InterferenceGraph>),
}

impl DriverLoop {
    fn run(mut self) {
        self.publish_poses();
        let idle = never::<Instant>();
        loop {
            let wake = {
                let timer = self.ticker.as_ref().unwrap_or(&idle);
                select! {
                    recv(self.cmd_rx) -> msg => Wake::Command(msg.ok()),
                    recv(timer) -> _ => Wake::Timer,
                    recv(self.result_rx) -> msg => Wake::BuildDone(msg.ok()),
                }
            };
            match wake {
                Wake::Command(Some(command)) => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
                // All handles dropped; shut down.
                Wake::Command(None) => {
                    self.drain_build();
                    break;
                }
                Wake::Timer => self.tick(),
                Wake::BuildDone(Some(graph)) => self.publish(graph),
                Wake::BuildDone(None) => {}
            }
        }
    }

    /// Handles one command; returns false when the loop should exit.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { tick_interval_ms } => {
                self.interval = Duration::from_millis(tick_interval_ms.max(1));
                self.sim.ensure_index();
                self.running = true;
                self.paused = false;
                self.last_tick = Instant::now();
                self.ticker = Some(tick(self.interval));
                self.emit(Event::Started);
            }
            Command::Stop => {
                self.running = false;
                self.ticker = None;
                self.drain_build();
                self.emit(Event::Stopped);
                return false;
            }
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::TogglePause => {
                if self.paused {
                    self.resume();
                } else {
                    self.pause();
                }
            }
            Command::StepOnce => self.tick(),
            Command::Reset => {
                self.pause();
                // A build dispatched before the reset must not resurface
                // stale vehicles afterwards.
                self.drain_build();
                self.sim.set_vehicle_count(0);
                *self.shared.interference.write().unwrap() = Arc::default();
                self.publish_poses();
                self.emit(Event::VehicleCountChanged(0));
            }
            Command::SetVehicleCount(count) => {
                self.sim.set_vehicle_count(count);
                self.publish_poses();
                self.emit(Event::VehicleCountChanged(self.sim.vehicle_count()));
            }
            Command::SpawnVehicleNear { lat, lon } => {
                if self.sim.spawn_vehicle_near(GeoPos::new(lat, lon)).is_some() {
                    self.publish_poses();
                    self.emit(Event::VehicleCountChanged(self.sim.vehicle_count()));
                }
            }
            Command::SetTransmissionRange(range) => self.sim.set_transmission_range(range),
            Command::SetSpeed(speed) => self.sim.set_speed(speed),
            Command::SetSpeedMultiplier(multiplier) => {
                self.speed_multiplier = multiplier.max(0.0);
            }
            Command::ReconfigureCells {
                num_macro,
                micros_per_macro,
            } => {
                // A build may be reading cell ids captured from the current
                // layout; rebuilding is deferred until it lands.
                if self.build_in_flight {
                    self.deferred_cells = Some((num_macro, micros_per_macro));
                } else {
                    self.sim.reconfigure_cells(num_macro, micros_per_macro);
                }
            }
            Command::EnableTransitiveClosure(enabled) => {
                self.sim.set_compute_transitive(enabled);
            }
            Command::EnableCollisionDetection(enabled) => {
                self.sim.set_collision_detection(enabled);
            }
        }
        true
    }

    fn pause(&mut self) {
        if self.running && !self.paused {
            self.paused = true;
            self.ticker = None;
            self.emit(Event::Paused);
        }
    }

    fn resume(&mut self) {
        if self.running && self.paused {
            self.paused = false;
            self.last_tick = Instant::now();
            self.ticker = Some(tick(self.interval));
            self.emit(Event::Resumed);
        }
    }

    /// One simulation tick: advance vehicles, publish poses and kick off
    /// the next interference build unless one is still running.
    fn tick(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_tick).as_secs_f64();
        self.last_tick = now;
        // Bound catch-up after stalls to two intervals.
        let delta = elapsed.min(2.0 * self.interval.as_secs_f64()) * self.speed_multiplier;

        self.sim.step(delta);
        self.publish_poses();

        if self.sim.vehicle_count() > 0 {
            if self.build_in_flight {
                log::debug!("interference build still running; skipping dispatch");
            } else {
                self.dispatch_build();
            }
        }

        self.emit(Event::Ticked {
            delta_seconds: delta,
        });
    }

    fn dispatch_build(&mut self) {
        let snapshots = self.sim.snapshots();
        if snapshots.is_empty() {
            return;
        }
        let antenna = self.sim.antenna_neighborhood(&snapshots);
        let job = BuildJob {
            snapshots,
            antenna,
            compute_transitive: self.sim.params().compute_transitive,
        };
        if self.job_tx.send(job).is_ok() {
            self.build_in_flight = true;
        }
    }

    /// Installs a finished build as the published graph and applies any
    /// deferred reconfiguration.
    fn publish(&mut self, graph: InterferenceGraph) {
        self.sim.set_live_adjacency(graph.adjacency().clone());
        *self.shared.interference.write().unwrap() = Arc::new(graph);
        self.build_in_flight = false;

        if let Some((num_macro, micros_per_macro)) = self.deferred_cells.take() {
            self.sim.reconfigure_cells(num_macro, micros_per_macro);
        }
    }

    fn publish_poses(&self) {
        *self.shared.poses.write().unwrap() = Arc::new(self.sim.poses());
    }

    /// Waits out an in-flight build so its result is never lost.
    fn drain_build(&mut self) {
        if self.build_in_flight {
            if let Ok(graph) = self.result_rx.recv() {
                self.publish(graph);
            }
            self.build_in_flight = false;
        }
    }

    fn emit(&self, event: Event) {
        let _ = self.event_tx.send(event);
    }
}
