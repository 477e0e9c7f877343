use std::sync::Arc;
use std::time::Instant;

use vanet_sim::{Command, Driver, Event, RoadClass, RoadGraph, SimulationParams};

/// Ticks to run before reporting.
const TICKS: usize = 200;

/// Builds a square two-way street grid with ~111 m blocks,
/// centred on Strasbourg.
fn grid_network(side: usize, spacing_deg: f64) -> RoadGraph {
    let mut graph = RoadGraph::new();
    let mut ids = Vec::with_capacity(side * side);
    for row in 0..side {
        for col in 0..side {
            ids.push(graph.add_vertex(
                (row * side + col) as i64,
                48.50 + row as f64 * spacing_deg,
                7.70 + col as f64 * spacing_deg,
            ));
        }
    }
    for row in 0..side {
        for col in 0..side {
            let i = row * side + col;
            if col + 1 < side {
                graph.add_road(ids[i], ids[i + 1], RoadClass::Secondary, false);
            }
            if row + 1 < side {
                graph.add_road(ids[i], ids[i + side], RoadClass::Secondary, false);
            }
        }
    }
    graph
}

fn main() {
    env_logger::init();

    let graph = Arc::new(grid_network(40, 0.001));
    println!(
        "Road network: {} vertices, {} edges",
        graph.vertex_count(),
        graph.edge_count()
    );

    for vehicles in [200, 1000, 3000] {
        let driver = Driver::spawn(Arc::clone(&graph), SimulationParams::default(), vehicles);
        let events = driver.events();
        driver.command(Command::EnableTransitiveClosure(true));
        driver.command(Command::Start {
            tick_interval_ms: 50,
        });

        let start = Instant::now();
        let mut ticked = 0usize;
        while ticked < TICKS {
            match events.recv() {
                Ok(Event::Ticked { .. }) => ticked += 1,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        let per_tick = start.elapsed() / TICKS as u32;

        let interference = driver.interference_graph();
        let stats = interference.stats();
        println!(
            "{} vehicles --> avg tick {:?}, adjacency over {} nodes",
            vehicles,
            per_tick,
            interference.vehicle_count(),
        );
        match serde_json::to_string(stats) {
            Ok(json) => println!("  last build: {json}"),
            Err(err) => eprintln!("  could not serialise stats: {err}"),
        }

        driver.shutdown();
    }
}
