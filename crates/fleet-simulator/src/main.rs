//! Fleet Route Simulator CLI
//!
//! Runs one producer and a number of viewers against an in-process broker,
//! drives a randomly placed fleet to completion and reports whether every
//! viewer converged on the producer's final state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use fleet_domain::VehicleProfile;
use fleet_simulator::{
    HttpRecordStore, LogFormat, MemoryRecordStore, PlacementRequest, ProducerSlot, RecordStore,
    Role, SessionDeps, SessionHandle, SessionView, SimulatorConfig, TokioClock, WaypointCatalog,
    spawn_session,
};
use fleet_sync::{BrokerConfig, ConnectionState, LocalBroker};
use rand::Rng;
use tokio::time::{Instant, sleep, timeout};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const MODELS: [(&str, &str, &str); 4] = [
    ("Toyota", "Corolla", "car"),
    ("Suzuki", "Bolan", "van"),
    ("Honda", "CD 70", "motorcycle"),
    ("Hino", "Dutro", "truck"),
];

#[derive(Parser, Debug)]
#[command(name = "fleet-simulator")]
#[command(about = "Simulate a fleet travelling between waypoints")]
struct Args {
    /// Number of vehicles to place
    #[arg(short = 'n', long, default_value = "5")]
    vehicles: usize,

    /// Number of viewer sessions
    #[arg(long, default_value = "2")]
    viewers: usize,

    /// Playback speed multiplier
    #[arg(short, long, default_value = "10.0")]
    speed: f64,

    /// JSON waypoint catalog; built-in Islamabad set when omitted
    #[arg(short, long)]
    waypoints: Option<PathBuf>,

    /// Slowest vehicle speed in km/h
    #[arg(long, default_value = "30")]
    min_kmh: u32,

    /// Fastest vehicle speed in km/h
    #[arg(long, default_value = "80")]
    max_kmh: u32,

    /// Longest random initial delay in seconds
    #[arg(long, default_value = "5")]
    max_delay: u32,

    /// Give up after this many seconds
    #[arg(long, default_value = "1800")]
    timeout_secs: u64,

    /// Progress report interval in seconds
    #[arg(long, default_value = "5")]
    report_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let config = SimulatorConfig::from_env();
    init_tracing(&config);

    let args = Args::parse();
    if args.min_kmh == 0 || args.min_kmh > args.max_kmh {
        bail!("invalid speed range {}..={} km/h", args.min_kmh, args.max_kmh);
    }

    let catalog = match &args.waypoints {
        Some(path) => WaypointCatalog::from_json_file(path)
            .with_context(|| format!("loading waypoints from {}", path.display()))?,
        None => WaypointCatalog::islamabad(),
    };
    info!(waypoints = catalog.len(), "waypoint catalog loaded");

    let records: Arc<dyn RecordStore> = match &config.records_url {
        Some(url) => {
            info!(%url, "recording runs over HTTP");
            Arc::new(HttpRecordStore::new(url))
        }
        None => Arc::new(MemoryRecordStore::new()),
    };

    let broker = LocalBroker::new(BrokerConfig {
        heartbeat: config.heartbeat,
        ..BrokerConfig::default()
    });
    let deps = SessionDeps {
        transport: Arc::new(broker),
        slot: ProducerSlot::new(),
        catalog: Arc::new(catalog),
        clock: Arc::new(TokioClock::new()),
        records,
    };
    let simulation_id = Uuid::new_v4();
    let settings = config.session_settings(simulation_id);

    info!(
        %simulation_id,
        vehicles = args.vehicles,
        viewers = args.viewers,
        speed = args.speed,
        sync = config.sync_enabled,
        "starting fleet simulation"
    );

    let producer = spawn_session(Role::Producer, &settings, deps.clone());
    let viewers: Vec<SessionHandle> = (0..args.viewers)
        .map(|_| spawn_session(Role::Viewer, &settings, deps.clone()))
        .collect();

    if config.sync_enabled {
        wait_connected(&producer, config.connect_timeout).await;
        for viewer in &viewers {
            wait_connected(viewer, config.connect_timeout).await;
        }
    }

    let placed = place_fleet(&producer, &deps.catalog, &args).await;
    if placed == 0 {
        bail!("no vehicles could be placed");
    }

    producer.set_speed(args.speed).await?;
    producer.start().await?;

    let finished = run_to_completion(&producer, &args).await?;
    if !finished {
        warn!(timeout_secs = args.timeout_secs, "run did not complete in time, stopping");
        producer.stop().await?;
    }

    // let the final state reach every viewer
    sleep(Duration::from_secs(1)).await;
    let final_view = producer.view().await?;
    report_convergence(&final_view, &viewers).await;

    for viewer in viewers {
        viewer.shutdown().await;
    }
    producer.shutdown().await;

    info!("simulation complete");
    Ok(())
}

fn init_tracing(config: &SimulatorConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn wait_connected(session: &SessionHandle, limit: Duration) {
    let mut connection = session.connection();
    let connected = timeout(
        limit,
        connection.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await;

    if !matches!(connected, Ok(Ok(_))) {
        warn!(
            session_id = %session.context().session_id,
            "session not connected, continuing without it"
        );
    }
}

async fn place_fleet(producer: &SessionHandle, catalog: &WaypointCatalog, args: &Args) -> usize {
    let mut rng = rand::thread_rng();
    let mut placed = 0;

    for i in 0..args.vehicles {
        let Some((source, destination)) = catalog.random_pair(&mut rng) else {
            warn!("catalog needs at least two waypoints");
            break;
        };
        let (brand, model, vehicle_type) = MODELS[i % MODELS.len()];
        let request = PlacementRequest {
            profile: VehicleProfile {
                license_plate: format!("ICT-{:03}", rng.gen_range(100..1000)),
                model: model.to_string(),
                brand: brand.to_string(),
                vehicle_type: vehicle_type.to_string(),
            },
            source: source.id,
            destination: destination.id,
            speed_kmh: f64::from(rng.gen_range(args.min_kmh..=args.max_kmh)),
            initial_delay: rng.gen_range(0..=args.max_delay),
        };

        let plate = request.profile.license_plate.clone();
        match producer.place_vehicle(request).await {
            Ok(_) => {
                info!(%plate, from = %source.name, to = %destination.name, "vehicle placed");
                placed += 1;
            }
            Err(err) => warn!(%plate, %err, "vehicle not placed"),
        }
    }
    placed
}

/// Report progress until every vehicle has arrived. `false` on timeout.
async fn run_to_completion(producer: &SessionHandle, args: &Args) -> Result<bool> {
    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    let report_every = Duration::from_secs(args.report_secs.max(1));

    while Instant::now() < deadline {
        sleep(report_every).await;
        let view = producer.view().await?;

        info!(
            active = view.stats.active_vehicles,
            completed = view.stats.completed_journeys,
            total = view.stats.total_vehicles,
            "fleet progress"
        );
        for vehicle in &view.vehicles {
            if let Some(k) = &vehicle.kinematics {
                info!(
                    plate = vehicle.license_plate(),
                    state = ?vehicle.motion_state(),
                    progress = k.progress,
                    distance_km = k.distance_travelled,
                    label = %k.status_label,
                    "  vehicle"
                );
            }
        }

        if !view.is_running {
            return Ok(true);
        }
    }
    Ok(false)
}

async fn report_convergence(producer: &SessionView, viewers: &[SessionHandle]) {
    for viewer in viewers {
        let view = match viewer.view().await {
            Ok(view) => view,
            Err(err) => {
                warn!(%err, "viewer unavailable");
                continue;
            }
        };

        let matching = producer
            .vehicles
            .iter()
            .filter(|p| view.vehicles.iter().any(|v| v.id == p.id && v.position() == p.position()))
            .count();

        if matching == producer.vehicles.len() && view.vehicles.len() == matching {
            info!(
                session_id = %view.session_id,
                vehicles = matching,
                notifications = view.notifications.len(),
                "viewer converged"
            );
        } else {
            warn!(
                session_id = %view.session_id,
                matching,
                expected = producer.vehicles.len(),
                seen = view.vehicles.len(),
                connection = ?view.connection,
                "viewer diverged"
            );
        }
    }
}
