//! # Session Runtime
//!
//! One tokio task per session. The task owns everything mutable about the
//! session and runs a single `select!` loop over three sources:
//!
//! - commands from the [`SessionHandle`] (mpsc, answered over oneshot)
//! - inbound sync messages from the channel [`Inbox`]
//! - ticks from the [`TickScheduler`]
//!
//! Handlers run one at a time, so message merges never race with ticks.
//! A producer session drives a [`MotionEngine`] and publishes; a viewer
//! session feeds a [`Reconciler`].

use std::sync::Arc;

use fleet_domain::{EpochMillis, RosterStats, Vehicle, VehicleProfile};
use fleet_sync::message::{Notification, PositionDelta, RunStarted, SpeedChange};
use fleet_sync::{
    ChannelConfig, ConnectionState, Destination, Inbound, Inbox, MessageHandler, Reconciler,
    SyncChannel, SyncMessage, Topic, Transport,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::catalog::WaypointCatalog;
use crate::clock::Clock;
use crate::error::{Result, SimError};
use crate::motion::MotionEngine;
use crate::records::{RecordStore, RunOutcome, SimulationRecord};
use crate::route;
use crate::scheduler::TickScheduler;
use crate::session::{ProducerLease, ProducerSlot, Role, SessionContext};

/// Pending commands per session
const COMMAND_BUFFER: usize = 64;

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// Per-session settings, derived from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub simulation_id: Uuid,
    pub max_vehicles: usize,
    pub snapshot_every_ticks: u64,
    pub channel: ChannelConfig,
}

/// Shared collaborators of every session of a simulation.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn Transport>,
    pub slot: ProducerSlot,
    pub catalog: Arc<WaypointCatalog>,
    pub clock: Arc<dyn Clock>,
    pub records: Arc<dyn RecordStore>,
}

/// A vehicle to place between two catalog waypoints.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub profile: VehicleProfile,
    pub source: Uuid,
    pub destination: Uuid,
    pub speed_kmh: f64,
    pub initial_delay: u32,
}

/// Read-only view of a session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub session_id: Uuid,
    pub role: Role,
    pub connection: ConnectionState,
    pub vehicles: Vec<Vehicle>,
    pub stats: RosterStats,
    pub is_running: bool,
    pub is_paused: bool,
    pub speed_multiplier: f64,
    /// Most recent first; viewers only.
    pub notifications: Vec<Notification>,
    pub last_update: Option<EpochMillis>,
}

/// Producer-only run controls.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Control {
    Clear,
    Start,
    Stop,
    Pause,
    Resume,
    SetSpeed(f64),
}

impl Control {
    const fn action(self) -> &'static str {
        match self {
            Self::Clear => "clear roster",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::SetSpeed(_) => "set speed",
        }
    }
}

enum Command {
    Place {
        request: PlacementRequest,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    Control {
        control: Control,
        reply: oneshot::Sender<Result<()>>,
    },
    View {
        reply: oneshot::Sender<SessionView>,
    },
}

// =============================================================================
// HANDLE
// =============================================================================

/// Client side of a running session.
pub struct SessionHandle {
    context: SessionContext,
    commands: mpsc::Sender<Command>,
    connection: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    #[must_use]
    pub const fn context(&self) -> &SessionContext {
        &self.context
    }

    #[must_use]
    pub const fn role(&self) -> Role {
        self.context.role
    }

    /// Connectivity indicator.
    #[must_use]
    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    /// Place a vehicle; returns its id.
    ///
    /// # Errors
    ///
    /// [`SimError::RoleViolation`] on a viewer, plus route, capacity and
    /// vehicle validation errors.
    pub async fn place_vehicle(&self, request: PlacementRequest) -> Result<Uuid> {
        self.context.require_producer("place vehicle")?;
        self.request(|reply| Command::Place { request, reply })
            .await?
    }

    /// # Errors
    ///
    /// [`SimError::RoleViolation`] on a viewer.
    pub async fn clear(&self) -> Result<()> {
        self.control(Control::Clear).await
    }

    /// # Errors
    ///
    /// [`SimError::RoleViolation`] on a viewer, [`SimError::EmptyRoster`]
    /// with nothing placed.
    pub async fn start(&self) -> Result<()> {
        self.control(Control::Start).await
    }

    /// # Errors
    ///
    /// [`SimError::RoleViolation`] on a viewer.
    pub async fn stop(&self) -> Result<()> {
        self.control(Control::Stop).await
    }

    /// # Errors
    ///
    /// [`SimError::RoleViolation`] on a viewer.
    pub async fn pause(&self) -> Result<()> {
        self.control(Control::Pause).await
    }

    /// # Errors
    ///
    /// [`SimError::RoleViolation`] on a viewer.
    pub async fn resume(&self) -> Result<()> {
        self.control(Control::Resume).await
    }

    /// # Errors
    ///
    /// [`SimError::RoleViolation`] on a viewer, [`SimError::InvalidSpeed`]
    /// for non-positive or non-finite multipliers.
    pub async fn set_speed(&self, multiplier: f64) -> Result<()> {
        self.control(Control::SetSpeed(multiplier)).await
    }

    /// # Errors
    ///
    /// [`SimError::SessionClosed`] once the session task has ended.
    pub async fn view(&self) -> Result<SessionView> {
        self.request(|reply| Command::View { reply }).await
    }

    /// Stop the session task and wait for it to finish.
    pub async fn shutdown(self) {
        let Self { commands, task, .. } = self;
        drop(commands);
        if let Err(err) = task.await {
            warn!(%err, "session task ended abnormally");
        }
    }

    async fn control(&self, control: Control) -> Result<()> {
        // rejected here, before anything reaches the session or the network
        self.context.require_producer(control.action())?;
        self.request(|reply| Command::Control { control, reply })
            .await?
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T> {
        let closed = || SimError::SessionClosed(self.context.session_id);
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| closed())?;
        response.await.map_err(|_| closed())
    }
}

/// Assign a role and spawn the session task.
pub fn spawn_session(
    requested: Role,
    settings: &SessionSettings,
    deps: SessionDeps,
) -> SessionHandle {
    let (context, lease) = SessionContext::assign(
        settings.simulation_id,
        requested,
        &deps.slot,
        settings.max_vehicles,
    );

    let (channel, inbox) = SyncChannel::new(deps.transport, settings.channel);
    let connection = channel.watch_state();
    let mode = match context.role {
        Role::Producer => Mode::Producer(MotionEngine::new(
            settings.max_vehicles,
            settings.snapshot_every_ticks,
        )),
        Role::Viewer => Mode::Viewer(Reconciler::new(settings.max_vehicles)),
    };

    let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
    let session = Session {
        context: context.clone(),
        lease,
        channel,
        inbox,
        mode,
        scheduler: TickScheduler::new(),
        clock: deps.clock,
        records: deps.records,
        catalog: deps.catalog,
        run: None,
    };
    let task = tokio::spawn(session.run(command_rx));

    SessionHandle {
        context,
        commands,
        connection,
        task,
    }
}

// =============================================================================
// SESSION TASK
// =============================================================================

enum Mode {
    Producer(MotionEngine),
    Viewer(Reconciler),
}

struct Session {
    context: SessionContext,
    lease: Option<ProducerLease>,
    channel: SyncChannel,
    inbox: Inbox,
    mode: Mode,
    scheduler: TickScheduler,
    clock: Arc<dyn Clock>,
    records: Arc<dyn RecordStore>,
    catalog: Arc<WaypointCatalog>,
    run: Option<SimulationRecord>,
}

impl Session {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let topics: &[Topic] = match self.mode {
            Mode::Producer(_) => &[Topic::Simulation],
            Mode::Viewer(_) => &Topic::ALL,
        };
        for &topic in topics {
            self.channel.subscribe(topic);
        }
        self.channel.connect();

        info!(
            session_id = %self.context.session_id,
            role = %self.context.role,
            "session started"
        );

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(inbound) = self.inbox.recv() => self.on_inbound(inbound),
                () = self.scheduler.next() => self.on_tick(),
            }
        }

        self.teardown();
    }

    fn on_command(&mut self, command: Command) {
        // a dropped reply receiver only means the caller stopped waiting
        match command {
            Command::Place { request, reply } => {
                let _ = reply.send(self.place(request));
            }
            Command::Control { control, reply } => {
                let _ = reply.send(self.control(control));
            }
            Command::View { reply } => {
                let _ = reply.send(self.view());
            }
        }
    }

    fn engine(&mut self, action: &'static str) -> Result<&mut MotionEngine> {
        match &mut self.mode {
            Mode::Producer(engine) => Ok(engine),
            Mode::Viewer(_) => Err(SimError::RoleViolation { action }),
        }
    }

    fn place(&mut self, request: PlacementRequest) -> Result<Uuid> {
        self.context.require_producer("place vehicle")?;

        let source = self.catalog.get(request.source)?.clone();
        let destination = self.catalog.get(request.destination)?.clone();
        let path = route::compose(&source, &destination, self.catalog.waypoints());
        let vehicle = Vehicle::new(
            request.profile,
            source,
            destination,
            request.speed_kmh,
            request.initial_delay,
            path.into_points(),
        )?;
        let id = vehicle.id;
        let plate = vehicle.license_plate().to_string();

        let engine = self.engine("place vehicle")?;
        engine.place(vehicle)?;
        let snapshot = engine.vehicles_snapshot();

        info!(%id, %plate, total = snapshot.vehicles.len(), "vehicle placed");
        self.publish(Destination::SimulationUpdate, SyncMessage::VehiclesUpdate(snapshot));
        Ok(id)
    }

    fn control(&mut self, control: Control) -> Result<()> {
        let action = control.action();
        self.context.require_producer(action)?;
        let now = self.clock.now_millis();

        match control {
            Control::Clear => {
                let engine = self.engine(action)?;
                let was_running = engine.has_run_state();
                engine.clear();
                let snapshot = engine.vehicles_snapshot();

                self.scheduler.cancel();
                if was_running {
                    self.finish_record(RunOutcome::Stopped, 0);
                    self.publish(Destination::SimulationUpdate, SyncMessage::SimulationStopped);
                }
                self.publish(Destination::SimulationUpdate, SyncMessage::VehiclesUpdate(snapshot));
            }
            Control::Start => {
                let engine = self.engine(action)?;
                if engine.roster().is_empty() {
                    return Err(SimError::EmptyRoster);
                }
                let completed = engine.roster().stats().completed_journeys;
                engine.start(now);
                let period = engine.tick_period();
                let started = RunStarted {
                    vehicles: engine.roster().vehicles().to_vec(),
                    speed_multiplier: engine.speed_multiplier(),
                };

                self.scheduler.start(period);
                // a restart closes the run it replaces
                self.finish_record(RunOutcome::Stopped, completed);
                self.begin_record(started.vehicles.len(), started.speed_multiplier);
                self.publish(
                    Destination::SimulationUpdate,
                    SyncMessage::SimulationStarted(started),
                );
            }
            Control::Stop => {
                let engine = self.engine(action)?;
                if !engine.has_run_state() {
                    debug!("stop ignored, nothing to reset");
                    return Ok(());
                }
                let completed = engine.roster().stats().completed_journeys;
                engine.stop();

                self.scheduler.cancel();
                self.finish_record(RunOutcome::Stopped, completed);
                self.publish(Destination::SimulationUpdate, SyncMessage::SimulationStopped);
            }
            Control::Pause => {
                if self.engine(action)?.pause(now) {
                    self.scheduler.cancel();
                    self.publish(Destination::SimulationUpdate, SyncMessage::SimulationPaused);
                }
            }
            Control::Resume => {
                let engine = self.engine(action)?;
                if engine.resume(now) {
                    let period = engine.tick_period();
                    self.scheduler.start(period);
                    self.publish(Destination::SimulationUpdate, SyncMessage::SimulationResumed);
                }
            }
            Control::SetSpeed(multiplier) => {
                let engine = self.engine(action)?;
                engine.set_speed_multiplier(multiplier, now)?;
                let period = engine.tick_period();
                let ticking = engine.is_running() && !engine.is_paused();

                // one scheduler per session: replace, never stack
                if ticking {
                    self.scheduler.start(period);
                }
                info!(multiplier, ?period, "playback speed changed");
                self.publish(
                    Destination::SimulationUpdate,
                    SyncMessage::SpeedChanged(SpeedChange {
                        speed_multiplier: multiplier,
                    }),
                );
            }
        }
        Ok(())
    }

    fn on_tick(&mut self) {
        let now = self.clock.now_millis();
        let Mode::Producer(engine) = &mut self.mode else {
            self.scheduler.cancel();
            return;
        };

        let report = engine.tick(now);
        let final_state = report.run_complete.then(|| engine.state_snapshot());
        let snapshot = (report.snapshot_due && !report.run_complete)
            .then(|| engine.vehicles_snapshot());

        trace!(tick = report.tick, deltas = report.deltas.len(), "tick");

        if !report.deltas.is_empty() {
            self.publish(
                Destination::LivePositionUpdate,
                SyncMessage::PositionDelta(PositionDelta {
                    vehicles: report.deltas,
                    stats: report.stats,
                    timestamp: now,
                }),
            );
        }
        for event in &report.events {
            self.publish(Destination::Notify, SyncMessage::Notification(event.notification()));
        }
        if let Some(snapshot) = snapshot {
            self.publish(Destination::SimulationUpdate, SyncMessage::VehiclesUpdate(snapshot));
        }
        if let Some(state) = final_state {
            self.scheduler.cancel();
            self.finish_record(RunOutcome::Completed, report.stats.completed_journeys);
            self.publish(Destination::SimulationUpdate, SyncMessage::CurrentState(state));
        }
    }

    fn on_inbound(&mut self, inbound: Inbound) {
        match &mut self.mode {
            Mode::Viewer(reconciler) => reconciler.handle(inbound.topic, inbound.envelope),
            Mode::Producer(engine) => match inbound.envelope.message {
                SyncMessage::StateRequest => {
                    let state = engine.state_snapshot();
                    debug!(vehicles = state.vehicles.len(), "answering state request");
                    self.publish(Destination::SimulationUpdate, SyncMessage::CurrentState(state));
                }
                other => trace!(kind = other.kind(), "producer ignores broadcast"),
            },
        }
    }

    fn view(&self) -> SessionView {
        let connection = self.channel.state();
        let (session_id, role) = (self.context.session_id, self.context.role);

        match &self.mode {
            Mode::Producer(engine) => SessionView {
                session_id,
                role,
                connection,
                vehicles: engine.roster().vehicles().to_vec(),
                stats: engine.roster().stats(),
                is_running: engine.is_running(),
                is_paused: engine.is_paused(),
                speed_multiplier: engine.speed_multiplier(),
                notifications: Vec::new(),
                last_update: None,
            },
            Mode::Viewer(reconciler) => SessionView {
                session_id,
                role,
                connection,
                vehicles: reconciler.roster().vehicles().to_vec(),
                stats: reconciler.roster().stats(),
                is_running: reconciler.is_running(),
                is_paused: reconciler.is_paused(),
                speed_multiplier: reconciler.speed_multiplier(),
                notifications: reconciler.notifications().cloned().collect(),
                last_update: reconciler.last_update(),
            },
        }
    }

    fn publish(&self, destination: Destination, message: SyncMessage) {
        if !self.channel.is_enabled() {
            return;
        }
        // failures are logged by the channel; nothing is queued
        let _ = self.channel.publish(destination, message);
    }

    fn begin_record(&mut self, vehicle_count: usize, speed_multiplier: f64) {
        let record = SimulationRecord::started(
            self.context.simulation_id,
            self.context.session_id,
            vehicle_count,
            speed_multiplier,
        );
        let store = self.records.clone();
        let started = record.clone();
        tokio::spawn(async move {
            if let Err(err) = store.record_started(&started).await {
                warn!(%err, run_id = %started.run_id, "failed to record run start");
            }
        });
        self.run = Some(record);
    }

    fn finish_record(&mut self, outcome: RunOutcome, completed_journeys: usize) {
        let Some(record) = self.run.take() else {
            return;
        };
        let record = record.finished(outcome, completed_journeys);
        let store = self.records.clone();
        tokio::spawn(async move {
            if let Err(err) = store.record_finished(&record).await {
                warn!(%err, run_id = %record.run_id, "failed to record run end");
            }
        });
    }

    fn teardown(&mut self) {
        self.scheduler.cancel();
        if self.run.is_some() {
            let completed = match &self.mode {
                Mode::Producer(engine) => engine.roster().stats().completed_journeys,
                Mode::Viewer(_) => 0,
            };
            self.finish_record(RunOutcome::Stopped, completed);
        }
        self.channel.disconnect();
        info!(
            session_id = %self.context.session_id,
            producer = self.lease.is_some(),
            "session closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, TokioClock};
    use crate::records::MemoryRecordStore;
    use fleet_domain::{MotionState, VehicleStatus, Waypoint};
    use fleet_sync::LocalBroker;
    use std::time::Duration;
    use tokio::time::sleep;

    struct Fixture {
        settings: SessionSettings,
        deps: SessionDeps,
        records: Arc<MemoryRecordStore>,
        broker: LocalBroker,
    }

    fn fixture() -> Fixture {
        let broker = LocalBroker::default();
        let records = Arc::new(MemoryRecordStore::new());
        let settings = SessionSettings {
            simulation_id: Uuid::new_v4(),
            max_vehicles: 3,
            snapshot_every_ticks: 10,
            channel: ChannelConfig::default(),
        };
        let deps = SessionDeps {
            transport: Arc::new(broker.clone()),
            slot: ProducerSlot::new(),
            catalog: Arc::new(WaypointCatalog::islamabad()),
            clock: Arc::new(TokioClock::new()),
            records: records.clone(),
        };
        Fixture {
            settings,
            deps,
            records,
            broker,
        }
    }

    impl Fixture {
        fn spawn(&self, role: Role) -> SessionHandle {
            spawn_session(role, &self.settings, self.deps.clone())
        }

        fn request(&self, plate: &str, from: &str, to: &str, delay: u32) -> PlacementRequest {
            let catalog = &self.deps.catalog;
            PlacementRequest {
                profile: VehicleProfile {
                    license_plate: plate.to_string(),
                    model: "Corolla".to_string(),
                    brand: "Toyota".to_string(),
                    vehicle_type: "car".to_string(),
                },
                source: catalog.find_by_name(from).unwrap().id,
                destination: catalog.find_by_name(to).unwrap().id,
                speed_kmh: 50.0,
                initial_delay: delay,
            }
        }
    }

    async fn connected(handle: &SessionHandle) {
        handle
            .connection()
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();
        // let subscriptions and the state request settle
        sleep(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_producer_is_demoted() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);
        let other = f.spawn(Role::Producer);

        assert_eq!(producer.role(), Role::Producer);
        assert_eq!(other.role(), Role::Viewer);

        producer.shutdown().await;
        assert_eq!(f.deps.slot.holder(), None);
        other.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_cannot_control_the_run() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);
        let viewer = f.spawn(Role::Viewer);
        connected(&producer).await;
        connected(&viewer).await;

        let request = f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0);
        assert!(matches!(
            viewer.place_vehicle(request).await,
            Err(SimError::RoleViolation { .. })
        ));
        assert!(matches!(viewer.start().await, Err(SimError::RoleViolation { .. })));
        assert!(matches!(
            viewer.set_speed(3.0).await,
            Err(SimError::RoleViolation { .. })
        ));

        sleep(Duration::from_secs(1)).await;
        let p = producer.view().await.unwrap();
        let v = viewer.view().await.unwrap();
        assert!(p.vehicles.is_empty());
        assert!(!p.is_running);
        assert!((p.speed_multiplier - 1.0).abs() < f64::EPSILON);
        assert!(v.vehicles.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_converges_on_completed_run() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);
        let viewer = f.spawn(Role::Viewer);
        connected(&producer).await;
        connected(&viewer).await;

        producer
            .place_vehicle(f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0))
            .await
            .unwrap();
        producer
            .place_vehicle(f.request("ICT-2", "Centaurus Mall", "Zero Point", 5))
            .await
            .unwrap();
        producer.set_speed(5.0).await.unwrap();
        producer.start().await.unwrap();

        sleep(Duration::from_secs(30)).await;
        let mid = viewer.view().await.unwrap();
        assert!(mid.is_running);
        assert!((mid.speed_multiplier - 5.0).abs() < f64::EPSILON);
        assert_eq!(mid.vehicles[0].motion_state(), MotionState::Moving);

        sleep(Duration::from_secs(60)).await;
        let p = producer.view().await.unwrap();
        let v = viewer.view().await.unwrap();

        assert!(!p.is_running);
        assert_eq!(p.stats.completed_journeys, 2);
        assert_eq!(v.vehicles, p.vehicles);
        assert!(!v.is_running);
        assert!(v.vehicles.iter().all(|x| x.status == VehicleStatus::Stopped));
        assert!(v.notifications.len() >= 3);

        sleep(Duration::from_millis(10)).await;
        assert_eq!(f.records.started().len(), 1);
        assert_eq!(f.records.finished()[0].outcome, Some(RunOutcome::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_joiner_resyncs_from_state_request() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);
        connected(&producer).await;

        producer
            .place_vehicle(f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0))
            .await
            .unwrap();
        producer.start().await.unwrap();
        sleep(Duration::from_secs(20)).await;
        producer.pause().await.unwrap();

        let viewer = f.spawn(Role::Viewer);
        connected(&viewer).await;

        let p = producer.view().await.unwrap();
        let v = viewer.view().await.unwrap();
        assert!(v.is_running);
        assert!(v.is_paused);
        assert_eq!(v.vehicles, p.vehicles);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_freezes_viewer_progress() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);
        let viewer = f.spawn(Role::Viewer);
        connected(&producer).await;
        connected(&viewer).await;

        producer
            .place_vehicle(f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0))
            .await
            .unwrap();
        producer.start().await.unwrap();
        sleep(Duration::from_secs(10)).await;
        producer.pause().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let progress = |view: &SessionView| {
            view.vehicles[0].kinematics.as_ref().map_or(0.0, |k| k.progress)
        };
        let frozen = progress(&viewer.view().await.unwrap());
        sleep(Duration::from_secs(30)).await;
        let v = viewer.view().await.unwrap();
        assert!(v.is_paused);
        assert!((progress(&v) - frozen).abs() < f64::EPSILON);

        producer.resume().await.unwrap();
        sleep(Duration::from_secs(5)).await;
        assert!(progress(&viewer.view().await.unwrap()) > frozen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_placement_errors() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);

        assert!(matches!(producer.start().await, Err(SimError::EmptyRoster)));

        let mut bad = f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0);
        bad.destination = Uuid::new_v4();
        assert!(matches!(
            producer.place_vehicle(bad).await,
            Err(SimError::Route(_))
        ));

        for i in 0..3 {
            producer
                .place_vehicle(f.request(&format!("ICT-{i}"), "Faisal Mosque", "G-9 Markaz", 0))
                .await
                .unwrap();
        }
        assert!(matches!(
            producer
                .place_vehicle(f.request("ICT-9", "Faisal Mosque", "G-9 Markaz", 0))
                .await,
            Err(SimError::Domain(_))
        ));
        assert!(matches!(
            producer.set_speed(0.0).await,
            Err(SimError::InvalidSpeed(_))
        ));
        assert_eq!(producer.view().await.unwrap().vehicles.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_resets_viewers() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);
        let viewer = f.spawn(Role::Viewer);
        connected(&producer).await;
        connected(&viewer).await;

        producer
            .place_vehicle(f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0))
            .await
            .unwrap();
        producer.start().await.unwrap();
        sleep(Duration::from_secs(5)).await;
        producer.stop().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        let v = viewer.view().await.unwrap();
        assert!(!v.is_running);
        assert_eq!(v.vehicles[0].motion_state(), MotionState::Idle);
        assert_eq!(f.records.finished()[0].outcome, Some(RunOutcome::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_after_completion_resets_everyone() {
        let mut f = fixture();
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        f.deps.clock = clock.clone();
        let producer = f.spawn(Role::Producer);
        let viewer = f.spawn(Role::Viewer);
        connected(&producer).await;
        connected(&viewer).await;

        producer
            .place_vehicle(f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0))
            .await
            .unwrap();
        producer.start().await.unwrap();
        clock.advance(Duration::from_secs(400));
        sleep(Duration::from_secs(1)).await;

        let done = viewer.view().await.unwrap();
        assert!(!done.is_running);
        assert_eq!(done.vehicles[0].motion_state(), MotionState::Stopped);

        producer.stop().await.unwrap();
        sleep(Duration::from_millis(100)).await;

        for view in [producer.view().await.unwrap(), viewer.view().await.unwrap()] {
            let v = &view.vehicles[0];
            assert_eq!(v.motion_state(), MotionState::Idle);
            assert!(v.kinematics.is_none());
            assert_eq!(
                v.current_waypoint.as_ref().map(Waypoint::point),
                Some(v.planned_path[0].point())
            );
        }
        let finished = f.records.finished();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].outcome, Some(RunOutcome::Completed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_closes_previous_record() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);

        producer
            .place_vehicle(f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0))
            .await
            .unwrap();
        producer.start().await.unwrap();
        sleep(Duration::from_secs(2)).await;
        producer.start().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let started = f.records.started();
        let finished = f.records.finished();
        assert_eq!(started.len(), 2);
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].run_id, started[0].run_id);
        assert_eq!(finished[0].outcome, Some(RunOutcome::Stopped));
        assert!(producer.view().await.unwrap().is_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_recovers_after_broker_restart() {
        let f = fixture();
        let producer = f.spawn(Role::Producer);
        let viewer = f.spawn(Role::Viewer);
        connected(&producer).await;
        connected(&viewer).await;

        producer
            .place_vehicle(f.request("ICT-1", "Faisal Mosque", "G-9 Markaz", 0))
            .await
            .unwrap();
        producer.start().await.unwrap();
        sleep(Duration::from_secs(5)).await;

        f.broker.drop_sessions();
        sleep(Duration::from_secs(5)).await;

        assert_eq!(
            *viewer.connection().borrow(),
            ConnectionState::Connected
        );
        let p = producer.view().await.unwrap();
        let v = viewer.view().await.unwrap();
        let (pk, vk) = (
            p.vehicles[0].kinematics.clone().unwrap(),
            v.vehicles[0].kinematics.clone().unwrap(),
        );
        assert!((pk.progress - vk.progress).abs() < 0.01);
    }
}
