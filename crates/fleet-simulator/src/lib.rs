//! # Fleet Route Simulator
//!
//! Real-time simulation of vehicles travelling between fixed waypoints, with
//! one producer session driving the simulation and any number of viewer
//! sessions mirroring it over a publish/subscribe channel.
//!
//! ## Features
//!
//! - Route composition with on-the-way stops and interpolated points
//! - Time-based motion with initial delays, pause/resume and playback speed
//! - Producer/viewer role arbitration per simulation
//! - Late-joiner resynchronization and reconnect with backoff
//! - Best-effort run records to an HTTP record service

pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod motion;
pub mod records;
pub mod route;
pub mod runtime;
pub mod scheduler;
pub mod session;

pub use catalog::WaypointCatalog;
pub use clock::{Clock, ManualClock, TokioClock};
pub use config::{LogFormat, SimulatorConfig};
pub use error::{Result, RouteError, SimError};
pub use motion::{MotionEngine, MotionEvent, TickReport};
pub use records::{HttpRecordStore, MemoryRecordStore, RecordStore, SimulationRecord};
pub use route::{PlannedPath, compose};
pub use runtime::{
    PlacementRequest, SessionDeps, SessionHandle, SessionSettings, SessionView, spawn_session,
};
pub use scheduler::TickScheduler;
pub use session::{ProducerLease, ProducerSlot, Role, SessionContext};
