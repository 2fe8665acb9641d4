//! # Session Roles
//!
//! Each simulation has at most one producer. The first session to claim the
//! [`ProducerSlot`] holds a [`ProducerLease`] until it shuts down; every other
//! session of that simulation is a viewer.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Result, SimError};

/// What a session may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns the roster and drives the simulation.
    Producer,
    /// Mirrors the producer.
    Viewer,
}

impl Role {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Producer => "producer",
            Self::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Producer claim for one simulation. Cheap to clone; clones share the claim.
#[derive(Debug, Clone, Default)]
pub struct ProducerSlot {
    holder: Arc<Mutex<Option<Uuid>>>,
}

impl ProducerSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the producer role for `session_id`. `None` if already taken.
    #[must_use]
    pub fn claim(&self, session_id: Uuid) -> Option<ProducerLease> {
        let mut holder = lock(&self.holder);
        if holder.is_some() {
            return None;
        }
        *holder = Some(session_id);
        Some(ProducerLease {
            holder: self.holder.clone(),
            session_id,
        })
    }

    /// Session currently holding the producer role.
    #[must_use]
    pub fn holder(&self) -> Option<Uuid> {
        *lock(&self.holder)
    }
}

/// Proof of the producer role. Released on drop.
#[derive(Debug)]
pub struct ProducerLease {
    holder: Arc<Mutex<Option<Uuid>>>,
    session_id: Uuid,
}

impl Drop for ProducerLease {
    fn drop(&mut self) {
        let mut holder = lock(&self.holder);
        if *holder == Some(self.session_id) {
            *holder = None;
            info!(session_id = %self.session_id, "producer role released");
        }
    }
}

fn lock(holder: &Mutex<Option<Uuid>>) -> MutexGuard<'_, Option<Uuid>> {
    holder.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity and limits of one session, fixed for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub simulation_id: Uuid,
    pub role: Role,
    pub max_vehicles: usize,
}

impl SessionContext {
    /// Assign a role. A producer request is demoted to viewer when the slot
    /// is already held.
    #[must_use]
    pub fn assign(
        simulation_id: Uuid,
        requested: Role,
        slot: &ProducerSlot,
        max_vehicles: usize,
    ) -> (Self, Option<ProducerLease>) {
        let session_id = Uuid::new_v4();
        let lease = match requested {
            Role::Producer => slot.claim(session_id),
            Role::Viewer => None,
        };

        let role = if lease.is_some() {
            Role::Producer
        } else {
            if requested == Role::Producer {
                warn!(
                    %session_id,
                    %simulation_id,
                    holder = ?slot.holder(),
                    "producer role taken, joining as viewer"
                );
            }
            Role::Viewer
        };

        info!(%session_id, %simulation_id, %role, "session role assigned");
        (
            Self {
                session_id,
                simulation_id,
                role,
                max_vehicles,
            },
            lease,
        )
    }

    #[must_use]
    pub fn is_producer(&self) -> bool {
        self.role == Role::Producer
    }

    /// Gate for producer-only actions.
    ///
    /// # Errors
    ///
    /// [`SimError::RoleViolation`] when this session is a viewer.
    pub fn require_producer(&self, action: &'static str) -> Result<()> {
        if self.is_producer() {
            Ok(())
        } else {
            warn!(session_id = %self.session_id, action, "viewer attempted producer action");
            Err(SimError::RoleViolation { action })
        }
    }
}
