//! Live per-user flag monitors and the fleet that owns them.

/// Fleet of per-user monitors plus the periodic resync.
pub mod fleet;
/// One staff member's live monitor.
pub mod user;

use thiserror::Error;

pub use fleet::{FleetHandle, FleetMonitor, FleetMonitorBuilder, ResyncSummary};
pub use user::UserMonitor;

use crate::{flags::Flag, store::StoreError, task::UserId};

/// Failure to bring a monitor up.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MonitorError {
    /// Seeding or subscribing for one user failed.
    #[error("cannot start monitor for {user_id}: {source}")]
    Start {
        /// Monitored user.
        user_id: UserId,
        /// Store failure.
        #[source]
        source: StoreError,
    },
    /// The staff roster could not be read.
    #[error("cannot list staff: {0}")]
    Roster(#[source] StoreError),
}

/// Decides when a recomputed flag is a fresh transition into red.
///
/// Holds the last flag this monitor produced. It reads the store only once,
/// when seeded at (re)start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EscalationGate {
    last: Option<Flag>,
}

impl EscalationGate {
    /// Starts from a previously persisted flag.
    #[must_use]
    pub const fn seeded(last: Option<Flag>) -> Self {
        Self { last }
    }

    /// Records `flag`; `true` when it enters red from anything else.
    pub fn observe(&mut self, flag: Flag) -> bool {
        let fires = flag == Flag::Red && self.last != Some(Flag::Red);
        self.last = Some(flag);
        fires
    }

    /// Last observed flag.
    #[must_use]
    pub const fn last(&self) -> Option<Flag> {
        self.last
    }
}
