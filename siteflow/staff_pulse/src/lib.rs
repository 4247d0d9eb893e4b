#![deny(clippy::all, clippy::pedantic, clippy::nursery, rust_2018_idioms)]
#![warn(missing_docs)]

//! Staff task lifecycle and performance-flag engine.
//!
//! Tasks move through `Assigned -> Ongoing -> Completed -> Acknowledged`.
//! Every staff member carries a green/yellow/red flag recomputed from their
//! live task set, and management is alerted when a flag turns red.

/// Engine configuration loaded from TOML.
pub mod config;
/// Red-flag fan-out to oversight roles.
pub mod escalation;
/// Flag model and rule evaluator.
pub mod flags;
/// Task lifecycle controller and its side effects.
pub mod lifecycle;
/// Per-user and fleet monitors.
pub mod monitor;
/// Evaluate-and-persist step.
pub mod recompute;
/// Collaborator contracts and in-memory implementations.
pub mod store;
/// Task records.
pub mod task;
/// Structured logs and events.
pub mod telemetry;

pub use config::PulseConfig;
pub use escalation::{EscalationNotifier, EscalationReport};
pub use flags::{evaluate, Flag, FlagAssessment, FlagMetrics, FlagRecord, FlagRule, FlagRules};
pub use lifecycle::{
    ActorContext, EffectPolicy, EffectReport, LifecycleController, LifecycleError, SideEffect,
    TaskOutcome,
};
pub use monitor::{
    EscalationGate, FleetHandle, FleetMonitor, MonitorError, ResyncSummary, UserMonitor,
};
pub use recompute::{FlagRecomputer, RecomputeTrigger};
pub use store::{
    memory::MemoryBackend, Clock, Collaborators, ManualClock, StaffMember, StaffRole, StoreError,
    SystemClock,
};
pub use task::{NewTask, Task, TaskId, TaskStage, TaskStatus};
pub use telemetry::{PulseTelemetry, PulseTelemetryBuilder};
