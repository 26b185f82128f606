//! berth rollouts — dependency waves, incremental replacement, health gates.
//!
//! The controller converges one environment's live instances toward a set
//! of `ServiceSpec`s. Services are processed in dependency waves; inside a
//! wave they run concurrently. Updates replace instances one at a time
//! behind a health gate so a service never drops below `max(1, N-1)`
//! healthy instances.
//!
//! # Components
//!
//! - **`control_plane`** — the `ControlPlane` trait the controller drives
//! - **`plan`** — desired vs. observed diff (create, update, repair, scale, remove)
//! - **`health`** — consecutive-probe tracker and the health gate
//! - **`lock`** — per-environment exclusive locks with cancellation
//! - **`controller`** — `RolloutController` (rollout, rollback, cancel, status)
//! - **`report`** — per-service states and the rollout result
//! - **`traffic`** — the `TrafficPublisher` hand-off used before removals
//! - **`memory`** — in-memory control plane for tests and dry runs

pub mod control_plane;
pub mod controller;
pub mod error;
pub mod health;
pub mod lock;
pub mod memory;
pub mod plan;
pub mod report;
pub mod strategy;
pub mod traffic;

pub use control_plane::{ControlPlane, InstanceHealth, ObservedInstance};
pub use controller::RolloutController;
pub use error::{ControlPlaneError, ControlPlaneResult, RolloutError, ServiceFailure, TrafficError};
pub use lock::{EnvironmentGuard, EnvironmentLocks};
pub use memory::{ControlPlaneEvent, EventKind, MemoryControlPlane};
pub use plan::{PlanStep, RolloutPlan, StepAction};
pub use report::{RolloutOutcome, RolloutResult, ServiceReport, ServiceState};
pub use strategy::RolloutConfig;
pub use traffic::TrafficPublisher;
