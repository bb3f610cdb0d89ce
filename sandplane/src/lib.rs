//! Sandplane: lifecycle coordination for microVM sandboxes.
//!
//! The control plane tracks one record per running sandbox and makes every
//! state change (pause, kill, snapshot) exclusive across concurrent callers
//! and API processes. The proxy side resolves sandboxes to nodes and resumes
//! paused ones on demand.
//!
//! ```no_run
//! use sandplane::{ControlPlane, SandplaneOptions};
//!
//! # fn main() -> Result<(), sandplane::SandplaneError> {
//! let plane = ControlPlane::open(SandplaneOptions::default())?;
//! let router = plane.proxy_router(None);
//! # let _ = router;
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod proxy;
pub mod runtime;
pub mod sandbox;
pub mod store;
pub mod transition;

pub use logging::init_logging_for;
pub use metrics::{ControlPlaneMetrics, ProxyMetrics};
pub use orchestrator::{Orchestrator, SnapshotOptions, SnapshotResult};
pub use runtime::types::{SandboxID, SandboxKey, TeamID};
pub use runtime::{ControlPlane, SandplaneOptions};
pub use sandbox::{Sandbox, SandboxState, StateAction, TransitionEffect};
pub use sandplane_shared::errors::{SandplaneError, SandplaneResult};
pub use transition::{TransitionCoordinator, TransitionFinalizer, TransitionStart};
