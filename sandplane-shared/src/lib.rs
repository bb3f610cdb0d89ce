//! Types shared between the Sandplane control plane and its collaborators.
//!
//! Holds the error taxonomy and the sandbox state table. Nothing in here
//! performs I/O.

pub mod constants;
pub mod errors;
pub mod states;

pub use errors::{SandplaneError, SandplaneResult};
pub use states::{SandboxState, StateAction, TransitionEffect};
