//! Sandbox records tracked by the control plane.

mod record;

pub use record::Sandbox;
pub use sandplane_shared::states::{SandboxState, StateAction, TransitionEffect};
