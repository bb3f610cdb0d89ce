//! Transition coordination.
//!
//! A transition moves a sandbox record to a new state on behalf of one
//! caller. The protocol:
//!
//! 1. Take the sandbox lock, read the record and the in-flight descriptor
//! 2. If another transition is in flight, drop the lock and wait for it
//! 3. Validate against the state table, then write the new state, the
//!    descriptor and an empty result slot in one store operation
//! 4. Drop the lock and hand the caller a [`TransitionFinalizer`]
//!
//! Finishing publishes the result for waiters and clears the descriptor.

mod coordinator;
mod finalizer;
mod lock;
mod wait;

pub use coordinator::{TransitionCoordinator, TransitionStart};
pub use finalizer::TransitionFinalizer;
pub use lock::{DistributedLock, LockService};
