//! Proxy-side read path: routing lookups, auto-resume and connection limits.
//!
//! Nothing in here takes the transition locks. The catalog may lag behind the
//! record store; the proxy tolerates that.

pub mod catalog;
pub mod flags;
pub mod limiter;
pub mod resolver;
pub mod router;

pub use catalog::{MemorySandboxCatalog, SandboxCatalog, SandboxInfo};
pub use flags::{FeatureFlags, StaticFeatureFlags};
pub use limiter::{ConnectionLimiter, ConnectionObserver, FixedLimit, LimitPolicy};
pub use resolver::{CatalogResolver, Resumer};
pub use router::{Admission, ConnectionGuard, ProxyRouter};
