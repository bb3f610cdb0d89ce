//! Admission path for one inbound connection: resolve, then limit.

use std::sync::Arc;
use std::time::Instant;

use super::limiter::{ConnectionLimiter, ConnectionObserver, LimitPolicy};
use super::resolver::CatalogResolver;
use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// An admitted connection. Hold `guard` for as long as the connection is
/// proxied.
#[derive(Debug)]
pub struct Admission {
    pub node_ip: String,
    pub guard: ConnectionGuard,
}

/// Returns the connection slot when dropped.
pub struct ConnectionGuard {
    limiter: Arc<ConnectionLimiter>,
    observer: Option<Arc<dyn ConnectionObserver>>,
    sandbox_id: String,
    acquired_at: Instant,
}

impl ConnectionGuard {
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.limiter.release(&self.sandbox_id);
        if let Some(observer) = &self.observer {
            observer.on_released(&self.sandbox_id, self.acquired_at.elapsed());
        }
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("sandbox_id", &self.sandbox_id)
            .finish()
    }
}

#[derive(Clone)]
pub struct ProxyRouter {
    resolver: CatalogResolver,
    limiter: Arc<ConnectionLimiter>,
    policy: Arc<dyn LimitPolicy>,
    observer: Option<Arc<dyn ConnectionObserver>>,
}

impl ProxyRouter {
    pub fn new(
        resolver: CatalogResolver,
        limiter: Arc<ConnectionLimiter>,
        policy: Arc<dyn LimitPolicy>,
    ) -> Self {
        Self {
            resolver,
            limiter,
            policy,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn limiter(&self) -> &Arc<ConnectionLimiter> {
        &self.limiter
    }

    /// Resolve `sandbox_id` and take a connection slot for it.
    ///
    /// # Errors
    ///
    /// - Resolution errors from [`CatalogResolver::resolve`]
    /// - `TooManyConnections` when the sandbox is at its limit
    pub async fn admit(&self, sandbox_id: &str) -> SandplaneResult<Admission> {
        let node_ip = self.resolver.resolve(sandbox_id).await?;

        let limit = self.policy.max_connections(sandbox_id);
        let (count, acquired) = self.limiter.try_acquire(sandbox_id, limit);
        if !acquired {
            tracing::warn!(
                sandbox_id = %sandbox_id,
                connection_limit = limit,
                "Sandbox has too many incoming connections"
            );
            if let Some(observer) = &self.observer {
                observer.on_blocked(sandbox_id, limit);
            }
            return Err(SandplaneError::TooManyConnections {
                sandbox_id: sandbox_id.to_string(),
                limit,
            });
        }

        if let Some(observer) = &self.observer {
            observer.on_acquired(sandbox_id, count);
        }

        Ok(Admission {
            node_ip,
            guard: ConnectionGuard {
                limiter: Arc::clone(&self.limiter),
                observer: self.observer.clone(),
                sandbox_id: sandbox_id.to_string(),
                acquired_at: Instant::now(),
            },
        })
    }
}

impl std::fmt::Debug for ProxyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRouter")
            .field("resolver", &self.resolver)
            .finish()
    }
}
