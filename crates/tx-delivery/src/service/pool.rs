//! # Connection Resource
//!
//! Bounded pool of broker connections shared by every session.
//!
//! ## Invariants
//!
//! | Invariant | Enforcement |
//! |-----------|-------------|
//! | Open connections ≤ `max_connections` | one semaphore permit per checked-out connection; idle connections evicted before opening past the cap |
//! | One live connection per named client identity | `bound` set claimed before waiting for a permit |
//! | A named connection on its way back is waited for, not refused | `returning` set, woken through `returned` |
//! | Nothing returns to `idle` after `close` | `closed` written and read under the state lock |
//! | Broken connections are never handed out again | lazy liveness check on checkout, `mark_broken` on transport failure |
//!
//! Checkout is cancellation-safe: dropping an `acquire` future releases any
//! identity claim and reserved slot it held.

use crate::domain::{DeliveryConfig, DeliveryError, RetryPolicy};
use crate::service::session::Session;
use parking_lot::Mutex;
use shared_bus::{BusError, ClientIdentity, ConnectionId, MessageBroker};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_connections: usize,
    /// Connections currently open at the broker (idle + in use).
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Highest `open` ever observed.
    pub peak_open: usize,
    pub created: u64,
    /// Connections thrown away because they were broken.
    pub discarded: u64,
}

#[derive(Debug)]
struct IdleConnection {
    id: ConnectionId,
    identity: ClientIdentity,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    /// Named identities currently checked out or being checked out.
    bound: HashSet<ClientIdentity>,
    /// Bound identities whose connection is only finishing a rollback.
    returning: HashSet<ClientIdentity>,
    /// Open connections plus slots reserved by in-progress connects.
    open: usize,
    peak_open: usize,
    created: u64,
    discarded: u64,
}

struct PoolShared {
    broker: Arc<dyn MessageBroker>,
    max_connections: usize,
    acquire_timeout: Duration,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState>,
    /// Set under `state`, so a returning connection never lands in a drained pool.
    closed: AtomicBool,
    returned: Notify,
}

/// Shared, cloneable handle to the connection pool.
#[derive(Clone)]
pub struct ConnectionResource {
    shared: Arc<PoolShared>,
}

impl ConnectionResource {
    /// Create a pool over `broker`. No connection is opened until first use.
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        config: &DeliveryConfig,
    ) -> Result<Self, DeliveryError> {
        config.validate()?;
        info!(
            max_connections = config.max_connections,
            acquire_timeout_ms = config.acquire_timeout_ms,
            "Connection pool created"
        );
        Ok(Self {
            shared: Arc::new(PoolShared {
                broker,
                max_connections: config.max_connections,
                acquire_timeout: config.acquire_timeout(),
                retry: config.retry.clone(),
                permits: Arc::new(Semaphore::new(config.max_connections)),
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
                returned: Notify::new(),
            }),
        })
    }

    /// Check out a connection with a throwaway identity.
    pub async fn acquire(&self) -> Result<PooledConnection, DeliveryError> {
        self.checkout(None).await
    }

    /// Check out a connection bound to `identity`.
    ///
    /// Fails immediately with `DuplicateClientIdentity` if the identity is
    /// already checked out from this pool or bound elsewhere at the broker.
    /// If its connection is only finishing the rollback of a dropped session,
    /// waits for it instead, up to the acquire timeout.
    pub async fn acquire_with_identity(
        &self,
        identity: ClientIdentity,
    ) -> Result<PooledConnection, DeliveryError> {
        self.checkout(Some(identity)).await
    }

    /// Return a connection. Equivalent to dropping it.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    /// Start a transacted session on an anonymous connection.
    pub async fn create_session(&self) -> Result<Session, DeliveryError> {
        let connection = self.acquire().await?;
        Ok(Session::new(self.clone(), connection))
    }

    /// Start a transacted session on a connection bound to `identity`.
    pub async fn create_session_with_identity(
        &self,
        identity: ClientIdentity,
    ) -> Result<Session, DeliveryError> {
        let connection = self.acquire_with_identity(identity).await?;
        Ok(Session::new(self.clone(), connection))
    }

    #[must_use]
    pub fn broker(&self) -> Arc<dyn MessageBroker> {
        Arc::clone(&self.shared.broker)
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.shared.retry
    }

    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.shared.max_connections
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            max_connections: self.shared.max_connections,
            open: state.open,
            idle: state.idle.len(),
            in_use: state.open.saturating_sub(state.idle.len()),
            peak_open: state.peak_open,
            created: state.created,
            discarded: state.discarded,
        }
    }

    /// Refuse new checkouts and close idle connections. Checked-out
    /// connections are closed as they come back.
    pub fn close(&self) {
        let idle = {
            let mut state = self.shared.state.lock();
            if self.shared.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            let idle = std::mem::take(&mut state.idle);
            state.open = state.open.saturating_sub(idle.len());
            idle
        };
        self.shared.permits.close();
        self.shared.returned.notify_waiters();

        for connection in &idle {
            self.shared.broker.disconnect(connection.id);
        }
        info!(closed_idle = idle.len(), "Connection pool closed");
    }

    async fn checkout(
        &self,
        identity: Option<ClientIdentity>,
    ) -> Result<PooledConnection, DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::PoolClosed);
        }

        let mut claim = CheckoutClaim {
            shared: Arc::clone(&self.shared),
            identity: None,
            slot_reserved: false,
        };
        if let Some(id) = &identity {
            self.claim_identity(id).await?;
            claim.identity = Some(id.clone());
        }

        let permit = self.wait_for_permit().await?;

        if let Some(connection) = self.take_idle(identity.as_ref()) {
            debug!(connection = %connection.id, client_id = %connection.identity, "Reusing idle connection");
            return Ok(PooledConnection::new(
                &self.shared,
                connection.id,
                connection.identity,
                claim.disarm(),
                permit,
            ));
        }

        let evicted = {
            let mut state = self.shared.state.lock();
            let evicted = if state.open >= self.shared.max_connections {
                state.idle.pop()
            } else {
                None
            };
            if evicted.is_some() {
                state.open -= 1;
            }
            debug_assert!(state.open < self.shared.max_connections);
            state.open += 1;
            state.peak_open = state.peak_open.max(state.open);
            evicted
        };
        claim.slot_reserved = true;
        if let Some(connection) = evicted {
            debug!(connection = %connection.id, "Evicted idle connection to make room");
            self.shared.broker.disconnect(connection.id);
        }

        let client = identity.unwrap_or_else(ClientIdentity::anonymous);
        let id = self.connect_with_retry(&client).await?;

        self.shared.state.lock().created += 1;
        claim.slot_reserved = false;
        debug!(connection = %id, client_id = %client, "Opened pooled connection");
        Ok(PooledConnection::new(&self.shared, id, client, claim.disarm(), permit))
    }

    async fn claim_identity(&self, identity: &ClientIdentity) -> Result<(), DeliveryError> {
        let deadline = tokio::time::Instant::now() + self.shared.acquire_timeout;
        loop {
            let returned = {
                let mut state = self.shared.state.lock();
                if self.shared.closed.load(Ordering::Acquire) {
                    return Err(DeliveryError::PoolClosed);
                }
                if state.bound.insert(identity.clone()) {
                    return Ok(());
                }
                if !state.returning.contains(identity) {
                    warn!(client_id = %identity, "Client identity already checked out");
                    return Err(DeliveryError::DuplicateClientIdentity(identity.to_string()));
                }
                // Registered before the lock is released, so a return racing
                // this checkout still wakes it.
                self.shared.returned.notified()
            };

            debug!(client_id = %identity, "Waiting for returning connection");
            if tokio::time::timeout_at(deadline, returned).await.is_err() {
                warn!(client_id = %identity, "Returning connection not released in time");
                return Err(DeliveryError::ResourceExhausted {
                    max_connections: self.shared.max_connections,
                    waited: self.shared.acquire_timeout,
                });
            }
        }
    }

    async fn wait_for_permit(&self) -> Result<OwnedSemaphorePermit, DeliveryError> {
        let timeout = self.shared.acquire_timeout;
        let permits = Arc::clone(&self.shared.permits);
        match tokio::time::timeout(timeout, permits.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(DeliveryError::PoolClosed),
            Err(_) => {
                warn!(
                    max_connections = self.shared.max_connections,
                    waited_ms = timeout.as_millis() as u64,
                    "Connection pool exhausted"
                );
                Err(DeliveryError::ResourceExhausted {
                    max_connections: self.shared.max_connections,
                    waited: timeout,
                })
            }
        }
    }

    /// Pop a live idle connection for `identity`, discarding dead ones on the way.
    fn take_idle(&self, identity: Option<&ClientIdentity>) -> Option<IdleConnection> {
        loop {
            let candidate = {
                let mut state = self.shared.state.lock();
                let index = state.idle.iter().position(|c| match identity {
                    Some(id) => &c.identity == id,
                    None => c.identity.is_anonymous(),
                })?;
                state.idle.swap_remove(index)
            };

            if self.shared.broker.is_connected(candidate.id) {
                return Some(candidate);
            }

            {
                let mut state = self.shared.state.lock();
                state.open = state.open.saturating_sub(1);
                state.discarded += 1;
            }
            self.shared.broker.disconnect(candidate.id);
            warn!(connection = %candidate.id, client_id = %candidate.identity, "Discarded broken idle connection");
        }
    }

    async fn connect_with_retry(
        &self,
        client: &ClientIdentity,
    ) -> Result<ConnectionId, DeliveryError> {
        let retry = &self.shared.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.shared.broker.connect(client).await {
                Ok(id) => return Ok(id),
                Err(BusError::ClientIdInUse(id)) => {
                    warn!(client_id = %id, "Broker rejected client identity already bound elsewhere");
                    return Err(DeliveryError::DuplicateClientIdentity(id));
                }
                Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.backoff_for(attempt);
                    warn!(
                        client_id = %client,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(DeliveryError::BrokerUnavailable {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }
                Err(err) => return Err(DeliveryError::Broker(err)),
            }
        }
    }
}

/// Undo for a checkout that did not complete.
struct CheckoutClaim {
    shared: Arc<PoolShared>,
    identity: Option<ClientIdentity>,
    slot_reserved: bool,
}

impl CheckoutClaim {
    /// Hand the identity claim over to the connection. Returns whether one was held.
    fn disarm(mut self) -> bool {
        self.slot_reserved = false;
        self.identity.take().is_some()
    }
}

impl Drop for CheckoutClaim {
    fn drop(&mut self) {
        if self.identity.is_none() && !self.slot_reserved {
            return;
        }
        let mut state = self.shared.state.lock();
        if let Some(identity) = self.identity.take() {
            state.bound.remove(&identity);
        }
        if self.slot_reserved {
            state.open = state.open.saturating_sub(1);
        }
    }
}

/// A checked-out connection. Returns to the pool when dropped.
pub struct PooledConnection {
    id: ConnectionId,
    identity: ClientIdentity,
    /// Whether this connection holds the pool's claim on a named identity.
    claimed: bool,
    broken: bool,
    returning: bool,
    shared: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn new(
        shared: &Arc<PoolShared>,
        id: ConnectionId,
        identity: ClientIdentity,
        claimed: bool,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            id,
            identity,
            claimed,
            broken: false,
            returning: false,
            shared: Arc::clone(shared),
            _permit: permit,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn client_identity(&self) -> &ClientIdentity {
        &self.identity
    }

    /// Whether the connection is bound to a caller-chosen identity.
    #[must_use]
    pub fn is_named(&self) -> bool {
        self.claimed
    }

    #[must_use]
    pub fn broker(&self) -> Arc<dyn MessageBroker> {
        Arc::clone(&self.shared.broker)
    }

    /// Have the pool close this connection instead of reusing it.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Announce that this connection only finishes cleanup before coming
    /// back, so a checkout of its identity waits for it.
    pub(crate) fn mark_returning(&mut self) {
        if !self.claimed || self.returning {
            return;
        }
        self.returning = true;
        self.shared.state.lock().returning.insert(self.identity.clone());
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let alive = !self.broken && self.shared.broker.is_connected(self.id);

        let (discard, closed) = {
            let mut state = self.shared.state.lock();
            let closed = self.shared.closed.load(Ordering::Acquire);
            let discard = !alive || closed;
            if self.claimed {
                state.bound.remove(&self.identity);
            }
            if self.returning {
                state.returning.remove(&self.identity);
            }
            if discard {
                state.open = state.open.saturating_sub(1);
                if !closed {
                    state.discarded += 1;
                }
            } else {
                state.idle.push(IdleConnection {
                    id: self.id,
                    identity: self.identity.clone(),
                });
            }
            (discard, closed)
        };
        if self.returning {
            self.shared.returned.notify_waiters();
        }

        if discard {
            self.shared.broker.disconnect(self.id);
            if !closed {
                warn!(connection = %self.id, client_id = %self.identity, "Discarded broken connection");
            }
        }
    }
}
