//! # Instance Pool
//!
//! Bounded, thread-safe storage for the live instances of one component.
//!
//! Two retention modes share one lease protocol:
//!
//! - **Shared** (pooled components): anonymous instances in an idle queue.
//!   A semaphore with `max` permits bounds the instances checked out at once;
//!   idle instances hold no permit, so `active + idle <= max` holds because new
//!   instances are only created when the idle queue is empty.
//! - **Keyed** (identified and singleton components): one slot per identity,
//!   each behind its own async mutex. Holding the slot's guard *is* the
//!   exclusive checkout, so two calls never observe the same instance.
//!
//! Counts and the idle queue live under a single mutex that is never held
//! across an await point. Construction happens outside that mutex.
//!
//! A checkout is a `Lease`. It must be settled with `release` or `discard`;
//! a lease dropped unsettled, for example by a cancelled call, is discarded
//! and its instance destroyed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Mutex as SlotLock;
use tokio::sync::OwnedMutexGuard;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use tokio::sync::TryAcquireError;
use tracing::debug;
use tracing::warn;

use beanwire::Identity;

use crate::bean::Bean;
use crate::bean::ConstructionError;
use crate::descriptor::ComponentDescriptor;
use crate::descriptor::Lifecycle;
use crate::descriptor::PoolBounds;

#[derive(Debug)]
pub enum Error {
    /// Too many callers are already waiting, or no keyed slot can be created.
    Exhausted { component: String, waiters: usize },
    /// No instance became available in time.
    Timeout { component: String, waited: Duration },
    Construction(ConstructionError),
    Closed(String),
    /// A keyed pool was asked for an instance without an identity.
    IdentityRequired(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { component, waiters } => {
                write!(f, "Pool for '{}' exhausted ({} waiting)", component, waiters)
            }
            Self::Timeout { component, waited } => {
                write!(f, "No instance of '{}' available after {:?}", component, waited)
            }
            Self::Construction(e) => write!(f, "{}", e),
            Self::Closed(component) => write!(f, "Pool for '{}' is closed", component),
            Self::IdentityRequired(component) => {
                write!(f, "'{}' requires an instance identity", component)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Construction(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConstructionError> for Error {
    fn from(e: ConstructionError) -> Self {
        Self::Construction(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Strong type for instance identifiers, unique within one pool.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "instance-{}", self.0)
    }
}

/// A live bean plus the bookkeeping the pool needs about it.
pub struct Instance {
    id: InstanceId,
    bean: Box<dyn Bean>,
    identity: Option<Identity>,
    created_at: Instant,
    last_used: Instant,
    discard: bool,
}

impl Instance {
    pub(crate) fn new(id: InstanceId, bean: Box<dyn Bean>, identity: Option<Identity>) -> Self {
        let now = Instant::now();
        Self {
            id,
            bean,
            identity,
            created_at: now,
            last_used: now,
            discard: false,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn bean_mut(&mut self) -> &mut dyn Bean {
        self.bean.as_mut()
    }

    /// Requests removal from the pool when the current lease is settled.
    pub fn mark_for_discard(&mut self) {
        self.discard = true;
    }

    pub fn is_marked_for_discard(&self) -> bool {
        self.discard
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("discard", &self.discard)
            .finish()
    }
}

/// Builds and tears down beans on the pool's behalf.
pub trait InstanceSource: Send + Sync {
    /// Allocates, injects and initializes a bean.
    fn create(&self) -> std::result::Result<Box<dyn Bean>, ConstructionError>;
    /// Runs the bean's pre-destroy callback and drops it.
    fn destroy(&self, bean: Box<dyn Bean>);
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub component: String,
    pub lifecycle: Lifecycle,
    pub bounds: PoolBounds,
    pub timeout: Duration,
    pub idle_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new(component: impl Into<String>, lifecycle: Lifecycle) -> Self {
        Self {
            component: component.into(),
            lifecycle,
            bounds: PoolBounds::default(),
            timeout: Duration::from_secs(30),
            idle_timeout: None,
        }
    }

    pub fn from_descriptor(descriptor: &ComponentDescriptor) -> Self {
        Self {
            component: descriptor.name().to_string(),
            lifecycle: descriptor.lifecycle(),
            bounds: descriptor.bounds(),
            timeout: descriptor.timeout(),
            idle_timeout: descriptor.idle_timeout(),
        }
    }

    pub fn bounds(mut self, bounds: PoolBounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }
}

/// Snapshot of the pool counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub created: u64,
    pub destroyed: u64,
}

struct State {
    idle: VecDeque<Instance>,
    /// Keyed instances parked in their slots.
    retained: usize,
    active: usize,
    waiting: usize,
    created: u64,
    destroyed: u64,
    closed: bool,
}

#[derive(Default)]
struct Slot {
    instance: Option<Instance>,
    /// Set once the slot has left the map; holders of a stale handle retry.
    removed: bool,
}

type SlotHandle = Arc<SlotLock<Slot>>;

struct Shared {
    config: PoolConfig,
    source: Arc<dyn InstanceSource>,
    permits: Arc<Semaphore>,
    state: Mutex<State>,
    slots: DashMap<Identity, SlotHandle>,
    next_id: AtomicU64,
}

impl Shared {
    fn component(&self) -> &str {
        &self.config.component
    }

    fn create_instance(&self, identity: Option<Identity>) -> Result<Instance> {
        match self.source.create() {
            Ok(bean) => {
                let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
                self.state.lock().created += 1;
                debug!(component = %self.component(), instance = %id, "instance created");
                Ok(Instance::new(id, bean, identity))
            }
            Err(e) => {
                warn!(
                    component = %self.component(),
                    stage = %e.stage,
                    error = %e,
                    "construction failed, instance discarded"
                );
                Err(Error::Construction(e))
            }
        }
    }

    fn destroy(&self, instance: Instance) {
        debug!(component = %self.component(), instance = %instance.id, "instance destroyed");
        self.source.destroy(instance.bean);
    }

    fn is_expired(&self, instance: &Instance) -> bool {
        self.config
            .idle_timeout
            .is_some_and(|limit| instance.idle_for() > limit)
    }

    /// Claims room for one more keyed instance, then builds it.
    fn reserve_and_create(&self, identity: &Identity) -> Result<Instance> {
        {
            let mut state = self.state.lock();
            let live = state.active + state.idle.len() + state.retained;
            if live >= self.config.bounds.max {
                return Err(Error::Exhausted {
                    component: self.component().to_string(),
                    waiters: state.waiting,
                });
            }
            state.active += 1;
        }

        self.create_instance(Some(identity.clone())).inspect_err(|_| {
            self.state.lock().active -= 1;
        })
    }

    fn remove_slot(&self, identity: &Identity, slot: &SlotHandle) {
        self.slots
            .remove_if(identity, |_, current| Arc::ptr_eq(current, slot));
    }
}

/// Decrements the waiter count however the wait ends.
struct Waiting<'a> {
    state: &'a Mutex<State>,
}

impl<'a> Waiting<'a> {
    fn register(shared: &'a Shared) -> Result<Self> {
        let mut state = shared.state.lock();
        if state.waiting >= shared.config.bounds.max_waiters {
            return Err(Error::Exhausted {
                component: shared.component().to_string(),
                waiters: state.waiting,
            });
        }
        state.waiting += 1;
        Ok(Self { state: &shared.state })
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.state.lock().waiting -= 1;
    }
}

/// The pool of one component.
#[derive(Clone)]
pub struct InstancePool {
    shared: Arc<Shared>,
}

impl InstancePool {
    pub fn new(config: PoolConfig, source: Arc<dyn InstanceSource>) -> Self {
        let permits = Arc::new(Semaphore::new(config.bounds.max));
        Self {
            shared: Arc::new(Shared {
                config,
                source,
                permits,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    retained: 0,
                    active: 0,
                    waiting: 0,
                    created: 0,
                    destroyed: 0,
                    closed: false,
                }),
                slots: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Checks out an instance, creating one if allowed.
    ///
    /// Shared pools ignore `identity`; keyed pools require it.
    pub async fn acquire(&self, identity: Option<&Identity>) -> Result<Lease> {
        if self.shared.config.lifecycle.is_keyed() {
            let identity = identity
                .ok_or_else(|| Error::IdentityRequired(self.shared.component().to_string()))?;
            self.acquire_keyed(identity).await
        } else {
            self.acquire_shared().await
        }
    }

    async fn acquire_shared(&self) -> Result<Lease> {
        let shared = &self.shared;

        let permit = match Arc::clone(&shared.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => {
                return Err(Error::Closed(shared.component().to_string()));
            }
            Err(TryAcquireError::NoPermits) => self.wait_for_permit().await?,
        };

        let reused = {
            let mut state = shared.state.lock();
            if state.closed {
                return Err(Error::Closed(shared.component().to_string()));
            }
            state.active += 1;
            state.idle.pop_front()
        };

        let instance = match reused {
            Some(instance) => instance,
            None => shared.create_instance(None).inspect_err(|_| {
                shared.state.lock().active -= 1;
            })?,
        };

        Ok(Lease::new(Arc::clone(shared), instance, Hold::Permit(permit)))
    }

    async fn wait_for_permit(&self) -> Result<OwnedSemaphorePermit> {
        let shared = &self.shared;
        let _waiting = Waiting::register(shared)?;
        let started = Instant::now();

        let acquire = Arc::clone(&shared.permits).acquire_owned();
        match tokio::time::timeout(shared.config.timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::Closed(shared.component().to_string())),
            Err(_) => {
                debug!(component = %shared.component(), "gave up waiting for an instance");
                Err(Error::Timeout {
                    component: shared.component().to_string(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    async fn acquire_keyed(&self, identity: &Identity) -> Result<Lease> {
        let shared = &self.shared;
        let deadline = tokio::time::Instant::now() + shared.config.timeout;

        loop {
            if shared.state.lock().closed {
                return Err(Error::Closed(shared.component().to_string()));
            }

            let slot: SlotHandle = Arc::clone(
                &shared
                    .slots
                    .entry(identity.clone())
                    .or_insert_with(|| Arc::new(SlotLock::new(Slot::default()))),
            );

            let mut guard = match Arc::clone(&slot).try_lock_owned() {
                Ok(guard) => guard,
                Err(_) => {
                    let _waiting = Waiting::register(shared)?;
                    match tokio::time::timeout_at(deadline, Arc::clone(&slot).lock_owned()).await {
                        Ok(guard) => guard,
                        Err(_) => {
                            return Err(Error::Timeout {
                                component: shared.component().to_string(),
                                waited: shared.config.timeout,
                            });
                        }
                    }
                }
            };

            if guard.removed {
                continue;
            }

            let instance = match guard.instance.take() {
                Some(instance) if shared.is_expired(&instance) => {
                    debug!(component = %shared.component(), identity = %identity, "identified instance expired");
                    {
                        let mut state = shared.state.lock();
                        state.retained -= 1;
                        state.destroyed += 1;
                    }
                    shared.destroy(instance);
                    None
                }
                Some(instance) => {
                    let mut state = shared.state.lock();
                    state.retained -= 1;
                    state.active += 1;
                    Some(instance)
                }
                None => None,
            };

            let instance = match instance {
                Some(instance) => instance,
                None => match shared.reserve_and_create(identity) {
                    Ok(instance) => instance,
                    Err(e) => {
                        guard.removed = true;
                        shared.remove_slot(identity, &slot);
                        return Err(e);
                    }
                },
            };

            let hold = Hold::Slot {
                identity: identity.clone(),
                slot,
                guard,
            };
            return Ok(Lease::new(Arc::clone(shared), instance, hold));
        }
    }

    /// Returns a healthy instance for reuse.
    pub fn release(&self, lease: Lease) {
        lease.release();
    }

    /// Removes an instance for good.
    pub fn discard(&self, lease: Lease) {
        lease.discard();
    }

    /// Destroys the instance bound to `identity`, waiting for any in-flight call.
    /// Returns whether an instance was removed.
    pub async fn remove(&self, identity: &Identity) -> Result<bool> {
        let shared = &self.shared;
        let Some(slot) = shared.slots.get(identity).map(|e| Arc::clone(e.value())) else {
            return Ok(false);
        };

        let mut guard = tokio::time::timeout(shared.config.timeout, Arc::clone(&slot).lock_owned())
            .await
            .map_err(|_| Error::Timeout {
                component: shared.component().to_string(),
                waited: shared.config.timeout,
            })?;

        if guard.removed {
            return Ok(false);
        }
        guard.removed = true;
        shared.remove_slot(identity, &slot);
        let instance = guard.instance.take();
        drop(guard);

        match instance {
            Some(instance) => {
                {
                    let mut state = shared.state.lock();
                    state.retained -= 1;
                    state.destroyed += 1;
                }
                shared.destroy(instance);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Destroys keyed instances idle past their deadline. Busy instances are
    /// skipped. Returns how many were destroyed.
    pub fn sweep_expired(&self) -> usize {
        let shared = &self.shared;
        let Some(limit) = shared.config.idle_timeout else {
            return 0;
        };

        let candidates: Vec<(Identity, SlotHandle)> = shared
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut expired = Vec::new();
        for (identity, slot) in candidates {
            let Ok(mut guard) = Arc::clone(&slot).try_lock_owned() else {
                continue;
            };
            let stale = guard
                .instance
                .as_ref()
                .is_some_and(|instance| instance.idle_for() > limit);
            if guard.removed || !stale {
                continue;
            }
            guard.removed = true;
            shared.remove_slot(&identity, &slot);
            if let Some(instance) = guard.instance.take() {
                expired.push(instance);
            }
        }

        let count = expired.len();
        if count > 0 {
            let mut state = shared.state.lock();
            state.retained -= count;
            state.destroyed += count as u64;
        }
        for instance in expired {
            debug!(component = %shared.component(), identity = ?instance.identity, "sweeping expired instance");
            shared.destroy(instance);
        }
        count
    }

    /// Periodically sweeps expired keyed instances until the pool closes.
    pub fn spawn_reaper(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if pool.shared.state.lock().closed {
                    break;
                }
                pool.sweep_expired();
            }
        })
    }

    /// Pre-creates idle instances up to `min` (shared pools only).
    pub fn warm_up(&self) -> Result<usize> {
        let shared = &self.shared;
        if shared.config.lifecycle.is_keyed() {
            return Ok(0);
        }

        let mut created = 0;
        loop {
            {
                let state = shared.state.lock();
                if state.closed || state.idle.len() + state.active >= shared.config.bounds.min {
                    break;
                }
            }
            let Ok(permit) = Arc::clone(&shared.permits).try_acquire_owned() else {
                break;
            };
            let instance = shared.create_instance(None)?;
            shared.state.lock().idle.push_back(instance);
            drop(permit);
            created += 1;
        }
        Ok(created)
    }

    /// Destroys idle instances and refuses further checkouts. Instances still
    /// leased are destroyed when settled.
    pub fn close(&self) {
        let shared = &self.shared;
        let mut doomed: Vec<Instance> = {
            let mut state = shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<Instance> = state.idle.drain(..).collect();
            state.destroyed += drained.len() as u64;
            drained
        };
        shared.permits.close();

        let slots: Vec<(Identity, SlotHandle)> = shared
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        for (identity, slot) in slots {
            let Ok(mut guard) = Arc::clone(&slot).try_lock_owned() else {
                continue;
            };
            guard.removed = true;
            shared.remove_slot(&identity, &slot);
            if let Some(instance) = guard.instance.take() {
                let mut state = shared.state.lock();
                state.retained -= 1;
                state.destroyed += 1;
                doomed.push(instance);
            }
        }

        debug!(component = %shared.component(), destroyed = doomed.len(), "pool closed");
        for instance in doomed {
            shared.destroy(instance);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Whether an identified instance is currently bound to `identity`.
    pub fn contains(&self, identity: &Identity) -> bool {
        self.shared.slots.contains_key(identity)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            active: state.active,
            idle: state.idle.len() + state.retained,
            waiting: state.waiting,
            created: state.created,
            destroyed: state.destroyed,
        }
    }
}

enum Hold {
    Permit(OwnedSemaphorePermit),
    Slot {
        identity: Identity,
        slot: SlotHandle,
        guard: OwnedMutexGuard<Slot>,
    },
}

/// Settles the accounting for one checkout exactly once.
struct Ticket {
    shared: Arc<Shared>,
    hold: Option<Hold>,
}

impl Ticket {
    fn release(&mut self, mut instance: Instance) {
        if instance.is_marked_for_discard() {
            return self.discard(instance);
        }
        let Some(hold) = self.hold.take() else {
            return;
        };
        let shared = &self.shared;
        instance.touch();

        match hold {
            Hold::Permit(permit) => {
                let surplus = {
                    let mut state = shared.state.lock();
                    state.active -= 1;
                    if state.closed || state.idle.len() >= shared.config.bounds.spare {
                        state.destroyed += 1;
                        Some(instance)
                    } else {
                        state.idle.push_back(instance);
                        None
                    }
                };
                if let Some(instance) = surplus {
                    shared.destroy(instance);
                }
                drop(permit);
            }
            Hold::Slot { identity, slot, mut guard } => {
                let closed = {
                    let mut state = shared.state.lock();
                    state.active -= 1;
                    if state.closed {
                        state.destroyed += 1;
                    } else {
                        state.retained += 1;
                    }
                    state.closed
                };
                if closed {
                    guard.removed = true;
                    shared.remove_slot(&identity, &slot);
                    drop(guard);
                    shared.destroy(instance);
                } else {
                    guard.instance = Some(instance);
                }
            }
        }
    }

    fn discard(&mut self, instance: Instance) {
        let Some(hold) = self.hold.take() else {
            return;
        };
        let shared = &self.shared;
        {
            let mut state = shared.state.lock();
            state.active -= 1;
            state.destroyed += 1;
        }

        match hold {
            Hold::Permit(permit) => {
                shared.destroy(instance);
                drop(permit);
            }
            Hold::Slot { identity, slot, mut guard } => {
                guard.removed = true;
                shared.remove_slot(&identity, &slot);
                drop(guard);
                shared.destroy(instance);
            }
        }
    }
}

impl Ticket {
    /// Settles a lease that was dropped mid-call. The instance may be in any
    /// state, so it is destroyed.
    fn abandon(&mut self, instance: Instance) {
        if self.hold.is_some() {
            warn!(component = %self.shared.component(), instance = %instance.id, "lease dropped without release, destroying instance");
        }
        self.discard(instance);
    }
}

/// Exclusive checkout of one instance. Dropping a lease without releasing
/// or discarding it destroys the instance.
pub struct Lease {
    /// Present until the lease is settled.
    instance: Option<Instance>,
    ticket: Ticket,
}

impl Lease {
    fn new(shared: Arc<Shared>, instance: Instance, hold: Hold) -> Self {
        Self {
            instance: Some(instance),
            ticket: Ticket {
                shared,
                hold: Some(hold),
            },
        }
    }

    pub fn instance(&self) -> &Instance {
        self.instance.as_ref().expect("lease holds its instance until settled")
    }

    pub fn instance_mut(&mut self) -> &mut Instance {
        self.instance.as_mut().expect("lease holds its instance until settled")
    }

    pub fn release(mut self) {
        if let Some(instance) = self.instance.take() {
            self.ticket.release(instance);
        }
    }

    pub fn discard(mut self) {
        if let Some(instance) = self.instance.take() {
            self.ticket.discard(instance);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.ticket.abandon(instance);
        }
    }
}
