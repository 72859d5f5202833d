//! Per-endpoint-class concurrency limits for outbound calls.
//!
//! Every Git, LLM and notification call holds a [`Lease`] for its duration.
//! Waiters are served in FIFO order. A lease held longer than the configured
//! maximum is reclaimed by a watchdog and counted as a leak.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use warden_core::{EndpointClass, QueueConfig, WardenError};

struct ClassSlots {
    limit: usize,
    semaphore: Arc<Semaphore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct PoolInner {
    classes: HashMap<EndpointClass, ClassSlots>,
    max_hold: Duration,
    leaks: AtomicUsize,
}

impl PoolInner {
    fn slots(&self, class: EndpointClass) -> Result<&ClassSlots, WardenError> {
        self.classes
            .get(&class)
            .ok_or_else(|| WardenError::Config(format!("no concurrency limit for endpoint class {class}")))
    }

    /// Return the permit held in `slot`, if it is still there. Whoever takes
    /// the permit owns the bookkeeping, so each lease is released once.
    fn release(&self, class: EndpointClass, slot: &Mutex<Option<OwnedSemaphorePermit>>) -> bool {
        let permit = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
        match permit {
            Some(permit) => {
                if let Some(slots) = self.classes.get(&class) {
                    slots.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                drop(permit);
                true
            }
            None => false,
        }
    }
}

/// Bounded pool of outbound call slots, one semaphore per endpoint class.
///
/// Cheap to clone; clones share the same slots.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use std::time::Duration;
/// use warden_core::EndpointClass;
/// use warden_queue::ConnectionPool;
///
/// # tokio_test();
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn tokio_test() {
/// let pool = ConnectionPool::new(
///     HashMap::from([(EndpointClass::Llm, 2)]),
///     Duration::from_secs(60),
/// );
/// let lease = pool.acquire(EndpointClass::Llm).await.unwrap();
/// assert_eq!(pool.in_flight(EndpointClass::Llm), 1);
/// drop(lease);
/// assert_eq!(pool.in_flight(EndpointClass::Llm), 0);
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Pool with the given per-class limits. Limits of zero are raised to
    /// one so a class can never deadlock.
    pub fn new(limits: HashMap<EndpointClass, usize>, max_hold: Duration) -> Self {
        let classes = limits
            .into_iter()
            .map(|(class, limit)| {
                let limit = limit.max(1);
                let slots = ClassSlots {
                    limit,
                    semaphore: Arc::new(Semaphore::new(limit)),
                    in_flight: AtomicUsize::new(0),
                    peak: AtomicUsize::new(0),
                };
                (class, slots)
            })
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                classes,
                max_hold,
                leaks: AtomicUsize::new(0),
            }),
        }
    }

    /// Pool sized from the `[queue]` table.
    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.limits(), config.lease_max_hold())
    }

    /// Wait for a free slot of `class`.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::Config`] if the pool has no limit for `class`.
    pub async fn acquire(&self, class: EndpointClass) -> Result<Lease, WardenError> {
        let slots = self.inner.slots(class)?;
        let permit = Arc::clone(&slots.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| WardenError::ShutDown)?;

        let now = slots.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        slots.peak.fetch_max(now, Ordering::SeqCst);
        tracing::trace!(%class, in_flight = now, limit = slots.limit, "lease acquired");

        let slot = Arc::new(Mutex::new(Some(permit)));
        let reclaimed = Arc::new(AtomicBool::new(false));
        let watchdog = CancellationToken::new();
        self.spawn_watchdog(class, Arc::clone(&slot), Arc::clone(&reclaimed), watchdog.clone());

        Ok(Lease {
            class,
            slot,
            reclaimed,
            watchdog,
            pool: Arc::clone(&self.inner),
            acquired_at: Instant::now(),
        })
    }

    fn spawn_watchdog(
        &self,
        class: EndpointClass,
        slot: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
        reclaimed: Arc<AtomicBool>,
        token: CancellationToken,
    ) {
        let inner = Arc::clone(&self.inner);
        let max_hold = inner.max_hold;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(max_hold) => {
                    if inner.release(class, &slot) {
                        reclaimed.store(true, Ordering::SeqCst);
                        let leaks = inner.leaks.fetch_add(1, Ordering::SeqCst) + 1;
                        tracing::error!(
                            %class,
                            max_hold_ms = max_hold.as_millis() as u64,
                            leaks,
                            "lease held past its maximum duration, force-released"
                        );
                    }
                }
            }
        });
    }

    /// Leases of `class` currently outstanding.
    pub fn in_flight(&self, class: EndpointClass) -> usize {
        self.inner
            .classes
            .get(&class)
            .map_or(0, |s| s.in_flight.load(Ordering::SeqCst))
    }

    /// Highest number of simultaneous leases of `class` seen so far.
    pub fn peak(&self, class: EndpointClass) -> usize {
        self.inner
            .classes
            .get(&class)
            .map_or(0, |s| s.peak.load(Ordering::SeqCst))
    }

    /// Configured limit of `class`, or 0 if the class is unknown.
    pub fn limit(&self, class: EndpointClass) -> usize {
        self.inner.classes.get(&class).map_or(0, |s| s.limit)
    }

    /// Leases reclaimed by the watchdog since the pool was created.
    pub fn leaks(&self) -> usize {
        self.inner.leaks.load(Ordering::SeqCst)
    }
}

/// A held slot. Dropping it returns the slot to the pool.
pub struct Lease {
    class: EndpointClass,
    slot: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
    reclaimed: Arc<AtomicBool>,
    watchdog: CancellationToken,
    pool: Arc<PoolInner>,
    acquired_at: Instant,
}

impl Lease {
    /// Endpoint class of this lease.
    pub fn class(&self) -> EndpointClass {
        self.class
    }

    /// Time since the slot was granted.
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Whether the watchdog already took the slot back.
    pub fn is_reclaimed(&self) -> bool {
        self.reclaimed.load(Ordering::SeqCst)
    }

    /// Fail if the slot was reclaimed while the call was running.
    ///
    /// # Errors
    ///
    /// Returns [`WardenError::LeaseLeaked`] after a force-release.
    pub fn ensure_held(&self) -> Result<(), WardenError> {
        if self.is_reclaimed() {
            return Err(WardenError::LeaseLeaked(format!(
                "{} lease reclaimed after {} ms",
                self.class,
                self.held_for().as_millis()
            )));
        }
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.watchdog.cancel();
        if self.pool.release(self.class, &self.slot) {
            tracing::trace!(class = %self.class, held_ms = self.held_for().as_millis() as u64, "lease released");
        }
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("class", &self.class)
            .field("held_for", &self.held_for())
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}
