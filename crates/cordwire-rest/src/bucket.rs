//! Rate-limit buckets and the admission transaction
//!
//! A [`Bucket`] tracks one of the remote service's rate-limit partitions and
//! serializes the calls made against it. Admission works in three stages:
//!
//! 1. **Queueing**: the caller draws a [`Ticket`](crate::ticket::Ticket) and
//!    waits until it is the oldest one.
//! 2. **Locking**: the head of the queue takes the bucket's "call in flight"
//!    token with a non-blocking compare-and-swap, plus the global bucket's
//!    token while the global limiter is active.
//! 3. **Reset wait**: if the bucket (or the global limiter) is exhausted,
//!    the caller sleeps until the reset deadline.
//!
//! The counters live behind a short-lived `RwLock`; the in-flight token is a
//! separate atomic so reading bucket state is never blocked by a slow call.
//!
//! ## State
//!
//! A bucket is *Limited* while `remaining == 0` and the reset deadline is in
//! the future, and *Idle* otherwise. There is no stored state field: the
//! transition back to Idle happens simply by time passing the deadline.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    time::Duration,
};

use cordwire_core::clock::Clock;
use reqwest::{header::HeaderMap, StatusCode};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    headers::{self, BucketHash, NormalizedHeaders},
    manager::RateLimitManager,
    route::RateLimitKey,
    ticket::{Ticket, TicketQueue},
    RestError,
};

// ============================================================================
// AdmissionContext
// ============================================================================

/// Deadline, cancellation and fail-fast policy for one transaction.
///
/// Every suspension point of a transaction (queueing, reset wait) observes
/// the context. When it expires the transaction gives up its ticket and
/// tokens and returns [`RestError::AdmissionTimeout`].
#[derive(Debug, Clone, Default)]
pub struct AdmissionContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    fail_fast: bool,
}

impl AdmissionContext {
    /// An unbounded context that only ends when cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the deadline to `timeout` from now. A timeout too large to
    /// represent as an instant leaves the context unbounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Ties the context to an external cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Refuse to sleep through a rate limit that does not fit in the
    /// remaining budget; see [`RestError::RateLimited`].
    ///
    /// Without a deadline the budget is zero, so any rate-limit wait at all
    /// is refused.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Time left before the deadline; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Whether the context has been cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or the deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

// ============================================================================
// RawResponse
// ============================================================================

/// A response as seen by the admission layer: status, headers and the fully
/// read body. After a transaction the headers are in canonical form (see
/// [`headers`](crate::headers)).
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }
}

// ============================================================================
// BucketState
// ============================================================================

/// Counters of a bucket as last reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketState {
    /// Server-assigned bucket hash, once observed.
    pub hash: Option<String>,
    /// Requests per window; `0` until the server reports it.
    pub limit: u32,
    /// Requests left in the window; `None` until the server reports it.
    pub remaining: Option<u32>,
    /// Absolute reset deadline, epoch milliseconds.
    pub reset_at_ms: u64,
}

impl BucketState {
    /// `remaining == 0` and the reset deadline still ahead.
    pub fn is_limited(&self, now_ms: u64) -> bool {
        self.remaining == Some(0) && now_ms < self.reset_at_ms
    }

    /// Milliseconds until a call may be made; `0` when Idle.
    pub fn wait_ms(&self, now_ms: u64) -> u64 {
        if self.is_limited(now_ms) {
            self.reset_at_ms - now_ms
        } else {
            0
        }
    }

    fn apply(&mut self, update: &NormalizedHeaders) {
        if let Some(limit) = update.limit {
            self.limit = limit;
        }
        if let Some(remaining) = update.remaining {
            self.remaining = Some(remaining);
        }
        if let Some(reset_at_ms) = update.reset_at_ms {
            self.reset_at_ms = reset_at_ms;
        }
    }
}

// ============================================================================
// Exclusive token
// ============================================================================

/// Holds a bucket's in-flight token; releases it on drop.
#[derive(Debug)]
struct TokenGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TokenGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Tokens taken by a transaction that made it to the head of the queue.
#[derive(Debug)]
struct Admission<'a> {
    _own: TokenGuard<'a>,
    global: Option<TokenGuard<'a>>,
}

// ============================================================================
// Bucket
// ============================================================================

/// One rate-limit partition.
///
/// Buckets are owned by a [`RateLimitManager`]; they hold a strong handle on
/// the global bucket and a weak one on the manager, so there is no reference
/// cycle.
pub struct Bucket {
    key: RateLimitKey,
    is_global: bool,
    state: RwLock<BucketState>,
    busy: AtomicBool,
    tickets: TicketQueue,
    global: Option<Arc<Bucket>>,
    manager: Weak<RateLimitManager>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("key", &self.key)
            .field("is_global", &self.is_global)
            .field("state", &self.snapshot())
            .field("busy", &self.is_busy())
            .field("queued", &self.tickets.len())
            .finish()
    }
}

impl Bucket {
    /// Creates a route bucket gated by `global`.
    pub(crate) fn new(
        key: RateLimitKey,
        global: Arc<Bucket>,
        manager: Weak<RateLimitManager>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            key,
            is_global: false,
            state: RwLock::new(BucketState::default()),
            busy: AtomicBool::new(false),
            tickets: TicketQueue::new(),
            global: Some(global),
            manager,
            clock,
            poll_interval,
        }
    }

    /// Creates the global bucket. It has no global bucket of its own.
    pub(crate) fn new_global(
        manager: Weak<RateLimitManager>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            key: RateLimitKey::from_raw("global"),
            is_global: true,
            state: RwLock::new(BucketState::default()),
            busy: AtomicBool::new(false),
            tickets: TicketQueue::new(),
            global: None,
            manager,
            clock,
            poll_interval,
        }
    }

    /// Key the bucket was first created for.
    pub fn key(&self) -> &RateLimitKey {
        &self.key
    }

    pub fn is_global(&self) -> bool {
        self.is_global
    }

    /// Copy of the current counters.
    pub fn snapshot(&self) -> BucketState {
        self.read().clone()
    }

    /// Whether the bucket is Limited at `now_ms`.
    pub fn is_limited(&self, now_ms: u64) -> bool {
        self.read().is_limited(now_ms)
    }

    /// Milliseconds until this bucket alone would admit a call.
    pub fn wait_ms(&self, now_ms: u64) -> u64 {
        self.read().wait_ms(now_ms)
    }

    /// Whether a call is currently executing against this bucket.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Number of transactions queued or executing.
    pub fn queued(&self) -> usize {
        self.tickets.len()
    }

    // ========================================================================
    // transaction()
    // ========================================================================

    /// Runs `perform` once this bucket (and the global limiter) admit it.
    ///
    /// Calls for the same bucket run one at a time in arrival order; calls
    /// for different buckets run in parallel unless the global limiter is
    /// active. Transport errors from `perform` are returned untouched and
    /// leave the counters as they were, as does a call abandoned because the
    /// context expired while it was in flight. On success the response headers are
    /// normalized, folded into the bucket (or the global bucket) and returned
    /// in canonical form.
    pub async fn transaction<F, Fut>(
        &self,
        ctx: &AdmissionContext,
        perform: F,
    ) -> Result<RawResponse, RestError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RawResponse, RestError>>,
    {
        let ticket = self.tickets.draw();
        let mut admission = self.admit(&ticket, ctx).await?;

        let now = self.clock.now_millis();
        let local_wait = self.wait_ms(now);
        let global_wait = self.global.as_ref().map_or(0, |g| g.wait_ms(now));
        let wait_ms = local_wait.max(global_wait);

        if wait_ms > 0 {
            let wait = Duration::from_millis(wait_ms);
            let global = global_wait >= local_wait;
            if ctx.is_fail_fast() && ctx.remaining().map_or(true, |budget| wait > budget) {
                debug!(key = %self.key, wait_ms, global, "Refusing to wait on rate limit");
                return Err(RestError::RateLimited {
                    key: self.key.to_string(),
                    retry_after: wait,
                    global,
                });
            }

            debug!(
                key = %self.key,
                ticket = ticket.number(),
                wait_ms,
                global,
                "Waiting for bucket reset"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = ctx.done() => return Err(self.timeout()),
            }
        }

        // Never hold the global token across the network call.
        drop(admission.global.take());

        let mut response = tokio::select! {
            result = perform() => result?,
            _ = ctx.done() => {
                debug!(key = %self.key, "In-flight call abandoned");
                return Err(self.timeout());
            }
        };

        let now = self.clock.now_millis();
        let update = headers::normalize(response.status, &response.headers, &response.body, now);
        update.write_canonical(&mut response.headers);

        let discovered = self.record(&update);
        if let Some(hash) = discovered {
            if let Some(manager) = self.manager.upgrade() {
                manager.report_hash(&self.key, &hash);
            }
        }

        if response.status == StatusCode::TOO_MANY_REQUESTS {
            warn!(
                key = %self.key,
                global = update.is_global,
                retry_after_ms = ?update.retry_after_ms,
                "Received 429 despite admission control"
            );
        }

        Ok(response)
    }

    /// Waits until `ticket` heads the queue and the tokens are taken.
    async fn admit<'a>(
        &'a self,
        ticket: &Ticket<'a>,
        ctx: &AdmissionContext,
    ) -> Result<Admission<'a>, RestError> {
        loop {
            let changed = ticket.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if ticket.is_head() {
                if let Some(admission) = self.try_admit(self.clock.now_millis()) {
                    debug!(key = %self.key, ticket = ticket.number(), "Admitted");
                    return Ok(admission);
                }
            }

            if ctx.is_done() {
                return Err(self.timeout());
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = ctx.done() => return Err(self.timeout()),
            }
        }
    }

    /// Takes this bucket's token and, while the global limiter is active,
    /// the global token too. Either both are taken or neither.
    fn try_admit(&self, now_ms: u64) -> Option<Admission<'_>> {
        let own = TokenGuard::try_acquire(&self.busy)?;
        let global = match &self.global {
            Some(global) if global.is_limited(now_ms) => {
                Some(TokenGuard::try_acquire(&global.busy)?)
            }
            _ => None,
        };
        Some(Admission { _own: own, global })
    }

    /// Folds a response into the counters. Returns a newly observed hash.
    fn record(&self, update: &NormalizedHeaders) -> Option<String> {
        let mut state = self.write();

        if let Some(remaining) = state.remaining.filter(|r| *r > 0) {
            state.remaining = Some(remaining - 1);
        }

        match &self.global {
            Some(global) if update.is_global => {
                global.write().apply(update);
                debug!(key = %self.key, reset_at_ms = ?update.reset_at_ms, "Global limit updated");
            }
            _ => state.apply(update),
        }

        match &update.bucket_hash {
            BucketHash::Known(hash) if state.hash.is_none() && !self.is_global => {
                state.hash = Some(hash.clone());
                Some(hash.clone())
            }
            _ => None,
        }
    }

    /// Merges another bucket's counters into this one during consolidation.
    ///
    /// The bucket with the later reset deadline is authoritative for
    /// `remaining` and the deadline; a limit only the other side knows is
    /// kept either way.
    pub(crate) fn absorb(&self, other: &Bucket) {
        let theirs = other.snapshot();
        let mut mine = self.write();

        if theirs.reset_at_ms > mine.reset_at_ms {
            mine.remaining = theirs.remaining;
            mine.reset_at_ms = theirs.reset_at_ms;
            if theirs.limit > 0 {
                mine.limit = theirs.limit;
            }
        } else if mine.limit == 0 {
            mine.limit = theirs.limit;
        }
        if mine.hash.is_none() {
            mine.hash = theirs.hash;
        }
    }

    fn timeout(&self) -> RestError {
        debug!(key = %self.key, "Admission abandoned");
        RestError::AdmissionTimeout {
            key: self.key.to_string(),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BucketState> {
        // Writers never leave the state half-updated, so poisoning is benign.
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BucketState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
