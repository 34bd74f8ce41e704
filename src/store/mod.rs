//! Storage traits for the notification engine.
//!
//! The backing store is the sole arbiter of consistency: every operation that
//! two callers could race on (confirmation increments, batch-queue mutation)
//! is a single conditional update here, never a read-then-write composed in
//! application code.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::donor::DonorId;
use crate::domain::request::{BloodRequest, RequestId};
use crate::domain::token::{ResponseToken, TokenRecord};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// A batch claimed for dispatch: the dequeued donor ids and the send
/// timestamp persisted with the claim.
#[derive(Debug, Clone)]
pub struct BatchClaim {
    pub donor_ids: Vec<DonorId>,
    pub sent_at: DateTime<Utc>,
}

/// Outcome of a successful confirmation increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    /// Confirmed units after the increment.
    pub confirmed_units: u32,
    /// True when this increment met the quota and closed the request.
    pub fulfilled: bool,
}

/// Persistent store for blood requests and response tokens.
///
/// Operations taking `now` apply lifecycle evaluation against that instant,
/// so tests can drive synthetic clocks and the scheduler passes one
/// consistent timestamp per cycle.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a freshly created request.
    async fn insert_request(&self, request: &BloodRequest) -> Result<()>;

    /// Fetch a request, applying lifecycle evaluation at `now` (an active
    /// request past its deadline is returned, and persisted, as expired).
    ///
    /// # Errors
    /// `RequestNotFound` for an unknown id.
    async fn fetch_request(&self, id: RequestId, now: DateTime<Utc>) -> Result<BloodRequest>;

    /// Atomically claim the next notification batch: dequeue up to
    /// `batch_size` donor ids, append them to the notified list, set
    /// `batch_sent_at = now` and `batch_in_progress = true`, as one
    /// indivisible transition.
    ///
    /// Returns `None` (no-op) when the request is missing, not active, the
    /// queue is empty, or a batch is already in progress. The conditional
    /// `batch_in_progress = false` predicate is the idempotence guard: of two
    /// overlapping dispatch calls, exactly one claims the batch.
    async fn claim_next_batch(
        &self,
        id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchClaim>>;

    /// Flip `batch_in_progress` to false, but only if the request is still
    /// active, under quota, and the response window has elapsed at `now`.
    ///
    /// Returns true when this caller won the flip. Two overlapping scheduler
    /// ticks see exactly one `true` between them.
    async fn release_elapsed_batch(&self, id: RequestId, now: DateTime<Utc>) -> Result<bool>;

    /// Requests whose open batch window has elapsed at `now`: status active,
    /// batch in progress, under quota.
    async fn due_batch_requests(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<RequestId>>;

    /// Transition overdue active requests to expired. Returns the ids that
    /// transitioned in this sweep.
    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>>;

    /// Conditionally increment `confirmed_units` by 1, only while the request
    /// is active, under quota, and before its deadline, as one indivisible
    /// read-modify-write. When the increment meets the quota, the same update
    /// transitions the request to fulfilled.
    ///
    /// # Errors
    /// `RequestNotFound` for an unknown id; `AlreadyClosed` when the
    /// predicate did not match (fulfilled, expired, or cancelled).
    async fn confirm_donation(&self, id: RequestId, now: DateTime<Utc>) -> Result<Confirmation>;

    /// Explicit hospital/admin cancellation (active → cancelled).
    ///
    /// # Errors
    /// `RequestNotFound` for an unknown id; `AlreadyClosed` when the request
    /// is already terminal.
    async fn cancel_request(&self, id: RequestId, now: DateTime<Utc>) -> Result<()>;

    /// Persist a freshly minted token. Token uniqueness is enforced here.
    async fn insert_token(&self, record: &TokenRecord) -> Result<()>;

    /// Atomically consume a token: marks it used and returns its binding.
    ///
    /// # Errors
    /// `TokenNotFound` when the token is unknown or already consumed.
    async fn consume_token(
        &self,
        token: ResponseToken,
        now: DateTime<Utc>,
    ) -> Result<TokenRecord>;
}
