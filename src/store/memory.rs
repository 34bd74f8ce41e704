//! In-memory store implementation.
//!
//! Every trait operation takes one mutex acquisition, so each is atomic with
//! respect to the others: the same linearizable-per-request guarantee the
//! SQL store gets from single-statement conditional updates. Used by the test
//! suite and by embedded deployments that don't need durability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{BatchClaim, Confirmation, RequestStore};
use crate::domain::request::{BloodRequest, RequestId, RequestStatus};
use crate::domain::token::{ResponseToken, TokenRecord};
use crate::error::{BloodlineError, Result};

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestId, BloodRequest>,
    tokens: HashMap<Uuid, TokenRecord>,
}

/// In-memory [`RequestStore`].
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// When false, every operation fails as a transient outage. Lets tests
    /// exercise the scheduler's skip-cycle behavior.
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a store outage (false) or recovery (true).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BloodlineError::Other(anyhow::anyhow!(
                "store unavailable"
            )))
        }
    }

    /// Apply deadline expiry to a stored request at `now`.
    fn apply_expiry(request: &mut BloodRequest, now: DateTime<Utc>) {
        if request.status == RequestStatus::Active
            && now > request.required_by
            && request.confirmed_units < request.quantity_needed
        {
            request.status = RequestStatus::Expired;
            request.batch_in_progress = false;
        }
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn insert_request(&self, request: &BloodRequest) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        inner.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn fetch_request(&self, id: RequestId, now: DateTime<Utc>) -> Result<BloodRequest> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(BloodlineError::RequestNotFound(id))?;
        Self::apply_expiry(request, now);
        Ok(request.clone())
    }

    async fn claim_next_batch(
        &self,
        id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<Option<BatchClaim>> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(None);
        };
        Self::apply_expiry(request, now);

        if request.status != RequestStatus::Active
            || request.batch_in_progress
            || request.remaining_donor_queue.is_empty()
        {
            return Ok(None);
        }

        let take = (request.batch_size as usize).min(request.remaining_donor_queue.len());
        let donor_ids: Vec<_> = request.remaining_donor_queue.drain(..take).collect();
        request.notified_donor_ids.extend(donor_ids.iter().copied());
        request.batch_sent_at = Some(now);
        request.batch_in_progress = true;

        Ok(Some(BatchClaim {
            donor_ids,
            sent_at: now,
        }))
    }

    async fn release_elapsed_batch(&self, id: RequestId, now: DateTime<Utc>) -> Result<bool> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(false);
        };
        Self::apply_expiry(request, now);

        let due = request.status == RequestStatus::Active
            && request.batch_in_progress
            && request.confirmed_units < request.quantity_needed
            && request.window_elapsed(now);

        if due {
            request.batch_in_progress = false;
        }
        Ok(due)
    }

    async fn due_batch_requests(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RequestId>> {
        self.check_available()?;
        let inner = self.inner.lock();
        let mut due: Vec<_> = inner
            .requests
            .values()
            .filter(|r| {
                r.status == RequestStatus::Active
                    && r.batch_in_progress
                    && r.confirmed_units < r.quantity_needed
                    && r.window_elapsed(now)
            })
            .collect();
        // Oldest open window first
        due.sort_by_key(|r| r.batch_sent_at);
        Ok(due.into_iter().take(limit).map(|r| r.id).collect())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        for request in inner.requests.values_mut() {
            if request.status == RequestStatus::Active
                && now > request.required_by
                && request.confirmed_units < request.quantity_needed
            {
                request.status = RequestStatus::Expired;
                request.batch_in_progress = false;
                expired.push(request.id);
            }
        }
        Ok(expired)
    }

    async fn confirm_donation(&self, id: RequestId, now: DateTime<Utc>) -> Result<Confirmation> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(BloodlineError::RequestNotFound(id))?;
        Self::apply_expiry(request, now);

        let matches = request.status == RequestStatus::Active
            && request.confirmed_units < request.quantity_needed
            && request.required_by >= now;
        if !matches {
            return Err(BloodlineError::AlreadyClosed(id));
        }

        request.confirmed_units += 1;
        let fulfilled = request.confirmed_units >= request.quantity_needed;
        if fulfilled {
            request.status = RequestStatus::Fulfilled;
        }
        Ok(Confirmation {
            confirmed_units: request.confirmed_units,
            fulfilled,
        })
    }

    async fn cancel_request(&self, id: RequestId, now: DateTime<Utc>) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or(BloodlineError::RequestNotFound(id))?;
        Self::apply_expiry(request, now);

        if request.status != RequestStatus::Active {
            return Err(BloodlineError::AlreadyClosed(id));
        }
        request.status = RequestStatus::Cancelled;
        request.batch_in_progress = false;
        Ok(())
    }

    async fn insert_token(&self, record: &TokenRecord) -> Result<()> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        if inner.tokens.contains_key(&record.token.0) {
            return Err(BloodlineError::Other(anyhow::anyhow!(
                "duplicate response token {}",
                record.token
            )));
        }
        inner.tokens.insert(record.token.0, record.clone());
        Ok(())
    }

    async fn consume_token(
        &self,
        token: ResponseToken,
        now: DateTime<Utc>,
    ) -> Result<TokenRecord> {
        self.check_available()?;
        let mut inner = self.inner.lock();
        let record = inner
            .tokens
            .get_mut(&token.0)
            .ok_or(BloodlineError::TokenNotFound)?;
        if record.consumed_at.is_some() {
            return Err(BloodlineError::TokenNotFound);
        }
        record.consumed_at = Some(now);
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::blood::{BloodGroup, Urgency};
    use crate::domain::donor::DonorId;
    use crate::domain::request::RequestInput;
    use chrono::Duration;

    fn request_with_queue(
        now: DateTime<Utc>,
        quantity: u32,
        batch_size: u32,
        queue_len: usize,
    ) -> BloodRequest {
        let input = RequestInput {
            hospital: "General".to_string(),
            blood_group: BloodGroup::ONegative,
            quantity_needed: quantity,
            urgency: Urgency::High,
            required_by: now + Duration::hours(2),
            batch_size,
            response_window_minutes: 5,
        };
        let queue: Vec<_> = (0..queue_len)
            .map(|_| DonorId::from(Uuid::new_v4()))
            .collect();
        BloodRequest::new(input, queue, now)
    }

    #[tokio::test]
    async fn test_claim_preserves_queue_partition() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = request_with_queue(now, 3, 2, 5);
        let id = request.id;
        store.insert_request(&request).await.unwrap();

        let claim = store.claim_next_batch(id, now).await.unwrap().unwrap();
        assert_eq!(claim.donor_ids.len(), 2);

        let stored = store.fetch_request(id, now).await.unwrap();
        assert_eq!(stored.notified_donor_ids.len(), 2);
        assert_eq!(stored.remaining_donor_queue.len(), 3);
        assert!(stored.batch_in_progress);
        assert_eq!(stored.batch_sent_at, Some(now));
        // No donor appears on both sides
        for notified in &stored.notified_donor_ids {
            assert!(!stored.remaining_donor_queue.contains(notified));
        }
    }

    #[tokio::test]
    async fn test_second_claim_is_noop_while_batch_open() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = request_with_queue(now, 3, 2, 5);
        let id = request.id;
        store.insert_request(&request).await.unwrap();

        assert!(store.claim_next_batch(id, now).await.unwrap().is_some());
        assert!(store.claim_next_batch(id, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_requires_elapsed_window_single_winner() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = request_with_queue(now, 3, 1, 5);
        let id = request.id;
        store.insert_request(&request).await.unwrap();
        store.claim_next_batch(id, now).await.unwrap().unwrap();

        // Window is 5 minutes; too early
        assert!(
            !store
                .release_elapsed_batch(id, now + Duration::minutes(4))
                .await
                .unwrap()
        );

        let later = now + Duration::minutes(5);
        assert!(store.release_elapsed_batch(id, later).await.unwrap());
        // Second tick loses the flip
        assert!(!store.release_elapsed_batch(id, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_confirm_until_fulfilled_then_already_closed() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = request_with_queue(now, 2, 1, 3);
        let id = request.id;
        store.insert_request(&request).await.unwrap();

        let first = store.confirm_donation(id, now).await.unwrap();
        assert_eq!(first.confirmed_units, 1);
        assert!(!first.fulfilled);

        let second = store.confirm_donation(id, now).await.unwrap();
        assert_eq!(second.confirmed_units, 2);
        assert!(second.fulfilled);

        let third = store.confirm_donation(id, now).await;
        assert!(matches!(third, Err(BloodlineError::AlreadyClosed(_))));

        let stored = store.fetch_request(id, now).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Fulfilled);
        assert_eq!(stored.confirmed_units, 2);
    }

    #[tokio::test]
    async fn test_confirm_unknown_request_is_not_found() {
        let store = MemoryStore::new();
        let result = store
            .confirm_donation(RequestId::from(Uuid::new_v4()), Utc::now())
            .await;
        assert!(matches!(result, Err(BloodlineError::RequestNotFound(_))));
    }

    #[tokio::test]
    async fn test_confirm_past_deadline_rejected_and_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = request_with_queue(now, 2, 1, 3);
        let id = request.id;
        store.insert_request(&request).await.unwrap();

        let late = now + Duration::hours(3);
        let result = store.confirm_donation(id, late).await;
        assert!(matches!(result, Err(BloodlineError::AlreadyClosed(_))));

        let stored = store.fetch_request(id, late).await.unwrap();
        assert_eq!(stored.status, RequestStatus::Expired);
    }

    #[tokio::test]
    async fn test_expire_overdue_sweep() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let overdue = request_with_queue(now, 2, 1, 3);
        let fresh = request_with_queue(now + Duration::hours(1), 2, 1, 3);
        store.insert_request(&overdue).await.unwrap();
        store.insert_request(&fresh).await.unwrap();

        let expired = store
            .expire_overdue(now + Duration::hours(2) + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(expired, vec![overdue.id]);

        // Sweep is idempotent
        let again = store
            .expire_overdue(now + Duration::hours(2) + Duration::seconds(2))
            .await
            .unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_then_claim_and_release_refuse() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let request = request_with_queue(now, 2, 1, 3);
        let id = request.id;
        store.insert_request(&request).await.unwrap();

        store.cancel_request(id, now).await.unwrap();
        assert!(matches!(
            store.cancel_request(id, now).await,
            Err(BloodlineError::AlreadyClosed(_))
        ));
        assert!(store.claim_next_batch(id, now).await.unwrap().is_none());
        assert!(!store.release_elapsed_batch(id, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = TokenRecord::new(
            RequestId::from(Uuid::new_v4()),
            DonorId::from(Uuid::new_v4()),
            now,
        );
        store.insert_token(&record).await.unwrap();

        let consumed = store.consume_token(record.token, now).await.unwrap();
        assert_eq!(consumed.request_id, record.request_id);
        assert_eq!(consumed.donor_id, record.donor_id);

        assert!(matches!(
            store.consume_token(record.token, now).await,
            Err(BloodlineError::TokenNotFound)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_token_rejected() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let record = TokenRecord::new(
            RequestId::from(Uuid::new_v4()),
            DonorId::from(Uuid::new_v4()),
            now,
        );
        store.insert_token(&record).await.unwrap();
        assert!(store.insert_token(&record).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_available(false);
        let result = store.due_batch_requests(Utc::now(), 10).await;
        assert!(result.is_err());

        store.set_available(true);
        assert!(store.due_batch_requests(Utc::now(), 10).await.is_ok());
    }
}
