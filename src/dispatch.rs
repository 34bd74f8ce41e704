//! Notification dispatcher: sends one batch of donor notifications.
//!
//! `send_next_batch` runs detached from whatever triggered it (request
//! creation or a scheduler tick), so it returns nothing and reports every
//! failure through logs and counters instead of the call stack. The batch
//! claim is persisted before any message leaves the process: a crash mid-send
//! never re-claims (and never re-sends) the same batch on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use metrics::counter;
use tokio::task::JoinSet;

use crate::directory::DonorDirectory;
use crate::domain::donor::{Donor, DonorId};
use crate::domain::request::{BloodRequest, RequestId, RequestStatus};
use crate::domain::token::TokenRecord;
use crate::error::BloodlineError;
use crate::events::{Event, EventSink};
use crate::notify::template::{MessageContext, render};
use crate::notify::{MessageTemplates, Messenger};
use crate::store::RequestStore;

/// Outcome of one donor's send pipeline within a batch.
enum DonorSendOutcome {
    Sent(DonorId),
    Skipped(DonorId),
    Failed(DonorId),
}

/// Sends notification batches for blood requests.
pub struct Dispatcher<S, D, M> {
    store: Arc<S>,
    directory: Arc<D>,
    messenger: Arc<M>,
    events: Arc<dyn EventSink>,
    templates: Arc<MessageTemplates>,
    response_url_base: String,
    sends_in_flight: Arc<AtomicUsize>,
}

impl<S, D, M> Dispatcher<S, D, M>
where
    S: RequestStore + 'static,
    D: DonorDirectory + 'static,
    M: Messenger + 'static,
{
    pub fn new(
        store: Arc<S>,
        directory: Arc<D>,
        messenger: Arc<M>,
        events: Arc<dyn EventSink>,
        templates: Arc<MessageTemplates>,
        response_url_base: String,
    ) -> Self {
        Self {
            store,
            directory,
            messenger,
            events,
            templates,
            response_url_base,
            sends_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of notification sends currently executing.
    pub fn sends_in_flight(&self) -> usize {
        self.sends_in_flight.load(Ordering::Relaxed)
    }

    /// Claim and send the next notification batch for a request.
    ///
    /// No-op when the request is missing, closed, already mid-batch, or out
    /// of candidates. Calling this twice in rapid succession dequeues exactly
    /// one batch: the store's conditional claim is the idempotence guard.
    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn send_next_batch(&self, request_id: RequestId) {
        let now = Utc::now();

        let request = match self.store.fetch_request(request_id, now).await {
            Ok(request) => request,
            Err(BloodlineError::RequestNotFound(_)) => {
                tracing::debug!("Request not found, nothing to dispatch");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read request, skipping dispatch");
                return;
            }
        };

        if request.status != RequestStatus::Active {
            tracing::debug!(status = %request.status, "Request closed, nothing to dispatch");
            return;
        }
        if request.remaining_donor_queue.is_empty() {
            tracing::debug!("Donor queue empty, nothing to dispatch");
            return;
        }

        let claim = match self.store.claim_next_batch(request_id, now).await {
            Ok(Some(claim)) => claim,
            Ok(None) => {
                tracing::debug!("Batch already in progress or queue drained, no-op");
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to claim batch");
                return;
            }
        };

        counter!("bloodline_batches_dispatched_total").increment(1);
        tracing::info!(
            batch_size = claim.donor_ids.len(),
            queue_remaining = request
                .remaining_donor_queue
                .len()
                .saturating_sub(claim.donor_ids.len()),
            "Claimed notification batch"
        );

        // The batch is claimed no matter what happens below; delivery from
        // here on is best-effort per donor.
        let contacts = match self.directory.list_donors(Some(request.blood_group)).await {
            Ok(donors) => donors
                .into_iter()
                .map(|d| (d.id, d))
                .collect::<HashMap<_, _>>(),
            Err(e) => {
                tracing::error!(error = %e, "Donor directory unavailable, batch claimed but unsent");
                counter!("bloodline_notifications_failed_total").increment(claim.donor_ids.len() as u64);
                return;
            }
        };

        let mut join_set: JoinSet<DonorSendOutcome> = JoinSet::new();
        for donor_id in claim.donor_ids {
            let donor = contacts.get(&donor_id).cloned();
            join_set.spawn(self.donor_send_task(&request, donor_id, donor));
        }

        let (mut sent, mut skipped, mut failed) = (0usize, 0usize, 0usize);
        // Wait for every outcome; one donor's failure (or panic) never
        // aborts its siblings.
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(DonorSendOutcome::Sent(_)) => sent += 1,
                Ok(DonorSendOutcome::Skipped(_)) => skipped += 1,
                Ok(DonorSendOutcome::Failed(_)) => failed += 1,
                Err(join_error) => {
                    failed += 1;
                    tracing::error!(error = %join_error, "Notification task panicked");
                }
            }
        }

        counter!("bloodline_notifications_sent_total").increment(sent as u64);
        counter!("bloodline_notifications_skipped_total").increment(skipped as u64);
        counter!("bloodline_notifications_failed_total").increment(failed as u64);
        tracing::info!(sent, skipped, failed, "Notification batch finished");
    }

    /// Build the independent per-donor pipeline: resolve contact, mint the
    /// response token, render the tiered template, send.
    fn donor_send_task(
        &self,
        request: &BloodRequest,
        donor_id: DonorId,
        donor: Option<Donor>,
    ) -> impl Future<Output = DonorSendOutcome> + Send + 'static {
        let store = self.store.clone();
        let messenger = self.messenger.clone();
        let events = self.events.clone();
        let templates = self.templates.clone();
        let sends_in_flight = self.sends_in_flight.clone();
        let url_base = self.response_url_base.trim_end_matches('/').to_string();

        let request_id = request.id;
        let hospital = request.hospital.clone();
        let blood_group = request.blood_group;
        let units_remaining = request.units_remaining();
        let urgency = request.urgency;

        async move {
            let Some(donor) = donor else {
                tracing::warn!(
                    request_id = %request_id,
                    donor_id = %donor_id,
                    "Donor missing from directory snapshot, skipping"
                );
                return DonorSendOutcome::Skipped(donor_id);
            };
            let Some(phone) = donor.phone.clone() else {
                tracing::warn!(
                    request_id = %request_id,
                    donor_id = %donor_id,
                    "Donor has no phone contact, skipping"
                );
                return DonorSendOutcome::Skipped(donor_id);
            };

            // Single-use token bound to this (request, donor); the store
            // rejects duplicates
            let token_record = TokenRecord::new(request_id, donor_id, Utc::now());
            if let Err(e) = store.insert_token(&token_record).await {
                tracing::warn!(
                    request_id = %request_id,
                    donor_id = %donor_id,
                    error = %e,
                    "Failed to persist response token, skipping donor"
                );
                return DonorSendOutcome::Failed(donor_id);
            }

            let response_url = format!("{}/respond/{}", url_base, token_record.token);
            let body = render(
                templates.for_tier(urgency.priority_tier()),
                &MessageContext {
                    hospital: &hospital,
                    blood_type: blood_group.as_str(),
                    quantity: units_remaining,
                    urgency: urgency.as_str(),
                    donor_name: &donor.name,
                    response_url: &response_url,
                },
            );

            sends_in_flight.fetch_add(1, Ordering::Relaxed);
            let in_flight = sends_in_flight.clone();
            let _guard = scopeguard::guard((), move |_| {
                in_flight.fetch_sub(1, Ordering::Relaxed);
            });

            match messenger.send(&phone, &body).await {
                Ok(receipt) => {
                    tracing::info!(
                        request_id = %request_id,
                        donor_id = %donor_id,
                        message_id = %receipt.message_id,
                        "Donor notified"
                    );
                    events.publish(Event::DonorNotified {
                        request_id,
                        donor_id,
                    });
                    DonorSendOutcome::Sent(donor_id)
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request_id,
                        donor_id = %donor_id,
                        error = %e,
                        "Notification send failed"
                    );
                    DonorSendOutcome::Failed(donor_id)
                }
            }
        }
    }
}
