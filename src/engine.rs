//! Public engine surface: open requests, serve donor-facing reads, and
//! coordinate confirmations.

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::directory::DonorDirectory;
use crate::dispatch::Dispatcher;
use crate::domain::donor::eligible_donors;
use crate::domain::request::{BloodRequest, PublicRequestView, RequestId, RequestInput};
use crate::domain::token::ResponseToken;
use crate::error::Result;
use crate::events::{Event, EventHub, EventSink};
use crate::notify::MessageTemplates;
use crate::notify::Messenger;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::store::{Confirmation, RequestStore};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL prepended to response tokens in outbound messages.
    pub response_url_base: String,
    pub templates: MessageTemplates,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            response_url_base: "https://bloodline.example.org".to_string(),
            templates: MessageTemplates::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// The batch notification and fulfillment engine.
///
/// Generic over its three collaborators: the request store (arbiter of every
/// racy transition), the donor directory, and the outbound messenger.
///
/// # Example
/// ```ignore
/// let engine = Arc::new(Engine::new(store, directory, messenger));
/// let handle = engine.run(shutdown_token.clone());
///
/// let id = engine.create_request(input).await?;
/// // donors respond via tokens...
/// engine.confirm_donation(id).await?;
/// ```
pub struct Engine<S, D, M> {
    store: Arc<S>,
    directory: Arc<D>,
    messenger: Arc<M>,
    events: Arc<EventHub>,
    dispatcher: Arc<Dispatcher<S, D, M>>,
    config: EngineConfig,
}

impl<S, D, M> Engine<S, D, M>
where
    S: RequestStore + 'static,
    D: DonorDirectory + 'static,
    M: Messenger + 'static,
{
    /// Create an engine with default configuration.
    pub fn new(store: Arc<S>, directory: Arc<D>, messenger: Arc<M>) -> Self {
        Self::build(store, directory, messenger, EngineConfig::default())
    }

    /// Set a custom configuration. Builder method chained after `new()`.
    pub fn with_config(self, config: EngineConfig) -> Self {
        Self::build(self.store, self.directory, self.messenger, config)
    }

    fn build(store: Arc<S>, directory: Arc<D>, messenger: Arc<M>, config: EngineConfig) -> Self {
        let events = Arc::new(EventHub::new());
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            directory.clone(),
            messenger.clone(),
            events.clone() as Arc<dyn EventSink>,
            Arc::new(config.templates.clone()),
            config.response_url_base.clone(),
        ));
        Self {
            store,
            directory,
            messenger,
            events,
            dispatcher,
            config,
        }
    }

    /// Live-update event hub (subscribe for UI/audit streams).
    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// The dispatcher, for collaborators that trigger sends directly.
    pub fn dispatcher(&self) -> &Arc<Dispatcher<S, D, M>> {
        &self.dispatcher
    }

    /// Spawn the background scheduler. Returns its join handle; cancel the
    /// token to stop it.
    pub fn run(&self, shutdown_token: CancellationToken) -> JoinHandle<()> {
        let scheduler = Arc::new(Scheduler::new(
            self.store.clone(),
            self.dispatcher.clone(),
            self.events.clone() as Arc<dyn EventSink>,
            self.config.scheduler.clone(),
        ));
        tokio::spawn(scheduler.run(shutdown_token))
    }

    /// Open a blood request: validate, build the eligibility queue from a
    /// directory snapshot, persist, and trigger the first batch dispatch.
    ///
    /// Returns as soon as the request is stored; the first dispatch runs
    /// detached from this call.
    #[tracing::instrument(skip(self, input), fields(blood_group = %input.blood_group, urgency = %input.urgency))]
    pub async fn create_request(&self, input: RequestInput) -> Result<RequestId> {
        let now = Utc::now();
        input.validate(now)?;

        let snapshot = self.directory.list_donors(Some(input.blood_group)).await?;
        let queue = eligible_donors(input.blood_group, &snapshot, now);
        if queue.is_empty() {
            // Not an error: the request stays active until its deadline in
            // case the directory gains donors
            tracing::warn!("No eligible donors for request at creation time");
        }

        let request = BloodRequest::new(input, queue, now);
        let request_id = request.id;
        self.store.insert_request(&request).await?;

        counter!("bloodline_requests_opened_total").increment(1);
        tracing::info!(
            request_id = %request_id,
            eligible = request.remaining_donor_queue.len(),
            quantity = request.quantity_needed,
            "Blood request opened"
        );
        self.events.publish(Event::RequestOpened {
            request_id,
            blood_group: request.blood_group,
            quantity_needed: request.quantity_needed,
            eligible_donors: request.remaining_donor_queue.len(),
        });

        // First dispatch, detached from the caller's request/response cycle
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher.send_next_batch(request_id).await;
        });

        Ok(request_id)
    }

    /// Donor-facing read used behind response links. Closed requests return
    /// the generic closed marker, leaking nothing further.
    pub async fn public_view(&self, request_id: RequestId) -> Result<PublicRequestView> {
        let now = Utc::now();
        let request = self.store.fetch_request(request_id, now).await?;
        Ok(PublicRequestView::of(&request, now))
    }

    /// Record one confirmed donation against a request.
    ///
    /// The increment is a single conditional update at the store; two
    /// concurrent confirmations can never both pass a stale check.
    ///
    /// # Errors
    /// `RequestNotFound` for an unknown id; `AlreadyClosed` when the request
    /// is fulfilled, expired, cancelled, or past its deadline.
    #[tracing::instrument(skip(self), fields(request_id = %request_id))]
    pub async fn confirm_donation(&self, request_id: RequestId) -> Result<Confirmation> {
        let now = Utc::now();
        let confirmation = match self.store.confirm_donation(request_id, now).await {
            Ok(confirmation) => confirmation,
            Err(e) => {
                counter!("bloodline_confirmations_rejected_total").increment(1);
                return Err(e);
            }
        };

        counter!("bloodline_confirmations_total").increment(1);
        tracing::info!(
            confirmed_units = confirmation.confirmed_units,
            fulfilled = confirmation.fulfilled,
            "Donation confirmed"
        );
        self.events.publish(Event::DonationConfirmed {
            request_id,
            confirmed_units: confirmation.confirmed_units,
        });
        if confirmation.fulfilled {
            counter!("bloodline_requests_fulfilled_total").increment(1);
            tracing::info!("Request fulfilled");
            self.events.publish(Event::RequestFulfilled { request_id });
        }
        Ok(confirmation)
    }

    /// Confirm via a donor's single-use response token.
    ///
    /// Consumes the token first; a second use of the same token fails with
    /// `TokenNotFound` regardless of the request's state.
    pub async fn confirm_with_token(&self, token: ResponseToken) -> Result<Confirmation> {
        let now = Utc::now();
        let record = self.store.consume_token(token, now).await?;
        tracing::debug!(
            request_id = %record.request_id,
            donor_id = %record.donor_id,
            "Response token consumed"
        );
        self.confirm_donation(record.request_id).await
    }

    /// Explicit hospital/admin cancellation.
    pub async fn cancel_request(&self, request_id: RequestId) -> Result<()> {
        let now = Utc::now();
        self.store.cancel_request(request_id, now).await?;
        counter!("bloodline_requests_cancelled_total").increment(1);
        tracing::info!(request_id = %request_id, "Request cancelled");
        self.events.publish(Event::RequestCancelled { request_id });
        Ok(())
    }
}
