//! End-to-end tests over the in-memory store: real engine, real dispatcher,
//! real scheduler ticks driven with an explicit clock, mock messenger.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use bloodline::{
    BloodGroup, BloodlineError, Donor, DonorId, Engine, Event, EventSink, MemoryDirectory,
    MemoryStore, MockMessenger, PublicRequestView, RequestInput, ResponseToken, Scheduler,
    SchedulerConfig, Urgency,
};

type TestEngine = Engine<MemoryStore, MemoryDirectory, MockMessenger>;

struct Harness {
    engine: Arc<TestEngine>,
    store: Arc<MemoryStore>,
    directory: Arc<MemoryDirectory>,
    messenger: Arc<MockMessenger>,
    scheduler: Scheduler<MemoryStore, MemoryDirectory, MockMessenger>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let directory = Arc::new(MemoryDirectory::new());
    let messenger = Arc::new(MockMessenger::new());
    let engine = Arc::new(Engine::new(
        store.clone(),
        directory.clone(),
        messenger.clone(),
    ));
    let scheduler = Scheduler::new(
        store.clone(),
        engine.dispatcher().clone(),
        engine.events().clone() as Arc<dyn EventSink>,
        SchedulerConfig::default(),
    );
    Harness {
        engine,
        store,
        directory,
        messenger,
        scheduler,
    }
}

fn donor(name: &str, group: BloodGroup, phone: &str) -> Donor {
    Donor {
        id: DonorId(uuid::Uuid::new_v4()),
        name: name.to_string(),
        blood_group: group,
        phone: Some(phone.to_string()),
        last_donation: None,
    }
}

fn input(group: BloodGroup, quantity: u32, batch_size: u32, window_minutes: u32) -> RequestInput {
    RequestInput {
        hospital: "City General".to_string(),
        blood_group: group,
        quantity_needed: quantity,
        urgency: Urgency::High,
        required_by: Utc::now() + chrono::Duration::hours(24),
        batch_size,
        response_window_minutes: window_minutes,
    }
}

/// Poll until `cond` holds; the first dispatch after create runs detached.
async fn wait_for(cond: impl Fn() -> bool, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn extract_token(body: &str) -> ResponseToken {
    let after = body
        .split("/respond/")
        .nth(1)
        .expect("message body carries a response URL");
    let raw: String = after
        .chars()
        .take_while(|c| c.is_ascii_hexdigit() || *c == '-')
        .collect();
    ResponseToken::from_str(&raw).expect("response URL carries a valid token")
}

#[test_log::test(tokio::test)]
async fn test_batches_advance_until_quota_is_met() {
    let h = harness();
    for name in ["alice", "bob", "carol", "dave", "erin"] {
        h.directory.add_donor(donor(
            name,
            BloodGroup::ONegative,
            &format!("+1555{name}"),
        ));
    }

    let id = h
        .engine
        .create_request(input(BloodGroup::ONegative, 3, 1, 2))
        .await
        .unwrap();

    // First batch of one goes out on create
    wait_for(|| h.messenger.call_count() == 1, "first batch send").await;
    assert_eq!(h.messenger.recipients(), vec!["+1555alice".to_string()]);

    // Window not elapsed yet: a tick now must not advance the batch
    h.scheduler.tick(Utc::now()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.messenger.call_count(), 1);

    // Window elapsed: the next donor in name order is notified, alice is not
    // re-sent
    h.scheduler.tick(Utc::now() + chrono::Duration::minutes(3)).await;
    wait_for(|| h.messenger.call_count() == 2, "second batch send").await;
    assert_eq!(
        h.messenger.recipients(),
        vec!["+1555alice".to_string(), "+1555bob".to_string()]
    );

    // Three confirmations meet the quota
    for _ in 0..3 {
        h.engine.confirm_donation(id).await.unwrap();
    }
    let err = h.engine.confirm_donation(id).await.unwrap_err();
    assert!(matches!(err, BloodlineError::AlreadyClosed(_)));

    // Donor-facing view reports closed without details
    let view = h.engine.public_view(id).await.unwrap();
    assert!(matches!(view, PublicRequestView::Closed));
}

#[test_log::test(tokio::test)]
async fn test_concurrent_confirmations_never_overshoot_quota() {
    let h = harness();
    h.directory
        .add_donor(donor("alice", BloodGroup::APositive, "+15550001"));

    let id = h
        .engine
        .create_request(input(BloodGroup::APositive, 3, 1, 5))
        .await
        .unwrap();
    wait_for(|| h.messenger.call_count() == 1, "first batch send").await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let engine = h.engine.clone();
        handles.push(tokio::spawn(
            async move { engine.confirm_donation(id).await },
        ));
    }
    let mut confirmed = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => confirmed += 1,
            Err(BloodlineError::AlreadyClosed(_)) => rejected += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(confirmed, 3);
    assert_eq!(rejected, 7);
}

#[test_log::test(tokio::test)]
async fn test_overlapping_dispatches_claim_one_batch() {
    let h = harness();
    for name in ["alice", "bob", "carol", "dave"] {
        h.directory.add_donor(donor(
            name,
            BloodGroup::BNegative,
            &format!("+1555{name}"),
        ));
    }

    let id = h
        .engine
        .create_request(input(BloodGroup::BNegative, 4, 2, 5))
        .await
        .unwrap();
    wait_for(|| h.messenger.call_count() == 2, "first batch send").await;

    // With a batch already in progress, overlapping dispatch calls are no-ops
    let dispatcher = h.engine.dispatcher().clone();
    tokio::join!(
        dispatcher.send_next_batch(id),
        dispatcher.send_next_batch(id),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.messenger.call_count(), 2);
}

#[test_log::test(tokio::test)]
async fn test_cancelled_request_is_terminal() {
    let h = harness();
    h.directory
        .add_donor(donor("alice", BloodGroup::AbPositive, "+15550001"));
    h.directory
        .add_donor(donor("bob", BloodGroup::AbPositive, "+15550002"));

    let id = h
        .engine
        .create_request(input(BloodGroup::AbPositive, 2, 1, 2))
        .await
        .unwrap();
    wait_for(|| h.messenger.call_count() == 1, "first batch send").await;

    h.engine.cancel_request(id).await.unwrap();

    // Confirmation is refused and the window lapse no longer advances batches
    let err = h.engine.confirm_donation(id).await.unwrap_err();
    assert!(matches!(err, BloodlineError::AlreadyClosed(_)));

    h.scheduler.tick(Utc::now() + chrono::Duration::minutes(3)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.messenger.call_count(), 1);
}

#[test_log::test(tokio::test)]
async fn test_response_token_is_single_use() {
    let h = harness();
    h.directory
        .add_donor(donor("alice", BloodGroup::OPositive, "+15550001"));

    h.engine
        .create_request(input(BloodGroup::OPositive, 2, 1, 5))
        .await
        .unwrap();
    wait_for(|| h.messenger.call_count() == 1, "first batch send").await;

    let body = h.messenger.get_calls()[0].body.clone();
    let token = extract_token(&body);

    let confirmation = h.engine.confirm_with_token(token).await.unwrap();
    assert_eq!(confirmation.confirmed_units, 1);
    assert!(!confirmation.fulfilled);

    let err = h.engine.confirm_with_token(token).await.unwrap_err();
    assert!(matches!(err, BloodlineError::TokenNotFound));
}

#[test_log::test(tokio::test)]
async fn test_expiry_blocks_confirmation_and_advancement() {
    let h = harness();
    h.directory
        .add_donor(donor("alice", BloodGroup::ANegative, "+15550001"));
    h.directory
        .add_donor(donor("bob", BloodGroup::ANegative, "+15550002"));

    let id = h
        .engine
        .create_request(input(BloodGroup::ANegative, 2, 1, 2))
        .await
        .unwrap();
    wait_for(|| h.messenger.call_count() == 1, "first batch send").await;

    let (sub_id, mut events) = h.engine.events().subscribe(16);

    // Past the deadline the sweep expires the request; the elapsed window in
    // the same tick must not notify anyone else
    h.scheduler.tick(Utc::now() + chrono::Duration::hours(25)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.messenger.call_count(), 1);

    let mut saw_expired = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, Event::RequestExpired { request_id } if request_id == id) {
            saw_expired = true;
        }
    }
    assert!(saw_expired);
    h.engine.events().unsubscribe(sub_id);

    let err = h.engine.confirm_donation(id).await.unwrap_err();
    assert!(matches!(err, BloodlineError::AlreadyClosed(_)));
    let view = h.engine.public_view(id).await.unwrap();
    assert!(matches!(view, PublicRequestView::Closed));
}

#[test_log::test(tokio::test)]
async fn test_scheduler_skips_cycle_during_store_outage() {
    let h = harness();
    h.directory
        .add_donor(donor("alice", BloodGroup::BPositive, "+15550001"));
    h.directory
        .add_donor(donor("bob", BloodGroup::BPositive, "+15550002"));

    h.engine
        .create_request(input(BloodGroup::BPositive, 2, 1, 2))
        .await
        .unwrap();
    wait_for(|| h.messenger.call_count() == 1, "first batch send").await;

    // Outage: the cycle is skipped without panicking and nothing advances
    h.store.set_available(false);
    h.scheduler.tick(Utc::now() + chrono::Duration::minutes(3)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.messenger.call_count(), 1);

    // Recovery: the next cycle picks the request back up
    h.store.set_available(true);
    h.scheduler.tick(Utc::now() + chrono::Duration::minutes(3)).await;
    wait_for(|| h.messenger.call_count() == 2, "post-outage batch send").await;
}

#[test_log::test(tokio::test)]
async fn test_one_failed_send_does_not_block_the_batch() {
    let h = harness();
    for name in ["alice", "bob", "carol"] {
        h.directory.add_donor(donor(
            name,
            BloodGroup::AbNegative,
            &format!("+1555{name}"),
        ));
    }
    h.messenger.fail_next("+1555bob", "provider rejected");

    h.engine
        .create_request(input(BloodGroup::AbNegative, 3, 3, 5))
        .await
        .unwrap();

    // All three sends are attempted; bob's failure doesn't stop the others
    wait_for(|| h.messenger.call_count() == 3, "full batch attempted").await;
    let mut recipients = h.messenger.recipients();
    recipients.sort();
    assert_eq!(
        recipients,
        vec![
            "+1555alice".to_string(),
            "+1555bob".to_string(),
            "+1555carol".to_string()
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_donor_without_phone_is_skipped() {
    let h = harness();
    let mut silent = donor("alice", BloodGroup::OPositive, "unused");
    silent.phone = None;
    h.directory.add_donor(silent);
    h.directory
        .add_donor(donor("bob", BloodGroup::OPositive, "+15550002"));

    h.engine
        .create_request(input(BloodGroup::OPositive, 1, 2, 5))
        .await
        .unwrap();

    // The contact-less donor burns a batch slot but produces no send
    wait_for(|| h.messenger.call_count() == 1, "batch send").await;
    assert_eq!(h.messenger.recipients(), vec!["+15550002".to_string()]);
}

#[test_log::test(tokio::test)]
async fn test_request_with_no_eligible_donors_stays_active() {
    let h = harness();
    h.directory
        .add_donor(donor("alice", BloodGroup::APositive, "+15550001"));

    let id = h
        .engine
        .create_request(input(BloodGroup::ONegative, 1, 1, 5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.messenger.call_count(), 0);

    // The request waits for its deadline rather than failing
    let view = h.engine.public_view(id).await.unwrap();
    assert!(matches!(view, PublicRequestView::Active { .. }));
}
