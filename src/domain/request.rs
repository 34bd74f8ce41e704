//! Blood request record and its lifecycle state machine.
//!
//! A request starts `active` and moves to exactly one terminal state:
//! `fulfilled` (quota met), `expired` (deadline passed under quota), or
//! `cancelled` (explicit hospital/admin action). Terminal states are sticky.
//! The transitions themselves are decided by the store's conditional updates;
//! this module defines the record, the predicate logic, and the donor-facing
//! public view.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::blood::{BloodGroup, Urgency};
use super::donor::DonorId;
use crate::error::{BloodlineError, Result};

/// Unique identifier for a blood request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Lifecycle status of a blood request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Active,
    Fulfilled,
    Expired,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Active => "active",
            RequestStatus::Fulfilled => "fulfilled",
            RequestStatus::Expired => "expired",
            RequestStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal states permit no further transitions.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::Active)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(RequestStatus::Active),
            "fulfilled" => Ok(RequestStatus::Fulfilled),
            "expired" => Ok(RequestStatus::Expired),
            "cancelled" => Ok(RequestStatus::Cancelled),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// Hospital-supplied parameters for opening a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestInput {
    /// Hospital requesting the blood (rendered into notifications).
    pub hospital: String,
    pub blood_group: BloodGroup,
    /// Units of blood needed (>= 1).
    pub quantity_needed: u32,
    pub urgency: Urgency,
    /// Deadline after which the request expires.
    pub required_by: DateTime<Utc>,
    /// Donors notified per batch (>= 1).
    pub batch_size: u32,
    /// Minutes to wait for responses before advancing to the next batch (>= 1).
    pub response_window_minutes: u32,
}

impl RequestInput {
    /// Reject malformed input before any state is created.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        if self.hospital.trim().is_empty() {
            return Err(BloodlineError::Validation(
                "hospital name must not be empty".to_string(),
            ));
        }
        if self.quantity_needed < 1 {
            return Err(BloodlineError::Validation(
                "quantity_needed must be at least 1".to_string(),
            ));
        }
        if self.batch_size < 1 {
            return Err(BloodlineError::Validation(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if self.response_window_minutes < 1 {
            return Err(BloodlineError::Validation(
                "response_window_minutes must be at least 1".to_string(),
            ));
        }
        if self.required_by <= now {
            return Err(BloodlineError::Validation(
                "required_by must be in the future".to_string(),
            ));
        }
        Ok(())
    }
}

/// A blood request and its notification progress.
///
/// Invariants, enforced by the store's conditional updates:
/// - `confirmed_units <= quantity_needed` always
/// - a donor id is in at most one of `remaining_donor_queue` /
///   `notified_donor_ids`, never both, never twice
/// - once `status` leaves `active` it never returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloodRequest {
    pub id: RequestId,
    pub hospital: String,
    pub blood_group: BloodGroup,
    pub quantity_needed: u32,
    pub urgency: Urgency,
    pub required_by: DateTime<Utc>,
    pub status: RequestStatus,
    /// Monotonic non-decreasing confirmed donation count.
    pub confirmed_units: u32,
    pub batch_size: u32,
    pub response_window_minutes: u32,
    /// Donors already notified, in send order (append-only).
    pub notified_donor_ids: Vec<DonorId>,
    /// Eligible donors not yet notified, FIFO in batch-send priority order.
    pub remaining_donor_queue: VecDeque<DonorId>,
    /// When the current batch was sent, if one has been.
    pub batch_sent_at: Option<DateTime<Utc>>,
    /// True while a sent batch's response window is open.
    pub batch_in_progress: bool,
    pub created_at: DateTime<Utc>,
}

impl BloodRequest {
    /// Build a fresh request from validated input and its candidate queue.
    pub fn new(input: RequestInput, queue: Vec<DonorId>, now: DateTime<Utc>) -> Self {
        Self {
            id: RequestId::from(Uuid::new_v4()),
            hospital: input.hospital,
            blood_group: input.blood_group,
            quantity_needed: input.quantity_needed,
            urgency: input.urgency,
            required_by: input.required_by,
            status: RequestStatus::Active,
            confirmed_units: 0,
            batch_size: input.batch_size,
            response_window_minutes: input.response_window_minutes,
            notified_donor_ids: Vec::new(),
            remaining_donor_queue: queue.into(),
            batch_sent_at: None,
            batch_in_progress: false,
            created_at: now,
        }
    }

    /// Evaluate the lifecycle at `now`.
    ///
    /// Terminal states short-circuit without re-evaluating fulfillment or
    /// expiry; an active request is fulfilled when the quota is met and
    /// expired when the deadline has passed under quota.
    pub fn lifecycle_status(&self, now: DateTime<Utc>) -> RequestStatus {
        match self.status {
            RequestStatus::Active => {
                if self.confirmed_units >= self.quantity_needed {
                    RequestStatus::Fulfilled
                } else if now > self.required_by {
                    RequestStatus::Expired
                } else {
                    RequestStatus::Active
                }
            }
            terminal => terminal,
        }
    }

    /// Whether the current batch's response window has elapsed at `now`.
    /// False when no batch has been sent.
    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.batch_sent_at {
            Some(sent_at) => {
                now - sent_at >= Duration::minutes(self.response_window_minutes as i64)
            }
            None => false,
        }
    }

    /// Units still needed to fulfill the request.
    pub fn units_remaining(&self) -> u32 {
        self.quantity_needed.saturating_sub(self.confirmed_units)
    }
}

/// Donor-facing view of a request, served behind response links.
///
/// Once a request closes, the view collapses to a generic marker so no
/// remaining details leak past the terminal transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PublicRequestView {
    Closed,
    Active {
        request_id: RequestId,
        hospital: String,
        blood_group: BloodGroup,
        urgency: Urgency,
        units_remaining: u32,
        required_by: DateTime<Utc>,
    },
}

impl PublicRequestView {
    pub fn of(request: &BloodRequest, now: DateTime<Utc>) -> Self {
        match request.lifecycle_status(now) {
            RequestStatus::Active => PublicRequestView::Active {
                request_id: request.id,
                hospital: request.hospital.clone(),
                blood_group: request.blood_group,
                urgency: request.urgency,
                units_remaining: request.units_remaining(),
                required_by: request.required_by,
            },
            _ => PublicRequestView::Closed,
        }
    }
}
