//! Donor shape and the eligibility filter.
//!
//! Donors live in an external directory service; this module defines the one
//! canonical shape they are normalized into at that boundary (no fallback
//! field lookups reach this core) and the pure filter that turns a directory
//! snapshot into a request's ordered candidate queue.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::blood::BloodGroup;

/// A donor may give blood again this many months after their last donation.
pub const DONATION_EXCLUSION_MONTHS: u32 = 3;

/// Unique identifier for a donor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DonorId(pub Uuid);

impl std::fmt::Display for DonorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for DonorId {
    fn from(uuid: Uuid) -> Self {
        DonorId(uuid)
    }
}

impl std::ops::Deref for DonorId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Canonical donor record as read from the directory service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donor {
    pub id: DonorId,
    /// Display name; the batch-send priority order is lexical on this field.
    pub name: String,
    pub blood_group: BloodGroup,
    /// Phone contact. Donors without one are skipped at send time.
    pub phone: Option<String>,
    /// When the donor last gave blood, if ever.
    pub last_donation: Option<DateTime<Utc>>,
}

impl Donor {
    /// A donor is eligible when the blood group matches exactly and the last
    /// donation (if any) is at least the exclusion window ago.
    pub fn is_eligible(&self, group: BloodGroup, now: DateTime<Utc>) -> bool {
        if self.blood_group != group {
            return false;
        }
        match self.last_donation {
            None => true,
            Some(last) => last <= now - Months::new(DONATION_EXCLUSION_MONTHS),
        }
    }
}

/// Build the ordered candidate queue for a request from a directory snapshot.
///
/// Pure: no I/O, no side effects. Output is sorted by donor display name
/// (case-sensitive lexical); ties keep the snapshot's order. An empty
/// snapshot or zero matches yields an empty queue.
pub fn eligible_donors(
    group: BloodGroup,
    snapshot: &[Donor],
    now: DateTime<Utc>,
) -> Vec<DonorId> {
    let mut matched: Vec<&Donor> = snapshot
        .iter()
        .filter(|donor| donor.is_eligible(group, now))
        .collect();
    // Stable sort, so insertion order breaks name ties
    matched.sort_by(|a, b| a.name.cmp(&b.name));
    matched.into_iter().map(|donor| donor.id).collect()
}
