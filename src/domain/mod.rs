//! Domain types: blood groups, donors, requests, and response tokens.

pub mod blood;
pub mod donor;
pub mod request;
pub mod token;

pub use blood::{BloodGroup, PriorityTier, Urgency};
pub use donor::{DONATION_EXCLUSION_MONTHS, Donor, DonorId, eligible_donors};
pub use request::{BloodRequest, PublicRequestView, RequestId, RequestInput, RequestStatus};
pub use token::{ResponseToken, TokenRecord};
