//! Batch notification and fulfillment engine for emergency blood requests.
//!
//! This crate provides an [`Engine`] that accepts blood requests from
//! hospitals and notifies matching donors in small batches rather than all at
//! once. Behind the scenes, a scheduler advances each request through its
//! donor queue as response windows elapse, and a conditional-update store
//! guarantees a request is never confirmed past its quota, however many
//! donors respond at once.
//!
//! Notification engine with PostgreSQL or in-memory storage and a background
//! scheduler for batch advancement.

pub mod directory;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod events;
pub mod notify;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use directory::{DonorDirectory, MemoryDirectory};
pub use dispatch::Dispatcher;
pub use domain::blood::{BloodGroup, PriorityTier, Urgency};
pub use domain::donor::{Donor, DonorId};
pub use domain::request::{
    BloodRequest, PublicRequestView, RequestId, RequestInput, RequestStatus,
};
pub use domain::token::{ResponseToken, TokenRecord};
pub use engine::{Engine, EngineConfig};
pub use error::{BloodlineError, Result};
pub use events::{Event, EventHub, EventSink};
pub use notify::{MessageTemplates, Messenger, MockMessenger, SendReceipt};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::memory::MemoryStore;
pub use store::{BatchClaim, Confirmation, RequestStore};

#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;

/// Get the bloodline database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
