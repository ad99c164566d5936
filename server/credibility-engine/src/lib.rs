//! Neighborhood incident lifecycle and credibility engine.
//!
//! Deduplicates incoming reports against recent incidents, scores credibility
//! deterministically, enforces the confirmation state machine and role capabilities,
//! schedules follow-up check-ins (fired at most once by a background sweep) and keeps
//! an append-only reward ledger.
//!
//! No network, no database; an in-memory transactional store with JSON snapshots.

pub mod clock;
pub mod command;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod locations;
pub mod normalize;
pub mod notify;
pub mod scheduler;
pub mod scoring;
pub mod status;
pub mod store;
pub mod sweeper;
pub mod taxonomy;
pub mod types;

pub use config::Config;
pub use engine::Engine;
pub use error::{EngineError, StoreError};
pub use store::{IncidentStore, MemoryStore};
pub use types::{Actor, Incident, IncidentId, Role, UserId};
