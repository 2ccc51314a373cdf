//! # offer-claim
//!
//! `offer-claim` decides which promotional offers a user may redeem when many
//! claimants race for the same daily redemption budgets across a sharded
//! counter store.
//!
//! ## Core Philosophy
//!
//! Claiming an offer is a check-and-increment against one or two counter
//! cells, and the race between the check and the increment is exactly where
//! over-grants come from. This crate never tries to win that race client-side:
//! there is no in-process locking, no lock manager, no sequencer. Every claim
//! is shipped to the store as a single indivisible unit, and the store's
//! per-key atomicity is the only coordination mechanism between claimants.
//!
//! ## Key Concepts
//!
//! * **Catalog**: an immutable offer id → cap configuration map, built once at
//!   startup and passed in explicitly.
//! * **Counter cells**: daily counters named by a fixed key scheme; the two
//!   cells of a dual-capped offer share a colocation tag so the store places
//!   them on one shard, which is what makes a two-cell atomic unit legal.
//! * **Atomic claim primitive**: [`CounterStore::claim_single`] and
//!   [`CounterStore::claim_dual`], each executing its whole
//!   read-check-increment(-compensate) sequence with no observable
//!   intermediate state.
//! * **Strategy**: [`AtomicStrategy`] picks between checking before
//!   incrementing and incrementing before checking (with compensation); both
//!   uphold the same at-most-cap guarantee.
//! * **Orchestrator**: composes per-offer claims into "secure N offers out of
//!   a candidate pool" with bounded retries and an attempted-set that makes
//!   every offer a single-shot.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use offer_claim::Catalog;
//! use offer_claim::MemoryStore;
//! use offer_claim::Orchestrator;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let catalog = Arc::new(
//!     Catalog::from_json_str(
//!         r#"{ "launch-day": { "type": "BOTH", "global_cap": 100, "user_cap": 1 } }"#,
//!     )
//!     .unwrap(),
//! );
//! let store = Arc::new(MemoryStore::new(3));
//! let orchestrator = Orchestrator::new(store, catalog);
//!
//! let report = orchestrator
//!     .secure_offers("user-1", &["launch-day".to_string()], 1)
//!     .await
//!     .unwrap();
//! assert!(report.target_met());
//! # }
//! ```

mod catalog;
mod keys;
mod memory;
mod orchestrator;
mod outcome;
mod store;
mod strategy;

pub use catalog::Catalog;
pub use catalog::CatalogError;
pub use catalog::OfferKind;
pub use keys::CellKey;
pub use keys::DayStamp;
pub use keys::InvalidId;
pub use keys::ResetSchedule;
pub use keys::SLOT_COUNT;
pub use keys::global_cell;
pub use keys::user_cell;
pub use keys::validate_id;
pub use memory::MemoryStore;
pub use orchestrator::FailureMode;
pub use orchestrator::GrantPolicy;
pub use orchestrator::GrantReport;
pub use orchestrator::Orchestrator;
pub use orchestrator::SecureError;
pub use outcome::ClaimOutcome;
pub use outcome::DenyReason;
pub use store::CounterStore;
pub use store::DualClaim;
pub use store::SingleClaim;
pub use store::StoreError;
pub use strategy::AtomicStrategy;
