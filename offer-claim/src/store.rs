//! The store-adapter seam: what the claim protocol requires from a sharded
//! counter substrate.

use async_trait::async_trait;

use crate::keys::CellKey;
use crate::outcome::ClaimOutcome;
use crate::strategy::AtomicStrategy;

/// Failures surfaced by a [`CounterStore`].
///
/// Capacity exhaustion is never an error; it is a [`ClaimOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Network, routing or server failure. The claim was not applied.
    #[error("store communication failed: {0}")]
    Transport(String),

    /// The call did not complete in time, so the claim outcome is unknown.
    /// It must be counted as not granted and must not be blindly retried: a
    /// retry after a successful-but-unacknowledged increment would over-grant.
    #[error("store call timed out; claim outcome indeterminate")]
    Timeout,

    /// A dual-cell claim whose keys map to different shards.
    ///
    /// This is a key-scheme bug. Executing the pair non-atomically would
    /// reopen the over-grant race, so it always fails loudly instead of
    /// degrading.
    #[error(
        "keys `{global_key}` (slot {global_slot}) and `{user_key}` (slot {user_slot}) \
         are not colocated"
    )]
    CrossSlot {
        global_key: String,
        user_key: String,
        global_slot: u16,
        user_slot: u16,
    },
}

/// One single-cell atomic claim: check-and-increment `key` against `cap`.
#[derive(Debug, Clone)]
pub struct SingleClaim {
    pub key: CellKey,
    pub cap: u64,
    /// Unix seconds at which the cell expires, applied only by the increment
    /// that creates the cell.
    pub expire_at: i64,
    pub strategy: AtomicStrategy,
}

/// One dual-cell atomic claim over a colocated global/user pair.
#[derive(Debug, Clone)]
pub struct DualClaim {
    pub global_key: CellKey,
    pub user_key: CellKey,
    pub global_cap: u64,
    pub user_cap: u64,
    pub expire_at: i64,
    pub strategy: AtomicStrategy,
}

impl DualClaim {
    /// Every store must refuse a pair that is not colocated; run this before
    /// dispatching the atomic unit.
    pub fn check_colocated(&self) -> Result<(), StoreError> {
        let global_slot = self.global_key.hash_slot();
        let user_slot = self.user_key.hash_slot();
        if global_slot == user_slot {
            Ok(())
        } else {
            Err(StoreError::CrossSlot {
                global_key: self.global_key.as_str().to_string(),
                user_key: self.user_key.as_str().to_string(),
                global_slot,
                user_slot,
            })
        }
    }
}

/// The sharded counter substrate the claim protocol runs against.
///
/// Implementations guarantee that [`claim_single`](CounterStore::claim_single)
/// and [`claim_dual`](CounterStore::claim_dual) execute their whole
/// read-check-increment(-compensate) sequence as one indivisible unit scoped
/// to the touched keys: no other operation observes an intermediate state,
/// and claims against the same cell are totally ordered.
///
/// `incr`, `decr` and `expire_at` exist for administration and compensation.
/// No code path may issue a bare `incr` against a cap-governed cell: an
/// increment outside an atomic unit voids the at-most-cap invariant.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Current count of a cell; absent (or expired) cells read as `None`.
    async fn fetch(&self, key: &CellKey) -> Result<Option<u64>, StoreError>;

    /// Bulk read. Not atomic across keys and never used to enforce caps.
    async fn fetch_many(&self, keys: &[CellKey]) -> Result<Vec<Option<u64>>, StoreError>;

    /// Post-increment value; creates the cell at 1 when absent.
    async fn incr(&self, key: &CellKey) -> Result<u64, StoreError>;

    /// Post-decrement value, saturating at zero (a cell never goes negative;
    /// one decremented to zero reads as absent).
    async fn decr(&self, key: &CellKey) -> Result<u64, StoreError>;

    /// Sets the absolute expiry of an existing cell.
    async fn expire_at(&self, key: &CellKey, unix_seconds: i64) -> Result<(), StoreError>;

    /// Executes one single-cell claim as an atomic unit.
    async fn claim_single(&self, claim: &SingleClaim) -> Result<ClaimOutcome, StoreError>;

    /// Executes one dual-cell claim as an atomic unit over a colocated pair.
    async fn claim_dual(&self, claim: &DualClaim) -> Result<ClaimOutcome, StoreError>;
}
