//! An in-process rendition of the sharded counter store.
//!
//! Faithful to the external store's contract rather than convenient: keys are
//! placed on shards by hash slot, an atomic unit runs entirely under its
//! shard's lock, a cross-shard dual claim is refused, and a cell at or past
//! its expiry instant reads as absent. Tests and the stress harness run
//! against this store; production runs against the cluster adapter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;

use crate::keys::CellKey;
use crate::outcome::ClaimOutcome;
use crate::outcome::DenyReason;
use crate::store::CounterStore;
use crate::store::DualClaim;
use crate::store::SingleClaim;
use crate::store::StoreError;
use crate::strategy::AtomicStrategy;

#[derive(Debug, Clone, Copy)]
struct Cell {
    count: u64,
    expires_at: Option<i64>,
}

type Shard = Mutex<HashMap<CellKey, Cell>>;

/// In-memory sharded counter store.
#[derive(Debug)]
pub struct MemoryStore {
    shards: Vec<Shard>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(3)
    }
}

impl MemoryStore {
    pub fn new(shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &CellKey) -> &Shard {
        &self.shards[key.hash_slot() as usize % self.shards.len()]
    }

    fn lock(&self, key: &CellKey) -> Result<std::sync::MutexGuard<'_, HashMap<CellKey, Cell>>, StoreError> {
        self.shard_for(key)
            .lock()
            .map_err(|_| StoreError::Transport("shard lock poisoned".to_string()))
    }

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or(0)
    }

    /// Raw expiry of a cell, if it exists. Intended for tests and audits.
    pub fn expiry_of(&self, key: &CellKey) -> Option<i64> {
        let cells = self.shard_for(key).lock().ok()?;
        cells.get(key)?.expires_at
    }
}

// Cell helpers. All of them run with the owning shard locked, which is what
// makes a claim's whole sequence one unit: nothing else touches the shard
// until the guard drops, and there is no await while it is held.

fn prune_expired(cells: &mut HashMap<CellKey, Cell>, key: &CellKey, now: i64) {
    if let Some(cell) = cells.get(key)
        && cell.expires_at.is_some_and(|at| at <= now)
    {
        cells.remove(key);
    }
}

fn live_count(cells: &mut HashMap<CellKey, Cell>, key: &CellKey, now: i64) -> u64 {
    prune_expired(cells, key, now);
    cells.get(key).map_or(0, |cell| cell.count)
}

fn bump(cells: &mut HashMap<CellKey, Cell>, key: &CellKey, now: i64) -> u64 {
    prune_expired(cells, key, now);
    let cell = cells.entry(key.clone()).or_insert(Cell {
        count: 0,
        expires_at: None,
    });
    cell.count += 1;
    cell.count
}

// Saturates at zero; a cell brought back to zero is removed, so a compensated
// creation leaves no trace.
fn drop_one(cells: &mut HashMap<CellKey, Cell>, key: &CellKey) -> u64 {
    match cells.get_mut(key) {
        Some(cell) if cell.count > 1 => {
            cell.count -= 1;
            cell.count
        }
        Some(_) => {
            cells.remove(key);
            0
        }
        None => 0,
    }
}

fn set_expiry(cells: &mut HashMap<CellKey, Cell>, key: &CellKey, at: i64) {
    if let Some(cell) = cells.get_mut(key) {
        cell.expires_at = Some(at);
    }
}

fn run_single(cells: &mut HashMap<CellKey, Cell>, claim: &SingleClaim, now: i64) -> ClaimOutcome {
    match claim.strategy {
        AtomicStrategy::CheckThenIncr => {
            if live_count(cells, &claim.key, now) >= claim.cap {
                return ClaimOutcome::Denied(DenyReason::CapMet);
            }
            if bump(cells, &claim.key, now) == 1 {
                set_expiry(cells, &claim.key, claim.expire_at);
            }
            ClaimOutcome::Granted
        }
        AtomicStrategy::IncrThenCheck => {
            let value = bump(cells, &claim.key, now);
            if value > claim.cap {
                drop_one(cells, &claim.key);
                return ClaimOutcome::Denied(DenyReason::CapMet);
            }
            if value == 1 {
                set_expiry(cells, &claim.key, claim.expire_at);
            }
            ClaimOutcome::Granted
        }
    }
}

fn run_dual(cells: &mut HashMap<CellKey, Cell>, claim: &DualClaim, now: i64) -> ClaimOutcome {
    match claim.strategy {
        AtomicStrategy::CheckThenIncr => {
            if live_count(cells, &claim.global_key, now) >= claim.global_cap {
                return ClaimOutcome::Denied(DenyReason::GlobalCapMet);
            }
            if live_count(cells, &claim.user_key, now) >= claim.user_cap {
                return ClaimOutcome::Denied(DenyReason::UserCapMet);
            }
            if bump(cells, &claim.global_key, now) == 1 {
                set_expiry(cells, &claim.global_key, claim.expire_at);
            }
            if bump(cells, &claim.user_key, now) == 1 {
                set_expiry(cells, &claim.user_key, claim.expire_at);
            }
            ClaimOutcome::Granted
        }
        AtomicStrategy::IncrThenCheck => {
            let user_value = bump(cells, &claim.user_key, now);
            if user_value > claim.user_cap {
                drop_one(cells, &claim.user_key);
                return ClaimOutcome::Denied(DenyReason::UserCapMet);
            }
            let global_value = bump(cells, &claim.global_key, now);
            if global_value > claim.global_cap {
                // Net zero on denial: both provisional increments come back.
                drop_one(cells, &claim.global_key);
                drop_one(cells, &claim.user_key);
                return ClaimOutcome::Denied(DenyReason::GlobalCapMet);
            }
            if user_value == 1 {
                set_expiry(cells, &claim.user_key, claim.expire_at);
            }
            if global_value == 1 {
                set_expiry(cells, &claim.global_key, claim.expire_at);
            }
            ClaimOutcome::Granted
        }
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn fetch(&self, key: &CellKey) -> Result<Option<u64>, StoreError> {
        let mut cells = self.lock(key)?;
        prune_expired(&mut cells, key, Self::now());
        Ok(cells.get(key).map(|cell| cell.count))
    }

    async fn fetch_many(&self, keys: &[CellKey]) -> Result<Vec<Option<u64>>, StoreError> {
        let mut counts = Vec::with_capacity(keys.len());
        for key in keys {
            counts.push(self.fetch(key).await?);
        }
        Ok(counts)
    }

    async fn incr(&self, key: &CellKey) -> Result<u64, StoreError> {
        let mut cells = self.lock(key)?;
        Ok(bump(&mut cells, key, Self::now()))
    }

    async fn decr(&self, key: &CellKey) -> Result<u64, StoreError> {
        let mut cells = self.lock(key)?;
        Ok(drop_one(&mut cells, key))
    }

    async fn expire_at(&self, key: &CellKey, unix_seconds: i64) -> Result<(), StoreError> {
        let mut cells = self.lock(key)?;
        set_expiry(&mut cells, key, unix_seconds);
        Ok(())
    }

    async fn claim_single(&self, claim: &SingleClaim) -> Result<ClaimOutcome, StoreError> {
        let mut cells = self.lock(&claim.key)?;
        Ok(run_single(&mut cells, claim, Self::now()))
    }

    async fn claim_dual(&self, claim: &DualClaim) -> Result<ClaimOutcome, StoreError> {
        claim.check_colocated()?;
        // Colocated keys share a slot, hence a shard; one guard covers both.
        let mut cells = self.lock(&claim.global_key)?;
        Ok(run_dual(&mut cells, claim, Self::now()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use more_asserts::assert_le;

    use crate::keys::DayStamp;
    use crate::keys::global_cell;
    use crate::keys::user_cell;

    use super::*;

    const FAR_FUTURE: i64 = 4_000_000_000;

    fn day() -> DayStamp {
        DayStamp::today()
    }

    fn single(offer: &str, cap: u64, strategy: AtomicStrategy) -> SingleClaim {
        SingleClaim {
            key: global_cell(offer, day()),
            cap,
            expire_at: FAR_FUTURE,
            strategy,
        }
    }

    fn dual(
        offer: &str,
        user: &str,
        global_cap: u64,
        user_cap: u64,
        strategy: AtomicStrategy,
    ) -> DualClaim {
        DualClaim {
            global_key: global_cell(offer, day()),
            user_key: user_cell(offer, user, day()),
            global_cap,
            user_cap,
            expire_at: FAR_FUTURE,
            strategy,
        }
    }

    #[tokio::test]
    async fn single_claim_grants_until_the_cap() {
        for strategy in [AtomicStrategy::CheckThenIncr, AtomicStrategy::IncrThenCheck] {
            let store = MemoryStore::new(3);
            let claim = single("offer-a", 2, strategy);

            assert_eq!(store.claim_single(&claim).await.unwrap(), ClaimOutcome::Granted);
            assert_eq!(store.claim_single(&claim).await.unwrap(), ClaimOutcome::Granted);
            assert_eq!(
                store.claim_single(&claim).await.unwrap(),
                ClaimOutcome::Denied(DenyReason::CapMet)
            );
            // Denials leave the committed count untouched.
            assert_eq!(store.fetch(&claim.key).await.unwrap(), Some(2));
        }
    }

    #[tokio::test]
    async fn dual_claim_accounts_exactly_once() {
        for strategy in [AtomicStrategy::CheckThenIncr, AtomicStrategy::IncrThenCheck] {
            let store = MemoryStore::new(3);
            let claim = dual("offer-a", "user-1", 5, 1, strategy);

            assert_eq!(store.claim_dual(&claim).await.unwrap(), ClaimOutcome::Granted);
            assert_eq!(store.fetch(&claim.global_key).await.unwrap(), Some(1));
            assert_eq!(store.fetch(&claim.user_key).await.unwrap(), Some(1));

            // Same user again: user cap met, nothing moves.
            assert_eq!(
                store.claim_dual(&claim).await.unwrap(),
                ClaimOutcome::Denied(DenyReason::UserCapMet)
            );
            assert_eq!(store.fetch(&claim.global_key).await.unwrap(), Some(1));
            assert_eq!(store.fetch(&claim.user_key).await.unwrap(), Some(1));
        }
    }

    #[tokio::test]
    async fn compensated_global_denial_is_net_zero() {
        for strategy in [AtomicStrategy::CheckThenIncr, AtomicStrategy::IncrThenCheck] {
            let store = MemoryStore::new(3);
            let first = dual("offer-a", "user-1", 1, 1, strategy);
            assert_eq!(store.claim_dual(&first).await.unwrap(), ClaimOutcome::Granted);

            let second = dual("offer-a", "user-2", 1, 1, strategy);
            assert_eq!(
                store.claim_dual(&second).await.unwrap(),
                ClaimOutcome::Denied(DenyReason::GlobalCapMet)
            );
            assert_eq!(store.fetch(&second.global_key).await.unwrap(), Some(1));
            // user-2's provisional cell must not survive the denial.
            assert_eq!(store.fetch(&second.user_key).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn expiry_is_set_only_by_the_creating_increment() {
        let store = MemoryStore::new(3);
        let mut claim = single("offer-a", 10, AtomicStrategy::CheckThenIncr);

        store.claim_single(&claim).await.unwrap();
        assert_eq!(store.expiry_of(&claim.key), Some(FAR_FUTURE));

        // A later claim carrying a different expiry must not move it.
        claim.expire_at = FAR_FUTURE + 60;
        store.claim_single(&claim).await.unwrap();
        assert_eq!(store.expiry_of(&claim.key), Some(FAR_FUTURE));
    }

    #[tokio::test]
    async fn expired_cells_read_as_absent_and_restart() {
        let store = MemoryStore::new(3);
        let mut claim = single("offer-a", 1, AtomicStrategy::CheckThenIncr);
        claim.expire_at = 1; // long past

        assert_eq!(store.claim_single(&claim).await.unwrap(), ClaimOutcome::Granted);
        assert_eq!(store.fetch(&claim.key).await.unwrap(), None);

        // The cap is fresh again: the next day's key would normally differ,
        // but even on the same key an expired cell restarts from zero.
        assert_eq!(store.claim_single(&claim).await.unwrap(), ClaimOutcome::Granted);
    }

    #[tokio::test]
    async fn cross_shard_pairs_are_refused() {
        let store = MemoryStore::new(3);
        // Different tags, so (almost surely) different slots; pick two ids
        // with a slot mismatch deterministically.
        let global_key = global_cell("foo", day());
        let user_key = user_cell("bar", "user-1", day());
        assert_ne!(global_key.hash_slot(), user_key.hash_slot());

        let claim = DualClaim {
            global_key,
            user_key,
            global_cap: 10,
            user_cap: 1,
            expire_at: FAR_FUTURE,
            strategy: AtomicStrategy::CheckThenIncr,
        };
        assert!(matches!(
            store.claim_dual(&claim).await,
            Err(StoreError::CrossSlot { .. })
        ));
    }

    #[tokio::test]
    async fn decr_saturates_at_zero() {
        let store = MemoryStore::new(3);
        let key = global_cell("offer-a", day());
        assert_eq!(store.decr(&key).await.unwrap(), 0);
        store.incr(&key).await.unwrap();
        assert_eq!(store.decr(&key).await.unwrap(), 0);
        assert_eq!(store.fetch(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_claims_never_exceed_the_cap() {
        for strategy in [AtomicStrategy::CheckThenIncr, AtomicStrategy::IncrThenCheck] {
            let cap = 50u64;
            let store = Arc::new(MemoryStore::new(3));

            let mut handles = vec![];
            for attempt in 0..(cap + 30) {
                let store = Arc::clone(&store);
                handles.push(tokio::spawn(async move {
                    let claim = DualClaim {
                        global_key: global_cell("offer-hot", day()),
                        user_key: user_cell("offer-hot", &format!("user-{attempt}"), day()),
                        global_cap: cap,
                        user_cap: 1,
                        expire_at: FAR_FUTURE,
                        strategy,
                    };
                    store.claim_dual(&claim).await.unwrap()
                }));
            }

            let results = futures::future::join_all(handles).await;
            let granted = results
                .into_iter()
                .filter(|res| matches!(res, Ok(ClaimOutcome::Granted)))
                .count() as u64;

            assert_eq!(granted, cap);
            let committed = store
                .fetch(&global_cell("offer-hot", day()))
                .await
                .unwrap()
                .unwrap_or(0);
            assert_le!(committed, cap);
        }
    }
}
