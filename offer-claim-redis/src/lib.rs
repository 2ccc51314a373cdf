//! # offer-claim-redis
//!
//! Redis Cluster backend for [`offer-claim`](offer_claim).
//!
//! Each claim variant is a server-side Lua script, registered once per store
//! and executed by the server as one indivisible unit scoped to the keys it
//! touches. The key scheme's `{offer_id}` hash tags put both cells of a
//! dual-capped offer into one slot, which is what makes the two-key scripts
//! legal on a cluster; the store still verifies colocation before sending,
//! because a cross-slot pair is a key-scheme bug that must fail loudly rather
//! than surface as a routing error.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::RedisError;
use redis::Script;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use tracing::debug;

use offer_claim::AtomicStrategy;
use offer_claim::CellKey;
use offer_claim::ClaimOutcome;
use offer_claim::CounterStore;
use offer_claim::DualClaim;
use offer_claim::SingleClaim;
use offer_claim::StoreError;

// The claim scripts. Outcome strings are the protocol's wire values, parsed
// by `ClaimOutcome::from_wire` on the way back.

const CLAIM_SINGLE_CHECKED: &str = r#"
local key = KEYS[1]
local cap = tonumber(ARGV[1])
local expire_at = tonumber(ARGV[2])
if tonumber(redis.call('GET', key) or 0) >= cap then
  return 'FAIL_CAP_MET'
end
if redis.call('INCR', key) == 1 then
  redis.call('EXPIREAT', key, expire_at)
end
return 'SUCCESS'
"#;

const CLAIM_SINGLE_INCR_FIRST: &str = r#"
local key = KEYS[1]
local cap = tonumber(ARGV[1])
local expire_at = tonumber(ARGV[2])
local value = redis.call('INCR', key)
if value > cap then
  if redis.call('DECR', key) <= 0 then
    redis.call('DEL', key)
  end
  return 'FAIL_CAP_MET'
end
if value == 1 then
  redis.call('EXPIREAT', key, expire_at)
end
return 'SUCCESS'
"#;

const CLAIM_DUAL_CHECKED: &str = r#"
local global_key = KEYS[1]
local user_key = KEYS[2]
local global_cap = tonumber(ARGV[1])
local user_cap = tonumber(ARGV[2])
local expire_at = tonumber(ARGV[3])
if tonumber(redis.call('GET', global_key) or 0) >= global_cap then
  return 'FAIL_GLOBAL_CAP_MET'
end
if tonumber(redis.call('GET', user_key) or 0) >= user_cap then
  return 'FAIL_USER_CAP_MET'
end
if redis.call('INCR', global_key) == 1 then
  redis.call('EXPIREAT', global_key, expire_at)
end
if redis.call('INCR', user_key) == 1 then
  redis.call('EXPIREAT', user_key, expire_at)
end
return 'SUCCESS'
"#;

// Denials under the increment-first strategy compensate back to net zero; a
// provisional cell decremented to nothing is deleted so it leaves no
// expiry-less zero counter behind.
const CLAIM_DUAL_INCR_FIRST: &str = r#"
local global_key = KEYS[1]
local user_key = KEYS[2]
local global_cap = tonumber(ARGV[1])
local user_cap = tonumber(ARGV[2])
local expire_at = tonumber(ARGV[3])
local user_value = redis.call('INCR', user_key)
if user_value > user_cap then
  if redis.call('DECR', user_key) <= 0 then
    redis.call('DEL', user_key)
  end
  return 'FAIL_USER_CAP_MET'
end
local global_value = redis.call('INCR', global_key)
if global_value > global_cap then
  if redis.call('DECR', global_key) <= 0 then
    redis.call('DEL', global_key)
  end
  if redis.call('DECR', user_key) <= 0 then
    redis.call('DEL', user_key)
  end
  return 'FAIL_GLOBAL_CAP_MET'
end
if user_value == 1 then
  redis.call('EXPIREAT', user_key, expire_at)
end
if global_value == 1 then
  redis.call('EXPIREAT', global_key, expire_at)
end
return 'SUCCESS'
"#;

// Bare DECR with the same floor the claim scripts use.
const GUARDED_DECR: &str = r#"
local value = redis.call('DECR', KEYS[1])
if value <= 0 then
  redis.call('DEL', KEYS[1])
  return 0
end
return value
"#;

/// [`CounterStore`] over a Redis Cluster.
///
/// Cloning is cheap (the underlying connection is multiplexed); one store can
/// serve any number of concurrent orchestrator runs.
pub struct RedisClusterStore {
    conn: ClusterConnection,
    claim_single_checked: Script,
    claim_single_incr_first: Script,
    claim_dual_checked: Script,
    claim_dual_incr_first: Script,
    guarded_decr: Script,
}

impl Clone for RedisClusterStore {
    fn clone(&self) -> Self {
        Self::with_connection(self.conn.clone())
    }
}

impl RedisClusterStore {
    /// Connects via the given startup nodes, e.g.
    /// `["redis://127.0.0.1:7000/"]`. Any reachable node bootstraps the
    /// topology.
    pub async fn connect(nodes: Vec<String>) -> Result<Self, StoreError> {
        let client = ClusterClient::new(nodes).map_err(map_err)?;
        let conn = client.get_async_connection().await.map_err(map_err)?;
        debug!("connected to redis cluster");
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ClusterConnection) -> Self {
        Self {
            conn,
            claim_single_checked: Script::new(CLAIM_SINGLE_CHECKED),
            claim_single_incr_first: Script::new(CLAIM_SINGLE_INCR_FIRST),
            claim_dual_checked: Script::new(CLAIM_DUAL_CHECKED),
            claim_dual_incr_first: Script::new(CLAIM_DUAL_INCR_FIRST),
            guarded_decr: Script::new(GUARDED_DECR),
        }
    }

    fn single_script(&self, strategy: AtomicStrategy) -> &Script {
        match strategy {
            AtomicStrategy::CheckThenIncr => &self.claim_single_checked,
            AtomicStrategy::IncrThenCheck => &self.claim_single_incr_first,
        }
    }

    fn dual_script(&self, strategy: AtomicStrategy) -> &Script {
        match strategy {
            AtomicStrategy::CheckThenIncr => &self.claim_dual_checked,
            AtomicStrategy::IncrThenCheck => &self.claim_dual_incr_first,
        }
    }
}

fn map_err(err: RedisError) -> StoreError {
    if err.is_timeout() {
        return StoreError::Timeout;
    }
    StoreError::Transport(err.to_string())
}

fn parse_outcome(raw: String) -> Result<ClaimOutcome, StoreError> {
    ClaimOutcome::from_wire(&raw)
        .ok_or_else(|| StoreError::Transport(format!("unrecognized claim outcome `{raw}`")))
}

#[async_trait]
impl CounterStore for RedisClusterStore {
    async fn fetch(&self, key: &CellKey) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key.as_str()).await.map_err(map_err)
    }

    async fn fetch_many(&self, keys: &[CellKey]) -> Result<Vec<Option<u64>>, StoreError> {
        // Cluster multi-key reads are slot-restricted and these keys span
        // slots by design, so fan out one GET per key instead of MGET.
        let fetches = keys.iter().map(|key| {
            let mut conn = self.conn.clone();
            let key = key.clone();
            async move { conn.get::<_, Option<u64>>(key.as_str()).await }
        });
        futures::future::try_join_all(fetches).await.map_err(map_err)
    }

    async fn incr(&self, key: &CellKey) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        conn.incr(key.as_str(), 1u64).await.map_err(map_err)
    }

    async fn decr(&self, key: &CellKey) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        self.guarded_decr
            .key(key.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn expire_at(&self, key: &CellKey, unix_seconds: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: bool = conn
            .expire_at(key.as_str(), unix_seconds)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn claim_single(&self, claim: &SingleClaim) -> Result<ClaimOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let raw: String = self
            .single_script(claim.strategy)
            .key(claim.key.as_str())
            .arg(claim.cap)
            .arg(claim.expire_at)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        parse_outcome(raw)
    }

    async fn claim_dual(&self, claim: &DualClaim) -> Result<ClaimOutcome, StoreError> {
        // The scheme guarantees colocation by construction; verify anyway so
        // a broken key ever reaching this point fails as the bug it is
        // instead of as a cluster routing error.
        claim.check_colocated()?;

        let mut conn = self.conn.clone();
        let raw: String = self
            .dual_script(claim.strategy)
            .key(claim.global_key.as_str())
            .key(claim.user_key.as_str())
            .arg(claim.global_cap)
            .arg(claim.user_cap)
            .arg(claim.expire_at)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        parse_outcome(raw)
    }
}

#[cfg(test)]
mod tests {
    use offer_claim::DayStamp;
    use offer_claim::global_cell;
    use offer_claim::user_cell;

    use super::*;

    #[test]
    fn scripts_set_expiry_only_on_creation() {
        for script in [
            CLAIM_SINGLE_CHECKED,
            CLAIM_SINGLE_INCR_FIRST,
            CLAIM_DUAL_CHECKED,
            CLAIM_DUAL_INCR_FIRST,
        ] {
            // EXPIREAT must be conditional on the value 1 in every variant.
            assert!(script.contains("EXPIREAT"));
            assert!(script.contains("== 1"));
        }
    }

    #[test]
    fn compensating_scripts_never_leave_zero_cells() {
        for script in [CLAIM_SINGLE_INCR_FIRST, CLAIM_DUAL_INCR_FIRST, GUARDED_DECR] {
            assert!(script.contains("DECR"));
            assert!(script.contains("DEL"));
        }
        // The check-first variants never write on the denial path.
        assert!(!CLAIM_SINGLE_CHECKED.contains("DECR"));
        assert!(!CLAIM_DUAL_CHECKED.contains("DECR"));
    }

    #[test]
    fn dual_claims_verify_colocation_before_sending() {
        let day = DayStamp::today();
        let claim = DualClaim {
            global_key: global_cell("foo", day),
            user_key: user_cell("bar", "user-1", day),
            global_cap: 10,
            user_cap: 1,
            expire_at: 0,
            strategy: AtomicStrategy::CheckThenIncr,
        };
        // No connection needed: the precheck fails before any I/O.
        assert!(matches!(
            claim.check_colocated(),
            Err(StoreError::CrossSlot { .. })
        ));
    }

    #[test]
    fn outcome_parsing_rejects_noise() {
        assert!(parse_outcome("SUCCESS".to_string()).is_ok());
        assert!(matches!(
            parse_outcome("SURPRISE".to_string()),
            Err(StoreError::Transport(_))
        ));
    }
}
