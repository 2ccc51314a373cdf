//! Round trips against a live Redis Cluster.
//!
//! Ignored by default; point `REDIS_CLUSTER_NODES` at a reachable cluster
//! (comma-separated `redis://host:port/` URLs) and run with `--ignored`.

use std::sync::Arc;

use offer_claim::AtomicStrategy;
use offer_claim::Catalog;
use offer_claim::ClaimOutcome;
use offer_claim::CounterStore;
use offer_claim::DayStamp;
use offer_claim::DenyReason;
use offer_claim::DualClaim;
use offer_claim::Orchestrator;
use offer_claim::global_cell;
use offer_claim::user_cell;
use offer_claim_redis::RedisClusterStore;

fn nodes() -> Vec<String> {
    std::env::var("REDIS_CLUSTER_NODES")
        .expect("set REDIS_CLUSTER_NODES to run cluster tests")
        .split(',')
        .map(str::to_string)
        .collect()
}

// Unique per process so reruns never collide with leftover cells.
fn test_offer(prefix: &str) -> String {
    format!("{prefix}-{}", std::process::id())
}

const SHORT_TTL: i64 = 120;

fn expire_soon() -> i64 {
    use std::time::SystemTime;
    use std::time::UNIX_EPOCH;
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
        + SHORT_TTL
}

#[tokio::test]
#[ignore = "requires a live redis cluster"]
async fn dual_claim_round_trip() {
    let store = RedisClusterStore::connect(nodes()).await.unwrap();
    let offer = test_offer("it-dual");
    let day = DayStamp::today();

    for strategy in [AtomicStrategy::CheckThenIncr, AtomicStrategy::IncrThenCheck] {
        let claim = DualClaim {
            global_key: global_cell(&offer, day),
            user_key: user_cell(&offer, &format!("user-{}", strategy.as_label()), day),
            global_cap: 1_000,
            user_cap: 1,
            expire_at: expire_soon(),
            strategy,
        };

        assert_eq!(store.claim_dual(&claim).await.unwrap(), ClaimOutcome::Granted);
        assert_eq!(
            store.claim_dual(&claim).await.unwrap(),
            ClaimOutcome::Denied(DenyReason::UserCapMet)
        );
        assert_eq!(store.fetch(&claim.user_key).await.unwrap(), Some(1));
    }
}

#[tokio::test]
#[ignore = "requires a live redis cluster"]
async fn orchestrator_against_the_cluster() {
    let store = Arc::new(RedisClusterStore::connect(nodes()).await.unwrap());
    let offer = test_offer("it-orch");
    let catalog = Arc::new(
        Catalog::from_json_str(&format!(
            r#"{{ "{offer}": {{ "type": "BOTH", "global_cap": 2, "user_cap": 1 }} }}"#
        ))
        .unwrap(),
    );
    let orchestrator = Orchestrator::new(store, catalog);

    let candidates = vec![offer.clone()];
    assert!(orchestrator
        .secure_offers("it-user-1", &candidates, 1)
        .await
        .unwrap()
        .target_met());
    assert!(orchestrator
        .secure_offers("it-user-2", &candidates, 1)
        .await
        .unwrap()
        .target_met());
    // Global cap of 2 is now spent.
    assert!(!orchestrator
        .secure_offers("it-user-3", &candidates, 1)
        .await
        .unwrap()
        .target_met());
}
