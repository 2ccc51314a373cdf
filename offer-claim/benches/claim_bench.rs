use std::num::NonZeroU64;
use std::sync::Arc;

use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use tokio::runtime::Runtime;

use offer_claim::AtomicStrategy;
use offer_claim::Catalog;
use offer_claim::CounterStore;
use offer_claim::DayStamp;
use offer_claim::DualClaim;
use offer_claim::MemoryStore;
use offer_claim::OfferKind;
use offer_claim::Orchestrator;
use offer_claim::SingleClaim;
use offer_claim::global_cell;
use offer_claim::user_cell;

// Caps far above anything a bench run can reach, so every iteration measures
// the grant path.
const HUGE: u64 = u64::MAX / 2;

fn bench_single_claim(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    for strategy in [AtomicStrategy::CheckThenIncr, AtomicStrategy::IncrThenCheck] {
        let store = Arc::new(MemoryStore::new(3));
        let claim = SingleClaim {
            key: global_cell("bench-offer", DayStamp::today()),
            cap: HUGE,
            expire_at: i64::MAX,
            strategy,
        };

        c.bench_function(&format!("claim_single/{}", strategy.as_label()), |b| {
            b.to_async(&rt).iter(|| {
                let store = Arc::clone(&store);
                let claim = claim.clone();
                async move { store.claim_single(&claim).await.unwrap() }
            })
        });
    }
}

fn bench_dual_claim(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    for strategy in [AtomicStrategy::CheckThenIncr, AtomicStrategy::IncrThenCheck] {
        let store = Arc::new(MemoryStore::new(3));
        let claim = DualClaim {
            global_key: global_cell("bench-offer", DayStamp::today()),
            user_key: user_cell("bench-offer", "bench-user", DayStamp::today()),
            global_cap: HUGE,
            user_cap: HUGE,
            expire_at: i64::MAX,
            strategy,
        };

        c.bench_function(&format!("claim_dual/{}", strategy.as_label()), |b| {
            b.to_async(&rt).iter(|| {
                let store = Arc::clone(&store);
                let claim = claim.clone();
                async move { store.claim_dual(&claim).await.unwrap() }
            })
        });
    }
}

fn bench_secure_offers(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let offers: Vec<(String, OfferKind)> = (0..20)
        .map(|index| {
            (
                format!("offer-{index:03}"),
                OfferKind::Both {
                    global_cap: NonZeroU64::new(HUGE).unwrap(),
                    user_cap: NonZeroU64::new(HUGE).unwrap(),
                },
            )
        })
        .collect();
    let candidates: Vec<String> = offers.iter().map(|(id, _)| id.clone()).collect();
    let catalog = Arc::new(Catalog::new(offers).unwrap());
    let store = Arc::new(MemoryStore::new(3));
    let orchestrator = Arc::new(Orchestrator::new(store, catalog));

    c.bench_function("secure_offers/first_n_10_of_20", |b| {
        b.to_async(&rt).iter(|| {
            let orchestrator = Arc::clone(&orchestrator);
            let candidates = candidates.clone();
            async move {
                orchestrator
                    .secure_offers("bench-user", &candidates, 10)
                    .await
                    .unwrap()
            }
        })
    });
}

criterion_group!(
    benches,
    bench_single_claim,
    bench_dual_claim,
    bench_secure_offers
);
criterion_main!(benches);
