//! Concurrent load harness for the offer-claim protocol.
//!
//! Simulates many independent claimants hammering one catalog: each task
//! samples a random candidate pool, runs `secure_offers`, and records how the
//! run went. The harness reports latency percentiles, grant/partial/error
//! breakdowns and, on the in-memory backend, audits the cap invariant after
//! the dust settles: no global cell may ever exceed its cap, no matter how
//! badly the run went.

use std::num::NonZeroU64;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use clap::Parser;
use clap::ValueEnum;
use hdrhistogram::Histogram;
use rand::Rng;
use rand::seq::IndexedRandom;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use tracing::info;

use offer_claim::AtomicStrategy;
use offer_claim::Catalog;
use offer_claim::CounterStore;
use offer_claim::FailureMode;
use offer_claim::GrantPolicy;
use offer_claim::GrantReport;
use offer_claim::MemoryStore;
use offer_claim::OfferKind;
use offer_claim::Orchestrator;
use offer_claim::ResetSchedule;
use offer_claim::SecureError;
use offer_claim::global_cell;
use offer_claim_redis::RedisClusterStore;

#[derive(Parser, Debug)]
#[command(about = "Drive concurrent offer claims against a counter store")]
struct Args {
    /// Concurrent simulated claimants.
    #[arg(long, default_value_t = 64)]
    users: usize,

    /// Claim runs issued per claimant.
    #[arg(long, default_value_t = 20)]
    runs_per_user: usize,

    /// Offers synthesized into the catalog (ignored with --offers-file).
    #[arg(long, default_value_t = 1000)]
    offers: usize,

    /// Candidate offers sampled for each run.
    #[arg(long, default_value_t = 20)]
    offers_to_evaluate: usize,

    /// Grants each run tries to secure.
    #[arg(long, default_value_t = 10)]
    grant_limit: usize,

    /// Load the catalog from a JSON file instead of synthesizing one.
    #[arg(long)]
    offers_file: Option<std::path::PathBuf>,

    #[arg(long, value_enum, default_value_t = StrategyArg::CheckThenIncr)]
    strategy: StrategyArg,

    #[arg(long, value_enum, default_value_t = PolicyArg::FirstN)]
    policy: PolicyArg,

    /// Abort a run on the first store failure instead of continuing.
    #[arg(long)]
    strict: bool,

    /// Prefilter globally exhausted offers with a bulk read per run.
    #[arg(long)]
    prefetch: bool,

    /// Per-claim timeout, e.g. `250ms`.
    #[arg(long, value_parser = humantime::parse_duration)]
    claim_timeout: Option<Duration>,

    /// Pause between a claimant's runs, e.g. `20ms`.
    #[arg(long, value_parser = humantime::parse_duration)]
    think_time: Option<Duration>,

    /// Shards of the in-memory store.
    #[arg(long, default_value_t = 3)]
    shards: usize,

    /// Redis Cluster startup nodes (comma-separated `redis://host:port/`
    /// URLs). Uses the in-memory store when absent.
    #[arg(long, value_delimiter = ',')]
    redis_nodes: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    CheckThenIncr,
    IncrThenCheck,
}

impl From<StrategyArg> for AtomicStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::CheckThenIncr => AtomicStrategy::CheckThenIncr,
            StrategyArg::IncrThenCheck => AtomicStrategy::IncrThenCheck,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    FirstN,
    Batched,
}

impl From<PolicyArg> for GrantPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::FirstN => GrantPolicy::FirstN,
            PolicyArg::Batched => GrantPolicy::BatchedRetry,
        }
    }
}

// Cap ranges for synthesized catalogs.
const GLOBAL_CAP_RANGE: std::ops::RangeInclusive<u64> = 500..=100_000;
const USER_CAP_RANGE: std::ops::RangeInclusive<u64> = 1..=10;

/// Round-robins the three offer kinds with random caps, the same shape the
/// production catalog generator emits.
fn synthesize_catalog(count: usize) -> Catalog {
    let mut rng = rand::rng();
    let offers = (0..count).map(|index| {
        let global_cap = NonZeroU64::new(rng.random_range(GLOBAL_CAP_RANGE)).expect("nonzero");
        let user_cap = NonZeroU64::new(rng.random_range(USER_CAP_RANGE)).expect("nonzero");
        let kind = match index % 3 {
            0 => OfferKind::Both {
                global_cap,
                user_cap,
            },
            1 => OfferKind::GlobalOnly { global_cap },
            _ => OfferKind::UserOnly { user_cap },
        };
        (format!("offer-{index:06}"), kind)
    });
    Catalog::new(offers).expect("synthesized offer ids are valid")
}

#[derive(Default)]
struct FailureCounter {
    timeouts: usize,
    transport: usize,
    cross_slot: usize,
    bad_user_id: usize,
}

struct RunStats {
    latency: Histogram<u64>,
    runs: usize,
    full: usize,
    partial: usize,
    granted: u64,
    indeterminate: u64,
    failures: FailureCounter,
    wall: Duration,
}

async fn run_load<S>(
    args: &Args,
    orchestrator: Arc<Orchestrator<S>>,
    offer_ids: Arc<Vec<String>>,
) -> RunStats
where
    S: CounterStore + ?Sized + 'static,
{
    let mut tasks = JoinSet::new();
    let barrier = Arc::new(Barrier::new(args.users));
    let sample_size = args.offers_to_evaluate.min(offer_ids.len());
    let runs_per_user = args.runs_per_user;
    let grant_limit = args.grant_limit;
    let think_time = args.think_time;

    let start = Instant::now();

    for user_index in 0..args.users {
        let orchestrator = Arc::clone(&orchestrator);
        let offer_ids = Arc::clone(&offer_ids);
        let barrier = Arc::clone(&barrier);

        tasks.spawn(async move {
            barrier.wait().await;
            let mut results = Vec::with_capacity(runs_per_user);
            for run_index in 0..runs_per_user {
                // Fresh identity per run: claimants are anonymous visitors,
                // not returning accounts.
                let user_id = format!("user-{user_index:04}-{run_index:04}");
                let candidates: Vec<String> = offer_ids
                    .choose_multiple(&mut rand::rng(), sample_size)
                    .cloned()
                    .collect();

                let begun = Instant::now();
                let outcome = orchestrator
                    .secure_offers(&user_id, &candidates, grant_limit)
                    .await;
                results.push((outcome, begun.elapsed()));

                if let Some(pause) = think_time {
                    tokio::time::sleep(pause).await;
                }
            }
            results
        });
    }

    let mut stats = RunStats {
        latency: Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).expect("histogram bounds"),
        runs: 0,
        full: 0,
        partial: 0,
        granted: 0,
        indeterminate: 0,
        failures: FailureCounter::default(),
        wall: Duration::ZERO,
    };

    while let Some(task) = tasks.join_next().await {
        for (outcome, elapsed) in task.expect("claimant task panicked") {
            stats.runs += 1;
            stats
                .latency
                .record((elapsed.as_micros() as u64).max(1))
                .expect("latency in range");
            match outcome {
                Ok(report) => {
                    record_report(&mut stats, &report);
                }
                Err(SecureError::Claim { source, .. }) => {
                    use offer_claim::StoreError;
                    match source {
                        StoreError::Timeout => stats.failures.timeouts += 1,
                        StoreError::Transport(_) => stats.failures.transport += 1,
                        StoreError::CrossSlot { .. } => stats.failures.cross_slot += 1,
                    }
                }
                Err(SecureError::InvalidUserId(_)) => stats.failures.bad_user_id += 1,
            }
        }
    }

    stats.wall = start.elapsed();
    stats
}

fn record_report(stats: &mut RunStats, report: &GrantReport) {
    stats.granted += report.granted.len() as u64;
    stats.indeterminate += report.indeterminate as u64;
    if report.target_met() {
        stats.full += 1;
    } else {
        stats.partial += 1;
    }
}

fn print_summary(name: &str, args: &Args, stats: &RunStats) {
    let throughput = stats.runs as f64 / stats.wall.as_secs_f64();
    let grants_per_run = if stats.runs > 0 {
        stats.granted as f64 / stats.runs as f64
    } else {
        0.0
    };

    println!("--- {} ---", name);
    println!("Strategy:        {:?}", args.strategy);
    println!("Policy:          {:?}", args.policy);
    println!("Total Duration:  {:.2?}", stats.wall);
    println!("Runs:            {}", stats.runs);
    println!("Target met:      {}/{}", stats.full, stats.runs);
    println!("Partial:         {}", stats.partial);
    println!("Grants:          {} ({:.2}/run)", stats.granted, grants_per_run);
    println!("Throughput:      {:.2} runs/sec", throughput);
    if stats.runs > 0 {
        println!("P50 (run):       {}µs", stats.latency.value_at_quantile(0.5));
        println!("P99 (run):       {}µs", stats.latency.value_at_quantile(0.99));
    }
    println!("Indeterminate:   {}", stats.indeterminate);

    let failed = stats.failures.timeouts
        + stats.failures.transport
        + stats.failures.cross_slot
        + stats.failures.bad_user_id;
    println!("Aborted runs:    {}", failed);
    if failed > 0 {
        println!("  └─ Timeouts:   {}", stats.failures.timeouts);
        println!("  └─ Transport:  {}", stats.failures.transport);
        if stats.failures.cross_slot > 0 {
            println!("  └─ CrossSlot:  {}", stats.failures.cross_slot);
        }
        if stats.failures.bad_user_id > 0 {
            println!("  └─ BadUserId:  {}", stats.failures.bad_user_id);
        }
    }
    println!();
}

/// Recounts every globally capped cell after the run. Any committed count
/// above its cap means the atomicity story is broken somewhere.
async fn audit_global_caps(store: &MemoryStore, catalog: &Catalog) -> (usize, usize) {
    let day = ResetSchedule::default().day_stamp(Utc::now());
    let mut checked = 0;
    let mut violations = 0;

    for offer_id in catalog.offer_ids() {
        let cap = match catalog.get(offer_id) {
            Some(OfferKind::GlobalOnly { global_cap }) => global_cap.get(),
            Some(OfferKind::Both { global_cap, .. }) => global_cap.get(),
            _ => continue,
        };
        checked += 1;
        let committed = store
            .fetch(&global_cell(offer_id, day))
            .await
            .expect("memory store fetch")
            .unwrap_or(0);
        if committed > cap {
            violations += 1;
            tracing::error!(offer_id, committed, cap, "cap invariant violated");
        }
    }
    (checked, violations)
}

fn build_orchestrator<S>(args: &Args, store: Arc<S>, catalog: Arc<Catalog>) -> Orchestrator<S>
where
    S: CounterStore + ?Sized,
{
    let mut orchestrator = Orchestrator::new(store, catalog)
        .with_strategy(args.strategy.into())
        .with_policy(args.policy.into())
        .with_failure_mode(if args.strict {
            FailureMode::Strict
        } else {
            FailureMode::BestEffort
        })
        .with_prefetch(args.prefetch);
    if let Some(claim_timeout) = args.claim_timeout {
        orchestrator = orchestrator.with_claim_timeout(claim_timeout);
    }
    orchestrator
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let catalog = Arc::new(match &args.offers_file {
        Some(path) => Catalog::load(path).expect("catalog file"),
        None => synthesize_catalog(args.offers),
    });
    let offer_ids: Arc<Vec<String>> =
        Arc::new(catalog.offer_ids().map(str::to_string).collect());
    info!(offers = catalog.len(), users = args.users, "starting load");

    if args.redis_nodes.is_empty() {
        let store = Arc::new(MemoryStore::new(args.shards));
        let orchestrator = Arc::new(build_orchestrator(
            &args,
            Arc::clone(&store),
            Arc::clone(&catalog),
        ));
        let stats = run_load(&args, orchestrator, offer_ids).await;
        print_summary(
            &format!("offer-claim stress (memory, {} shards)", store.shard_count()),
            &args,
            &stats,
        );

        let (checked, violations) = audit_global_caps(&store, &catalog).await;
        println!("Cap audit:       {checked} cells checked, {violations} violations");
        if violations > 0 {
            std::process::exit(1);
        }
    } else {
        let store = Arc::new(
            RedisClusterStore::connect(args.redis_nodes.clone())
                .await
                .expect("redis cluster connection"),
        );
        let orchestrator = Arc::new(build_orchestrator(&args, store, Arc::clone(&catalog)));
        let stats = run_load(&args, orchestrator, offer_ids).await;
        print_summary("offer-claim stress (redis cluster)", &args, &stats);
    }
}
