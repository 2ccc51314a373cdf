//! Composes single-offer atomic claims into "secure N offers out of a
//! candidate pool".
//!
//! The orchestrator holds no claim state between runs; everything concurrent
//! claimants need to agree on lives in the store. Within a run the one piece
//! of bookkeeping that matters is the attempted-set: an offer, once attempted,
//! is never attempted again, because a cap that denied us seconds ago will
//! not change its mind within the same day.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use tracing::debug;
use tracing::warn;

use crate::catalog::Catalog;
use crate::catalog::OfferKind;
use crate::keys::DayStamp;
use crate::keys::InvalidId;
use crate::keys::ResetSchedule;
use crate::keys::global_cell;
use crate::keys::user_cell;
use crate::keys::validate_id;
use crate::outcome::ClaimOutcome;
use crate::store::CounterStore;
use crate::store::DualClaim;
use crate::store::SingleClaim;
use crate::store::StoreError;
use crate::strategy::AtomicStrategy;

/// How the orchestrator walks the candidate pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GrantPolicy {
    /// Iterate candidates in order and stop at the target. No batching.
    #[default]
    FirstN,
    /// Work in rounds of `target - granted` not-yet-attempted candidates,
    /// with a round ceiling as a circuit breaker. Offers are still attempted
    /// at most once each, so the ceiling only bites on pathological
    /// configurations.
    BatchedRetry,
}

/// What a store failure during one offer's claim does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureMode {
    /// Count the offer as not granted and keep going.
    #[default]
    BestEffort,
    /// Abort the run and surface the failure.
    Strict,
}

// Rounds past the target a batched run may take before the circuit breaker
// trips.
const EXTRA_ROUNDS: usize = 5;

/// A run that could not complete.
#[derive(Debug, thiserror::Error)]
pub enum SecureError {
    #[error("user id rejected")]
    InvalidUserId(#[from] InvalidId),
    #[error("claim for offer `{offer_id}` failed")]
    Claim {
        offer_id: String,
        #[source]
        source: StoreError,
    },
}

/// The result of one [`Orchestrator::secure_offers`] run.
///
/// Falling short of the target is a reportable partial result, not an error;
/// the caller decides whether partial success is acceptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantReport {
    /// Offer ids granted this run, in grant order, free of duplicates.
    pub granted: Vec<String>,
    /// The number of grants the run aimed for.
    pub target: usize,
    /// Distinct candidate ids evaluated: claimed, prefiltered as exhausted,
    /// or skipped as unknown.
    pub attempted: usize,
    /// Claims whose outcome is unknown (timeout or transport failure in
    /// best-effort mode). Never granted, never retried within the run.
    pub indeterminate: usize,
}

impl GrantReport {
    pub fn target_met(&self) -> bool {
        self.granted.len() >= self.target
    }
}

#[derive(Clone, Debug)]
struct OrchestratorMetrics {
    granted: Counter<u64>,
    denied: Counter<u64>,
    store_errors: Counter<u64>,
}

// Per-run working state.
struct Run {
    granted: Vec<String>,
    attempted: HashSet<String>,
    indeterminate: usize,
}

/// Drives claims for one catalog against one store.
///
/// Cheap to share: construct once, wrap in an `Arc`, and call
/// [`secure_offers`](Orchestrator::secure_offers) from as many tasks as
/// needed. Runs coordinate exclusively through the store's atomic units.
#[derive(Debug)]
pub struct Orchestrator<S>
where
    S: ?Sized,
{
    store: Arc<S>,
    catalog: Arc<Catalog>,
    strategy: AtomicStrategy,
    policy: GrantPolicy,
    failure_mode: FailureMode,
    schedule: ResetSchedule,
    claim_timeout: Option<Duration>,
    prefetch: bool,
    instruments: OrchestratorMetrics,
}

// Manual Clone: the derive would demand S: Clone, but only the Arc is cloned.
impl<S> Clone for Orchestrator<S>
where
    S: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            catalog: Arc::clone(&self.catalog),
            strategy: self.strategy,
            policy: self.policy,
            failure_mode: self.failure_mode,
            schedule: self.schedule,
            claim_timeout: self.claim_timeout,
            prefetch: self.prefetch,
            instruments: self.instruments.clone(),
        }
    }
}

impl<S> Orchestrator<S>
where
    S: CounterStore + ?Sized,
{
    pub fn new(store: Arc<S>, catalog: Arc<Catalog>) -> Self {
        let meter = global::meter("offer_claim");
        let instruments = OrchestratorMetrics {
            granted: meter.u64_counter("claims_granted").build(),
            denied: meter.u64_counter("claims_denied").build(),
            store_errors: meter.u64_counter("claim_store_errors").build(),
        };

        Self {
            store,
            catalog,
            strategy: AtomicStrategy::default(),
            policy: GrantPolicy::default(),
            failure_mode: FailureMode::default(),
            schedule: ResetSchedule::default(),
            claim_timeout: None,
            prefetch: false,
            instruments,
        }
    }

    pub fn with_strategy(mut self, strategy: AtomicStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_policy(mut self, policy: GrantPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn with_schedule(mut self, schedule: ResetSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Bound each store call. A claim that outlives the bound is counted as
    /// indeterminate: the primitives are not idempotent to a blind retry, so
    /// it is never re-sent.
    pub fn with_claim_timeout(mut self, claim_timeout: Duration) -> Self {
        self.claim_timeout = Some(claim_timeout);
        self
    }

    /// Bulk-read the global cells of globally capped candidates up front and
    /// skip offers that are already exhausted. Purely advisory: a stale read
    /// can cost an extra attempt, never an over-grant.
    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Tries to secure `target` grants for `user_id` out of `candidates`.
    ///
    /// Candidates are consumed in order, each at most once, including
    /// duplicates in the input. Offers missing from the catalog are skipped
    /// silently: they are simply not applicable here.
    pub async fn secure_offers(
        &self,
        user_id: &str,
        candidates: &[String],
        target: usize,
    ) -> Result<GrantReport, SecureError> {
        validate_id(user_id)?;

        let now = Utc::now();
        let day = self.schedule.day_stamp(now);
        let expire_at = self.schedule.expire_at(now);

        let mut run = Run {
            granted: Vec::new(),
            attempted: HashSet::new(),
            indeterminate: 0,
        };

        if self.prefetch {
            self.prefilter_exhausted(candidates, day, &mut run).await;
        }

        match self.policy {
            GrantPolicy::FirstN => {
                for offer_id in candidates {
                    if run.granted.len() >= target {
                        break;
                    }
                    if !run.attempted.insert(offer_id.clone()) {
                        continue;
                    }
                    self.attempt(user_id, offer_id, day, expire_at, &mut run)
                        .await?;
                }
            }
            GrantPolicy::BatchedRetry => {
                let max_rounds = target + EXTRA_ROUNDS;
                for _ in 0..max_rounds {
                    if run.granted.len() >= target {
                        break;
                    }
                    let needed = target - run.granted.len();
                    let batch: Vec<String> = candidates
                        .iter()
                        .filter(|id| !run.attempted.contains(*id))
                        .take(needed)
                        .cloned()
                        .collect();
                    if batch.is_empty() {
                        break;
                    }
                    for offer_id in &batch {
                        // The batch itself may carry duplicates from the
                        // input; the attempted-set stays authoritative.
                        if !run.attempted.insert(offer_id.clone()) {
                            continue;
                        }
                        self.attempt(user_id, offer_id, day, expire_at, &mut run)
                            .await?;
                    }
                }
            }
        }

        Ok(GrantReport {
            granted: run.granted,
            target,
            attempted: run.attempted.len(),
            indeterminate: run.indeterminate,
        })
    }

    async fn attempt(
        &self,
        user_id: &str,
        offer_id: &str,
        day: DayStamp,
        expire_at: i64,
        run: &mut Run,
    ) -> Result<(), SecureError> {
        let Some(kind) = self.catalog.get(offer_id) else {
            debug!(offer_id, "offer not in catalog; skipped");
            return Ok(());
        };

        match self.dispatch(kind, user_id, offer_id, day, expire_at).await {
            Ok(ClaimOutcome::Granted) => {
                self.instruments.granted.add(1, &[]);
                debug!(offer_id, "claim granted");
                run.granted.push(offer_id.to_string());
            }
            Ok(ClaimOutcome::Denied(reason)) => {
                self.instruments
                    .denied
                    .add(1, &[KeyValue::new("reason", format!("{reason:?}"))]);
                debug!(offer_id, ?reason, "claim denied");
            }
            Err(source) => {
                self.instruments.store_errors.add(1, &[]);
                let abort = matches!(source, StoreError::CrossSlot { .. })
                    || self.failure_mode == FailureMode::Strict;
                if abort {
                    return Err(SecureError::Claim {
                        offer_id: offer_id.to_string(),
                        source,
                    });
                }
                warn!(offer_id, error = %source, "claim failed; counted as not granted");
                run.indeterminate += 1;
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        kind: OfferKind,
        user_id: &str,
        offer_id: &str,
        day: DayStamp,
        expire_at: i64,
    ) -> Result<ClaimOutcome, StoreError> {
        let claim = async {
            match kind {
                OfferKind::GlobalOnly { global_cap } => {
                    let claim = SingleClaim {
                        key: global_cell(offer_id, day),
                        cap: global_cap.get(),
                        expire_at,
                        strategy: self.strategy,
                    };
                    self.store.claim_single(&claim).await
                }
                OfferKind::UserOnly { user_cap } => {
                    let claim = SingleClaim {
                        key: user_cell(offer_id, user_id, day),
                        cap: user_cap.get(),
                        expire_at,
                        strategy: self.strategy,
                    };
                    self.store.claim_single(&claim).await
                }
                OfferKind::Both {
                    global_cap,
                    user_cap,
                } => {
                    let claim = DualClaim {
                        global_key: global_cell(offer_id, day),
                        user_key: user_cell(offer_id, user_id, day),
                        global_cap: global_cap.get(),
                        user_cap: user_cap.get(),
                        expire_at,
                        strategy: self.strategy,
                    };
                    self.store.claim_dual(&claim).await
                }
            }
        };

        match self.claim_timeout {
            Some(limit) => match tokio::time::timeout(limit, claim).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StoreError::Timeout),
            },
            None => claim.await,
        }
    }

    async fn prefilter_exhausted(&self, candidates: &[String], day: DayStamp, run: &mut Run) {
        let mut capped = Vec::new();
        let mut keys = Vec::new();
        for offer_id in candidates {
            if let Some(
                OfferKind::GlobalOnly { global_cap } | OfferKind::Both { global_cap, .. },
            ) = self.catalog.get(offer_id)
            {
                capped.push((offer_id, global_cap.get()));
                keys.push(global_cell(offer_id, day));
            }
        }
        if keys.is_empty() {
            return;
        }

        match self.store.fetch_many(&keys).await {
            Ok(counts) => {
                for ((offer_id, cap), count) in capped.into_iter().zip(counts) {
                    if count.unwrap_or(0) >= cap {
                        debug!(offer_id = offer_id.as_str(), "global cap already met");
                        run.attempted.insert(offer_id.clone());
                    }
                }
            }
            Err(error) => {
                // The prefilter is an optimization; a failed read must not
                // fail the run.
                warn!(%error, "prefilter read failed; claiming without it");
            }
        }
    }
}
