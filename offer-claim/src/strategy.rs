/// How a store turns a claim into an indivisible unit.
///
/// Both strategies uphold the same guarantee: across unbounded concurrency,
/// at most `cap` net non-compensated grants survive per cell. They differ in
/// round-trip cost inside the unit and in what concurrent readers outside the
/// unit may transiently observe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AtomicStrategy {
    /// Read the counters, compare them against the caps, then increment.
    ///
    /// Nothing is ever visible above a cap, at the cost of one read per cell
    /// on every attempt.
    #[default]
    CheckThenIncr,
    /// Increment first and compare the result; a value past the cap is rolled
    /// back with a compensating decrement.
    ///
    /// Saves the reads on the grant path. The price is an extra write on the
    /// denial path and a transient over-count that plain readers (not other
    /// claim units, which are serialized against this one) can observe
    /// between the increment and its compensation.
    IncrThenCheck,
}

impl AtomicStrategy {
    /// Stable name used in logs and harness output.
    pub fn as_label(&self) -> &'static str {
        match self {
            AtomicStrategy::CheckThenIncr => "check_then_incr",
            AtomicStrategy::IncrThenCheck => "incr_then_check",
        }
    }
}
