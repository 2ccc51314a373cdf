//! The key scheme: the only place counter cell identifiers are constructed.
//!
//! A cell name carries everything that scopes a counter: the counting scope
//! (all users vs one user), the offer, the calendar day, and a colocation tag.
//! The day is part of the key on purpose: daily cap reset is "a new key plus
//! expiry of the old one", never a reset operation that could race with
//! claims.

use std::fmt;

use chrono::DateTime;
use chrono::Datelike;
use chrono::Days;
use chrono::NaiveTime;
use chrono::TimeDelta;
use chrono::Utc;

/// Size of the store's key-distribution space. A key's slot decides its
/// shard, and two keys may share an atomic unit only when their slots match.
pub const SLOT_COUNT: u16 = 16384;

/// A UTC calendar day as embedded in cell keys, e.g. `20250611`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DayStamp(u32);

impl DayStamp {
    pub fn from_utc(at: DateTime<Utc>) -> Self {
        Self(at.year() as u32 * 10_000 + at.month() * 100 + at.day())
    }

    pub fn today() -> Self {
        Self::from_utc(Utc::now())
    }
}

impl fmt::Display for DayStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.0)
    }
}

/// Computes the calendar day a claim counts against and the absolute instant
/// its cells expire.
///
/// Every claimant must derive both from the same schedule; mixing schedules
/// across processes skews the cap boundary. The expiry lands one grace period
/// after the next UTC midnight so cells created moments before rollover still
/// outlive every claim that could legally touch them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetSchedule {
    grace: TimeDelta,
}

impl Default for ResetSchedule {
    fn default() -> Self {
        Self {
            grace: TimeDelta::hours(1),
        }
    }
}

impl ResetSchedule {
    pub fn new(grace: TimeDelta) -> Self {
        Self { grace }
    }

    pub fn day_stamp(&self, at: DateTime<Utc>) -> DayStamp {
        DayStamp::from_utc(at)
    }

    /// Unix seconds of the next UTC midnight after `at`, plus the grace
    /// offset.
    pub fn expire_at(&self, at: DateTime<Utc>) -> i64 {
        let boundary = (at.date_naive() + Days::new(1))
            .and_time(NaiveTime::MIN)
            .and_utc();
        boundary.timestamp() + self.grace.num_seconds()
    }
}

/// A fully formed counter cell identifier.
///
/// The `{...}` segment is the colocation tag: the store's distribution
/// function hashes only that substring, so every cell carrying the same tag
/// lands on the same shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey(String);

impl CellKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The substring the store's distribution function hashes: the content of
    /// the first non-empty `{...}` group, or the whole key if there is none.
    pub fn hash_tag(&self) -> &str {
        let key = self.0.as_str();
        if let Some(open) = key.find('{')
            && let Some(len) = key[open + 1..].find('}')
            && len > 0
        {
            return &key[open + 1..open + 1 + len];
        }
        key
    }

    pub fn hash_slot(&self) -> u16 {
        crc16(self.hash_tag().as_bytes()) % SLOT_COUNT
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The all-users cell for one offer-day: `offer:{<offer_id>}:count:<day>`.
pub fn global_cell(offer_id: &str, day: DayStamp) -> CellKey {
    CellKey(format!("offer:{{{offer_id}}}:count:{day}"))
}

/// One user's cell for one offer-day:
/// `user_offer:{<offer_id>}:count:<user_id>:<day>`.
///
/// Tagged by offer id, not user id, so it is colocated with the offer's
/// global cell and the two can be claimed in one atomic unit.
pub fn user_cell(offer_id: &str, user_id: &str, day: DayStamp) -> CellKey {
    CellKey(format!("user_offer:{{{offer_id}}}:count:{user_id}:{day}"))
}

/// An id that cannot be embedded in a cell key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidId {
    #[error("id is empty")]
    Empty,
    #[error("id `{0}` contains key-tagging syntax (`{{` or `}}`)")]
    TagSyntax(String),
}

/// Offer and user ids become key segments verbatim. A brace inside an id
/// would be parsed as a colocation tag by the store and silently re-route the
/// cell to the wrong shard, so such ids are rejected rather than escaped.
pub fn validate_id(id: &str) -> Result<(), InvalidId> {
    if id.is_empty() {
        return Err(InvalidId::Empty);
    }
    if id.contains(['{', '}']) {
        return Err(InvalidId::TagSyntax(id.to_string()));
    }
    Ok(())
}

// CRC-16/XMODEM, the function the store's published slot mapping is defined
// over. Bit-serial is plenty: keys are short and slots are computed once per
// claim.
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}
