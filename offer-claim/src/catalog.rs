//! The offer catalog: an immutable offer id → cap configuration map.
//!
//! The catalog is loaded once at startup from the externally owned JSON
//! mapping and then only ever shared by reference. There is deliberately no
//! ambient registry to consult and no way to mutate a catalog after
//! construction.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::io::Read;
use std::num::NonZeroU64;
use std::path::Path;

use serde::Deserialize;

use crate::keys::InvalidId;
use crate::keys::validate_id;

/// Cap configuration for one offer.
///
/// The variant set is closed on purpose: every dispatch site pattern-matches
/// exhaustively, so adding a cap model is a compile-visible change rather
/// than a missed string comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferKind {
    /// One shared redemption budget across all users.
    GlobalOnly { global_cap: NonZeroU64 },
    /// A per-user redemption budget with no shared ceiling.
    UserOnly { user_cap: NonZeroU64 },
    /// Both budgets; a grant must clear the two caps together, atomically.
    Both {
        global_cap: NonZeroU64,
        user_cap: NonZeroU64,
    },
}

/// Problems turning the external JSON mapping into a [`Catalog`].
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read catalog")]
    Io(#[from] std::io::Error),
    #[error("catalog is not valid JSON")]
    Parse(#[from] serde_json::Error),
    #[error("offer `{offer_id}`: unknown type `{kind}`")]
    UnknownKind { offer_id: String, kind: String },
    #[error("offer `{offer_id}`: `{field}` is required for type `{kind}`")]
    MissingCap {
        offer_id: String,
        kind: &'static str,
        field: &'static str,
    },
    #[error("offer `{offer_id}`: `{field}` must be a positive integer")]
    ZeroCap {
        offer_id: String,
        field: &'static str,
    },
    #[error("offer id is not usable as a key segment")]
    BadOfferId(#[from] InvalidId),
}

/// The wire shape of one catalog entry.
#[derive(Debug, Deserialize)]
struct RawOffer {
    #[serde(rename = "type")]
    kind: String,
    global_cap: Option<u64>,
    user_cap: Option<u64>,
}

// Absent user_cap means "once per user per day" for kinds that need one.
const DEFAULT_USER_CAP: u64 = 1;

fn cap(
    offer_id: &str,
    kind: &'static str,
    field: &'static str,
    value: Option<u64>,
) -> Result<NonZeroU64, CatalogError> {
    let value = value.ok_or_else(|| CatalogError::MissingCap {
        offer_id: offer_id.to_string(),
        kind,
        field,
    })?;
    NonZeroU64::new(value).ok_or_else(|| CatalogError::ZeroCap {
        offer_id: offer_id.to_string(),
        field,
    })
}

fn cook(offer_id: &str, raw: RawOffer) -> Result<OfferKind, CatalogError> {
    match raw.kind.as_str() {
        "GLOBAL_ONLY" => Ok(OfferKind::GlobalOnly {
            global_cap: cap(offer_id, "GLOBAL_ONLY", "global_cap", raw.global_cap)?,
        }),
        "USER_ONLY" => Ok(OfferKind::UserOnly {
            user_cap: cap(
                offer_id,
                "USER_ONLY",
                "user_cap",
                raw.user_cap.or(Some(DEFAULT_USER_CAP)),
            )?,
        }),
        "BOTH" => Ok(OfferKind::Both {
            global_cap: cap(offer_id, "BOTH", "global_cap", raw.global_cap)?,
            user_cap: cap(
                offer_id,
                "BOTH",
                "user_cap",
                raw.user_cap.or(Some(DEFAULT_USER_CAP)),
            )?,
        }),
        other => Err(CatalogError::UnknownKind {
            offer_id: offer_id.to_string(),
            kind: other.to_string(),
        }),
    }
}

/// Immutable offer id → [`OfferKind`] mapping.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    offers: HashMap<String, OfferKind>,
}

impl Catalog {
    /// Builds a catalog from already-typed entries, validating ids.
    pub fn new(
        offers: impl IntoIterator<Item = (String, OfferKind)>,
    ) -> Result<Self, CatalogError> {
        let mut map = HashMap::new();
        for (offer_id, kind) in offers {
            validate_id(&offer_id)?;
            map.insert(offer_id, kind);
        }
        Ok(Self { offers: map })
    }

    /// Parses the external JSON mapping
    /// `{ "<offer_id>": { "type": ..., "global_cap": ..., "user_cap": ... } }`.
    pub fn from_json_reader(reader: impl Read) -> Result<Self, CatalogError> {
        let raw: HashMap<String, RawOffer> = serde_json::from_reader(reader)?;
        let mut offers = HashMap::with_capacity(raw.len());
        for (offer_id, entry) in raw {
            validate_id(&offer_id)?;
            let kind = cook(&offer_id, entry)?;
            offers.insert(offer_id, kind);
        }
        Ok(Self { offers })
    }

    pub fn from_json_str(json: &str) -> Result<Self, CatalogError> {
        Self::from_json_reader(json.as_bytes())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        Self::from_json_reader(BufReader::new(File::open(path)?))
    }

    /// Cap configuration for `offer_id`, if the offer exists at all.
    pub fn get(&self, offer_id: &str) -> Option<OfferKind> {
        self.offers.get(offer_id).copied()
    }

    pub fn len(&self) -> usize {
        self.offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }

    pub fn offer_ids(&self) -> impl Iterator<Item = &str> {
        self.offers.keys().map(String::as_str)
    }
}
