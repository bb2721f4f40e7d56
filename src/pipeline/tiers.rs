//! Multi-tier variants: cost the same table three times, once per pricing
//! tier, swapping in catalog prices where the catalog knows the product.
//!
//! Each tier is an independent call of the costing engine with its own
//! base-price lookup, so the three run on scoped threads with no shared
//! mutable state. A row the catalog does not know keeps its extracted price
//! and is flagged [`TierMatch::Unmatched`] for that tier.

use crate::error::CostConfigError;
use crate::pipeline::costing::{cost_with, ColumnMap, CostFactorConfig, CostSheet};
use crate::pipeline::stitch::{StitchedRow, StitchedTable};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Budgetary,
    MidRange,
    HighEnd,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Budgetary, Tier::MidRange, Tier::HighEnd];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Budgetary => "budgetary",
            Tier::MidRange => "mid_range",
            Tier::HighEnd => "high_end",
        })
    }
}

/// What a catalog gets to look at for one row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogQuery {
    pub description: Option<String>,
    pub unit: Option<String>,
    /// Every non-empty cell text of the row, for identifier matching.
    pub cells: Vec<String>,
}

impl CatalogQuery {
    pub fn from_row(row: &StitchedRow, columns: &ColumnMap) -> Self {
        let text = |idx: Option<usize>| {
            idx.and_then(|i| row.cells.get(i))
                .map(|c| c.text.trim().to_string())
                .filter(|t| !t.is_empty())
        };
        Self {
            description: text(columns.description),
            unit: text(columns.unit),
            cells: row
                .cells
                .iter()
                .map(|c| c.text.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }
}

/// A catalog hit for one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogMatch {
    pub product_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    pub unit_price: Decimal,
}

/// Tier-scoped product catalog.
pub trait CatalogLookup: Send + Sync {
    fn lookup(&self, tier: Tier, query: &CatalogQuery) -> Option<CatalogMatch>;
}

/// Catalog status of a row in a tier variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TierMatch {
    Matched {
        product_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        brand: Option<String>,
    },
    Unmatched,
}

// ── In-memory catalog ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub tier: Tier,
    pub product_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brand: Option<String>,
    pub unit_price: Decimal,
}

/// Exact-match catalog: a row matches an entry of the requested tier when
/// one of its cells equals the entry's product id, or its description equals
/// the entry's name, after normalisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InMemoryCatalog {
    #[serde(default)]
    pub entries: Vec<CatalogEntry>,
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl InMemoryCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self { entries }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl CatalogLookup for InMemoryCatalog {
    fn lookup(&self, tier: Tier, query: &CatalogQuery) -> Option<CatalogMatch> {
        let cells: Vec<String> = query.cells.iter().map(|c| normalize(c)).collect();
        let description = query.description.as_deref().map(normalize);

        let by_id = self
            .entries
            .iter()
            .filter(|e| e.tier == tier)
            .find(|e| cells.contains(&normalize(&e.product_id)));
        let entry = by_id.or_else(|| {
            let description = description.as_ref()?;
            self.entries
                .iter()
                .filter(|e| e.tier == tier)
                .find(|e| normalize(&e.name) == *description)
        })?;

        Some(CatalogMatch {
            product_id: entry.product_id.clone(),
            name: entry.name.clone(),
            brand: entry.brand.clone(),
            unit_price: entry.unit_price,
        })
    }
}

// ── Derivation ───────────────────────────────────────────────────────────

/// One tier's cost sheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierVariant {
    pub tier: Tier,
    pub sheet: CostSheet,
    pub matched: usize,
    pub unmatched: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierVariantSet {
    pub budgetary: TierVariant,
    pub mid_range: TierVariant,
    pub high_end: TierVariant,
}

impl TierVariantSet {
    pub fn get(&self, tier: Tier) -> &TierVariant {
        match tier {
            Tier::Budgetary => &self.budgetary,
            Tier::MidRange => &self.mid_range,
            Tier::HighEnd => &self.high_end,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TierVariant> {
        [&self.budgetary, &self.mid_range, &self.high_end].into_iter()
    }
}

/// Cost `table` for every tier concurrently.
pub fn derive_tiers(
    table: &StitchedTable,
    config: &CostFactorConfig,
    catalog: &dyn CatalogLookup,
) -> Result<TierVariantSet, CostConfigError> {
    config.validate()?;

    let [budgetary, mid_range, high_end] = std::thread::scope(|s| {
        Tier::ALL
            .map(|tier| s.spawn(move || cost_tier(table, config, catalog, tier)))
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
    });

    Ok(TierVariantSet {
        budgetary: budgetary?,
        mid_range: mid_range?,
        high_end: high_end?,
    })
}

fn cost_tier(
    table: &StitchedTable,
    config: &CostFactorConfig,
    catalog: &dyn CatalogLookup,
    tier: Tier,
) -> Result<TierVariant, CostConfigError> {
    let sheet = cost_with(table, config, |row, columns, extracted| {
        match catalog.lookup(tier, &CatalogQuery::from_row(row, columns)) {
            Some(m) => (
                Some(m.unit_price),
                Some(TierMatch::Matched {
                    product_id: m.product_id,
                    name: m.name,
                    brand: m.brand,
                }),
            ),
            None => (extracted, Some(TierMatch::Unmatched)),
        }
    })?;

    let matched = sheet
        .rows
        .iter()
        .filter(|r| matches!(r.tier_match, Some(TierMatch::Matched { .. })))
        .count();
    let unmatched = sheet.rows.len() - matched;
    info!(
        "Tier {}: {} row(s) matched in catalog, {} kept extracted price",
        tier, matched, unmatched
    );

    Ok(TierVariant {
        tier,
        sheet,
        matched,
        unmatched,
    })
}
