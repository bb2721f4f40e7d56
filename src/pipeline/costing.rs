//! Costing engine: turn a stitched table into priced rows and totals.
//!
//! ## Order of operations (per row)
//!
//! ```text
//! base unit price
//!   × (1 + margin%) × (1 + freight%) × (1 + customs%) × (1 + installation%)
//!   × exchange rate            (only when the exchange scope is per_row)
//!   → round to currency minor units → unit price
//! composed unit price × quantity
//!   + per-row absolute costs   (once per row, converted when per_row)
//!   → round → extended price
//! ```
//!
//! Per-table absolute costs are added once to the subtotal; with the default
//! `total` exchange scope the rate is applied last, to the grand total.
//!
//! Money is [`Decimal`] throughout. Nothing is rounded until a value is
//! reported, so the breakdown deltas are exact and the rounded prices are
//! the only lossy step. Arithmetic is checked: a row whose price leaves the
//! representable range is passed through unpriced instead of aborting the
//! table.

use crate::error::CostConfigError;
use crate::pipeline::stitch::{StitchedRow, StitchedTable};
use crate::pipeline::tiers::TierMatch;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Most precise currency we round to.
pub const MAX_MINOR_UNITS: u32 = 6;

static RE_AMOUNT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-−]?\d[\d.,']*").unwrap());

/// Cell texts that mean "no price" even though they are not empty.
const NOT_NUMERIC: &[&str] = &["-", "–", "—", "n/a", "na", "tbd", "tba", "nil", "incl", "included"];

// ── Configuration ────────────────────────────────────────────────────────

/// Where the exchange-rate multiplier is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeScope {
    #[default]
    Total,
    PerRow,
}

/// How often an absolute additional cost is charged. `per_row` is charged
/// once per priced row, independent of its quantity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostScope {
    #[default]
    PerRow,
    PerTable,
}

/// A named absolute cost, e.g. "packing" or "site survey".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalCost {
    pub name: String,
    pub amount: Decimal,
    #[serde(default)]
    pub scope: CostScope,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Currency {
    pub code: String,
    pub minor_units: u32,
}

impl Default for Currency {
    fn default() -> Self {
        Self {
            code: "USD".to_string(),
            minor_units: 2,
        }
    }
}

/// Declarative cost model. Every field is optional in JSON; the defaults
/// leave prices untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostFactorConfig {
    pub margin_pct: Decimal,
    pub freight_pct: Decimal,
    pub customs_pct: Decimal,
    pub installation_pct: Decimal,
    pub exchange_rate: Decimal,
    pub exchange_scope: ExchangeScope,
    pub additional_costs: Vec<AdditionalCost>,
    pub currency: Currency,
    /// Header of the unit-price column, overriding detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_column: Option<String>,
    /// Header of the quantity column, overriding detection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity_column: Option<String>,
}

impl Default for CostFactorConfig {
    fn default() -> Self {
        Self {
            margin_pct: Decimal::ZERO,
            freight_pct: Decimal::ZERO,
            customs_pct: Decimal::ZERO,
            installation_pct: Decimal::ZERO,
            exchange_rate: Decimal::ONE,
            exchange_scope: ExchangeScope::Total,
            additional_costs: Vec::new(),
            currency: Currency::default(),
            price_column: None,
            quantity_column: None,
        }
    }
}

impl CostFactorConfig {
    pub fn validate(&self) -> Result<(), CostConfigError> {
        let floor = Decimal::NEGATIVE_ONE * Decimal::ONE_HUNDRED;
        for (name, pct) in self.percentages() {
            if pct <= floor {
                return Err(CostConfigError::PercentageOutOfRange {
                    name: name.to_string(),
                    value: pct.to_string(),
                });
            }
        }
        if self.exchange_rate <= Decimal::ZERO {
            return Err(CostConfigError::InvalidExchangeRate(
                self.exchange_rate.to_string(),
            ));
        }
        if self.currency.minor_units > MAX_MINOR_UNITS {
            return Err(CostConfigError::InvalidMinorUnits(self.currency.minor_units));
        }
        if let Some(i) = self
            .additional_costs
            .iter()
            .position(|c| c.name.trim().is_empty())
        {
            return Err(CostConfigError::UnnamedCost(i + 1));
        }
        Ok(())
    }

    /// Percentage factors in the order they compound.
    fn percentages(&self) -> [(&'static str, Decimal); 4] {
        [
            ("margin", self.margin_pct),
            ("freight", self.freight_pct),
            ("customs", self.customs_pct),
            ("installation", self.installation_pct),
        ]
    }

    /// Multiplier applied inside each row.
    fn per_row_rate(&self) -> Decimal {
        match self.exchange_scope {
            ExchangeScope::PerRow => self.exchange_rate,
            ExchangeScope::Total => Decimal::ONE,
        }
    }

    fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(
            self.currency.minor_units,
            RoundingStrategy::MidpointAwayFromZero,
        )
    }
}

// ── Output model ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorKind {
    Percentage,
    Absolute,
    ExchangeRate,
}

/// What one factor added to a price. `delta` is exact, never rounded.
///
/// Percentage and exchange deltas are per unit. Absolute deltas are per row,
/// already converted when the exchange scope is `per_row`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactorContribution {
    pub name: String,
    pub kind: FactorKind,
    /// Percentage, absolute amount or multiplier, as configured.
    pub rate: Decimal,
    pub delta: Decimal,
}

/// A stitched data row with its price composition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricedRow {
    pub row: StitchedRow,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub base_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    /// Composed unit price, rounded.
    pub unit_price: Option<Decimal>,
    /// Unrounded composed unit price × quantity, rounded once. Absent when the
    /// quantity is unreadable.
    pub extended_price: Option<Decimal>,
    pub breakdown: Vec<FactorContribution>,
    pub unpriced: bool,
    /// Catalog outcome when the row belongs to a tier variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier_match: Option<TierMatch>,
}

impl PricedRow {
    fn unpriced(
        row: &StitchedRow,
        description: Option<String>,
        unit: Option<String>,
        base_price: Option<Decimal>,
        quantity: Option<Decimal>,
        tier_match: Option<TierMatch>,
    ) -> Self {
        Self {
            row: row.clone(),
            description,
            unit,
            base_price,
            quantity,
            unit_price: None,
            extended_price: None,
            breakdown: Vec::new(),
            unpriced: true,
            tier_match,
        }
    }

    fn demote(&mut self) {
        self.unit_price = None;
        self.extended_price = None;
        self.breakdown.clear();
        self.unpriced = true;
    }
}

/// Column positions the engine reads from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMap {
    pub price: Option<usize>,
    pub quantity: Option<usize>,
    pub description: Option<usize>,
    pub unit: Option<usize>,
}

/// The costed table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostSheet {
    pub currency: Currency,
    pub columns: ColumnMap,
    pub rows: Vec<PricedRow>,
    /// Sum of the rounded extended prices.
    pub subtotal: Decimal,
    /// Per-table absolute costs.
    pub table_costs: Vec<FactorContribution>,
    /// Total-scope exchange contribution, if a rate other than 1 applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange: Option<FactorContribution>,
    pub grand_total: Decimal,
    pub priced_rows: usize,
    pub unpriced_rows: usize,
}

// ── Column detection ─────────────────────────────────────────────────────

fn normalize_header(h: &str) -> String {
    h.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn words(h: &str) -> Vec<String> {
    h.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

impl ColumnMap {
    /// Detect columns from header texts. Explicit names in `config` win.
    pub fn detect(columns: &[String], config: &CostFactorConfig) -> Self {
        let by_name = |name: &Option<String>| {
            name.as_ref().and_then(|n| {
                let n = normalize_header(n);
                columns.iter().position(|c| normalize_header(c) == n)
            })
        };
        let find = |pred: &dyn Fn(&str, &[String]) -> bool| {
            columns.iter().position(|c| {
                let norm = normalize_header(c);
                pred(&norm, &words(c))
            })
        };

        let is_total = |h: &str| h.contains("total") || h.contains("amount");
        let price = by_name(&config.price_column)
            .or_else(|| find(&|h, _| !is_total(h) && (h.contains("unit rate") || h.contains("unit price"))))
            .or_else(|| find(&|h, _| !is_total(h) && (h.contains("rate") || h.contains("price"))));

        let quantity = by_name(&config.quantity_column).or_else(|| {
            find(&|_, w| {
                w.iter()
                    .any(|w| w == "qty" || w == "quantity" || w == "qnty")
            })
        });

        let description = find(&|h, _| h.contains("description"))
            .or_else(|| find(&|h, _| h.contains("product")))
            .or_else(|| find(&|_, w| w.iter().any(|w| w == "item" || w == "items")));

        let unit = find(&|h, w| {
            !h.contains("rate")
                && !h.contains("price")
                && w.iter().any(|w| w == "unit" || w == "uom" || w == "units")
        });

        Self {
            price,
            quantity,
            description,
            unit,
        }
    }
}

// ── Amount parsing ───────────────────────────────────────────────────────

/// Read a money or quantity amount out of a cell.
///
/// Accepts currency codes and symbols, thousands separators, decimal commas
/// and surrounding text. Placeholders such as `-`, `N/A` or `TBD` are not
/// numeric.
pub fn parse_amount(text: &str) -> Option<Decimal> {
    let trimmed = text.trim();
    if trimmed.is_empty() || NOT_NUMERIC.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }
    let raw = RE_AMOUNT.find(trimmed)?.as_str();
    let negative = raw.starts_with(['-', '−']);
    let digits: String = raw
        .trim_start_matches(['-', '−'])
        .trim_end_matches(['.', ','])
        .chars()
        .filter(|c| *c != '\'')
        .collect();

    let dots = digits.matches('.').count();
    let commas = digits.matches(',').count();
    let normalized = match (dots, commas) {
        (0, 0) => digits,
        (_, 0) if dots > 1 => digits.replace('.', ""),
        (_, 0) => digits,
        (0, 1) => {
            let after = digits.rsplit(',').next().map_or(0, str::len);
            if after == 3 {
                digits.replace(',', "")
            } else {
                digits.replace(',', ".")
            }
        }
        (0, _) => digits.replace(',', ""),
        _ => {
            let last_dot = digits.rfind('.').unwrap_or(0);
            let last_comma = digits.rfind(',').unwrap_or(0);
            if last_comma > last_dot {
                digits.replace('.', "").replace(',', ".")
            } else {
                digits.replace(',', "")
            }
        }
    };

    let value = Decimal::from_str(&normalized).ok()?;
    Some(if negative { -value } else { value })
}

// ── Engine ───────────────────────────────────────────────────────────────

/// Cost a stitched table with its extracted prices.
pub fn cost(table: &StitchedTable, config: &CostFactorConfig) -> Result<CostSheet, CostConfigError> {
    cost_with(table, config, |_, _, extracted| (extracted, None))
}

/// Cost a table, letting `base_for` replace each row's extracted base price.
///
/// The callback receives the row, the detected columns and the extracted
/// price, and returns the base price to use plus an optional tier outcome.
pub(crate) fn cost_with<F>(
    table: &StitchedTable,
    config: &CostFactorConfig,
    mut base_for: F,
) -> Result<CostSheet, CostConfigError>
where
    F: FnMut(&StitchedRow, &ColumnMap, Option<Decimal>) -> (Option<Decimal>, Option<TierMatch>),
{
    config.validate()?;
    let columns = ColumnMap::detect(&table.columns(), config);
    if columns.price.is_none() && table.data_rows().next().is_some() {
        warn!("No unit-price column detected; every row will be unpriced");
    }

    let cell_text = |row: &StitchedRow, idx: Option<usize>| {
        idx.and_then(|i| row.cells.get(i))
            .map(|c| c.text.clone())
            .filter(|t| !t.trim().is_empty())
    };

    let mut rows = Vec::new();
    for row in table.data_rows() {
        let extracted = cell_text(row, columns.price).and_then(|t| parse_amount(&t));
        let (base_price, tier_match) = base_for(row, &columns, extracted);
        let description = cell_text(row, columns.description);
        let unit = cell_text(row, columns.unit);
        let quantity = match columns.quantity {
            Some(_) => cell_text(row, columns.quantity).and_then(|t| parse_amount(&t)),
            None => Some(Decimal::ONE),
        };

        let Some(base) = base_price else {
            warn!(
                "Page {} row {}: no numeric unit price, passing through unpriced",
                row.page_index + 1,
                row.source_row
            );
            rows.push(PricedRow::unpriced(row, description, unit, None, quantity, tier_match));
            continue;
        };

        let priced = compose_unit_price(base, config).and_then(|(composed, mut breakdown)| {
            let extended = match quantity {
                Some(q) => Some(extend(composed, q, config, &mut breakdown)?),
                None => None,
            };
            Some((composed, extended, breakdown))
        });
        let Some((composed, extended_price, breakdown)) = priced else {
            warn!(
                "Page {} row {}: price out of range, passing through unpriced",
                row.page_index + 1,
                row.source_row
            );
            rows.push(PricedRow::unpriced(row, description, unit, Some(base), quantity, tier_match));
            continue;
        };
        if extended_price.is_none() {
            debug!(
                "Page {} row {}: quantity unreadable, extended price omitted",
                row.page_index + 1,
                row.source_row
            );
        }

        rows.push(PricedRow {
            row: row.clone(),
            description,
            unit,
            base_price: Some(base),
            quantity,
            unit_price: Some(config.round(composed)),
            extended_price,
            breakdown,
            unpriced: false,
            tier_match,
        });
    }

    let mut subtotal = Decimal::ZERO;
    for r in &mut rows {
        let Some(extended) = r.extended_price else {
            continue;
        };
        match subtotal.checked_add(extended) {
            Some(sum) => subtotal = sum,
            None => {
                warn!(
                    "Page {} row {}: subtotal out of range, passing through unpriced",
                    r.row.page_index + 1,
                    r.row.source_row
                );
                r.demote();
            }
        }
    }

    let per_row_rate = config.per_row_rate();
    let out_of_range = |what: &str| CostConfigError::TotalOutOfRange(what.to_string());
    let mut before_exchange = subtotal;
    let mut table_costs = Vec::new();
    for c in config
        .additional_costs
        .iter()
        .filter(|c| c.scope == CostScope::PerTable)
    {
        let delta = c
            .amount
            .checked_mul(per_row_rate)
            .ok_or_else(|| out_of_range(&c.name))?;
        before_exchange = before_exchange
            .checked_add(delta)
            .ok_or_else(|| out_of_range(&c.name))?;
        table_costs.push(FactorContribution {
            name: c.name.clone(),
            kind: FactorKind::Absolute,
            rate: c.amount,
            delta,
        });
    }

    let exchange = if config.exchange_scope == ExchangeScope::Total
        && config.exchange_rate != Decimal::ONE
    {
        let converted = before_exchange
            .checked_mul(config.exchange_rate)
            .ok_or_else(|| out_of_range("exchange_rate"))?;
        Some(FactorContribution {
            name: "exchange_rate".to_string(),
            kind: FactorKind::ExchangeRate,
            rate: config.exchange_rate,
            delta: converted - before_exchange,
        })
    } else {
        None
    };
    let grand_total =
        config.round(before_exchange + exchange.as_ref().map_or(Decimal::ZERO, |e| e.delta));

    let unpriced_rows = rows.iter().filter(|r| r.unpriced).count();
    let sheet = CostSheet {
        currency: config.currency.clone(),
        columns,
        priced_rows: rows.len() - unpriced_rows,
        unpriced_rows,
        rows,
        subtotal,
        table_costs,
        exchange,
        grand_total,
    };
    info!(
        "Costed {} row(s): {} priced, {} unpriced, grand total {} {}",
        sheet.rows.len(),
        sheet.priced_rows,
        sheet.unpriced_rows,
        sheet.grand_total,
        sheet.currency.code
    );
    Ok(sheet)
}

/// Apply the per-unit factors to a base price. Returns the exact composed
/// price and the contribution of each factor that changed it, or `None`
/// when the price leaves the representable range.
fn compose_unit_price(
    base: Decimal,
    config: &CostFactorConfig,
) -> Option<(Decimal, Vec<FactorContribution>)> {
    let mut running = base;
    let mut breakdown = Vec::new();

    for (name, pct) in config.percentages() {
        if pct.is_zero() {
            continue;
        }
        let next = running.checked_mul(Decimal::ONE + pct / Decimal::ONE_HUNDRED)?;
        breakdown.push(FactorContribution {
            name: name.to_string(),
            kind: FactorKind::Percentage,
            rate: pct,
            delta: next.checked_sub(running)?,
        });
        running = next;
    }

    if config.exchange_scope == ExchangeScope::PerRow && config.exchange_rate != Decimal::ONE {
        let next = running.checked_mul(config.exchange_rate)?;
        breakdown.push(FactorContribution {
            name: "exchange_rate".to_string(),
            kind: FactorKind::ExchangeRate,
            rate: config.exchange_rate,
            delta: next.checked_sub(running)?,
        });
        running = next;
    }

    Some((running, breakdown))
}

/// Multiply a composed unit price by `quantity` and charge the per-row
/// absolute costs once. Their contributions go into `breakdown` ahead of
/// any exchange step. `None` on overflow.
fn extend(
    composed: Decimal,
    quantity: Decimal,
    config: &CostFactorConfig,
    breakdown: &mut Vec<FactorContribution>,
) -> Option<Decimal> {
    let rate = config.per_row_rate();
    let mut at = breakdown
        .iter()
        .position(|f| f.kind == FactorKind::ExchangeRate)
        .unwrap_or(breakdown.len());
    let mut total = composed.checked_mul(quantity)?;

    for c in config
        .additional_costs
        .iter()
        .filter(|c| c.scope == CostScope::PerRow)
    {
        let delta = c.amount.checked_mul(rate)?;
        total = total.checked_add(delta)?;
        breakdown.insert(
            at,
            FactorContribution {
                name: c.name.clone(),
                kind: FactorKind::Absolute,
                rate: c.amount,
                delta,
            },
        );
        at += 1;
    }

    Some(config.round(total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stitch::{CellValue, RowKind};
    use rust_decimal_macros::dec;

    fn row(kind: RowKind, cells: &[&str], source_row: usize) -> StitchedRow {
        StitchedRow {
            kind,
            cells: cells.iter().map(|c| CellValue::text(*c)).collect(),
            page_index: 0,
            source_row,
        }
    }

    fn table(header: &[&str], data: &[&[&str]]) -> StitchedTable {
        let mut rows = vec![row(RowKind::Header, header, 0)];
        for (i, d) in data.iter().enumerate() {
            rows.push(row(RowKind::Data, d, i + 1));
        }
        StitchedTable {
            width: header.len(),
            rows,
        }
    }

    #[test]
    fn percentages_compound_in_order() {
        let t = table(&["Item", "Unit Rate"], &[&["Chair", "100"]]);
        let config = CostFactorConfig {
            margin_pct: dec!(10),
            freight_pct: dec!(5),
            ..Default::default()
        };
        let sheet = cost(&t, &config).unwrap();
        let r = &sheet.rows[0];
        assert_eq!(r.unit_price, Some(dec!(115.50)));
        assert_eq!(r.breakdown.len(), 2);
        assert_eq!(r.breakdown[0].delta, dec!(10));
        assert_eq!(r.breakdown[1].delta, dec!(5.5));
        assert_eq!(r.extended_price, Some(dec!(115.50)));
    }

    #[test]
    fn absolute_costs_follow_percentages() {
        let t = table(&["Item", "Rate"], &[&["Desk", "100"]]);
        let config = CostFactorConfig {
            margin_pct: dec!(10),
            additional_costs: vec![AdditionalCost {
                name: "packing".into(),
                amount: dec!(20),
                scope: CostScope::PerRow,
            }],
            ..Default::default()
        };
        let sheet = cost(&t, &config).unwrap();
        assert_eq!(sheet.rows[0].unit_price, Some(dec!(110)));
        assert_eq!(sheet.rows[0].extended_price, Some(dec!(130)));
        assert_eq!(sheet.rows[0].breakdown[1].kind, FactorKind::Absolute);
    }

    #[test]
    fn per_row_costs_are_charged_once_regardless_of_quantity() {
        let t = table(&["Item", "Qty", "Rate"], &[&["Chair", "10", "100"]]);
        let config = CostFactorConfig {
            additional_costs: vec![AdditionalCost {
                name: "delivery".into(),
                amount: dec!(20),
                scope: CostScope::PerRow,
            }],
            ..Default::default()
        };
        let sheet = cost(&t, &config).unwrap();
        let r = &sheet.rows[0];
        assert_eq!(r.unit_price, Some(dec!(100)));
        assert_eq!(r.extended_price, Some(dec!(1020)));
        assert_eq!(r.breakdown[0].delta, dec!(20));
        assert_eq!(sheet.grand_total, dec!(1020));
    }

    #[test]
    fn per_row_costs_precede_per_row_exchange() {
        let t = table(&["Item", "Qty", "Rate"], &[&["Chair", "3", "10"]]);
        let config = CostFactorConfig {
            exchange_rate: dec!(2),
            exchange_scope: ExchangeScope::PerRow,
            additional_costs: vec![AdditionalCost {
                name: "delivery".into(),
                amount: dec!(5),
                scope: CostScope::PerRow,
            }],
            ..Default::default()
        };
        let sheet = cost(&t, &config).unwrap();
        let r = &sheet.rows[0];
        // (10 × 3 + 5) × 2
        assert_eq!(r.extended_price, Some(dec!(70)));
        let kinds: Vec<FactorKind> = r.breakdown.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FactorKind::Absolute, FactorKind::ExchangeRate]);
        assert_eq!(r.breakdown[0].delta, dec!(10));
    }

    #[test]
    fn oversized_amounts_leave_the_row_unpriced() {
        let t = table(
            &["Item", "Qty", "Rate"],
            &[
                &["x", "1000000000000000", "100000000000000000"],
                &["Chair", "2", "50"],
            ],
        );
        let sheet = cost(&t, &CostFactorConfig::default()).unwrap();
        assert!(sheet.rows[0].unpriced);
        assert_eq!(sheet.rows[0].extended_price, None);
        assert_eq!(sheet.rows[0].base_price, Some(dec!(100000000000000000)));
        assert!(!sheet.rows[1].unpriced);
        assert_eq!(sheet.grand_total, dec!(100));
    }

    #[test]
    fn subtotal_overflow_unprices_the_offending_row() {
        let big = "50000000000000000000000000000";
        let t = table(&["Item", "Rate"], &[&["A", big], &["B", big], &["C", "7"]]);
        let sheet = cost(&t, &CostFactorConfig::default()).unwrap();
        assert!(!sheet.rows[0].unpriced);
        assert!(sheet.rows[1].unpriced);
        assert_eq!(sheet.rows[1].unit_price, None);
        assert_eq!(sheet.unpriced_rows, 1);
        assert_eq!(sheet.subtotal, dec!(50000000000000000000000000007));
    }

    #[test]
    fn table_cost_out_of_range_is_an_error() {
        let t = table(&["Item", "Rate"], &[&["A", "50000000000000000000000000000"]]);
        let config = CostFactorConfig {
            additional_costs: vec![AdditionalCost {
                name: "survey".into(),
                amount: dec!(50000000000000000000000000000),
                scope: CostScope::PerTable,
            }],
            ..Default::default()
        };
        assert_eq!(
            cost(&t, &config),
            Err(CostConfigError::TotalOutOfRange("survey".into()))
        );
    }

    #[test]
    fn table_costs_and_total_exchange() {
        let t = table(
            &["Description", "Qty", "Unit Price", "Total"],
            &[&["Chair", "2", "100", "200"], &["Desk", "1", "50", "50"]],
        );
        let config = CostFactorConfig {
            exchange_rate: dec!(2),
            additional_costs: vec![AdditionalCost {
                name: "survey".into(),
                amount: dec!(50),
                scope: CostScope::PerTable,
            }],
            ..Default::default()
        };
        let sheet = cost(&t, &config).unwrap();
        assert_eq!(sheet.subtotal, dec!(250));
        assert_eq!(sheet.table_costs[0].delta, dec!(50));
        assert_eq!(sheet.exchange.as_ref().unwrap().delta, dec!(300));
        assert_eq!(sheet.grand_total, dec!(600));
        assert_eq!(sheet.rows[0].unit_price, Some(dec!(100)));
    }

    #[test]
    fn per_row_exchange_converts_each_row() {
        let t = table(&["Item", "Rate"], &[&["Chair", "10"]]);
        let config = CostFactorConfig {
            exchange_rate: dec!(3.6725),
            exchange_scope: ExchangeScope::PerRow,
            ..Default::default()
        };
        let sheet = cost(&t, &config).unwrap();
        assert_eq!(sheet.rows[0].unit_price, Some(dec!(36.73)));
        assert!(sheet.exchange.is_none());
        assert_eq!(sheet.grand_total, dec!(36.73));
    }

    #[test]
    fn rounding_is_midpoint_away_from_zero_and_final_only() {
        let t = table(&["Item", "Rate"], &[&["A", "0.125"], &["B", "1.004"]]);
        let config = CostFactorConfig {
            margin_pct: dec!(0.1),
            ..Default::default()
        };
        let sheet = cost(&t, &config).unwrap();
        // 0.125 × 1.001 = 0.125125
        assert_eq!(sheet.rows[0].unit_price, Some(dec!(0.13)));
        // 1.004 × 1.001 = 1.005004; rounding the base first would give 1.00
        assert_eq!(sheet.rows[1].unit_price, Some(dec!(1.01)));
        assert_eq!(sheet.rows[1].breakdown[0].delta, dec!(0.001004));
    }

    #[test]
    fn unparseable_prices_are_unpriced() {
        let t = table(
            &["Item", "Unit Rate"],
            &[&["Chair", "N/A"], &["Desk", "TBD"], &["Lamp", "AED 45.00"]],
        );
        let sheet = cost(&t, &CostFactorConfig::default()).unwrap();
        assert!(sheet.rows[0].unpriced);
        assert!(sheet.rows[1].unpriced);
        assert!(!sheet.rows[2].unpriced);
        assert_eq!((sheet.priced_rows, sheet.unpriced_rows), (1, 2));
        assert_eq!(sheet.grand_total, dec!(45));
    }

    #[test]
    fn missing_price_column_leaves_all_rows_unpriced() {
        let t = table(&["Item", "Remarks"], &[&["Chair", "100"]]);
        let sheet = cost(&t, &CostFactorConfig::default()).unwrap();
        assert_eq!(sheet.unpriced_rows, 1);
        assert_eq!(sheet.grand_total, Decimal::ZERO);
    }

    #[test]
    fn unreadable_quantity_drops_extended_price_only() {
        let t = table(&["Item", "Qty", "Rate"], &[&["Chair", "lot", "100"]]);
        let sheet = cost(&t, &CostFactorConfig::default()).unwrap();
        let r = &sheet.rows[0];
        assert!(!r.unpriced);
        assert_eq!(r.unit_price, Some(dec!(100)));
        assert_eq!(r.extended_price, None);
        assert_eq!(sheet.subtotal, Decimal::ZERO);
    }

    #[test]
    fn costing_is_deterministic() {
        let t = table(
            &["Item", "Qty", "Rate"],
            &[&["Chair", "3", "99.99"], &["Desk", "1", "1,250.50"]],
        );
        let config = CostFactorConfig {
            margin_pct: dec!(12.5),
            customs_pct: dec!(5),
            ..Default::default()
        };
        assert_eq!(cost(&t, &config).unwrap(), cost(&t, &config).unwrap());
    }

    #[test]
    fn detects_columns_from_header() {
        let cols: Vec<String> = ["S.No", "Description", "Unit", "Qty.", "Unit Rate (AED)", "Total Amount"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let map = ColumnMap::detect(&cols, &CostFactorConfig::default());
        assert_eq!(
            map,
            ColumnMap {
                price: Some(4),
                quantity: Some(3),
                description: Some(1),
                unit: Some(2),
            }
        );
    }

    #[test]
    fn explicit_price_column_overrides_detection() {
        let cols: Vec<String> = ["Item", "Rate", "Supply Cost"].iter().map(|s| s.to_string()).collect();
        let config = CostFactorConfig {
            price_column: Some("supply  cost".into()),
            ..Default::default()
        };
        assert_eq!(ColumnMap::detect(&cols, &config).price, Some(2));
    }

    #[test]
    fn parses_amount_formats() {
        assert_eq!(parse_amount("1,250.50"), Some(dec!(1250.50)));
        assert_eq!(parse_amount("1.250,50"), Some(dec!(1250.50)));
        assert_eq!(parse_amount("AED 3,400"), Some(dec!(3400)));
        assert_eq!(parse_amount("12,5"), Some(dec!(12.5)));
        assert_eq!(parse_amount("1.234.567"), Some(dec!(1234567)));
        assert_eq!(parse_amount("$ 99.99 each"), Some(dec!(99.99)));
        assert_eq!(parse_amount("2 nos"), Some(dec!(2)));
        assert_eq!(parse_amount("-15"), Some(dec!(-15)));
        assert_eq!(parse_amount("N/A"), None);
        assert_eq!(parse_amount("-"), None);
        assert_eq!(parse_amount("TBD"), None);
        assert_eq!(parse_amount("   "), None);
        assert_eq!(parse_amount("included"), None);
    }

    #[test]
    fn validation_rejects_bad_factors() {
        let bad_pct = CostFactorConfig {
            freight_pct: dec!(-100),
            ..Default::default()
        };
        assert!(matches!(
            bad_pct.validate(),
            Err(CostConfigError::PercentageOutOfRange { ref name, .. }) if name == "freight"
        ));

        let bad_rate = CostFactorConfig {
            exchange_rate: Decimal::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            bad_rate.validate(),
            Err(CostConfigError::InvalidExchangeRate(_))
        ));

        let bad_currency = CostFactorConfig {
            currency: Currency {
                code: "XBT".into(),
                minor_units: 8,
            },
            ..Default::default()
        };
        assert_eq!(
            bad_currency.validate(),
            Err(CostConfigError::InvalidMinorUnits(8))
        );

        let unnamed = CostFactorConfig {
            additional_costs: vec![AdditionalCost {
                name: " ".into(),
                amount: dec!(1),
                scope: CostScope::PerRow,
            }],
            ..Default::default()
        };
        assert_eq!(unnamed.validate(), Err(CostConfigError::UnnamedCost(1)));
    }

    #[test]
    fn config_fields_are_optional_in_json() {
        let config: CostFactorConfig =
            serde_json::from_str(r#"{"margin_pct": 10, "exchange_rate": "3.6725"}"#).unwrap();
        assert_eq!(config.margin_pct, dec!(10));
        assert_eq!(config.exchange_rate, dec!(3.6725));
        assert_eq!(config.freight_pct, Decimal::ZERO);
        assert_eq!(config.currency.minor_units, 2);
        assert!(config.validate().is_ok());
    }
}
