//! Cost ledger for chargeable pipeline operations.
//!
//! Every chargeable operation posts a debit against a hard cap. The cap is
//! checked before the posting commits, so the ledger total can never exceed
//! it. Amounts are tracked internally in integer micro-dollars so sub-cent
//! postings still count against the cap; public methods accept and return
//! dollars.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::metrics::MetricsCollector;

/// Micro-dollars per dollar for internal calculations.
const MICROS_PER_DOLLAR: f64 = 1_000_000.0;

/// Spend category of a ledger posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostCategory {
    Llm,
    ImageGeneration,
    VoiceSynthesis,
    Music,
    Storage,
    Compute,
    Critique,
    Fix,
}

impl CostCategory {
    /// All categories in reporting order.
    pub const ALL: [CostCategory; 8] = [
        CostCategory::Llm,
        CostCategory::ImageGeneration,
        CostCategory::VoiceSynthesis,
        CostCategory::Music,
        CostCategory::Storage,
        CostCategory::Compute,
        CostCategory::Critique,
        CostCategory::Fix,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CostCategory::Llm => "llm",
            CostCategory::ImageGeneration => "image_generation",
            CostCategory::VoiceSynthesis => "voice_synthesis",
            CostCategory::Music => "music",
            CostCategory::Storage => "storage",
            CostCategory::Compute => "compute",
            CostCategory::Critique => "critique",
            CostCategory::Fix => "fix",
        }
    }
}

impl fmt::Display for CostCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CostCategory {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CostCategory::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| LedgerError::InvalidAmount(format!("unknown cost category '{}'", s)))
    }
}

/// A single committed debit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub timestamp: DateTime<Utc>,
    pub category: CostCategory,
    pub amount_micros: u64,
    /// Free-form context, e.g. the stage or iteration that incurred the cost.
    pub note: String,
}

/// Running spend totals per category plus a hard cap.
///
/// The ledger is a plain value owned by its run; it is persisted with the
/// run and never shared between workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    cap_micros: u64,
    totals: BTreeMap<CostCategory, u64>,
    postings: Vec<Posting>,
}

/// Cost breakdown in dollars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub by_category: BTreeMap<CostCategory, f64>,
    pub total: f64,
    pub cap: f64,
    pub remaining: f64,
}

impl CostLedger {
    /// Create an empty ledger with a cap in dollars.
    ///
    /// # Example
    ///
    /// ```
    /// use reelforge::ledger::{CostCategory, CostLedger};
    ///
    /// let mut ledger = CostLedger::new(1.0);
    /// ledger.charge(CostCategory::Critique, 0.05, "baseline").unwrap();
    /// assert!((ledger.remaining() - 0.95).abs() < 1e-9);
    /// ```
    pub fn new(cap: f64) -> Self {
        Self {
            cap_micros: dollars_to_micros(cap),
            totals: BTreeMap::new(),
            postings: Vec::new(),
        }
    }

    /// Whether `amount` dollars can be posted without exceeding the cap.
    pub fn can_afford(&self, amount: f64) -> bool {
        if amount < 0.0 || !amount.is_finite() {
            return false;
        }
        self.total_micros() + dollars_to_micros(amount) <= self.cap_micros
    }

    /// Post a debit. The cap is checked before commit; on refusal the ledger
    /// is left untouched.
    pub fn charge(
        &mut self,
        category: CostCategory,
        amount: f64,
        note: impl Into<String>,
    ) -> Result<(), LedgerError> {
        if amount < 0.0 || !amount.is_finite() {
            return Err(LedgerError::InvalidAmount(format!(
                "cannot charge {} to {}",
                amount, category
            )));
        }

        let micros = dollars_to_micros(amount);
        let spent = self.total_micros();
        if spent + micros > self.cap_micros {
            return Err(LedgerError::BudgetExceeded {
                category: category.to_string(),
                requested: amount,
                spent: micros_to_dollars(spent),
                cap: micros_to_dollars(self.cap_micros),
            });
        }

        *self.totals.entry(category).or_insert(0) += micros;
        let note = note.into();
        tracing::debug!(
            category = %category,
            amount_micros = micros,
            total_micros = spent + micros,
            note = %note,
            "Ledger posting"
        );
        MetricsCollector::new().record_cost(category.as_str(), micros_to_dollars(micros));
        self.postings.push(Posting {
            timestamp: Utc::now(),
            category,
            amount_micros: micros,
            note,
        });
        Ok(())
    }

    /// Total spend in dollars.
    pub fn spent(&self) -> f64 {
        micros_to_dollars(self.total_micros())
    }

    /// Spend in dollars for one category.
    pub fn spent_in(&self, category: CostCategory) -> f64 {
        micros_to_dollars(self.totals.get(&category).copied().unwrap_or(0))
    }

    /// Remaining headroom under the cap in dollars.
    pub fn remaining(&self) -> f64 {
        micros_to_dollars(self.cap_micros.saturating_sub(self.total_micros()))
    }

    pub fn cap(&self) -> f64 {
        micros_to_dollars(self.cap_micros)
    }

    /// Raise the cap. This is the only way spend headroom grows; lowering the
    /// cap is rejected.
    pub fn raise_cap(&mut self, new_cap: f64) -> Result<(), LedgerError> {
        let new_micros = dollars_to_micros(new_cap);
        if !new_cap.is_finite() || new_micros < self.cap_micros {
            return Err(LedgerError::InvalidAmount(format!(
                "new cap ${:.2} is below current cap ${:.2}",
                new_cap,
                self.cap()
            )));
        }
        self.cap_micros = new_micros;
        Ok(())
    }

    /// Per-category breakdown in dollars.
    pub fn breakdown(&self) -> CostBreakdown {
        CostBreakdown {
            by_category: self
                .totals
                .iter()
                .map(|(category, &micros)| (*category, micros_to_dollars(micros)))
                .collect(),
            total: self.spent(),
            cap: self.cap(),
            remaining: self.remaining(),
        }
    }

    /// Append-only posting history.
    pub fn postings(&self) -> &[Posting] {
        &self.postings
    }

    fn total_micros(&self) -> u64 {
        self.totals.values().sum()
    }
}

/// Convert dollars to micro-dollars.
///
/// Rounds to the nearest micro-dollar, but never rounds a positive amount
/// down to zero.
pub(crate) fn dollars_to_micros(dollars: f64) -> u64 {
    if dollars <= 0.0 || !dollars.is_finite() {
        return 0;
    }
    ((dollars * MICROS_PER_DOLLAR).round() as u64).max(1)
}

/// Convert micro-dollars to dollars.
pub(crate) fn micros_to_dollars(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_DOLLAR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ledger() {
        let ledger = CostLedger::new(50.0);
        assert_eq!(ledger.spent(), 0.0);
        assert_eq!(ledger.cap(), 50.0);
        assert_eq!(ledger.remaining(), 50.0);
        assert!(ledger.postings().is_empty());
    }

    #[test]
    fn test_charge_within_cap() {
        let mut ledger = CostLedger::new(1.0);
        ledger
            .charge(CostCategory::Critique, 0.05, "iteration 1")
            .unwrap();
        ledger.charge(CostCategory::Fix, 0.20, "iteration 1").unwrap();

        assert!((ledger.spent() - 0.25).abs() < 1e-9);
        assert!((ledger.spent_in(CostCategory::Fix) - 0.20).abs() < 1e-9);
        assert_eq!(ledger.postings().len(), 2);
        assert_eq!(ledger.postings()[0].amount_micros, 50_000);
    }

    #[test]
    fn test_charge_refused_leaves_totals_untouched() {
        let mut ledger = CostLedger::new(0.30);
        ledger.charge(CostCategory::Llm, 0.25, "parse").unwrap();

        let err = ledger
            .charge(CostCategory::ImageGeneration, 0.10, "generate")
            .unwrap_err();
        assert!(matches!(err, LedgerError::BudgetExceeded { .. }));
        assert!((ledger.spent() - 0.25).abs() < 1e-9);
        assert_eq!(ledger.postings().len(), 1);
        assert_eq!(ledger.spent_in(CostCategory::ImageGeneration), 0.0);
    }

    #[test]
    fn test_charge_exactly_to_cap() {
        let mut ledger = CostLedger::new(0.25);
        assert!(ledger.can_afford(0.25));
        ledger.charge(CostCategory::Fix, 0.25, "fix").unwrap();
        assert_eq!(ledger.remaining(), 0.0);
        assert!(!ledger.can_afford(0.01));
        assert!(ledger.can_afford(0.0));
    }

    #[test]
    fn test_zero_cap_refuses_everything_chargeable() {
        let ledger = CostLedger::new(0.0);
        assert!(!ledger.can_afford(0.05));
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut ledger = CostLedger::new(10.0);
        assert!(matches!(
            ledger.charge(CostCategory::Compute, -1.0, "refund"),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(!ledger.can_afford(-1.0));
    }

    #[test]
    fn test_raise_cap() {
        let mut ledger = CostLedger::new(1.0);
        ledger.charge(CostCategory::Music, 1.0, "score").unwrap();
        assert!(!ledger.can_afford(0.5));

        ledger.raise_cap(2.0).unwrap();
        assert!(ledger.can_afford(0.5));
        assert!(ledger.raise_cap(1.5).is_err());
    }

    #[test]
    fn test_breakdown() {
        let mut ledger = CostLedger::new(10.0);
        ledger.charge(CostCategory::Llm, 1.5, "parse").unwrap();
        ledger.charge(CostCategory::Llm, 0.5, "graph").unwrap();
        ledger.charge(CostCategory::VoiceSynthesis, 2.0, "narration").unwrap();

        let breakdown = ledger.breakdown();
        assert_eq!(breakdown.by_category.get(&CostCategory::Llm), Some(&2.0));
        assert_eq!(
            breakdown.by_category.get(&CostCategory::VoiceSynthesis),
            Some(&2.0)
        );
        assert_eq!(breakdown.total, 4.0);
        assert_eq!(breakdown.remaining, 6.0);
    }

    #[test]
    fn test_category_round_trip_names() {
        for category in CostCategory::ALL {
            assert_eq!(category.as_str().parse::<CostCategory>().unwrap(), category);
        }
        assert!("catering".parse::<CostCategory>().is_err());
    }

    #[test]
    fn test_dollars_to_micros_conversion() {
        assert_eq!(dollars_to_micros(1.0), 1_000_000);
        assert_eq!(dollars_to_micros(0.05), 50_000);
        assert_eq!(dollars_to_micros(0.004), 4_000);
        assert_eq!(dollars_to_micros(1e-9), 1);
        assert_eq!(dollars_to_micros(0.0), 0);
        assert_eq!(dollars_to_micros(-3.0), 0);
    }

    #[test]
    fn test_sub_cent_charges_count_against_cap() {
        let mut ledger = CostLedger::new(1.0);
        let mut accepted = 0;
        for frame in 0..1000 {
            match ledger.charge(CostCategory::ImageGeneration, 0.004, format!("frame {}", frame)) {
                Ok(()) => accepted += 1,
                Err(LedgerError::BudgetExceeded { .. }) => break,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(accepted, 250);
        assert!((ledger.spent() - 1.0).abs() < 1e-9);
        assert_eq!(ledger.remaining(), 0.0);
        assert_eq!(ledger.postings().len(), 250);
        assert!(!ledger.can_afford(0.004));
    }

    #[test]
    fn test_tiny_charge_is_never_free() {
        let mut ledger = CostLedger::new(1.0);
        ledger.charge(CostCategory::Llm, 1e-8, "token").unwrap();
        assert_eq!(ledger.postings()[0].amount_micros, 1);
        assert!(ledger.spent() > 0.0);
    }
}
