use serde::Serialize;

/// Capital and revenue-sharing terms for one physician type.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicianTerms {
    pub capital_contribution: f64,
    pub mso_fee_pct: f64,
    pub equity_pct: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessRules {
    pub founding: PhysicianTerms,
    pub additional: PhysicianTerms,
}

impl BusinessRules {
    pub const fn standard() -> Self {
        Self {
            founding: PhysicianTerms {
                capital_contribution: 600_000.0,
                mso_fee_pct: 37.0,
                equity_pct: 10.0,
            },
            additional: PhysicianTerms {
                capital_contribution: 750_000.0,
                mso_fee_pct: 40.0,
                equity_pct: 5.0,
            },
        }
    }

    pub fn value(&self, field: RuleField) -> f64 {
        match field {
            RuleField::FoundingCapital => self.founding.capital_contribution,
            RuleField::FoundingFeePct => self.founding.mso_fee_pct,
            RuleField::FoundingEquityPct => self.founding.equity_pct,
            RuleField::AdditionalCapital => self.additional.capital_contribution,
            RuleField::AdditionalFeePct => self.additional.mso_fee_pct,
            RuleField::AdditionalEquityPct => self.additional.equity_pct,
        }
    }
}

impl Default for BusinessRules {
    fn default() -> Self {
        Self::standard()
    }
}

/// Addressable constants of the rules table, so formulas can read them by name.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum RuleField {
    FoundingCapital,
    FoundingFeePct,
    FoundingEquityPct,
    AdditionalCapital,
    AdditionalFeePct,
    AdditionalEquityPct,
}

impl RuleField {
    pub const ALL: [RuleField; 6] = [
        RuleField::FoundingCapital,
        RuleField::FoundingFeePct,
        RuleField::FoundingEquityPct,
        RuleField::AdditionalCapital,
        RuleField::AdditionalFeePct,
        RuleField::AdditionalEquityPct,
    ];

    pub fn key(self) -> &'static str {
        match self {
            RuleField::FoundingCapital => "founding_capital_contribution",
            RuleField::FoundingFeePct => "founding_mso_fee_pct",
            RuleField::FoundingEquityPct => "founding_equity_pct",
            RuleField::AdditionalCapital => "additional_capital_contribution",
            RuleField::AdditionalFeePct => "additional_mso_fee_pct",
            RuleField::AdditionalEquityPct => "additional_equity_pct",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            RuleField::FoundingCapital => "Founding physician capital contribution",
            RuleField::FoundingFeePct => "Founding physician MSO fee %",
            RuleField::FoundingEquityPct => "Founding physician equity %",
            RuleField::AdditionalCapital => "Additional physician capital contribution",
            RuleField::AdditionalFeePct => "Additional physician MSO fee %",
            RuleField::AdditionalEquityPct => "Additional physician equity %",
        }
    }
}
