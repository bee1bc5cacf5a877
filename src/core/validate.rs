use std::fmt;

use serde::Serialize;

use super::types::MonthlyRecord;

/// Largest accepted gap between a total and its components: half a cent.
pub const CURRENCY_TOLERANCE: f64 = 0.005;

/// An accounting identity broken by a monthly series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SeriesViolation {
    /// Record at `index` is not month `index`.
    MonthOrder { index: usize, month: u32 },
    /// A money field is NaN or infinite.
    NonFinite { month: u32, field: &'static str },
    /// `revenue.total` differs from the sum of its lines.
    RevenueTotal { month: u32, total: f64, components: f64 },
    /// `costs.total` differs from the sum of its lines.
    CostTotal { month: u32, total: f64, components: f64 },
    /// `profit` differs from revenue minus costs.
    Profit { month: u32, expected: f64, actual: f64 },
    /// Cumulative cash is not the running sum of injections, profit and capex.
    CashChain { month: u32, expected: f64, actual: f64 },
}

impl fmt::Display for SeriesViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MonthOrder { index, month } => {
                write!(f, "MonthOrder index={index}: month={month}")
            }
            Self::NonFinite { month, field } => write!(f, "NonFinite month={month}: {field}"),
            Self::RevenueTotal {
                month,
                total,
                components,
            } => write!(
                f,
                "RevenueTotal month={month}: total={total:.4} components={components:.4}"
            ),
            Self::CostTotal {
                month,
                total,
                components,
            } => write!(
                f,
                "CostTotal month={month}: total={total:.4} components={components:.4}"
            ),
            Self::Profit {
                month,
                expected,
                actual,
            } => write!(f, "Profit month={month}: expected={expected:.4} actual={actual:.4}"),
            Self::CashChain {
                month,
                expected,
                actual,
            } => write!(
                f,
                "CashChain month={month}: expected={expected:.4} actual={actual:.4}"
            ),
        }
    }
}

fn money_fields(record: &MonthlyRecord) -> [(&'static str, f64); 18] {
    let r = &record.revenue;
    let c = &record.costs;
    [
        ("revenue.primary", r.primary),
        ("revenue.specialty", r.specialty),
        ("revenue.corporate", r.corporate),
        ("revenue.echo", r.echo),
        ("revenue.ct", r.ct),
        ("revenue.labs", r.labs),
        ("revenue.total", r.total),
        ("costs.salaries", c.salaries),
        ("costs.fixedOverhead", c.fixed_overhead),
        ("costs.marketing", c.marketing),
        ("costs.variable", c.variable),
        ("costs.equipmentLease", c.equipment_lease),
        ("costs.startup", c.startup),
        ("costs.diagnosticsCogs", c.diagnostics_cogs),
        ("costs.total", c.total),
        ("capitalInjected", record.capital_injected),
        ("capexOutlay", record.capex_outlay),
        ("cumulativeCash", record.cumulative_cash),
    ]
}

fn differs(a: f64, b: f64) -> bool {
    (a - b).abs() > CURRENCY_TOLERANCE
}

/// Checks the accounting identities of a series that starts at month 0.
pub fn check_series(records: &[MonthlyRecord]) -> Vec<SeriesViolation> {
    let mut violations = Vec::new();
    let mut previous_cash = 0.0;

    for (index, record) in records.iter().enumerate() {
        let month = record.month;
        if month as usize != index {
            violations.push(SeriesViolation::MonthOrder { index, month });
        }

        let mut finite = record.profit.is_finite();
        if !finite {
            violations.push(SeriesViolation::NonFinite {
                month,
                field: "profit",
            });
        }
        for (field, value) in money_fields(record) {
            if !value.is_finite() {
                finite = false;
                violations.push(SeriesViolation::NonFinite { month, field });
            }
        }
        if !finite {
            previous_cash = record.cumulative_cash;
            continue;
        }

        let revenue = record.revenue.component_sum();
        if differs(record.revenue.total, revenue) {
            violations.push(SeriesViolation::RevenueTotal {
                month,
                total: record.revenue.total,
                components: revenue,
            });
        }

        let costs = record.costs.component_sum();
        if differs(record.costs.total, costs) {
            violations.push(SeriesViolation::CostTotal {
                month,
                total: record.costs.total,
                components: costs,
            });
        }

        let profit = record.revenue.total - record.costs.total;
        if differs(record.profit, profit) {
            violations.push(SeriesViolation::Profit {
                month,
                expected: profit,
                actual: record.profit,
            });
        }

        let cash = previous_cash + record.capital_injected + record.profit - record.capex_outlay;
        if differs(record.cumulative_cash, cash) {
            violations.push(SeriesViolation::CashChain {
                month,
                expected: cash,
                actual: record.cumulative_cash,
            });
        }
        previous_cash = record.cumulative_cash;
    }

    violations
}
