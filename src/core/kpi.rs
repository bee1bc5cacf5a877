//! Scalar business metrics over a finished monthly series.
//!
//! Every ratio is a summary-scope [`Quantity`], so the figures reported here
//! and the values shown on the dependency graph come from one evaluation.

use super::engine::MonthlyRun;
use super::formulas::{self, Env, Quantity, Values, ratio};
use super::rules::BusinessRules;
use super::types::{
    CapitalDeployment, CashTrough, DeploymentCategory, DeploymentLine, FINAL_MONTH, Inputs,
    KpiBundle, LAUNCH_MONTH, UnitEconomics,
};

/// Conventional LTV:CAC floor for a sustainable acquisition spend.
pub const HEALTHY_LTV_TO_CAC: f64 = 3.0;

/// Static values plus every summary quantity, in plan order.
pub fn evaluate_summary(run: &MonthlyRun, inputs: &Inputs, rules: &BusinessRules) -> Values {
    let mut values = run.statics.clone();
    let unused = Values::new();
    for &q in &formulas::plan().summary {
        let value = {
            let env =
                Env::new(inputs, rules, FINAL_MONTH, &values, &unused).with_series(&run.records);
            q.evaluate(&env)
        };
        values.set(q, value);
    }
    values
}

pub fn aggregate(run: &MonthlyRun, inputs: &Inputs, rules: &BusinessRules) -> KpiBundle {
    use Quantity as Q;

    let summary = evaluate_summary(run, inputs, rules);

    let breakeven_month = summary.get_opt(Q::BreakevenMonth).map(|m| m as u32);
    let cash_trough = summary
        .get_opt(Q::CashTroughMonth)
        .zip(summary.get_opt(Q::CashTrough))
        .map(|(month, cumulative_cash)| CashTrough {
            month: month as u32,
            cumulative_cash,
        });
    let ltv_to_cac = summary.get_opt(Q::LtvToCac);

    KpiBundle {
        breakeven_month,
        months_to_breakeven: breakeven_month.map(|m| m.saturating_sub(LAUNCH_MONTH)),
        total_capital_raised: summary.get(Q::TotalCapitalRaised),
        individual_investment: summary.get(Q::IndividualInvestment),
        projection_revenue: summary.get(Q::ProjectionRevenue),
        projection_costs: summary.get(Q::ProjectionCosts),
        projection_profit: summary.get(Q::ProjectionProfit),
        ending_cash: summary.get(Q::EndingCash),
        cash_trough,
        mso_roi: summary.get_opt(Q::MsoRoi),
        physician_annual_income: summary.get_opt(Q::PhysicianAnnualIncome),
        physician_roi: summary.get_opt(Q::PhysicianRoi),
        payback_months: summary.get_opt(Q::PaybackMonths),
        unit_economics: UnitEconomics {
            revenue_per_member: summary.get_opt(Q::RevenuePerMember),
            lifetime_months: summary.get_opt(Q::MemberLifetimeMonths),
            ltv: summary.get_opt(Q::Ltv),
            cac: summary.get_opt(Q::Cac),
            ltv_to_cac,
            healthy: ltv_to_cac.is_some_and(|r| r >= HEALTHY_LTV_TO_CAC),
        },
        capital_deployment: capital_deployment(inputs, &summary),
    }
}

/// Partitions total capital raised; the reserve line absorbs the remainder,
/// so the lines always sum to the total.
pub fn capital_deployment(inputs: &Inputs, statics: &Values) -> CapitalDeployment {
    use DeploymentCategory as D;

    let total_raised = statics.get(Quantity::TotalCapitalRaised);
    let reserve = statics.get(Quantity::DeploymentReserve);
    let amounts = [
        (D::Buildout, inputs.buildout_capex),
        (D::Equipment, statics.get(Quantity::DeploymentEquipment)),
        (D::Startup, statics.get(Quantity::StartupTotal)),
        (D::WorkingCapital, inputs.working_capital_reserve),
        (D::EquityBuyout, inputs.equity_buyout),
        (D::Reserve, reserve),
    ];

    CapitalDeployment {
        total_raised,
        lines: amounts
            .into_iter()
            .map(|(category, amount)| DeploymentLine {
                category,
                amount,
                pct_of_total: ratio(amount, total_raised).map(|r| r * 100.0),
            })
            .collect(),
        overcommitted: reserve < 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::run_months;
    use crate::core::types::Phase;

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn kpis_for(inputs: &Inputs) -> (MonthlyRun, KpiBundle) {
        let rules = BusinessRules::standard();
        let run = run_months(inputs, &rules);
        let kpis = aggregate(&run, inputs, &rules);
        (run, kpis)
    }

    fn projection_sum(run: &MonthlyRun, f: impl Fn(&crate::core::types::MonthlyRecord) -> f64) -> f64 {
        run.records
            .iter()
            .filter(|r| r.phase == Phase::Projection)
            .map(f)
            .sum()
    }

    #[test]
    fn projection_totals_cover_the_twelve_projection_months() {
        let (run, kpis) = kpis_for(&Inputs::default());
        assert_approx(kpis.projection_revenue, projection_sum(&run, |r| r.revenue.total));
        assert_approx(kpis.projection_costs, projection_sum(&run, |r| r.costs.total));
        assert_approx(kpis.projection_profit, projection_sum(&run, |r| r.profit));
        assert_approx(kpis.ending_cash, run.records.last().unwrap().cumulative_cash);
    }

    #[test]
    fn mso_and_physician_roi_use_different_denominators() {
        let mut inputs = Inputs::default();
        inputs.additional_physicians = 2;
        let (run, kpis) = kpis_for(&inputs);

        assert_approx(kpis.total_capital_raised, 600_000.0 + 2.0 * 750_000.0);
        assert_approx(kpis.individual_investment, 600_000.0);

        let mso_roi = kpis.mso_roi.unwrap();
        assert_approx(mso_roi, kpis.projection_profit / kpis.total_capital_raised * 100.0);

        let specialty = projection_sum(&run, |r| r.revenue.specialty);
        let income = specialty / 3.0 * (1.0 - 0.37) + kpis.projection_profit * 0.10;
        assert_approx(kpis.physician_annual_income.unwrap(), income);
        let physician_roi = kpis.physician_roi.unwrap();
        assert_approx(physician_roi, income / 600_000.0 * 100.0);
        assert!((physician_roi - mso_roi).abs() > 1e-3);
    }

    #[test]
    fn additional_physician_terms_apply_without_a_founder() {
        let mut inputs = Inputs::default();
        inputs.has_founding_physician = false;
        inputs.additional_physicians = 1;
        let (run, kpis) = kpis_for(&inputs);

        assert_approx(kpis.individual_investment, 750_000.0);
        let specialty = projection_sum(&run, |r| r.revenue.specialty);
        let income = specialty * (1.0 - 0.40) + kpis.projection_profit * 0.05;
        assert_approx(kpis.physician_annual_income.unwrap(), income);
    }

    #[test]
    fn payback_is_not_reached_without_positive_income() {
        let mut inputs = Inputs::default();
        inputs.primary_price = 0.0;
        inputs.specialty_price = 0.0;
        inputs.corporate_pepm = 0.0;
        inputs.diagnostics_active = false;
        let (_, kpis) = kpis_for(&inputs);
        assert!(kpis.physician_annual_income.unwrap() < 0.0);
        assert_eq!(kpis.payback_months, None);
        assert_eq!(kpis.breakeven_month, None);
        assert_eq!(kpis.months_to_breakeven, None);
    }

    #[test]
    fn payback_divides_investment_by_monthly_income() {
        let (_, kpis) = kpis_for(&Inputs::default());
        let income = kpis.physician_annual_income.unwrap();
        if income > 0.0 {
            assert_approx(kpis.payback_months.unwrap(), 600_000.0 / (income / 12.0));
        } else {
            assert_eq!(kpis.payback_months, None);
        }
    }

    #[test]
    fn ratios_are_not_applicable_without_capital() {
        let mut inputs = Inputs::default();
        inputs.has_founding_physician = false;
        inputs.additional_physicians = 0;
        let (_, kpis) = kpis_for(&inputs);
        assert_eq!(kpis.total_capital_raised, 0.0);
        assert_eq!(kpis.mso_roi, None);
        assert_eq!(kpis.physician_annual_income, None);
        assert_eq!(kpis.physician_roi, None);
        assert!(kpis
            .capital_deployment
            .lines
            .iter()
            .all(|line| line.pct_of_total.is_none()));
        assert!(kpis.capital_deployment.overcommitted);
    }

    #[test]
    fn breakeven_is_first_profitable_month() {
        let (run, kpis) = kpis_for(&Inputs::default());
        let expected = run.records.iter().find(|r| r.profit > 0.0).map(|r| r.month);
        assert_eq!(kpis.breakeven_month, expected);
        assert_eq!(
            kpis.months_to_breakeven,
            expected.map(|m| m.saturating_sub(LAUNCH_MONTH))
        );
    }

    #[test]
    fn cash_trough_is_the_lowest_cumulative_cash() {
        let (run, kpis) = kpis_for(&Inputs::default());
        let trough = kpis.cash_trough.unwrap();
        let lowest = run
            .records
            .iter()
            .map(|r| r.cumulative_cash)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(trough.cumulative_cash, lowest);
        assert_eq!(run.records[trough.month as usize].cumulative_cash, lowest);
    }

    #[test]
    fn unit_economics_use_assumed_churn_and_final_month() {
        let inputs = Inputs::default();
        let (run, kpis) = kpis_for(&inputs);
        let last = run.records.last().unwrap();
        let unit = &kpis.unit_economics;

        let members = f64::from(last.members.primary_active + last.members.specialty_active);
        let per_member = (last.revenue.primary + last.revenue.specialty) / members;
        assert_approx(unit.revenue_per_member.unwrap(), per_member);
        assert_approx(unit.lifetime_months.unwrap(), 12.0 / 0.15);
        assert_approx(unit.ltv.unwrap(), per_member * 80.0);

        // 12 months of 25 primary and 4 specialty joiners.
        assert_approx(unit.cac.unwrap(), 4_000.0 * 12.0 / 348.0);
        let ratio = unit.ltv.unwrap() / unit.cac.unwrap();
        assert_approx(unit.ltv_to_cac.unwrap(), ratio);
        assert_eq!(unit.healthy, ratio >= HEALTHY_LTV_TO_CAC);
    }

    #[test]
    fn unit_economics_without_acquisition_are_not_applicable() {
        let mut inputs = Inputs::default();
        inputs.primary_intake = 0;
        inputs.specialty_intake = 0;
        inputs.ltv_assumed_annual_churn_pct = 0.0;
        let (_, kpis) = kpis_for(&inputs);
        let unit = &kpis.unit_economics;
        assert_eq!(unit.cac, None);
        assert_eq!(unit.lifetime_months, None);
        assert_eq!(unit.ltv, None);
        assert_eq!(unit.ltv_to_cac, None);
        assert!(!unit.healthy);
    }

    #[test]
    fn capital_deployment_partitions_total_raised() {
        let mut inputs = Inputs::default();
        inputs.equity_buyout = 20_000.0;
        let (_, kpis) = kpis_for(&inputs);
        let deployment = &kpis.capital_deployment;

        let sum: f64 = deployment.lines.iter().map(|line| line.amount).sum();
        assert_approx(sum, deployment.total_raised);
        let pct: f64 = deployment.lines.iter().filter_map(|line| line.pct_of_total).sum();
        assert_approx(pct, 100.0);

        assert_approx(deployment.amount(DeploymentCategory::Equipment), 215_000.0);
        assert_approx(deployment.amount(DeploymentCategory::EquityBuyout), 20_000.0);
        assert_approx(deployment.amount(DeploymentCategory::Reserve), -5_000.0);
        assert!(deployment.overcommitted);
    }
}
