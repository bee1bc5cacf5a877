use super::formulas::{self, Env, Quantity, Values};
use super::kpi;
use super::rules::BusinessRules;
use super::types::{
    CostBreakdown, FINAL_MONTH, Inputs, LAUNCH_MONTH, LaunchState, MemberCounts, MonthlyRecord,
    Phase, ProjectionResult, RevenueBreakdown,
};
use super::validate;

/// Raw output of the month loop, before KPI aggregation.
#[derive(Debug, Clone)]
pub struct MonthlyRun {
    /// Months 0 through `FINAL_MONTH`, in order.
    pub records: Vec<MonthlyRecord>,
    pub launch_state: LaunchState,
    pub statics: Values,
    /// Every quantity as evaluated for the final month.
    pub final_month: Values,
}

pub fn run_projection(inputs: &Inputs, rules: &BusinessRules) -> ProjectionResult {
    let run = run_months(inputs, rules);
    let kpis = kpi::aggregate(&run, inputs, rules);

    for violation in validate::check_series(&run.records) {
        log::warn!("projection output: {violation}");
    }

    let MonthlyRun {
        mut records,
        launch_state,
        ..
    } = run;
    let projection = records.split_off(LAUNCH_MONTH as usize);

    ProjectionResult {
        ramp_period: records,
        launch_state,
        projection,
        kpis,
    }
}

pub fn run_months(inputs: &Inputs, rules: &BusinessRules) -> MonthlyRun {
    let statics = formulas::evaluate_static(inputs, rules);
    let mut records = Vec::with_capacity(FINAL_MONTH as usize + 1);
    let mut previous = Values::new();

    for month in 0..LAUNCH_MONTH {
        let current = step(inputs, rules, month, &statics, &previous);
        records.push(to_record(month, &current));
        previous = current;
    }

    let launch_state = apply_launch_snapshot(&mut previous, &statics);
    log::debug!(
        "launch snapshot: {} primary ({} carried over), {} specialty ({} carried over), cash {:.2}",
        launch_state.primary_members,
        launch_state.primary_carryover_added,
        launch_state.specialty_members,
        launch_state.specialty_carryover_added,
        launch_state.cumulative_cash
    );

    for month in LAUNCH_MONTH..=FINAL_MONTH {
        let current = step(inputs, rules, month, &statics, &previous);
        records.push(to_record(month, &current));
        previous = current;
    }

    MonthlyRun {
        records,
        launch_state,
        statics,
        final_month: previous,
    }
}

/// Evaluates every monthly quantity for `month` in plan order.
fn step(
    inputs: &Inputs,
    rules: &BusinessRules,
    month: u32,
    statics: &Values,
    previous: &Values,
) -> Values {
    let mut current = statics.clone();
    for &q in &formulas::plan().monthly {
        let value = {
            let env = Env::new(inputs, rules, month, &current, previous);
            q.evaluate(&env)
        };
        current.set(q, value);
    }
    current
}

/// Folds physician carryover into the ramp's ending stock so the first
/// projection month starts from it.
fn apply_launch_snapshot(previous: &mut Values, statics: &Values) -> LaunchState {
    let ramp_primary = previous.get(Quantity::PrimaryActive);
    let ramp_specialty = previous.get(Quantity::SpecialtyActive);
    let primary_carryover = statics.get(Quantity::LaunchPrimaryCarryover);
    let specialty_carryover = statics.get(Quantity::LaunchSpecialtyCarryover);

    previous.set(Quantity::PrimaryActive, Some(ramp_primary + primary_carryover));
    previous.set(Quantity::SpecialtyActive, Some(ramp_specialty + specialty_carryover));

    LaunchState {
        month: LAUNCH_MONTH,
        ramp_primary_members: count(ramp_primary),
        primary_carryover_added: count(primary_carryover),
        specialty_carryover_added: count(specialty_carryover),
        primary_members: count(ramp_primary + primary_carryover),
        specialty_members: count(ramp_specialty + specialty_carryover),
        corporate_contracts: count(previous.get(Quantity::CorporateContracts)),
        cumulative_cash: previous.get(Quantity::CumulativeCash),
    }
}

fn count(value: f64) -> u32 {
    value.max(0.0).round() as u32
}

fn to_record(month: u32, values: &Values) -> MonthlyRecord {
    use Quantity as Q;
    MonthlyRecord {
        month,
        phase: Phase::of_month(month),
        members: MemberCounts {
            primary_active: count(values.get(Q::PrimaryActive)),
            specialty_active: count(values.get(Q::SpecialtyActive)),
            corporate_contracts: count(values.get(Q::CorporateContracts)),
            primary_new: count(values.get(Q::PrimaryNew)),
            primary_churned: count(values.get(Q::PrimaryChurned)),
            specialty_converted: count(values.get(Q::SpecialtyConverted)),
            specialty_new: count(values.get(Q::SpecialtyNew)),
            corporate_new: count(values.get(Q::CorporateNew)),
        },
        revenue: RevenueBreakdown {
            primary: values.get(Q::PrimaryRevenue),
            specialty: values.get(Q::SpecialtyRevenue),
            corporate: values.get(Q::CorporateRevenue),
            echo: values.get(Q::EchoRevenue),
            ct: values.get(Q::CtRevenue),
            labs: values.get(Q::LabsRevenue),
            total: values.get(Q::TotalRevenue),
        },
        costs: CostBreakdown {
            salaries: values.get(Q::Salaries),
            fixed_overhead: values.get(Q::FixedOverheadCost),
            marketing: values.get(Q::MarketingCost),
            variable: values.get(Q::VariableCost),
            equipment_lease: values.get(Q::EquipmentLeaseCost),
            startup: values.get(Q::StartupCost),
            diagnostics_cogs: values.get(Q::DiagnosticsCogs),
            total: values.get(Q::TotalCosts),
        },
        capital_injected: values.get(Q::CapitalInjected),
        capex_outlay: values.get(Q::CapexOutlay),
        profit: values.get(Q::Profit),
        cumulative_cash: values.get(Q::CumulativeCash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PROJECTION_MONTHS;
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn rules() -> BusinessRules {
        BusinessRules::standard()
    }

    /// Carryover-only book with diagnostics and inflation switched off.
    fn bare_membership_inputs() -> Inputs {
        let mut inputs = Inputs::default();
        inputs.ramp_primary_intake = 0;
        inputs.primary_intake = 0;
        inputs.specialty_intake = 0;
        inputs.corporate_contract_intake = 0;
        inputs.diagnostics_active = false;
        inputs.inflation_pct = 0.0;
        inputs
    }

    #[test]
    fn produces_ramp_then_projection_in_month_order() {
        let result = run_projection(&Inputs::default(), &rules());
        assert_eq!(result.ramp_period.len(), LAUNCH_MONTH as usize);
        assert_eq!(result.projection.len(), PROJECTION_MONTHS as usize);
        for (expected, record) in result.records().enumerate() {
            assert_eq!(record.month, expected as u32);
            assert_eq!(record.phase, Phase::of_month(record.month));
        }
    }

    #[test]
    fn ramp_accumulates_intake_without_churn_or_conversion() {
        let inputs = Inputs::default();
        let result = run_projection(&inputs, &rules());
        for (i, record) in result.ramp_period.iter().enumerate() {
            assert_eq!(record.members.primary_new, inputs.ramp_primary_intake);
            assert_eq!(record.members.primary_churned, 0);
            assert_eq!(record.members.specialty_converted, 0);
            assert_eq!(record.members.specialty_new, 0);
            assert_eq!(
                record.members.primary_active,
                inputs.ramp_primary_intake * (i as u32 + 1)
            );
            assert_approx(
                record.revenue.primary,
                f64::from(record.members.primary_active) * inputs.primary_price,
            );
        }
    }

    #[test]
    fn launch_snapshot_adds_physician_carryover() {
        let mut inputs = Inputs::default();
        inputs.additional_physicians = 2;
        let result = run_projection(&inputs, &rules());
        let launch = result.launch_state;

        let ramp_members = inputs.ramp_primary_intake * LAUNCH_MONTH;
        let primary_carryover = inputs.founding_primary_carryover
            + 2 * inputs.additional_primary_carryover_avg;
        let specialty_carryover = inputs.founding_specialty_carryover
            + 2 * inputs.additional_specialty_carryover_avg;

        assert_eq!(launch.month, LAUNCH_MONTH);
        assert_eq!(launch.ramp_primary_members, ramp_members);
        assert_eq!(launch.primary_carryover_added, primary_carryover);
        assert_eq!(launch.specialty_carryover_added, specialty_carryover);
        assert_eq!(launch.primary_members, ramp_members + primary_carryover);
        assert_eq!(launch.specialty_members, specialty_carryover);
        assert_approx(
            launch.cumulative_cash,
            result.ramp_period.last().unwrap().cumulative_cash,
        );
    }

    #[test]
    fn churn_is_applied_before_conversion() {
        let mut inputs = bare_membership_inputs();
        inputs.founding_primary_carryover = 100;
        inputs.founding_specialty_carryover = 0;
        inputs.annual_churn_pct = 60.0;
        inputs.specialty_conversion_pct = 50.0;

        let result = run_projection(&inputs, &rules());
        let first = result.projection[0].members;
        // 100 * 5% churns first, then half of the remaining 95 converts.
        assert_eq!(first.primary_churned, 5);
        assert_eq!(first.specialty_converted, 48);
        assert_eq!(first.primary_active, 47);
        assert_eq!(first.specialty_active, 48);
    }

    #[test]
    fn specialty_members_do_not_churn() {
        let mut inputs = bare_membership_inputs();
        inputs.founding_specialty_carryover = 40;
        inputs.annual_churn_pct = 100.0;
        inputs.specialty_conversion_pct = 0.0;

        let result = run_projection(&inputs, &rules());
        for record in &result.projection {
            assert_eq!(record.members.specialty_active, 40);
        }
        assert!(result.projection[0].members.primary_churned > 0);
    }

    #[test]
    fn role_costs_start_exactly_at_their_start_month() {
        let mut inputs = Inputs::default();
        inputs.inflation_pct = 0.0;
        inputs.nurse_practitioner_start_month = 10;
        let mut without_role = inputs.clone();
        without_role.nurse_practitioner_salary = 0.0;

        let with = run_months(&inputs, &rules());
        let without = run_months(&without_role, &rules());
        let monthly = inputs.nurse_practitioner_salary / 12.0
            * (1.0 + inputs.benefits_load_pct / 100.0);

        for (a, b) in with.records.iter().zip(&without.records) {
            let delta = a.costs.salaries - b.costs.salaries;
            if a.month < 10 {
                assert_eq!(delta, 0.0, "month {}", a.month);
            } else {
                assert_approx(delta, monthly);
            }
        }
    }

    #[test]
    fn inflation_steps_up_each_twelve_months() {
        let inputs = Inputs::default();
        let run = run_months(&inputs, &rules());
        let overhead = |month: usize| run.records[month].costs.fixed_overhead;
        assert_approx(overhead(11), inputs.fixed_overhead_monthly);
        assert_approx(overhead(12), inputs.fixed_overhead_monthly * 1.03);
        assert_approx(overhead(18), inputs.fixed_overhead_monthly * 1.03);
    }

    #[test]
    fn inactive_diagnostics_contribute_nothing() {
        let mut inputs = Inputs::default();
        inputs.diagnostics_active = false;
        for record in run_months(&inputs, &rules()).records {
            assert_eq!(record.revenue.diagnostics(), 0.0);
            assert_eq!(record.costs.equipment_lease, 0.0);
            assert_eq!(record.costs.diagnostics_cogs, 0.0);
        }
    }

    #[test]
    fn diagnostics_are_gated_by_service_start_month() {
        let inputs = Inputs::default();
        let run = run_months(&inputs, &rules());
        let echo_start = inputs.echo_start_month as usize;
        assert_eq!(run.records[echo_start - 1].revenue.echo, 0.0);
        assert_eq!(run.records[echo_start - 1].costs.equipment_lease, 0.0);
        assert_approx(
            run.records[echo_start].revenue.echo,
            f64::from(inputs.echo_monthly_volume) * inputs.echo_price,
        );
        assert_approx(run.records[echo_start].costs.equipment_lease, inputs.echo_lease_monthly);

        let record = &run.records[inputs.ct_start_month as usize];
        assert_approx(
            record.costs.diagnostics_cogs,
            record.revenue.diagnostics() * (1.0 - inputs.diagnostics_margin_pct / 100.0),
        );
    }

    #[test]
    fn startup_costs_can_be_split_over_two_months() {
        let mut inputs = Inputs::default();
        let whole = run_months(&inputs, &rules());
        assert_approx(whole.records[0].costs.startup, 70_000.0);
        assert_eq!(whole.records[1].costs.startup, 0.0);

        inputs.split_startup_costs = true;
        let split = run_months(&inputs, &rules());
        assert_approx(split.records[0].costs.startup, 35_000.0);
        assert_approx(split.records[1].costs.startup, 35_000.0);
        assert_eq!(split.records[2].costs.startup, 0.0);
    }

    #[test]
    fn capital_and_capex_move_cash_but_not_profit() {
        let mut inputs = Inputs::default();
        inputs.equity_buyout = 10_000.0;
        inputs.capex_month = 2;
        let run = run_months(&inputs, &rules());

        let month0 = &run.records[0];
        assert_approx(month0.capital_injected, 600_000.0);
        assert_approx(month0.cumulative_cash, 600_000.0 + month0.profit);

        let month2 = &run.records[2];
        assert_approx(month2.capex_outlay, 475_000.0);
        assert_approx(month2.profit, month2.revenue.total - month2.costs.total);
        assert_approx(
            month2.cumulative_cash - run.records[1].cumulative_cash,
            month2.profit - 475_000.0,
        );
    }

    #[test]
    fn corporate_contracts_accrue_from_start_month() {
        let mut inputs = Inputs::default();
        inputs.corporate_start_month = 3;
        inputs.corporate_contract_intake = 2;
        let run = run_months(&inputs, &rules());
        assert_eq!(run.records[2].members.corporate_contracts, 0);
        assert_eq!(run.records[3].members.corporate_contracts, 2);
        assert_eq!(run.records[18].members.corporate_contracts, 32);
        assert_approx(run.records[18].revenue.corporate, 32.0 * 20.0 * 50.0);
    }

    #[test]
    fn intake_growth_compounds_from_launch() {
        let mut inputs = Inputs::default();
        inputs.intake_growth_pct = 10.0;
        let run = run_months(&inputs, &rules());
        assert_eq!(run.records[7].members.primary_new, 25);
        assert_eq!(run.records[8].members.primary_new, 28); // 27.5 rounds up
        assert_eq!(run.records[9].members.primary_new, 30); // 30.25
    }

    #[test]
    fn member_counts_agree_with_billed_revenue_at_peak_growth() {
        let mut inputs = Inputs::default();
        inputs.intake_growth_pct = crate::core::types::MAX_INTAKE_GROWTH_PCT;
        inputs.primary_intake = 200;
        assert!(inputs.validate().is_ok());

        let run = run_months(&inputs, &rules());
        let last = run.records.last().unwrap();
        assert_eq!(last.members.primary_new, 200 * 2u32.pow(11));
        for record in &run.records {
            assert_eq!(
                record.revenue.primary,
                f64::from(record.members.primary_active) * inputs.primary_price
            );
            assert_eq!(
                record.revenue.specialty,
                f64::from(record.members.specialty_active) * inputs.specialty_price
            );
        }
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_series_identities_hold(
            additional in 0u32..6,
            has_founding in proptest::bool::ANY,
            ramp_intake in 0u32..60,
            intake in 0u32..200,
            specialty_intake in 0u32..30,
            churn_pct in 0u32..=100,
            conversion_pct in 0u32..=100,
            growth_bp in -5_000i32..5_000,
            primary_price in 0u32..600,
            diagnostics in proptest::bool::ANY,
            split in proptest::bool::ANY,
            capex_month in 0u32..=18,
            inflation_bp in 0u32..1_500,
        ) {
            let mut inputs = Inputs::default();
            inputs.additional_physicians = additional;
            inputs.has_founding_physician = has_founding;
            inputs.ramp_primary_intake = ramp_intake;
            inputs.primary_intake = intake;
            inputs.specialty_intake = specialty_intake;
            inputs.annual_churn_pct = f64::from(churn_pct);
            inputs.specialty_conversion_pct = f64::from(conversion_pct);
            inputs.intake_growth_pct = f64::from(growth_bp) / 100.0;
            inputs.primary_price = f64::from(primary_price);
            inputs.diagnostics_active = diagnostics;
            inputs.split_startup_costs = split;
            inputs.capex_month = capex_month;
            inputs.inflation_pct = f64::from(inflation_bp) / 100.0;
            prop_assert!(inputs.validate().is_ok());

            let run = run_months(&inputs, &rules());
            prop_assert_eq!(run.records.len(), FINAL_MONTH as usize + 1);

            let mut previous_cash = 0.0;
            let mut previous_primary = 0;
            for record in &run.records {
                if record.month == LAUNCH_MONTH {
                    previous_primary = run.launch_state.primary_members;
                }
                let members = record.members;
                prop_assert!(members.primary_churned <= previous_primary);
                prop_assert_eq!(
                    members.primary_active + members.primary_churned + members.specialty_converted,
                    previous_primary + members.primary_new
                );
                previous_primary = members.primary_active;

                prop_assert_eq!(
                    record.revenue.primary,
                    f64::from(members.primary_active) * inputs.primary_price
                );
                prop_assert_eq!(record.revenue.total, record.revenue.component_sum());
                prop_assert_eq!(record.costs.total, record.costs.component_sum());
                prop_assert_eq!(record.profit, record.revenue.total - record.costs.total);
                prop_assert_eq!(
                    record.cumulative_cash,
                    previous_cash + record.capital_injected + record.profit - record.capex_outlay
                );
                prop_assert!(record.revenue.total.is_finite());
                prop_assert!(record.costs.total.is_finite());
                previous_cash = record.cumulative_cash;
            }
        }
    }
}
