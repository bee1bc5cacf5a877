//! Founding physician alone, default assumptions, no diagnostics line.
//! Expected figures were worked by hand from the monthly formulas.

use mso_model::core::{BusinessRules, Inputs, Phase, check_series, run_projection};

const CENT: f64 = 0.005;

fn assert_money(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= CENT,
        "expected {expected:.2}, got {actual:.4}"
    );
}

fn founding_only() -> Inputs {
    Inputs {
        diagnostics_active: false,
        ..Inputs::default()
    }
}

#[test]
fn founding_physician_projection_matches_hand_computation() {
    let result = run_projection(&founding_only(), &BusinessRules::standard());

    let launch = &result.launch_state;
    assert_eq!(launch.ramp_primary_members, 35);
    assert_eq!(launch.primary_members, 185);
    assert_eq!(launch.specialty_members, 40);
    assert_money(launch.cumulative_cash, -136_768.0);

    let first = &result.projection[0];
    assert_eq!(first.month, 7);
    assert_eq!(first.members.primary_churned, 2);
    assert_eq!(first.members.specialty_converted, 4);
    assert_eq!(first.members.primary_active, 204);
    assert_eq!(first.members.specialty_active, 48);
    assert_money(first.profit, -512.0);

    let last = result.projection.last().expect("projection months");
    assert_eq!(last.month, 18);
    assert_eq!(last.phase, Phase::Projection);
    assert_eq!(last.members.primary_active, 385);
    assert_eq!(last.members.specialty_active, 154);
    assert_eq!(last.members.corporate_contracts, 12);
    assert_money(last.revenue.total, 148_675.0);
    assert_money(last.costs.salaries, 42_217.64);
    assert_money(last.costs.total, 76_651.64);
    assert_money(last.profit, 72_023.36);
    assert_money(last.cumulative_cash, 263_483.52);
}

#[test]
fn founding_physician_kpis_match_hand_computation() {
    let result = run_projection(&founding_only(), &BusinessRules::standard());
    let kpis = &result.kpis;

    assert_money(kpis.projection_profit, 400_251.52);
    assert_money(kpis.ending_cash, 263_483.52);
    assert_eq!(kpis.breakeven_month, Some(8));
    assert_eq!(kpis.months_to_breakeven, Some(1));

    let trough = kpis.cash_trough.expect("cash trough");
    assert_eq!(trough.month, 7);
    assert_money(trough.cumulative_cash, -137_280.0);

    // 529,200 specialty revenue at 63% kept, plus 10% of projection profit.
    assert_money(kpis.physician_annual_income.expect("income"), 373_421.152);
    assert!((kpis.physician_roi.expect("physician roi") - 62.236_858_667).abs() < 1e-6);
    assert!((kpis.mso_roi.expect("mso roi") - 66.708_586_667).abs() < 1e-6);

    let unit = &kpis.unit_economics;
    assert_money(unit.revenue_per_member.expect("per member") * 539.0, 136_675.0);
    assert!(unit.healthy);
}

#[test]
fn full_default_projection_passes_series_checks() {
    let mut inputs = Inputs::default();
    inputs.additional_physicians = 3;
    inputs.split_startup_costs = true;
    inputs.intake_growth_pct = 4.0;
    let result = run_projection(&inputs, &BusinessRules::standard());
    let records: Vec<_> = result.records().cloned().collect();
    assert_eq!(records.len(), 19);
    assert!(check_series(&records).is_empty());
}
