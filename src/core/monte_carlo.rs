use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use rayon::prelude::*;
use serde::Serialize;

use super::error::{InputError, SimulationError};
use super::formulas::{self, Quantity, ratio, round_half_up};
use super::rules::BusinessRules;
use super::types::{InputField, Inputs, LAUNCH_MONTH, MAX_ITERATIONS, PROJECTION_MONTHS};

pub const HISTOGRAM_BUCKETS: usize = 30;
/// Variable-cost percentage is perturbed by up to this share of its value.
pub const VARIABLE_COST_VARIANCE: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub net_profit: f64,
    pub roi: Option<f64>,
    pub final_member_count: u32,
    pub revenue: f64,
    pub costs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Percentiles {
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
}

impl Percentiles {
    fn of(mut values: Vec<f64>) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_by(|a, b| a.total_cmp(b));
        Some(Self {
            p10: percentile(&values, 10.0),
            p50: percentile(&values, 50.0),
            p90: percentile(&values, 90.0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomePercentiles {
    pub net_profit: Percentiles,
    /// `None` when no iteration has a defined ROI.
    pub roi: Option<Percentiles>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Probabilities {
    pub profit: f64,
    pub positive_roi: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistogramBucket {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
    pub probability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub seed: u64,
    /// One outcome per iteration, in iteration order.
    #[serde(rename = "iterations")]
    pub outcomes: Vec<Outcome>,
    pub mean_net_profit: f64,
    pub percentiles: OutcomePercentiles,
    pub probabilities: Probabilities,
    pub histogram: Vec<HistogramBucket>,
}

/// Shared flag that aborts an in-flight simulation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

pub fn simulate(
    inputs: &Inputs,
    rules: &BusinessRules,
    iterations: usize,
    seed: u64,
) -> Result<SimulationReport, SimulationError> {
    simulate_cancellable(inputs, rules, iterations, seed, &CancelToken::new())
}

/// Runs `iterations` perturbed 12-month projections in parallel. Iteration
/// `i` draws from its own generator seeded by `derive_seed(seed, i)`, so the
/// result does not depend on scheduling.
pub fn simulate_cancellable(
    inputs: &Inputs,
    rules: &BusinessRules,
    iterations: usize,
    seed: u64,
    cancel: &CancelToken,
) -> Result<SimulationReport, SimulationError> {
    inputs.validate()?;
    if iterations == 0 || iterations > MAX_ITERATIONS as usize {
        return Err(InputError::new(
            InputField::MonteCarloIterations,
            format!("must be between 1 and {MAX_ITERATIONS}"),
        )
        .into());
    }

    let model = ReducedModel::new(inputs, rules);
    let completed = AtomicUsize::new(0);
    let outcomes: Option<Vec<Outcome>> = (0..iterations)
        .into_par_iter()
        .map(|i| {
            if cancel.is_cancelled() {
                return None;
            }
            let outcome = model.run(seed, i as u64);
            completed.fetch_add(1, Ordering::Relaxed);
            Some(outcome)
        })
        .collect();

    let Some(outcomes) = outcomes else {
        return Err(SimulationError::Cancelled {
            completed: completed.load(Ordering::Relaxed),
            requested: iterations,
        });
    };

    let report = summarize(seed, outcomes);
    log::info!(
        "monte carlo: iterations={iterations} seed={seed} p50_net_profit={:.2} p_profit={:.3}",
        report.percentiles.net_profit.p50,
        report.probabilities.profit
    );
    Ok(report)
}

/// Parameters of the reduced projection: primary membership, corporate
/// contracts and a static specialty book, with no diagnostics and a fully
/// staffed cost base.
#[derive(Debug, Clone)]
struct ReducedModel {
    start_primary: f64,
    specialty_book: f64,
    start_contracts: f64,
    primary_intake: f64,
    intake_variance: f64,
    primary_price: f64,
    primary_price_variance: f64,
    specialty_price: f64,
    specialty_price_variance: f64,
    corporate_pepm: f64,
    corporate_price_variance: f64,
    employees_per_contract: f64,
    contract_intake: f64,
    corporate_start_month: u32,
    churn_min_pct: f64,
    churn_max_pct: f64,
    fixed_base: f64,
    fixed_buffer: f64,
    variable_cost_pct: f64,
    capital: f64,
}

struct Draw {
    intake: f64,
    primary_price: f64,
    specialty_price: f64,
    corporate_pepm: f64,
    annual_churn_pct: f64,
    fixed_cost: f64,
    variable_cost_pct: f64,
}

impl ReducedModel {
    fn new(inputs: &Inputs, rules: &BusinessRules) -> Self {
        let statics = formulas::evaluate_static(inputs, rules);
        let contract_intake = f64::from(inputs.corporate_contract_intake);
        let ramp_contract_months = LAUNCH_MONTH.saturating_sub(inputs.corporate_start_month);

        Self {
            start_primary: statics.get(Quantity::LaunchPrimaryCarryover),
            specialty_book: statics.get(Quantity::LaunchSpecialtyCarryover),
            start_contracts: contract_intake * f64::from(ramp_contract_months),
            primary_intake: f64::from(inputs.primary_intake),
            intake_variance: inputs.intake_variance_pct / 100.0,
            primary_price: inputs.primary_price,
            primary_price_variance: inputs.primary_price_variance,
            specialty_price: inputs.specialty_price,
            specialty_price_variance: inputs.specialty_price_variance,
            corporate_pepm: inputs.corporate_pepm,
            corporate_price_variance: inputs.corporate_price_variance,
            employees_per_contract: f64::from(inputs.corporate_employees_per_contract),
            contract_intake,
            corporate_start_month: inputs.corporate_start_month,
            churn_min_pct: inputs.churn_min_pct,
            churn_max_pct: inputs.churn_max_pct,
            fixed_base: inputs.fixed_overhead_monthly
                + inputs.marketing_monthly
                + statics.get(Quantity::FullStaffingMonthlyCost),
            fixed_buffer: inputs.fixed_cost_buffer_pct / 100.0,
            variable_cost_pct: inputs.variable_cost_pct,
            capital: statics.get(Quantity::TotalCapitalRaised),
        }
    }

    /// Draw order is fixed; changing it changes every seeded result.
    fn draw(&self, rng: &mut impl Rng) -> Draw {
        let intake = self.primary_intake
            * (1.0 + uniform(rng, -self.intake_variance, self.intake_variance));
        let primary_price = self.primary_price
            + uniform(rng, -self.primary_price_variance, self.primary_price_variance);
        let specialty_price = self.specialty_price
            + uniform(rng, -self.specialty_price_variance, self.specialty_price_variance);
        let corporate_pepm = self.corporate_pepm
            + uniform(rng, -self.corporate_price_variance, self.corporate_price_variance);
        let annual_churn_pct = uniform(rng, self.churn_min_pct, self.churn_max_pct);
        let fixed_cost =
            self.fixed_base * (1.0 + uniform(rng, -self.fixed_buffer, self.fixed_buffer));
        let variable_cost_pct = self.variable_cost_pct
            * (1.0 + uniform(rng, -VARIABLE_COST_VARIANCE, VARIABLE_COST_VARIANCE));

        Draw {
            intake: intake.max(0.0),
            primary_price: primary_price.max(0.0),
            specialty_price: specialty_price.max(0.0),
            corporate_pepm: corporate_pepm.max(0.0),
            annual_churn_pct,
            fixed_cost,
            variable_cost_pct,
        }
    }

    fn run(&self, seed: u64, iteration: u64) -> Outcome {
        let mut rng = ChaCha20Rng::seed_from_u64(derive_seed(seed, iteration));
        let draw = self.draw(&mut rng);

        let monthly_churn = draw.annual_churn_pct / 100.0 / 12.0;
        let intake = round_half_up(draw.intake);
        let mut primary = self.start_primary;
        let mut contracts = self.start_contracts;
        let mut revenue = 0.0;
        let mut costs = 0.0;

        for month in LAUNCH_MONTH..LAUNCH_MONTH + PROJECTION_MONTHS {
            let churned = round_half_up(primary * monthly_churn).min(primary);
            primary = (primary - churned + intake).max(0.0);
            if month >= self.corporate_start_month {
                contracts += self.contract_intake;
            }

            let month_revenue = primary * draw.primary_price
                + self.specialty_book * draw.specialty_price
                + contracts * self.employees_per_contract * draw.corporate_pepm;
            revenue += month_revenue;
            costs += draw.fixed_cost + month_revenue * draw.variable_cost_pct / 100.0;
        }

        let net_profit = revenue - costs;
        Outcome {
            net_profit,
            roi: ratio(net_profit, self.capital).map(|r| r * 100.0),
            final_member_count: (primary + self.specialty_book).round() as u32,
            revenue,
            costs,
        }
    }
}

/// Uniform draw on `[lo, hi)`; always consumes exactly one value from `rng`.
fn uniform(rng: &mut impl Rng, lo: f64, hi: f64) -> f64 {
    let u: f64 = rng.random();
    if hi <= lo { lo } else { lo + (hi - lo) * u }
}

fn derive_seed(base_seed: u64, iteration: u64) -> u64 {
    let mixed = base_seed ^ (iteration << 32) ^ iteration;
    splitmix64(mixed)
}

/// SplitMix64 finalizer: spreads nearby seeds across the whole `u64` range.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Nearest-rank percentile over an ascending slice:
/// `sorted[ceil(p * n / 100) - 1]`, clamped to the slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p * n as f64 / 100.0).ceil() as usize;
    sorted[rank.saturating_sub(1).min(n - 1)]
}

fn summarize(seed: u64, outcomes: Vec<Outcome>) -> SimulationReport {
    let n = outcomes.len() as f64;
    let profits: Vec<f64> = outcomes.iter().map(|o| o.net_profit).collect();
    let rois: Vec<f64> = outcomes.iter().filter_map(|o| o.roi).collect();

    let profitable = profits.iter().filter(|&&p| p > 0.0).count();
    let positive_roi = rois.iter().filter(|&&r| r > 0.0).count();
    let mean_net_profit = profits.iter().sum::<f64>() / n;
    let histogram = histogram(&profits, HISTOGRAM_BUCKETS);

    let percentiles = OutcomePercentiles {
        net_profit: Percentiles::of(profits).unwrap_or(Percentiles {
            p10: 0.0,
            p50: 0.0,
            p90: 0.0,
        }),
        roi: Percentiles::of(rois),
    };

    SimulationReport {
        seed,
        outcomes,
        mean_net_profit,
        percentiles,
        probabilities: Probabilities {
            profit: profitable as f64 / n,
            positive_roi: positive_roi as f64 / n,
        },
        histogram,
    }
}

/// Equal-width buckets spanning `[min, max]`; the maximum lands in the last
/// bucket. A zero-width range yields a single bucket.
pub fn histogram(values: &[f64], buckets: usize) -> Vec<HistogramBucket> {
    if values.is_empty() || buckets == 0 {
        return Vec::new();
    }
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let total = values.len() as f64;

    let buckets = if max > min { buckets } else { 1 };
    let width = (max - min) / buckets as f64;
    let mut counts = vec![0usize; buckets];
    for &value in values {
        let index = if width > 0.0 {
            (((value - min) / width).floor() as usize).min(buckets - 1)
        } else {
            0
        };
        counts[index] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistogramBucket {
            lower: min + width * i as f64,
            upper: if i + 1 == buckets {
                max
            } else {
                min + width * (i + 1) as f64
            },
            count,
            probability: count as f64 / total,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn without_variance(mut inputs: Inputs) -> Inputs {
        inputs.intake_variance_pct = 0.0;
        inputs.primary_price_variance = 0.0;
        inputs.specialty_price_variance = 0.0;
        inputs.corporate_price_variance = 0.0;
        inputs.churn_min_pct = inputs.annual_churn_pct;
        inputs.churn_max_pct = inputs.annual_churn_pct;
        inputs.fixed_cost_buffer_pct = 0.0;
        inputs.variable_cost_pct = 0.0;
        inputs
    }

    #[test]
    fn percentile_uses_nearest_rank() {
        let values: Vec<f64> = (1..=10).map(|v| f64::from(v) * 10.0).collect();
        assert_eq!(percentile(&values, 10.0), 10.0);
        assert_eq!(percentile(&values, 50.0), 50.0);
        assert_eq!(percentile(&values, 90.0), 90.0);
        assert_eq!(percentile(&values, 0.0), 10.0);
        assert_eq!(percentile(&values, 100.0), 100.0);
        assert_eq!(percentile(&[7.0], 50.0), 7.0);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn same_seed_reproduces_identical_outcomes() {
        let inputs = Inputs::default();
        let first = simulate(&inputs, &rules(), 10_000, 42).unwrap();
        let second = simulate(&inputs, &rules(), 10_000, 42).unwrap();
        assert_eq!(first.outcomes.len(), 10_000);
        assert!(first
            .outcomes
            .iter()
            .zip(&second.outcomes)
            .all(|(a, b)| a.net_profit.to_bits() == b.net_profit.to_bits()));
        assert_eq!(first, second);

        let other = simulate(&inputs, &rules(), 10_000, 43).unwrap();
        assert_ne!(first.outcomes, other.outcomes);
    }

    #[test]
    fn parallel_run_matches_sequential_iteration_order() {
        let inputs = Inputs::default();
        let report = simulate(&inputs, &rules(), 257, 9).unwrap();
        let model = ReducedModel::new(&inputs, &rules());
        for (i, outcome) in report.outcomes.iter().enumerate() {
            assert_eq!(*outcome, model.run(9, i as u64));
        }
    }

    #[test]
    fn median_estimates_tighten_with_more_iterations() {
        let inputs = Inputs::default();
        let gap = |iterations: usize| -> f64 {
            (0..8u64)
                .map(|k| {
                    let a = simulate(&inputs, &rules(), iterations, 1_000 + k).unwrap();
                    let b = simulate(&inputs, &rules(), iterations, 2_000 + k).unwrap();
                    (a.percentiles.net_profit.p50 - b.percentiles.net_profit.p50).abs()
                })
                .sum::<f64>()
                / 8.0
        };
        assert!(gap(4_000) < gap(100));
    }

    #[test]
    fn zero_variance_collapses_the_distribution() {
        let inputs = without_variance(Inputs::default());
        let report = simulate(&inputs, &rules(), 64, 5).unwrap();
        let first = report.outcomes[0];
        assert!(report.outcomes.iter().all(|o| *o == first));

        let p = report.percentiles.net_profit;
        assert_eq!(p.p10, p.p50);
        assert_eq!(p.p50, p.p90);
        assert_eq!(report.histogram.len(), 1);
        assert_eq!(report.histogram[0].count, 64);
        assert_approx(report.histogram[0].probability, 1.0);
    }

    #[test]
    fn reduced_model_matches_hand_computation_without_variance() {
        let mut inputs = without_variance(Inputs::default());
        inputs.annual_churn_pct = 0.0;
        inputs.churn_min_pct = 0.0;
        inputs.churn_max_pct = 0.0;
        let outcome = simulate(&inputs, &rules(), 1, 0).unwrap().outcomes[0];

        // 150 carried over plus 25 a month; 40 specialty; one contract a month from launch.
        let mut revenue = 0.0;
        for k in 1..=12 {
            let primary = 150.0 + 25.0 * f64::from(k);
            revenue += primary * 175.0 + 40.0 * 450.0 + f64::from(k) * 20.0 * 50.0;
        }
        let fixed = 18_000.0 + 4_000.0
            + formulas::evaluate_static(&inputs, &rules()).get(Quantity::FullStaffingMonthlyCost);
        assert_approx(outcome.revenue, revenue);
        assert_approx(outcome.costs, fixed * 12.0);
        assert_approx(outcome.net_profit, revenue - fixed * 12.0);
        assert_eq!(outcome.final_member_count, 150 + 300 + 40);
        assert_approx(outcome.roi.unwrap(), (revenue - fixed * 12.0) / 600_000.0 * 100.0);
    }

    #[test]
    fn roi_is_not_applicable_without_capital() {
        let mut inputs = Inputs::default();
        inputs.has_founding_physician = false;
        inputs.additional_physicians = 0;
        let report = simulate(&inputs, &rules(), 50, 1).unwrap();
        assert!(report.outcomes.iter().all(|o| o.roi.is_none()));
        assert_eq!(report.percentiles.roi, None);
        assert_eq!(report.probabilities.positive_roi, 0.0);
    }

    #[test]
    fn cancelled_run_returns_no_partial_result() {
        let token = CancelToken::new();
        token.cancel();
        let err = simulate_cancellable(&Inputs::default(), &rules(), 1_000, 42, &token)
            .expect_err("cancelled run must fail");
        assert_eq!(
            err,
            SimulationError::Cancelled {
                completed: 0,
                requested: 1_000
            }
        );
    }

    #[test]
    fn invalid_inputs_are_rejected_before_sampling() {
        let mut inputs = Inputs::default();
        inputs.churn_min_pct = 30.0;
        inputs.churn_max_pct = 10.0;
        let err = simulate(&inputs, &rules(), 10, 1).expect_err("inverted churn band");
        assert!(matches!(err, SimulationError::InvalidInputs(_)));

        let err = simulate(&Inputs::default(), &rules(), 0, 1).expect_err("zero iterations");
        assert!(matches!(err, SimulationError::InvalidInputs(e) if e.field == "monte_carlo_iterations"));

        let oversized = MAX_ITERATIONS as usize + 1;
        let err = simulate(&Inputs::default(), &rules(), oversized, 1).expect_err("oversized run");
        assert!(matches!(err, SimulationError::InvalidInputs(e) if e.field == "monte_carlo_iterations"));
    }

    #[test]
    fn histogram_places_extremes_in_first_and_last_bucket() {
        let values: Vec<f64> = (0..=30).map(f64::from).collect();
        let buckets = histogram(&values, 30);
        assert_eq!(buckets.len(), 30);
        assert_eq!(buckets[0].lower, 0.0);
        assert_eq!(buckets[29].upper, 30.0);
        assert_eq!(buckets[0].count, 1);
        assert_eq!(buckets[29].count, 2);
        assert_eq!(buckets.iter().map(|b| b.count).sum::<usize>(), 31);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_report_is_internally_consistent(
            seed in proptest::prelude::any::<u64>(),
            iterations in 1usize..300,
            intake_variance in 0u32..=100,
            churn_lo in 0u32..=50,
            churn_span in 0u32..=50,
        ) {
            let mut inputs = Inputs::default();
            inputs.intake_variance_pct = f64::from(intake_variance);
            inputs.churn_min_pct = f64::from(churn_lo);
            inputs.churn_max_pct = f64::from(churn_lo + churn_span);

            let report = simulate(&inputs, &rules(), iterations, seed).unwrap();
            prop_assert_eq!(report.outcomes.len(), iterations);

            let p = report.percentiles.net_profit;
            prop_assert!(p.p10 <= p.p50 && p.p50 <= p.p90);
            prop_assert!((0.0..=1.0).contains(&report.probabilities.profit));

            let counted: usize = report.histogram.iter().map(|b| b.count).sum();
            prop_assert_eq!(counted, iterations);
            let mass: f64 = report.histogram.iter().map(|b| b.probability).sum();
            prop_assert!((mass - 1.0).abs() < 1e-9);

            for outcome in &report.outcomes {
                prop_assert!(outcome.net_profit.is_finite());
                prop_assert!((outcome.net_profit - (outcome.revenue - outcome.costs)).abs() < 1e-6);
            }
        }
    }
}
