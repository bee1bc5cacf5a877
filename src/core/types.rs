use serde::{Deserialize, Serialize};

use super::error::InputError;

/// First month of the steady-state projection; months before it are ramp.
pub const LAUNCH_MONTH: u32 = 7;
pub const PROJECTION_MONTHS: u32 = 12;
/// Last month index produced by the engine.
pub const FINAL_MONTH: u32 = LAUNCH_MONTH + PROJECTION_MONTHS - 1;

/// Largest accepted Monte Carlo run; each iteration keeps its outcome.
pub const MAX_ITERATIONS: u32 = 1_000_000;
pub const MAX_INTAKE_GROWTH_PCT: f64 = 100.0;
/// Ceiling on any member or contract stock the inputs can produce.
pub const MAX_MEMBERS: f64 = 10_000_000.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InputGroup {
    Physicians,
    Pricing,
    Growth,
    Diagnostics,
    Costs,
    Staffing,
    Risk,
}

impl InputGroup {
    pub fn key(self) -> &'static str {
        match self {
            InputGroup::Physicians => "physicians",
            InputGroup::Pricing => "pricing",
            InputGroup::Growth => "growth",
            InputGroup::Diagnostics => "diagnostics",
            InputGroup::Costs => "costs",
            InputGroup::Staffing => "staffing",
            InputGroup::Risk => "risk",
        }
    }
}

trait InputValue {
    fn as_f64(&self) -> f64;
}

impl InputValue for f64 {
    fn as_f64(&self) -> f64 {
        *self
    }
}

impl InputValue for u32 {
    fn as_f64(&self) -> f64 {
        f64::from(*self)
    }
}

impl InputValue for bool {
    fn as_f64(&self) -> f64 {
        if *self { 1.0 } else { 0.0 }
    }
}

macro_rules! input_schema {
    ($( $variant:ident => $field:ident : $ty:ty = $default:expr, $group:ident, $label:literal; )+) => {
        /// The full set of business assumptions consumed by the engine.
        ///
        /// Percent fields hold percents (`12.0` means 12%); month fields are
        /// absolute month indices. Absent fields deserialize to their defaults.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(default, rename_all = "camelCase")]
        pub struct Inputs {
            $( pub $field: $ty, )+
        }

        impl Default for Inputs {
            fn default() -> Self {
                Self {
                    $( $field: $default, )+
                }
            }
        }

        /// Identifier for every field of [`Inputs`].
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub enum InputField {
            $( $variant, )+
        }

        impl InputField {
            pub const ALL: &'static [InputField] = &[ $( InputField::$variant, )+ ];

            pub fn key(self) -> &'static str {
                match self {
                    $( InputField::$variant => stringify!($field), )+
                }
            }

            pub fn label(self) -> &'static str {
                match self {
                    $( InputField::$variant => $label, )+
                }
            }

            pub fn group(self) -> InputGroup {
                match self {
                    $( InputField::$variant => InputGroup::$group, )+
                }
            }

            pub fn from_key(key: &str) -> Option<InputField> {
                match key {
                    $( stringify!($field) => Some(InputField::$variant), )+
                    _ => None,
                }
            }
        }

        impl Inputs {
            /// Numeric view of any field; booleans read as 1.0 / 0.0.
            pub fn value(&self, field: InputField) -> f64 {
                match field {
                    $( InputField::$variant => self.$field.as_f64(), )+
                }
            }
        }
    };
}

input_schema! {
    HasFoundingPhysician => has_founding_physician: bool = true, Physicians, "Founding physician participates";
    AdditionalPhysicians => additional_physicians: u32 = 0, Physicians, "Additional physicians";
    FoundingPrimaryCarryover => founding_primary_carryover: u32 = 150, Physicians, "Founding physician primary carryover members";
    FoundingSpecialtyCarryover => founding_specialty_carryover: u32 = 40, Physicians, "Founding physician specialty carryover members";
    AdditionalPrimaryCarryoverAvg => additional_primary_carryover_avg: u32 = 100, Physicians, "Average primary carryover per additional physician";
    AdditionalSpecialtyCarryoverAvg => additional_specialty_carryover_avg: u32 = 25, Physicians, "Average specialty carryover per additional physician";

    PrimaryPrice => primary_price: f64 = 175.0, Pricing, "Primary membership price per month";
    SpecialtyPrice => specialty_price: f64 = 450.0, Pricing, "Specialty membership price per month";
    CorporatePepm => corporate_pepm: f64 = 50.0, Pricing, "Corporate price per employee per month";
    CorporateEmployeesPerContract => corporate_employees_per_contract: u32 = 20, Pricing, "Employees covered per corporate contract";

    RampPrimaryIntake => ramp_primary_intake: u32 = 5, Growth, "Primary members joining per ramp month";
    PrimaryIntake => primary_intake: u32 = 25, Growth, "Primary members joining per projection month";
    SpecialtyIntake => specialty_intake: u32 = 4, Growth, "Specialty members joining per projection month";
    CorporateContractIntake => corporate_contract_intake: u32 = 1, Growth, "Corporate contracts signed per month";
    CorporateStartMonth => corporate_start_month: u32 = 7, Growth, "Month corporate contracting starts";
    IntakeGrowthPct => intake_growth_pct: f64 = 0.0, Growth, "Monthly growth of primary intake %";
    AnnualChurnPct => annual_churn_pct: f64 = 12.0, Growth, "Annual primary churn %";
    SpecialtyConversionPct => specialty_conversion_pct: f64 = 2.0, Growth, "Monthly primary to specialty conversion %";
    LtvAssumedAnnualChurnPct => ltv_assumed_annual_churn_pct: f64 = 15.0, Growth, "Annual churn % assumed for lifetime value";

    DiagnosticsActive => diagnostics_active: bool = true, Diagnostics, "Diagnostics services offered";
    EchoStartMonth => echo_start_month: u32 = 9, Diagnostics, "Echocardiography start month";
    EchoMonthlyVolume => echo_monthly_volume: u32 = 40, Diagnostics, "Echo studies per month";
    EchoPrice => echo_price: f64 = 250.0, Diagnostics, "Price per echo study";
    EchoLeaseMonthly => echo_lease_monthly: f64 = 2_500.0, Diagnostics, "Echo equipment lease per month";
    CtStartMonth => ct_start_month: u32 = 12, Diagnostics, "CT start month";
    CtMonthlyVolume => ct_monthly_volume: u32 = 30, Diagnostics, "CT scans per month";
    CtPrice => ct_price: f64 = 400.0, Diagnostics, "Price per CT scan";
    CtLeaseMonthly => ct_lease_monthly: f64 = 9_000.0, Diagnostics, "CT equipment lease per month";
    LabsStartMonth => labs_start_month: u32 = 7, Diagnostics, "Lab services start month";
    LabsMonthlyVolume => labs_monthly_volume: u32 = 120, Diagnostics, "Lab panels per month";
    LabsPrice => labs_price: f64 = 40.0, Diagnostics, "Price per lab panel";
    DiagnosticsMarginPct => diagnostics_margin_pct: f64 = 60.0, Diagnostics, "Diagnostics gross margin %";

    FixedOverheadMonthly => fixed_overhead_monthly: f64 = 18_000.0, Costs, "Fixed overhead per month";
    MarketingMonthly => marketing_monthly: f64 = 4_000.0, Costs, "Marketing spend per month";
    VariableCostPct => variable_cost_pct: f64 = 8.0, Costs, "Variable cost % of revenue";
    InflationPct => inflation_pct: f64 = 3.0, Costs, "Annual cost inflation %";
    CapexMonth => capex_month: u32 = 0, Costs, "Month capital expenditure is paid";
    BuildoutCapex => buildout_capex: f64 = 250_000.0, Costs, "Clinic buildout";
    EquipmentCapex => equipment_capex: f64 = 150_000.0, Costs, "Medical equipment purchase";
    ItCapex => it_capex: f64 = 40_000.0, Costs, "IT hardware";
    FurnitureCapex => furniture_capex: f64 = 25_000.0, Costs, "Furniture and fixtures";
    LegalStartup => legal_startup: f64 = 15_000.0, Costs, "Legal and entity formation";
    LicensingStartup => licensing_startup: f64 = 5_000.0, Costs, "Licensing and credentialing";
    ItSetupStartup => it_setup_startup: f64 = 12_000.0, Costs, "EHR and IT setup";
    RecruitingStartup => recruiting_startup: f64 = 10_000.0, Costs, "Recruiting";
    LaunchMarketingStartup => launch_marketing_startup: f64 = 20_000.0, Costs, "Launch marketing campaign";
    OtherStartup => other_startup: f64 = 8_000.0, Costs, "Other startup costs";
    SplitStartupCosts => split_startup_costs: bool = false, Costs, "Split startup costs across months 0 and 1";
    WorkingCapitalReserve => working_capital_reserve: f64 = 50_000.0, Costs, "Working capital reserve";
    EquityBuyout => equity_buyout: f64 = 0.0, Costs, "Equity buyout";

    PracticeManagerSalary => practice_manager_salary: f64 = 85_000.0, Staffing, "Practice manager annual salary";
    PracticeManagerStartMonth => practice_manager_start_month: u32 = 2, Staffing, "Practice manager start month";
    NursePractitionerSalary => nurse_practitioner_salary: f64 = 120_000.0, Staffing, "Nurse practitioner annual salary";
    NursePractitionerStartMonth => nurse_practitioner_start_month: u32 = 6, Staffing, "Nurse practitioner start month";
    MedicalAssistantHourly => medical_assistant_hourly: f64 = 20.0, Staffing, "Medical assistant hourly rate";
    MedicalAssistantWeeklyHours => medical_assistant_weekly_hours: f64 = 40.0, Staffing, "Medical assistant weekly hours";
    MedicalAssistantStartMonth => medical_assistant_start_month: u32 = 5, Staffing, "Medical assistant start month";
    FrontDeskHourly => front_desk_hourly: f64 = 18.0, Staffing, "Front desk hourly rate";
    FrontDeskWeeklyHours => front_desk_weekly_hours: f64 = 40.0, Staffing, "Front desk weekly hours";
    FrontDeskStartMonth => front_desk_start_month: u32 = 5, Staffing, "Front desk start month";
    CareCoordinatorHourly => care_coordinator_hourly: f64 = 24.0, Staffing, "Care coordinator hourly rate";
    CareCoordinatorWeeklyHours => care_coordinator_weekly_hours: f64 = 30.0, Staffing, "Care coordinator weekly hours";
    CareCoordinatorStartMonth => care_coordinator_start_month: u32 = 7, Staffing, "Care coordinator start month";
    SonographerHourly => sonographer_hourly: f64 = 40.0, Staffing, "Sonographer hourly rate";
    SonographerWeeklyHours => sonographer_weekly_hours: f64 = 20.0, Staffing, "Sonographer weekly hours";
    SonographerStartMonth => sonographer_start_month: u32 = 9, Staffing, "Sonographer start month";
    CtTechnologistHourly => ct_technologist_hourly: f64 = 45.0, Staffing, "CT technologist hourly rate";
    CtTechnologistWeeklyHours => ct_technologist_weekly_hours: f64 = 20.0, Staffing, "CT technologist weekly hours";
    CtTechnologistStartMonth => ct_technologist_start_month: u32 = 12, Staffing, "CT technologist start month";
    BenefitsLoadPct => benefits_load_pct: f64 = 20.0, Staffing, "Payroll tax and benefits load %";

    IntakeVariancePct => intake_variance_pct: f64 = 20.0, Risk, "Primary intake variance +/- %";
    PrimaryPriceVariance => primary_price_variance: f64 = 15.0, Risk, "Primary price variance +/- $";
    SpecialtyPriceVariance => specialty_price_variance: f64 = 50.0, Risk, "Specialty price variance +/- $";
    CorporatePriceVariance => corporate_price_variance: f64 = 5.0, Risk, "Corporate PEPM variance +/- $";
    ChurnMinPct => churn_min_pct: f64 = 8.0, Risk, "Lowest annual churn % sampled";
    ChurnMaxPct => churn_max_pct: f64 = 20.0, Risk, "Highest annual churn % sampled";
    FixedCostBufferPct => fixed_cost_buffer_pct: f64 = 10.0, Risk, "Fixed cost variance +/- %";
    MonteCarloIterations => monte_carlo_iterations: u32 = 10_000, Risk, "Monte Carlo iterations";
    RandomSeed => random_seed: u64 = 42, Risk, "Random seed";
}

impl InputValue for u64 {
    fn as_f64(&self) -> f64 {
        *self as f64
    }
}

impl Inputs {
    /// Boundary check run before anything reaches the engine.
    pub fn validate(&self) -> Result<(), InputError> {
        for &field in InputField::ALL {
            let value = self.value(field);
            if !value.is_finite() {
                return Err(InputError::new(field, "must be a finite number"));
            }
            if value < 0.0 && field != InputField::IntakeGrowthPct {
                return Err(InputError::new(field, "must be >= 0"));
            }
        }

        for field in [
            InputField::AnnualChurnPct,
            InputField::SpecialtyConversionPct,
            InputField::LtvAssumedAnnualChurnPct,
            InputField::DiagnosticsMarginPct,
            InputField::VariableCostPct,
            InputField::ChurnMinPct,
            InputField::ChurnMaxPct,
            InputField::FixedCostBufferPct,
            InputField::IntakeVariancePct,
        ] {
            if self.value(field) > 100.0 {
                return Err(InputError::new(field, "must be between 0 and 100"));
            }
        }

        if self.intake_growth_pct <= -100.0 || self.intake_growth_pct > MAX_INTAKE_GROWTH_PCT {
            return Err(InputError::new(
                InputField::IntakeGrowthPct,
                format!("must be > -100 and <= {MAX_INTAKE_GROWTH_PCT}"),
            ));
        }

        if self.churn_min_pct > self.churn_max_pct {
            return Err(InputError::new(
                InputField::ChurnMinPct,
                "must not exceed churn_max_pct",
            ));
        }

        for &field in InputField::ALL {
            if field.is_start_month() && self.value(field) > f64::from(FINAL_MONTH) {
                return Err(InputError::new(
                    field,
                    format!("must be between 0 and {FINAL_MONTH}"),
                ));
            }
        }

        if self.monte_carlo_iterations == 0 || self.monte_carlo_iterations > MAX_ITERATIONS {
            return Err(InputError::new(
                InputField::MonteCarloIterations,
                format!("must be between 1 and {MAX_ITERATIONS}"),
            ));
        }

        self.check_member_ceiling()
    }

    /// Bounds every stock the month loop can reach, so member counts fit the
    /// records' integer fields and agree with the revenue billed on them.
    fn check_member_ceiling(&self) -> Result<(), InputError> {
        let months = f64::from(PROJECTION_MONTHS);
        let peak_growth = (1.0 + self.intake_growth_pct.max(0.0) / 100.0)
            .powi(PROJECTION_MONTHS as i32 - 1);
        let founding = if self.has_founding_physician { 1.0 } else { 0.0 };
        let additional = f64::from(self.additional_physicians);

        let primary = f64::from(self.ramp_primary_intake) * f64::from(LAUNCH_MONTH)
            + founding * f64::from(self.founding_primary_carryover)
            + additional * f64::from(self.additional_primary_carryover_avg)
            + months * (f64::from(self.primary_intake) * peak_growth + 1.0);
        let specialty = primary
            + founding * f64::from(self.founding_specialty_carryover)
            + additional * f64::from(self.additional_specialty_carryover_avg)
            + months * f64::from(self.specialty_intake);
        let contracts = f64::from(self.corporate_contract_intake) * f64::from(FINAL_MONTH + 1);

        for (field, stock) in [
            (InputField::PrimaryIntake, primary),
            (InputField::SpecialtyIntake, specialty),
            (InputField::CorporateContractIntake, contracts),
        ] {
            if stock > MAX_MEMBERS {
                return Err(InputError::new(
                    field,
                    format!("projected stock of {stock:.0} exceeds {MAX_MEMBERS:.0}"),
                ));
            }
        }
        Ok(())
    }
}

impl InputField {
    pub fn is_start_month(self) -> bool {
        self.key().ends_with("_month")
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Ramp,
    Projection,
}

impl Phase {
    pub fn of_month(month: u32) -> Self {
        if month < LAUNCH_MONTH {
            Phase::Ramp
        } else {
            Phase::Projection
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberCounts {
    pub primary_active: u32,
    pub specialty_active: u32,
    pub corporate_contracts: u32,
    pub primary_new: u32,
    pub primary_churned: u32,
    pub specialty_converted: u32,
    pub specialty_new: u32,
    pub corporate_new: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevenueBreakdown {
    pub primary: f64,
    pub specialty: f64,
    pub corporate: f64,
    pub echo: f64,
    pub ct: f64,
    pub labs: f64,
    pub total: f64,
}

impl RevenueBreakdown {
    pub fn component_sum(&self) -> f64 {
        self.primary + self.specialty + self.corporate + self.echo + self.ct + self.labs
    }

    pub fn diagnostics(&self) -> f64 {
        self.echo + self.ct + self.labs
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub salaries: f64,
    pub fixed_overhead: f64,
    pub marketing: f64,
    pub variable: f64,
    pub equipment_lease: f64,
    pub startup: f64,
    pub diagnostics_cogs: f64,
    pub total: f64,
}

impl CostBreakdown {
    pub fn component_sum(&self) -> f64 {
        self.salaries
            + self.fixed_overhead
            + self.marketing
            + self.variable
            + self.equipment_lease
            + self.startup
            + self.diagnostics_cogs
    }
}

/// One simulated month. Produced in month order and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthlyRecord {
    pub month: u32,
    pub phase: Phase,
    pub members: MemberCounts,
    pub revenue: RevenueBreakdown,
    pub costs: CostBreakdown,
    pub capital_injected: f64,
    pub capex_outlay: f64,
    pub profit: f64,
    pub cumulative_cash: f64,
}

/// Stock carried from the end of the ramp into the first projection month.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchState {
    pub month: u32,
    pub ramp_primary_members: u32,
    pub primary_carryover_added: u32,
    pub specialty_carryover_added: u32,
    pub primary_members: u32,
    pub specialty_members: u32,
    pub corporate_contracts: u32,
    pub cumulative_cash: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitEconomics {
    pub revenue_per_member: Option<f64>,
    pub lifetime_months: Option<f64>,
    pub ltv: Option<f64>,
    pub cac: Option<f64>,
    pub ltv_to_cac: Option<f64>,
    pub healthy: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentCategory {
    Buildout,
    Equipment,
    Startup,
    WorkingCapital,
    EquityBuyout,
    Reserve,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentLine {
    pub category: DeploymentCategory,
    pub amount: f64,
    pub pct_of_total: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapitalDeployment {
    pub total_raised: f64,
    pub lines: Vec<DeploymentLine>,
    pub overcommitted: bool,
}

impl CapitalDeployment {
    pub fn amount(&self, category: DeploymentCategory) -> f64 {
        self.lines
            .iter()
            .find(|line| line.category == category)
            .map(|line| line.amount)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CashTrough {
    pub month: u32,
    pub cumulative_cash: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiBundle {
    pub breakeven_month: Option<u32>,
    pub months_to_breakeven: Option<u32>,
    pub total_capital_raised: f64,
    pub individual_investment: f64,
    pub projection_revenue: f64,
    pub projection_costs: f64,
    pub projection_profit: f64,
    pub ending_cash: f64,
    pub cash_trough: Option<CashTrough>,
    pub mso_roi: Option<f64>,
    pub physician_annual_income: Option<f64>,
    pub physician_roi: Option<f64>,
    pub payback_months: Option<f64>,
    pub unit_economics: UnitEconomics,
    pub capital_deployment: CapitalDeployment,
}

/// Everything the engine hands to the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionResult {
    pub ramp_period: Vec<MonthlyRecord>,
    pub launch_state: LaunchState,
    pub projection: Vec<MonthlyRecord>,
    pub kpis: KpiBundle,
}

impl ProjectionResult {
    /// Ramp then projection records, in month order.
    pub fn records(&self) -> impl Iterator<Item = &MonthlyRecord> {
        self.ramp_period.iter().chain(self.projection.iter())
    }
}
