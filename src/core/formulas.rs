//! Every derived quantity of the model, defined once.
//!
//! Each [`Quantity`] carries its metadata (id, label, node kind, scope,
//! human-readable formula text) and an evaluation function. The engine
//! executes these functions month by month and the dependency graph is
//! built by tracing which inputs and quantities each function reads, so the
//! graph cannot describe something the engine does not compute.
//!
//! Evaluation functions read every dependency before branching on a gate,
//! which keeps the traced read set independent of input values.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::sync::OnceLock;

use super::graph::NodeKind;
use super::rules::{BusinessRules, RuleField};
use super::types::{InputField, Inputs, LAUNCH_MONTH, MonthlyRecord, Phase};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Scope {
    /// Depends on inputs only; evaluated once.
    Static,
    /// Evaluated for every simulated month.
    Monthly,
    /// Evaluated once over the finished monthly series.
    Summary,
}

#[derive(Copy, Clone, Debug)]
pub struct Definition {
    pub id: &'static str,
    pub label: &'static str,
    pub kind: NodeKind,
    pub category: &'static str,
    pub scope: Scope,
    pub text: &'static str,
}

macro_rules! quantities {
    ($( $variant:ident => $id:literal, $scope:ident, $kind:ident, $category:literal, $label:literal, $text:literal; )+) => {
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
        pub enum Quantity {
            $( $variant, )+
        }

        impl Quantity {
            /// Declaration order, which is also a valid evaluation order.
            pub const ALL: &'static [Quantity] = &[ $( Quantity::$variant, )+ ];
            pub const COUNT: usize = Self::ALL.len();

            pub fn definition(self) -> Definition {
                match self {
                    $( Quantity::$variant => Definition {
                        id: $id,
                        label: $label,
                        kind: NodeKind::$kind,
                        category: $category,
                        scope: Scope::$scope,
                        text: $text,
                    }, )+
                }
            }
        }
    };
}

quantities! {
    PhysicianCount => "physician_count", Static, Derived, "physicians", "Physician count",
        "has_founding_physician + additional_physicians";
    TotalCapitalRaised => "total_capital_raised", Static, Derived, "capital", "Total capital raised",
        "has_founding_physician * founding_capital_contribution + additional_physicians * additional_capital_contribution";
    IndividualInvestment => "individual_investment", Static, Derived, "capital", "Individual physician investment",
        "if has_founding_physician then founding_capital_contribution else additional_capital_contribution";
    IndividualFeePct => "individual_fee_pct", Static, Derived, "physicians", "Individual MSO fee %",
        "if has_founding_physician then founding_mso_fee_pct else additional_mso_fee_pct";
    IndividualEquityPct => "individual_equity_pct", Static, Derived, "physicians", "Individual equity %",
        "if has_founding_physician then founding_equity_pct else additional_equity_pct";
    MonthlyChurnRate => "monthly_churn_rate", Static, Derived, "membership", "Monthly churn rate",
        "annual_churn_pct / 100 / 12";
    ConversionRate => "conversion_rate", Static, Derived, "membership", "Monthly conversion rate",
        "specialty_conversion_pct / 100";
    BenefitsMultiplier => "benefits_multiplier", Static, Derived, "staffing", "Benefits multiplier",
        "1 + benefits_load_pct / 100";
    PracticeManagerMonthlyCost => "practice_manager_monthly_cost", Static, Derived, "staffing", "Practice manager monthly cost",
        "practice_manager_salary / 12 * benefits_multiplier";
    NursePractitionerMonthlyCost => "nurse_practitioner_monthly_cost", Static, Derived, "staffing", "Nurse practitioner monthly cost",
        "nurse_practitioner_salary / 12 * benefits_multiplier";
    MedicalAssistantMonthlyCost => "medical_assistant_monthly_cost", Static, Derived, "staffing", "Medical assistant monthly cost",
        "medical_assistant_hourly * medical_assistant_weekly_hours * 52 / 12 * benefits_multiplier";
    FrontDeskMonthlyCost => "front_desk_monthly_cost", Static, Derived, "staffing", "Front desk monthly cost",
        "front_desk_hourly * front_desk_weekly_hours * 52 / 12 * benefits_multiplier";
    CareCoordinatorMonthlyCost => "care_coordinator_monthly_cost", Static, Derived, "staffing", "Care coordinator monthly cost",
        "care_coordinator_hourly * care_coordinator_weekly_hours * 52 / 12 * benefits_multiplier";
    SonographerMonthlyCost => "sonographer_monthly_cost", Static, Derived, "staffing", "Sonographer monthly cost",
        "sonographer_hourly * sonographer_weekly_hours * 52 / 12 * benefits_multiplier";
    CtTechnologistMonthlyCost => "ct_technologist_monthly_cost", Static, Derived, "staffing", "CT technologist monthly cost",
        "ct_technologist_hourly * ct_technologist_weekly_hours * 52 / 12 * benefits_multiplier";
    FullStaffingMonthlyCost => "full_staffing_monthly_cost", Static, Derived, "staffing", "Fully staffed monthly payroll",
        "practice_manager_monthly_cost + nurse_practitioner_monthly_cost + medical_assistant_monthly_cost + front_desk_monthly_cost + care_coordinator_monthly_cost + sonographer_monthly_cost + ct_technologist_monthly_cost";
    StartupTotal => "startup_total", Static, Derived, "capital", "Total startup costs",
        "legal_startup + licensing_startup + it_setup_startup + recruiting_startup + launch_marketing_startup + other_startup";
    CapexTotal => "capex_total", Static, Derived, "capital", "Total capital expenditure",
        "buildout_capex + equipment_capex + it_capex + furniture_capex";
    CapitalOutlayTotal => "capital_outlay_total", Static, Derived, "capital", "Capital outlay incl. equity buyout",
        "capex_total + equity_buyout";
    LaunchPrimaryCarryover => "launch_primary_carryover", Static, Derived, "membership", "Primary carryover added at launch",
        "has_founding_physician * founding_primary_carryover + additional_physicians * additional_primary_carryover_avg";
    LaunchSpecialtyCarryover => "launch_specialty_carryover", Static, Derived, "membership", "Specialty carryover added at launch",
        "has_founding_physician * founding_specialty_carryover + additional_physicians * additional_specialty_carryover_avg";
    CorporateContractValue => "corporate_contract_value", Static, Derived, "revenue", "Monthly value of one corporate contract",
        "corporate_employees_per_contract * corporate_pepm";
    DiagnosticsCogsRate => "diagnostics_cogs_rate", Static, Derived, "costs", "Diagnostics COGS share of revenue",
        "1 - diagnostics_margin_pct / 100";
    DeploymentEquipment => "deployment_equipment", Static, Derived, "deployment", "Equipment, IT and furniture",
        "equipment_capex + it_capex + furniture_capex";
    DeploymentReserve => "deployment_reserve", Static, Derived, "deployment", "Remaining capital reserve",
        "total_capital_raised - buildout_capex - deployment_equipment - startup_total - working_capital_reserve - equity_buyout";

    InflationFactor => "inflation_factor", Monthly, Calculation, "costs", "Cost inflation factor",
        "pow(1 + inflation_pct / 100, floor(month / 12))";
    PrimaryNew => "primary_new", Monthly, Calculation, "membership", "New primary members",
        "if month < launch_month then ramp_primary_intake else round(primary_intake * pow(1 + intake_growth_pct / 100, month - launch_month))";
    PrimaryChurned => "primary_churned", Monthly, Calculation, "membership", "Churned primary members",
        "if month < launch_month then 0 else min(round(prev(primary_active) * monthly_churn_rate), prev(primary_active))";
    SpecialtyConverted => "specialty_converted", Monthly, Calculation, "membership", "Primary members converted to specialty",
        "if month < launch_month then 0 else min(round((prev(primary_active) - primary_churned) * conversion_rate), prev(primary_active) - primary_churned)";
    PrimaryActive => "primary_active", Monthly, Calculation, "membership", "Active primary members",
        "max(prev(primary_active) + primary_new - primary_churned - specialty_converted, 0)";
    SpecialtyNew => "specialty_new", Monthly, Calculation, "membership", "New specialty members",
        "if month < launch_month then 0 else specialty_intake";
    SpecialtyActive => "specialty_active", Monthly, Calculation, "membership", "Active specialty members",
        "prev(specialty_active) + specialty_converted + specialty_new";
    CorporateNew => "corporate_new", Monthly, Calculation, "membership", "New corporate contracts",
        "if month >= corporate_start_month then corporate_contract_intake else 0";
    CorporateContracts => "corporate_contracts", Monthly, Calculation, "membership", "Active corporate contracts",
        "prev(corporate_contracts) + corporate_new";
    PrimaryRevenue => "primary_revenue", Monthly, Calculation, "revenue", "Primary membership revenue",
        "primary_active * primary_price";
    SpecialtyRevenue => "specialty_revenue", Monthly, Calculation, "revenue", "Specialty membership revenue",
        "specialty_active * specialty_price";
    CorporateRevenue => "corporate_revenue", Monthly, Calculation, "revenue", "Corporate contract revenue",
        "corporate_contracts * corporate_contract_value";
    EchoRevenue => "echo_revenue", Monthly, Calculation, "revenue", "Echocardiography revenue",
        "if diagnostics_active and month >= echo_start_month then echo_monthly_volume * echo_price else 0";
    CtRevenue => "ct_revenue", Monthly, Calculation, "revenue", "CT revenue",
        "if diagnostics_active and month >= ct_start_month then ct_monthly_volume * ct_price else 0";
    LabsRevenue => "labs_revenue", Monthly, Calculation, "revenue", "Lab revenue",
        "if diagnostics_active and month >= labs_start_month then labs_monthly_volume * labs_price else 0";
    DiagnosticsRevenue => "diagnostics_revenue", Monthly, Calculation, "revenue", "Diagnostics revenue",
        "echo_revenue + ct_revenue + labs_revenue";
    TotalRevenue => "total_revenue", Monthly, Calculation, "revenue", "Total revenue",
        "primary_revenue + specialty_revenue + corporate_revenue + echo_revenue + ct_revenue + labs_revenue";
    Salaries => "salaries", Monthly, Calculation, "costs", "Salaries",
        "inflation_factor * (practice_manager_monthly_cost * (month >= practice_manager_start_month) + nurse_practitioner_monthly_cost * (month >= nurse_practitioner_start_month) + medical_assistant_monthly_cost * (month >= medical_assistant_start_month) + front_desk_monthly_cost * (month >= front_desk_start_month) + care_coordinator_monthly_cost * (month >= care_coordinator_start_month) + sonographer_monthly_cost * (month >= sonographer_start_month) + ct_technologist_monthly_cost * (month >= ct_technologist_start_month))";
    FixedOverheadCost => "fixed_overhead_cost", Monthly, Calculation, "costs", "Fixed overhead",
        "fixed_overhead_monthly * inflation_factor";
    MarketingCost => "marketing_cost", Monthly, Calculation, "costs", "Marketing",
        "marketing_monthly";
    VariableCost => "variable_cost", Monthly, Calculation, "costs", "Variable costs",
        "total_revenue * variable_cost_pct / 100";
    EquipmentLeaseCost => "equipment_lease_cost", Monthly, Calculation, "costs", "Equipment leases",
        "if diagnostics_active then echo_lease_monthly * (month >= echo_start_month) + ct_lease_monthly * (month >= ct_start_month) else 0";
    DiagnosticsCogs => "diagnostics_cogs", Monthly, Calculation, "costs", "Diagnostics cost of goods sold",
        "diagnostics_revenue * diagnostics_cogs_rate";
    StartupCost => "startup_cost", Monthly, Calculation, "costs", "Startup costs recognised",
        "if split_startup_costs then startup_total / 2 * (month <= 1) else startup_total * (month == 0)";
    TotalCosts => "total_costs", Monthly, Calculation, "costs", "Total costs",
        "salaries + fixed_overhead_cost + marketing_cost + variable_cost + equipment_lease_cost + startup_cost + diagnostics_cogs";
    CapitalInjected => "capital_injected", Monthly, Calculation, "cash", "Capital injected",
        "total_capital_raised * (month == 0)";
    CapexOutlay => "capex_outlay", Monthly, Calculation, "cash", "Capital expenditure outlay",
        "capital_outlay_total * (month == capex_month)";
    Profit => "profit", Monthly, Output, "cash", "Profit",
        "total_revenue - total_costs";
    CumulativeCash => "cumulative_cash", Monthly, Output, "cash", "Cumulative cash",
        "prev(cumulative_cash) + capital_injected + profit - capex_outlay";

    ProjectionRevenue => "projection_revenue", Summary, Output, "returns", "12-month revenue",
        "sum(total_revenue)";
    ProjectionCosts => "projection_costs", Summary, Output, "returns", "12-month costs",
        "sum(total_costs)";
    ProjectionProfit => "projection_profit", Summary, Output, "returns", "12-month profit",
        "sum(profit)";
    ProjectionSpecialtyRevenue => "projection_specialty_revenue", Summary, Output, "returns", "12-month specialty revenue",
        "sum(specialty_revenue)";
    ProjectionMarketing => "projection_marketing", Summary, Output, "unit_economics", "12-month marketing spend",
        "sum(marketing_cost)";
    ProjectionNewMembers => "projection_new_members", Summary, Output, "unit_economics", "12-month new members",
        "sum(primary_new) + sum(specialty_new)";
    EndingCash => "ending_cash", Summary, Output, "cash", "Ending cash",
        "last(cumulative_cash)";
    BreakevenMonth => "breakeven_month", Summary, Output, "returns", "Breakeven month",
        "first_month_where(profit > 0)";
    CashTroughMonth => "cash_trough_month", Summary, Output, "cash", "Month of lowest cash",
        "lowest_month(cumulative_cash)";
    CashTrough => "cash_trough", Summary, Output, "cash", "Lowest cumulative cash",
        "lowest(cumulative_cash)";
    MsoRoi => "mso_roi", Summary, Output, "returns", "MSO ROI %",
        "projection_profit / total_capital_raised * 100";
    PhysicianAnnualIncome => "physician_annual_income", Summary, Output, "returns", "Physician annual income",
        "projection_specialty_revenue / physician_count * (1 - individual_fee_pct / 100) + projection_profit * individual_equity_pct / 100";
    PhysicianRoi => "physician_roi", Summary, Output, "returns", "Physician ROI %",
        "physician_annual_income / individual_investment * 100";
    PaybackMonths => "payback_months", Summary, Output, "returns", "Payback period (months)",
        "individual_investment / (physician_annual_income / 12)";
    RevenuePerMember => "revenue_per_member", Summary, Output, "unit_economics", "Monthly revenue per member",
        "(last(primary_revenue) + last(specialty_revenue)) / (last(primary_active) + last(specialty_active))";
    MemberLifetimeMonths => "member_lifetime_months", Summary, Output, "unit_economics", "Member lifetime (months)",
        "12 / (ltv_assumed_annual_churn_pct / 100)";
    Ltv => "ltv", Summary, Output, "unit_economics", "Lifetime value",
        "revenue_per_member * member_lifetime_months";
    Cac => "cac", Summary, Output, "unit_economics", "Customer acquisition cost",
        "projection_marketing / projection_new_members";
    LtvToCac => "ltv_to_cac", Summary, Output, "unit_economics", "LTV:CAC",
        "ltv / cac";
}

/// Words in formula text that are operators or built-ins rather than node ids.
pub const FORMULA_KEYWORDS: &[&str] = &[
    "if",
    "then",
    "else",
    "and",
    "or",
    "not",
    "min",
    "max",
    "round",
    "pow",
    "floor",
    "month",
    "launch_month",
    "prev",
    "sum",
    "last",
    "first_month_where",
    "lowest",
    "lowest_month",
];

/// Node ids named in a formula's text, keywords and numeric literals excluded.
pub fn formula_identifiers(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|token| !token.is_empty())
        .filter(|token| !token.chars().next().is_some_and(|c| c.is_ascii_digit()))
        .filter(|token| !FORMULA_KEYWORDS.contains(token))
        .map(str::to_string)
        .collect()
}

impl Quantity {
    pub fn id(self) -> &'static str {
        self.definition().id
    }

    pub fn scope(self) -> Scope {
        self.definition().scope
    }

    pub fn from_id(id: &str) -> Option<Quantity> {
        Quantity::ALL.iter().copied().find(|q| q.id() == id)
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Evaluates this quantity. `None` means "not applicable" and is only
    /// produced by summary ratios whose denominator is not positive.
    pub fn evaluate(self, env: &Env<'_>) -> Option<f64> {
        use InputField as F;
        use Quantity as Q;

        let month = env.month();
        let ramp = Phase::of_month(month) == Phase::Ramp;

        let value = match self {
            Q::PhysicianCount => {
                env.input(F::HasFoundingPhysician) + env.input(F::AdditionalPhysicians)
            }
            Q::TotalCapitalRaised => {
                env.input(F::HasFoundingPhysician) * env.rule(RuleField::FoundingCapital)
                    + env.input(F::AdditionalPhysicians) * env.rule(RuleField::AdditionalCapital)
            }
            Q::IndividualInvestment => env.by_physician(
                RuleField::FoundingCapital,
                RuleField::AdditionalCapital,
            ),
            Q::IndividualFeePct => {
                env.by_physician(RuleField::FoundingFeePct, RuleField::AdditionalFeePct)
            }
            Q::IndividualEquityPct => env.by_physician(
                RuleField::FoundingEquityPct,
                RuleField::AdditionalEquityPct,
            ),
            Q::MonthlyChurnRate => env.input(F::AnnualChurnPct) / 100.0 / 12.0,
            Q::ConversionRate => env.input(F::SpecialtyConversionPct) / 100.0,
            Q::BenefitsMultiplier => 1.0 + env.input(F::BenefitsLoadPct) / 100.0,
            Q::PracticeManagerMonthlyCost => {
                env.input(F::PracticeManagerSalary) / 12.0 * env.get(Q::BenefitsMultiplier)
            }
            Q::NursePractitionerMonthlyCost => {
                env.input(F::NursePractitionerSalary) / 12.0 * env.get(Q::BenefitsMultiplier)
            }
            Q::MedicalAssistantMonthlyCost => env.hourly_cost(
                F::MedicalAssistantHourly,
                F::MedicalAssistantWeeklyHours,
            ),
            Q::FrontDeskMonthlyCost => {
                env.hourly_cost(F::FrontDeskHourly, F::FrontDeskWeeklyHours)
            }
            Q::CareCoordinatorMonthlyCost => {
                env.hourly_cost(F::CareCoordinatorHourly, F::CareCoordinatorWeeklyHours)
            }
            Q::SonographerMonthlyCost => {
                env.hourly_cost(F::SonographerHourly, F::SonographerWeeklyHours)
            }
            Q::CtTechnologistMonthlyCost => {
                env.hourly_cost(F::CtTechnologistHourly, F::CtTechnologistWeeklyHours)
            }
            Q::FullStaffingMonthlyCost => {
                env.get(Q::PracticeManagerMonthlyCost)
                    + env.get(Q::NursePractitionerMonthlyCost)
                    + env.get(Q::MedicalAssistantMonthlyCost)
                    + env.get(Q::FrontDeskMonthlyCost)
                    + env.get(Q::CareCoordinatorMonthlyCost)
                    + env.get(Q::SonographerMonthlyCost)
                    + env.get(Q::CtTechnologistMonthlyCost)
            }
            Q::StartupTotal => {
                env.input(F::LegalStartup)
                    + env.input(F::LicensingStartup)
                    + env.input(F::ItSetupStartup)
                    + env.input(F::RecruitingStartup)
                    + env.input(F::LaunchMarketingStartup)
                    + env.input(F::OtherStartup)
            }
            Q::CapexTotal => {
                env.input(F::BuildoutCapex)
                    + env.input(F::EquipmentCapex)
                    + env.input(F::ItCapex)
                    + env.input(F::FurnitureCapex)
            }
            Q::CapitalOutlayTotal => env.get(Q::CapexTotal) + env.input(F::EquityBuyout),
            Q::LaunchPrimaryCarryover => {
                env.input(F::HasFoundingPhysician) * env.input(F::FoundingPrimaryCarryover)
                    + env.input(F::AdditionalPhysicians)
                        * env.input(F::AdditionalPrimaryCarryoverAvg)
            }
            Q::LaunchSpecialtyCarryover => {
                env.input(F::HasFoundingPhysician) * env.input(F::FoundingSpecialtyCarryover)
                    + env.input(F::AdditionalPhysicians)
                        * env.input(F::AdditionalSpecialtyCarryoverAvg)
            }
            Q::CorporateContractValue => {
                env.input(F::CorporateEmployeesPerContract) * env.input(F::CorporatePepm)
            }
            Q::DiagnosticsCogsRate => 1.0 - env.input(F::DiagnosticsMarginPct) / 100.0,
            Q::DeploymentEquipment => {
                env.input(F::EquipmentCapex) + env.input(F::ItCapex) + env.input(F::FurnitureCapex)
            }
            Q::DeploymentReserve => {
                env.get(Q::TotalCapitalRaised)
                    - env.input(F::BuildoutCapex)
                    - env.get(Q::DeploymentEquipment)
                    - env.get(Q::StartupTotal)
                    - env.input(F::WorkingCapitalReserve)
                    - env.input(F::EquityBuyout)
            }

            Q::InflationFactor => {
                let annual = env.input(F::InflationPct);
                (1.0 + annual / 100.0).powi((month / 12) as i32)
            }
            Q::PrimaryNew => {
                let ramp_intake = env.input(F::RampPrimaryIntake);
                let intake = env.input(F::PrimaryIntake);
                let growth = env.input(F::IntakeGrowthPct);
                if ramp {
                    ramp_intake
                } else {
                    let months_live = (month - LAUNCH_MONTH) as i32;
                    round_half_up(intake * (1.0 + growth / 100.0).powi(months_live))
                }
            }
            Q::PrimaryChurned => {
                let previous = env.prev(Q::PrimaryActive);
                let rate = env.get(Q::MonthlyChurnRate);
                if ramp {
                    0.0
                } else {
                    round_half_up(previous * rate).min(previous)
                }
            }
            Q::SpecialtyConverted => {
                let previous = env.prev(Q::PrimaryActive);
                let churned = env.get(Q::PrimaryChurned);
                let rate = env.get(Q::ConversionRate);
                if ramp {
                    0.0
                } else {
                    let remaining = (previous - churned).max(0.0);
                    round_half_up(remaining * rate).min(remaining)
                }
            }
            Q::PrimaryActive => {
                let previous = env.prev(Q::PrimaryActive);
                let joined = env.get(Q::PrimaryNew);
                let churned = env.get(Q::PrimaryChurned);
                let converted = env.get(Q::SpecialtyConverted);
                (previous + joined - churned - converted).max(0.0)
            }
            Q::SpecialtyNew => {
                let intake = env.input(F::SpecialtyIntake);
                gate(!ramp, intake)
            }
            Q::SpecialtyActive => {
                env.prev(Q::SpecialtyActive)
                    + env.get(Q::SpecialtyConverted)
                    + env.get(Q::SpecialtyNew)
            }
            Q::CorporateNew => {
                let started = env.reached(F::CorporateStartMonth);
                let intake = env.input(F::CorporateContractIntake);
                gate(started, intake)
            }
            Q::CorporateContracts => env.prev(Q::CorporateContracts) + env.get(Q::CorporateNew),
            Q::PrimaryRevenue => env.get(Q::PrimaryActive) * env.input(F::PrimaryPrice),
            Q::SpecialtyRevenue => env.get(Q::SpecialtyActive) * env.input(F::SpecialtyPrice),
            Q::CorporateRevenue => {
                env.get(Q::CorporateContracts) * env.get(Q::CorporateContractValue)
            }
            Q::EchoRevenue => {
                env.diagnostic_revenue(F::EchoStartMonth, F::EchoMonthlyVolume, F::EchoPrice)
            }
            Q::CtRevenue => {
                env.diagnostic_revenue(F::CtStartMonth, F::CtMonthlyVolume, F::CtPrice)
            }
            Q::LabsRevenue => {
                env.diagnostic_revenue(F::LabsStartMonth, F::LabsMonthlyVolume, F::LabsPrice)
            }
            Q::DiagnosticsRevenue => {
                env.get(Q::EchoRevenue) + env.get(Q::CtRevenue) + env.get(Q::LabsRevenue)
            }
            Q::TotalRevenue => {
                env.get(Q::PrimaryRevenue)
                    + env.get(Q::SpecialtyRevenue)
                    + env.get(Q::CorporateRevenue)
                    + env.get(Q::EchoRevenue)
                    + env.get(Q::CtRevenue)
                    + env.get(Q::LabsRevenue)
            }
            Q::Salaries => {
                let inflation = env.get(Q::InflationFactor);
                let payroll = env.staffed(
                    Q::PracticeManagerMonthlyCost,
                    F::PracticeManagerStartMonth,
                ) + env.staffed(
                    Q::NursePractitionerMonthlyCost,
                    F::NursePractitionerStartMonth,
                ) + env.staffed(
                    Q::MedicalAssistantMonthlyCost,
                    F::MedicalAssistantStartMonth,
                ) + env.staffed(Q::FrontDeskMonthlyCost, F::FrontDeskStartMonth)
                    + env.staffed(
                        Q::CareCoordinatorMonthlyCost,
                        F::CareCoordinatorStartMonth,
                    )
                    + env.staffed(Q::SonographerMonthlyCost, F::SonographerStartMonth)
                    + env.staffed(
                        Q::CtTechnologistMonthlyCost,
                        F::CtTechnologistStartMonth,
                    );
                inflation * payroll
            }
            Q::FixedOverheadCost => {
                env.input(F::FixedOverheadMonthly) * env.get(Q::InflationFactor)
            }
            Q::MarketingCost => env.input(F::MarketingMonthly),
            Q::VariableCost => env.get(Q::TotalRevenue) * env.input(F::VariableCostPct) / 100.0,
            Q::EquipmentLeaseCost => {
                let active = env.flag(F::DiagnosticsActive);
                let echo_lease = env.input(F::EchoLeaseMonthly);
                let echo_live = env.reached(F::EchoStartMonth);
                let ct_lease = env.input(F::CtLeaseMonthly);
                let ct_live = env.reached(F::CtStartMonth);
                gate(active, gate(echo_live, echo_lease) + gate(ct_live, ct_lease))
            }
            Q::DiagnosticsCogs => {
                env.get(Q::DiagnosticsRevenue) * env.get(Q::DiagnosticsCogsRate)
            }
            Q::StartupCost => {
                let split = env.flag(F::SplitStartupCosts);
                let total = env.get(Q::StartupTotal);
                if split {
                    gate(month <= 1, total / 2.0)
                } else {
                    gate(month == 0, total)
                }
            }
            Q::TotalCosts => {
                env.get(Q::Salaries)
                    + env.get(Q::FixedOverheadCost)
                    + env.get(Q::MarketingCost)
                    + env.get(Q::VariableCost)
                    + env.get(Q::EquipmentLeaseCost)
                    + env.get(Q::StartupCost)
                    + env.get(Q::DiagnosticsCogs)
            }
            Q::CapitalInjected => {
                let raised = env.get(Q::TotalCapitalRaised);
                gate(month == 0, raised)
            }
            Q::CapexOutlay => {
                let outlay = env.get(Q::CapitalOutlayTotal);
                let capex_month = env.input(F::CapexMonth);
                gate(f64::from(month) == capex_month, outlay)
            }
            Q::Profit => env.get(Q::TotalRevenue) - env.get(Q::TotalCosts),
            Q::CumulativeCash => {
                env.prev(Q::CumulativeCash) + env.get(Q::CapitalInjected) + env.get(Q::Profit)
                    - env.get(Q::CapexOutlay)
            }

            Q::ProjectionRevenue => env.total(Q::TotalRevenue),
            Q::ProjectionCosts => env.total(Q::TotalCosts),
            Q::ProjectionProfit => env.total(Q::Profit),
            Q::ProjectionSpecialtyRevenue => env.total(Q::SpecialtyRevenue),
            Q::ProjectionMarketing => env.total(Q::MarketingCost),
            Q::ProjectionNewMembers => env.total(Q::PrimaryNew) + env.total(Q::SpecialtyNew),
            Q::EndingCash => env.last(Q::CumulativeCash),
            Q::BreakevenMonth => return env.first_positive_month(Q::Profit).map(f64::from),
            Q::CashTroughMonth => {
                return env.lowest(Q::CumulativeCash).map(|(m, _)| f64::from(m));
            }
            Q::CashTrough => return env.lowest(Q::CumulativeCash).map(|(_, cash)| cash),
            Q::MsoRoi => {
                let profit = env.get(Q::ProjectionProfit);
                let raised = env.get(Q::TotalCapitalRaised);
                return ratio(profit, raised).map(|r| r * 100.0);
            }
            Q::PhysicianAnnualIncome => {
                let specialty = env.get(Q::ProjectionSpecialtyRevenue);
                let physicians = env.get(Q::PhysicianCount);
                let fee_pct = env.get(Q::IndividualFeePct);
                let profit = env.get(Q::ProjectionProfit);
                let equity_pct = env.get(Q::IndividualEquityPct);
                return ratio(specialty, physicians).map(|share| {
                    share * (1.0 - fee_pct / 100.0) + profit * equity_pct / 100.0
                });
            }
            Q::PhysicianRoi => {
                let income = env.get_opt(Q::PhysicianAnnualIncome);
                let investment = env.get(Q::IndividualInvestment);
                return income
                    .and_then(|income| ratio(income, investment))
                    .map(|r| r * 100.0);
            }
            Q::PaybackMonths => {
                let investment = env.get(Q::IndividualInvestment);
                let income = env.get_opt(Q::PhysicianAnnualIncome);
                return income.and_then(|income| ratio(investment, income / 12.0));
            }
            Q::RevenuePerMember => {
                let revenue = env.last(Q::PrimaryRevenue) + env.last(Q::SpecialtyRevenue);
                let members = env.last(Q::PrimaryActive) + env.last(Q::SpecialtyActive);
                return ratio(revenue, members);
            }
            Q::MemberLifetimeMonths => {
                let churn = env.input(F::LtvAssumedAnnualChurnPct);
                return ratio(12.0, churn / 100.0);
            }
            Q::Ltv => {
                let per_member = env.get_opt(Q::RevenuePerMember);
                let lifetime = env.get_opt(Q::MemberLifetimeMonths);
                return per_member.zip(lifetime).map(|(r, l)| r * l);
            }
            Q::Cac => {
                let marketing = env.get(Q::ProjectionMarketing);
                let acquired = env.get(Q::ProjectionNewMembers);
                return ratio(marketing, acquired);
            }
            Q::LtvToCac => {
                let ltv = env.get_opt(Q::Ltv);
                let cac = env.get_opt(Q::Cac);
                return ltv.zip(cac).and_then(|(ltv, cac)| ratio(ltv, cac));
            }
        };
        Some(value)
    }
}

/// Division guarded against non-positive denominators.
pub fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator > 0.0 && denominator.is_finite() {
        Some(numerator / denominator)
    } else {
        None
    }
}

pub fn round_half_up(value: f64) -> f64 {
    (value + 0.5).floor()
}

fn gate(active: bool, value: f64) -> f64 {
    if active { value } else { 0.0 }
}

/// What a formula read: the edge source in the dependency graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Dep {
    Input(InputField),
    Rule(RuleField),
    Node(Quantity),
    /// The previous month's value of a quantity (carried state).
    Carry(Quantity),
}

impl Dep {
    pub fn id(self) -> &'static str {
        match self {
            Dep::Input(field) => field.key(),
            Dep::Rule(rule) => rule.key(),
            Dep::Node(q) | Dep::Carry(q) => q.id(),
        }
    }
}

/// Slot per quantity; unset slots read as 0.
#[derive(Clone, Debug)]
pub struct Values {
    slots: [Option<f64>; Quantity::COUNT],
}

impl Values {
    pub fn new() -> Self {
        Self {
            slots: [None; Quantity::COUNT],
        }
    }

    pub fn get(&self, q: Quantity) -> f64 {
        self.slots[q.index()].unwrap_or(0.0)
    }

    pub fn get_opt(&self, q: Quantity) -> Option<f64> {
        self.slots[q.index()]
    }

    pub fn set(&mut self, q: Quantity, value: Option<f64>) {
        self.slots[q.index()] = value;
    }
}

impl Default for Values {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a formula may read.
pub struct Env<'a> {
    inputs: &'a Inputs,
    rules: &'a BusinessRules,
    month: u32,
    current: &'a Values,
    previous: &'a Values,
    series: &'a [MonthlyRecord],
    trace: Option<&'a RefCell<Vec<Dep>>>,
}

impl<'a> Env<'a> {
    pub fn new(
        inputs: &'a Inputs,
        rules: &'a BusinessRules,
        month: u32,
        current: &'a Values,
        previous: &'a Values,
    ) -> Self {
        Self {
            inputs,
            rules,
            month,
            current,
            previous,
            series: &[],
            trace: None,
        }
    }

    pub fn with_series(mut self, series: &'a [MonthlyRecord]) -> Self {
        self.series = series;
        self
    }

    fn with_trace(mut self, trace: &'a RefCell<Vec<Dep>>) -> Self {
        self.trace = Some(trace);
        self
    }

    fn record(&self, dep: Dep) {
        if let Some(trace) = self.trace {
            trace.borrow_mut().push(dep);
        }
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn input(&self, field: InputField) -> f64 {
        self.record(Dep::Input(field));
        self.inputs.value(field)
    }

    pub fn flag(&self, field: InputField) -> bool {
        self.input(field) != 0.0
    }

    /// True once the month reaches the start month held in `field`.
    pub fn reached(&self, field: InputField) -> bool {
        f64::from(self.month) >= self.input(field)
    }

    pub fn rule(&self, field: RuleField) -> f64 {
        self.record(Dep::Rule(field));
        self.rules.value(field)
    }

    pub fn get(&self, q: Quantity) -> f64 {
        self.record(Dep::Node(q));
        self.current.get(q)
    }

    pub fn get_opt(&self, q: Quantity) -> Option<f64> {
        self.record(Dep::Node(q));
        self.current.get_opt(q)
    }

    pub fn prev(&self, q: Quantity) -> f64 {
        self.record(Dep::Carry(q));
        self.previous.get(q)
    }

    fn by_physician(&self, founding: RuleField, additional: RuleField) -> f64 {
        let has_founding = self.flag(InputField::HasFoundingPhysician);
        let founding = self.rule(founding);
        let additional = self.rule(additional);
        if has_founding { founding } else { additional }
    }

    fn hourly_cost(&self, rate: InputField, weekly_hours: InputField) -> f64 {
        self.input(rate) * self.input(weekly_hours) * 52.0 / 12.0
            * self.get(Quantity::BenefitsMultiplier)
    }

    fn staffed(&self, cost: Quantity, start: InputField) -> f64 {
        let cost = self.get(cost);
        let live = self.reached(start);
        gate(live, cost)
    }

    fn diagnostic_revenue(&self, start: InputField, volume: InputField, price: InputField) -> f64 {
        let active = self.flag(InputField::DiagnosticsActive);
        let live = self.reached(start);
        let volume = self.input(volume);
        let price = self.input(price);
        gate(active && live, volume * price)
    }

    /// Sum over the projection-phase months of the series.
    pub fn total(&self, q: Quantity) -> f64 {
        self.record(Dep::Node(q));
        self.series
            .iter()
            .filter(|r| r.phase == Phase::Projection)
            .map(|r| record_value(r, q).unwrap_or(0.0))
            .sum()
    }

    pub fn last(&self, q: Quantity) -> f64 {
        self.record(Dep::Node(q));
        self.series
            .last()
            .and_then(|r| record_value(r, q))
            .unwrap_or(0.0)
    }

    pub fn first_positive_month(&self, q: Quantity) -> Option<u32> {
        self.record(Dep::Node(q));
        self.series
            .iter()
            .find(|r| record_value(r, q).unwrap_or(0.0) > 0.0)
            .map(|r| r.month)
    }

    /// Lowest value over the whole series; ties keep the earliest month.
    pub fn lowest(&self, q: Quantity) -> Option<(u32, f64)> {
        self.record(Dep::Node(q));
        self.series
            .iter()
            .map(|r| (r.month, record_value(r, q).unwrap_or(0.0)))
            .fold(None, |best, (month, value)| match best {
                Some((_, low)) if low <= value => best,
                _ => Some((month, value)),
            })
    }
}

/// The value a monthly record holds for `q`, if the record carries it.
pub fn record_value(record: &MonthlyRecord, q: Quantity) -> Option<f64> {
    use Quantity as Q;
    let members = &record.members;
    let value = match q {
        Q::PrimaryNew => f64::from(members.primary_new),
        Q::PrimaryChurned => f64::from(members.primary_churned),
        Q::SpecialtyConverted => f64::from(members.specialty_converted),
        Q::PrimaryActive => f64::from(members.primary_active),
        Q::SpecialtyNew => f64::from(members.specialty_new),
        Q::SpecialtyActive => f64::from(members.specialty_active),
        Q::CorporateNew => f64::from(members.corporate_new),
        Q::CorporateContracts => f64::from(members.corporate_contracts),
        Q::PrimaryRevenue => record.revenue.primary,
        Q::SpecialtyRevenue => record.revenue.specialty,
        Q::CorporateRevenue => record.revenue.corporate,
        Q::EchoRevenue => record.revenue.echo,
        Q::CtRevenue => record.revenue.ct,
        Q::LabsRevenue => record.revenue.labs,
        Q::DiagnosticsRevenue => record.revenue.diagnostics(),
        Q::TotalRevenue => record.revenue.total,
        Q::Salaries => record.costs.salaries,
        Q::FixedOverheadCost => record.costs.fixed_overhead,
        Q::MarketingCost => record.costs.marketing,
        Q::VariableCost => record.costs.variable,
        Q::EquipmentLeaseCost => record.costs.equipment_lease,
        Q::DiagnosticsCogs => record.costs.diagnostics_cogs,
        Q::StartupCost => record.costs.startup,
        Q::TotalCosts => record.costs.total,
        Q::CapitalInjected => record.capital_injected,
        Q::CapexOutlay => record.capex_outlay,
        Q::Profit => record.profit,
        Q::CumulativeCash => record.cumulative_cash,
        _ => return None,
    };
    Some(value)
}

/// Evaluates every static quantity for `inputs`.
pub fn evaluate_static(inputs: &Inputs, rules: &BusinessRules) -> Values {
    let mut values = Values::new();
    let empty = Values::new();
    for &q in &plan().statics {
        let value = {
            let env = Env::new(inputs, rules, 0, &values, &empty);
            q.evaluate(&env)
        };
        values.set(q, value);
    }
    values
}

/// The reads `q` performs, in first-read order without duplicates.
pub fn trace_dependencies(q: Quantity) -> Vec<Dep> {
    let inputs = Inputs::default();
    let rules = BusinessRules::standard();
    let current = Values::new();
    let previous = Values::new();
    let trace = RefCell::new(Vec::new());
    let env = Env::new(&inputs, &rules, LAUNCH_MONTH, &current, &previous).with_trace(&trace);
    let _ = q.evaluate(&env);

    let mut deps = Vec::new();
    for dep in trace.into_inner() {
        if !deps.contains(&dep) {
            deps.push(dep);
        }
    }
    deps
}

/// Per-scope evaluation order derived from the traced reads.
#[derive(Debug, Clone)]
pub struct EvaluationPlan {
    pub statics: Vec<Quantity>,
    pub monthly: Vec<Quantity>,
    pub summary: Vec<Quantity>,
}

pub fn plan() -> &'static EvaluationPlan {
    static PLAN: OnceLock<EvaluationPlan> = OnceLock::new();
    PLAN.get_or_init(build_plan)
}

fn build_plan() -> EvaluationPlan {
    let order = match topological_order() {
        Ok(order) => order,
        Err(stuck) => {
            log::warn!(
                "formula dependencies contain a cycle through {:?}; using declaration order",
                stuck.iter().map(|q| q.id()).collect::<Vec<_>>()
            );
            Quantity::ALL.to_vec()
        }
    };

    let in_scope = |scope: Scope| -> Vec<Quantity> {
        order.iter().copied().filter(|q| q.scope() == scope).collect()
    };
    let plan = EvaluationPlan {
        statics: in_scope(Scope::Static),
        monthly: in_scope(Scope::Monthly),
        summary: in_scope(Scope::Summary),
    };
    log::debug!(
        "evaluation plan: {} static, {} monthly, {} summary quantities",
        plan.statics.len(),
        plan.monthly.len(),
        plan.summary.len()
    );
    plan
}

/// Kahn's algorithm over same-month reads; ties resolve in declaration order.
/// On a cycle returns the quantities that could not be ordered.
fn topological_order() -> Result<Vec<Quantity>, Vec<Quantity>> {
    let deps: Vec<Vec<Quantity>> = Quantity::ALL
        .iter()
        .map(|&q| {
            trace_dependencies(q)
                .into_iter()
                .filter_map(|dep| match dep {
                    Dep::Node(source) => Some(source),
                    _ => None,
                })
                .collect()
        })
        .collect();

    let mut placed = vec![false; Quantity::COUNT];
    let mut order = Vec::with_capacity(Quantity::COUNT);
    while order.len() < Quantity::COUNT {
        let next = Quantity::ALL.iter().copied().find(|&q| {
            !placed[q.index()] && deps[q.index()].iter().all(|d| placed[d.index()])
        });
        match next {
            Some(q) => {
                placed[q.index()] = true;
                order.push(q);
            }
            None => {
                return Err(Quantity::ALL
                    .iter()
                    .copied()
                    .filter(|q| !placed[q.index()])
                    .collect());
            }
        }
    }
    Ok(order)
}
