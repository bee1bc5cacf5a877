pub mod engine;
pub mod error;
pub mod formulas;
pub mod graph;
pub mod kpi;
pub mod monte_carlo;
pub mod rules;
pub mod types;
pub mod validate;

pub use engine::{MonthlyRun, run_months, run_projection};
pub use error::{GraphError, InputError, SimulationError};
pub use formulas::{Quantity, Scope};
pub use graph::{
    DependencyGraph, Direction, GraphEdge, GraphIssue, GraphNode, NodeKind, build_graph,
    downstream, traverse, upstream, validate_graph,
};
pub use kpi::aggregate;
pub use monte_carlo::{CancelToken, SimulationReport, simulate, simulate_cancellable};
pub use rules::{BusinessRules, PhysicianTerms};
pub use types::{
    CapitalDeployment, InputField, Inputs, KpiBundle, LaunchState, MonthlyRecord, Phase,
    ProjectionResult, UnitEconomics,
};
pub use validate::{SeriesViolation, check_series};
