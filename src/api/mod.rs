use axum::{
    Json, Router,
    extract::{
        Query,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;

use crate::core::{
    BusinessRules, CancelToken, DependencyGraph, Direction, GraphError, GraphIssue, Inputs,
    MonthlyRecord, ProjectionResult, SeriesViolation, SimulationError, build_graph,
    check_series, run_projection, simulate_cancellable, traverse, validate_graph,
};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProjectResponse {
    #[serde(flatten)]
    result: ProjectionResult,
    violations: Vec<SeriesViolation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphResponse {
    #[serde(flatten)]
    graph: DependencyGraph,
    issues: Vec<GraphIssue>,
}

#[derive(Debug, Deserialize)]
struct ImpactQuery {
    node: String,
    direction: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImpactResponse {
    node: String,
    direction: Direction,
    affected: BTreeSet<String>,
    issues: Vec<GraphIssue>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Cancels the simulation when the request future is dropped, e.g. when the
/// client disconnects before the blocking task finishes.
struct CancelOnDrop(CancelToken);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/api/project", post(project_handler))
        .route("/api/monte-carlo", post(monte_carlo_handler))
        .route("/api/graph", post(graph_handler))
        .route("/api/graph/impact", get(impact_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    log::info!("MSO model HTTP API listening on http://{addr}");
    log::info!("Local access: http://127.0.0.1:{port}/api/project");

    axum::serve(listener, router()).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn project_handler(payload: Result<Json<Inputs>, JsonRejection>) -> Response {
    match parse_inputs(payload) {
        Ok(inputs) => json_response(
            StatusCode::OK,
            build_project_response(&inputs, &BusinessRules::standard()),
        ),
        Err(response) => response,
    }
}

async fn graph_handler(payload: Result<Json<Inputs>, JsonRejection>) -> Response {
    match parse_inputs(payload) {
        Ok(inputs) => json_response(
            StatusCode::OK,
            build_graph_response(&inputs, &BusinessRules::standard()),
        ),
        Err(response) => response,
    }
}

async fn impact_handler(query: Result<Query<ImpactQuery>, QueryRejection>) -> Response {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => return error_response(StatusCode::BAD_REQUEST, &rejection.body_text()),
    };

    match build_impact_response(query) {
        Ok(response) => json_response(StatusCode::OK, response),
        Err(err @ GraphError::UnknownNode(_)) => {
            error_response(StatusCode::NOT_FOUND, &err.to_string())
        }
        Err(err @ GraphError::UnknownDirection(_)) => {
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
    }
}

async fn monte_carlo_handler(payload: Result<Json<Inputs>, JsonRejection>) -> Response {
    let inputs = match parse_inputs(payload) {
        Ok(inputs) => inputs,
        Err(response) => return response,
    };

    let cancel = CancelToken::new();
    let _guard = CancelOnDrop(cancel.clone());
    let task = tokio::task::spawn_blocking(move || {
        let rules = BusinessRules::standard();
        simulate_cancellable(
            &inputs,
            &rules,
            inputs.monte_carlo_iterations as usize,
            inputs.random_seed,
            &cancel,
        )
    });

    match task.await {
        Ok(Ok(report)) => json_response(StatusCode::OK, report),
        Ok(Err(err @ SimulationError::InvalidInputs(_))) => {
            error_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
        Ok(Err(err @ SimulationError::Cancelled { .. })) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string())
        }
        Err(err) => {
            log::error!("monte carlo task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Simulation failed")
        }
    }
}

fn parse_inputs(payload: Result<Json<Inputs>, JsonRejection>) -> Result<Inputs, Response> {
    let Json(inputs) = payload.map_err(|rejection| {
        error_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid inputs JSON: {}", rejection.body_text()),
        )
    })?;
    inputs
        .validate()
        .map_err(|err| error_response(StatusCode::BAD_REQUEST, &err.to_string()))?;
    Ok(inputs)
}

fn with_cache_control<R: IntoResponse>(response: R) -> Response {
    let mut response = response.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    with_cache_control((status, Json(body)))
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

fn build_project_response(inputs: &Inputs, rules: &BusinessRules) -> ProjectResponse {
    let result = run_projection(inputs, rules);
    let records: Vec<MonthlyRecord> = result.records().cloned().collect();
    ProjectResponse {
        violations: check_series(&records),
        result,
    }
}

fn build_graph_response(inputs: &Inputs, rules: &BusinessRules) -> GraphResponse {
    let graph = build_graph(inputs, rules);
    GraphResponse {
        issues: validate_graph(&graph),
        graph,
    }
}

/// Structure does not depend on input values, so impact queries share one
/// graph built and validated from the defaults.
fn default_graph() -> &'static GraphResponse {
    static GRAPH: OnceLock<GraphResponse> = OnceLock::new();
    GRAPH.get_or_init(|| build_graph_response(&Inputs::default(), &BusinessRules::standard()))
}

fn build_impact_response(query: ImpactQuery) -> Result<ImpactResponse, GraphError> {
    let direction = match query.direction.as_deref() {
        Some(text) => text.parse()?,
        None => Direction::Downstream,
    };
    let checked = default_graph();
    let affected = traverse(&checked.graph, &query.node, direction)?;
    Ok(ImpactResponse {
        node: query.node,
        direction,
        affected,
        issues: checked.issues.clone(),
    })
}
