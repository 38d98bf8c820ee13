use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use sleepsense_api::{
    preview, rule_catalog, rule_show, MigrateResult, RuleSummary, SleepSenseApi,
    API_CONTRACT_VERSION, DEFAULT_TOP_PRIORITY,
};
use sleepsense_core::{
    requires_medical_attention, AnalysisResult, AssessmentRun, ExportRecord, FactRecord,
    Recommendation, RunId,
};
use sleepsense_store_sqlite::{IntegrityReport, RunSummary, SchemaStatus};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DEFAULT_RUN_LIMIT: usize = 20;

#[derive(Debug, Clone)]
struct ServiceState {
    api: SleepSenseApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct TopQuery {
    n: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct AnalyzeResponse {
    persisted: bool,
    run_id: RunId,
    input_digest: String,
    requires_medical_attention: bool,
    result: AnalysisResult,
}

impl AnalyzeResponse {
    fn from_run(run: AssessmentRun, persisted: bool) -> Self {
        Self {
            persisted,
            run_id: run.id,
            input_digest: run.input_digest,
            requires_medical_attention: requires_medical_attention(&run.output),
            result: run.output,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct LatestResponse {
    requires_medical_attention: bool,
    input: FactRecord,
    result: AnalysisResult,
}

#[derive(Debug, Parser)]
#[command(name = "sleepsense-service")]
#[command(about = "Local HTTP service for SleepSense assessments")]
struct Args {
    #[arg(long, default_value = "./sleepsense.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = false)]
    verbose: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn error(message: impl Into<String>) -> ServiceError {
        ServiceError {
            status: StatusCode::BAD_REQUEST,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> ServiceError {
        ServiceError { status: StatusCode::NOT_FOUND, ..Self::error(message) }
    }

    fn no_assessment() -> ServiceError {
        Self::not_found("no assessment has been analyzed yet")
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/rules", get(rules_list))
        .route("/v1/rules/:rule_id", get(rules_show))
        .route("/v1/analyze", post(analyze))
        .route("/v1/analyze/preview", post(analyze_preview))
        .route("/v1/results/latest", get(results_latest))
        .route("/v1/results/top", get(results_top))
        .route("/v1/export", get(export))
        .route("/v1/runs", get(runs_list))
        .route("/v1/runs/:run_id", get(runs_show))
        .with_state(state)
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new(
                "sleepsense_service=debug,sleepsense_core=debug,sleepsense_store_sqlite=debug,\
                 sleepsense_api=debug",
            )
        } else {
            EnvFilter::new("warn,sleepsense_service=info,sleepsense_api=info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).without_time())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let state = ServiceState { api: SleepSenseApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, "sleepsense service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result =
        state.api.migrate(request.dry_run).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(result)))
}

async fn db_integrity_check(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report =
        state.api.integrity_check().map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(report)))
}

async fn rules_list() -> Json<ServiceEnvelope<Vec<RuleSummary>>> {
    Json(envelope(rule_catalog()))
}

async fn rules_show(
    Path(rule_id): Path<String>,
) -> Result<Json<ServiceEnvelope<RuleSummary>>, ServiceError> {
    let rule = rule_show(&rule_id)
        .ok_or_else(|| ServiceState::not_found(format!("unknown rule id: {rule_id}")))?;
    Ok(Json(envelope(rule)))
}

async fn analyze(
    State(state): State<ServiceState>,
    Json(facts): Json<FactRecord>,
) -> Result<Json<ServiceEnvelope<AnalyzeResponse>>, ServiceError> {
    let run = state.api.analyze(facts).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(AnalyzeResponse::from_run(run, true))))
}

async fn analyze_preview(
    Json(facts): Json<FactRecord>,
) -> Result<Json<ServiceEnvelope<AnalyzeResponse>>, ServiceError> {
    let run = preview(facts).map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(AnalyzeResponse::from_run(run, false))))
}

async fn results_latest(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<LatestResponse>>, ServiceError> {
    let latest = state
        .api
        .latest()
        .map_err(|err| ServiceState::error(err.to_string()))?
        .ok_or_else(ServiceState::no_assessment)?;
    Ok(Json(envelope(LatestResponse {
        requires_medical_attention: requires_medical_attention(&latest.result),
        input: latest.input,
        result: latest.result,
    })))
}

async fn results_top(
    State(state): State<ServiceState>,
    Query(query): Query<TopQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Recommendation>>>, ServiceError> {
    let recommendations = state
        .api
        .top_priority(query.n.unwrap_or(DEFAULT_TOP_PRIORITY))
        .map_err(|err| ServiceState::error(err.to_string()))?
        .ok_or_else(ServiceState::no_assessment)?;
    Ok(Json(envelope(recommendations)))
}

async fn export(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ExportRecord>>, ServiceError> {
    let record = state
        .api
        .export_latest()
        .map_err(|err| ServiceState::error(err.to_string()))?
        .ok_or_else(ServiceState::no_assessment)?;
    Ok(Json(envelope(record)))
}

async fn runs_list(
    State(state): State<ServiceState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<ServiceEnvelope<Vec<RunSummary>>>, ServiceError> {
    let runs = state
        .api
        .list_runs(query.limit.unwrap_or(DEFAULT_RUN_LIMIT))
        .map_err(|err| ServiceState::error(err.to_string()))?;
    Ok(Json(envelope(runs)))
}

async fn runs_show(
    State(state): State<ServiceState>,
    Path(run_id): Path<String>,
) -> Result<Json<ServiceEnvelope<AssessmentRun>>, ServiceError> {
    let run_id = RunId::parse(&run_id).map_err(|err| ServiceState::error(err.to_string()))?;
    let run = state
        .api
        .run_show(run_id)
        .map_err(|err| ServiceState::error(err.to_string()))?
        .ok_or_else(|| ServiceState::not_found(format!("assessment run not found: {run_id}")))?;
    Ok(Json(envelope(run)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("sleepsense-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn router_for(db_path: PathBuf) -> Router {
        app(ServiceState { api: SleepSenseApi::new(db_path) })
    }

    async fn send(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(value) => builder
                .header("content-type", "application/json")
                .body(Body::from(value.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request {method} {uri}: {err}"));

        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request {method} {uri} failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    fn stressed_assessment() -> serde_json::Value {
        let mut value = serde_json::to_value(FactRecord::default())
            .unwrap_or_else(|err| panic!("failed to serialize fixture: {err}"));
        value["sleep_duration"] = serde_json::json!(5.0);
        value["stress_level"] = serde_json::Value::String("high".to_string());
        value
    }

    fn first_rule_ids(recommendations: &serde_json::Value) -> Vec<&str> {
        recommendations
            .as_array()
            .unwrap_or_else(|| panic!("expected recommendation array: {recommendations}"))
            .iter()
            .filter_map(|rec| rec.pointer("/firedRules/0").and_then(serde_json::Value::as_str))
            .collect()
    }

    // Test IDs: TSVC-001
    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let response = send(router_for(unique_temp_db_path()), "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(serde_json::Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value.pointer("/data/status").and_then(serde_json::Value::as_str), Some("ok"));
    }

    // Test IDs: TSVC-002
    #[tokio::test]
    async fn openapi_endpoint_returns_versioned_artifact() {
        let response = send(router_for(unique_temp_db_path()), "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        assert!(body.contains("/v1/analyze"));
        assert!(body.contains("/v1/runs/{run_id}"));
    }

    // Test IDs: TSVC-003
    #[tokio::test]
    async fn analyze_then_read_latest_top_export_and_history() {
        let db_path = unique_temp_db_path();
        let router = router_for(db_path.clone());

        let response =
            send(router.clone(), "POST", "/v1/analyze", Some(stressed_assessment())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let analyzed = response_json(response).await;
        assert_eq!(
            analyzed.get("api_contract_version").and_then(serde_json::Value::as_str),
            Some(API_CONTRACT_VERSION)
        );
        assert_eq!(analyzed.pointer("/data/persisted"), Some(&serde_json::Value::Bool(true)));
        let run_id = analyzed
            .pointer("/data/run_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_else(|| panic!("missing data.run_id in response: {analyzed}"))
            .to_string();

        let latest = response_json(send(router.clone(), "GET", "/v1/results/latest", None).await).await;
        assert_eq!(
            latest.pointer("/data/result/meta/rulesMatched"),
            Some(&serde_json::json!(3))
        );

        let top = response_json(send(router.clone(), "GET", "/v1/results/top?n=2", None).await).await;
        assert_eq!(first_rule_ids(&top["data"]), vec!["R2", "R10"]);

        let exported = response_json(send(router.clone(), "GET", "/v1/export", None).await).await;
        assert!(exported.pointer("/data/timestamp").and_then(serde_json::Value::as_str).is_some());
        assert_eq!(
            exported.pointer("/data/input/stress_level").and_then(serde_json::Value::as_str),
            Some("high")
        );

        let runs = response_json(send(router.clone(), "GET", "/v1/runs?limit=5", None).await).await;
        assert_eq!(
            runs.pointer("/data/0/run_id").and_then(serde_json::Value::as_str),
            Some(run_id.as_str())
        );

        let shown =
            response_json(send(router, "GET", &format!("/v1/runs/{run_id}"), None).await).await;
        assert_eq!(
            shown.pointer("/data/id").and_then(serde_json::Value::as_str),
            Some(run_id.as_str())
        );

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-004
    #[tokio::test]
    async fn missing_data_maps_to_not_found_and_bad_input_to_bad_request() {
        let db_path = unique_temp_db_path();
        let router = router_for(db_path.clone());

        for uri in ["/v1/results/latest", "/v1/results/top", "/v1/export"] {
            let response = send(router.clone(), "GET", uri, None).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
        }

        let unknown_run = format!("/v1/runs/{}", ulid::Ulid::new());
        let response = send(router.clone(), "GET", &unknown_run, None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(router.clone(), "GET", "/v1/runs/not-a-ulid", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let mut too_long = stressed_assessment();
        too_long["sleep_duration"] = serde_json::json!(30.0);
        let response = send(router.clone(), "POST", "/v1/analyze", Some(too_long)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert!(value
            .get("error")
            .and_then(serde_json::Value::as_str)
            .is_some_and(|error| error.contains("sleep_duration")));

        let runs = response_json(send(router, "GET", "/v1/runs", None).await).await;
        assert_eq!(runs.get("data"), Some(&serde_json::json!([])));

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-005
    #[tokio::test]
    async fn rules_and_preview_do_not_touch_storage() {
        let db_path = unique_temp_db_path();
        let router = router_for(db_path.clone());

        let rules = response_json(send(router.clone(), "GET", "/v1/rules", None).await).await;
        assert_eq!(rules["data"].as_array().map(Vec::len), Some(18));

        let referral = response_json(send(router.clone(), "GET", "/v1/rules/R13", None).await).await;
        assert_eq!(referral.pointer("/data/medical_referral"), Some(&serde_json::Value::Bool(true)));

        let response = send(router.clone(), "GET", "/v1/rules/R0", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let mut apnea = serde_json::to_value(FactRecord::default())
            .unwrap_or_else(|err| panic!("failed to serialize fixture: {err}"));
        apnea["medical_issues"] = serde_json::Value::String("sleep_apnea".to_string());
        let previewed =
            response_json(send(router.clone(), "POST", "/v1/analyze/preview", Some(apnea)).await)
                .await;
        assert_eq!(previewed.pointer("/data/persisted"), Some(&serde_json::Value::Bool(false)));
        assert_eq!(
            previewed.pointer("/data/requires_medical_attention"),
            Some(&serde_json::Value::Bool(true))
        );

        let response = send(router, "GET", "/v1/results/latest", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let _ = std::fs::remove_file(&db_path);
    }

    // Test IDs: TSVC-006
    #[tokio::test]
    async fn db_endpoints_plan_apply_and_check_migrations() {
        let db_path = unique_temp_db_path();
        let router = router_for(db_path.clone());

        let planned = response_json(
            send(router.clone(), "POST", "/v1/db/migrate", Some(serde_json::json!({"dry_run": true})))
                .await,
        )
        .await;
        assert_eq!(planned.pointer("/data/would_apply_versions"), Some(&serde_json::json!([1])));

        let applied = response_json(
            send(router.clone(), "POST", "/v1/db/migrate", Some(serde_json::json!({"dry_run": false})))
                .await,
        )
        .await;
        assert_eq!(applied.pointer("/data/up_to_date"), Some(&serde_json::Value::Bool(true)));

        let status =
            response_json(send(router.clone(), "POST", "/v1/db/schema-version", None).await).await;
        assert_eq!(status.pointer("/data/current_version"), Some(&serde_json::json!(1)));

        let integrity =
            response_json(send(router, "POST", "/v1/db/integrity-check", None).await).await;
        assert_eq!(
            integrity.pointer("/data/quick_check_ok"),
            Some(&serde_json::Value::Bool(true))
        );

        let _ = std::fs::remove_file(&db_path);
    }
}
