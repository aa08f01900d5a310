use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use governance_core::{
    parse_rfc3339_utc, Comment, ConfigParameter, GovernanceError, HistoryQuery, HistoryRecord,
    ParameterDefinition, Policy, PolicyChangeRecord, PolicyId, PolicyInput, RecordId,
    SuggestionId, SuggestionState, Tally,
};
use governance_engine::{
    load_config, GovernanceApi, ParameterChange, ResolutionReport, ReviewDecision,
    SubmitSuggestion, SuggestionDetail, SuggestionView, SweepReport,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_CONTRACT_VERSION: &str = "governance.v1";

#[derive(Clone)]
struct ServiceState {
    api: GovernanceApi,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    schema_ready: bool,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_request_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    conflict_total: AtomicU64,
    unauthorized_total: AtomicU64,
    storage_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_request_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    conflict_total: u64,
    unauthorized_total: u64,
    storage_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct CastVoteRequest {
    voter: String,
    choice: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PostCommentRequest {
    author: String,
    text: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CloseRequest {
    actor: String,
    #[serde(default)]
    decision: Option<ReviewDecision>,
}

#[derive(Debug, Clone, Deserialize)]
struct ActorRequest {
    actor: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RegisterParameterRequest {
    #[serde(flatten)]
    definition: ParameterDefinition,
    actor: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SetParameterRequest {
    value: String,
    actor: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RollbackRequest {
    record_id: RecordId,
    actor: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PolicyRequest {
    #[serde(flatten)]
    policy: PolicyInput,
    actor: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SuggestionListQuery {
    /// A lifecycle state, or `all`. Defaults to `open`.
    state: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct HistoryListQuery {
    parameter_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PolicyChangesQuery {
    policy_id: Option<String>,
}

#[derive(Debug, Parser)]
#[command(name = "governance-service")]
#[command(about = "Local HTTP service for parameter governance")]
struct Args {
    #[arg(long, default_value = "./governance.sqlite3")]
    db: PathBuf,
    /// JSON governance config; defaults apply when the file is absent.
    #[arg(long, default_value = "./governance.json")]
    config: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// Timeout for read operations. Writes always run to completion.
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Seconds between deadline sweeps; 0 disables the sweeper.
    #[arg(long, default_value_t = 60)]
    sweep_interval_secs: u64,
    #[arg(long, default_value = "info")]
    log_level: String,
    #[arg(long)]
    log_json: bool,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure { status, code, message: message.into(), details }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_query_with_telemetry(&self, rejection: &QueryRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_query", false);
        Self::failure(
            rejection.status(),
            "invalid_query",
            rejection.body_text(),
            None,
        )
    }

    /// Rejects a request before it reaches the engine, e.g. a malformed path id.
    fn reject(&self, err: &GovernanceError) -> ServiceFailure {
        let failure = Self::classify_governance_error(err);
        self.telemetry.record_failure(failure.code, false);
        failure
    }

    fn parse_id<T>(&self, raw: &str) -> Result<T, ServiceFailure>
    where
        T: FromStr<Err = GovernanceError>,
    {
        raw.parse().map_err(|err| self.reject(&err))
    }

    fn classify_governance_error(err: &GovernanceError) -> ServiceFailure {
        let status = match err {
            GovernanceError::UnknownParameter(_)
            | GovernanceError::SuggestionNotFound(_)
            | GovernanceError::PolicyNotFound(_)
            | GovernanceError::HistoryRecordNotFound(_) => StatusCode::NOT_FOUND,
            GovernanceError::SuggestionClosed(_)
            | GovernanceError::ConcurrentCloseConflict(_)
            | GovernanceError::ParameterExists(_) => StatusCode::CONFLICT,
            GovernanceError::InvalidChoice(_)
            | GovernanceError::InvalidValue { .. }
            | GovernanceError::ParameterNotEditable(_)
            | GovernanceError::Validation(_) => StatusCode::BAD_REQUEST,
            GovernanceError::Unauthorized { .. } => StatusCode::FORBIDDEN,
            GovernanceError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
            GovernanceError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let details = match err {
            GovernanceError::Unauthorized { actor, action } => {
                Some(json!({ "actor": actor, "action": action }))
            }
            GovernanceError::InvalidValue { parameter_id, .. }
            | GovernanceError::ParameterNotEditable(parameter_id)
            | GovernanceError::UnknownParameter(parameter_id) => {
                Some(json!({ "parameter_id": parameter_id }))
            }
            _ => None,
        };

        Self::failure(status, err.kind(), err.to_string(), details)
    }

    /// Runs a read under the operation timeout.
    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(GovernanceApi) -> Result<T, GovernanceError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result =
            tokio::time::timeout(self.operation_timeout, handle).await.map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                warn!(operation = operation_label, "operation timed out");
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;
        self.settle(operation_label, join_result)
    }

    /// Runs a write to completion, with no timeout, so the response always
    /// matches whether the write committed.
    async fn run_write<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(GovernanceApi) -> Result<T, GovernanceError> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let join_result = tokio::task::spawn_blocking(move || op(api)).await;
        self.settle(operation_label, join_result)
    }

    fn settle<T>(
        &self,
        operation_label: &'static str,
        join_result: Result<Result<T, GovernanceError>, tokio::task::JoinError>,
    ) -> Result<T, ServiceFailure> {
        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            error!(operation = operation_label, error = %err, "blocking task failed");
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry.requests_success_total.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_governance_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "invalid_json" | "invalid_query" => &self.invalid_request_total,
            "validation_error" | "invalid_choice" | "invalid_value" | "parameter_not_editable" => {
                &self.validation_error_total
            }
            "unknown_parameter"
            | "suggestion_not_found"
            | "policy_not_found"
            | "history_record_not_found" => &self.not_found_total,
            "suggestion_closed" | "concurrent_close_conflict" | "parameter_exists" => {
                &self.conflict_total
            }
            "unauthorized" => &self.unauthorized_total,
            "storage_error" | "schema_unavailable" => &self.storage_unavailable_total,
            "internal_error" => &self.internal_error_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_request_total: self.invalid_request_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            unauthorized_total: self.unauthorized_total.load(Ordering::Relaxed),
            storage_unavailable_total: self.storage_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope { service_contract_version: SERVICE_CONTRACT_VERSION, data }
}

type Reply<T> = Result<Json<ServiceEnvelope<T>>, ServiceFailure>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/parameters", get(parameters_list))
        .route("/v1/parameters/:parameter_id", get(parameter_show))
        .route("/v1/suggestions", get(suggestions_list).post(suggestion_submit))
        .route("/v1/suggestions/:suggestion_id", get(suggestion_show))
        .route("/v1/suggestions/:suggestion_id/votes", post(vote_cast))
        .route("/v1/suggestions/:suggestion_id/tally", get(vote_tally))
        .route(
            "/v1/suggestions/:suggestion_id/comments",
            get(comments_list).post(comment_post),
        )
        .route("/v1/suggestions/:suggestion_id/close", post(suggestion_close))
        .route("/v1/suggestions/:suggestion_id/withdraw", post(suggestion_withdraw))
        .route("/v1/history", get(history_list))
        .route("/v1/history/:record_id", get(history_show))
        .route("/v1/policies", get(policies_list))
        .route("/v1/policies/changes", get(policy_changes))
        .route("/v1/admin/parameters", post(admin_register_parameter))
        .route("/v1/admin/parameters/:parameter_id", post(admin_set_parameter))
        .route("/v1/admin/rollback", post(admin_rollback))
        .route("/v1/admin/policies", post(admin_create_policy))
        .route("/v1/admin/policies/:policy_id", post(admin_update_policy))
        .route("/v1/admin/policies/:policy_id/delete", post(admin_delete_policy))
        .route("/v1/admin/sweep", post(admin_sweep))
        .with_state(state)
}

fn init_logging(level: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Periodically closes suggestions whose voting deadline has passed.
fn spawn_sweeper(api: GovernanceApi, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let api = api.clone();
            match tokio::task::spawn_blocking(move || api.sweep_expired()).await {
                Ok(Ok(report)) => {
                    if !report.resolved.is_empty() || report.conflicts > 0 || report.failures > 0 {
                        info!(
                            resolved = report.resolved.len(),
                            already_closed = report.already_closed,
                            conflicts = report.conflicts,
                            failures = report.failures,
                            "deadline sweep finished"
                        );
                    }
                }
                Ok(Err(err)) => warn!(code = err.kind(), error = %err, "deadline sweep failed"),
                Err(err) => error!(error = %err, "deadline sweep task failed"),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    let config = load_config(&args.config)?;
    let api = GovernanceApi::new(args.db.clone(), config)?;
    let migrate_api = api.clone();
    tokio::task::spawn_blocking(move || migrate_api.migrate()).await??;

    if args.sweep_interval_secs > 0 {
        spawn_sweeper(api.clone(), Duration::from_secs(args.sweep_interval_secs));
    }

    let state = ServiceState {
        api,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!(bind = %args.bind, db = %args.db.display(), "governance service listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(State(state): State<ServiceState>) -> Reply<ReadinessResponse> {
    let schema_ready = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "schema_unavailable",
            "schema_ready",
            |api| api.schema_ready(),
        )
        .await?;

    if schema_ready {
        return Ok(Json(envelope(ReadinessResponse { status: "ready", schema_ready })));
    }

    state.telemetry.record_failure("schema_unavailable", false);
    Err(ServiceState::failure(
        StatusCode::SERVICE_UNAVAILABLE,
        "schema_unavailable",
        "database schema is not migrated",
        Some(json!({ "schema_ready": false })),
    ))
}

async fn parameters_list(State(state): State<ServiceState>) -> Reply<Vec<ConfigParameter>> {
    let parameters = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "list_parameters", |api| {
            api.list_parameters()
        })
        .await?;
    Ok(Json(envelope(parameters)))
}

async fn parameter_show(
    State(state): State<ServiceState>,
    Path(parameter_id): Path<String>,
) -> Reply<ConfigParameter> {
    let parameter = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "get_parameter",
            move |api| api.get_parameter(&parameter_id),
        )
        .await?;
    Ok(Json(envelope(parameter)))
}

async fn suggestions_list(
    State(state): State<ServiceState>,
    query: Result<Query<SuggestionListQuery>, QueryRejection>,
) -> Reply<Vec<SuggestionView>> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let filter = match query.state.as_deref() {
        None => Some(SuggestionState::Open),
        Some("all") => None,
        Some(raw) => Some(SuggestionState::parse(raw).ok_or_else(|| {
            state.reject(&GovernanceError::Validation(format!(
                "unknown suggestion state: {raw:?}"
            )))
        })?),
    };

    let suggestions = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "list_suggestions",
            move |api| api.list_suggestions(filter),
        )
        .await?;
    Ok(Json(envelope(suggestions)))
}

async fn suggestion_submit(
    State(state): State<ServiceState>,
    payload: Result<Json<SubmitSuggestion>, JsonRejection>,
) -> Reply<SuggestionView> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let view = state
        .run_write(
            "submit_suggestion",
            move |api| api.submit_suggestion(&request),
        )
        .await?;
    Ok(Json(envelope(view)))
}

async fn suggestion_show(
    State(state): State<ServiceState>,
    Path(suggestion_id): Path<String>,
) -> Reply<SuggestionDetail> {
    let suggestion_id: SuggestionId = state.parse_id(&suggestion_id)?;
    let detail = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "get_suggestion",
            move |api| api.get_suggestion(suggestion_id),
        )
        .await?;
    Ok(Json(envelope(detail)))
}

async fn vote_cast(
    State(state): State<ServiceState>,
    Path(suggestion_id): Path<String>,
    payload: Result<Json<CastVoteRequest>, JsonRejection>,
) -> Reply<Tally> {
    let suggestion_id: SuggestionId = state.parse_id(&suggestion_id)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let tally = state
        .run_write("cast_vote", move |api| {
            api.cast_vote(suggestion_id, &request.voter, &request.choice)
        })
        .await?;
    Ok(Json(envelope(tally)))
}

async fn vote_tally(
    State(state): State<ServiceState>,
    Path(suggestion_id): Path<String>,
) -> Reply<Tally> {
    let suggestion_id: SuggestionId = state.parse_id(&suggestion_id)?;
    let tally = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "tally", move |api| {
            api.tally(suggestion_id)
        })
        .await?;
    Ok(Json(envelope(tally)))
}

async fn comments_list(
    State(state): State<ServiceState>,
    Path(suggestion_id): Path<String>,
) -> Reply<Vec<Comment>> {
    let suggestion_id: SuggestionId = state.parse_id(&suggestion_id)?;
    let comments = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "list_comments",
            move |api| api.list_comments(suggestion_id),
        )
        .await?;
    Ok(Json(envelope(comments)))
}

async fn comment_post(
    State(state): State<ServiceState>,
    Path(suggestion_id): Path<String>,
    payload: Result<Json<PostCommentRequest>, JsonRejection>,
) -> Reply<Comment> {
    let suggestion_id: SuggestionId = state.parse_id(&suggestion_id)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let comment = state
        .run_write(
            "post_comment",
            move |api| api.post_comment(suggestion_id, &request.author, &request.text),
        )
        .await?;
    Ok(Json(envelope(comment)))
}

async fn suggestion_close(
    State(state): State<ServiceState>,
    Path(suggestion_id): Path<String>,
    payload: Result<Json<CloseRequest>, JsonRejection>,
) -> Reply<ResolutionReport> {
    let suggestion_id: SuggestionId = state.parse_id(&suggestion_id)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_write(
            "close_suggestion",
            move |api| api.close_suggestion(suggestion_id, &request.actor, request.decision),
        )
        .await?;
    Ok(Json(envelope(report)))
}

async fn suggestion_withdraw(
    State(state): State<ServiceState>,
    Path(suggestion_id): Path<String>,
    payload: Result<Json<ActorRequest>, JsonRejection>,
) -> Reply<ResolutionReport> {
    let suggestion_id: SuggestionId = state.parse_id(&suggestion_id)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let report = state
        .run_write("withdraw", move |api| {
            api.withdraw(suggestion_id, &request.actor)
        })
        .await?;
    Ok(Json(envelope(report)))
}

async fn history_list(
    State(state): State<ServiceState>,
    query: Result<Query<HistoryListQuery>, QueryRejection>,
) -> Reply<Vec<HistoryRecord>> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let parse_bound = |raw: Option<&str>| {
        raw.map(parse_rfc3339_utc).transpose().map_err(|err| state.reject(&err))
    };
    let history_query = HistoryQuery {
        parameter_id: query.parameter_id,
        from: parse_bound(query.from.as_deref())?,
        to: parse_bound(query.to.as_deref())?,
        limit: query.limit,
    };

    let records = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "list_history",
            move |api| api.list_history(&history_query),
        )
        .await?;
    Ok(Json(envelope(records)))
}

async fn history_show(
    State(state): State<ServiceState>,
    Path(record_id): Path<String>,
) -> Reply<HistoryRecord> {
    let record_id: RecordId = state.parse_id(&record_id)?;
    let record = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "get_history_record",
            move |api| api.get_history_record(record_id),
        )
        .await?;
    Ok(Json(envelope(record)))
}

async fn policies_list(State(state): State<ServiceState>) -> Reply<Vec<Policy>> {
    let policies = state
        .run_blocking(StatusCode::INTERNAL_SERVER_ERROR, "query_failed", "list_policies", |api| {
            api.list_policies()
        })
        .await?;
    Ok(Json(envelope(policies)))
}

async fn policy_changes(
    State(state): State<ServiceState>,
    query: Result<Query<PolicyChangesQuery>, QueryRejection>,
) -> Reply<Vec<PolicyChangeRecord>> {
    let Query(query) = query.map_err(|rejection| state.invalid_query_with_telemetry(&rejection))?;
    let policy_id = match query.policy_id.as_deref() {
        Some(raw) => Some(state.parse_id::<PolicyId>(raw)?),
        None => None,
    };
    let changes = state
        .run_blocking(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_failed",
            "list_policy_changes",
            move |api| api.list_policy_changes(policy_id),
        )
        .await?;
    Ok(Json(envelope(changes)))
}

async fn admin_register_parameter(
    State(state): State<ServiceState>,
    payload: Result<Json<RegisterParameterRequest>, JsonRejection>,
) -> Reply<ParameterChange> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let change = state
        .run_write(
            "register_parameter",
            move |api| api.register_parameter(&request.definition, &request.actor),
        )
        .await?;
    Ok(Json(envelope(change)))
}

async fn admin_set_parameter(
    State(state): State<ServiceState>,
    Path(parameter_id): Path<String>,
    payload: Result<Json<SetParameterRequest>, JsonRejection>,
) -> Reply<ParameterChange> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let change = state
        .run_write(
            "set_parameter",
            move |api| api.set_parameter(&parameter_id, &request.value, &request.actor),
        )
        .await?;
    Ok(Json(envelope(change)))
}

async fn admin_rollback(
    State(state): State<ServiceState>,
    payload: Result<Json<RollbackRequest>, JsonRejection>,
) -> Reply<ParameterChange> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let change = state
        .run_write("rollback", move |api| {
            api.rollback(request.record_id, &request.actor)
        })
        .await?;
    Ok(Json(envelope(change)))
}

async fn admin_create_policy(
    State(state): State<ServiceState>,
    payload: Result<Json<PolicyRequest>, JsonRejection>,
) -> Reply<Policy> {
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let policy = state
        .run_write(
            "create_policy",
            move |api| api.create_policy(&request.policy, &request.actor),
        )
        .await?;
    Ok(Json(envelope(policy)))
}

async fn admin_update_policy(
    State(state): State<ServiceState>,
    Path(policy_id): Path<String>,
    payload: Result<Json<PolicyRequest>, JsonRejection>,
) -> Reply<Policy> {
    let policy_id: PolicyId = state.parse_id(&policy_id)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let policy = state
        .run_write(
            "update_policy",
            move |api| api.update_policy(policy_id, &request.policy, &request.actor),
        )
        .await?;
    Ok(Json(envelope(policy)))
}

async fn admin_delete_policy(
    State(state): State<ServiceState>,
    Path(policy_id): Path<String>,
    payload: Result<Json<ActorRequest>, JsonRejection>,
) -> Reply<PolicyChangeRecord> {
    let policy_id: PolicyId = state.parse_id(&policy_id)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let change = state
        .run_write(
            "delete_policy",
            move |api| api.delete_policy(policy_id, &request.actor),
        )
        .await?;
    Ok(Json(envelope(change)))
}

async fn admin_sweep(State(state): State<ServiceState>) -> Reply<SweepReport> {
    let report = state
        .run_write("sweep_expired", |api| {
            api.sweep_expired()
        })
        .await?;
    Ok(Json(envelope(report)))
}
