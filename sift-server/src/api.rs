use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use sift_core::breaker::Admission;
use sift_core::{Disposition, Error, Pipeline};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub admission: Arc<Admission>,
}

#[derive(Deserialize, Default)]
pub struct KeyParam {
    key: Option<String>,
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/loc/:name/events", post(submit_event))
        .route("/api/loc/:name/facts", post(add_fact))
        .route(
            "/api/loc/:name/facts/:id",
            get(get_fact).delete(rem_fact),
        )
        .route("/api/loc/:name/facts/search", post(search_facts))
        .route("/api/loc/:name/rules", post(add_rule).get(list_rules))
        .route("/api/loc/:name/rules/:id", axum::routing::delete(rem_rule))
        .route("/api/loc/:name/query", post(run_query))
        .route(
            "/api/loc/:name",
            axum::routing::delete(delete_location),
        )
        .route("/api/loc/:name/clear", post(clear_location))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> StatusCode {
    match state.pipeline.manager.health() {
        Ok(()) => StatusCode::OK,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn submit_event(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<KeyParam>,
    Json(event): Json<Value>,
) -> Response {
    let Value::Object(event) = event else {
        return bad_request("an event must be a map");
    };
    let guard = match state.admission.acquire() {
        Ok(guard) => guard,
        Err(err) => return error_response(&err),
    };
    let pipeline = Arc::clone(&state.pipeline);
    let result = tokio::task::spawn_blocking(move || {
        let _guard = guard;
        pipeline.process_event(&name, params.key.as_deref(), event)
    })
    .await;
    match result {
        Ok(Ok(walked)) => {
            let disposition = match walked.disposition() {
                Disposition::Complete => "complete",
                Disposition::Fatal => "fatal",
                Disposition::Nonfatal => "nonfatal",
                Disposition::Unknown => "unknown",
            };
            ok(json!({
                "disposition": disposition,
                "values": walked.values(),
                "errors": walked.errors(),
            }))
        }
        Ok(Err(err)) => error_response(&err),
        Err(err) => internal(&err.to_string()),
    }
}

#[derive(Deserialize)]
struct AddFactBody {
    id: Option<String>,
    fact: Value,
}

async fn add_fact(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<KeyParam>,
    Json(body): Json<AddFactBody>,
) -> Response {
    blocking(state, move |pipeline| {
        let loc = pipeline.manager.location(&name)?;
        let id = loc.add_fact(params.key.as_deref(), body.id.as_deref(), body.fact)?;
        Ok(json!({"id": id}))
    })
    .await
}

async fn get_fact(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(params): Query<KeyParam>,
) -> Response {
    blocking(state, move |pipeline| {
        let loc = pipeline.manager.location(&name)?;
        let fact = loc.get_fact(params.key.as_deref(), &id)?;
        Ok(Value::Object(fact))
    })
    .await
}

async fn rem_fact(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(params): Query<KeyParam>,
) -> Response {
    blocking(state, move |pipeline| {
        let loc = pipeline.manager.location(&name)?;
        let removed = loc.rem_fact(params.key.as_deref(), &id)?;
        Ok(Value::Object(removed))
    })
    .await
}

#[derive(Deserialize)]
struct SearchBody {
    pattern: Value,
    #[serde(default)]
    inherited: bool,
}

async fn search_facts(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<KeyParam>,
    Json(body): Json<SearchBody>,
) -> Response {
    blocking(state, move |pipeline| {
        let got = pipeline
            .manager
            .search(&name, params.key.as_deref(), &body.pattern, body.inherited)?;
        let results: Vec<Value> = got
            .results
            .iter()
            .map(|r| json!({"id": r.id, "bindings": r.bindings}))
            .collect();
        Ok(json!({
            "results": results,
            "checked": got.checked,
            "expired": got.expired,
            "elapsedMs": got.elapsed_ms,
        }))
    })
    .await
}

#[derive(Deserialize)]
struct AddRuleBody {
    id: Option<String>,
    rule: Value,
}

async fn add_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<KeyParam>,
    Json(body): Json<AddRuleBody>,
) -> Response {
    blocking(state, move |pipeline| {
        let loc = pipeline.manager.location(&name)?;
        let mut wrapper = Map::new();
        wrapper.insert("rule".into(), body.rule);
        let id = loc.add_fact(
            params.key.as_deref(),
            body.id.as_deref(),
            Value::Object(wrapper),
        )?;
        Ok(json!({"id": id}))
    })
    .await
}

async fn list_rules(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<KeyParam>,
) -> Response {
    blocking(state, move |pipeline| {
        let loc = pipeline.manager.location(&name)?;
        let ids = loc.list_rules(params.key.as_deref())?;
        Ok(json!({"rules": ids}))
    })
    .await
}

async fn rem_rule(
    State(state): State<AppState>,
    Path((name, id)): Path<(String, String)>,
    Query(params): Query<KeyParam>,
) -> Response {
    blocking(state, move |pipeline| {
        let loc = pipeline.manager.location(&name)?;
        loc.rem_fact(params.key.as_deref(), &id)?;
        Ok(json!({"removed": id}))
    })
    .await
}

async fn run_query(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<KeyParam>,
    Json(query): Json<Value>,
) -> Response {
    blocking(state, move |pipeline| {
        let location = pipeline.manager.location(&name)?;
        let parsed = sift_core::query::parse_query(&query)?;
        let ctx = sift_core::query::QueryCtx {
            manager: pipeline.manager.as_ref(),
            location: &location,
            read_key: params.key.as_deref(),
            runtime: &pipeline.runtime,
            fetcher: pipeline.fetcher.as_ref(),
        };
        let got = parsed.exec(&ctx, vec![sift_core::Bindings::new()])?;
        Ok(json!({"bindings": got}))
    })
    .await
}

async fn clear_location(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<KeyParam>,
) -> Response {
    blocking(state, move |pipeline| {
        pipeline.manager.location(&name)?.clear(params.key.as_deref())?;
        Ok(json!({"cleared": name}))
    })
    .await
}

async fn delete_location(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<KeyParam>,
) -> Response {
    blocking(state, move |pipeline| {
        pipeline.manager.delete(&name, params.key.as_deref())?;
        Ok(json!({"deleted": name}))
    })
    .await
}

type Response = (StatusCode, Json<Value>);

async fn blocking<F>(state: AppState, work: F) -> Response
where
    F: FnOnce(&Pipeline) -> sift_core::Result<Value> + Send + 'static,
{
    let pipeline = Arc::clone(&state.pipeline);
    match tokio::task::spawn_blocking(move || work(&pipeline)).await {
        Ok(Ok(value)) => ok(value),
        Ok(Err(err)) => error_response(&err),
        Err(err) => internal(&err.to_string()),
    }
}

fn ok(value: Value) -> Response {
    (StatusCode::OK, Json(value))
}

fn bad_request(message: &str) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

fn internal(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": message})),
    )
}

fn error_response(err: &Error) -> Response {
    (status_of(err), Json(json!({"error": err.to_string()})))
}

pub fn status_of(err: &Error) -> StatusCode {
    match err {
        Error::Syntax(_)
        | Error::BadPatternVariable(_)
        | Error::UnknownPattern(_)
        | Error::AncestorLoop(_)
        | Error::UnsupportedEndpoint(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) | Error::Expired(_) => StatusCode::NOT_FOUND,
        Error::Disabled(_) => StatusCode::FORBIDDEN,
        Error::CapacityExceeded(_) | Error::DuplicateId(_) => StatusCode::CONFLICT,
        Error::Throttled(_) | Error::TooMany => StatusCode::TOO_MANY_REQUESTS,
        Error::Http(_) => StatusCode::BAD_GATEWAY,
        Error::Script(_) | Error::ScriptTimeout(_) | Error::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
