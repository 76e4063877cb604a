use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use super::{ApiResponse, forge_error, internal, not_found, ok, optional_body};
use crate::core::forge::{StartRunOptions, StartedRun};

const DEFAULT_ACTOR: &str = "admin";

#[derive(Deserialize)]
pub struct ListRunsQuery {
    limit: Option<usize>,
}

pub async fn list_runs_endpoint(
    Path(agent): Path<String>,
    Query(query): Query<ListRunsQuery>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_agent(&agent).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("agent", &agent),
        Err(e) => return internal(e),
    }
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    match state.store.list_runs(&agent, limit).await {
        Ok(runs) => ok(json!({ "success": true, "runs": runs })),
        Err(e) => internal(e),
    }
}

/// 202 when the run took the lock, 409 when another run holds it.
fn started_response(started: StartedRun) -> ApiResponse {
    if started.accepted {
        (
            StatusCode::ACCEPTED,
            Json(json!({ "success": true, "run": started.run })),
        )
    } else {
        let reason = started
            .run
            .error
            .clone()
            .unwrap_or_else(|| "agent is locked by another run".to_string());
        (
            StatusCode::CONFLICT,
            Json(json!({ "success": false, "error": reason, "run": started.run })),
        )
    }
}

pub async fn start_run_endpoint(
    Path(agent): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResponse {
    let opts = match optional_body::<StartRunOptions>(&body) {
        Ok(opts) => opts,
        Err(resp) => return resp,
    };
    match state.runner.start_run(&agent, opts).await {
        Ok(started) => started_response(started),
        Err(e) => forge_error(e),
    }
}

#[derive(Deserialize)]
pub struct RunDetailQuery {
    include: Option<String>,
}

pub async fn get_run_endpoint(
    Path(run_id): Path<String>,
    Query(query): Query<RunDetailQuery>,
    State(state): State<AppState>,
) -> ApiResponse {
    let run = match state.store.get_run(&run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => return not_found("run", &run_id),
        Err(e) => return internal(e),
    };
    let with_eval = query
        .include
        .as_deref()
        .is_some_and(|inc| inc.split(',').any(|part| part.trim() == "eval"));
    if !with_eval {
        return ok(json!({ "success": true, "run": run }));
    }
    match state.store.list_evaluations(&run_id, None).await {
        Ok(evaluations) => ok(json!({ "success": true, "run": run, "evaluations": evaluations })),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActorRequest {
    requested_by: Option<String>,
}

pub async fn stop_run_endpoint(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResponse {
    let req = match optional_body::<ActorRequest>(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let actor = req.requested_by.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
    match state.runner.stop_run(&run_id, &actor).await {
        Ok(run) => ok(json!({ "success": true, "run": run })),
        Err(e) => forge_error(e),
    }
}

pub async fn decisions_endpoint(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_run(&run_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("run", &run_id),
        Err(e) => return internal(e),
    }
    match state.store.list_decisions(&run_id).await {
        Ok(decisions) => ok(json!({ "success": true, "decisions": decisions })),
        Err(e) => internal(e),
    }
}

#[derive(Deserialize)]
pub struct SelfTestQuery {
    iteration: Option<u32>,
}

pub async fn self_tests_endpoint(
    Path(run_id): Path<String>,
    Query(query): Query<SelfTestQuery>,
    State(state): State<AppState>,
) -> ApiResponse {
    match state.store.get_run(&run_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("run", &run_id),
        Err(e) => return internal(e),
    }
    match state.store.list_evaluations(&run_id, query.iteration).await {
        Ok(results) => ok(json!({ "success": true, "results": results })),
        Err(e) => internal(e),
    }
}

pub async fn replay_self_tests_endpoint(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResponse {
    let req = match optional_body::<ActorRequest>(&body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let actor = req.requested_by.unwrap_or_else(|| DEFAULT_ACTOR.to_string());
    match state.runner.replay_self_tests(&run_id, &actor).await {
        Ok(started) => started_response(started),
        Err(e) => forge_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRequest {
    from_seq: i64,
    requested_by: Option<String>,
}

pub async fn replay_endpoint(
    Path(run_id): Path<String>,
    State(state): State<AppState>,
    Json(payload): Json<ReplayRequest>,
) -> ApiResponse {
    let actor = payload
        .requested_by
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string());
    match state
        .runner
        .replay_from_checkpoint(&run_id, payload.from_seq, &actor)
        .await
    {
        Ok(started) => started_response(started),
        Err(e) => forge_error(e),
    }
}
