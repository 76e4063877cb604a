use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::auth;
use super::handlers::{
    agents, events, health, history, instructions, runs, scheduler, snapshots,
};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // Liveness probes stay reachable without the admin token
    let public_routes = Router::new()
        .route("/api/health", get(health::health_endpoint))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let authed_routes = Router::new()
        .route(
            "/api/agents",
            get(agents::get_agents).post(agents::create_agent_endpoint),
        )
        .route(
            "/api/agents/{agent}",
            get(agents::get_agent_endpoint).patch(agents::update_agent_endpoint),
        )
        .route("/api/agents/{agent}/mode", post(agents::set_mode_endpoint))
        .route(
            "/api/agents/{agent}/runs",
            get(runs::list_runs_endpoint).post(runs::start_run_endpoint),
        )
        .route("/api/runs/{run}", get(runs::get_run_endpoint))
        .route("/api/runs/{run}/stop", post(runs::stop_run_endpoint))
        .route("/api/runs/{run}/events", get(events::list_events_endpoint))
        .route(
            "/api/runs/{run}/events/stream",
            get(events::stream_events_endpoint),
        )
        .route("/api/runs/{run}/decisions", get(runs::decisions_endpoint))
        .route("/api/runs/{run}/self-tests", get(runs::self_tests_endpoint))
        .route(
            "/api/runs/{run}/self-tests/replay",
            post(runs::replay_self_tests_endpoint),
        )
        .route("/api/runs/{run}/replay", post(runs::replay_endpoint))
        .route(
            "/api/runs/{run}/snapshots",
            get(snapshots::list_run_snapshots),
        )
        .route("/api/snapshots/{id}", get(snapshots::get_snapshot_endpoint))
        .route(
            "/api/snapshots/{id}/unmask",
            post(snapshots::unmask_snapshot_endpoint),
        )
        .route(
            "/api/scheduler/process-now",
            post(scheduler::process_now_endpoint),
        )
        .route(
            "/api/instructions",
            post(instructions::create_instruction_endpoint),
        )
        .route(
            "/api/instructions/{id}",
            get(instructions::get_instruction_endpoint)
                .patch(instructions::update_instruction_endpoint),
        )
        .route(
            "/api/instructions/{id}/versions",
            get(instructions::list_versions_endpoint),
        )
        .route(
            "/api/history/messages",
            post(history::import_messages_endpoint),
        )
        .route("/api/logs", get(super::sse_logs_endpoint))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state.clone());

    public_routes.merge(authed_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::forge::history::StoreHistoryReader;
    use crate::core::forge::types::Phase;
    use crate::core::forge::{
        ForgeRunner, ForgeScheduler, RunType, RunnerSettings, SchedulerSettings,
    };
    use crate::core::store::test_store;
    use crate::core::store::types::{AgentProfileInput, NewRun};
    use axum::http::StatusCode;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use tower::util::ServiceExt;

    fn empty_state() -> AppState {
        let store = test_store();
        let runner = ForgeRunner::new(
            store.clone(),
            Arc::new(StoreHistoryReader::new(store.clone())),
            None,
            RunnerSettings::default(),
        );
        let scheduler = ForgeScheduler::new(runner.clone(), SchedulerSettings::default());
        let (log_tx, _) = tokio::sync::broadcast::channel(16);

        AppState {
            store,
            runner,
            scheduler,
            log_tx,
            api_host: "127.0.0.1".to_string(),
            api_port: 17900,
            admin_token_hash: None,
        }
    }

    async fn json_request(
        app: Router,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let body = match body {
            Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
            None => Body::empty(),
        };

        let req = Request::builder()
            .method(method)
            .uri(path)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let body_bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::json!({}));
        (status, json)
    }

    async fn seeded_agent(state: &AppState) -> String {
        state
            .store
            .create_agent(&AgentProfileInput {
                name: Some("Support bot".into()),
                managed_sources: Some(vec!["facebook:page-1".into()]),
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_api_router(empty_state());
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/agents")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();

        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
        assert!(
            resp.headers()
                .get("content-security-policy")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("default-src 'self'")
        );
    }

    #[tokio::test]
    async fn health_is_public_even_with_token() {
        let mut state = empty_state();
        state.api_host = "0.0.0.0".to_string();
        state.admin_token_hash = Some(auth::token_digest("s3cret"));

        let (status, json) =
            json_request(build_api_router(state.clone()), Method::GET, "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");

        let (status, _) =
            json_request(build_api_router(state), Method::GET, "/api/agents", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_then_fetch_agent() {
        let state = empty_state();
        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            "/api/agents",
            Some(json!({
                "name": "Support bot",
                "managedSources": ["facebook:page-1", "facebook:page-1"],
                "cadenceDays": 2
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["agent"]["id"].as_str().unwrap().to_string();
        assert_eq!(json["agent"]["managedSources"], json!(["facebook:page-1"]));

        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::GET,
            &format!("/api/agents/{}", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["agent"]["cadenceDays"], 2);

        let (status, json) =
            json_request(build_api_router(state), Method::GET, "/api/agents", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["agents"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn create_agent_without_name_is_bad_request() {
        let (status, json) = json_request(
            build_api_router(empty_state()),
            Method::POST,
            "/api/agents",
            Some(json!({ "cadenceDays": 2 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn mode_endpoint_toggles_without_body() {
        let state = empty_state();
        let id = seeded_agent(&state).await;
        let path = format!("/api/agents/{}/mode", id);

        let (status, json) =
            json_request(build_api_router(state.clone()), Method::POST, &path, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "ai-live-reply");

        let (_, json) = json_request(
            build_api_router(state),
            Method::POST,
            &path,
            Some(json!({ "mode": "ai-live-reply" })),
        )
        .await;
        assert_eq!(json["mode"], "ai-live-reply");
    }

    #[tokio::test]
    async fn start_run_returns_202() {
        let state = empty_state();
        let id = seeded_agent(&state).await;
        let (status, json) = json_request(
            build_api_router(state),
            Method::POST,
            &format!("/api/agents/{}/runs", id),
            Some(json!({ "dryRun": true, "maxIterations": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["success"], true);
        assert_eq!(json["run"]["dryRun"], true);
    }

    #[tokio::test]
    async fn start_run_on_locked_agent_returns_409() {
        let state = empty_state();
        let id = seeded_agent(&state).await;
        let holder = state
            .store
            .create_run(&NewRun {
                agent_id: id.clone(),
                run_type: RunType::Manual,
                dry_run: false,
                scheduled_for: None,
                max_iterations: 1,
                batch_size: 10,
                max_messages: 10,
                metadata: json!({}),
            })
            .await
            .unwrap();
        state
            .store
            .acquire_lock(&id, &holder.id, "someone-else")
            .await
            .unwrap();

        let (status, json) = json_request(
            build_api_router(state),
            Method::POST,
            &format!("/api/agents/{}/runs", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["run"]["status"], "rejected_concurrent");
    }

    #[tokio::test]
    async fn start_run_for_unknown_agent_is_404() {
        let (status, _) = json_request(
            build_api_router(empty_state()),
            Method::POST,
            "/api/agents/nope/runs",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_run_endpoints_are_404() {
        let state = empty_state();
        for path in [
            "/api/runs/missing",
            "/api/runs/missing/events",
            "/api/runs/missing/decisions",
            "/api/runs/missing/self-tests",
            "/api/runs/missing/snapshots",
            "/api/snapshots/missing",
        ] {
            let (status, _) =
                json_request(build_api_router(state.clone()), Method::GET, path, None).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{}", path);
        }
        let (status, _) = json_request(
            build_api_router(state),
            Method::POST,
            "/api/runs/missing/stop",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn events_poll_after_seq() {
        let state = empty_state();
        let id = seeded_agent(&state).await;
        let run = state
            .store
            .create_run(&NewRun {
                agent_id: id,
                run_type: RunType::Manual,
                dry_run: true,
                scheduled_for: None,
                max_iterations: 1,
                batch_size: 10,
                max_messages: 10,
                metadata: json!({}),
            })
            .await
            .unwrap();
        for i in 0..3 {
            state
                .store
                .append_event(&run.id, Phase::Runtime, "note", json!({ "i": i }))
                .await
                .unwrap();
        }

        let (status, json) = json_request(
            build_api_router(state),
            Method::GET,
            &format!("/api/runs/{}/events?afterSeq=1&limit=10", run.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let seqs: Vec<i64> = json["events"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![2, 3]);
        assert_eq!(json["nextSeq"], 3);
    }

    #[tokio::test]
    async fn replay_of_non_checkpoint_is_404() {
        let state = empty_state();
        let id = seeded_agent(&state).await;
        let run = state
            .store
            .create_run(&NewRun {
                agent_id: id,
                run_type: RunType::Manual,
                dry_run: true,
                scheduled_for: None,
                max_iterations: 1,
                batch_size: 10,
                max_messages: 10,
                metadata: json!({}),
            })
            .await
            .unwrap();
        state
            .store
            .append_event(&run.id, Phase::Runtime, "note", json!({}))
            .await
            .unwrap();

        let (status, _) = json_request(
            build_api_router(state),
            Method::POST,
            &format!("/api/runs/{}/replay", run.id),
            Some(json!({ "fromSeq": 1 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn self_test_replay_without_patch_is_400() {
        let state = empty_state();
        let id = seeded_agent(&state).await;
        let run = state
            .store
            .create_run(&NewRun {
                agent_id: id,
                run_type: RunType::Manual,
                dry_run: true,
                scheduled_for: None,
                max_iterations: 1,
                batch_size: 10,
                max_messages: 10,
                metadata: json!({}),
            })
            .await
            .unwrap();
        let (status, _) = json_request(
            build_api_router(state),
            Method::POST,
            &format!("/api/runs/{}/self-tests/replay", run.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn process_now_for_unknown_agent_is_404() {
        let (status, _) = json_request(
            build_api_router(empty_state()),
            Method::POST,
            "/api/scheduler/process-now",
            Some(json!({ "agentId": "missing" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn instruction_versions_track_edits() {
        let state = empty_state();
        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            "/api/instructions",
            Some(json!({
                "name": "Shop assistant",
                "blocks": [{ "key": "base", "title": "Base", "content": "Be kind." }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = json["instruction"]["id"].as_str().unwrap().to_string();

        let edit = json!({
            "expectedVersion": 1,
            "blocks": [{ "key": "base", "title": "Base", "content": "Be brief." }]
        });
        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::PATCH,
            &format!("/api/instructions/{}", id),
            Some(edit.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["version"], 2);

        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::PATCH,
            &format!("/api/instructions/{}", id),
            Some(edit),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["actualVersion"], 2);

        let (_, json) = json_request(
            build_api_router(state),
            Method::GET,
            &format!("/api/instructions/{}/versions", id),
            None,
        )
        .await;
        assert_eq!(json["versions"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unmask_requires_actor() {
        let (status, _) = json_request(
            build_api_router(empty_state()),
            Method::POST,
            "/api/snapshots/any/unmask",
            Some(json!({ "actor": "  " })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn history_import_skips_duplicates() {
        let state = empty_state();
        let body = json!({
            "messages": [{
                "messageId": "m1",
                "source": "facebook:page-1",
                "counterpartyId": "cust-a",
                "role": "user",
                "text": "Do you ship abroad?",
                "sentAt": "2026-07-01T10:00:00Z"
            }]
        });
        let (status, json) = json_request(
            build_api_router(state.clone()),
            Method::POST,
            "/api/history/messages",
            Some(body.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["inserted"], 1);

        let (_, json) = json_request(
            build_api_router(state),
            Method::POST,
            "/api/history/messages",
            Some(body),
        )
        .await;
        assert_eq!(json["inserted"], 0);
    }

    /// Every documented route must be mounted: an unsupported method on a
    /// mounted path yields 405, never 404.
    #[tokio::test]
    async fn route_contract_all_paths_mounted() {
        let paths = [
            "/api/agents",
            "/api/agents/a1",
            "/api/agents/a1/mode",
            "/api/agents/a1/runs",
            "/api/runs/r1",
            "/api/runs/r1/stop",
            "/api/runs/r1/events",
            "/api/runs/r1/events/stream",
            "/api/runs/r1/decisions",
            "/api/runs/r1/self-tests",
            "/api/runs/r1/self-tests/replay",
            "/api/runs/r1/replay",
            "/api/runs/r1/snapshots",
            "/api/snapshots/s1",
            "/api/snapshots/s1/unmask",
            "/api/scheduler/process-now",
            "/api/instructions",
            "/api/instructions/i1",
            "/api/instructions/i1/versions",
            "/api/history/messages",
            "/api/logs",
            "/api/health",
        ];
        let state = empty_state();
        let mut unmounted = HashSet::new();
        for path in paths {
            let req = Request::builder()
                .method(Method::PUT)
                .uri(path)
                .body(Body::empty())
                .unwrap();
            let resp = build_api_router(state.clone()).oneshot(req).await.unwrap();
            if resp.status() == StatusCode::NOT_FOUND {
                unmounted.insert(path);
            }
        }
        assert!(unmounted.is_empty(), "unmounted routes: {:?}", unmounted);
    }

    #[tokio::test]
    async fn method_not_allowed_returns_405() {
        let req = Request::builder()
            .method(Method::DELETE)
            .uri("/api/agents")
            .body(Body::empty())
            .unwrap();
        let resp = build_api_router(empty_state()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
