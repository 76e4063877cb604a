use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use super::super::AppState;
use super::{ApiResponse, internal, not_found, ok};

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const STREAM_BATCH: usize = 200;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    after_seq: Option<i64>,
    limit: Option<usize>,
}

pub async fn list_events_endpoint(
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> ApiResponse {
    let run = match state.store.get_run(&run_id).await {
        Ok(Some(run)) => run,
        Ok(None) => return not_found("run", &run_id),
        Err(e) => return internal(e),
    };
    let after_seq = query.after_seq.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.store.list_events(&run_id, after_seq, limit).await {
        Ok(events) => {
            let next_seq = events.last().map(|e| e.seq).unwrap_or(after_seq);
            ok(json!({
                "success": true,
                "status": run.status,
                "events": events,
                "nextSeq": next_seq,
            }))
        }
        Err(e) => internal(e),
    }
}

/// SSE feed of a run's events. Resumes after `Last-Event-ID` (or
/// `afterSeq`) and ends once the run is terminal and fully drained.
pub async fn stream_events_endpoint(
    Path(run_id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    match state.store.get_run(&run_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found("run", &run_id).into_response(),
        Err(e) => return internal(e).into_response(),
    }
    let resume_from = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .or(query.after_seq)
        .unwrap_or(0)
        .max(0);

    let store = state.store.clone();
    let stream = async_stream::stream! {
        let mut last_seq = resume_from;
        loop {
            let batch = match store.list_events(&run_id, last_seq, STREAM_BATCH).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!("Event stream for run {} failed: {}", run_id, e);
                    break;
                }
            };
            let drained = batch.len() < STREAM_BATCH;
            for event in batch {
                last_seq = event.seq;
                match serde_json::to_string(&event) {
                    Ok(data) => {
                        yield Ok::<Event, std::convert::Infallible>(
                            Event::default()
                                .id(event.seq.to_string())
                                .event(event.event_type.clone())
                                .data(data),
                        );
                    }
                    Err(e) => warn!("Skipping unserializable event {}#{}: {}", run_id, event.seq, e),
                }
            }
            if !drained {
                continue;
            }
            let terminal = match store.get_run(&run_id).await {
                Ok(Some(run)) => run.status.is_terminal(),
                Ok(None) => true,
                Err(_) => true,
            };
            if terminal {
                // A terminal run may still gain audit events written right after its commit.
                let tail = store.list_events(&run_id, last_seq, STREAM_BATCH).await.unwrap_or_default();
                for event in tail {
                    last_seq = event.seq;
                    if let Ok(data) = serde_json::to_string(&event) {
                        yield Ok(Event::default().id(event.seq.to_string()).event(event.event_type.clone()).data(data));
                    }
                }
                yield Ok(Event::default().event("end").data(json!({"lastSeq": last_seq}).to_string()));
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("heartbeat"),
        )
        .into_response()
}
