//! Live job progress over Server-Sent Events.
//!
//! Event names: `status` (snapshot on connect), `progress`, `complete`,
//! `error` and `heartbeat`. The stream ends after `complete` or `error`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Extension, Path},
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse,
    },
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use fetchq_core::{JobEvent, JobEventKind, JobId};
use fetchq_infra::jobs::Subscription;

use crate::app::errors;
use crate::app::services::AppServices;

type SseSender = UnboundedSender<Result<SseEvent, Infallible>>;

/// GET /jobs/:id/events
pub async fn stream_job_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let Ok(job_id) = id.parse::<JobId>() else {
        return errors::not_found();
    };

    // Subscribe before reading the record so nothing between the snapshot
    // and the first live event is missed.
    let subscription = match services.orchestrator.subscribe(job_id).await {
        Ok(sub) => sub,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };
    let record = match services.orchestrator.get_job(job_id).await {
        Ok(record) => record,
        Err(e) => {
            subscription.unsubscribe();
            return errors::orchestrator_error_to_response(e);
        }
    };

    let (tx, rx) = unbounded_channel();

    let snapshot = JobEvent::from_record(&record);
    let finished = snapshot.iter().any(JobEvent::closes_stream);
    for event in &snapshot {
        if let Some(sse) = to_sse(event) {
            let _ = tx.send(Ok(sse));
        }
    }

    if finished {
        subscription.unsubscribe();
    } else {
        tokio::spawn(forward(subscription, tx, services.stream.keepalive, record.progress));
    }

    Sse::new(UnboundedReceiverStream::new(rx)).into_response()
}

/// Relay live events until the job finishes, the subscription goes idle, or
/// the client disconnects. `seen` is the progress the snapshot reported.
async fn forward(mut subscription: Subscription, tx: SseSender, keepalive: Duration, mut seen: u8) {
    let job_id = subscription.job_id();
    let mut heartbeat = interval_at(Instant::now() + keepalive, keepalive);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!(%job_id, "event stream client disconnected");
                break;
            }
            event = subscription.next() => {
                let Some(event) = event else { break };
                if is_stale(&event.kind, &mut seen) {
                    debug!(%job_id, seen, "dropping stale progress");
                    continue;
                }
                if let Some(sse) = to_sse(&event) {
                    if tx.send(Ok(sse)).is_err() {
                        break;
                    }
                }
                if event.closes_stream() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let beat = SseEvent::default()
                    .event("heartbeat")
                    .data(json!({ "at": Utc::now() }).to_string());
                if tx.send(Ok(beat)).is_err() {
                    break;
                }
            }
        }
    }

    subscription.unsubscribe();
}

/// Progress published before the snapshot was read can arrive after it.
/// Such events never move an observer's progress backwards; a status event
/// (e.g. after a requeue) resets the baseline.
fn is_stale(kind: &JobEventKind, seen: &mut u8) -> bool {
    match kind {
        JobEventKind::Progress { progress } if *progress <= *seen => true,
        JobEventKind::Progress { progress } | JobEventKind::Status { progress, .. } => {
            *seen = *progress;
            false
        }
        JobEventKind::Completed { .. } | JobEventKind::Failed { .. } => false,
    }
}

fn event_name(kind: &JobEventKind) -> &'static str {
    match kind {
        JobEventKind::Status { .. } => "status",
        JobEventKind::Progress { .. } => "progress",
        JobEventKind::Completed { .. } => "complete",
        JobEventKind::Failed { .. } => "error",
    }
}

fn to_sse(event: &JobEvent) -> Option<SseEvent> {
    match serde_json::to_string(event) {
        Ok(data) => Some(SseEvent::default().event(event_name(&event.kind)).data(data)),
        Err(e) => {
            warn!(job_id = %event.job_id, error = %e, "failed to encode job event");
            None
        }
    }
}
