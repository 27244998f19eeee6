//! Live event stream endpoint
//!
//! Serves the per-client event feed as `text/event-stream`. A subscriber
//! presenting `Last-Event-ID: k` first receives every persisted event with
//! `seq > k` in order, then live events from the bus. Because replay runs
//! after the bus subscription is taken, no committed event can fall between
//! the two phases; duplicates are filtered by sequence number instead.
//!
//! Each subscriber owns a bounded outbound queue. When a slow consumer
//! lets it fill up, the subscription is dropped and the client is expected
//! to reconnect with its last seen event id.

use super::{ApiState, AuthedClient};
use crate::db::EventQueries;
use crate::events::StreamEvent;
use axum::{
    extract::State,
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

/// Per-subscriber outbound queue capacity; a full queue disconnects the
/// subscriber
const OUTBOUND_QUEUE: usize = 64;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .id(event.seq.to_string())
        .event(event.event)
        .data(event.data.clone())
}

/// Open the live event stream for the authenticated client
pub async fn event_stream(
    State(state): State<ApiState>,
    AuthedClient(client): AuthedClient,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let last_event_id: i64 = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    // Subscribe before replaying so no committed event can slip between the
    // replay query and live delivery.
    let mut live_rx = state.app.bus.subscribe(client.id).await;
    let db = state.app.db.clone();
    let client_id = client.id;

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(OUTBOUND_QUEUE);

    tokio::spawn(async move {
        let mut last_sent = last_event_id;

        // Phase 1: replay persisted events the subscriber missed
        let replayed = match EventQueries::new(&db).replay(client_id, last_sent).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Event replay failed for client {}: {}", client_id, e);
                return;
            }
        };
        for event in &replayed {
            if tx.send(Ok(sse_event(&StreamEvent::from_model(event)))).await.is_err() {
                return; // client went away
            }
            last_sent = event.seq;
        }

        // Phase 2: live delivery
        loop {
            let event = match live_rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    // The bus overran this subscriber; the log bridges the gap
                    debug!(
                        "Stream for client {} lagged by {}, re-reading log",
                        client_id, skipped
                    );
                    let catch_up = match EventQueries::new(&db).replay(client_id, last_sent).await {
                        Ok(events) => events,
                        Err(e) => {
                            warn!("Catch-up replay failed for client {}: {}", client_id, e);
                            return;
                        }
                    };
                    for event in &catch_up {
                        if tx
                            .send(Ok(sse_event(&StreamEvent::from_model(event))))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        last_sent = event.seq;
                    }
                    continue;
                }
                Err(RecvError::Closed) => return,
            };

            // Replay may already have covered this event
            if event.seq <= last_sent {
                continue;
            }

            match tx.try_send(Ok(sse_event(&event))) {
                Ok(()) => last_sent = event.seq,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "Disconnecting slow event stream consumer for client {}",
                        client_id
                    );
                    return;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(
        KeepAlive::new()
            .interval(KEEPALIVE_INTERVAL)
            .event(Event::default().event("keepalive").data("{}")),
    )
}
