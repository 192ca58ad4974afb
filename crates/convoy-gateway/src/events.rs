use crate::error::{ApiError, ApiResponse, ApiResult};
use crate::server::AppState;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use convoy_core::{ConvoyResult, Event, EventPriority, EventType};
use convoy_orchestrator::EventStream;
use convoy_security::{Identity, Role};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `POST /events/publish` body.
#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub event_type: String,
    /// Defaults to the caller's subject.
    pub source_agent: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub task_id: Option<Uuid>,
    pub trace_id: Option<Uuid>,
    pub priority: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Comma-separated event types. Empty means every type.
    pub types: Option<String>,
}

/// Parse a comma-separated list of event types.
pub fn parse_types(raw: Option<&str>) -> ConvoyResult<Vec<EventType>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

pub async fn publish(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    body: Result<Json<PublishRequest>, JsonRejection>,
) -> ApiResult<Event> {
    state.authorize(&identity, Role::Agent, "event.publish")?;
    let Json(body) = body?;
    let event_type: EventType = body.event_type.parse()?;
    let priority = body
        .priority
        .as_deref()
        .map(str::parse::<EventPriority>)
        .transpose()?;
    let source = body.source_agent.unwrap_or_else(|| identity.subject.clone());

    let event = state
        .events
        .publish(
            event_type,
            &source,
            body.payload,
            body.task_id,
            body.trace_id,
            priority,
        )
        .await?;
    debug!(event_id = %event.event_id, event_type = %event_type, source = %source, "Event published via API");
    Ok(ApiResponse::ok(event))
}

/// Upgrade to a WebSocket that pushes every matching bus event as JSON.
///
/// The subscription is opened before the upgrade so a bad `types` list or an
/// unreachable store is reported as a normal HTTP error.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    query: Result<Query<StreamQuery>, QueryRejection>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    state.authorize(&identity, Role::User, "event.stream")?;
    let Query(query) = query?;
    let types = parse_types(query.types.as_deref())?;
    let events = state.events.stream(&types).await?;
    let subject = identity.subject;
    Ok(ws
        .on_upgrade(move |socket| push_events(socket, events, subject, types))
        .into_response())
}

async fn push_events(socket: WebSocket, mut events: EventStream, subject: String, types: Vec<EventType>) {
    let (mut sender, mut receiver) = socket.split();
    info!(subject = %subject, types = ?types, "Event stream connected");

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let json = match event.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(event_id = %event.event_id, error = %e, "Cannot encode event");
                        continue;
                    }
                };
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(_)) => {}
            },
        }
    }

    info!(subject = %subject, "Event stream disconnected");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_types() {
        assert!(parse_types(None).unwrap().is_empty());
        assert!(parse_types(Some(" , ")).unwrap().is_empty());
        assert_eq!(
            parse_types(Some("task.created, approval.resolved")).unwrap(),
            vec![EventType::TaskCreated, EventType::ApprovalResolved]
        );
        assert!(parse_types(Some("task.created,task.exploded")).is_err());
    }
}
