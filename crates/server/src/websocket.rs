use crate::api::{parse_inline_workflow, ApiKeyInput};
use crate::config::AppState;
use crate::middleware::extract_user_from_headers;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use rustmake_core::events::{EventSubscriber, ExecutionEvent};
use rustmake_core::{RunError, RunId, UserId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

/// Messages sent to the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// A run was started on the client's behalf; its events follow
    RunAccepted { run_id: RunId },
    /// An execution event of a run the client follows
    Event { event: ExecutionEvent },
    Error { message: String },
    Pong,
}

/// Requests from the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsRequest {
    /// Run an inline workflow with the keys sent alongside it
    ExecuteWorkflow {
        workflow: serde_json::Value,
        #[serde(default, alias = "apiKeys")]
        api_keys: Vec<ApiKeyInput>,
    },
    /// Run one of the caller's stored workflows
    ExecuteStored { workflow_id: String },
    Subscribe { run_id: String },
    Cancel { run_id: String },
    Ping,
}

/// WebSocket handler for realtime workflow execution
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user_id = extract_user_from_headers(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: Option<UserId>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsMessage>(state.config.engine.event_buffer.max(1));

    // Single writer; event forwarders and the request loop all send through `tx`.
    // The channel is bounded so a stalled socket backs up into each run's
    // subscriber queue, where Progress events are shed.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize WS message: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders = JoinSet::new();

    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                tracing::debug!("Received WS message: {}", text.as_str());

                match serde_json::from_str::<WsRequest>(text.as_str()) {
                    Ok(request) => {
                        let reply = handle_request(request, &state, user_id.as_ref(), &tx, &mut forwarders).await;
                        if let Err(message) = reply {
                            let _ = tx.send(WsMessage::Error { message }).await;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(WsMessage::Error {
                                message: format!("invalid request: {}", e),
                            })
                            .await;
                    }
                }
            }
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket connection closed");
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    forwarders.abort_all();
    drop(tx);
    let _ = writer.await;

    tracing::info!("WebSocket connection terminated");
}

async fn handle_request(
    request: WsRequest,
    state: &AppState,
    user_id: Option<&UserId>,
    tx: &mpsc::Sender<WsMessage>,
    forwarders: &mut JoinSet<u64>,
) -> Result<(), String> {
    match request {
        WsRequest::ExecuteWorkflow { workflow, api_keys } => {
            let (spec, credentials) =
                parse_inline_workflow(workflow, api_keys).map_err(|e| e.to_string())?;
            let (run_id, subscriber) = state
                .coordinator
                .start_run_subscribed(spec, credentials)
                .await
                .map_err(|e| e.to_string())?;

            tracing::info!("Client started run {}", run_id);
            let _ = tx.send(WsMessage::RunAccepted { run_id }).await;
            forwarders.spawn(forward(subscriber, tx.clone()));
        }
        WsRequest::ExecuteStored { workflow_id } => {
            let user_id = user_id.ok_or_else(|| "identity required to run stored workflows".to_string())?;
            let workflow_id: WorkflowId = workflow_id
                .parse()
                .map_err(|_| format!("invalid workflow id '{}'", workflow_id))?;
            let (run_id, subscriber) = state
                .coordinator
                .start_workflow_subscribed(user_id, workflow_id)
                .await
                .map_err(|e| e.to_string())?;

            tracing::info!("Client started stored workflow {} as run {}", workflow_id, run_id);
            let _ = tx.send(WsMessage::RunAccepted { run_id }).await;
            forwarders.spawn(forward(subscriber, tx.clone()));
        }
        WsRequest::Subscribe { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            let subscriber = state
                .coordinator
                .subscribe(run_id)
                .await
                .map_err(|e: RunError| e.to_string())?;

            tracing::info!("Client subscribed to run {}", run_id);
            forwarders.spawn(forward(subscriber, tx.clone()));
        }
        WsRequest::Cancel { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            state
                .coordinator
                .cancel(run_id)
                .await
                .map_err(|e| e.to_string())?;
        }
        WsRequest::Ping => {
            let _ = tx.send(WsMessage::Pong).await;
        }
    }
    Ok(())
}

fn parse_run_id(raw: &str) -> Result<RunId, String> {
    raw.parse().map_err(|_| format!("invalid run id '{}'", raw))
}

/// Relay a run's events to the client until the run finishes. Returns the
/// number of progress events shed while the client was behind.
async fn forward(mut subscriber: EventSubscriber, tx: mpsc::Sender<WsMessage>) -> u64 {
    loop {
        // Wait for room before taking the next event off the subscriber queue
        let Ok(permit) = tx.reserve().await else {
            break;
        };
        match subscriber.recv().await {
            Some(event) => permit.send(WsMessage::Event { event }),
            None => break,
        }
    }

    let dropped = subscriber.dropped();
    if dropped > 0 {
        tracing::debug!("Client fell behind; {} progress event(s) dropped", dropped);
    }
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: WsRequest = serde_json::from_str(
            r#"{"type": "execute_workflow", "workflow": {"nodes": []}, "apiKeys": [{"service": "slack", "value": "x"}]}"#,
        )
        .unwrap();
        match request {
            WsRequest::ExecuteWorkflow { api_keys, .. } => {
                assert_eq!(api_keys[0].service, "slack");
                assert_eq!(api_keys[0].key_value, "x");
            }
            other => panic!("unexpected {:?}", other),
        }

        let ping: WsRequest = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(ping, WsRequest::Ping));
    }

    #[test]
    fn test_message_wire_format() {
        let run_id = RunId::new();
        let json = serde_json::to_value(WsMessage::RunAccepted { run_id }).unwrap();
        assert_eq!(json["type"], "run_accepted");
        assert_eq!(json["run_id"], run_id.to_string());

        let pong = serde_json::to_value(WsMessage::Pong).unwrap();
        assert_eq!(pong, serde_json::json!({"type": "pong"}));
    }

    #[tokio::test]
    async fn test_execute_request_streams_events() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::ServerConfig::load(&dir.path().join("none.toml"), dir.path().to_path_buf()).unwrap();
        let state = AppState::new(&config).unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        let mut forwarders = JoinSet::new();

        let request = WsRequest::ExecuteWorkflow {
            workflow: serde_json::json!({"nodes": [{"id": "a", "type": "echo"}]}),
            api_keys: vec![],
        };
        handle_request(request, &state, None, &tx, &mut forwarders)
            .await
            .unwrap();
        while forwarders.join_next().await.is_some() {}
        drop(tx);

        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        assert!(matches!(messages[0], WsMessage::RunAccepted { .. }));
        assert!(matches!(
            messages.last(),
            Some(WsMessage::Event {
                event: ExecutionEvent {
                    kind: rustmake_core::events::EventKind::RunFinished { .. },
                    ..
                }
            })
        ));

        let stored = handle_request(
            WsRequest::ExecuteStored {
                workflow_id: WorkflowId::new().to_string(),
            },
            &state,
            None,
            &mpsc::channel(1).0,
            &mut forwarders,
        )
        .await;
        assert!(stored.unwrap_err().contains("identity"));
    }

    #[tokio::test]
    async fn test_stalled_client_sheds_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::ServerConfig::load(&dir.path().join("none.toml"), dir.path().to_path_buf()).unwrap();
        config.engine.event_buffer = 2;
        let state = AppState::new(&config).unwrap();

        let nodes: Vec<_> = (0..50)
            .map(|i| serde_json::json!({"id": format!("n{:02}", i), "type": "echo"}))
            .collect();
        let (spec, credentials) =
            parse_inline_workflow(serde_json::json!({"nodes": nodes}), vec![]).unwrap();
        let (run_id, subscriber) = state
            .coordinator
            .start_run_subscribed(spec, credentials)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(2);
        let forwarder = tokio::spawn(forward(subscriber, tx));

        // The client reads nothing until the run is over
        tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                let finished = state
                    .coordinator
                    .get_status(run_id)
                    .await
                    .is_some_and(|run| run.overall_status.is_terminal());
                if finished {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        assert!(messages.len() <= 2);

        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        let dropped = forwarder.await.unwrap();
        assert!(dropped > 0);

        let kinds: Vec<_> = messages
            .iter()
            .filter_map(|m| match m {
                WsMessage::Event { event } => Some(&event.kind),
                _ => None,
            })
            .collect();
        let started = kinds
            .iter()
            .filter(|k| matches!(k, rustmake_core::events::EventKind::NodeStarted { .. }))
            .count();
        let finished = kinds
            .iter()
            .filter(|k| matches!(k, rustmake_core::events::EventKind::NodeFinished { .. }))
            .count();
        assert_eq!((started, finished), (50, 50));
        assert!(matches!(
            kinds.last(),
            Some(rustmake_core::events::EventKind::RunFinished { .. })
        ));
    }
}
