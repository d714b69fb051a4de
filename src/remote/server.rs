use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::hub::AgentHub;
use super::{
    AGENT_HEADER, AgentConfiguration, CommandFinish, CommandRequest, ErrorLogEntry, FinishAck,
    LogEntry, ServerMessage,
};
use crate::core::lifecycle::LifecycleComponent;

pub fn router(hub: Arc<AgentHub>) -> Router {
    let agent_routes = Router::new()
        .route("/agent/finish", post(finish))
        .route("/agent/logs", post(append_log))
        .route("/agent/logs/error", post(set_error))
        .layer(middleware::from_fn_with_state(hub.clone(), require_agent));

    Router::new()
        .route("/agent/stream", get(stream))
        .merge(agent_routes)
        .with_state(hub)
}

async fn require_agent(State(hub): State<Arc<AgentHub>>, req: Request<Body>, next: Next) -> Response {
    let agent_id = req
        .headers()
        .get(AGENT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match agent_id {
        Some(id) if hub.is_registered(&id) => next.run(req).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unknown or missing agent id" })),
        )
            .into_response(),
    }
}

async fn finish(State(hub): State<Arc<AgentHub>>, Json(body): Json<CommandFinish>) -> Json<FinishAck> {
    Json(FinishAck {
        accepted: hub.finish(body),
    })
}

async fn append_log(State(hub): State<Arc<AgentHub>>, Json(body): Json<LogEntry>) -> Response {
    match hub.append_log(body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Failed to store remote log line: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn set_error(State(hub): State<Arc<AgentHub>>, Json(body): Json<ErrorLogEntry>) -> Response {
    match hub.set_error(body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("Failed to store remote job error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn stream(ws: WebSocketUpgrade, State(hub): State<Arc<AgentHub>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn send_frame(socket: &mut WebSocket, msg: &ServerMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode server frame: {}", e);
            false
        }
    }
}

/// Waits for the agent's configuration frame.
async fn read_configuration(socket: &mut WebSocket) -> Option<AgentConfiguration> {
    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str(text.as_str()) {
                Ok(config) => return Some(config),
                Err(e) => {
                    let reason = format!("malformed configuration: {}", e);
                    let _ = send_frame(socket, &ServerMessage::Rejected { reason }).await;
                    return None;
                }
            },
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn handle_socket(mut socket: WebSocket, hub: Arc<AgentHub>) {
    let Some(config) = read_configuration(&mut socket).await else {
        debug!("Agent stream closed before registering");
        return;
    };

    let (agent_id, mut commands) = match hub.register(config).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!("Rejected agent registration: {}", e);
            let reason = e.to_string();
            let _ = send_frame(&mut socket, &ServerMessage::Rejected { reason }).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let registered = ServerMessage::Registered {
        agent_id: agent_id.clone(),
    };
    if !send_frame(&mut socket, &registered).await {
        release(&hub, &agent_id, commands);
        return;
    }

    let (mut sink, mut incoming) = socket.split();
    loop {
        tokio::select! {
            next = commands.recv() => {
                let Some(request) = next else { break };
                let job_id = request.job_id;
                let frame = match serde_json::to_string(&ServerMessage::Command(request)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to encode job #{}: {}", job_id, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    warn!("Lost agent {} while sending job #{}: {}", agent_id, job_id, e);
                    break;
                }
            }
            msg = incoming.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Agent {} stream error: {}", agent_id, e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }
    release(&hub, &agent_id, commands);
}

/// Closes the agent's command stream, then unregisters it. A dispatch still
/// holding the sender fails on send.
fn release(hub: &AgentHub, agent_id: &str, commands: mpsc::Receiver<CommandRequest>) {
    drop(commands);
    hub.unregister(agent_id);
}

/// Serves the agent endpoints for the lifetime of the process.
pub struct HubServer {
    listen: String,
    hub: Arc<AgentHub>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl HubServer {
    pub fn new(listen: impl Into<String>, hub: Arc<AgentHub>) -> Self {
        Self {
            listen: listen.into(),
            hub,
            cancel: CancellationToken::new(),
            handle: None,
            local_addr: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

#[async_trait]
impl LifecycleComponent for HubServer {
    async fn on_start(&mut self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen).await?;
        let addr = listener.local_addr()?;
        self.local_addr = Some(addr);
        info!("Agent hub listening on {}", addr);

        let app = router(self.hub.clone());
        let cancel = self.cancel.clone();
        self.handle = Some(tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("Agent hub server error: {}", e);
            }
        }));
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            // open agent websockets keep graceful shutdown waiting
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::logs::LogLedger;
    use crate::core::store::Store;
    use crate::core::tokens::TokenLedger;
    use crate::remote::RemoteCommandSpec;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;

    fn hub(store: Store) -> Arc<AgentHub> {
        Arc::new(AgentHub::new(
            TokenLedger::new(store.clone()),
            LogLedger::new(store),
            Duration::from_secs(1),
        ))
    }

    fn echo_config() -> AgentConfiguration {
        AgentConfiguration {
            agent_id: String::new(),
            token: None,
            labels: BTreeMap::new(),
            commands: vec![RemoteCommandSpec {
                name: "echo".into(),
                help: String::new(),
                timeout_secs: 5,
                auth: Default::default(),
                allowed_groups: vec![],
                allowed_channels: vec![],
                handshake: false,
                templates: Default::default(),
            }],
        }
    }

    async fn registered(hub: &AgentHub) -> String {
        let (agent_id, _commands) = hub.register(echo_config()).await.unwrap();
        agent_id
    }

    fn post(uri: &str, agent: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(agent) = agent {
            builder = builder.header(AGENT_HEADER, agent);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn unary_endpoints_require_a_live_agent() {
        let app = router(hub(Store::in_memory()));
        let body = serde_json::json!({ "job_id": 1, "line": "x" });

        let res = app.clone().oneshot(post("/agent/logs", None, body.clone())).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app.oneshot(post("/agent/logs", Some("ghost"), body)).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn logs_and_errors_are_stored() {
        let store = Store::in_memory();
        let hub = hub(store.clone());
        let agent = registered(&hub).await;
        let app = router(hub);

        let res = app
            .clone()
            .oneshot(post(
                "/agent/logs",
                Some(&agent),
                serde_json::json!({ "job_id": 9, "line": "hello" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let res = app
            .oneshot(post(
                "/agent/logs/error",
                Some(&agent),
                serde_json::json!({ "job_id": 9, "error": "boom" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NO_CONTENT);

        let log = LogLedger::new(store).get(9).await.unwrap();
        assert_eq!(log.lines, vec!["hello"]);
        assert_eq!(log.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn unknown_finish_is_not_accepted() {
        let hub = hub(Store::in_memory());
        let agent = registered(&hub).await;
        let app = router(hub);

        let res = app
            .oneshot(post(
                "/agent/finish",
                Some(&agent),
                serde_json::json!({ "agent_id": agent, "job_id": 42, "content": "late" }),
            ))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let ack: FinishAck = serde_json::from_slice(&bytes).unwrap();
        assert!(!ack.accepted);
    }

    #[tokio::test]
    async fn release_fails_buffered_and_later_dispatches() {
        let hub = hub(Store::in_memory());
        let (agent_id, commands) = hub.register(echo_config()).await.unwrap();
        let req = crate::core::request::Request::new("echo", "alice");

        // queued behind a receiver nobody reads
        let buffered = {
            let hub = hub.clone();
            let agent_id = agent_id.clone();
            let req = req.clone();
            tokio::spawn(async move { hub.dispatch(&agent_id, 1, &req, Duration::from_secs(30)).await })
        };
        while hub.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        release(&hub, &agent_id, commands);
        let err = tokio::time::timeout(Duration::from_secs(1), buffered)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, crate::core::commands::ExecError::Transport(_)));
        assert!(!hub.is_registered(&agent_id));
        assert_eq!(hub.pending_calls(), 0);
    }
}
