//! # HTTP / WebSocket Edge
//!
//! A thin axum layer over the running engine:
//!
//! - `GET /health`: liveness.
//! - `GET /ranking`: the freshness ranking, freshest first.
//! - `GET /assets`, `GET /assets/{id}`: supervisor views.
//! - `GET /market`: the last known market state.
//! - `POST /admin`: a JSON `ServerCommand`, published on the control plane.
//! - `GET /ws`: tick streaming. Clients send `{"subscribe":[..]}` or
//!   `{"unsubscribe":[..]}` and receive `{"type":"tick",..}` frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Path, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use finstream_core::core::{AssetView, Dispatcher, Tick};
use finstream_core::sysbus::{ServerCommand, SysEvent};

use super::state::AppState;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// Builds the router with permissive CORS.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/ranking", get(ranking_handler))
        .route("/assets", get(assets_handler))
        .route("/assets/{id}", get(asset_handler))
        .route("/market", get(market_handler))
        .route("/admin", post(admin_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Serves the edge on `listener` until the state's shutdown token fires.
pub async fn serve(listener: TcpListener, state: AppState) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        tracing::info!("edge server shutting down");
    })
    .await
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn ranking_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.arena.query().await;
    Json(snapshot.as_ref().clone())
}

async fn assets_handler(State(state): State<AppState>) -> impl IntoResponse {
    let views: Vec<AssetView> = state.supervisor.assets().values().cloned().collect();
    Json(views)
}

async fn asset_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AssetView>, StatusCode> {
    state.supervisor.asset(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn market_handler(State(state): State<AppState>) -> impl IntoResponse {
    let market = *state.market.borrow();
    Json(json!({ "state": market }))
}

async fn admin_handler(
    State(state): State<AppState>,
    Json(command): Json<ServerCommand>,
) -> impl IntoResponse {
    tracing::info!(?command, "admin command received");
    let receivers = state.bus.publish(SysEvent::ServerControl(command));
    (
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": true, "receivers": receivers })),
    )
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

/// Frames sent by WebSocket clients.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClientMessage {
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

/// Frames sent to WebSocket clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage<'a> {
    Tick(&'a Tick),
    Subscribed { assets: Vec<String> },
    Unsubscribed { assets: Vec<String> },
    Error { message: String },
}

/// Applies one client text frame to the dispatcher and builds the replies.
pub fn apply_client_message(
    dispatcher: &Dispatcher,
    client: &str,
    text: &str,
) -> Vec<ServerMessage<'static>> {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            return vec![ServerMessage::Error {
                message: format!("invalid message: {e}"),
            }]
        }
    };

    let mut replies = Vec::new();
    if !message.subscribe.is_empty() {
        let assets = asset_ids(message.subscribe)
            .filter(|asset| dispatcher.subscribe(client, asset))
            .collect();
        replies.push(ServerMessage::Subscribed { assets });
    }
    if !message.unsubscribe.is_empty() {
        let assets = asset_ids(message.unsubscribe)
            .filter(|asset| dispatcher.unsubscribe(client, asset))
            .collect();
        replies.push(ServerMessage::Unsubscribed { assets });
    }
    replies
}

fn asset_ids(raw: Vec<String>) -> impl Iterator<Item = String> {
    raw.into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

async fn send_json(socket: &mut WebSocket, message: &ServerMessage<'_>) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => socket.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode client frame");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, addr: SocketAddr, state: AppState) {
    let client_id = format!("ws-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed));
    let mut ticks = state.dispatcher.add_client(&client_id);
    tracing::info!(client = %client_id, %addr, "websocket client connected");

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            frame = socket.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let replies = apply_client_message(&state.dispatcher, &client_id, text.as_str());
                    let mut open = true;
                    for reply in &replies {
                        open &= send_json(&mut socket, reply).await;
                    }
                    if !open {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(client = %client_id, error = %e, "websocket receive failed");
                    break;
                }
            },
            tick = ticks.recv() => match tick {
                Some(tick) => {
                    if !send_json(&mut socket, &ServerMessage::Tick(tick.as_ref())).await {
                        break;
                    }
                }
                // Replaced or removed by the dispatcher.
                None => break,
            },
        }
    }

    state.dispatcher.remove_client(&client_id);
    tracing::info!(client = %client_id, "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use tokio::sync::watch;
    use tokio_util::sync::CancellationToken;

    use finstream_core::configs::{ConfigManager, EngineConfig};
    use finstream_core::core::{ArenaService, Supervisor};
    use finstream_core::ingestors::{ProcessLauncher, TokioLauncher};
    use finstream_core::sysbus::{EventBus, MarketState};

    struct TestEdge {
        base: String,
        state: AppState,
    }

    async fn start_edge() -> TestEdge {
        let bus = EventBus::new(64);
        let configs = ConfigManager::new(EngineConfig::default(), None, bus.clone()).unwrap();
        let shutdown = CancellationToken::new();

        let (arena_service, arena) = ArenaService::new();
        tokio::spawn(arena_service.run(shutdown.clone()));
        let (supervisor, handle) = Supervisor::new(
            configs,
            Arc::new(TokioLauncher) as Arc<dyn ProcessLauncher>,
            arena.clone(),
            bus.clone(),
        )
        .unwrap();
        let dispatcher = Dispatcher::new(handle.clone(), 16);
        tokio::spawn(supervisor.run(dispatcher.clone(), shutdown.clone()));

        let (_market_tx, market) = watch::channel(Some(MarketState::Open));
        let state = AppState {
            dispatcher,
            supervisor: handle,
            arena,
            market,
            bus,
            shutdown,
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(serve(listener, state.clone()));
        TestEdge { base, state }
    }

    #[tokio::test]
    async fn test_health_and_read_routes() {
        let edge = start_edge().await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{}/health", edge.base)).send().await.unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);
        assert_eq!(health.text().await.unwrap(), "OK");

        let ranking: serde_json::Value = client
            .get(format!("{}/ranking", edge.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ranking["sources"], json!([]));
        assert_eq!(ranking["degradedCount"], 0);

        let market: serde_json::Value = client
            .get(format!("{}/market", edge.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(market["state"], "Open");

        let assets: serde_json::Value = client
            .get(format!("{}/assets", edge.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(assets, json!([]));

        let missing = client.get(format!("{}/assets/SPY", edge.base)).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        edge.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_admin_publishes_server_control() {
        let edge = start_edge().await;
        let mut events = edge.state.bus.subscribe("admin-test");
        let client = reqwest::Client::new();

        let accepted = client
            .post(format!("{}/admin", edge.base))
            .json(&json!({ "command": "pause", "asset": "SPY" }))
            .send()
            .await
            .unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::ACCEPTED);

        let command = loop {
            match events.recv().await {
                Some(SysEvent::ServerControl(command)) => break command,
                Some(_) => continue,
                None => panic!("bus closed"),
            }
        };
        assert_eq!(
            command,
            ServerCommand::Pause {
                asset: Some("SPY".to_string())
            }
        );

        let rejected = client
            .post(format!("{}/admin", edge.base))
            .json(&json!({ "command": "selfDestruct" }))
            .send()
            .await
            .unwrap();
        assert!(rejected.status().is_client_error());
        edge.state.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_client_messages_drive_subscriptions() {
        let edge = start_edge().await;
        let dispatcher = &edge.state.dispatcher;
        let _ticks = dispatcher.add_client("c1");

        let replies = apply_client_message(dispatcher, "c1", r#"{"subscribe":["SPY"," QQQ ",""]}"#);
        let encoded = serde_json::to_value(&replies).unwrap();
        assert_eq!(encoded, json!([{ "type": "subscribed", "assets": ["SPY", "QQQ"] }]));

        // Already subscribed: nothing new.
        let replies = apply_client_message(dispatcher, "c1", r#"{"subscribe":["SPY"]}"#);
        assert_eq!(
            serde_json::to_value(&replies).unwrap(),
            json!([{ "type": "subscribed", "assets": [] }])
        );

        let replies = apply_client_message(dispatcher, "c1", r#"{"unsubscribe":["QQQ","DIA"]}"#);
        assert_eq!(
            serde_json::to_value(&replies).unwrap(),
            json!([{ "type": "unsubscribed", "assets": ["QQQ"] }])
        );

        let replies = apply_client_message(dispatcher, "c1", "not json");
        assert!(matches!(replies.as_slice(), [ServerMessage::Error { .. }]));
        edge.state.shutdown.cancel();
    }
}
