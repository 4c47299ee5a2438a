use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use serde::Serialize;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::abuse::AbuseDetector;
use crate::coordinator::Coordinator;
use crate::messages::{ClientMessage, ServerMessage};
use crate::store::Store;

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub storage: &'static str,
    pub timestamp: String,
}

pub struct Server {
    coordinator: Arc<Coordinator>,
    store: Arc<Store>,
    abuse: Arc<AbuseDetector>,
}

impl Server {
    pub fn new(coordinator: Arc<Coordinator>, store: Arc<Store>, abuse: Arc<AbuseDetector>) -> Self {
        Server {
            coordinator,
            store,
            abuse,
        }
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok",
            storage: self.store.backend_name(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Drive one WebSocket until it closes. Inbound frames are handled in
    /// arrival order; outbound events go through a writer task.
    pub async fn handle_connection(&self, ws: WebSocket, remote: Option<SocketAddr>) {
        let address = remote.map(|addr| addr.ip().to_string());
        let (connection_id, mut rx) = self.coordinator.connect(address).await;
        let (mut ws_tx, mut ws_rx) = ws.split();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode outbound event: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    debug!("Failed to send WebSocket message: {e}");
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            let frame = match result {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("WebSocket error on {connection_id}: {e}");
                    break;
                }
            };
            if frame.is_close() {
                break;
            }
            let Ok(text) = frame.to_str() else {
                continue;
            };
            match serde_json::from_str::<ClientMessage>(text) {
                Ok(message) => self.coordinator.handle(&connection_id, message).await,
                Err(e) => {
                    debug!("Unreadable frame on {connection_id}: {e}");
                    self.coordinator
                        .notify(&connection_id, ServerMessage::error("Invalid message format"))
                        .await;
                }
            }
        }

        // dropping the outbound sender ends the writer task
        self.coordinator.disconnect(&connection_id).await;
    }
}

fn with_server(
    server: Arc<Server>,
) -> impl Filter<Extract = (Arc<Server>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}

fn failure(message: &str) -> warp::reply::Response {
    warp::reply::with_status(
        warp::reply::json(&ServerMessage::error(message)),
        StatusCode::INTERNAL_SERVER_ERROR,
    )
    .into_response()
}

async fn user_stats(server: Arc<Server>) -> Result<warp::reply::Response, Infallible> {
    match server.coordinator.user_stats().await {
        Ok(stats) => Ok(warp::reply::json(&stats).into_response()),
        Err(e) => {
            warn!("User stats unavailable: {e}");
            Ok(failure("Failed to get stats"))
        }
    }
}

async fn abuse_stats(server: Arc<Server>) -> Result<warp::reply::Response, Infallible> {
    match server.abuse.stats().await {
        Ok(stats) => Ok(warp::reply::json(&stats).into_response()),
        Err(e) => {
            warn!("Abuse stats unavailable: {e}");
            Ok(failure("Failed to get abuse stats"))
        }
    }
}

/// `/ws` upgrade plus the JSON endpoints under `/api`.
pub fn routes(server: Arc<Server>) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let ws_route = warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::addr::remote())
        .and(with_server(server.clone()))
        .map(|ws: Ws, remote: Option<SocketAddr>, server: Arc<Server>| {
            ws.on_upgrade(move |socket| async move {
                server.handle_connection(socket, remote).await;
            })
        });

    let health = warp::path!("api" / "health")
        .and(warp::get())
        .and(with_server(server.clone()))
        .map(|server: Arc<Server>| warp::reply::json(&server.health()));

    let users = warp::path!("api" / "users" / "stats")
        .and(warp::get())
        .and(with_server(server.clone()))
        .and_then(user_stats);

    let abuse = warp::path!("api" / "admin" / "abuse-stats")
        .and(warp::get())
        .and(with_server(server))
        .and_then(abuse_stats);

    ws_route.or(health).or(users).or(abuse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use serde_json::{json, Value};

    fn server() -> Arc<Server> {
        let store = Arc::new(Store::in_memory());
        let abuse = Arc::new(AbuseDetector::new(store.clone(), None, "test-salt"));
        let coordinator = Coordinator::new(&ServerConfig::default(), store.clone(), abuse.clone());
        Arc::new(Server::new(coordinator, store, abuse))
    }

    async fn next_event(client: &mut warp::test::WsClient) -> Value {
        let frame = client.recv().await.unwrap();
        serde_json::from_str(frame.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_storage() {
        let res = warp::test::request()
            .path("/api/health")
            .reply(&routes(server()))
            .await;
        assert_eq!(res.status(), 200);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["storage"], "memory");
    }

    #[tokio::test]
    async fn stats_endpoints_return_json() {
        let routes = routes(server());

        let res = warp::test::request()
            .path("/api/users/stats")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), 200);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["activeUsers"], 0);
        assert_eq!(body["queue"]["queueSize"], 0);

        let res = warp::test::request()
            .path("/api/admin/abuse-stats")
            .reply(&routes)
            .await;
        assert_eq!(res.status(), 200);
        let body: Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["classifierEnabled"], false);

        let res = warp::test::request().path("/api/nope").reply(&routes).await;
        assert_eq!(res.status(), 404);
    }

    #[tokio::test]
    async fn websocket_clients_get_matched() {
        let routes = routes(server());
        let mut a = warp::test::ws().path("/ws").handshake(routes.clone()).await.unwrap();
        let mut b = warp::test::ws().path("/ws").handshake(routes).await.unwrap();

        a.send_text("not json").await;
        assert_eq!(
            next_event(&mut a).await,
            json!({ "type": "error", "message": "Invalid message format" })
        );

        a.send_text(r#"{"type":"join_grid","latitude":40.0,"longitude":-74.0}"#)
            .await;
        let created = next_event(&mut a).await;
        assert_eq!(created["type"], "session_created");
        assert_eq!(created["status"], "scanning");

        b.send_text(r#"{"type":"join_grid","latitude":40.0005,"longitude":-74.0,"radius":1000}"#)
            .await;
        let created_b = next_event(&mut b).await;
        assert_eq!(created_b["type"], "session_created");

        let for_b = next_event(&mut b).await;
        let for_a = next_event(&mut a).await;
        assert_eq!(for_a["type"], "connection_established");
        assert_eq!(for_a["roomId"], for_b["roomId"]);
        assert_eq!(for_a["partnerCodename"], created_b["codename"]);
        assert_eq!(for_b["partnerCodename"], created["codename"]);
    }
}
