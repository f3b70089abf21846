//! Subscriber connections over WebSocket.
//!
//! Each socket is attached to the broker on upgrade and detached when it
//! closes. Client frames are JSON commands; server frames are
//! [`Notification`]s. The replay of a new subscription is written to the
//! socket directly, only live diffs pass through the bounded queue.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use shared::protocol::Notification;
use crate::api::routes::AppState;
use crate::broker::{Replay, SubscriberId};
use crate::serializer::RegistryHandle;

/// Commands a subscriber can send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WsCommand {
    SubscribeAll,
    UnsubscribeAll,
    SubscribeType {
        #[serde(rename = "type")]
        service_type: String,
    },
    UnsubscribeType {
        #[serde(rename = "type")]
        service_type: String,
    },
}

/// `GET /v1/subscribe`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_connection(socket, state.registry, state.subscriber_queue))
}

async fn send_json(sink: &mut SplitSink<WebSocket, Message>, value: &impl serde::Serialize) -> bool {
    match serde_json::to_string(value) {
        Ok(json) => sink.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!("Failed to encode frame: {}", e);
            true
        }
    }
}

/// Apply one command; returns the replay owed to the socket, if any.
async fn apply_command(registry: &RegistryHandle, id: SubscriberId, command: WsCommand) -> anyhow::Result<Replay> {
    let replay = match command {
        WsCommand::SubscribeAll => registry.subscribe_all(id).await?,
        WsCommand::SubscribeType { service_type } => registry.subscribe_type(id, service_type).await?,
        WsCommand::UnsubscribeAll => {
            registry.unsubscribe_all(id).await?;
            None
        }
        WsCommand::UnsubscribeType { service_type } => {
            registry.unsubscribe_type(id, service_type).await?;
            None
        }
    };
    Ok(replay.unwrap_or_default())
}

/// Read/write loop for one subscriber connection.
pub async fn run_connection(socket: WebSocket, registry: RegistryHandle, queue: usize) {
    let (tx, mut rx) = mpsc::channel::<Notification>(queue);
    let id = match registry.attach(Box::new(tx)).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("Failed to attach subscriber: {:#}", e);
            return;
        }
    };
    tracing::info!(subscriber = id, "Subscriber connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut open = send_json(&mut ws_tx, &Notification::Connected).await;

    while open {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WsCommand>(&text) {
                            Ok(command) => {
                                tracing::debug!(subscriber = id, "{:?}", command);
                                let replay = match apply_command(&registry, id, command).await {
                                    Ok(replay) => replay,
                                    Err(e) => {
                                        tracing::error!(subscriber = id, "Command failed: {:#}", e);
                                        break;
                                    }
                                };
                                // Everything queued in rx was dispatched after this snapshot
                                for record in replay {
                                    open = send_json(&mut ws_tx, &Notification::Updated(record)).await;
                                    if !open {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                let reply = serde_json::json!({ "error": format!("malformed command: {}", e) });
                                open = send_json(&mut ws_tx, &reply).await;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }

            Some(notification) = rx.recv() => {
                open = send_json(&mut ws_tx, &notification).await;
            }
        }
    }

    if let Err(e) = registry.detach(id).await {
        tracing::warn!(subscriber = id, "Failed to detach: {:#}", e);
    }
    tracing::info!(subscriber = id, "Subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use axum::routing::get;
    use axum::Router;
    use tokio::net::TcpStream;
    use tokio::sync::watch;
    use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};
    use shared::types::Record;
    use crate::mdns::{MdnsResolver, TransportEvent};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(registry: RegistryHandle, queue: usize) -> std::net::SocketAddr {
        let app = Router::new().route(
            "/v1/subscribe",
            get(move |ws: WebSocketUpgrade| {
                let registry = registry.clone();
                async move { ws.on_upgrade(move |socket| run_connection(socket, registry, queue)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        addr
    }

    async fn next_json(client: &mut Client) -> serde_json::Value {
        loop {
            if let tungstenite::Message::Text(text) = client.next().await.unwrap().unwrap() {
                return serde_json::from_str(text.as_str()).unwrap();
            }
        }
    }

    async fn send_text(client: &mut Client, text: &str) {
        client
            .send(tungstenite::Message::Text(text.to_string().into()))
            .await
            .unwrap();
    }

    fn record(name: &str) -> Record {
        let mut r = Record::new("_http._tcp.local.", name);
        r.server = "host.local.".to_string();
        r
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let (digest_tx, _digest_rx) = watch::channel(String::new());
        let registry = RegistryHandle::spawn(Arc::new(MdnsResolver), digest_tx);
        for i in 0..6 {
            registry
                .submit(TransportEvent::InstanceAdded(record(&format!("web{}", i))))
                .await
                .unwrap();
        }

        // Queue smaller than the replay
        let addr = serve(registry.clone(), 4).await;
        let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{}/v1/subscribe", addr))
            .await
            .unwrap();

        assert_eq!(next_json(&mut client).await, serde_json::json!({ "event": "connected" }));
        assert_eq!(registry.subscriber_count().await.unwrap(), 1);

        send_text(&mut client, r#"{"command":"subscribe_all"}"#).await;
        for i in 0..6 {
            let frame = next_json(&mut client).await;
            assert_eq!(frame["event"], "updated");
            assert_eq!(frame["record"]["name"], format!("web{}", i));
        }

        registry
            .submit(TransportEvent::InstanceAdded(record("live")))
            .await
            .unwrap();
        let frame = next_json(&mut client).await;
        assert_eq!(frame["event"], "updated");
        assert_eq!(frame["record"]["name"], "live");

        send_text(&mut client, r#"{"command":"swap"}"#).await;
        let frame = next_json(&mut client).await;
        assert!(frame["error"].as_str().unwrap().starts_with("malformed command"));

        client.close(None).await.unwrap();
        let mut remaining = 1;
        for _ in 0..50 {
            remaining = registry.subscriber_count().await.unwrap();
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_parse_commands() {
        let cmd: WsCommand = serde_json::from_str(r#"{"command":"subscribe_all"}"#).unwrap();
        assert_eq!(cmd, WsCommand::SubscribeAll);

        let cmd: WsCommand =
            serde_json::from_str(r#"{"command":"unsubscribe_type","type":"_ipp._tcp.local."}"#).unwrap();
        assert_eq!(
            cmd,
            WsCommand::UnsubscribeType {
                service_type: "_ipp._tcp.local.".to_string()
            }
        );
    }

    #[test]
    fn test_reject_unknown_or_incomplete_commands() {
        assert!(serde_json::from_str::<WsCommand>(r#"{"command":"swap"}"#).is_err());
        assert!(serde_json::from_str::<WsCommand>(r#"{"command":"subscribe_type"}"#).is_err());
    }
}
