//! Connection to a running `zeroconf-serviced`.
//!
//! Registrations go through `POST`/`DELETE /v1/registrations`. Notifications
//! arrive on the `/v1/subscribe` WebSocket, which also tells the client when
//! the daemon is reachable: the socket coming up drives
//! [`ZeroConfClient::on_connected`] and losing it drives
//! [`ZeroConfClient::on_disconnected`].

use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use shared::protocol::{Notification, RegistrationService, API_PREFIX};
use shared::types::Record;
use crate::client::ZeroConfClient;

const INITIAL_RETRY: Duration = Duration::from_secs(1);
const MAX_RETRY: Duration = Duration::from_secs(30);

/// Base URL of a daemon's API, e.g. `http://127.0.0.1:8053`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base: String,
}

impl Endpoint {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn registrations_url(&self) -> String {
        format!("{}{}/registrations", self.base, API_PREFIX)
    }

    pub fn subscribe_url(&self) -> String {
        let ws_base = if let Some(rest) = self.base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.base.clone()
        };
        format!("{}{}/subscribe", ws_base, API_PREFIX)
    }
}

/// [`RegistrationService`] backed by the daemon's HTTP API.
#[derive(Clone)]
pub struct HttpRegistrar {
    http: reqwest::Client,
    url: String,
}

impl HttpRegistrar {
    pub fn new(http: reqwest::Client, endpoint: &Endpoint) -> Self {
        Self {
            http,
            url: endpoint.registrations_url(),
        }
    }
}

impl RegistrationService for HttpRegistrar {
    async fn register_service(&self, record: &Record) -> Result<()> {
        self.http
            .post(&self.url)
            .json(record)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Daemon refused to register {}", record.full_name()))?;
        Ok(())
    }

    async fn unregister_service(&self, record: &Record) -> Result<()> {
        self.http
            .delete(&self.url)
            .json(record)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Daemon refused to unregister {}", record.full_name()))?;
        Ok(())
    }
}

/// Client shared between the application and the connection task
pub type SharedClient = Arc<Mutex<ZeroConfClient<HttpRegistrar>>>;

/// One connection to the daemon. Subscribes to every type, replays pending
/// requests, then feeds notifications to listeners until the socket closes
/// or `cancel` fires. The client is left disconnected on return.
pub async fn run_session(
    client: &Mutex<ZeroConfClient<HttpRegistrar>>,
    http: &reqwest::Client,
    endpoint: &Endpoint,
    cancel: &CancellationToken,
) -> Result<()> {
    client.lock().await.connecting();

    let url = endpoint.subscribe_url();
    let (socket, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            client.lock().await.on_disconnected();
            return Err(e).with_context(|| format!("Failed to connect to {}", url));
        }
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    let subscribe = serde_json::json!({ "command": "subscribe_all" }).to_string();
    if let Err(e) = ws_tx.send(Message::Text(subscribe.into())).await {
        client.lock().await.on_disconnected();
        return Err(e).context("Failed to subscribe");
    }

    client
        .lock()
        .await
        .on_connected(HttpRegistrar::new(http.clone(), endpoint))
        .await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.close().await;
                break;
            }

            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Notification>(text.as_str()) {
                        // Listeners were told by on_connected already
                        Ok(Notification::Connected) => {}
                        Ok(notification) => client.lock().await.deliver(&notification),
                        Err(_) => tracing::warn!("Unexpected frame from daemon: {}", text.as_str()),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::warn!("Subscription socket failed: {}", e);
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    client.lock().await.on_disconnected();
    Ok(())
}

/// Delay before the next attempt: doubles per consecutive failure, capped.
fn next_delay(current: Duration) -> Duration {
    (current * 2).min(MAX_RETRY)
}

/// Keep a session to the daemon open until `cancel` fires, reconnecting
/// with exponential backoff.
pub async fn run(client: SharedClient, endpoint: Endpoint, cancel: CancellationToken) {
    let http = reqwest::Client::new();
    let mut delay = INITIAL_RETRY;

    while !cancel.is_cancelled() {
        match run_session(&client, &http, &endpoint, &cancel).await {
            Ok(()) => {
                tracing::info!("Disconnected from {}", endpoint.base);
                delay = INITIAL_RETRY;
            }
            Err(e) => {
                tracing::warn!("{:#}, retrying in {:?}", e, delay);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = next_delay(delay);
    }
}
