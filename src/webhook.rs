//! Temperature Webhook Relay
//!
//! Application wiring on top of the event core: every `temperatura` event a
//! peer sends is POSTed to a webhook, and once the webhook answers the
//! reading is echoed back to the same peer as `change_temperatura`.

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::WebhookConfig;
use crate::websocket::{Connection, EventContext, Payload, RegistryError, RegistryHandle};

/// Inbound event carrying a reading
pub const TEMPERATURE_EVENT: &str = "temperatura";

/// Event emitted back after the webhook answered a reading
pub const TEMPERATURE_CHANGED_EVENT: &str = "change_temperatura";

/// HTTP client for the webhook endpoint
pub struct WebhookClient {
    client: Client,
    url: String,
}

impl WebhookClient {
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST a JSON body; any non-2xx status is an error
    pub async fn post<T: Serialize + ?Sized>(&self, body: &T) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    WebhookError::Timeout
                } else {
                    WebhookError::Request(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::Status(status.as_u16()));
        }
        Ok(())
    }
}

/// A temperature reading as received from a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    pub temperatura: String,
    pub timestamp: String,
}

impl TemperatureReading {
    /// Extract a reading; both fields must be strings
    pub fn from_payload(payload: &Payload) -> Result<Self, WebhookError> {
        Ok(Self {
            temperatura: string_field(payload, "temperatura")?,
            timestamp: string_field(payload, "timestamp")?,
        })
    }
}

fn string_field(payload: &Payload, key: &'static str) -> Result<String, WebhookError> {
    payload
        .get(key)
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .ok_or(WebhookError::InvalidField(key))
}

/// Wire the relay onto every connection the registry accepts from now on.
///
/// The confirmation is emitted after any completed HTTP exchange, whatever
/// the status; a non-2xx answer is only logged. Transport failures and
/// timeouts suppress it.
pub fn install_temperature_relay(
    registry: &RegistryHandle,
    client: Arc<WebhookClient>,
) -> Result<(), RegistryError> {
    tracing::info!(url = %client.url(), "Temperature relay enabled");

    registry.add_connect_observer(move |connection: &Arc<Connection>| {
        tracing::info!(
            connection_id = %connection.id(),
            params = ?connection.params(),
            "New client connected"
        );

        let client = Arc::clone(&client);
        connection.on(TEMPERATURE_EVENT, move |ctx| {
            let client = Arc::clone(&client);
            async move { relay_temperature(&client, ctx).await }
        });
    })
}

async fn relay_temperature(client: &WebhookClient, ctx: EventContext) {
    let connection_id = ctx.connection.id().to_string();

    let reading = match TemperatureReading::from_payload(&ctx.payload) {
        Ok(reading) => reading,
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "Rejected temperature event");
            return;
        }
    };

    match client.post(&reading).await {
        Ok(()) => {}
        Err(WebhookError::Status(status)) => {
            tracing::warn!(connection_id = %connection_id, status, "Webhook rejected reading");
        }
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "Webhook delivery failed");
            return;
        }
    }

    tracing::debug!(
        connection_id = %connection_id,
        temperatura = %reading.temperatura,
        "Temperature relayed"
    );

    if let Err(e) = ctx
        .connection
        .emit_serializable(TEMPERATURE_CHANGED_EVENT, &reading)
        .await
    {
        tracing::debug!(connection_id = %connection_id, error = %e, "Could not confirm temperature");
    }
}

/// Errors from the webhook relay
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Field {0:?} missing or not a string")]
    InvalidField(&'static str),

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook request timed out")]
    Timeout,

    #[error("Webhook responded with status {0}")]
    Status(u16),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::{Envelope, Registry};
    use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    /// Start a local webhook that records bodies and answers with `status`.
    async fn spawn_webhook(status: StatusCode) -> (String, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let app = Router::new()
            .route(
                "/webhook",
                post(
                    move |State(tx): State<mpsc::UnboundedSender<serde_json::Value>>,
                          Json(body): Json<serde_json::Value>| async move {
                        let _ = tx.send(body);
                        status
                    },
                ),
            )
            .with_state(tx);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/webhook", addr), rx)
    }

    fn client_for(url: String) -> Arc<WebhookClient> {
        let config = WebhookConfig {
            enabled: true,
            url,
            timeout_ms: 2000,
        };
        Arc::new(WebhookClient::new(&config).unwrap())
    }

    fn payload(value: serde_json::Value) -> Payload {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_reading_requires_string_fields() {
        let ok = payload(json!({"temperatura": "21.5", "timestamp": "1699000000", "extra": 1}));
        assert_eq!(
            TemperatureReading::from_payload(&ok).unwrap(),
            TemperatureReading {
                temperatura: "21.5".to_string(),
                timestamp: "1699000000".to_string(),
            }
        );

        let numeric = payload(json!({"temperatura": 21.5, "timestamp": "1699000000"}));
        assert!(matches!(
            TemperatureReading::from_payload(&numeric),
            Err(WebhookError::InvalidField("temperatura"))
        ));

        let missing = payload(json!({"temperatura": "21.5"}));
        assert!(matches!(
            TemperatureReading::from_payload(&missing),
            Err(WebhookError::InvalidField("timestamp"))
        ));
    }

    #[tokio::test]
    async fn test_relay_posts_and_confirms() {
        let (url, mut received) = spawn_webhook(StatusCode::OK).await;
        let registry = Registry::start();
        install_temperature_relay(&registry, client_for(url)).unwrap();

        let (connection, mut outbound) = Connection::new(HashMap::new(), 8);
        registry.register(Arc::clone(&connection)).await.unwrap();

        let envelope = Envelope::new(
            TEMPERATURE_EVENT,
            payload(json!({"temperatura": "22", "timestamp": "1699000000"})),
        );
        assert_eq!(connection.dispatch(envelope).await, 1);

        assert_eq!(
            received.recv().await.unwrap(),
            json!({"temperatura": "22", "timestamp": "1699000000"})
        );
        let echoed = Envelope::decode(&outbound.recv().await.unwrap()).unwrap();
        assert_eq!(echoed.event, TEMPERATURE_CHANGED_EVENT);
        assert_eq!(echoed.payload["temperatura"], json!("22"));
        assert_eq!(echoed.payload["timestamp"], json!("1699000000"));
    }

    #[tokio::test]
    async fn test_invalid_reading_is_not_posted() {
        let (url, mut received) = spawn_webhook(StatusCode::OK).await;
        let registry = Registry::start();
        install_temperature_relay(&registry, client_for(url)).unwrap();

        let (connection, mut outbound) = Connection::new(HashMap::new(), 8);
        registry.register(Arc::clone(&connection)).await.unwrap();

        let envelope = Envelope::new(TEMPERATURE_EVENT, payload(json!({"temperatura": 22})));
        connection.dispatch(envelope).await;

        assert!(received.try_recv().is_err());
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_status_still_confirms() {
        let (url, mut received) = spawn_webhook(StatusCode::INTERNAL_SERVER_ERROR).await;
        let registry = Registry::start();
        install_temperature_relay(&registry, client_for(url)).unwrap();

        let (connection, mut outbound) = Connection::new(HashMap::new(), 8);
        registry.register(Arc::clone(&connection)).await.unwrap();

        let envelope = Envelope::new(
            TEMPERATURE_EVENT,
            payload(json!({"temperatura": "22", "timestamp": "1699000000"})),
        );
        connection.dispatch(envelope).await;

        assert!(received.recv().await.is_some());
        let echoed = Envelope::decode(&outbound.try_recv().unwrap()).unwrap();
        assert_eq!(echoed.event, TEMPERATURE_CHANGED_EVENT);
        assert_eq!(echoed.payload["temperatura"], json!("22"));
    }

    #[tokio::test]
    async fn test_unreachable_webhook_skips_confirmation() {
        // Bind then release a port so nothing is listening on it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = Registry::start();
        install_temperature_relay(&registry, client_for(format!("http://{}/webhook", addr)))
            .unwrap();

        let (connection, mut outbound) = Connection::new(HashMap::new(), 8);
        registry.register(Arc::clone(&connection)).await.unwrap();

        let envelope = Envelope::new(
            TEMPERATURE_EVENT,
            payload(json!({"temperatura": "22", "timestamp": "1699000000"})),
        );
        connection.dispatch(envelope).await;

        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_post_reports_status() {
        let (url, _received) = spawn_webhook(StatusCode::BAD_GATEWAY).await;
        let client = client_for(url);

        let result = client.post(&json!({"a": 1})).await;
        assert!(matches!(result, Err(WebhookError::Status(502))));
    }
}
