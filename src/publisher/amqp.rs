use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::fmt;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::model::ScanResult;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT: u8 = 2;

struct Session {
    connection: Connection,
    channel: Channel,
}

/// Publishes results to a durable AMQP queue through the default exchange.
///
/// The channel runs in confirm mode; a publish only succeeds once the broker
/// has acknowledged it. A dropped connection is reopened on the next publish.
pub struct AmqpPublisher {
    uri: String,
    queue: String,
    timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl fmt::Debug for AmqpPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmqpPublisher")
            .field("queue", &self.queue)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl AmqpPublisher {
    /// Connects, enables confirms and declares the queue. Failing here is
    /// fatal at startup.
    pub async fn connect(
        uri: impl Into<String>,
        queue: impl Into<String>,
        call_timeout: Duration,
    ) -> Result<Self, PublishError> {
        let publisher = Self {
            uri: uri.into(),
            queue: queue.into(),
            timeout: call_timeout,
            session: Mutex::new(None),
        };

        let session = publisher.open_session().await?;
        *publisher.session.lock().await = Some(session);

        info!(queue = %publisher.queue, "connected to broker");
        Ok(publisher)
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    async fn open_session(&self) -> Result<Session, PublishError> {
        let open = async {
            let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
            let channel = connection.create_channel().await?;
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await?;
            channel
                .queue_declare(
                    &self.queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            Ok::<_, lapin::Error>(Session {
                connection,
                channel,
            })
        };

        timeout(self.timeout, open)
            .await
            .map_err(|_| {
                let message = format!("connect timed out after {:?}", self.timeout);
                PublishError::BrokerUnavailable(message)
            })?
            .map_err(|e| PublishError::BrokerUnavailable(format!("failed to open channel: {e}")))
    }

    async fn send(&self, channel: &Channel, payload: &[u8]) -> Result<(), PublishError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let confirmation = channel
            .basic_publish("", &self.queue, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(|e| PublishError::BrokerUnavailable(format!("basic.publish failed: {e}")))?
            .await
            .map_err(|e| PublishError::BrokerUnavailable(format!("publish confirm failed: {e}")))?;

        if confirmation.is_nack() {
            return Err(PublishError::BrokerUnavailable(
                "broker rejected the message".to_string(),
            ));
        }
        Ok(())
    }

    /// Closes the channel and connection. Later publishes reconnect.
    pub async fn close(&self) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };

        if let Err(e) = session.channel.close(200, "shutdown").await {
            warn!(error = %e, "failed to close broker channel");
        }
        if let Err(e) = session.connection.close(200, "shutdown").await {
            warn!(error = %e, "failed to close broker connection");
        }
        info!("broker connection closed");
    }
}

#[async_trait]
impl super::JobPublisher for AmqpPublisher {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn publish(&self, result: &ScanResult) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(result).map_err(|e| {
            PublishError::BrokerUnavailable(format!("failed to serialize result: {e}"))
        })?;

        let mut guard = self.session.lock().await;
        let session = match guard.take() {
            Some(session) if session.channel.status().connected() => session,
            _ => {
                debug!(queue = %self.queue, "reopening broker channel");
                self.open_session().await?
            }
        };

        let outcome = match timeout(self.timeout, self.send(&session.channel, &payload)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublishError::BrokerUnavailable(format!(
                "publish timed out after {:?}",
                self.timeout
            ))),
        };

        if session.channel.status().connected() {
            *guard = Some(session);
        }

        if outcome.is_ok() {
            debug!(digest = %result.digest, queue = %self.queue, "result published");
        }
        outcome
    }
}
