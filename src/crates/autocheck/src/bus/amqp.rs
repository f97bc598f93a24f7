//! AMQP message bus backed by lapin

use super::{BusError, BusResult, MessageBus, MessageHandler};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Topic exchange; empty means the default exchange
    pub exchange: String,
    /// Substituted for `%s` in the queue templates
    pub queue_name: String,
    pub req_queue: String,
    pub resp_queue: String,
    pub connect_timeout_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange: String::new(),
            queue_name: "AutoCheck".to_string(),
            req_queue: "%s.DataServer.req".to_string(),
            resp_queue: "DataServer.%s.resp".to_string(),
            connect_timeout_ms: 10_000,
        }
    }
}

impl AmqpConfig {
    /// Connection URI with the vhost percent-encoded
    pub fn uri(&self) -> String {
        let vhost = match self.vhost.as_str() {
            "" | "/" => "%2f".to_string(),
            other => other.trim_start_matches('/').replace('/', "%2f"),
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, vhost
        )
    }

    /// Outgoing request queue, e.g. `AutoCheck.DataServer.req`
    pub fn request_queue(&self) -> String {
        self.req_queue.replace("%s", &self.queue_name)
    }

    /// Incoming response queue, e.g. `DataServer.AutoCheck.resp`
    pub fn response_queue(&self) -> String {
        self.resp_queue.replace("%s", &self.queue_name)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

struct Link {
    connection: Connection,
    channel: Channel,
}

/// First wait before a dropped consumer is re-established
const RESUBSCRIBE_BASE: Duration = Duration::from_millis(500);
/// Upper bound on the resubscribe backoff
const RESUBSCRIBE_MAX: Duration = Duration::from_secs(30);

/// Wait before resubscribe attempt `attempt` (zero-based)
fn resubscribe_delay(attempt: u32) -> Duration {
    RESUBSCRIBE_BASE
        .saturating_mul(2u32.saturating_pow(attempt.min(16)))
        .min(RESUBSCRIBE_MAX)
}

/// Connection state shared with the consumer tasks
struct Inner {
    config: AmqpConfig,
    link: tokio::sync::Mutex<Option<Link>>,
    connected: AtomicBool,
}

/// Message bus over a single AMQP connection and channel
///
/// The connection is opened lazily by the first publish or subscribe, or
/// eagerly with [`AmqpBus::connect_async`]. Each subscription runs its own
/// consumer task on the tokio runtime. When a consumer stream fails the
/// task reopens the link and consumes again, backing off between attempts.
pub struct AmqpBus {
    inner: Arc<Inner>,
    consumers: Mutex<Vec<JoinHandle<()>>>,
}

impl AmqpBus {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                link: tokio::sync::Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
            consumers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.inner.config
    }

    /// Start connecting in the background
    pub fn connect_async(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.channel().await {
                warn!(error = %e, "Background broker connect failed");
            }
        });
    }

    /// Connect if needed, giving up after `timeout`
    pub async fn wait_for_connection(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.inner.channel()).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Broker connection unavailable");
                false
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Gave up waiting for broker");
                false
            }
        }
    }

    /// Close consumers and the connection
    pub async fn close(&self) {
        for handle in self.consumers.lock().drain(..) {
            handle.abort();
        }
        if let Some(link) = self.inner.link.lock().await.take() {
            if let Err(e) = link.connection.close(200, "shutdown").await {
                debug!(error = %e, "Broker close reported an error");
            }
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        info!("Broker connection closed");
    }
}

impl Inner {
    /// Live channel, opening the connection on first use or after a drop
    async fn channel(&self) -> BusResult<Channel> {
        let mut link = self.link.lock().await;

        if let Some(existing) = link.as_ref() {
            let live =
                existing.connection.status().connected() && existing.channel.status().connected();
            if live {
                return Ok(existing.channel.clone());
            }
            warn!("Broker connection lost, reconnecting");
            self.connected.store(false, Ordering::SeqCst);
        }

        let uri = self.config.uri();
        let connection = tokio::time::timeout(
            self.config.connect_timeout(),
            Connection::connect(&uri, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            BusError::NotReady(format!(
                "connect to {}:{} timed out",
                self.config.host, self.config.port
            ))
        })?
        .map_err(|e| BusError::NotReady(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::NotReady(e.to_string()))?;

        self.declare_topology(&channel).await?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            exchange = %self.config.exchange,
            "Broker connected"
        );
        self.connected.store(true, Ordering::SeqCst);
        *link = Some(Link {
            connection,
            channel: channel.clone(),
        });
        Ok(channel)
    }

    async fn declare_topology(&self, channel: &Channel) -> BusResult<()> {
        if !self.config.exchange.is_empty() {
            channel
                .exchange_declare(
                    &self.config.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(transport)?;
        }

        for queue in [self.config.request_queue(), self.config.response_queue()] {
            self.declare_queue(channel, &queue).await?;
        }
        Ok(())
    }

    async fn declare_queue(&self, channel: &Channel, queue: &str) -> BusResult<()> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(transport)?;

        if !self.config.exchange.is_empty() {
            channel
                .queue_bind(
                    queue,
                    &self.config.exchange,
                    queue,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(transport)?;
        }
        debug!(queue = queue, "Queue declared");
        Ok(())
    }

    /// Declare `queue` and start consuming it on the live channel
    async fn open_consumer(&self, queue: &str) -> BusResult<Consumer> {
        let channel = self.channel().await?;
        self.declare_queue(&channel, queue).await?;

        channel
            .basic_consume(
                queue,
                &format!("autocheck-{queue}-{}", uuid::Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(transport)
    }

    /// Keep trying [`open_consumer`](Self::open_consumer) until it succeeds
    async fn reopen_consumer(&self, queue: &str) -> Consumer {
        let mut attempt = 0;
        loop {
            match self.open_consumer(queue).await {
                Ok(consumer) => {
                    info!(queue = queue, attempts = attempt + 1, "Consumer re-established");
                    return consumer;
                }
                Err(e) => {
                    let delay = resubscribe_delay(attempt);
                    error!(
                        queue = queue,
                        error = %e,
                        retry_ms = delay.as_millis() as u64,
                        "Resubscribe failed"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Deliver messages to `handler`, resubscribing whenever the stream ends
    async fn consume(
        self: Arc<Self>,
        queue: String,
        handler: Arc<dyn MessageHandler>,
        mut consumer: Consumer,
    ) {
        loop {
            while let Some(delivery) = consumer.next().await {
                let mut delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Consumer stream failed");
                        self.connected.store(false, Ordering::SeqCst);
                        break;
                    }
                };
                let payload = std::mem::take(&mut delivery.data);
                handler.handle(payload).await;
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    warn!(queue = %queue, error = %e, "Ack failed");
                }
            }
            warn!(queue = %queue, "Consumer stopped, resubscribing");
            consumer = self.reopen_consumer(&queue).await;
        }
    }

    fn mark_failed(&self, err: &BusError) {
        error!(error = %err, "Broker operation failed");
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn transport(err: lapin::Error) -> BusError {
    BusError::Transport(err.to_string())
}

#[async_trait]
impl MessageBus for AmqpBus {
    async fn publish(&self, routing_key: &str, payload: &[u8]) -> BusResult<()> {
        let channel = self.inner.channel().await?;
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());

        let confirm = channel
            .basic_publish(
                &self.inner.config.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(transport);
        let confirm = match confirm {
            Ok(confirm) => confirm,
            Err(e) => {
                self.inner.mark_failed(&e);
                return Err(e);
            }
        };
        confirm.await.map_err(transport)?;

        debug!(routing_key = routing_key, bytes = payload.len(), "Published");
        Ok(())
    }

    async fn subscribe(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> BusResult<()> {
        let consumer = self.inner.open_consumer(queue).await?;

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(inner.consume(queue.to_string(), handler, consumer));

        self.consumers.lock().push(handle);
        info!(queue = queue, "Subscribed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}
