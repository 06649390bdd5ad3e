//! AMQP (RabbitMQ) channel manager.
//!
//! Two connection modes:
//! - `Pooled`: a long-lived deadpool-lapin pool, one fresh channel leased per
//!   publish. Default.
//! - `PerCall`: dial, open a channel, and close both for every publish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::FieldTable,
    uri::AMQPUri,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info};

use super::{
    BrokerChannel, BusError, ChannelManager, ConnectionMode, ExchangeDeclaration, ExchangeKind,
    Message, Result,
};

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Connection tuning for `AmqpChannelManager`.
#[derive(Debug, Clone)]
pub struct AmqpOptions {
    /// Bound for dialing the broker.
    pub connect_timeout: Duration,
    /// Maximum pooled connections.
    pub pool_max_size: usize,
    pub mode: ConnectionMode,
    /// Put channels in confirm mode and wait for the broker's ack.
    pub confirms: bool,
}

impl Default for AmqpOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            pool_max_size: 10,
            mode: ConnectionMode::Pooled,
            confirms: false,
        }
    }
}

enum Backend {
    Pooled(Pool),
    PerCall { endpoint: String },
}

/// RabbitMQ channel manager.
pub struct AmqpChannelManager {
    backend: Backend,
    options: AmqpOptions,
    closed: AtomicBool,
}

impl AmqpChannelManager {
    /// Validate `endpoint`, dial the broker and verify the connection.
    pub async fn connect(endpoint: &str, options: AmqpOptions) -> Result<Self> {
        validate_endpoint(endpoint)?;

        let backend = match options.mode {
            ConnectionMode::Pooled => {
                let manager = Manager::new(endpoint.to_string(), ConnectionProperties::default());
                let pool = Pool::builder(manager)
                    .max_size(options.pool_max_size)
                    .build()
                    .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

                // Verify connection
                let conn = tokio::time::timeout(options.connect_timeout, pool.get())
                    .await
                    .map_err(|_| connect_timeout(options.connect_timeout))?
                    .map_err(pool_error)?;
                drop(conn);

                Backend::Pooled(pool)
            }
            ConnectionMode::PerCall => {
                let conn = dial(endpoint, options.connect_timeout).await?;
                if let Err(e) = conn.close(REPLY_SUCCESS, "connection check").await {
                    debug!(error = %e, "Failed to close check connection");
                }
                Backend::PerCall {
                    endpoint: endpoint.to_string(),
                }
            }
        };

        info!(
            endpoint = %redact_endpoint(endpoint),
            mode = ?options.mode,
            confirms = options.confirms,
            "Connected to AMQP"
        );

        Ok(Self {
            backend,
            options,
            closed: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &AmqpOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn prepare(&self, channel: &Channel) -> Result<()> {
        if self.options.confirms {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| channel_error("Failed to enable confirms", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelManager for AmqpChannelManager {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if self.is_closed() {
            return Err(BusError::Channel("Connection is closed".to_string()));
        }

        let channel = match &self.backend {
            Backend::Pooled(pool) => {
                let conn = tokio::time::timeout(self.options.connect_timeout, pool.get())
                    .await
                    .map_err(|_| connect_timeout(self.options.connect_timeout))?
                    .map_err(pool_error)?;

                let channel = conn
                    .create_channel()
                    .await
                    .map_err(|e| channel_error("Failed to create channel", e))?;
                AmqpChannel {
                    channel,
                    connection: None,
                    confirms: self.options.confirms,
                }
            }
            Backend::PerCall { endpoint } => {
                let conn = dial(endpoint, self.options.connect_timeout).await?;
                let channel = match conn.create_channel().await {
                    Ok(channel) => channel,
                    Err(e) => {
                        if let Err(close_err) =
                            conn.close(REPLY_SUCCESS, "channel open failed").await
                        {
                            debug!(
                                error = %close_err,
                                "Failed to close connection after channel error"
                            );
                        }
                        return Err(channel_error("Failed to create channel", e));
                    }
                };
                AmqpChannel {
                    channel,
                    connection: Some(conn),
                    confirms: self.options.confirms,
                }
            }
        };

        if let Err(e) = self.prepare(&channel.channel).await {
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "Failed to close channel after setup error");
            }
            return Err(e);
        }

        debug!(channel_id = channel.channel.id(), "Opened channel");
        Ok(Box::new(channel))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Backend::Pooled(pool) = &self.backend {
            pool.close();
        }
        info!("AMQP connection closed");
        Ok(())
    }
}

/// A lapin channel, plus its connection in per-call mode.
struct AmqpChannel {
    channel: Channel,
    connection: Option<Connection>,
    confirms: bool,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()> {
        self.channel
            .exchange_declare(
                &declaration.name,
                lapin_kind(declaration.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: declaration.durable,
                    auto_delete: declaration.auto_delete,
                    internal: declaration.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(&declaration.name, e))
    }

    async fn publish(&self, exchange: &str, message: &Message) -> Result<()> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties(message),
            )
            .await
            .map_err(|e| channel_error("Failed to publish", e))?;

        if self.confirms {
            let confirmation = confirm
                .await
                .map_err(|e| channel_error("Publish confirmation failed", e))?;
            if let Confirmation::Nack(_) = confirmation {
                return Err(BusError::Nacked {
                    exchange: exchange.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let result = if self.channel.status().connected() {
            self.channel
                .close(REPLY_SUCCESS, "publish complete")
                .await
                .map_err(|e| channel_error("Failed to close channel", e))
        } else {
            Ok(())
        };

        if let Some(conn) = &self.connection {
            if conn.status().connected() {
                conn.close(REPLY_SUCCESS, "publish complete")
                    .await
                    .map_err(|e| BusError::Connection(format!("Failed to close connection: {}", e)))?;
            }
        }
        result
    }
}

fn properties(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_content_type(message.content_type.as_str().into())
        .with_delivery_mode(if message.persistent { 2 } else { 1 });

    if let Some(id) = &message.message_id {
        properties = properties.with_message_id(id.as_str().into());
    }
    if let Some(ts) = message.timestamp {
        properties = properties.with_timestamp(ts);
    }
    if let Some(app_id) = &message.app_id {
        properties = properties.with_app_id(app_id.as_str().into());
    }
    properties
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

/// Check that `endpoint` is a well-formed AMQP URI without dialing it.
pub fn validate_endpoint(endpoint: &str) -> Result<()> {
    endpoint
        .parse::<AMQPUri>()
        .map(|_| ())
        .map_err(|e| BusError::Connection(format!("Invalid endpoint: {}", e)))
}

async fn dial(endpoint: &str, timeout: Duration) -> Result<Connection> {
    tokio::time::timeout(
        timeout,
        Connection::connect(endpoint, ConnectionProperties::default()),
    )
    .await
    .map_err(|_| connect_timeout(timeout))?
    .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))
}

fn connect_timeout(timeout: Duration) -> BusError {
    BusError::Connection(format!("Timed out connecting after {:?}", timeout))
}

fn pool_error(e: PoolError) -> BusError {
    BusError::Connection(format!("Failed to get connection from pool: {}", e))
}

/// 406 PRECONDITION_FAILED on declare means the exchange exists with other
/// properties.
fn declare_error(exchange: &str, err: lapin::Error) -> BusError {
    if let lapin::Error::ProtocolError(amqp) = &err {
        if matches!(
            amqp.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ) {
            return BusError::Topology {
                exchange: exchange.to_string(),
                message: amqp.to_string(),
            };
        }
    }
    channel_error("Failed to declare exchange", err)
}

fn channel_error(context: &str, err: lapin::Error) -> BusError {
    match err {
        lapin::Error::InvalidConnectionState(_) | lapin::Error::IOError(_) => {
            BusError::Connection(format!("{}: {}", context, err))
        }
        _ => BusError::Channel(format!("{}: {}", context, err)),
    }
}

/// Strip credentials from an endpoint before logging it.
fn redact_endpoint(endpoint: &str) -> String {
    match (endpoint.find("://"), endpoint.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &endpoint[..scheme_end], &endpoint[at + 1..])
        }
        _ => endpoint.to_string(),
    }
}
