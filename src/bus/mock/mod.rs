//! Mock broker implementation for testing.
//!
//! Applies the same exchange declaration rules as a real broker and counts
//! open channels, so tests can assert that publishes never leak a channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BrokerChannel, BusError, ChannelManager, ExchangeDeclaration, Message, Result};

/// A message the mock broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub message: Message,
}

#[derive(Default)]
struct BrokerState {
    exchanges: RwLock<HashMap<String, ExchangeDeclaration>>,
    published: RwLock<Vec<PublishedMessage>>,
    unreachable: RwLock<bool>,
    send_delay: RwLock<Option<Duration>>,
    close_delay: RwLock<Option<Duration>>,
    closed: AtomicBool,
    open_channels: AtomicUsize,
    channels_opened: AtomicUsize,
}

/// In-memory broker for testing.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every `open_channel` with `BusError::Connection`.
    pub async fn set_unreachable(&self, unreachable: bool) {
        *self.state.unreachable.write().await = unreachable;
    }

    /// Delay every send by `delay`.
    pub async fn set_send_delay(&self, delay: Option<Duration>) {
        *self.state.send_delay.write().await = delay;
    }

    /// Delay every channel close by `delay`. The channel counts as open
    /// until the delay has passed.
    pub async fn set_close_delay(&self, delay: Option<Duration>) {
        *self.state.close_delay.write().await = delay;
    }

    /// Register an exchange as if another service had declared it.
    pub async fn preload_exchange(&self, declaration: ExchangeDeclaration) {
        self.state
            .exchanges
            .write()
            .await
            .insert(declaration.name.clone(), declaration);
    }

    pub async fn exchange(&self, name: &str) -> Option<ExchangeDeclaration> {
        self.state.exchanges.read().await.get(name).cloned()
    }

    /// Channels leased and not yet closed.
    pub fn open_channels(&self) -> usize {
        self.state.open_channels.load(Ordering::SeqCst)
    }

    /// Channels leased since creation.
    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub async fn published_count(&self) -> usize {
        self.state.published.read().await.len()
    }

    pub async fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.state.published.write().await)
    }
}

#[async_trait]
impl ChannelManager for MockBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        if self.is_closed() {
            return Err(BusError::Channel("Connection is closed".to_string()));
        }
        if *self.state.unreachable.read().await {
            return Err(BusError::Connection("Mock broker unreachable".to_string()));
        }

        self.state.open_channels.fetch_add(1, Ordering::SeqCst);
        self.state.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockChannel {
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockChannel {
    state: Arc<BrokerState>,
    closed: AtomicBool,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::Channel("Channel is closed".to_string()));
        }
        Ok(())
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_exchange(&self, declaration: &ExchangeDeclaration) -> Result<()> {
        self.ensure_open()?;

        let mut exchanges = self.state.exchanges.write().await;
        match exchanges.get(&declaration.name) {
            Some(existing) if existing == declaration => Ok(()),
            Some(existing) => {
                // The broker closes the channel on 406.
                let message = format!(
                    "PRECONDITION_FAILED - inequivalent arg: {}",
                    existing.differences(declaration).join(", ")
                );
                self.mark_closed();
                Err(BusError::Topology {
                    exchange: declaration.name.clone(),
                    message,
                })
            }
            None => {
                exchanges.insert(declaration.name.clone(), declaration.clone());
                Ok(())
            }
        }
    }

    async fn publish(&self, exchange: &str, message: &Message) -> Result<()> {
        self.ensure_open()?;

        if !self.state.exchanges.read().await.contains_key(exchange) {
            return Err(BusError::Channel(format!(
                "NOT_FOUND - no exchange '{}'",
                exchange
            )));
        }

        let delay = *self.state.send_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.state.published.write().await.push(PublishedMessage {
            exchange: exchange.to_string(),
            message: message.clone(),
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let delay = *self.state.close_delay.read().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.mark_closed();
        Ok(())
    }
}
