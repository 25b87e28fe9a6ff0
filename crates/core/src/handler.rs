use async_trait::async_trait;
use chainscan_common::{TransactionHandler, TransactionRecord};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Logs every scanned block's transactions.
#[derive(Debug, Default, Clone)]
pub struct LoggingHandler;

#[async_trait]
impl TransactionHandler for LoggingHandler {
    async fn handle(&self, transactions: Vec<TransactionRecord>) {
        let Some(first) = transactions.first() else {
            return;
        };
        info!(
            "Block {} at height {}: {} transactions",
            first.block_hash,
            first.height,
            transactions.len()
        );
        for tx in &transactions {
            debug!(
                "  tx {} (vin {}, vout {})",
                tx.tx_id, tx.vin_size, tx.vout_size
            );
        }
    }
}

/// Forwards each batch to a channel, for consumers living in another task.
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    sender: mpsc::UnboundedSender<Vec<TransactionRecord>>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<TransactionRecord>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl TransactionHandler for ChannelHandler {
    async fn handle(&self, transactions: Vec<TransactionRecord>) {
        if self.sender.send(transactions).is_err() {
            debug!("Transaction receiver dropped");
        }
    }
}

/// Dispatches each batch to several handlers in order.
#[derive(Default, Clone)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn TransactionHandler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: Arc<dyn TransactionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl TransactionHandler for HandlerChain {
    async fn handle(&self, transactions: Vec<TransactionRecord>) {
        for handler in &self.handlers {
            handler.handle(transactions.clone()).await;
        }
    }
}
