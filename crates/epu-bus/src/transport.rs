use async_trait::async_trait;
use epu_core::{Address, CorrelationId, Message};
use tokio::sync::mpsc;

use crate::BusError;

/// Per-mailbox queue depth.
pub const MAILBOX_CAPACITY: usize = 256;

/// What a mailbox receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// A message addressed to the mailbox.
    Message(Message),
    /// Notice that a message sent with this mailbox as `reply_to` had no route.
    Bounced {
        to: Address,
        correlation_id: CorrelationId,
        reason: String,
    },
}

/// Receiving end bound at one address.
#[derive(Debug)]
pub struct Mailbox {
    address: Address,
    rx: mpsc::Receiver<Delivery>,
}

impl Mailbox {
    pub fn new(address: Address, rx: mpsc::Receiver<Delivery>) -> Self {
        Self { address, rx }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Waits for the next delivery; `None` once the transport dropped the route.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

/// Message-passing substrate addressed by logical names.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Claims `address` and returns the mailbox receiving its messages.
    async fn bind(&self, address: &Address) -> Result<Mailbox, BusError>;

    /// Sends one message.
    ///
    /// Fails with [`BusError::Unreachable`] when the transport knows right away
    /// that nothing is bound at `message.to`. Otherwise unroutable messages
    /// come back as [`Delivery::Bounced`] at `message.reply_to`.
    async fn send(&self, message: Message) -> Result<(), BusError>;
}
