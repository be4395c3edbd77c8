use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use epu_core::{Address, Message};
use tokio::sync::mpsc;

use crate::{BusError, Delivery, MAILBOX_CAPACITY, Mailbox, Transport};

type Routes = HashMap<Address, mpsc::Sender<Delivery>>;

/// In-process bus routing messages between mailboxes over tokio channels.
///
/// Cloning yields another handle on the same routing table.
#[derive(Debug, Clone, Default)]
pub struct MemoryBus {
    routes: Arc<Mutex<Routes>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a live mailbox is bound at `address`.
    pub fn is_bound(&self, address: &Address) -> bool {
        self.routes()
            .get(address)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Drops every route; all mailboxes observe end of stream.
    pub fn close(&self) {
        let dropped = std::mem::take(&mut *self.routes());
        tracing::debug!(routes = dropped.len(), "memory bus closed");
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, address: &Address) -> Option<mpsc::Sender<Delivery>> {
        let mut routes = self.routes();
        match routes.get(address) {
            Some(sender) if sender.is_closed() => {
                routes.remove(address);
                None
            }
            Some(sender) => Some(sender.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn bind(&self, address: &Address) -> Result<Mailbox, BusError> {
        let mut routes = self.routes();
        if routes.get(address).is_some_and(|sender| !sender.is_closed()) {
            return Err(BusError::AddressInUse {
                address: address.clone(),
            });
        }

        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        routes.insert(address.clone(), tx);
        Ok(Mailbox::new(address.clone(), rx))
    }

    async fn send(&self, message: Message) -> Result<(), BusError> {
        let Some(sender) = self.route(&message.to) else {
            return Err(BusError::Unreachable {
                address: message.to,
            });
        };

        let to = message.to.clone();
        sender
            .send(Delivery::Message(message))
            .await
            .map_err(|_| BusError::Unreachable { address: to })
    }
}
