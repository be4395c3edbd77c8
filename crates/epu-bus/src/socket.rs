use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use epu_core::{Address, Message};
use tokio::{
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{
        Mutex as AsyncMutex,
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};

use crate::{
    BusError, Delivery, MAILBOX_CAPACITY, Mailbox, Transport,
    codec::{decode, encode},
    framing::{next_frame, write_frame},
    wire::{BrokerFrame, ClientFrame},
};

type BindAck = oneshot::Sender<Result<(), BusError>>;

/// Bus session over a UNIX socket connection to the broker.
///
/// Sends from concurrent tasks serialize on one writer lock; a single reader
/// task fans broker frames out to the bound mailboxes. The reader never waits
/// on a mailbox: deliveries to a full mailbox are dropped.
pub struct SocketTransport {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

struct Shared {
    writer: AsyncMutex<OwnedWriteHalf>,
    routes: Mutex<HashMap<Address, Route>>,
    pending_binds: Mutex<HashMap<Address, BindAck>>,
    next_binding: AtomicU64,
    closed: AtomicBool,
}

/// Local end of one binding; `binding` tells it apart from later rebinds.
struct Route {
    binding: u64,
    sender: mpsc::Sender<Delivery>,
}

impl SocketTransport {
    /// Connects to the broker socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, BusError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already connected stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let shared = Arc::new(Shared {
            writer: AsyncMutex::new(write_half),
            routes: Mutex::new(HashMap::new()),
            pending_binds: Mutex::new(HashMap::new()),
            next_binding: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(read_half, Arc::clone(&shared)));
        Self { shared, reader }
    }

    /// Whether the broker connection has been lost.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn bind(&self, address: &Address) -> Result<Mailbox, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        // The route exists before the broker acknowledges, so a delivery racing
        // the ack still finds its mailbox. A route whose mailbox was dropped is
        // replaced; the broker accepts the rebind from the same connection.
        let binding = self.shared.next_binding.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        {
            let mut routes = self.shared.routes();
            if routes
                .get(address)
                .is_some_and(|route| !route.sender.is_closed())
            {
                return Err(BusError::AddressInUse {
                    address: address.clone(),
                });
            }
            routes.insert(address.clone(), Route { binding, sender: tx });
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared
            .pending_binds()
            .insert(address.clone(), ack_tx);

        let outcome = match self
            .shared
            .write(&ClientFrame::Bind {
                address: address.clone(),
                binding,
            })
            .await
        {
            Ok(()) => ack_rx.await.unwrap_or(Err(BusError::Closed)),
            Err(err) => {
                self.shared.pending_binds().remove(address);
                Err(err)
            }
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(address = %address, binding, "bound bus address");
                Ok(Mailbox::new(address.clone(), rx))
            }
            Err(err) => {
                let mut routes = self.shared.routes();
                if routes
                    .get(address)
                    .is_some_and(|route| route.binding == binding)
                {
                    routes.remove(address);
                }
                Err(err)
            }
        }
    }

    async fn send(&self, message: Message) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        self.shared.write(&ClientFrame::Send { message }).await
    }
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, HashMap<Address, Route>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending_binds(&self) -> MutexGuard<'_, HashMap<Address, BindAck>> {
        self.pending_binds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn write(&self, frame: &ClientFrame) -> Result<(), BusError> {
        let payload = encode(frame)?;
        let mut writer = self.writer.lock().await;
        write_frame(&mut *writer, &payload).await
    }

    fn deliver(self: &Arc<Self>, address: &Address, delivery: Delivery) {
        let route = self
            .routes()
            .get(address)
            .map(|route| (route.binding, route.sender.clone()));
        let Some((binding, sender)) = route else {
            tracing::debug!(address = %address, "dropping delivery for unbound address");
            return;
        };

        match sender.try_send(delivery) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    address = %address,
                    capacity = MAILBOX_CAPACITY,
                    "mailbox full; dropping delivery"
                );
            }
            Err(TrySendError::Closed(_)) => self.release(address, binding),
        }
    }

    /// Forgets a binding whose mailbox was dropped and tells the broker.
    fn release(self: &Arc<Self>, address: &Address, binding: u64) {
        {
            let mut routes = self.routes();
            if !routes
                .get(address)
                .is_some_and(|route| route.binding == binding)
            {
                return;
            }
            routes.remove(address);
        }

        // Written off the reader task; the broker ignores it if a newer
        // binding of the address got there first.
        let shared = Arc::clone(self);
        let unbind = ClientFrame::Unbind {
            address: address.clone(),
            binding,
        };
        tokio::spawn(async move {
            if let Err(err) = shared.write(&unbind).await {
                tracing::debug!(error = %err, "failed to release address");
            }
        });
    }

    fn shut_down(&self) {
        self.closed.store(true, Ordering::Release);
        self.routes().clear();
        self.pending_binds().clear();
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    loop {
        let frame = match next_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("broker closed the connection");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "broker connection failed");
                break;
            }
        };

        let frame = match decode::<BrokerFrame>(&frame) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "undecodable broker frame");
                break;
            }
        };

        match frame {
            BrokerFrame::Bound { address } => {
                if let Some(ack) = shared.pending_binds().remove(&address) {
                    let _ = ack.send(Ok(()));
                }
            }
            BrokerFrame::BindRejected { address, reason } => {
                if let Some(ack) = shared.pending_binds().remove(&address) {
                    let _ = ack.send(Err(BusError::BindRejected { address, reason }));
                }
            }
            BrokerFrame::Deliver { message } => {
                let address = message.to.clone();
                shared.deliver(&address, Delivery::Message(message));
            }
            BrokerFrame::Bounced {
                to,
                reply_to,
                correlation_id,
                reason,
            } => {
                let bounce = Delivery::Bounced {
                    to,
                    correlation_id,
                    reason,
                };
                shared.deliver(&reply_to, bounce);
            }
        }
    }

    shared.shut_down();
}
