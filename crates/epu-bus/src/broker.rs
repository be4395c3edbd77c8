use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use epu_core::{Address, Message};
use tokio::{
    net::{UnixListener, UnixStream, unix::OwnedWriteHalf},
    sync::mpsc::{self, error::TrySendError},
};

use crate::{
    BusError,
    codec::{decode, encode},
    framing::{next_frame, write_frame},
    wire::{BrokerFrame, ClientFrame},
};

type ConnId = u64;

/// Frames queued per connection before routed messages to it bounce.
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Routing table shared by all broker connections.
#[derive(Default)]
struct Broker {
    routes: Mutex<HashMap<Address, Route>>,
}

struct Route {
    conn: ConnId,
    binding: u64,
    outbound: mpsc::Sender<BrokerFrame>,
}

/// Binds `path` and routes bus traffic between connected transports forever.
pub async fn serve_unix(path: &Path) -> Result<(), BusError> {
    let listener = UnixListener::bind(path)?;
    serve(listener).await
}

/// Routes bus traffic for connections accepted on `listener`.
pub async fn serve(listener: UnixListener) -> Result<(), BusError> {
    let broker = Arc::new(Broker::default());
    let mut next_conn: ConnId = 1;

    loop {
        let (stream, _) = listener.accept().await?;
        let conn = next_conn;
        next_conn = next_conn.wrapping_add(1);
        let broker = Arc::clone(&broker);

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, conn, &broker).await {
                tracing::debug!(error = %err, conn, "connection handler exited with error");
            }
        });
    }
}

async fn handle_connection(
    stream: UnixStream,
    conn: ConnId,
    broker: &Broker,
) -> Result<(), BusError> {
    let (mut reader, writer) = stream.into_split();
    let (outbound, queue) = mpsc::channel(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(write_loop(writer, queue));

    let result = async {
        while let Some(frame) = next_frame(&mut reader).await? {
            match decode::<ClientFrame>(&frame)? {
                ClientFrame::Bind { address, binding } => {
                    let reply = broker.bind(&address, conn, binding, &outbound);
                    let _ = outbound.send(reply).await;
                }
                ClientFrame::Unbind { address, binding } => {
                    broker.unbind(&address, conn, binding)
                }
                ClientFrame::Send { message } => {
                    // Frames answering this connection wait for its own writer.
                    if let Some(bounce) = broker.route(message) {
                        let _ = outbound.send(bounce).await;
                    }
                }
            }
        }
        Ok::<(), BusError>(())
    }
    .await;

    drop(outbound);
    broker.forget(conn);
    let _ = writer_task.await;
    result
}

async fn write_loop(mut writer: OwnedWriteHalf, mut queue: mpsc::Receiver<BrokerFrame>) {
    while let Some(frame) = queue.recv().await {
        let written = match encode(&frame) {
            Ok(payload) => write_frame(&mut writer, &payload).await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            tracing::debug!(error = %err, "broker write failed");
            return;
        }
    }
}

impl Broker {
    fn routes(&self) -> MutexGuard<'_, HashMap<Address, Route>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claims `address` for `conn`. A connection may rebind its own address.
    fn bind(
        &self,
        address: &Address,
        conn: ConnId,
        binding: u64,
        outbound: &mpsc::Sender<BrokerFrame>,
    ) -> BrokerFrame {
        let mut routes = self.routes();
        if let Some(route) = routes.get(address)
            && route.conn != conn
            && !route.outbound.is_closed()
        {
            return BrokerFrame::BindRejected {
                address: address.clone(),
                reason: "address in use".to_string(),
            };
        }

        routes.insert(
            address.clone(),
            Route {
                conn,
                binding,
                outbound: outbound.clone(),
            },
        );
        tracing::info!(address = %address, conn, binding, "endpoint bound");
        BrokerFrame::Bound {
            address: address.clone(),
        }
    }

    fn unbind(&self, address: &Address, conn: ConnId, binding: u64) {
        let mut routes = self.routes();
        if routes
            .get(address)
            .is_some_and(|route| route.conn == conn && route.binding == binding)
        {
            routes.remove(address);
            tracing::info!(address = %address, conn, "endpoint released");
        }
    }

    /// Forwards `message`; returns the bounce notice when it has no route or
    /// the destination's queue is full.
    fn route(&self, message: Message) -> Option<BrokerFrame> {
        let outbound = self
            .routes()
            .get(&message.to)
            .map(|route| route.outbound.clone());
        let Some(outbound) = outbound else {
            return bounce(message, "no endpoint bound");
        };

        match outbound.try_send(BrokerFrame::Deliver { message }) {
            Ok(()) => None,
            Err(TrySendError::Full(BrokerFrame::Deliver { message })) => {
                bounce(message, "endpoint busy")
            }
            Err(TrySendError::Closed(BrokerFrame::Deliver { message })) => {
                bounce(message, "endpoint disconnected")
            }
            Err(_) => None,
        }
    }

    fn forget(&self, conn: ConnId) {
        let mut routes = self.routes();
        let before = routes.len();
        routes.retain(|_, route| route.conn != conn);
        let released = before - routes.len();
        if released > 0 {
            tracing::info!(conn, released, "released endpoints of closed connection");
        }
    }
}

fn bounce(message: Message, reason: &str) -> Option<BrokerFrame> {
    tracing::debug!(to = %message.to, reason, "bouncing message");
    let reply_to = message.reply_to?;
    Some(BrokerFrame::Bounced {
        to: message.to,
        reply_to,
        correlation_id: message.correlation_id,
        reason: reason.to_string(),
    })
}
