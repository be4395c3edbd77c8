use std::{
    collections::HashMap,
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use epu_bus::{BusError, Delivery, Mailbox, SocketTransport, Transport};
use epu_core::{
    Address, ClientIdentity, Constraint, CorrelationId, DISPATCH_PROCESS_OP, DispatchRequest,
    DispatchResult, Message, MessageKind, ProcessId, ProcessSpec,
};
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};

use crate::{ConnectError, DispatchError};

/// Default bound on one request/reply exchange.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request/reply client for a remote process dispatcher.
///
/// Cheap to clone; clones share the reply mailbox, so concurrent
/// `dispatch` calls from any clone are routed to their own callers.
#[derive(Clone)]
pub struct DispatchClient {
    inner: Arc<Inner>,
    endpoint: Address,
    timeout: Duration,
}

struct Inner {
    transport: Arc<dyn Transport>,
    identity: ClientIdentity,
    reply_address: Address,
    next_correlation: AtomicU64,
    waiters: Arc<Waiters>,
    router: JoinHandle<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.router.abort();
    }
}

/// Outstanding calls keyed by correlation token.
#[derive(Default)]
struct Waiters {
    state: Mutex<WaiterState>,
}

struct WaiterState {
    open: bool,
    calls: HashMap<CorrelationId, oneshot::Sender<Delivery>>,
}

impl Default for WaiterState {
    fn default() -> Self {
        Self {
            open: true,
            calls: HashMap::new(),
        }
    }
}

impl Waiters {
    fn state(&self) -> MutexGuard<'_, WaiterState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn register(&self, correlation_id: CorrelationId) -> Option<oneshot::Receiver<Delivery>> {
        let mut state = self.state();
        if !state.open {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        state.calls.insert(correlation_id, tx);
        Some(rx)
    }

    fn take(&self, correlation_id: CorrelationId) -> Option<oneshot::Sender<Delivery>> {
        self.state().calls.remove(&correlation_id)
    }

    /// Fails every outstanding call and refuses new ones.
    fn close(&self) {
        let mut state = self.state();
        state.open = false;
        state.calls.clear();
    }
}

/// Deregisters a call when it resolves, times out, or is abandoned.
struct CallGuard<'a> {
    waiters: &'a Waiters,
    correlation_id: CorrelationId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.waiters.take(self.correlation_id);
    }
}

impl DispatchClient {
    /// Binds `identity` as the reply address on `transport`.
    pub async fn bind(
        transport: Arc<dyn Transport>,
        identity: ClientIdentity,
        endpoint: Address,
    ) -> Result<Self, ConnectError> {
        let reply_address = identity.address();
        let mailbox = transport
            .bind(&reply_address)
            .await
            .map_err(|source| ConnectError::Bind {
                address: reply_address.clone(),
                source,
            })?;

        let waiters = Arc::new(Waiters::default());
        let router = tokio::spawn(route_replies(mailbox, Arc::clone(&waiters)));

        tracing::debug!(identity = %identity, endpoint = %endpoint, "dispatch client bound");

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                identity,
                reply_address,
                next_correlation: AtomicU64::new(1),
                waiters,
                router,
            }),
            endpoint,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Connects to the broker at `socket` and binds `identity` there.
    pub async fn connect(
        socket: impl AsRef<Path>,
        identity: ClientIdentity,
        endpoint: Address,
    ) -> Result<Self, ConnectError> {
        let socket = socket.as_ref();
        let transport = SocketTransport::connect(socket)
            .await
            .map_err(|source| ConnectError::Connect {
                path: socket.to_path_buf(),
                source,
            })?;
        Self::bind(Arc::new(transport), identity, endpoint).await
    }

    /// Overrides the default call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.inner.identity
    }

    pub fn endpoint(&self) -> &Address {
        &self.endpoint
    }

    /// Asks the dispatcher to launch `spec` under the idempotency key `upid`.
    pub async fn dispatch(
        &self,
        upid: ProcessId,
        spec: ProcessSpec,
        constraints: Vec<Constraint>,
    ) -> Result<DispatchResult, DispatchError> {
        self.dispatch_request(DispatchRequest::new(upid, spec, constraints))
            .await
    }

    /// Sends one prepared request and waits for its correlated reply.
    ///
    /// Any correlated reply is returned as success, whatever process state it
    /// reports. Nothing is retried here.
    pub async fn dispatch_request(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchResult, DispatchError> {
        if request.spec.is_empty() {
            return Err(DispatchError::InvalidRequest {
                reason: "process spec cannot be empty".to_string(),
            });
        }
        let payload =
            serde_json::to_vec(&request).map_err(|err| DispatchError::InvalidRequest {
                reason: format!("failed to encode request: {err}"),
            })?;

        let correlation_id =
            CorrelationId(self.inner.next_correlation.fetch_add(1, Ordering::Relaxed));
        let waiter = self
            .inner
            .waiters
            .register(correlation_id)
            .ok_or(DispatchError::Transport(BusError::Closed))?;
        let _guard = CallGuard {
            waiters: &self.inner.waiters,
            correlation_id,
        };

        let message = Message {
            to: self.endpoint.clone(),
            reply_to: Some(self.inner.reply_address.clone()),
            correlation_id,
            kind: MessageKind::Request {
                op: DISPATCH_PROCESS_OP.to_string(),
            },
            payload,
        };

        tracing::debug!(
            upid = %request.upid,
            endpoint = %self.endpoint,
            %correlation_id,
            "sending dispatch request"
        );

        let exchange = async {
            match self.inner.transport.send(message).await {
                Ok(()) => {}
                Err(BusError::Unreachable { address }) => {
                    return Err(DispatchError::EndpointUnreachable {
                        endpoint: address,
                        reason: "no endpoint bound".to_string(),
                    });
                }
                Err(err) => return Err(DispatchError::Transport(err)),
            }
            waiter
                .await
                .map_err(|_| DispatchError::Transport(BusError::Closed))
        };

        let delivery = match timeout(self.timeout, exchange).await {
            Ok(delivery) => delivery?,
            Err(_) => {
                tracing::warn!(
                    upid = %request.upid,
                    endpoint = %self.endpoint,
                    %correlation_id,
                    "dispatch timed out; outcome unknown"
                );
                return Err(DispatchError::Timeout {
                    endpoint: self.endpoint.clone(),
                    timeout: self.timeout,
                });
            }
        };

        self.resolve(&request.upid, delivery)
    }

    fn resolve(
        &self,
        upid: &ProcessId,
        delivery: Delivery,
    ) -> Result<DispatchResult, DispatchError> {
        let message = match delivery {
            Delivery::Message(message) => message,
            Delivery::Bounced { to, reason, .. } => {
                return Err(DispatchError::EndpointUnreachable {
                    endpoint: to,
                    reason,
                });
            }
        };

        match message.kind {
            MessageKind::Reply => decode_result(&self.endpoint, upid, message.payload),
            MessageKind::Fault { code, message } => Err(DispatchError::Remote {
                endpoint: self.endpoint.clone(),
                code,
                message,
            }),
            MessageKind::Request { op } => Err(DispatchError::Protocol {
                endpoint: self.endpoint.clone(),
                reason: format!("expected a reply, got request {op}"),
                payload: message.payload,
            }),
        }
    }
}

fn decode_result(
    endpoint: &Address,
    upid: &ProcessId,
    payload: Vec<u8>,
) -> Result<DispatchResult, DispatchError> {
    let result = match serde_json::from_slice::<DispatchResult>(&payload) {
        Ok(result) => result,
        Err(err) => {
            return Err(DispatchError::Protocol {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
                payload,
            });
        }
    };

    if let Some(echoed) = &result.upid
        && echoed != upid
    {
        return Err(DispatchError::Protocol {
            endpoint: endpoint.clone(),
            reason: format!("reply is for process {echoed}, expected {upid}"),
            payload,
        });
    }

    tracing::debug!(upid = %upid, state = %result.state, "dispatch resolved");
    Ok(result)
}

/// Hands each delivery at the reply mailbox to the call it correlates with.
async fn route_replies(mut mailbox: Mailbox, waiters: Arc<Waiters>) {
    while let Some(delivery) = mailbox.recv().await {
        let correlation_id = match &delivery {
            Delivery::Message(message) => message.correlation_id,
            Delivery::Bounced { correlation_id, .. } => *correlation_id,
        };

        match waiters.take(correlation_id) {
            Some(waiter) => {
                let _ = waiter.send(delivery);
            }
            None => tracing::debug!(
                address = %mailbox.address(),
                %correlation_id,
                "dropping late or uncorrelated reply"
            ),
        }
    }

    tracing::debug!(address = %mailbox.address(), "reply mailbox closed");
    waiters.close();
}
