use std::sync::Arc;

use async_trait::async_trait;
use epu_core::{Address, MessageKind, ServiceError};

use crate::{BusError, Delivery, Mailbox, Transport};

/// Service-side handler for requests arriving at an endpoint.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handles operation `op` and returns the reply payload.
    async fn handle(&self, op: &str, payload: &[u8]) -> Result<Vec<u8>, ServiceError>;
}

/// Binds `address` and answers its requests until the mailbox closes.
pub async fn serve_endpoint(
    transport: Arc<dyn Transport>,
    address: &Address,
    handler: Arc<dyn RequestHandler>,
) -> Result<(), BusError> {
    let mailbox = transport.bind(address).await?;
    tracing::info!(address = %address, "serving endpoint");
    serve_mailbox(transport, mailbox, handler).await;
    Ok(())
}

/// Answers requests arriving at an already bound mailbox.
///
/// Each request runs in its own task, so replies may leave out of order.
pub async fn serve_mailbox(
    transport: Arc<dyn Transport>,
    mut mailbox: Mailbox,
    handler: Arc<dyn RequestHandler>,
) {
    while let Some(delivery) = mailbox.recv().await {
        let message = match delivery {
            Delivery::Message(message) => message,
            Delivery::Bounced {
                to, correlation_id, ..
            } => {
                tracing::debug!(to = %to, %correlation_id, "reply bounced");
                continue;
            }
        };

        let MessageKind::Request { op } = &message.kind else {
            tracing::debug!(
                address = %mailbox.address(),
                correlation_id = %message.correlation_id,
                "ignoring non-request message"
            );
            continue;
        };
        let op = op.clone();

        let transport = Arc::clone(&transport);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let reply = match handler.handle(&op, &message.payload).await {
                Ok(payload) => message.reply(payload),
                Err(err) => {
                    tracing::debug!(op = %op, error = %err, "request failed");
                    message.fault(err.code, err.message)
                }
            };

            let Some(reply) = reply else {
                return;
            };
            if let Err(err) = transport.send(reply).await {
                tracing::warn!(op = %op, error = %err, "failed to send reply");
            }
        });
    }

    tracing::info!(address = %mailbox.address(), "endpoint mailbox closed");
}
