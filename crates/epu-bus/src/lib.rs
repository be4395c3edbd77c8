//! Message bus for EPU components: named-address routing in process or
//! through a CBOR-over-UNIX-socket broker.

mod error;

pub mod broker;
pub mod codec;
pub mod framing;
pub mod memory;
pub mod responder;
pub mod socket;
pub mod transport;
pub mod wire;

pub use broker::serve_unix;
pub use error::BusError;
pub use memory::MemoryBus;
pub use responder::{RequestHandler, serve_endpoint, serve_mailbox};
pub use socket::SocketTransport;
pub use transport::{Delivery, MAILBOX_CAPACITY, Mailbox, Transport};
