//! Identifiers and wire types shared by the EPU dispatch components.

pub mod errors;
pub mod ids;
pub mod paths;
pub mod protocol;

pub use errors::{ErrorCode, ServiceError};
pub use ids::{Address, ClientIdentity, CorrelationId, InvalidProcessId, ProcessId};
pub use paths::default_broker_socket;
pub use protocol::{
    Constraint, DEFAULT_DISPATCHER_ENDPOINT, DISPATCH_PROCESS_OP, DispatchRequest,
    DispatchResult, Message, MessageKind, ProcessSpec, ProcessState,
};
