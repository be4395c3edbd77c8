use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Address, CorrelationId, ErrorCode, ProcessId};

/// Operation name of a process launch request.
pub const DISPATCH_PROCESS_OP: &str = "dispatch_process";

/// Endpoint name the process dispatcher registers under by default.
pub const DEFAULT_DISPATCHER_ENDPOINT: &str = "processdispatcher";

/// Unit of exchange on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Destination address.
    pub to: Address,
    /// Where replies and bounce notices go, if anywhere.
    pub reply_to: Option<Address>,
    /// Sender-assigned token echoed by the reply.
    pub correlation_id: CorrelationId,
    /// What this message is.
    pub kind: MessageKind,
    /// Operation body, JSON-encoded.
    pub payload: Vec<u8>,
}

impl Message {
    /// Builds the reply to `self` carrying `payload`, if a reply address exists.
    pub fn reply(&self, payload: Vec<u8>) -> Option<Message> {
        let to = self.reply_to.clone()?;
        Some(Message {
            to,
            reply_to: None,
            correlation_id: self.correlation_id,
            kind: MessageKind::Reply,
            payload,
        })
    }

    /// Builds the fault reply to `self`, if a reply address exists.
    pub fn fault(&self, code: ErrorCode, message: String) -> Option<Message> {
        let to = self.reply_to.clone()?;
        Some(Message {
            to,
            reply_to: None,
            correlation_id: self.correlation_id,
            kind: MessageKind::Fault { code, message },
            payload: Vec::new(),
        })
    }
}

/// Message role on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    /// Invocation of a named operation.
    Request {
        /// Operation name.
        op: String,
    },
    /// Successful answer to a request.
    Reply,
    /// The service could not process the request at all.
    Fault {
        /// High-level error category.
        code: ErrorCode,
        /// Human-readable summary.
        message: String,
    },
}

/// Launch description; opaque to the client and interpreted by the service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessSpec(pub Map<String, Value>);

impl ProcessSpec {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

impl From<Map<String, Value>> for ProcessSpec {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Admission requirement: `property` must be advertised with one of `accepts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    /// Resource property name.
    pub property: String,
    /// Acceptable advertised values; any one suffices.
    pub accepts: Vec<Value>,
}

impl Constraint {
    pub fn new(property: impl Into<String>, accepts: Vec<Value>) -> Self {
        Self {
            property: property.into(),
            accepts,
        }
    }
}

/// Body of a `dispatch_process` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Idempotency key of this launch.
    pub upid: ProcessId,
    /// What to launch.
    pub spec: ProcessSpec,
    /// Scheduling constraints.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Refuse rather than queue when nothing matches right now.
    #[serde(default)]
    pub immediate: bool,
}

impl DispatchRequest {
    pub fn new(upid: ProcessId, spec: ProcessSpec, constraints: Vec<Constraint>) -> Self {
        Self {
            upid,
            spec,
            constraints,
            immediate: false,
        }
    }
}

/// Process state as reported by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProcessState {
    Requested,
    Waiting,
    Pending,
    Running,
    Terminating,
    Terminated,
    Failed,
    Rejected,
    DiedRequested,
    /// State name this client does not know.
    Other(String),
}

impl ProcessState {
    pub fn as_str(&self) -> &str {
        match self {
            ProcessState::Requested => "REQUESTED",
            ProcessState::Waiting => "WAITING",
            ProcessState::Pending => "PENDING",
            ProcessState::Running => "RUNNING",
            ProcessState::Terminating => "TERMINATING",
            ProcessState::Terminated => "TERMINATED",
            ProcessState::Failed => "FAILED",
            ProcessState::Rejected => "REJECTED",
            ProcessState::DiedRequested => "DIED_REQUESTED",
            ProcessState::Other(name) => name,
        }
    }
}

impl From<String> for ProcessState {
    fn from(name: String) -> Self {
        match name.as_str() {
            "REQUESTED" => ProcessState::Requested,
            "WAITING" => ProcessState::Waiting,
            "PENDING" => ProcessState::Pending,
            "RUNNING" => ProcessState::Running,
            "TERMINATING" => ProcessState::Terminating,
            "TERMINATED" => ProcessState::Terminated,
            "FAILED" => ProcessState::Failed,
            "REJECTED" => ProcessState::Rejected,
            "DIED_REQUESTED" => ProcessState::DiedRequested,
            _ => ProcessState::Other(name),
        }
    }
}

impl From<ProcessState> for String {
    fn from(state: ProcessState) -> Self {
        match state {
            ProcessState::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reply to a `dispatch_process` request.
///
/// Fields beyond `state` and `upid` are kept verbatim in `extra` so replies
/// from newer services survive a decode/encode cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchResult {
    /// Echo of the request's upid, when the service includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upid: Option<ProcessId>,
    /// State of the process record after the request was handled.
    pub state: ProcessState,
    /// Every other reply field.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DispatchResult {
    pub fn new(upid: ProcessId, state: ProcessState) -> Self {
        Self {
            upid: Some(upid),
            state,
            extra: Map::new(),
        }
    }

    /// True when the dispatcher refused the launch outright. A `FAILED`
    /// process was accepted and launched before it failed.
    pub fn is_rejected(&self) -> bool {
        self.state == ProcessState::Rejected
    }
}
