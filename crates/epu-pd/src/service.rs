use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;
use epu_bus::RequestHandler;
use epu_core::{
    Constraint, DISPATCH_PROCESS_OP, DispatchRequest, DispatchResult, ErrorCode, ProcessId,
    ProcessSpec, ProcessState, ServiceError,
};
use serde_json::{Map, Value, json};

use crate::constraints::match_constraints;

/// A single process request known to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub upid: ProcessId,
    pub spec: ProcessSpec,
    pub constraints: Vec<Constraint>,
    pub immediate: bool,
    pub state: ProcessState,
    pub round: u32,
}

impl ProcessRecord {
    fn to_result(&self) -> DispatchResult {
        let mut result = DispatchResult::new(self.upid.clone(), self.state.clone());
        result.extra.insert("round".to_string(), json!(self.round));
        result
    }
}

/// In-memory process dispatcher fielding `dispatch_process` requests.
///
/// Requests are idempotent by upid: a repeated upid returns the record
/// created by the first request and never creates a second one.
pub struct ProcessDispatcher {
    properties: Map<String, Value>,
    records: Mutex<HashMap<ProcessId, ProcessRecord>>,
}

impl ProcessDispatcher {
    /// Creates a dispatcher whose resources advertise `properties`.
    pub fn new(properties: Map<String, Value>) -> Self {
        Self {
            properties,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn dispatch_process(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchResult, ServiceError> {
        if request.spec.is_empty() {
            return Err(ServiceError::invalid_request("process spec cannot be empty"));
        }

        let mut records = self.records();
        if let Some(existing) = records.get(&request.upid) {
            if existing.spec != request.spec {
                tracing::warn!(upid = %request.upid, "repeated upid carries a different spec");
            }
            tracing::debug!(upid = %request.upid, state = %existing.state, "repeated dispatch");
            return Ok(existing.to_result());
        }

        let state = if match_constraints(&request.constraints, &self.properties) {
            ProcessState::Pending
        } else if request.immediate {
            ProcessState::Rejected
        } else {
            ProcessState::Waiting
        };
        tracing::info!(upid = %request.upid, state = %state, "process dispatched");

        let record = ProcessRecord {
            upid: request.upid,
            spec: request.spec,
            constraints: request.constraints,
            immediate: request.immediate,
            state,
            round: 0,
        };
        let result = record.to_result();
        records.insert(record.upid.clone(), record);
        Ok(result)
    }

    /// Number of distinct processes ever recorded.
    pub fn launch_count(&self) -> usize {
        self.records().len()
    }

    pub fn record(&self, upid: &ProcessId) -> Option<ProcessRecord> {
        self.records().get(upid).cloned()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ProcessId, ProcessRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RequestHandler for ProcessDispatcher {
    async fn handle(&self, op: &str, payload: &[u8]) -> Result<Vec<u8>, ServiceError> {
        if op != DISPATCH_PROCESS_OP {
            return Err(ServiceError::unknown_operation(op));
        }

        let request: DispatchRequest = serde_json::from_slice(payload).map_err(|err| {
            ServiceError::invalid_request(format!("malformed dispatch request: {err}"))
        })?;
        let result = self.dispatch_process(request)?;
        serde_json::to_vec(&result).map_err(|err| ServiceError {
            code: ErrorCode::Internal,
            message: format!("failed to encode result: {err}"),
        })
    }
}
