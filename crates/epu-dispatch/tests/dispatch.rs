use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use epu_bus::{MemoryBus, RequestHandler, Transport, serve_endpoint};
use epu_core::{
    Address, ClientIdentity, DispatchRequest, DispatchResult, ErrorCode, ProcessId, ProcessSpec,
    ServiceError,
};
use epu_dispatch::{DispatchClient, DispatchError, ErrorKind};
use serde_json::{Value, json};
use tokio::time::sleep;

const ENDPOINT: &str = "processdispatcher";

fn spec(value: Value) -> ProcessSpec {
    serde_json::from_value(value).expect("spec should decode")
}

fn decode_request(payload: &[u8]) -> Result<DispatchRequest, ServiceError> {
    serde_json::from_slice(payload).map_err(|err| ServiceError::invalid_request(err.to_string()))
}

/// Accepts everything and echoes the upid.
struct Accepting {
    delay: fn(&ProcessId) -> Duration,
}

#[async_trait]
impl RequestHandler for Accepting {
    async fn handle(&self, _op: &str, payload: &[u8]) -> Result<Vec<u8>, ServiceError> {
        let request = decode_request(payload)?;
        sleep((self.delay)(&request.upid)).await;
        Ok(serde_json::to_vec(&json!({"state": "ACCEPTED", "upid": request.upid}))
            .expect("reply encode should succeed"))
    }
}

/// Records launches keyed by upid; repeated upids return the first record.
#[derive(Default)]
struct Deduplicating {
    launches: Mutex<HashMap<ProcessId, u32>>,
    requests: Mutex<u32>,
}

#[async_trait]
impl RequestHandler for Deduplicating {
    async fn handle(&self, _op: &str, payload: &[u8]) -> Result<Vec<u8>, ServiceError> {
        let request = decode_request(payload)?;
        *self.requests.lock().expect("lock") += 1;
        let mut launches = self.launches.lock().expect("lock");
        let next = launches.len() as u32 + 1;
        let launch = *launches.entry(request.upid.clone()).or_insert(next);
        Ok(serde_json::to_vec(&json!({
            "state": "PENDING",
            "upid": request.upid,
            "launch": launch,
        }))
        .expect("reply encode should succeed"))
    }
}

/// Replies with a fixed payload regardless of the request.
struct Canned(&'static [u8]);

#[async_trait]
impl RequestHandler for Canned {
    async fn handle(&self, _op: &str, _payload: &[u8]) -> Result<Vec<u8>, ServiceError> {
        Ok(self.0.to_vec())
    }
}

struct Refusing;

#[async_trait]
impl RequestHandler for Refusing {
    async fn handle(&self, _op: &str, _payload: &[u8]) -> Result<Vec<u8>, ServiceError> {
        Err(ServiceError::invalid_request("spec lacks run_type"))
    }
}

/// Tears the whole bus down while a request is in flight.
struct Crashing(MemoryBus);

#[async_trait]
impl RequestHandler for Crashing {
    async fn handle(&self, _op: &str, _payload: &[u8]) -> Result<Vec<u8>, ServiceError> {
        self.0.close();
        Ok(b"{}".to_vec())
    }
}

async fn start_service(bus: &MemoryBus, handler: Arc<dyn RequestHandler>) {
    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let mailbox = transport
        .bind(&Address::new(ENDPOINT))
        .await
        .expect("service bind should succeed");
    tokio::spawn(epu_bus::serve_mailbox(transport, mailbox, handler));
}

async fn client(bus: &MemoryBus) -> DispatchClient {
    DispatchClient::bind(
        Arc::new(bus.clone()),
        ClientIdentity::generate(),
        Address::new(ENDPOINT),
    )
    .await
    .expect("client bind should succeed")
}

#[tokio::test]
async fn accepted_reply_is_returned_as_result() {
    let bus = MemoryBus::new();
    start_service(&bus, Arc::new(Accepting { delay: |_| Duration::ZERO })).await;
    let client = client(&bus).await;

    let upid = ProcessId::generate();
    let result = client
        .dispatch(upid.clone(), spec(json!({"command": "echo hello"})), Vec::new())
        .await
        .expect("dispatch should succeed");

    let expected: DispatchResult =
        serde_json::from_value(json!({"state": "ACCEPTED", "upid": upid}))
            .expect("expected result should decode");
    assert_eq!(result, expected);
    assert_eq!(result.upid, Some(upid));
}

#[tokio::test]
async fn concurrent_dispatches_receive_their_own_replies() {
    let bus = MemoryBus::new();
    // Delay derived from the upid so replies leave in a scrambled order.
    let delay = |upid: &ProcessId| {
        let nibble = u64::from_str_radix(&upid.as_str()[..1], 16).unwrap_or(0);
        Duration::from_millis(nibble * 5)
    };
    start_service(&bus, Arc::new(Accepting { delay })).await;
    let client = client(&bus).await;

    let calls: Vec<_> = (0..32)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                let upid = ProcessId::generate();
                let result = client
                    .dispatch(upid.clone(), spec(json!({"command": format!("job {i}")})), Vec::new())
                    .await;
                (upid, result)
            })
        })
        .collect();

    for call in calls {
        let (upid, result) = call.await.expect("join should succeed");
        let result = result.expect("dispatch should succeed");
        assert_eq!(result.upid, Some(upid));
    }
}

#[tokio::test]
async fn silent_service_times_out() {
    let bus = MemoryBus::new();
    let _silent = bus
        .bind(&Address::new(ENDPOINT))
        .await
        .expect("silent endpoint should bind");
    let client = client(&bus)
        .await
        .with_timeout(Duration::from_millis(100));

    let err = client
        .dispatch(ProcessId::generate(), spec(json!({"command": "sleep"})), Vec::new())
        .await
        .expect_err("dispatch must time out");

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.outcome_unknown());
}

#[tokio::test]
async fn malformed_reply_is_protocol_error_with_payload() {
    let bus = MemoryBus::new();
    start_service(&bus, Arc::new(Canned(b"<html>502 Bad Gateway</html>"))).await;
    let client = client(&bus).await;

    let err = client
        .dispatch(ProcessId::generate(), spec(json!({"command": "ls"})), Vec::new())
        .await
        .expect_err("malformed reply must fail");

    match &err {
        DispatchError::Protocol { payload, .. } => {
            assert_eq!(payload.as_slice(), b"<html>502 Bad Gateway</html>");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.raw_payload(), Some(&b"<html>502 Bad Gateway</html>"[..]));
}

#[tokio::test]
async fn reply_for_another_upid_is_protocol_error() {
    let bus = MemoryBus::new();
    start_service(
        &bus,
        Arc::new(Canned(br#"{"state": "PENDING", "upid": "someone-else"}"#)),
    )
    .await;
    let client = client(&bus).await;

    let err = client
        .dispatch(ProcessId::generate(), spec(json!({"command": "ls"})), Vec::new())
        .await
        .expect_err("crossed reply must fail");
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn repeated_upid_launches_once() {
    let bus = MemoryBus::new();
    let service = Arc::new(Deduplicating::default());
    start_service(&bus, service.clone()).await;
    let client = client(&bus).await;

    let upid = ProcessId::generate();
    let process = spec(json!({"command": "echo hello"}));
    let first = client
        .dispatch(upid.clone(), process.clone(), Vec::new())
        .await
        .expect("first dispatch should succeed");
    let second = client
        .dispatch(upid.clone(), process, Vec::new())
        .await
        .expect("second dispatch should succeed");

    assert_eq!(first, second);
    assert_eq!(*service.requests.lock().expect("lock"), 2);
    assert_eq!(service.launches.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn unregistered_endpoint_fails_without_waiting() {
    let bus = MemoryBus::new();
    let client = client(&bus)
        .await
        .with_timeout(Duration::from_secs(30));

    let started = Instant::now();
    let err = client
        .dispatch(ProcessId::generate(), spec(json!({"command": "ls"})), Vec::new())
        .await
        .expect_err("dispatch to nowhere must fail");

    assert_eq!(err.kind(), ErrorKind::EndpointUnreachable);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn empty_spec_is_rejected_before_sending() {
    let bus = MemoryBus::new();
    let service = Arc::new(Deduplicating::default());
    start_service(&bus, service.clone()).await;
    let client = client(&bus).await;

    let err = client
        .dispatch(ProcessId::generate(), ProcessSpec::default(), Vec::new())
        .await
        .expect_err("empty spec must fail");

    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(*service.requests.lock().expect("lock"), 0);
}

#[tokio::test]
async fn fault_reply_surfaces_remote_error() {
    let bus = MemoryBus::new();
    start_service(&bus, Arc::new(Refusing)).await;
    let client = client(&bus).await;

    let err = client
        .dispatch(ProcessId::generate(), spec(json!({"command": "ls"})), Vec::new())
        .await
        .expect_err("refused request must fail");

    match err {
        DispatchError::Remote { code, message, .. } => {
            assert_eq!(code, ErrorCode::InvalidRequest);
            assert_eq!(message, "spec lacks run_type");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn bus_shutdown_mid_call_is_transport_error() {
    let bus = MemoryBus::new();
    start_service(&bus, Arc::new(Crashing(bus.clone()))).await;
    let client = client(&bus)
        .await
        .with_timeout(Duration::from_secs(30));

    let started = Instant::now();
    let err = client
        .dispatch(ProcessId::generate(), spec(json!({"command": "ls"})), Vec::new())
        .await
        .expect_err("dispatch must fail when the bus goes away");

    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(started.elapsed() < Duration::from_secs(5));

    let err = client
        .dispatch(ProcessId::generate(), spec(json!({"command": "ls"})), Vec::new())
        .await
        .expect_err("later dispatches must fail too");
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[tokio::test]
async fn late_reply_does_not_leak_into_next_call() {
    let bus = MemoryBus::new();
    let slow_first = |upid: &ProcessId| {
        if upid.as_str() == "slow" {
            Duration::from_millis(300)
        } else {
            Duration::ZERO
        }
    };
    start_service(&bus, Arc::new(Accepting { delay: slow_first })).await;
    let client = client(&bus)
        .await
        .with_timeout(Duration::from_millis(100));

    let err = client
        .dispatch(ProcessId("slow".to_string()), spec(json!({"command": "a"})), Vec::new())
        .await
        .expect_err("slow call must time out");
    assert_eq!(err.kind(), ErrorKind::Timeout);

    sleep(Duration::from_millis(300)).await;

    let upid = ProcessId::generate();
    let result = client
        .dispatch(upid.clone(), spec(json!({"command": "b"})), Vec::new())
        .await
        .expect("fresh call should succeed");
    assert_eq!(result.upid, Some(upid));
}

#[tokio::test]
async fn endpoint_served_via_serve_endpoint() {
    let bus = MemoryBus::new();
    let transport: Arc<dyn Transport> = Arc::new(bus.clone());
    let server = tokio::spawn(async move {
        serve_endpoint(
            transport,
            &Address::new(ENDPOINT),
            Arc::new(Accepting { delay: |_| Duration::ZERO }),
        )
        .await
    });
    while !bus.is_bound(&Address::new(ENDPOINT)) {
        sleep(Duration::from_millis(5)).await;
    }

    let client = client(&bus).await;
    let result = client
        .dispatch(ProcessId::generate(), spec(json!({"command": "ls"})), Vec::new())
        .await
        .expect("dispatch should succeed");
    assert_eq!(result.state.as_str(), "ACCEPTED");

    server.abort();
}
