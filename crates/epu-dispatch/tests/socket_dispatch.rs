use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use epu_bus::{BusError, RequestHandler, SocketTransport, Transport, broker, serve_endpoint};
use epu_core::{Address, ClientIdentity, DispatchRequest, ProcessId, ProcessSpec, ServiceError};
use epu_dispatch::{ConnectError, DispatchClient, ErrorKind};
use serde_json::json;
use tempfile::tempdir;
use tokio::{net::UnixListener, time::sleep};

struct Accepting;

#[async_trait]
impl RequestHandler for Accepting {
    async fn handle(&self, _op: &str, payload: &[u8]) -> Result<Vec<u8>, ServiceError> {
        let request: DispatchRequest = serde_json::from_slice(payload)
            .map_err(|err| ServiceError::invalid_request(err.to_string()))?;
        Ok(serde_json::to_vec(&json!({"state": "ACCEPTED", "upid": request.upid}))
            .expect("reply encode should succeed"))
    }
}

#[tokio::test]
async fn dispatch_through_broker() {
    let dir = tempdir().expect("tempdir should be created");
    let socket = dir.path().join("broker.sock");
    let listener = UnixListener::bind(&socket).expect("broker socket should bind");
    let broker = tokio::spawn(broker::serve(listener));

    let service: Arc<dyn Transport> = Arc::new(
        SocketTransport::connect(&socket)
            .await
            .expect("service should connect"),
    );
    let server = tokio::spawn(async move {
        serve_endpoint(service, &Address::new("processdispatcher"), Arc::new(Accepting)).await
    });

    let client = DispatchClient::connect(
        &socket,
        ClientIdentity::generate(),
        Address::new("processdispatcher"),
    )
    .await
    .expect("client should connect")
    .with_timeout(Duration::from_secs(5));

    let spec: ProcessSpec =
        serde_json::from_value(json!({"command": "echo hello"})).expect("spec should decode");
    let mut result = None;
    for _ in 0..200 {
        let upid = ProcessId::generate();
        match client.dispatch(upid.clone(), spec.clone(), Vec::new()).await {
            Ok(accepted) => {
                assert_eq!(accepted.upid, Some(upid));
                result = Some(accepted);
                break;
            }
            // The service may still be binding its endpoint.
            Err(err) if err.kind() == ErrorKind::EndpointUnreachable => {
                sleep(Duration::from_millis(10)).await;
            }
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    let result = result.expect("service should come up");
    assert_eq!(result.state.as_str(), "ACCEPTED");

    server.abort();
    broker.abort();
}

#[tokio::test]
async fn bounce_from_broker_fails_fast() {
    let dir = tempdir().expect("tempdir should be created");
    let socket = dir.path().join("broker.sock");
    let listener = UnixListener::bind(&socket).expect("broker socket should bind");
    let broker = tokio::spawn(broker::serve(listener));

    let client = DispatchClient::connect(
        &socket,
        ClientIdentity::generate(),
        Address::new("nobody-home"),
    )
    .await
    .expect("client should connect")
    .with_timeout(Duration::from_secs(30));

    let started = Instant::now();
    let err = client
        .dispatch(
            ProcessId::generate(),
            serde_json::from_value(json!({"command": "ls"})).expect("spec"),
            Vec::new(),
        )
        .await
        .expect_err("dispatch to unbound endpoint must fail");

    assert_eq!(err.kind(), ErrorKind::EndpointUnreachable);
    assert!(started.elapsed() < Duration::from_secs(5));

    broker.abort();
}

#[tokio::test]
async fn missing_broker_is_connect_error() {
    let dir = tempdir().expect("tempdir should be created");
    let err = DispatchClient::connect(
        dir.path().join("absent.sock"),
        ClientIdentity::generate(),
        Address::new("processdispatcher"),
    )
    .await
    .err()
    .expect("connect without broker must fail");

    assert!(matches!(err, ConnectError::Connect { .. }));
}

#[tokio::test]
async fn identity_is_reusable_after_client_drops() {
    let dir = tempdir().expect("tempdir should be created");
    let socket = dir.path().join("broker.sock");
    let listener = UnixListener::bind(&socket).expect("broker socket should bind");
    let broker = tokio::spawn(broker::serve(listener));

    let transport: Arc<dyn Transport> = Arc::new(
        SocketTransport::connect(&socket)
            .await
            .expect("transport should connect"),
    );
    let identity = ClientIdentity::generate();
    let endpoint = Address::new("processdispatcher");

    let first = DispatchClient::bind(Arc::clone(&transport), identity.clone(), endpoint.clone())
        .await
        .expect("first client should bind");
    drop(first);

    let mut rebound = None;
    for _ in 0..200 {
        match DispatchClient::bind(Arc::clone(&transport), identity.clone(), endpoint.clone())
            .await
        {
            Ok(client) => {
                rebound = Some(client);
                break;
            }
            // The dropped client's reply router may still hold the mailbox.
            Err(ConnectError::Bind {
                source: BusError::AddressInUse { .. },
                ..
            }) => sleep(Duration::from_millis(10)).await,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    let client = rebound.expect("identity should be reusable");
    assert_eq!(client.identity(), &identity);

    broker.abort();
}
