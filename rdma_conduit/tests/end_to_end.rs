use std::sync::Arc;
use std::thread;

use rdma_conduit::Atomic;
use rdma_conduit::Buffer;
use rdma_conduit::Context;
use rdma_conduit::ContextConfig;
use rdma_conduit::QueuePair;
use rdma_conduit::QueuePairFactory;
use rdma_conduit::Region;
use rdma_conduit::RegionToken;
use rdma_conduit::RequestToken;
use rdma_conduit::SoftFabric;
use tracing_test::traced_test;

struct Peers {
    server: Arc<QueuePair>,
    client: Arc<QueuePair>,
    server_context: Arc<Context>,
    client_context: Arc<Context>,
}

/// Connects two contexts on one fabric through the TCP handshake. The server publishes
/// `server_data` to the client as connection user data.
fn connect(fabric: &SoftFabric, server_data: Vec<u8>) -> Peers {
    let server_context =
        Context::with_device(fabric.open_device("server"), ContextConfig::default()).unwrap();
    let client_context =
        Context::with_device(fabric.open_device("client"), ContextConfig::default()).unwrap();

    let mut factory = QueuePairFactory::new(&server_context);
    factory.bind_to_port(0).unwrap();
    let port = factory.local_port().unwrap();
    let accept = thread::spawn(move || factory.accept_incoming_connection(&server_data));

    let client = QueuePairFactory::new(&client_context)
        .connect_to_remote_host("127.0.0.1", port, b"client")
        .unwrap();
    let server = accept.join().unwrap().unwrap();
    Peers {
        server,
        client,
        server_context,
        client_context,
    }
}

#[test]
fn test_region_token_in_user_data() {
    let fabric = SoftFabric::new();
    let server_context =
        Context::with_device(fabric.open_device("server"), ContextConfig::default()).unwrap();
    let mut exposed = Buffer::new(&server_context, 4096).unwrap();
    exposed.as_mut_slice().fill(7);

    let mut factory = QueuePairFactory::new(&server_context);
    factory.bind_to_port(0).unwrap();
    let port = factory.local_port().unwrap();
    let user_data = exposed.create_token().to_bytes().unwrap();
    let accept = thread::spawn(move || factory.accept_incoming_connection(&user_data));

    let client_context =
        Context::with_device(fabric.open_device("client"), ContextConfig::default()).unwrap();
    let client = QueuePairFactory::new(&client_context)
        .connect_to_remote_host("127.0.0.1", port, b"")
        .unwrap();
    let server = accept.join().unwrap().unwrap();
    assert!(server.user_data().is_empty());

    let remote = RegionToken::from_bytes(client.user_data()).unwrap();
    assert_eq!(remote, exposed.create_token());

    let local = Buffer::new(&client_context, 4096).unwrap();
    let mut token = RequestToken::new(&client_context);
    client.read(&local, &remote, Some(&mut token)).unwrap();
    token.wait_until_completed();
    assert!(token.was_successful());
    assert!(local.as_slice().iter().all(|byte| *byte == 7));
}

#[test]
fn test_write_then_send_between_peers() {
    let fabric = SoftFabric::new();
    let peers = connect(&fabric, b"server".to_vec());
    assert_eq!(peers.client.user_data(), b"server");
    assert_eq!(peers.server.user_data(), b"client");

    let target = Buffer::new(&peers.server_context, 1024).unwrap();
    let mut source = Buffer::new(&peers.client_context, 1024).unwrap();
    source.as_mut_slice().copy_from_slice(&[3u8; 1024]);

    let mut token = RequestToken::new(&peers.client_context);
    peers
        .client
        .write(&source, &target.create_token(), Some(&mut token))
        .unwrap();
    token.wait_until_completed();
    assert!(token.was_successful());
    assert_eq!(target.as_slice(), source.as_slice());

    // Two-sided: the server posts a receive, the client sends.
    peers
        .server_context
        .post_receive_buffer(Arc::new(Buffer::new(&peers.server_context, 64).unwrap()))
        .unwrap();
    let mut message = Buffer::new(&peers.client_context, 5).unwrap();
    message.as_mut_slice().copy_from_slice(b"hello");
    peers
        .client
        .send_with_immediate(&message, 99, Some(&mut token))
        .unwrap();
    token.wait_until_completed();
    assert!(token.was_successful());

    let element = peers.server_context.receive().unwrap();
    assert!(element.status.is_success());
    assert_eq!(element.bytes_written, 5);
    assert_eq!(element.immediate_value, Some(99));
    assert_eq!(
        element.queue_pair_number,
        peers.server.queue_pair_number()
    );
    assert_eq!(&element.buffer.unwrap().as_slice()[..5], b"hello");
}

#[test]
fn test_send_waits_for_posted_receive() {
    let fabric = SoftFabric::new();
    let peers = connect(&fabric, Vec::new());

    let message = Buffer::new(&peers.client_context, 16).unwrap();
    let mut token = RequestToken::new(&peers.client_context);
    peers.client.send(&message, Some(&mut token)).unwrap();
    assert!(!token.check_if_completed());
    assert!(peers.server_context.receive().is_none());

    peers
        .server_context
        .post_receive_buffer(Arc::new(Buffer::new(&peers.server_context, 16).unwrap()))
        .unwrap();
    token.wait_until_completed();
    assert!(token.was_successful());
    assert!(peers.server_context.receive().is_some());
}

#[test]
fn test_remote_fetch_and_add() {
    let fabric = SoftFabric::new();
    let peers = connect(&fabric, Vec::new());
    let counter = Atomic::new(&peers.server_context).unwrap();
    counter.set_value_non_atomic(100);

    let mut token = RequestToken::new(&peers.client_context);
    for _ in 0..3 {
        peers
            .client
            .fetch_and_add(&counter.create_token(), 5, Some(&mut token))
            .unwrap();
        token.wait_until_completed();
        assert!(token.was_successful());
    }
    assert_eq!(counter.value(), 115);
    assert_eq!(peers.client_context.default_atomic().value(), 110);
}

#[test]
fn test_peer_gone_fails_request() {
    let fabric = SoftFabric::new();
    let peers = connect(&fabric, Vec::new());
    let target = Buffer::new(&peers.server_context, 64).unwrap();
    let remote = target.create_token();
    drop(peers.server);

    let source = Buffer::new(&peers.client_context, 64).unwrap();
    let mut token = RequestToken::new(&peers.client_context);
    peers
        .client
        .write(&source, &remote, Some(&mut token))
        .unwrap();
    token.wait_until_completed();
    assert!(!token.was_successful());
}

#[traced_test]
#[test]
fn test_connection_is_logged() {
    let fabric = SoftFabric::new();
    let peers = connect(&fabric, Vec::new());
    assert!(logs_contain("opened software RDMA device client"));
    assert!(logs_contain(&format!(
        "queue pair {} connected to",
        peers.client.queue_pair_number()
    )));
}
