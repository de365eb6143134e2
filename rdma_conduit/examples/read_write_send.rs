//! Read, write and send between a server thread and a client.
//!
//! The server exposes a buffer by passing its region token as connection user data and
//! waits for one message. The client reads the buffer, writes it back incremented and
//! sends a message telling the server it is done.
//!
//! ```text
//! cargo run --example read_write_send
//! RDMA_CONDUIT_PROVIDER=ibverbs cargo run --features ibverbs --example read_write_send
//! ```
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use anyhow::bail;
use rdma_conduit::Buffer;
use rdma_conduit::Context;
use rdma_conduit::ContextConfig;
use rdma_conduit::Provider;
use rdma_conduit::QueuePairFactory;
use rdma_conduit::Region;
use rdma_conduit::RegionToken;
use rdma_conduit::RequestToken;
use rdma_conduit::logging::initialize_logging;

const BUFFER_SIZE: u64 = 64 * 1024;

fn server(factory: QueuePairFactory) -> Result<()> {
    let context = factory.context().clone();
    let mut exposed = Buffer::new(&context, BUFFER_SIZE)?;
    exposed.as_mut_slice().fill(1);
    context.post_receive_buffer(Arc::new(Buffer::new(&context, 64)?))?;

    let token = exposed.create_token();
    let queue_pair = factory.accept_incoming_connection(&token.to_bytes()?)?;
    tracing::info!(
        "server: accepted queue pair {}",
        queue_pair.queue_pair_number()
    );

    let element = loop {
        if let Some(element) = context.receive() {
            break element;
        }
        std::hint::spin_loop();
    };
    if !element.status.is_success() {
        bail!("receive failed: {}", element.status);
    }
    let Some(message) = element.buffer else {
        bail!("expected a two-sided message");
    };
    tracing::info!(
        "server: received {:?} ({} bytes)",
        String::from_utf8_lossy(&message.as_slice()[..element.bytes_written as usize]),
        element.bytes_written
    );
    if exposed.as_slice().iter().any(|byte| *byte != 2) {
        bail!("client write did not land");
    }
    tracing::info!("server: buffer was written back");
    drop(factory);
    Ok(())
}

fn client(context: Arc<Context>, port: u16) -> Result<()> {
    let queue_pair =
        QueuePairFactory::new(&context).connect_to_remote_host("127.0.0.1", port, b"")?;
    let remote = RegionToken::from_bytes(queue_pair.user_data())?;
    let mut local = Buffer::new(&context, remote.size_in_bytes())?;
    let mut token = RequestToken::new(&context);

    queue_pair.read(&local, &remote, Some(&mut token))?;
    token.wait_until_completed();
    if !token.was_successful() {
        bail!("read failed: {:?}", token.status());
    }
    tracing::info!("client: read {} bytes", local.size_in_bytes());

    for byte in local.as_mut_slice() {
        *byte += 1;
    }
    queue_pair.write(&local, &remote, Some(&mut token))?;
    token.wait_until_completed();
    if !token.was_successful() {
        bail!("write failed: {:?}", token.status());
    }

    let mut message = Buffer::new(&context, 4)?;
    message.as_mut_slice().copy_from_slice(b"done");
    queue_pair.send(&message, Some(&mut token))?;
    token.wait_until_completed();
    if !token.was_successful() {
        bail!("send failed: {:?}", token.status());
    }
    tracing::info!("client: finished");
    Ok(())
}

fn main() -> Result<()> {
    initialize_logging();
    let config = ContextConfig::from_env()?;
    tracing::info!("{}", config);

    // Software devices are named after their role; hardware uses the configured device.
    let for_role = |role: &str| ContextConfig {
        device_name: config
            .device_name
            .clone()
            .or_else(|| (config.provider == Provider::Software).then(|| role.to_string())),
        ..config.clone()
    };
    let server_context = Context::new(for_role("server"))?;
    let client_context = Context::new(for_role("client"))?;

    let mut factory = QueuePairFactory::new(&server_context);
    factory.bind_to_port(0)?;
    let Some(port) = factory.local_port() else {
        bail!("factory did not bind");
    };
    let server_thread = thread::spawn(move || server(factory));
    client(client_context, port)?;
    match server_thread.join() {
        Ok(result) => result,
        Err(_) => bail!("server thread panicked"),
    }
}
