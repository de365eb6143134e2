//! # Queue Pair Factory
//!
//! Bootstraps connected queue pairs over TCP. One side binds and accepts, the other
//! connects; each sends a [`HandshakeMessage`] describing its queue pair and the
//! accepting side answers only after it has read the connecting side's message in full.
//! Both sides then activate against what they received.
//!
//! The TCP connection is only used for the exchange and is closed afterwards.
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::Arc;

use anyhow::anyhow;

use crate::address::interface_ipv4_address;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::handshake::HandshakeMessage;
use crate::handshake::check_user_data_size;
use crate::queue_pair::QueuePair;

#[derive(Debug)]
pub struct QueuePairFactory {
    context: Arc<Context>,
    listener: Option<TcpListener>,
}


impl QueuePairFactory {
    pub fn new(context: &Arc<Context>) -> Self {
        Self {
            context: context.clone(),
            listener: None,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Listens for incoming connections on `port` on all IPv4 interfaces.
    ///
    /// Port 0 picks a free port; see [`QueuePairFactory::local_port`].
    pub fn bind_to_port(&mut self, port: u16) -> Result<()> {
        let listener =
            TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(Error::Handshake)?;
        let bound = listener.local_addr().map_err(Error::Handshake)?;

        let interface = &self.context.config().network_interface;
        match interface_ipv4_address(interface) {
            Ok(Some(address)) => {
                tracing::info!(
                    "listening for queue pair connections on {}:{} ({})",
                    address,
                    bound.port(),
                    interface
                );
            }
            Ok(None) => {
                tracing::warn!(
                    "no IPv4 address on interface {}; listening on {}",
                    interface,
                    bound
                );
            }
            Err(e) => {
                tracing::warn!("failed to resolve interface {}: {}", interface, e);
            }
        }
        self.listener = Some(listener);
        Ok(())
    }

    /// The port bound by `bind_to_port`.
    pub fn local_port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|address| address.port())
    }

    /// Accepts one connection and returns the activated queue pair.
    ///
    /// Blocks until a peer connects. `user_data` is handed to the peer; the peer's user
    /// data is available from [`QueuePair::user_data`].
    pub fn accept_incoming_connection(&self, user_data: &[u8]) -> Result<Arc<QueuePair>> {
        check_user_data_size(user_data.len())?;
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Other(anyhow!("factory is not bound to a port")))?;
        let (mut stream, peer) = listener.accept().map_err(Error::Handshake)?;
        stream.set_nodelay(true).map_err(Error::Handshake)?;

        let remote = HandshakeMessage::read_from(&mut stream)?;
        let queue_pair = QueuePair::new(&self.context)?;
        self.local_message(&queue_pair, user_data)
            .write_to(&mut stream)?;
        self.pair(&queue_pair, remote, peer)?;
        Ok(queue_pair)
    }

    /// Connects to a factory accepting on `address:port` and returns the activated queue
    /// pair.
    pub fn connect_to_remote_host(
        &self,
        address: &str,
        port: u16,
        user_data: &[u8],
    ) -> Result<Arc<QueuePair>> {
        check_user_data_size(user_data.len())?;
        let mut stream = TcpStream::connect((address, port)).map_err(Error::Handshake)?;
        stream.set_nodelay(true).map_err(Error::Handshake)?;
        let peer = stream.peer_addr().map_err(Error::Handshake)?;

        let queue_pair = QueuePair::new(&self.context)?;
        self.local_message(&queue_pair, user_data)
            .write_to(&mut stream)?;
        let remote = HandshakeMessage::read_from(&mut stream)?;
        self.pair(&queue_pair, remote, peer)?;
        Ok(queue_pair)
    }

    /// A queue pair connected to itself; its user data is `user_data`.
    pub fn create_loopback(&self, user_data: &[u8]) -> Result<Arc<QueuePair>> {
        check_user_data_size(user_data.len())?;
        let queue_pair = QueuePair::new(&self.context)?;
        queue_pair.activate(
            queue_pair.local_device_id(),
            queue_pair.queue_pair_number(),
            queue_pair.sequence_number(),
        )?;
        queue_pair.set_remote_user_data(user_data.to_vec());
        Ok(queue_pair)
    }

    fn local_message(&self, queue_pair: &QueuePair, user_data: &[u8]) -> HandshakeMessage {
        HandshakeMessage {
            local_device_id: queue_pair.local_device_id(),
            queue_pair_number: queue_pair.queue_pair_number(),
            sequence_number: queue_pair.sequence_number(),
            user_data: user_data.to_vec(),
        }
    }

    fn pair(&self, queue_pair: &QueuePair, remote: HandshakeMessage, peer: SocketAddr) -> Result<()> {
        queue_pair.activate(
            remote.local_device_id,
            remote.queue_pair_number,
            remote.sequence_number,
        )?;
        tracing::info!(
            "queue pair {} connected to {}:{} via {}",
            queue_pair.queue_pair_number(),
            remote.local_device_id,
            remote.queue_pair_number,
            peer
        );
        queue_pair.set_remote_user_data(remote.user_data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::config::ContextConfig;
    use crate::config::MAX_CONNECTION_USER_DATA_SIZE;
    use crate::soft_device::SoftFabric;

    fn context(fabric: &SoftFabric, name: &str) -> Arc<Context> {
        Context::with_device(fabric.open_device(name), ContextConfig::default()).unwrap()
    }

    #[test]
    fn test_create_loopback() {
        let fabric = SoftFabric::new();
        let factory = QueuePairFactory::new(&context(&fabric, "loopback"));
        let queue_pair = factory.create_loopback(b"self").unwrap();
        assert_eq!(queue_pair.user_data(), b"self");
        assert_eq!(
            queue_pair.state(),
            crate::queue_pair::QueuePairState::ReadyToSend
        );
    }

    #[test]
    fn test_accept_requires_bind() {
        let fabric = SoftFabric::new();
        let factory = QueuePairFactory::new(&context(&fabric, "unbound"));
        assert!(factory.local_port().is_none());
        assert!(factory.accept_incoming_connection(b"").is_err());
    }

    #[test]
    fn test_user_data_limit() {
        let fabric = SoftFabric::new();
        let factory = QueuePairFactory::new(&context(&fabric, "limit"));
        let user_data = vec![0u8; MAX_CONNECTION_USER_DATA_SIZE];
        assert!(matches!(
            factory.create_loopback(&user_data),
            Err(Error::UserDataTooLarge { .. })
        ));
        assert!(matches!(
            factory.connect_to_remote_host("127.0.0.1", 1, &user_data),
            Err(Error::UserDataTooLarge { .. })
        ));
    }

    #[test]
    fn test_handshake_round_trip() {
        let fabric = SoftFabric::new();
        let server_context = context(&fabric, "server");
        let client_context = context(&fabric, "client");
        let mut server = QueuePairFactory::new(&server_context);
        server.bind_to_port(0).unwrap();
        let port = server.local_port().unwrap();

        let handle = std::thread::spawn(move || server.accept_incoming_connection(b"from server"));
        let client = QueuePairFactory::new(&client_context)
            .connect_to_remote_host("127.0.0.1", port, b"from client")
            .unwrap();
        let accepted = handle.join().unwrap().unwrap();

        assert_eq!(client.user_data(), b"from server");
        assert_eq!(accepted.user_data(), b"from client");
        assert_eq!(
            client.state(),
            crate::queue_pair::QueuePairState::ReadyToSend
        );
        assert_eq!(
            accepted.state(),
            crate::queue_pair::QueuePairState::ReadyToSend
        );
    }

    #[test]
    fn test_truncated_handshake_is_fatal() {
        let fabric = SoftFabric::new();
        let server_context = context(&fabric, "truncated");
        let mut server = QueuePairFactory::new(&server_context);
        server.bind_to_port(0).unwrap();
        let port = server.local_port().unwrap();

        let writer = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream.write_all(&[1, 2, 3]).unwrap();
        });
        let result = server.accept_incoming_connection(b"");
        writer.join().unwrap();
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert_eq!(server_context.outstanding_requests(), 0);
    }
}
