// Datagram transport seam for the endpoint. The endpoint hands decoded
// messages to a Transport and receives decoded messages back; byte framing
// stays behind the MessageCodec trait so the core never touches the wire
// format.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::CoapError;
use crate::messages::Message;

/// Opaque per-association value round-tripped between inbound and outbound
/// calls (secure-session identity and the like). The endpoint never looks
/// inside.
#[derive(Clone, Default)]
pub struct TransportContext(Option<Arc<dyn Any + Send + Sync>>);

impl TransportContext {
    pub fn new(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(Some(value))
    }

    pub fn get<T: 'static>(&self) -> Option<&T> {
        self.0.as_ref()?.downcast_ref()
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => write!(f, "TransportContext(set)"),
            None => write!(f, "TransportContext(empty)"),
        }
    }
}

/// One received datagram, already decoded.
pub struct Inbound {
    pub message: Message,
    pub context: TransportContext,
}

/// Abstract datagram transport. `send` must not block the caller; deferred
/// completion (a background writer) is fine.
pub trait Transport: Send + Sync {
    fn start(&self, receiver: mpsc::UnboundedSender<Inbound>) -> Result<(), CoapError>;
    fn stop(&self);
    fn send(&self, message: Message, context: TransportContext) -> Result<(), CoapError>;
    fn local_address(&self) -> SocketAddr;
}

/// In-process datagram network: endpoints keyed by address, datagrams for
/// unknown destinations are dropped like UDP would.
#[derive(Default)]
pub struct LoopbackNetwork {
    mailboxes: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<Inbound>>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport bound to `addr` on this network.
    pub fn endpoint(self: &Arc<Self>, addr: SocketAddr) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
            addr,
        })
    }

    fn deliver(&self, dest: SocketAddr, inbound: Inbound) {
        let mailboxes = self.mailboxes.lock().unwrap();
        match mailboxes.get(&dest) {
            Some(tx) => {
                let _ = tx.send(inbound);
            }
            None => log::trace!("loopback: dropping datagram for {}", dest),
        }
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    addr: SocketAddr,
}

impl Transport for LoopbackTransport {
    fn start(&self, receiver: mpsc::UnboundedSender<Inbound>) -> Result<(), CoapError> {
        self.network
            .mailboxes
            .lock()
            .unwrap()
            .insert(self.addr, receiver);
        Ok(())
    }

    fn stop(&self) {
        self.network.mailboxes.lock().unwrap().remove(&self.addr);
    }

    fn send(&self, mut message: Message, context: TransportContext) -> Result<(), CoapError> {
        let dest = message.remote;
        // The receiver sees the sender's address as the remote.
        message.remote = self.addr;
        self.network.deliver(dest, Inbound { message, context });
        Ok(())
    }

    fn local_address(&self) -> SocketAddr {
        self.addr
    }
}

/// Byte framing seam for `UdpTransport`. A real RFC 7252 codec plugs in
/// here; the endpoint core stays byte-free.
pub trait MessageCodec: Send + Sync + 'static {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, CoapError>;
    fn decode(&self, data: &[u8], remote: SocketAddr) -> Result<Message, CoapError>;
}

/// UDP transport with a reader task feeding the endpoint and a writer task
/// draining outbound datagrams.
pub struct UdpTransport<C: MessageCodec> {
    socket: Arc<UdpSocket>,
    codec: Arc<C>,
    outbound: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>>,
    cancel: CancellationToken,
    local: SocketAddr,
}

impl<C: MessageCodec> UdpTransport<C> {
    pub async fn bind(local: &str, codec: C) -> Result<Arc<Self>, CoapError> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| CoapError::Transport(e.to_string()))?;
        let local = socket
            .local_addr()
            .map_err(|e| CoapError::Transport(e.to_string()))?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            codec: Arc::new(codec),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            cancel: CancellationToken::new(),
            local,
        }))
    }

    async fn read_loop(
        socket: Arc<UdpSocket>,
        codec: Arc<C>,
        cancel: CancellationToken,
        receiver: mpsc::UnboundedSender<Inbound>,
    ) {
        loop {
            let mut buf = vec![0u8; 1500];
            let (n, addr) = tokio::select! {
                _ = cancel.cancelled() => break,
                result = socket.recv_from(&mut buf) => match result {
                    Ok(v) => v,
                    Err(e) => {
                        log::debug!("udp receive error: {}", e);
                        continue;
                    }
                },
            };
            buf.truncate(n);
            match codec.decode(&buf, addr) {
                Ok(message) => {
                    if receiver
                        .send(Inbound {
                            message,
                            context: TransportContext::default(),
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => log::debug!("can't decode datagram from {}: {}", addr, e),
            }
        }
    }

    async fn write_loop(
        socket: Arc<UdpSocket>,
        cancel: CancellationToken,
        mut outbound: mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>,
    ) {
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => break,
                item = outbound.recv() => item,
            };
            match item {
                Some((data, dest)) => {
                    if let Err(e) = socket.send_to(&data, dest).await {
                        log::debug!("udp send to {} failed: {}", dest, e);
                    }
                }
                None => break,
            }
        }
    }
}

impl<C: MessageCodec> Transport for UdpTransport<C> {
    fn start(&self, receiver: mpsc::UnboundedSender<Inbound>) -> Result<(), CoapError> {
        let rx = self
            .outbound_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| CoapError::Transport("transport already started".to_owned()))?;
        tokio::spawn(Self::read_loop(
            self.socket.clone(),
            self.codec.clone(),
            self.cancel.child_token(),
            receiver,
        ));
        tokio::spawn(Self::write_loop(
            self.socket.clone(),
            self.cancel.child_token(),
            rx,
        ));
        Ok(())
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    fn send(&self, message: Message, _context: TransportContext) -> Result<(), CoapError> {
        let data = self.codec.encode(&message)?;
        self.outbound
            .send((data, message.remote))
            .map_err(|_| CoapError::Transport("transport stopped".to_owned()))
    }

    fn local_address(&self) -> SocketAddr {
        self.local
    }
}

impl<C: MessageCodec> Drop for UdpTransport<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
