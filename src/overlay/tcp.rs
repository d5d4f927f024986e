//! TCP Overlay
//!
//! Every overlay connection and every protocol stream is its own TCP
//! connection. The dialling side opens with a hello naming its identity,
//! its listen locator and the requested protocol; the listening side answers
//! with its own identity and a status byte.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{
    BoxStream, InboundStream, Locator, Overlay, OverlayEvent, PeerId, EVENT_CAPACITY,
    HANDLER_CAPACITY,
};
use crate::error::{Error, Result};

const MAGIC: &[u8; 4] = b"WLAN";
const VERSION: u8 = 1;

const KIND_CONNECT: u8 = 0;
const KIND_STREAM: u8 = 1;

const STATUS_OK: u8 = 0;
const STATUS_UNKNOWN_PROTOCOL: u8 = 1;

/// magic + version + kind + identity + locator length
const HELLO_HEADER_SIZE: usize = 4 + 1 + 1 + PeerId::SIZE + 2;

/// magic + version + status + identity
const REPLY_SIZE: usize = 4 + 1 + 1 + PeerId::SIZE;

const MAX_LOCATOR_LEN: usize = 256;

/// Time allowed for either side of the hello exchange
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Opening message sent by the dialling side
#[derive(Debug, Clone, PartialEq)]
struct Hello {
    kind: u8,
    peer: PeerId,
    locator: Option<Locator>,
    protocol: String,
}

impl Hello {
    fn to_bytes(&self) -> Vec<u8> {
        let locator = self.locator.as_ref().map(|l| l.to_bytes()).unwrap_or_default();
        let mut buf = BytesMut::with_capacity(HELLO_HEADER_SIZE + locator.len() + 1 + self.protocol.len());
        buf.put_slice(MAGIC);
        buf.put_u8(VERSION);
        buf.put_u8(self.kind);
        buf.put_slice(self.peer.as_bytes());
        buf.put_u16(locator.len() as u16);
        buf.put_slice(&locator);
        buf.put_u8(self.protocol.len() as u8);
        buf.put_slice(self.protocol.as_bytes());
        buf.to_vec()
    }

    async fn read<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header = [0u8; HELLO_HEADER_SIZE];
        reader.read_exact(&mut header).await?;
        check_preamble(&header)?;

        let kind = header[5];
        let peer = read_peer_id(&header[6..22]);
        let locator_len = u16::from_be_bytes([header[22], header[23]]) as usize;
        if locator_len > MAX_LOCATOR_LEN {
            return Err(Error::Format(format!("hello locator too long: {} bytes", locator_len)));
        }

        let locator = if locator_len == 0 {
            None
        } else {
            let mut bytes = vec![0u8; locator_len];
            reader.read_exact(&mut bytes).await?;
            Some(Locator::from_bytes(&bytes)?)
        };

        let protocol_len = reader.read_u8().await? as usize;
        let mut protocol = vec![0u8; protocol_len];
        reader.read_exact(&mut protocol).await?;
        let protocol = String::from_utf8(protocol)
            .map_err(|_| Error::Format("hello protocol is not UTF-8".into()))?;

        Ok(Self { kind, peer, locator, protocol })
    }
}

fn reply_bytes(status: u8, peer: PeerId) -> [u8; REPLY_SIZE] {
    let mut reply = [0u8; REPLY_SIZE];
    reply[0..4].copy_from_slice(MAGIC);
    reply[4] = VERSION;
    reply[5] = status;
    reply[6..].copy_from_slice(peer.as_bytes());
    reply
}

async fn read_reply<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u8, PeerId)> {
    let mut reply = [0u8; REPLY_SIZE];
    reader.read_exact(&mut reply).await?;
    check_preamble(&reply)?;
    Ok((reply[5], read_peer_id(&reply[6..])))
}

fn check_preamble(bytes: &[u8]) -> Result<()> {
    if &bytes[0..4] != MAGIC {
        return Err(Error::Format("bad overlay magic".into()));
    }
    if bytes[4] != VERSION {
        return Err(Error::Format(format!("unsupported overlay version {}", bytes[4])));
    }
    Ok(())
}

fn read_peer_id(bytes: &[u8]) -> PeerId {
    let mut id = [0u8; PeerId::SIZE];
    id.copy_from_slice(&bytes[..PeerId::SIZE]);
    PeerId::from_bytes(id)
}

struct Inner {
    local_id: PeerId,
    listen_addr: SocketAddr,
    advertise: Locator,
    /// Identity -> dialable address
    address_book: RwLock<HashMap<PeerId, SocketAddr>>,
    handlers: Mutex<HashMap<String, mpsc::Sender<InboundStream>>>,
    events: broadcast::Sender<OverlayEvent>,
    shutdown: CancellationToken,
}

/// Overlay substrate over plain TCP
#[derive(Clone)]
pub struct TcpOverlay {
    inner: Arc<Inner>,
}

impl TcpOverlay {
    /// Bind the listener and start accepting connections
    pub async fn bind(
        local_id: PeerId,
        bind_address: &str,
        advertise_address: Option<SocketAddr>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        let listen_addr = listener.local_addr()?;
        let advertise = Locator::from_socket_addr(advertise_address.unwrap_or(listen_addr))
            .with_peer(local_id);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            local_id,
            listen_addr,
            advertise,
            address_book: RwLock::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            events,
            shutdown: CancellationToken::new(),
        });

        tracing::info!("Overlay {} listening on {}", local_id, listen_addr);
        tokio::spawn(accept_loop(Arc::clone(&inner), listener));

        Ok(Self { inner })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.listen_addr
    }

    /// Number of peers in the address book
    pub async fn known_peers(&self) -> usize {
        self.inner.address_book.read().await.len()
    }

    /// Stop accepting connections
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    async fn dial(
        &self,
        addr: SocketAddr,
        kind: u8,
        protocol: &str,
        expected: Option<PeerId>,
    ) -> Result<(PeerId, TcpStream)> {
        let failed = |reason: String| Error::ConnectionFailed {
            address: addr.to_string(),
            reason,
        };

        let mut stream = TcpStream::connect(addr).await.map_err(|e| failed(e.to_string()))?;
        stream.set_nodelay(true)?;

        let hello = Hello {
            kind,
            peer: self.inner.local_id,
            locator: Some(self.inner.advertise.clone()),
            protocol: protocol.to_string(),
        };
        stream.write_all(&hello.to_bytes()).await?;
        stream.flush().await?;

        let (status, remote) = match timeout(HELLO_TIMEOUT, read_reply(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::ConnectionTimeout(addr.to_string())),
        };

        if remote == self.inner.local_id {
            return Err(failed("dialled ourselves".into()));
        }
        if let Some(expected) = expected {
            if remote != expected {
                return Err(failed(format!("expected peer {}, found {}", expected, remote)));
            }
        }

        learn(&self.inner, remote, addr).await;

        match status {
            STATUS_OK => Ok((remote, stream)),
            STATUS_UNKNOWN_PROTOCOL => Err(Error::StreamOpen {
                peer: remote,
                reason: format!("protocol {} not supported", protocol),
            }),
            other => Err(failed(format!("unexpected status {}", other))),
        }
    }

    async fn forget(&self, peer: PeerId) {
        if self.inner.address_book.write().await.remove(&peer).is_some() {
            let _ = self.inner.events.send(OverlayEvent::Disconnected(peer));
        }
    }
}

#[async_trait::async_trait]
impl Overlay for TcpOverlay {
    fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    fn listen_locators(&self) -> Vec<Locator> {
        vec![self.inner.advertise.clone()]
    }

    async fn connect(&self, locator: &Locator) -> Result<PeerId> {
        let addr = locator
            .socket_addr()
            .ok_or_else(|| Error::Format(format!("locator {} has no transport address", locator)))?;

        let (peer, _) = self.dial(addr, KIND_CONNECT, "", locator.peer_id()).await?;
        Ok(peer)
    }

    async fn open_stream(&self, peer: PeerId, protocol: &str) -> Result<BoxStream> {
        let addr = self.inner.address_book.read().await.get(&peer).copied();
        let addr = addr.ok_or_else(|| Error::StreamOpen {
            peer,
            reason: "no known address".into(),
        })?;

        match self.dial(addr, KIND_STREAM, protocol, Some(peer)).await {
            Ok((_, stream)) => Ok(Box::new(stream)),
            Err(e @ Error::StreamOpen { .. }) => Err(e),
            Err(e) => {
                if matches!(e, Error::ConnectionFailed { .. } | Error::ConnectionTimeout(_) | Error::Io(_)) {
                    self.forget(peer).await;
                }
                Err(Error::StreamOpen { peer, reason: e.to_string() })
            }
        }
    }

    fn accept_streams(&self, protocol: &str) -> Result<mpsc::Receiver<InboundStream>> {
        let mut handlers = self.inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if handlers.get(protocol).is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::Config(format!("protocol {} already has a handler", protocol)));
        }

        let (tx, rx) = mpsc::channel(HANDLER_CAPACITY);
        handlers.insert(protocol.to_string(), tx);
        Ok(rx)
    }

    fn remove_stream_handler(&self, protocol: &str) {
        let mut handlers = self.inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.remove(protocol);
    }

    fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.inner.events.subscribe()
    }
}

/// Record a dialable address for `peer`, announcing first sight
async fn learn(inner: &Inner, peer: PeerId, addr: SocketAddr) {
    let newly_known = inner.address_book.write().await.insert(peer, addr).is_none();
    if newly_known {
        tracing::debug!("Overlay connected to {} at {}", peer, addr);
        let _ = inner.events.send(OverlayEvent::Connected(peer));
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((socket, remote)) => {
                        let inner = Arc::clone(&inner);
                        tokio::spawn(async move {
                            if let Err(e) = handle_inbound(inner, socket, remote).await {
                                tracing::debug!("Inbound overlay connection from {} failed: {}", remote, e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                    }
                }
            }
            _ = inner.shutdown.cancelled() => break,
        }
    }

    tracing::info!("Overlay listener on {} stopped", inner.listen_addr);
}

async fn handle_inbound(inner: Arc<Inner>, mut socket: TcpStream, remote: SocketAddr) -> Result<()> {
    socket.set_nodelay(true)?;

    let hello = match timeout(HELLO_TIMEOUT, Hello::read(&mut socket)).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::ConnectionTimeout(remote.to_string())),
    };

    // An unspecified advertise address means "the address you see me on"
    if let Some(mut addr) = hello.locator.as_ref().and_then(|l| l.socket_addr()) {
        if addr.ip().is_unspecified() {
            addr.set_ip(remote.ip());
        }
        learn(&inner, hello.peer, addr).await;
    }

    if hello.kind != KIND_STREAM {
        write_reply(&mut socket, STATUS_OK, inner.local_id).await?;
        return Ok(());
    }

    let handler = {
        let handlers = inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.get(&hello.protocol).cloned()
    };
    let Some(handler) = handler else {
        tracing::debug!("Peer {} asked for unknown protocol {}", hello.peer, hello.protocol);
        write_reply(&mut socket, STATUS_UNKNOWN_PROTOCOL, inner.local_id).await?;
        return Ok(());
    };

    write_reply(&mut socket, STATUS_OK, inner.local_id).await?;

    let inbound = InboundStream {
        peer: hello.peer,
        stream: Box::new(socket),
    };
    if handler.send(inbound).await.is_err() {
        tracing::debug!("Handler for {} is gone", hello.protocol);
        let mut handlers = inner.handlers.lock().unwrap_or_else(|e| e.into_inner());
        if handlers.get(&hello.protocol).is_some_and(|tx| tx.is_closed()) {
            handlers.remove(&hello.protocol);
        }
    }
    Ok(())
}

async fn write_reply<W: AsyncWrite + Unpin>(writer: &mut W, status: u8, peer: PeerId) -> Result<()> {
    writer.write_all(&reply_bytes(status, peer)).await?;
    writer.flush().await?;
    Ok(())
}
