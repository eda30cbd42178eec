use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use bytes::Bytes;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Framing used on the wire, decided by the socket factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Udp,
    Tcp,
}

/// A live transport produced by the socket factory.
///
/// `writer` carries fully framed queries to the wire (the resolver applies
/// the 2-byte length prefix itself in TCP mode). `incoming` carries raw
/// bytes from the wire: whole datagrams for UDP, arbitrary stream chunks
/// for TCP. A closed `writer` means the transport has died. The contract
/// runs the other way too: once every `writer` handle is dropped, the
/// factory's transport must shut down and close `incoming`.
pub struct SocketResult {
    pub writer: mpsc::Sender<Bytes>,
    pub incoming: mpsc::Receiver<Bytes>,
    pub mode: ConnectionMode,
}

/// Lazily invoked factory; may fail, in which case the resolver falls back
/// to the system resolver until a later attempt succeeds.
pub type SocketFactory = dyn Fn() -> anyhow::Result<SocketResult> + Send + Sync;

const CHANNEL_CAPACITY: usize = 64;
const RECV_BUFFER: usize = 4096;

/// Connect a datagram transport to `upstream`. Each frame handed to the
/// writer is sent as one query datagram.
pub fn connect_udp(upstream: SocketAddr) -> anyhow::Result<SocketResult> {
    let domain = if upstream.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create udp socket")?;
    if let Err(err) = socket.set_recv_buffer_size(1 << 20) {
        warn!(error = %err, "failed to set udp recv buffer size");
    }
    if let Err(err) = socket.set_send_buffer_size(1 << 20) {
        warn!(error = %err, "failed to set udp send buffer size");
    }
    let bind: SocketAddr = if upstream.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }
        .parse()
        .context("bind address")?;
    socket.bind(&bind.into()).context("bind")?;
    socket.connect(&upstream.into()).context("connect")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    let socket = tokio::net::UdpSocket::from_std(socket.into()).context("from_std")?;

    let (writer, mut outgoing) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (delivered, incoming) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    // One pump owns the socket; when every writer handle is dropped the
    // pump exits, closing the socket and the incoming channel with it.
    tokio::spawn(async move {
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = socket.send(&frame).await {
                            warn!(upstream = %upstream, error = %err, "udp send failed");
                            break;
                        }
                    }
                    None => break,
                },
                received = socket.recv(&mut buf) => match received {
                    Ok(len) => {
                        if delivered.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(upstream = %upstream, error = %err, "udp recv failed");
                        break;
                    }
                },
            }
        }
    });

    Ok(SocketResult { writer, incoming, mode: ConnectionMode::Udp })
}

/// Connect a stream transport to `upstream`. Frames handed to the writer
/// must already carry the 2-byte length prefix.
pub fn connect_tcp(upstream: SocketAddr) -> anyhow::Result<SocketResult> {
    let stream = std::net::TcpStream::connect(upstream).context("tcp connect")?;
    stream.set_nonblocking(true).context("set nonblocking")?;
    let stream = tokio::net::TcpStream::from_std(stream).context("from_std")?;
    let (mut read_half, mut write_half) = stream.into_split();

    let (writer, mut outgoing) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (delivered, incoming) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    // One pump owns both stream halves; when every writer handle is
    // dropped the pump exits, closing the connection and the incoming
    // channel with it.
    tokio::spawn(async move {
        let mut buf = [0u8; RECV_BUFFER];
        loop {
            tokio::select! {
                frame = outgoing.recv() => match frame {
                    Some(frame) => {
                        if let Err(err) = write_half.write_all(&frame).await {
                            warn!(upstream = %upstream, error = %err, "tcp write failed");
                            break;
                        }
                    }
                    None => break,
                },
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(upstream = %upstream, "tcp connection closed by peer");
                        break;
                    }
                    Ok(len) => {
                        if delivered.send(Bytes::copy_from_slice(&buf[..len])).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(upstream = %upstream, error = %err, "tcp read failed");
                        break;
                    }
                },
            }
        }
    });

    Ok(SocketResult { writer, incoming, mode: ConnectionMode::Tcp })
}

struct ActiveSocket {
    writer: mpsc::Sender<Bytes>,
    mode: ConnectionMode,
}

/// Owns at most one transport to the upstream resolver, created lazily via
/// the injected factory and recreated on demand after a reset or failure.
pub(crate) struct SocketManager {
    factory: Box<SocketFactory>,
    active: Mutex<Option<ActiveSocket>>,
    restarting: AtomicBool,
}

impl SocketManager {
    pub(crate) fn new(factory: Box<SocketFactory>) -> Self {
        Self {
            factory,
            active: Mutex::new(None),
            restarting: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|socket| !socket.writer.is_closed())
    }

    /// Returns whether a live transport exists. When none does and a
    /// restart is requested, the factory is invoked unless another restart
    /// is already underway; a freshly created socket's incoming half is
    /// handed back so the caller can wire up response processing.
    pub(crate) fn has_connection(
        &self,
        attempt_restart: bool,
    ) -> (bool, Option<(mpsc::Receiver<Bytes>, ConnectionMode)>) {
        if self.is_open() {
            return (true, None);
        }
        if !attempt_restart {
            return (false, None);
        }
        if self.restarting.swap(true, Ordering::SeqCst) {
            return (false, None);
        }
        let created = (self.factory)();
        self.restarting.store(false, Ordering::SeqCst);

        match created {
            Ok(SocketResult { writer, incoming, mode }) => {
                *self.active.lock() = Some(ActiveSocket { writer, mode });
                (true, Some((incoming, mode)))
            }
            Err(err) => {
                debug!(error = %err, "failed to create socket");
                (false, None)
            }
        }
    }

    pub(crate) fn mode(&self) -> Option<ConnectionMode> {
        self.active.lock().as_ref().map(|socket| socket.mode)
    }

    /// Clones the writer out so callers never await a channel send while
    /// holding the slot lock.
    pub(crate) fn writer(&self) -> Option<mpsc::Sender<Bytes>> {
        self.active
            .lock()
            .as_ref()
            .filter(|socket| !socket.writer.is_closed())
            .map(|socket| socket.writer.clone())
    }

    /// Drops the transport unconditionally. Releasing the writer handle
    /// stops the transport's pump, which closes the underlying socket and
    /// the incoming channel.
    pub(crate) fn reset(&self) {
        *self.active.lock() = None;
    }
}
