use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use hickory_proto::op::{Message, MessageType};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::{Settings, Transport};
use crate::handler::{Handler, ReplyWriter};
use crate::resolver::Resolver;
use crate::upstream::NetExchange;

/// Kernel buffer for the listening UDP socket, independent of the message size limit.
const UDP_SOCKET_BUFFER: usize = 4 * 1024 * 1024;
/// Pause after an accept failure caused by descriptor or memory exhaustion.
const ACCEPT_EXHAUSTED_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum StartError {
    #[error("empty nameservers list")]
    EmptyNameservers,
}

/// Per-listener socket limits.
#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub udp_size: usize,
}

impl From<&Settings> for ListenerOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            read_timeout: settings.read_timeout(),
            write_timeout: settings.write_timeout(),
            udp_size: settings.udp_size,
        }
    }
}

/// The two running listener loops.
pub struct Listeners {
    udp: JoinHandle<()>,
    tcp: JoinHandle<()>,
}

impl Listeners {
    pub fn abort(&self) {
        self.udp.abort();
        self.tcp.abort();
    }
}

/// Starts the UDP and TCP listeners on `bind`, both forwarding to
/// `nameservers` in the given order. Nothing is bound when the list is empty.
pub fn start(
    bind: SocketAddr,
    nameservers: Vec<String>,
    settings: &Settings,
) -> Result<Listeners, StartError> {
    if nameservers.is_empty() {
        return Err(StartError::EmptyNameservers);
    }
    let resolver = Resolver::new(
        nameservers,
        Arc::new(NetExchange),
        settings.upstream_timeout(),
        settings.stagger(),
    );
    info!(nameservers = ?resolver.nameservers(), "forwarding to nameservers");
    let handler = Handler::new(resolver);
    let opts = ListenerOptions::from(settings);

    let udp_handler = handler.clone();
    let udp = tokio::spawn(async move {
        info!(net = %Transport::Udp, addr = %bind, "start listener on");
        let res = match bind_udp(bind) {
            Ok(socket) => serve_udp(socket, udp_handler, opts).await,
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            error!(net = %Transport::Udp, addr = %bind, error = %err, "start listener on failed");
        }
    });

    let tcp = tokio::spawn(async move {
        info!(net = %Transport::Tcp, addr = %bind, "start listener on");
        let res = match TcpListener::bind(bind).await.context("bind tcp listener") {
            Ok(listener) => serve_tcp(listener, handler, opts).await,
            Err(err) => Err(err),
        };
        if let Err(err) = res {
            error!(net = %Transport::Tcp, addr = %bind, error = %err, "start listener on failed");
        }
    });

    Ok(Listeners { udp, tcp })
}

fn bind_udp(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    let _ = socket.set_recv_buffer_size(UDP_SOCKET_BUFFER);
    let _ = socket.set_send_buffer_size(UDP_SOCKET_BUFFER);
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind udp socket")?;
    UdpSocket::from_std(socket.into()).context("from_std")
}

/// Decodes an inbound packet, dropping anything that is not a query.
fn decode_query(packet: &[u8], peer: SocketAddr) -> Option<Message> {
    match Message::from_vec(packet) {
        Ok(msg) if msg.message_type() == MessageType::Query => Some(msg),
        Ok(_) => {
            debug!(peer = %peer, "ignoring inbound response");
            None
        }
        Err(err) => {
            debug!(peer = %peer, error = %err, "malformed query");
            None
        }
    }
}

/// Receive loop: every datagram is handled in its own task.
pub async fn serve_udp(socket: UdpSocket, handler: Handler, opts: ListenerOptions) -> anyhow::Result<()> {
    let socket = Arc::new(socket);
    let mut buf = BytesMut::with_capacity(opts.udp_size);

    loop {
        buf.reserve(opts.udp_size);
        let (len, peer) = match socket.recv_buf_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                // ICMP errors surface here; keep receiving
                debug!(error = %err, "udp recv failed");
                buf.clear();
                continue;
            }
        };
        let packet: Bytes = buf.split_to(len).freeze();

        let handler = handler.clone();
        let socket = Arc::clone(&socket);
        tokio::spawn(async move {
            let Some(request) = decode_query(&packet, peer) else {
                return;
            };
            let reply = UdpReply {
                socket,
                peer,
                write_timeout: opts.write_timeout,
            };
            handler.handle(Transport::Udp, reply, request).await;
        });
    }
}

/// Accept loop: one reader task per connection, one handling task per frame.
pub async fn serve_tcp(listener: TcpListener, handler: Handler, opts: ListenerOptions) -> anyhow::Result<()> {
    accept_loop(|| listener.accept(), handler, opts).await
}

/// Accept failures never end the loop; only binding the listener is fatal.
async fn accept_loop<F, Fut>(mut accept: F, handler: Handler, opts: ListenerOptions) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
{
    loop {
        let (stream, peer) = match accept().await {
            Ok(v) => v,
            Err(err) => {
                let backoff = accept_backoff(&err);
                warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "tcp accept failed");
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
                continue;
            }
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_tcp_conn(stream, peer, handler, opts).await {
                debug!(peer = %peer, error = %err, "tcp connection closed with error");
            }
        });
    }
}

fn accept_backoff(err: &io::Error) -> Duration {
    if is_resource_exhausted(err) {
        ACCEPT_EXHAUSTED_BACKOFF
    } else {
        Duration::ZERO
    }
}

#[cfg(unix)]
fn is_resource_exhausted(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhausted(_err: &io::Error) -> bool {
    false
}

async fn handle_tcp_conn(
    stream: TcpStream,
    peer: SocketAddr,
    handler: Handler,
    opts: ListenerOptions,
) -> anyhow::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let writer = Arc::new(Mutex::new(writer));
    let mut len_buf = [0u8; 2];

    loop {
        match timeout(opts.read_timeout, reader.read_exact(&mut len_buf)).await {
            // idle connection
            Err(_) => return Ok(()),
            Ok(Err(err)) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(err)) => return Err(err.into()),
            Ok(Ok(_)) => {}
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 {
            return Ok(());
        }

        let mut buf = vec![0u8; frame_len];
        timeout(opts.read_timeout, reader.read_exact(&mut buf))
            .await
            .context("tcp read timeout")??;

        let Some(request) = decode_query(&buf, peer) else {
            return Ok(());
        };
        let reply = TcpReply {
            writer: Arc::clone(&writer),
            peer,
            write_timeout: opts.write_timeout,
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.handle(Transport::Tcp, reply, request).await;
        });
    }
}

struct UdpReply {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    write_timeout: Duration,
}

#[async_trait]
impl ReplyWriter for UdpReply {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn write_reply(&mut self, packet: &[u8]) -> io::Result<()> {
        timeout(self.write_timeout, self.socket.send_to(packet, self.peer))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "udp write timeout"))??;
        Ok(())
    }
}

/// Replies on a connection share its write half; the connection closes
/// once the reader and every in-flight reply have let go of it.
struct TcpReply {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    peer: SocketAddr,
    write_timeout: Duration,
}

#[async_trait]
impl ReplyWriter for TcpReply {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn write_reply(&mut self, packet: &[u8]) -> io::Result<()> {
        if packet.len() > u16::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "reply too large for tcp"));
        }
        let mut out = Vec::with_capacity(2 + packet.len());
        out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
        out.extend_from_slice(packet);

        timeout(self.write_timeout, async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&out).await
        })
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp write timeout"))?
    }
}
