use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hickory_proto::op::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Transport;

const MAX_UDP_RESPONSE: usize = 65535;

/// One request/response exchange against a single nameserver.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn exchange(
        &self,
        request: &Message,
        nameserver: &str,
        transport: Transport,
        timeout_dur: Duration,
    ) -> anyhow::Result<Message>;
}

/// Socket-backed exchange: a fresh UDP socket or TCP connection per attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct NetExchange;

#[async_trait]
impl Exchange for NetExchange {
    async fn exchange(
        &self,
        request: &Message,
        nameserver: &str,
        transport: Transport,
        timeout_dur: Duration,
    ) -> anyhow::Result<Message> {
        let addr = resolve_nameserver(nameserver).await?;
        let packet = request.to_vec().context("encode request")?;
        match transport {
            Transport::Udp => exchange_udp(addr, &packet, request.id(), timeout_dur).await,
            Transport::Tcp => exchange_tcp(addr, &packet, timeout_dur).await,
        }
    }
}

async fn resolve_nameserver(nameserver: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = nameserver.parse::<SocketAddr>() {
        return Ok(addr);
    }
    lookup_host(nameserver)
        .await
        .with_context(|| format!("resolve nameserver {nameserver}"))?
        .next()
        .with_context(|| format!("no address for nameserver {nameserver}"))
}

fn udp_socket_for(addr: SocketAddr) -> anyhow::Result<UdpSocket> {
    let (domain, local): (Domain, SocketAddr) = if addr.is_ipv4() {
        (Domain::IPV4, "0.0.0.0:0".parse()?)
    } else {
        (Domain::IPV6, "[::]:0".parse()?)
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    if let Err(e) = socket.set_recv_buffer_size(MAX_UDP_RESPONSE) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    socket.bind(&local.into()).context("bind")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    UdpSocket::from_std(socket.into()).context("from_std")
}

async fn exchange_udp(
    addr: SocketAddr,
    packet: &[u8],
    id: u16,
    timeout_dur: Duration,
) -> anyhow::Result<Message> {
    let sock = udp_socket_for(addr)?;
    sock.connect(addr).await?;
    timeout(timeout_dur, sock.send(packet))
        .await
        .context("udp write timeout")??;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE];
    let size = timeout(timeout_dur, async {
        loop {
            let size = sock.recv(&mut buf).await?;
            // connected socket only sees the upstream, but stale datagrams may still carry another id
            if size >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                return Ok::<_, std::io::Error>(size);
            }
            debug!(upstream = %addr, size, "discarding udp datagram with unexpected id");
        }
    })
    .await
    .context("udp read timeout")??;

    Message::from_vec(&buf[..size]).context("decode udp response")
}

async fn exchange_tcp(
    addr: SocketAddr,
    packet: &[u8],
    timeout_dur: Duration,
) -> anyhow::Result<Message> {
    if packet.len() > u16::MAX as usize {
        anyhow::bail!("dns packet too large for tcp");
    }
    let mut stream = timeout(timeout_dur, TcpStream::connect(addr))
        .await
        .context("tcp connect timeout")??;
    stream.set_nodelay(true)?;

    let mut out = Vec::with_capacity(2 + packet.len());
    out.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    out.extend_from_slice(packet);
    timeout(timeout_dur, stream.write_all(&out))
        .await
        .context("tcp write timeout")??;

    let buf = timeout(timeout_dur, async {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; resp_len];
        stream.read_exact(&mut buf).await?;
        Ok::<_, std::io::Error>(buf)
    })
    .await
    .context("tcp read timeout")??;

    Message::from_vec(&buf).context("decode tcp response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, Query, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};
    use std::str::FromStr;
    use tokio::net::TcpListener;

    fn request(id: u16) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str("example.com.").unwrap(), RecordType::A));
        msg
    }

    fn reply_to(req: &Message, rcode: ResponseCode) -> Message {
        let mut msg = Message::new();
        msg.set_id(req.id());
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(rcode);
        msg.add_queries(req.queries().to_vec());
        msg
    }

    #[tokio::test]
    async fn udp_exchange_skips_foreign_ids() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, peer) = upstream.recv_from(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf[..len]).unwrap();
            let mut stale = reply_to(&req, ResponseCode::Refused);
            stale.set_id(req.id().wrapping_add(1));
            upstream.send_to(&stale.to_vec().unwrap(), peer).await.unwrap();
            let good = reply_to(&req, ResponseCode::NXDomain);
            upstream.send_to(&good.to_vec().unwrap(), peer).await.unwrap();
        });

        let resp = NetExchange
            .exchange(&request(4242), &addr.to_string(), Transport::Udp, Duration::from_secs(2))
            .await
            .expect("udp exchange");
        assert_eq!(resp.id(), 4242);
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn udp_exchange_times_out_without_answer() {
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = upstream.local_addr().unwrap();

        let res = NetExchange
            .exchange(&request(1), &addr.to_string(), Transport::Udp, Duration::from_millis(100))
            .await;
        assert!(res.is_err());
        drop(upstream);
    }

    #[tokio::test]
    async fn tcp_exchange_uses_length_prefixed_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await.unwrap();
            let mut buf = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf).unwrap();
            let out = reply_to(&req, ResponseCode::NoError).to_vec().unwrap();
            stream.write_all(&(out.len() as u16).to_be_bytes()).await.unwrap();
            stream.write_all(&out).await.unwrap();
        });

        let resp = NetExchange
            .exchange(&request(7), &addr.to_string(), Transport::Tcp, Duration::from_secs(2))
            .await
            .expect("tcp exchange");
        assert_eq!(resp.id(), 7);
        assert_eq!(resp.message_type(), MessageType::Response);
    }

    #[tokio::test]
    async fn tcp_exchange_fails_on_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let res = NetExchange
            .exchange(&request(9), &addr.to_string(), Transport::Tcp, Duration::from_millis(500))
            .await;
        assert!(res.is_err());
    }
}
