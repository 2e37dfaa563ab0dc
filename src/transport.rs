//! Transport bindings: the channel contract the engine requires from its
//! socket collaborators.
//!
//! Every transport yields `(bytes, peer)` reads and accepts `(peer, bytes)`
//! writes. UDP stays unconnected so multicast works; the stream transports
//! carry a fixed remote. DTLS (and anything else the crate does not bind
//! itself) plugs in through [`ClientTransport`] with an opaque credential
//! handoff.

use std::io::{Error, ErrorKind, Result as IoResult};
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_native_tls::TlsStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Opaque credential material handed to a pluggable secure transport. The
/// engine never interprets it.
#[derive(Clone)]
pub struct Credentials {
    /// PSK identity or certificate subject; also part of the endpoint key.
    pub identity: String,
    /// Key or certificate bytes, in whatever form the transport expects.
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The secret never reaches logs.
        f.debug_struct("Credentials")
            .field("identity", &self.identity)
            .finish()
    }
}

/// The bidirectional channel contract for caller-supplied transports
/// (typically DTLS).
#[async_trait]
pub trait ClientTransport: Send {
    async fn send(&mut self, peer: SocketAddr, data: &[u8]) -> IoResult<()>;
    async fn recv(&mut self, buf: &mut [u8]) -> IoResult<(usize, Option<SocketAddr>)>;
    async fn close(&mut self) -> IoResult<()> {
        Ok(())
    }
}

pub enum Transport {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
    WebSocket(WebSocketStream<MaybeTlsStream<TcpStream>>),
    Custom(Box<dyn ClientTransport>),
}

impl Transport {
    /// Binds an unconnected UDP socket with the address family of the peer.
    pub async fn bind_udp(peer: SocketAddr) -> IoResult<Transport> {
        let bind_addr = match peer.ip() {
            IpAddr::V4(_) => "0.0.0.0:0",
            IpAddr::V6(_) => "[::]:0",
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Transport::Udp(socket))
    }

    pub async fn connect_tcp(addr: SocketAddr) -> IoResult<Transport> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Transport::Tcp(stream))
    }

    pub async fn connect_tls(addr: SocketAddr, domain: &str) -> IoResult<Transport> {
        let tcp = TcpStream::connect(addr).await?;
        let cx = native_tls::TlsConnector::new()
            .map_err(|cause| Error::new(ErrorKind::Other, cause))?;
        let cx = tokio_native_tls::TlsConnector::from(cx);
        let tls_stream = cx
            .connect(domain, tcp)
            .await
            .map_err(|cause| Error::new(ErrorKind::Other, cause))?;
        Ok(Transport::Tls(tls_stream))
    }

    pub async fn connect_ws(url: &str) -> IoResult<Transport> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|cause| Error::new(ErrorKind::Other, cause))?;
        Ok(Transport::WebSocket(ws_stream))
    }

    /// Enables broadcast sends on a UDP binding.
    pub fn set_broadcast(&self, on: bool) -> IoResult<()> {
        match self {
            Transport::Udp(socket) => socket.set_broadcast(on),
            _ => Err(Error::new(
                ErrorKind::Unsupported,
                "broadcast only applies to udp",
            )),
        }
    }

    pub async fn send(&mut self, peer: SocketAddr, data: &[u8]) -> IoResult<()> {
        match self {
            Transport::Udp(socket) => {
                let sent = socket.send_to(data, peer).await?;
                if sent != data.len() {
                    return Err(Error::new(ErrorKind::Other, "short datagram write"));
                }
                Ok(())
            }
            Transport::Tcp(stream) => stream.write_all(data).await,
            Transport::Tls(stream) => stream.write_all(data).await,
            Transport::WebSocket(ws) => ws
                .send(WsMessage::Binary(data.to_vec()))
                .await
                .map_err(|cause| Error::new(ErrorKind::Other, cause)),
            Transport::Custom(transport) => transport.send(peer, data).await,
        }
    }

    /// Reads one datagram, stream chunk or frame. Stream transports return
    /// no peer; the caller substitutes the connected remote.
    pub async fn recv(&mut self, buf: &mut [u8]) -> IoResult<(usize, Option<SocketAddr>)> {
        match self {
            Transport::Udp(socket) => {
                let (n, src) = socket.recv_from(buf).await?;
                Ok((n, Some(src)))
            }
            Transport::Tcp(stream) => {
                let n = stream.read(buf).await?;
                if n == 0 {
                    return Err(Error::new(ErrorKind::UnexpectedEof, "connection closed"));
                }
                Ok((n, None))
            }
            Transport::Tls(stream) => {
                let n = stream.read(buf).await?;
                if n == 0 {
                    return Err(Error::new(ErrorKind::UnexpectedEof, "connection closed"));
                }
                Ok((n, None))
            }
            Transport::WebSocket(ws) => loop {
                let frame = match ws.next().await {
                    Some(frame) => frame.map_err(|cause| Error::new(ErrorKind::Other, cause))?,
                    None => {
                        return Err(Error::new(ErrorKind::UnexpectedEof, "websocket closed"))
                    }
                };
                match frame {
                    WsMessage::Binary(data) => {
                        if data.len() > buf.len() {
                            return Err(Error::new(
                                ErrorKind::InvalidData,
                                "frame exceeds receive buffer",
                            ));
                        }
                        buf[..data.len()].copy_from_slice(&data);
                        return Ok((data.len(), None));
                    }
                    // Pings are answered by tungstenite itself; ignore the
                    // rest of the control traffic.
                    other => debug!("ignoring non-binary websocket frame: {:?}", other),
                }
            },
            Transport::Custom(transport) => transport.recv(buf).await,
        }
    }

    pub async fn close(&mut self) -> IoResult<()> {
        match self {
            Transport::Udp(_) => Ok(()),
            Transport::Tcp(stream) => stream.shutdown().await,
            Transport::Tls(stream) => stream.shutdown().await,
            Transport::WebSocket(ws) => ws
                .close(None)
                .await
                .map_err(|cause| Error::new(ErrorKind::Other, cause)),
            Transport::Custom(transport) => transport.close().await,
        }
    }
}
