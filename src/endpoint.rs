//! Endpoint lifecycle: one transport binding per `(scheme, host, port,
//! identity)` key, with a single driver task funnelling transport reads,
//! outbound sends, retransmission wake-ups and the deduplicator sweep
//! through one loop.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Decoder;

use crate::config::ClientConfig;
use crate::dedup::Deduplicator;
use crate::error::{Error, FormatError, Result};
use crate::exchange::{Exchange, ExchangeStore, Response, Waiter};
use crate::message::option::ObserveOption;
use crate::message::packet::{self, Framing, StreamCodec};
use crate::message::uri::Scheme;
use crate::message::Message;
use crate::observe::ObserveState;
use crate::reliability::RetransmitSchedule;
use crate::transport::{ClientTransport, Credentials, Transport};

/// Commands the driver executes on the transport it owns.
pub(crate) enum Outbound {
    Datagram(SocketAddr, Vec<u8>),
    SetBroadcast(bool),
}

/// Registry key for one endpoint. The DTLS identity is part of the key so
/// two credential sets never share a binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct EndpointKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub identity: Option<String>,
}

pub(crate) struct EndpointCore {
    pub config: Arc<ClientConfig>,
    pub store: Mutex<ExchangeStore>,
    pub dedup: Mutex<Deduplicator>,
}

pub(crate) struct Endpoint {
    pub peer: SocketAddr,
    framing: Framing,
    core: Arc<EndpointCore>,
    outbound: mpsc::Sender<Outbound>,
    driver: JoinHandle<()>,
}

impl Endpoint {
    /// Resolves the key, creates and binds the transport, and starts the
    /// driver. String-literal IPs bypass DNS.
    pub async fn connect(
        key: &EndpointKey,
        config: Arc<ClientConfig>,
        credentials: Option<Credentials>,
    ) -> Result<Endpoint> {
        let peer = resolve(&key.host, key.port).await?;

        let transport = match key.scheme {
            Scheme::Coap => Transport::bind_udp(peer).await?,
            Scheme::Coaps => {
                // DTLS is a collaborator, not something this crate binds.
                let _ = credentials;
                return Err(Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "coaps requires a caller-supplied DTLS transport",
                )));
            }
            Scheme::CoapTcp => Transport::connect_tcp(peer).await?,
            Scheme::CoapsTcp => Transport::connect_tls(peer, &key.host).await?,
            Scheme::CoapWs => {
                Transport::connect_ws(&format!(
                    "ws://{}:{}/.well-known/coap",
                    key.host, key.port
                ))
                .await?
            }
            Scheme::CoapsWs => {
                Transport::connect_ws(&format!(
                    "wss://{}:{}/.well-known/coap",
                    key.host, key.port
                ))
                .await?
            }
        };

        Ok(Endpoint::start(key, peer, transport, config))
    }

    /// Starts an endpoint over a caller-supplied transport (the DTLS seam).
    pub fn with_transport(
        key: &EndpointKey,
        peer: SocketAddr,
        transport: Box<dyn ClientTransport>,
        config: Arc<ClientConfig>,
    ) -> Endpoint {
        Endpoint::start(key, peer, Transport::Custom(transport), config)
    }

    fn start(
        key: &EndpointKey,
        peer: SocketAddr,
        transport: Transport,
        config: Arc<ClientConfig>,
    ) -> Endpoint {
        let core = Arc::new(EndpointCore {
            store: Mutex::new(ExchangeStore::new(config.clone())),
            dedup: Mutex::new(Deduplicator::new(config.exchange_lifetime)),
            config: config.clone(),
        });

        let (outbound, outbound_rx) = mpsc::channel(64);
        let framing = key.scheme.framing();
        let driver = tokio::spawn(drive(
            transport,
            outbound_rx,
            core.clone(),
            framing,
            peer,
        ));

        Endpoint {
            peer,
            framing,
            core,
            outbound,
            driver,
        }
    }

    /// Binds a request (token, message id, destination) and registers its
    /// exchange; returns the completion handle for the waiter.
    pub async fn send_request(
        &self,
        request: Message,
    ) -> Result<(Vec<u8>, oneshot::Receiver<Result<Response>>)> {
        let (tx, rx) = oneshot::channel();
        let key = self
            .dispatch(request, self.peer, Waiter::Request(tx), false, false)
            .await?;
        Ok((key, rx))
    }

    /// Sends a request to a multicast group; responses fan in per source
    /// until the exchange lifetime ends.
    pub async fn send_multicast(
        &self,
        request: Message,
        group: SocketAddr,
    ) -> Result<(Vec<u8>, mpsc::Receiver<Response>)> {
        let (tx, rx) = mpsc::channel(16);
        let key = self
            .dispatch(request, group, Waiter::Multicast(tx), false, false)
            .await?;
        Ok((key, rx))
    }

    /// Registers an observation; the receiver yields notifications until
    /// the relation ends.
    pub async fn send_observe(
        &self,
        request: Message,
    ) -> Result<(Vec<u8>, mpsc::Receiver<Result<Response>>)> {
        let (tx, rx) = mpsc::channel(16);
        let key = self
            .dispatch(request, self.peer, Waiter::Observe(tx), true, false)
            .await?;
        Ok((key, rx))
    }

    /// CoAP ping: an empty confirmable message with an empty token,
    /// completed by the peer's RST.
    pub async fn send_ping(&self) -> Result<oneshot::Receiver<Result<Response>>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(Message::ping(), self.peer, Waiter::Request(tx), false, true)
            .await?;
        Ok(rx)
    }

    async fn dispatch(
        &self,
        mut request: Message,
        destination: SocketAddr,
        waiter: Waiter,
        observe: bool,
        ping: bool,
    ) -> Result<Vec<u8>> {
        let confirmable = request.header.is_confirmable();
        let (key, encoded) = {
            let mut store = self.core.store.lock().await;

            // Pings go out with the empty token; the registry still needs a
            // unique key for the exchange.
            let key = if ping || request.get_token().is_empty() {
                store.alloc_token()
            } else {
                request.get_token().to_vec()
            };
            if !ping {
                request.set_token(key.clone());
            }
            request.header.message_id = store.alloc_mid();

            // The block-wise layer above keeps bound payloads under this;
            // anything bigger must go through it, not around it.
            if request.payload.len() > self.core.config.max_message_size {
                return Err(Error::Format(FormatError::MessageTooLarge(
                    request.payload.len(),
                )));
            }
            let encoded = packet::encode(&request, self.framing)?;

            let mut exchange = Exchange::local(key.clone(), request, destination, waiter);
            if observe {
                exchange.observe_state =
                    Some(ObserveState::new(self.core.config.notification_max_age));
            }
            store.insert(exchange);

            // Only UDP confirmables are our reliability problem; streams
            // retransmit below us.
            if confirmable && self.framing == Framing::Udp {
                let handle = tokio::spawn(retransmit(
                    self.core.clone(),
                    key.clone(),
                    self.outbound.clone(),
                    destination,
                    encoded.clone(),
                ));
                if let Some(exchange) = store.get_mut(&key) {
                    exchange.retransmit_handle = Some(handle);
                }
            }

            (key, encoded)
        };

        self.outbound
            .send(Outbound::Datagram(destination, encoded))
            .await
            .map_err(|_| Error::Cancelled)?;
        Ok(key)
    }

    /// Reissues the stored request of a live exchange under a fresh message
    /// id; used by observe reregistration.
    pub async fn reregister(&self, key: &[u8]) -> Result<()> {
        let (destination, encoded) = {
            let mut store = self.core.store.lock().await;
            let mid = store.alloc_mid();
            store.rebind_mid(key, mid);
            let exchange = store.get_mut(key).ok_or(Error::Cancelled)?;
            if let Some(state) = exchange.observe_state.as_mut() {
                state.reregistered();
            }
            (
                exchange.destination,
                packet::encode(&exchange.request, self.framing)?,
            )
        };

        self.outbound
            .send(Outbound::Datagram(destination, encoded))
            .await
            .map_err(|_| Error::Cancelled)?;
        Ok(())
    }

    /// Proactive observe cancel: reissue the relation's request with
    /// Observe=1 and the same token. The server's final response (without
    /// an Observe option) closes the relation through the matcher.
    pub async fn deregister(&self, key: &[u8]) -> Result<()> {
        {
            let mut store = self.core.store.lock().await;
            let exchange = store.get_mut(key).ok_or(Error::Cancelled)?;
            exchange
                .request
                .set_observe_flag(ObserveOption::Deregister);
        }
        self.reregister(key).await
    }

    /// How long the relation has been idle and how many notifications it
    /// delivered since (re)registration.
    pub async fn observe_status(&self, key: &[u8]) -> Option<(Duration, u32)> {
        let mut store = self.core.store.lock().await;
        let exchange = store.get_mut(key)?;
        exchange
            .observe_state
            .as_ref()
            .map(|state| (state.idle_for(), state.delivered))
    }

    pub async fn cancel(&self, key: &[u8]) {
        self.core.store.lock().await.cancel(key);
    }

    /// Toggles broadcast sends on the UDP binding.
    pub async fn set_broadcast(&self, on: bool) -> Result<()> {
        self.outbound
            .send(Outbound::SetBroadcast(on))
            .await
            .map_err(|_| Error::Cancelled)
    }

    /// Stops the driver and fails every outstanding exchange.
    pub async fn stop(&self) {
        self.driver.abort();
        self.core.store.lock().await.fail_all(true);
    }
}

pub(crate) async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| {
            Error::Transport(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no address for {}", host),
            ))
        })
}

/// The per-endpoint event loop: transport reads, queued sends and the
/// mark-and-sweep tick all pass through here, so only this task touches
/// the transport.
async fn drive(
    mut transport: Transport,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    core: Arc<EndpointCore>,
    framing: Framing,
    default_peer: SocketAddr,
) {
    let mut sweep = tokio::time::interval(core.config.mark_and_sweep_interval);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut recv_buf = vec![0u8; core.config.channel_receive_packet_size];
    let mut stream_buf = BytesMut::new();

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Datagram(peer, bytes)) => {
                    if let Err(cause) = transport.send(peer, &bytes).await {
                        warn!("send to {} failed: {}", peer, cause);
                    }
                }
                Some(Outbound::SetBroadcast(on)) => {
                    if let Err(cause) = transport.set_broadcast(on) {
                        warn!("broadcast toggle failed: {}", cause);
                    }
                }
                None => break,
            },
            inbound = transport.recv(&mut recv_buf) => match inbound {
                Ok((n, source)) => {
                    let peer = source.unwrap_or(default_peer);
                    handle_inbound(
                        &mut transport,
                        &core,
                        framing,
                        peer,
                        &recv_buf[..n],
                        &mut stream_buf,
                    )
                    .await;
                }
                Err(cause) => {
                    warn!("transport receive failed: {}", cause);
                    break;
                }
            },
            _ = sweep.tick() => {
                core.dedup.lock().await.sweep();
                core.store.lock().await.expire();
            }
        }
    }

    core.store.lock().await.fail_all(true);
}

async fn handle_inbound(
    transport: &mut Transport,
    core: &Arc<EndpointCore>,
    framing: Framing,
    peer: SocketAddr,
    bytes: &[u8],
    stream_buf: &mut BytesMut,
) {
    match framing {
        Framing::Udp | Framing::WebSocket => {
            match packet::decode(bytes, framing) {
                Ok(message) => route_and_reply(transport, core, framing, peer, message).await,
                Err(cause) => debug!("undecodable message from {}: {}", peer, cause),
            }
        }
        Framing::Tcp => {
            // The stream chunks arbitrarily; reassemble frames first.
            stream_buf.extend_from_slice(bytes);
            let mut codec = StreamCodec;
            loop {
                match codec.decode(stream_buf) {
                    Ok(Some(message)) => {
                        route_and_reply(transport, core, framing, peer, message).await
                    }
                    Ok(None) => break,
                    Err(cause) => {
                        debug!("undecodable frame from {}: {}", peer, cause);
                        stream_buf.clear();
                        break;
                    }
                }
            }
        }
    }
}

async fn route_and_reply(
    transport: &mut Transport,
    core: &Arc<EndpointCore>,
    framing: Framing,
    peer: SocketAddr,
    message: Message,
) {
    let reply = {
        let mut store = core.store.lock().await;
        let mut dedup = core.dedup.lock().await;
        store.route_inbound(&mut dedup, message, peer)
    };

    if let Some(reply) = reply {
        match packet::encode(&reply, framing) {
            Ok(bytes) => {
                if let Err(cause) = transport.send(peer, &bytes).await {
                    warn!("reply to {} failed: {}", peer, cause);
                }
            }
            Err(cause) => warn!("reply encode failed: {}", cause),
        }
    }
}

/// Retransmission timer for one confirmable exchange. The schedule decides
/// the waits; the exchange's flags decide when to stop.
async fn retransmit(
    core: Arc<EndpointCore>,
    key: Vec<u8>,
    outbound: mpsc::Sender<Outbound>,
    destination: SocketAddr,
    bytes: Vec<u8>,
) {
    let mut schedule = RetransmitSchedule::new(&core.config);

    loop {
        tokio::time::sleep(schedule.delay()).await;

        let exhausted = {
            let mut store = core.store.lock().await;
            let exchange = match store.get_mut(&key) {
                Some(exchange) => exchange,
                None => return,
            };
            if exchange.acknowledged || exchange.rejected || exchange.cancelled {
                return;
            }
            if schedule.advance() {
                exchange.retransmits = schedule.attempts();
                false
            } else {
                true
            }
        };

        if exhausted {
            debug!("retransmission limit reached for token {:02x?}", key);
            core.store.lock().await.time_out(&key);
            return;
        }

        debug!("retransmitting token {:02x?} to {}", key, destination);
        if outbound
            .send(Outbound::Datagram(destination, bytes.clone()))
            .await
            .is_err()
        {
            return;
        }
    }
}
