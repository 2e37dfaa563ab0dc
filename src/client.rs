//! The client façade: request methods, observation, discovery, ping,
//! multicast and lifecycle management over a registry of endpoints.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use lru_time_cache::LruCache;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::block::{Block1State, Block2State, BlockValue};
use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, EndpointKey};
use crate::error::{Error, Result};
use crate::exchange::Response;
use crate::message::header::{RequestType as Method, ResponseType as Status};
use crate::message::option::{CoapOption, ContentFormat, ObserveOption};
use crate::message::uri::CoapUri;
use crate::message::{Message, RequestBuilder};
use crate::observe::ObserveRelation;
use crate::transport::ClientTransport;

/// The "all CoAP devices" IPv4 multicast group.
pub const ALL_COAP_DEVICES_V4: &str = "224.0.1.187";

/// The "all CoAP devices" IPv6 multicast group for one scope segment
/// (`ff0?::fd`, segment 0x0..=0xf).
pub fn all_coap_devices_v6(segment: u8) -> String {
    assert!(segment <= 0xf);
    format!("ff{:02x}::fd", segment)
}

/// Key for partially reassembled Block2 bodies, so a stalled transfer can
/// be resumed by an equal request until its lifetime ends.
#[derive(Ord, PartialOrd, Eq, PartialEq, Clone)]
struct RequestCacheKey {
    method: u8,
    path: String,
    peer: SocketAddr,
}

/// An asynchronous CoAP client.
///
/// One client owns its endpoints, exchanges and deduplication state;
/// clients sharing a process do not share anything.
pub struct CoAPClient {
    config: Arc<ClientConfig>,
    endpoints: Mutex<HashMap<EndpointKey, Arc<Endpoint>>>,
    block2_states: Mutex<LruCache<RequestCacheKey, Block2State>>,
    watchdogs: Mutex<Vec<JoinHandle<()>>>,
}

impl CoAPClient {
    pub fn new() -> CoAPClient {
        CoAPClient::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> CoAPClient {
        let blockwise_lifetime = config.blockwise_status_lifetime;
        CoAPClient {
            config: Arc::new(config),
            endpoints: Mutex::new(HashMap::new()),
            block2_states: Mutex::new(LruCache::with_expiry_duration(blockwise_lifetime)),
            watchdogs: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Execute a GET request.
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.request(url, Method::Get, None, Vec::new()).await
    }

    /// Execute a GET request with an overall deadline.
    pub async fn get_with_timeout(&self, url: &str, timeout: Duration) -> Result<Response> {
        self.request_full(url, Method::Get, None, Vec::new(), false, Some(timeout))
            .await
    }

    /// Execute a POST request.
    pub async fn post(&self, url: &str, payload: Vec<u8>) -> Result<Response> {
        self.request(url, Method::Post, Some(payload), Vec::new())
            .await
    }

    /// Execute a POST request with an overall deadline.
    pub async fn post_with_timeout(
        &self,
        url: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Response> {
        self.request_full(url, Method::Post, Some(payload), Vec::new(), false, Some(timeout))
            .await
    }

    /// Execute a PUT request.
    pub async fn put(&self, url: &str, payload: Vec<u8>) -> Result<Response> {
        self.request(url, Method::Put, Some(payload), Vec::new())
            .await
    }

    /// Execute a PUT request with an overall deadline.
    pub async fn put_with_timeout(
        &self,
        url: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Response> {
        self.request_full(url, Method::Put, Some(payload), Vec::new(), false, Some(timeout))
            .await
    }

    /// Execute a DELETE request.
    pub async fn delete(&self, url: &str) -> Result<Response> {
        self.request(url, Method::Delete, None, Vec::new()).await
    }

    /// Execute a DELETE request with an overall deadline.
    pub async fn delete_with_timeout(&self, url: &str, timeout: Duration) -> Result<Response> {
        self.request_full(url, Method::Delete, None, Vec::new(), false, Some(timeout))
            .await
    }

    /// Execute a FETCH request (RFC 8132).
    pub async fn fetch(&self, url: &str, payload: Vec<u8>) -> Result<Response> {
        self.request(url, Method::Fetch, Some(payload), Vec::new())
            .await
    }

    /// Execute a PATCH request (RFC 8132).
    pub async fn patch(&self, url: &str, payload: Vec<u8>) -> Result<Response> {
        self.request(url, Method::Patch, Some(payload), Vec::new())
            .await
    }

    /// Execute an iPATCH request (RFC 8132).
    pub async fn ipatch(&self, url: &str, payload: Vec<u8>) -> Result<Response> {
        self.request(url, Method::IPatch, Some(payload), Vec::new())
            .await
    }

    /// Execute a request with extra options.
    pub async fn request(
        &self,
        url: &str,
        method: Method,
        payload: Option<Vec<u8>>,
        options: Vec<(CoapOption, Vec<u8>)>,
    ) -> Result<Response> {
        self.request_full(url, method, payload, options, false, None)
            .await
    }

    /// The fully parameterized request path: caller options are merged,
    /// `early_block2` advertises the preferred response block size on the
    /// initial request, and `timeout` is an overall deadline on top of the
    /// retransmission schedule.
    pub async fn request_full(
        &self,
        url: &str,
        method: Method,
        payload: Option<Vec<u8>>,
        options: Vec<(CoapOption, Vec<u8>)>,
        early_block2: bool,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let uri = CoapUri::parse(url)?;
        if uri.is_multicast() {
            // A single-response wait on a group address loses responses;
            // that is a programming error, not a runtime condition.
            return Err(Error::MulticastWithoutHandler);
        }

        let endpoint = self.endpoint_for(&uri, None).await?;
        let mut message = self.build_request(&uri, method, payload, options)?;
        if early_block2 {
            Block2State::early_negotiation(self.config.default_block_size)
                .set_on(&mut message, CoapOption::Block2);
        }

        let block_size = self
            .config
            .default_block_size
            .min(self.config.max_message_size);
        let first = if message.payload.len() > block_size {
            self.send_block1(&endpoint, message.clone(), block_size, timeout)
                .await?
        } else {
            self.exchange_once(&endpoint, message.clone(), timeout)
                .await?
        };

        self.receive_block2(&endpoint, &uri, method, message, first, timeout)
            .await
    }

    /// Registers an observation and returns the notification stream.
    ///
    /// The first 2.05 (carrying the initial state) is delivered through the
    /// relation like every later notification. Dropping the relation is the
    /// reactive cancel; [`CoAPClient::cancel_observe`] is the proactive one.
    pub async fn observe(&self, url: &str) -> Result<ObserveRelation> {
        let uri = CoapUri::parse(url)?;
        if uri.is_multicast() {
            return Err(Error::MulticastWithoutHandler);
        }

        let endpoint = self.endpoint_for(&uri, None).await?;
        let mut builder = RequestBuilder::new(&uri.path, Method::Get)
            .queries(uri.queries.clone())
            .observe(ObserveOption::Register);
        if uri.host.parse::<IpAddr>().is_err() {
            builder = builder.domain(uri.host.clone());
        }
        if uri.port != uri.scheme.default_port() {
            builder = builder.port(uri.port);
        }

        let (key, rx) = endpoint.send_observe(builder.build()?).await?;
        self.spawn_reregistration_watchdog(&endpoint, key.clone()).await;

        Ok(ObserveRelation::new(key, uri, rx))
    }

    /// Proactive observe cancel: GET with Observe=1 and the relation's
    /// token. The server's final response closes the stream.
    pub async fn cancel_observe(&self, relation: &ObserveRelation) -> Result<()> {
        let endpoint = self.endpoint_for(relation.uri(), None).await?;
        endpoint.deregister(relation.token()).await
    }

    /// Cancels an in-flight exchange: the waiter unblocks with a
    /// cancellation error and the exchange is freed. A second cancel (or a
    /// cancel after completion) is a no-op.
    pub async fn cancel(&self, url: &str, token: &[u8]) -> Result<()> {
        let uri = CoapUri::parse(url)?;
        let endpoint = self.endpoint_for(&uri, None).await?;
        endpoint.cancel(token).await;
        Ok(())
    }

    /// Resource discovery: GET `/.well-known/core`. The response payload is
    /// the raw link-format document; parsing it is the caller's concern.
    pub async fn discover(&self, base_url: &str) -> Result<Response> {
        let uri = CoapUri::parse(base_url)?;
        let url = format!(
            "{}://{}:{}/.well-known/core",
            uri.scheme.as_str(),
            if uri.host.contains(':') {
                format!("[{}]", uri.host)
            } else {
                uri.host.clone()
            },
            uri.port
        );
        self.request(
            &url,
            Method::Get,
            None,
            vec![(
                CoapOption::Accept,
                crate::message::option::encode_integer(
                    ContentFormat::ApplicationLinkFormat as u32,
                ),
            )],
        )
        .await
    }

    /// CoAP ping: an empty confirmable message. `true` means the peer is
    /// alive (it answered RST); `false` means it never did.
    pub async fn ping(&self, url: &str) -> Result<bool> {
        let uri = CoapUri::parse(url)?;
        let endpoint = self.endpoint_for(&uri, None).await?;
        let rx = endpoint.send_ping().await?;

        match rx.await {
            Ok(Err(Error::Reset)) => Ok(true),
            Ok(Err(Error::Timeout)) => Ok(false),
            Ok(Err(err)) => Err(err),
            // An actual response to a ping is nonsense; treat as dead.
            Ok(Ok(_)) | Err(_) => Ok(false),
        }
    }

    /// Sends a non-confirmable request to a multicast group and returns the
    /// fan-in stream of responses, keyed by source, open until the exchange
    /// lifetime ends.
    pub async fn multicast(
        &self,
        url: &str,
        method: Method,
        payload: Option<Vec<u8>>,
    ) -> Result<MulticastResponses> {
        let uri = CoapUri::parse(url)?;
        if !uri.is_multicast() {
            return Err(Error::MulticastWithoutHandler);
        }

        let endpoint = self.endpoint_for(&uri, None).await?;
        let mut builder = RequestBuilder::new(&uri.path, method)
            .queries(uri.queries.clone())
            .confirmable(false);
        if let Some(payload) = payload {
            builder = builder.payload(payload);
        }

        let group = SocketAddr::new(uri.host.parse::<IpAddr>().unwrap(), uri.port);
        let (_key, rx) = endpoint.send_multicast(builder.build()?, group).await?;
        Ok(MulticastResponses { rx })
    }

    /// Installs a caller-supplied transport (typically DTLS with its
    /// credential handoff already applied) for one endpoint key.
    pub async fn install_transport(
        &self,
        url: &str,
        identity: Option<String>,
        transport: Box<dyn ClientTransport>,
    ) -> Result<()> {
        let uri = CoapUri::parse(url)?;
        let peer = crate::endpoint::resolve(&uri.host, uri.port).await?;
        let key = EndpointKey {
            scheme: uri.scheme,
            host: uri.host.clone(),
            port: uri.port,
            identity,
        };

        let endpoint = Endpoint::with_transport(&key, peer, transport, self.config.clone());
        if let Some(old) = self
            .endpoints
            .lock()
            .await
            .insert(key, Arc::new(endpoint))
        {
            old.stop().await;
        }
        Ok(())
    }

    /// Toggles broadcast sends on the endpoint serving this URL.
    pub async fn set_broadcast(&self, url: &str, on: bool) -> Result<()> {
        let uri = CoapUri::parse(url)?;
        let endpoint = self.endpoint_for(&uri, None).await?;
        endpoint.set_broadcast(on).await
    }

    /// Stops every endpoint and watchdog and clears the registry.
    pub async fn close(&self) {
        for watchdog in self.watchdogs.lock().await.drain(..) {
            watchdog.abort();
        }
        let endpoints: Vec<_> = self.endpoints.lock().await.drain().collect();
        for (_, endpoint) in endpoints {
            endpoint.stop().await;
        }
    }

    async fn endpoint_for(
        &self,
        uri: &CoapUri,
        identity: Option<String>,
    ) -> Result<Arc<Endpoint>> {
        let key = EndpointKey {
            scheme: uri.scheme,
            host: uri.host.clone(),
            port: uri.port,
            identity,
        };

        let mut endpoints = self.endpoints.lock().await;
        if let Some(endpoint) = endpoints.get(&key) {
            return Ok(endpoint.clone());
        }

        debug!("opening endpoint {}://{}:{}", key.scheme.as_str(), key.host, key.port);
        let endpoint = Arc::new(Endpoint::connect(&key, self.config.clone(), None).await?);
        endpoints.insert(key, endpoint.clone());
        Ok(endpoint)
    }

    fn build_request(
        &self,
        uri: &CoapUri,
        method: Method,
        payload: Option<Vec<u8>>,
        options: Vec<(CoapOption, Vec<u8>)>,
    ) -> Result<Message> {
        let mut builder = RequestBuilder::new(&uri.path, method)
            .queries(uri.queries.clone())
            .options(options);
        if uri.host.parse::<IpAddr>().is_err() {
            builder = builder.domain(uri.host.clone());
        }
        if uri.port != uri.scheme.default_port() {
            builder = builder.port(uri.port);
        }
        if let Some(payload) = payload {
            builder = builder.payload(payload);
        }
        builder.build()
    }

    /// Sends one bound message and awaits its single response, honoring an
    /// overall deadline on top of the retransmission schedule.
    async fn exchange_once(
        &self,
        endpoint: &Arc<Endpoint>,
        message: Message,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let (key, rx) = endpoint.send_request(message).await?;

        let completed = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(completed) => completed,
                Err(_) => {
                    endpoint.cancel(&key).await;
                    return Err(Error::Timeout);
                }
            },
            None => rx.await,
        };

        completed.map_err(|_| Error::Cancelled)?
    }

    /// Uploads a large body block by block (Block1), negotiating the block
    /// size down when the server asks for it.
    async fn send_block1(
        &self,
        endpoint: &Arc<Endpoint>,
        mut message: Message,
        block_size: usize,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let payload = std::mem::take(&mut message.payload);
        let mut state = Block1State::new(payload, block_size);

        loop {
            if state.is_stale(self.config.blockwise_status_lifetime) {
                return Err(Error::Timeout);
            }

            let block = state.current_block();
            let mut chunk_message = message.clone();
            block.set_on(&mut chunk_message, CoapOption::Block1);
            chunk_message.payload = state.chunk().to_vec();

            let response = self
                .exchange_once(endpoint, chunk_message, timeout)
                .await?;

            if !block.more {
                // The final block carries the real response.
                return Ok(response);
            }

            match response.message.status() {
                Some(Status::Continue) => {
                    if !state.advance() {
                        warn!("peer kept asking for blocks past the body end");
                        return Ok(response);
                    }
                    // The bytes already sent are retained; a smaller size
                    // from the server only renumbers what remains.
                    if let Some(acked) =
                        BlockValue::from_message(&response.message, CoapOption::Block1)
                    {
                        state.renegotiate(acked.size_exponent);
                    }
                }
                // Anything else ends the transfer; surface it to the caller.
                _ => return Ok(response),
            }
        }
    }

    /// Pulls the remaining blocks of a Block2 response and splices the full
    /// body into the final response.
    async fn receive_block2(
        &self,
        endpoint: &Arc<Endpoint>,
        uri: &CoapUri,
        method: Method,
        request: Message,
        first: Response,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        let block = match BlockValue::from_message(&first.message, CoapOption::Block2) {
            Some(block) => block,
            None => return Ok(first),
        };

        let cache_key = RequestCacheKey {
            method: u8::from(crate::message::header::MessageClass::Request(method)),
            path: uri.path.clone(),
            peer: endpoint.peer,
        };

        let mut more = {
            let mut states = self.block2_states.lock().await;
            let state = states
                .entry(cache_key.clone())
                .or_insert_with(Block2State::new);
            if state.is_stale(self.config.blockwise_status_lifetime) {
                *state = Block2State::new();
            }
            match state.accept(&block, &first.message.payload) {
                Ok(more) => more,
                // A fresh transfer restarting over leftover partial state.
                Err(_) if block.num == 0 => {
                    *state = Block2State::new();
                    state.accept(&block, &first.message.payload)?
                }
                Err(cause) => return Err(cause.into()),
            }
        };

        let mut last = first;
        while more {
            let mut next_message = request.clone();
            next_message.payload.clear();
            {
                let mut states = self.block2_states.lock().await;
                let state = states
                    .entry(cache_key.clone())
                    .or_insert_with(Block2State::new);
                state
                    .next_request()
                    .set_on(&mut next_message, CoapOption::Block2);
            }

            let response = self.exchange_once(endpoint, next_message, timeout).await?;
            let block = BlockValue::from_message(&response.message, CoapOption::Block2)
                .ok_or(Error::Format(
                    crate::error::FormatError::InvalidOptionLength,
                ))?;

            more = {
                let mut states = self.block2_states.lock().await;
                let state = states
                    .entry(cache_key.clone())
                    .or_insert_with(Block2State::new);
                state.accept(&block, &response.message.payload)?
            };
            last = response;
        }

        let state = self.block2_states.lock().await.remove(&cache_key);
        if let Some(state) = state {
            last.message.payload = state.into_payload();
        }
        Ok(last)
    }

    async fn spawn_reregistration_watchdog(&self, endpoint: &Arc<Endpoint>, key: Vec<u8>) {
        let endpoint = Arc::downgrade(endpoint);
        let config = self.config.clone();

        let watchdog = tokio::spawn(async move {
            loop {
                tokio::time::sleep(config.notification_reregistration_backoff).await;

                let endpoint = match endpoint.upgrade() {
                    Some(endpoint) => endpoint,
                    None => return,
                };
                let (idle, delivered) = match endpoint.observe_status(&key).await {
                    Some(status) => status,
                    // Relation ended; the watchdog goes with it.
                    None => return,
                };

                if idle >= config.notification_check_interval_time
                    || delivered >= config.notification_check_interval_count
                {
                    debug!("reregistering observation {:02x?}", key);
                    tokio::time::sleep(config.notification_reregistration_backoff).await;
                    if endpoint.reregister(&key).await.is_err() {
                        return;
                    }
                }
            }
        });

        self.watchdogs.lock().await.push(watchdog);
    }
}

impl Default for CoAPClient {
    fn default() -> CoAPClient {
        CoAPClient::new()
    }
}

/// The fan-in stream of multicast responses, one per responding source.
#[derive(Debug)]
pub struct MulticastResponses {
    rx: mpsc::Receiver<Response>,
}

impl MulticastResponses {
    pub async fn next_response(&mut self) -> Option<Response> {
        self.rx.recv().await
    }
}

impl futures::Stream for MulticastResponses {
    type Item = Response;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        ctx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.rx.poll_recv(ctx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::header::{MessageClass, MessageType};
    use crate::message::packet::{self, Framing};
    use tokio::net::UdpSocket;

    fn test_config() -> ClientConfig {
        ClientConfig {
            ack_timeout: Duration::from_millis(100),
            ack_random_factor: 1.0,
            use_random_id_start: false,
            use_random_token_start: false,
            ..ClientConfig::default()
        }
    }

    /// Spawns an in-process UDP peer driving `handler` for every request.
    async fn spawn_server<F>(mut handler: F) -> SocketAddr
    where
        F: FnMut(Message) -> Option<Message> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, src)) = socket.recv_from(&mut buf).await {
                let inbound = match packet::decode(&buf[..n], Framing::Udp) {
                    Ok(message) => message,
                    Err(_) => continue,
                };
                if let Some(reply) = handler(inbound) {
                    let bytes = packet::encode(&reply, Framing::Udp).unwrap();
                    socket.send_to(&bytes, src).await.unwrap();
                }
            }
        });

        addr
    }

    fn piggy_backed(request: &Message, status: Status, payload: &[u8]) -> Message {
        let mut response = Message::ack_for(request.header.message_id);
        response.header.code = MessageClass::Response(status);
        response.set_token(request.get_token().to_vec());
        response.payload = payload.to_vec();
        response
    }

    #[tokio::test]
    async fn test_get_piggy_backed_success() {
        let addr = spawn_server(|request| {
            assert_eq!(request.get_path(), "hello");
            Some(piggy_backed(&request, Status::Content, b"Hello World"))
        })
        .await;

        let client = CoAPClient::with_config(test_config());
        let response = client
            .get(&format!("coap://{}/hello", addr))
            .await
            .unwrap();

        assert_eq!(response.message.status(), Some(Status::Content));
        assert_eq!(response.message.payload, b"Hello World".to_vec());
        assert_eq!(response.retransmits, 0);
        client.close().await;
    }

    #[tokio::test]
    async fn test_query_and_host_options_reach_server() {
        let addr = spawn_server(|request| {
            let query = request
                .get_first_option(CoapOption::UriQuery)
                .cloned()
                .unwrap();
            assert_eq!(query, b"unit=c".to_vec());
            // Literal-IP URLs carry no Uri-Host.
            assert!(request.get_first_option(CoapOption::UriHost).is_none());
            Some(piggy_backed(&request, Status::Content, b"21.5"))
        })
        .await;

        let client = CoAPClient::with_config(test_config());
        let response = client
            .get(&format!("coap://{}/sensors/temp?unit=c", addr))
            .await
            .unwrap();
        assert_eq!(response.message.payload, b"21.5".to_vec());
        client.close().await;
    }

    #[tokio::test]
    async fn test_put_block1_upload() {
        // Collect the Block1 values the client sends.
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let addr = spawn_server(move |request| {
            let block = BlockValue::from_message(&request, CoapOption::Block1).unwrap();
            seen_tx
                .send((block.num, block.more, block.size_exponent, request.payload.len()))
                .unwrap();

            let status = if block.more {
                Status::Continue
            } else {
                Status::Changed
            };
            let mut response = piggy_backed(&request, status, b"");
            block.set_on(&mut response, CoapOption::Block1);
            Some(response)
        })
        .await;

        let config = ClientConfig {
            default_block_size: 512,
            ..test_config()
        };
        let client = CoAPClient::with_config(config);
        let response = client
            .put(&format!("coap://{}/upload", addr), vec![0xAB; 2048])
            .await
            .unwrap();
        assert_eq!(response.message.status(), Some(Status::Changed));

        let mut seen = Vec::new();
        while let Ok(block) = seen_rx.try_recv() {
            seen.push(block);
        }
        assert_eq!(
            seen,
            vec![
                (0, true, 5, 512),
                (1, true, 5, 512),
                (2, true, 5, 512),
                (3, false, 5, 512),
            ]
        );
        client.close().await;
    }

    #[tokio::test]
    async fn test_block1_size_renegotiation() {
        let addr = spawn_server(move |request| {
            let block = BlockValue::from_message(&request, CoapOption::Block1).unwrap();
            let status = if block.more {
                Status::Continue
            } else {
                Status::Changed
            };
            let mut response = piggy_backed(&request, status, b"");
            // Insist on 256-byte blocks.
            let mut acked = block;
            acked.size_exponent = 4;
            acked.set_on(&mut response, CoapOption::Block1);
            Some(response)
        })
        .await;

        let config = ClientConfig {
            default_block_size: 512,
            ..test_config()
        };
        let client = CoAPClient::with_config(config);
        let response = client
            .put(&format!("coap://{}/upload", addr), vec![0xCD; 1024])
            .await
            .unwrap();
        assert_eq!(response.message.status(), Some(Status::Changed));
        client.close().await;
    }

    #[tokio::test]
    async fn test_get_block2_download() {
        let body: Vec<u8> = (0..1536u32).map(|i| (i % 251) as u8).collect();
        let body_for_server = body.clone();

        let addr = spawn_server(move |request| {
            let block = BlockValue::from_message(&request, CoapOption::Block2)
                .unwrap_or(BlockValue {
                    num: 0,
                    more: false,
                    size_exponent: 5,
                });
            let size = 512usize;
            let offset = block.num as usize * size;
            let end = (offset + size).min(body_for_server.len());

            let mut response = piggy_backed(
                &request,
                Status::Content,
                &body_for_server[offset..end],
            );
            BlockValue {
                num: block.num,
                more: end < body_for_server.len(),
                size_exponent: 5,
            }
            .set_on(&mut response, CoapOption::Block2);
            Some(response)
        })
        .await;

        let client = CoAPClient::with_config(test_config());
        let response = client
            .get(&format!("coap://{}/big", addr))
            .await
            .unwrap();
        assert_eq!(response.message.payload, body);
        client.close().await;
    }

    #[tokio::test]
    async fn test_ping_true_on_rst() {
        let addr = spawn_server(|request| {
            assert!(request.header.is_empty());
            Some(Message::rst_for(request.header.message_id))
        })
        .await;

        let client = CoAPClient::with_config(test_config());
        assert!(client.ping(&format!("coap://{}", addr)).await.unwrap());
        client.close().await;
    }

    #[tokio::test]
    async fn test_ping_false_on_silence() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let client = CoAPClient::with_config(test_config());
        assert!(!client.ping(&format!("coap://{}", addr)).await.unwrap());
        client.close().await;
    }

    #[tokio::test]
    async fn test_observe_drops_stale_notification() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registered = Arc::new(AtomicBool::new(false));
        let registered_server = registered.clone();
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, src)) = recv_socket.recv_from(&mut buf).await {
                let inbound = packet::decode(&buf[..n], Framing::Udp).unwrap();
                if inbound.get_observe() == Some(0) {
                    registered_server.store(true, Ordering::SeqCst);
                    peer_tx.send((src, inbound.get_token().to_vec())).unwrap();
                }
            }
        });

        let client = CoAPClient::with_config(test_config());
        let mut relation = client
            .observe(&format!("coap://{}/state", addr))
            .await
            .unwrap();

        // Wait for the registration to land, then notify 5, 6, 4.
        let (client_addr, token) = peer_rx.recv().await.unwrap();
        assert!(registered.load(Ordering::SeqCst));

        for seq in [5u32, 6, 4] {
            let mut notification = Message::new();
            notification.header.set_type(MessageType::NonConfirmable);
            notification.header.code = MessageClass::Response(Status::Content);
            notification.header.message_id = 0x4000 + seq as u16;
            notification.set_token(token.clone());
            notification.set_integer_option(CoapOption::Observe, seq);
            notification.payload = format!("v{}", seq).into_bytes();
            socket
                .send_to(
                    &packet::encode(&notification, Framing::Udp).unwrap(),
                    client_addr,
                )
                .await
                .unwrap();
        }

        let first = relation.next_notification().await.unwrap().unwrap();
        assert_eq!(first.message.get_observe(), Some(5));
        let second = relation.next_notification().await.unwrap().unwrap();
        assert_eq!(second.message.get_observe(), Some(6));

        // Sequence 4 must have been dropped by the freshness rule.
        assert!(tokio::time::timeout(
            Duration::from_millis(200),
            relation.next_notification()
        )
        .await
        .is_err());

        client.close().await;
    }

    #[tokio::test]
    async fn test_multicast_awaited_single_is_error() {
        let client = CoAPClient::with_config(test_config());
        let err = client
            .get(&format!("coap://{}/x", ALL_COAP_DEVICES_V4))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MulticastWithoutHandler));
        client.close().await;
    }

    #[tokio::test]
    async fn test_multicast_requires_group_address() {
        let client = CoAPClient::with_config(test_config());
        let err = client
            .multicast("coap://127.0.0.1/x", Method::Get, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MulticastWithoutHandler));
        client.close().await;
    }

    #[tokio::test]
    async fn test_discover_requests_well_known_core() {
        let addr = spawn_server(|request| {
            assert_eq!(request.get_path(), ".well-known/core");
            Some(piggy_backed(
                &request,
                Status::Content,
                b"</sensors>;ct=40",
            ))
        })
        .await;

        let client = CoAPClient::with_config(test_config());
        let response = client.discover(&format!("coap://{}", addr)).await.unwrap();
        assert_eq!(response.message.payload, b"</sensors>;ct=40".to_vec());
        client.close().await;
    }

    #[tokio::test]
    async fn test_overall_timeout_cancels() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();

        let client = CoAPClient::with_config(test_config());
        let err = client
            .get_with_timeout(
                &format!("coap://{}/slow", addr),
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        client.close().await;
    }

    #[tokio::test]
    async fn test_unknown_critical_option_rejected_before_send() {
        let client = CoAPClient::with_config(test_config());
        let err = client
            .request(
                "coap://127.0.0.1/x",
                Method::Get,
                None,
                vec![(CoapOption::Unknown(2049), b"v".to_vec())],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BadOption(2049)));
        client.close().await;
    }

    #[test]
    fn test_all_coap_devices_v6_segments() {
        assert_eq!(all_coap_devices_v6(0x2), "ff02::fd");
        assert_eq!(all_coap_devices_v6(0x5), "ff05::fd");
    }

    #[test]
    #[should_panic]
    fn test_all_coap_devices_v6_segment_bound() {
        all_coap_devices_v6(0x10);
    }
}
