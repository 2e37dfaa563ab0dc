//! The exchange registry and matcher.
//!
//! One [`Exchange`] records a single in-flight correlation, dual-keyed by
//! token (request/response matching) and by `(peer, mid)` (reliability).
//! The matcher routes every inbound message: deduplication first, then
//! token match for responses, mid match for ACK/RST, and the RST replies
//! the protocol demands for everything unmatched.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::dedup::{DedupStatus, Deduplicator};
use crate::error::{Error, Result};
use crate::message::header::{MessageClass, MessageType, ResponseType};
use crate::message::Message;
use crate::observe::ObserveState;

/// Where an exchange originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// A response surfaced to a waiter, timestamped before delivery.
#[derive(Debug, Clone)]
pub struct Response {
    pub message: Message,
    pub source: SocketAddr,
    pub timestamp: Instant,
    /// From request send to this response's arrival, across retransmits.
    pub rtt: Duration,
    pub retransmits: u32,
}

/// How the waiting side of an exchange is completed.
pub(crate) enum Waiter {
    /// Single-shot request; resolved once with a response or an error.
    Request(oneshot::Sender<Result<Response>>),
    /// Multicast fan-in; one response per source until the lifetime ends.
    Multicast(mpsc::Sender<Response>),
    /// Observe relation; stays open across notifications.
    Observe(mpsc::Sender<Result<Response>>),
}

pub(crate) struct Exchange {
    /// Registry key; equals the wire token except for pings, whose wire
    /// token is empty.
    pub key: Vec<u8>,
    pub mid: u16,
    pub destination: SocketAddr,
    /// The current outbound message of this exchange (block-wise transfers
    /// run one exchange per block).
    pub request: Message,
    pub origin: Origin,
    pub created: Instant,
    pub retransmits: u32,
    pub acknowledged: bool,
    pub rejected: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    waiter: Option<Waiter>,
    pub(crate) observe_state: Option<ObserveState>,
    /// Abort handle for the retransmission timer; always aborted before the
    /// waiter resolves.
    pub(crate) retransmit_handle: Option<JoinHandle<()>>,
    /// Multicast fan-in accumulator, keyed by source.
    responses_by_source: HashMap<SocketAddr, Message>,
}

impl Exchange {
    pub fn local(
        key: Vec<u8>,
        request: Message,
        destination: SocketAddr,
        waiter: Waiter,
    ) -> Exchange {
        Exchange {
            key,
            mid: request.header.message_id,
            destination,
            request,
            origin: Origin::Local,
            created: Instant::now(),
            retransmits: 0,
            acknowledged: false,
            rejected: false,
            timed_out: false,
            cancelled: false,
            waiter: Some(waiter),
            observe_state: None,
            retransmit_handle: None,
            responses_by_source: HashMap::new(),
        }
    }

    fn stop_retransmissions(&mut self) {
        if let Some(handle) = self.retransmit_handle.take() {
            handle.abort();
        }
    }

    fn is_multicast(&self) -> bool {
        matches!(self.waiter, Some(Waiter::Multicast(_)))
    }

    fn is_observe(&self) -> bool {
        self.observe_state.is_some()
    }
}

pub(crate) struct ExchangeStore {
    config: Arc<ClientConfig>,
    by_token: HashMap<Vec<u8>, Exchange>,
    by_mid: HashMap<(SocketAddr, u16), Vec<u8>>,
    next_token: u64,
    next_mid: u16,
}

impl ExchangeStore {
    pub fn new(config: Arc<ClientConfig>) -> ExchangeStore {
        let next_token = if config.use_random_token_start {
            rand::thread_rng().gen::<u64>()
        } else {
            0
        };
        let next_mid = if config.use_random_id_start {
            rand::thread_rng().gen::<u16>()
        } else {
            0
        };
        ExchangeStore {
            config,
            by_token: HashMap::new(),
            by_mid: HashMap::new(),
            next_token,
            next_mid,
        }
    }

    /// Next free token: monotonic with wrap-around, skipping any token
    /// still bound to a live exchange. Never empty.
    pub fn alloc_token(&mut self) -> Vec<u8> {
        loop {
            self.next_token = self.next_token.wrapping_add(1);
            let token = encode_token(self.next_token);
            if !self.by_token.contains_key(&token) {
                return token;
            }
        }
    }

    /// Next message id, monotonically incremented modulo 2^16.
    pub fn alloc_mid(&mut self) -> u16 {
        self.next_mid = self.next_mid.wrapping_add(1);
        self.next_mid
    }

    pub fn insert(&mut self, exchange: Exchange) {
        self.by_mid
            .insert((exchange.destination, exchange.mid), exchange.key.clone());
        self.by_token.insert(exchange.key.clone(), exchange);
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut Exchange> {
        self.by_token.get_mut(key)
    }

    pub fn len(&self) -> usize {
        self.by_token.len()
    }

    /// Removes an exchange and both its indices; retransmissions stop.
    pub fn remove(&mut self, key: &[u8]) -> Option<Exchange> {
        let mut exchange = self.by_token.remove(key)?;
        self.by_mid.remove(&(exchange.destination, exchange.mid));
        exchange.stop_retransmissions();
        Some(exchange)
    }

    /// Rebinds an existing exchange to a fresh message id, as observe
    /// reregistration does when it reissues the request.
    pub fn rebind_mid(&mut self, key: &[u8], mid: u16) {
        if let Some(exchange) = self.by_token.get_mut(key) {
            self.by_mid.remove(&(exchange.destination, exchange.mid));
            exchange.mid = mid;
            exchange.request.header.message_id = mid;
            self.by_mid.insert((exchange.destination, mid), key.to_vec());
        }
    }

    /// Explicit cancel: mark, unblock the waiter with a cancellation error,
    /// free the exchange. A completed exchange is a no-op.
    pub fn cancel(&mut self, key: &[u8]) {
        if let Some(mut exchange) = self.remove(key) {
            exchange.cancelled = true;
            match exchange.waiter.take() {
                Some(Waiter::Request(tx)) => {
                    let _ = tx.send(Err(Error::Cancelled));
                }
                Some(Waiter::Observe(tx)) => {
                    let _ = tx.try_send(Err(Error::Cancelled));
                }
                _ => {}
            }
        }
    }

    /// Times an exchange out from the reliability layer.
    pub fn time_out(&mut self, key: &[u8]) {
        if let Some(mut exchange) = self.remove(key) {
            exchange.timed_out = true;
            match exchange.waiter.take() {
                Some(Waiter::Request(tx)) => {
                    let _ = tx.send(Err(Error::Timeout));
                }
                Some(Waiter::Observe(tx)) => {
                    let _ = tx.try_send(Err(Error::Timeout));
                }
                _ => {}
            }
        }
    }

    /// Drops exchanges whose lifetime elapsed; multicast fan-in closes by
    /// dropping its sender.
    pub fn expire(&mut self) {
        let lifetime = self.config.exchange_lifetime;
        let expired: Vec<Vec<u8>> = self
            .by_token
            .iter()
            .filter(|(_, exchange)| {
                exchange.created.elapsed() >= lifetime && !exchange.is_observe()
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            debug!("exchange lifetime elapsed for token {:02x?}", key);
            self.time_out(&key);
        }
    }

    /// Fails every outstanding exchange; used when the endpoint closes.
    pub fn fail_all(&mut self, transport_gone: bool) {
        let keys: Vec<Vec<u8>> = self.by_token.keys().cloned().collect();
        for key in keys {
            if transport_gone {
                self.cancel(&key);
            } else {
                self.time_out(&key);
            }
        }
    }

    /// Routes one inbound message (already deduplicated decoding happens in
    /// the endpoint driver). Returns the reply to put on the wire, if any.
    pub fn route_inbound(
        &mut self,
        dedup: &mut Deduplicator,
        message: Message,
        source: SocketAddr,
    ) -> Option<Message> {
        let mtype = message.header.get_type();
        let mid = message.header.message_id;

        // 1. Malformed: RST a confirmable, drop anything else.
        if message.has_format_error {
            debug!("dropping malformed message {} from {}", mid, source);
            return match mtype {
                MessageType::Confirmable => Some(Message::rst_for(mid)),
                _ => None,
            };
        }

        // 2. Deduplicate confirmables and non-confirmables.
        if matches!(mtype, MessageType::Confirmable | MessageType::NonConfirmable) {
            if let DedupStatus::Duplicate(reply) = dedup.witness(source, mid) {
                return reply;
            }
        }

        match message.header.code {
            // 5. Empty CON is a ping; answer RST with the same mid.
            MessageClass::Empty if mtype == MessageType::Confirmable => {
                let rst = Message::rst_for(mid);
                dedup.record_reply(source, mid, rst.clone());
                Some(rst)
            }

            // 4. Empty ACK: the separate response is still coming.
            MessageClass::Empty if mtype == MessageType::Acknowledgement => {
                if let Some(key) = self.by_mid.get(&(source, mid)).cloned() {
                    if let Some(exchange) = self.by_token.get_mut(&key) {
                        exchange.acknowledged = true;
                        exchange.stop_retransmissions();
                    }
                } else {
                    debug!("unmatched empty ack {} from {}", mid, source);
                }
                None
            }

            // 4. RST completes the exchange as rejected.
            _ if mtype == MessageType::Reset => {
                if let Some(key) = self.by_mid.get(&(source, mid)).cloned() {
                    if let Some(mut exchange) = self.remove(&key) {
                        exchange.rejected = true;
                        match exchange.waiter.take() {
                            Some(Waiter::Request(tx)) => {
                                let _ = tx.send(Err(Error::Reset));
                            }
                            Some(Waiter::Observe(tx)) => {
                                let _ = tx.try_send(Err(Error::Reset));
                            }
                            _ => {}
                        }
                    }
                } else {
                    debug!("unmatched rst {} from {}", mid, source);
                }
                None
            }

            // 3. Responses match by token.
            MessageClass::Response(_) => self.route_response(dedup, message, source),

            // A request reaching a pure client: 4.02 when we cannot even
            // understand its critical options, RST otherwise.
            MessageClass::Request(_) => {
                if message.has_unknown_critical_option() {
                    let mut reply = Message::ack_for(mid);
                    reply.header.code = MessageClass::Response(ResponseType::BadOption);
                    reply.set_token(message.get_token().to_vec());
                    if mtype != MessageType::Confirmable {
                        reply.header.set_type(MessageType::NonConfirmable);
                    }
                    dedup.record_reply(source, mid, reply.clone());
                    Some(reply)
                } else {
                    warn!("request {} from {} on a client-only endpoint", mid, source);
                    match mtype {
                        MessageType::Confirmable => Some(Message::rst_for(mid)),
                        _ => None,
                    }
                }
            }

            _ => None,
        }
    }

    fn route_response(
        &mut self,
        dedup: &mut Deduplicator,
        message: Message,
        source: SocketAddr,
    ) -> Option<Message> {
        let mtype = message.header.get_type();
        let mid = message.header.message_id;

        // A response with a critical option we cannot interpret is ignored
        // rather than surfaced wrong.
        if message.has_unknown_critical_option() {
            debug!("ignoring response with unknown critical option from {}", source);
            return None;
        }

        // Piggy-backed responses complete the reliability side first.
        if mtype == MessageType::Acknowledgement {
            if let Some(key) = self.by_mid.get(&(source, mid)).cloned() {
                if let Some(exchange) = self.by_token.get_mut(&key) {
                    exchange.acknowledged = true;
                    exchange.stop_retransmissions();
                }
            }
        }

        let token = message.get_token().to_vec();
        if !self.by_token.contains_key(&token) {
            // Step 3: nothing waits for this token; reject it.
            debug!("unmatched response token {:02x?} from {}", token, source);
            return Some(Message::rst_for(mid));
        }

        // A separate confirmable response gets an empty ACK, which the
        // deduplicator replays for retransmitted copies.
        let reply = if mtype == MessageType::Confirmable {
            let ack = Message::ack_for(mid);
            dedup.record_reply(source, mid, ack.clone());
            Some(ack)
        } else {
            None
        };

        let (rtt, retransmits, observe, multicast) = {
            let exchange = self.by_token.get(&token).unwrap();
            (
                exchange.created.elapsed(),
                exchange.retransmits,
                exchange.is_observe(),
                exchange.is_multicast(),
            )
        };
        let response = Response {
            timestamp: Instant::now(),
            rtt,
            retransmits,
            message,
            source,
        };

        if observe {
            self.deliver_notification(&token, response);
        } else if multicast {
            self.deliver_multicast(&token, response);
        } else {
            // Single-shot: timers stop before the waiter resolves.
            let mut exchange = self.remove(&token).unwrap();
            if let Some(Waiter::Request(tx)) = exchange.waiter.take() {
                let _ = tx.send(Ok(response));
            }
        }

        reply
    }

    fn deliver_notification(&mut self, token: &[u8], response: Response) {
        let exchange = match self.by_token.get_mut(token) {
            Some(exchange) => exchange,
            None => return,
        };

        let status = response.message.status();
        let sequence = response.message.get_observe();

        // Anything but a notification-bearing 2.05 ends the relation.
        let terminal = status != Some(ResponseType::Content) || sequence.is_none();

        if !terminal {
            let state = exchange.observe_state.as_mut().unwrap();
            if !state.accept(sequence.unwrap()) {
                debug!("stale notification dropped for token {:02x?}", token);
                return;
            }
        }

        let delivered = match &exchange.waiter {
            Some(Waiter::Observe(tx)) => tx.try_send(Ok(response)).is_ok(),
            _ => false,
        };

        if terminal || !delivered {
            // Reactive cancel (receiver gone) or relation end: reclaim the
            // exchange; the matcher will RST the server's next notification.
            self.remove(token);
        }
    }

    fn deliver_multicast(&mut self, token: &[u8], response: Response) {
        let exchange = match self.by_token.get_mut(token) {
            Some(exchange) => exchange,
            None => return,
        };

        // One response per source; retransmissions with fresh mids from the
        // same responder do not fan in twice.
        if exchange.responses_by_source.contains_key(&response.source) {
            return;
        }
        exchange
            .responses_by_source
            .insert(response.source, response.message.clone());

        let tx = match &exchange.waiter {
            Some(Waiter::Multicast(tx)) => tx.clone(),
            _ => return,
        };
        if tx.try_send(response).is_err() {
            self.remove(token);
        }
    }
}

/// Minimal big-endian token bytes; the zero value still gets one byte so a
/// bound request never carries the ping token.
fn encode_token(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
    bytes[skip..].to_vec()
}
