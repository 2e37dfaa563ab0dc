//! The CoAP message model.
//!
//! One [`Message`] record is shared by requests, responses and empty
//! messages; the role is discriminated by [`MessageClass`] rather than by
//! wrapper types, so the codec, the matcher and the observe layer all work
//! on the same record.

pub mod header;
pub mod option;
pub mod packet;
pub mod uri;

use std::collections::{BTreeMap, LinkedList};

use crate::error::{Error, FormatError};
use self::header::{Header, MessageClass, MessageType, RequestType, ResponseType};
use self::option::{CoapOption, ContentFormat, ObserveOption};

/// A CoAP message: fixed header, token, sorted option multiset and payload.
///
/// Options are keyed by number; within one number, insertion order is
/// preserved. Serialization therefore always emits the canonical
/// non-negative delta sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    token: Vec<u8>,
    options: BTreeMap<u16, LinkedList<Vec<u8>>>,
    pub payload: Vec<u8>,
    /// Set by the decoder when the fixed header was readable but the rest of
    /// the message is malformed. Never set on outbound messages.
    pub has_format_error: bool,
}

impl Default for Message {
    fn default() -> Message {
        Message::new()
    }
}

impl Message {
    pub fn new() -> Message {
        Message {
            header: Header::new(),
            token: Vec::new(),
            options: BTreeMap::new(),
            payload: Vec::new(),
            has_format_error: false,
        }
    }

    /// A confirmable request with the given method.
    pub fn request(method: RequestType) -> Message {
        let mut message = Message::new();
        message.header.code = MessageClass::Request(method);
        message.header.set_type(MessageType::Confirmable);
        message
    }

    /// The empty acknowledgement for a received confirmable message.
    pub fn ack_for(message_id: u16) -> Message {
        let mut ack = Message::new();
        ack.header.set_type(MessageType::Acknowledgement);
        ack.header.message_id = message_id;
        ack
    }

    /// A reset for a received message.
    pub fn rst_for(message_id: u16) -> Message {
        let mut rst = Message::new();
        rst.header.set_type(MessageType::Reset);
        rst.header.message_id = message_id;
        rst
    }

    /// The CoAP ping: an empty confirmable message.
    pub fn ping() -> Message {
        let mut ping = Message::new();
        ping.header.set_type(MessageType::Confirmable);
        ping
    }

    pub fn set_token(&mut self, token: Vec<u8>) {
        self.header.set_token_nibble(packet::token_nibble(token.len()));
        self.token = token;
    }

    pub fn get_token(&self) -> &[u8] {
        &self.token
    }

    pub fn add_option(&mut self, tp: CoapOption, value: Vec<u8>) {
        self.options
            .entry(tp.number())
            .or_insert_with(LinkedList::new)
            .push_back(value);
    }

    /// Used by the decoder, which sees raw numbers before typing them.
    pub(crate) fn add_option_raw(&mut self, number: u16, value: Vec<u8>) {
        self.options
            .entry(number)
            .or_insert_with(LinkedList::new)
            .push_back(value);
    }

    pub fn set_option(&mut self, tp: CoapOption, value: LinkedList<Vec<u8>>) {
        self.options.insert(tp.number(), value);
    }

    pub fn get_option(&self, tp: CoapOption) -> Option<&LinkedList<Vec<u8>>> {
        self.options.get(&tp.number())
    }

    pub fn get_first_option(&self, tp: CoapOption) -> Option<&Vec<u8>> {
        self.options.get(&tp.number()).and_then(|list| list.front())
    }

    pub fn clear_option(&mut self, tp: CoapOption) {
        self.options.remove(&tp.number());
    }

    pub fn has_option(&self, tp: CoapOption) -> bool {
        self.options.contains_key(&tp.number())
    }

    /// Replaces any previous value with a minimally encoded integer.
    pub fn set_integer_option(&mut self, tp: CoapOption, value: u32) {
        self.clear_option(tp);
        self.add_option(tp, option::encode_integer(value));
    }

    pub fn get_integer_option(&self, tp: CoapOption) -> Option<u32> {
        self.get_first_option(tp)
            .and_then(|bytes| option::decode_integer(bytes, tp).ok())
    }

    pub fn set_content_format(&mut self, cf: ContentFormat) {
        self.set_integer_option(CoapOption::ContentFormat, cf as u32);
    }

    pub fn get_content_format(&self) -> Option<ContentFormat> {
        self.get_integer_option(CoapOption::ContentFormat)
            .and_then(|n| u16::try_from(n).ok())
            .and_then(ContentFormat::from_u16_value)
    }

    pub fn set_observe_flag(&mut self, flag: ObserveOption) {
        self.set_integer_option(CoapOption::Observe, flag as u32);
    }

    /// The observe sequence number, when the option is present.
    pub fn get_observe(&self) -> Option<u32> {
        self.get_integer_option(CoapOption::Observe)
    }

    /// Iterates `(number, values)` pairs in canonical order.
    pub fn options(&self) -> impl Iterator<Item = (&u16, &LinkedList<Vec<u8>>)> {
        self.options.iter()
    }

    pub fn option_count(&self) -> usize {
        self.options.values().map(|list| list.len()).sum()
    }

    /// Whether the message carries a critical option this engine does not
    /// recognize. On a received request this demands a 4.02 reply; on a
    /// received response the message is ignored.
    pub fn has_unknown_critical_option(&self) -> bool {
        self.options.keys().any(|number| {
            let option = CoapOption::from(*number);
            option.is_critical() && !option.is_recognized()
        })
    }

    /// The URI path reassembled from Uri-Path options.
    pub fn get_path(&self) -> String {
        match self.get_option(CoapOption::UriPath) {
            Some(segments) => segments
                .iter()
                .filter_map(|seg| std::str::from_utf8(seg).ok())
                .collect::<Vec<_>>()
                .join("/"),
            None => String::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.header.code.is_request()
    }

    pub fn is_response(&self) -> bool {
        self.header.code.is_response()
    }

    pub fn status(&self) -> Option<ResponseType> {
        match self.header.code {
            MessageClass::Response(status) => Some(status),
            _ => None,
        }
    }
}

/// Assembles request messages before they are bound to an endpoint.
///
/// A built message carries no message id, token or destination yet; binding
/// is the endpoint's job, and the reliability layer only accepts bound
/// requests.
pub struct RequestBuilder {
    method: RequestType,
    path: String,
    queries: Vec<String>,
    domain: Option<String>,
    port: Option<u16>,
    confirmable: bool,
    payload: Option<Vec<u8>>,
    content_format: Option<ContentFormat>,
    accept: Option<ContentFormat>,
    observe: Option<ObserveOption>,
    options: Vec<(CoapOption, Vec<u8>)>,
}

impl RequestBuilder {
    pub fn new(path: &str, method: RequestType) -> RequestBuilder {
        RequestBuilder {
            method,
            path: path.to_string(),
            queries: Vec::new(),
            domain: None,
            port: None,
            confirmable: true,
            payload: None,
            content_format: None,
            accept: None,
            observe: None,
            options: Vec::new(),
        }
    }

    /// Emit a Uri-Host option for this domain.
    pub fn domain(mut self, domain: String) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Emit a Uri-Port option; only needed when it differs from the scheme
    /// default.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn query(mut self, query: String) -> Self {
        self.queries.push(query);
        self
    }

    pub fn queries(mut self, queries: Vec<String>) -> Self {
        self.queries.extend(queries);
        self
    }

    pub fn confirmable(mut self, confirmable: bool) -> Self {
        self.confirmable = confirmable;
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn content_format(mut self, cf: ContentFormat) -> Self {
        self.content_format = Some(cf);
        self
    }

    pub fn accept(mut self, cf: ContentFormat) -> Self {
        self.accept = Some(cf);
        self
    }

    pub fn observe(mut self, flag: ObserveOption) -> Self {
        self.observe = Some(flag);
        self
    }

    pub fn option(mut self, tp: CoapOption, value: Vec<u8>) -> Self {
        self.options.push((tp, value));
        self
    }

    pub fn options(mut self, options: Vec<(CoapOption, Vec<u8>)>) -> Self {
        self.options.extend(options);
        self
    }

    pub fn build(self) -> Result<Message, Error> {
        // A caller-supplied critical option we cannot name is a programming
        // error, not something to put on the wire.
        for (tp, _) in &self.options {
            if tp.is_critical() && !tp.is_recognized() {
                return Err(Error::BadOption(tp.number()));
            }
        }

        let mut message = Message::request(self.method);
        if !self.confirmable {
            message.header.set_type(MessageType::NonConfirmable);
        }

        if let Some(domain) = self.domain {
            message.add_option(CoapOption::UriHost, domain.into_bytes());
        }
        if let Some(port) = self.port {
            message.set_integer_option(CoapOption::UriPort, u32::from(port));
        }
        for segment in uri::path_segments(&self.path)? {
            message.add_option(CoapOption::UriPath, segment.into_bytes());
        }
        if let Some(cf) = self.content_format {
            message.set_content_format(cf);
        }
        for query in self.queries {
            message.add_option(CoapOption::UriQuery, query.into_bytes());
        }
        if let Some(cf) = self.accept {
            message.set_integer_option(CoapOption::Accept, cf as u32);
        }
        if let Some(flag) = self.observe {
            message.set_observe_flag(flag);
        }
        for (tp, value) in self.options {
            let (_, max) = tp.length_bounds();
            if value.len() > max {
                return Err(Error::Format(FormatError::OptionValueTooLong {
                    actual: value.len(),
                    max,
                }));
            }
            message.add_option(tp, value);
        }
        if let Some(payload) = self.payload {
            message.payload = payload;
        }

        Ok(message)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_token_sets_nibble() {
        let mut message = Message::new();
        message.set_token(vec![0x51, 0x55, 0x77, 0xE8]);
        assert_eq!(message.header.token_nibble(), 4);
        assert_eq!(message.get_token(), &[0x51, 0x55, 0x77, 0xE8]);
    }

    #[test]
    fn test_option_insertion_order_within_number() {
        let mut message = Message::new();
        message.add_option(CoapOption::UriPath, b"a".to_vec());
        message.add_option(CoapOption::UriPath, b"b".to_vec());

        let segments: Vec<_> = message
            .get_option(CoapOption::UriPath)
            .unwrap()
            .iter()
            .cloned()
            .collect();
        assert_eq!(segments, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_options_sorted_by_number() {
        let mut message = Message::new();
        message.add_option(CoapOption::UriQuery, b"a=1".to_vec());
        message.add_option(CoapOption::UriHost, b"example.com".to_vec());
        message.add_option(CoapOption::UriPath, b"x".to_vec());

        let numbers: Vec<u16> = message.options().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![3, 11, 15]);
    }

    #[test]
    fn test_unknown_critical_option_detection() {
        let mut message = Message::new();
        message.add_option_raw(9, b"?".to_vec());
        assert!(message.has_unknown_critical_option());

        let mut message = Message::new();
        message.add_option_raw(10, b"?".to_vec());
        assert!(!message.has_unknown_critical_option());

        let mut message = Message::new();
        message.add_option(CoapOption::UriPath, b"known".to_vec());
        assert!(!message.has_unknown_critical_option());
    }

    #[test]
    fn test_observe_option_roundtrip() {
        let mut message = Message::new();
        message.set_observe_flag(ObserveOption::Register);
        assert_eq!(message.get_observe(), Some(0));

        message.set_integer_option(CoapOption::Observe, 1234);
        assert_eq!(message.get_observe(), Some(1234));
    }

    #[test]
    fn test_content_format_roundtrip() {
        let mut message = Message::new();
        message.set_content_format(ContentFormat::ApplicationJSON);
        assert_eq!(
            message.get_content_format(),
            Some(ContentFormat::ApplicationJSON)
        );
    }

    #[test]
    fn test_builder_assembles_request() {
        let message = RequestBuilder::new("/sensors/temp", RequestType::Get)
            .domain("example.com".to_string())
            .query("unit=c".to_string())
            .build()
            .unwrap();

        assert_eq!(
            message.header.code,
            MessageClass::Request(RequestType::Get)
        );
        assert!(message.header.is_confirmable());
        assert_eq!(message.get_path(), "sensors/temp");
        assert_eq!(
            message.get_first_option(CoapOption::UriHost).unwrap(),
            &b"example.com".to_vec()
        );
        assert_eq!(
            message.get_first_option(CoapOption::UriQuery).unwrap(),
            &b"unit=c".to_vec()
        );
    }

    #[test]
    fn test_builder_rejects_unknown_critical_option() {
        let err = RequestBuilder::new("/x", RequestType::Get)
            .option(CoapOption::Unknown(2049), b"v".to_vec())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::BadOption(2049)));
    }

    #[test]
    fn test_builder_non_confirmable() {
        let message = RequestBuilder::new("/x", RequestType::Get)
            .confirmable(false)
            .build()
            .unwrap();
        assert_eq!(message.header.get_type(), MessageType::NonConfirmable);
    }

    #[test]
    fn test_ack_and_rst_helpers() {
        let ack = Message::ack_for(0x1234);
        assert_eq!(ack.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(ack.header.message_id, 0x1234);
        assert!(ack.header.is_empty());

        let rst = Message::rst_for(77);
        assert_eq!(rst.header.get_type(), MessageType::Reset);
        assert_eq!(rst.header.message_id, 77);
    }
}
