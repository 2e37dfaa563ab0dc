//! An asynchronous client-side implementation of the [CoAP Protocol][spec].
//!
//! This library is the protocol engine only: wire codec, reliability,
//! request/response matching and observation. Servers, proxying and
//! resource dispatch are out of scope.
//!
//! Features:
//! - CoAP core protocol [RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt)
//!   over UDP, TCP ([RFC 8323](https://tools.ietf.org/html/rfc8323)) and
//!   WebSocket
//! - Observe option [RFC 7641](https://tools.ietf.org/rfc/rfc7641.txt)
//! - Block-wise transfers [RFC 7959](https://tools.ietf.org/html/rfc7959)
//! - Extended token lengths [RFC 8974](https://tools.ietf.org/html/rfc8974)
//!
//! # Example
//!
//! ```no_run
//! use coap_client::CoAPClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let url = "coap://127.0.0.1:5683/hello";
//!     println!("Client request: {}", url);
//!
//!     let client = CoAPClient::new();
//!     let response = client.get(url).await.unwrap();
//!     println!(
//!         "Server reply: {}",
//!         String::from_utf8(response.message.payload).unwrap()
//!     );
//!     client.close().await;
//! }
//! ```
//!
//! # Observation
//!
//! ```no_run
//! use coap_client::CoAPClient;
//!
//! #[tokio::main]
//! async fn main() {
//!     let client = CoAPClient::new();
//!     let mut relation = client
//!         .observe("coap://127.0.0.1:5683/sensors/temp")
//!         .await
//!         .unwrap();
//!
//!     while let Some(notification) = relation.next_notification().await {
//!         let response = notification.unwrap();
//!         println!("notified: {:?}", response.message.payload);
//!     }
//! }
//! ```
//!
//! [spec]: https://tools.ietf.org/html/rfc7252

pub mod block;
pub mod client;
pub mod config;
pub mod dedup;
pub(crate) mod endpoint;
pub mod error;
pub mod exchange;
pub mod message;
pub mod observe;
pub mod reliability;
pub mod transport;

pub use self::block::BlockValue;
pub use self::client::{all_coap_devices_v6, CoAPClient, MulticastResponses, ALL_COAP_DEVICES_V4};
pub use self::config::ClientConfig;
pub use self::error::{Error, FormatError, Result};
pub use self::exchange::Response;
pub use self::message::header::{MessageClass, MessageType, RequestType as Method, ResponseType as Status};
pub use self::message::option::{CoapOption, ContentFormat, ObserveOption};
pub use self::message::packet::Framing;
pub use self::message::uri::{CoapUri, Scheme};
pub use self::message::{Message, RequestBuilder};
pub use self::observe::ObserveRelation;
pub use self::transport::{ClientTransport, Credentials};
