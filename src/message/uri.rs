//! URI handling: the scheme table and the RFC 7252 §6.4/§6.5 mappings
//! between request URIs and the Uri-* options.

use std::net::IpAddr;

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use url::Url;

use super::option::CoapOption;
use super::packet::Framing;
use super::Message;
use crate::error::FormatError;

/// Characters escaped when recomposing a path segment or query parameter.
/// `%2F` inside a segment must not read as a separator.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'#')
    .add(b'&');

/// The six CoAP URI schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Coap,
    Coaps,
    CoapTcp,
    CoapsTcp,
    CoapWs,
    CoapsWs,
}

impl Scheme {
    pub fn parse(scheme: &str) -> Option<Scheme> {
        match scheme {
            "coap" => Some(Scheme::Coap),
            "coaps" => Some(Scheme::Coaps),
            "coap+tcp" => Some(Scheme::CoapTcp),
            "coaps+tcp" => Some(Scheme::CoapsTcp),
            "coap+ws" => Some(Scheme::CoapWs),
            "coaps+ws" => Some(Scheme::CoapsWs),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Coap => "coap",
            Scheme::Coaps => "coaps",
            Scheme::CoapTcp => "coap+tcp",
            Scheme::CoapsTcp => "coaps+tcp",
            Scheme::CoapWs => "coap+ws",
            Scheme::CoapsWs => "coaps+ws",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Coap => 5683,
            Scheme::Coaps => 5684,
            Scheme::CoapTcp => 5683,
            Scheme::CoapsTcp => 5684,
            Scheme::CoapWs => 80,
            Scheme::CoapsWs => 443,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Coaps | Scheme::CoapsTcp | Scheme::CoapsWs)
    }

    pub fn framing(&self) -> Framing {
        match self {
            Scheme::Coap | Scheme::Coaps => Framing::Udp,
            Scheme::CoapTcp | Scheme::CoapsTcp => Framing::Tcp,
            Scheme::CoapWs | Scheme::CoapsWs => Framing::WebSocket,
        }
    }

    /// Whether the underlying transport retransmits for us; the reliability
    /// layer only runs over UDP.
    pub fn is_reliable_transport(&self) -> bool {
        self.framing() != Framing::Udp
    }
}

/// A request URI decomposed for endpoint lookup and option mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapUri {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub queries: Vec<String>,
}

impl CoapUri {
    /// Parses an absolute, fragmentless CoAP URI.
    pub fn parse(uri: &str) -> Result<CoapUri, FormatError> {
        let url =
            Url::parse(uri).map_err(|cause| FormatError::InvalidUri(cause.to_string()))?;

        let scheme = Scheme::parse(url.scheme())
            .ok_or_else(|| FormatError::InvalidUri(format!("scheme {}", url.scheme())))?;

        if url.fragment().is_some() {
            return Err(FormatError::InvalidUri("fragment not allowed".to_string()));
        }

        let host = match url.host_str() {
            Some("") | None => return Err(FormatError::InvalidUri("missing host".to_string())),
            Some(h) => h,
        };
        // IPv6 literals come back bracketed from the url crate.
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host)
            .to_string();

        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let queries = match url.query() {
            Some(query) if !query.is_empty() => query
                .split('&')
                .map(|param| {
                    percent_decode_str(param)
                        .decode_utf8()
                        .map(|s| s.to_string())
                        .map_err(|_| FormatError::InvalidUri("query not utf-8".to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            _ => Vec::new(),
        };

        Ok(CoapUri {
            scheme,
            host,
            port,
            path: url.path().to_string(),
            queries,
        })
    }

    /// Whether the host is a multicast group literal.
    pub fn is_multicast(&self) -> bool {
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_multicast())
            .unwrap_or(false)
    }

    /// The Uri-* options for this URI (RFC 7252 §6.4).
    ///
    /// Uri-Host is emitted when the host is not the literal destination
    /// address, or when forced; Uri-Port only when it differs from the
    /// scheme default.
    pub fn to_options(
        &self,
        force_host: bool,
    ) -> Result<Vec<(CoapOption, Vec<u8>)>, FormatError> {
        let mut options = Vec::new();

        let host_is_literal = self.host.parse::<IpAddr>().is_ok();
        if force_host || !host_is_literal {
            options.push((CoapOption::UriHost, self.host.clone().into_bytes()));
        }
        if self.port != self.scheme.default_port() {
            options.push((
                CoapOption::UriPort,
                super::option::encode_integer(u32::from(self.port)),
            ));
        }
        for segment in path_segments(&self.path)? {
            options.push((CoapOption::UriPath, segment.into_bytes()));
        }
        for query in &self.queries {
            options.push((CoapOption::UriQuery, query.clone().into_bytes()));
        }

        Ok(options)
    }
}

/// Splits a path on `/` and percent-decodes each non-empty segment.
pub fn path_segments(path: &str) -> Result<Vec<String>, FormatError> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            percent_decode_str(segment)
                .decode_utf8()
                .map(|s| s.to_string())
                .map_err(|_| FormatError::InvalidUri("path segment not utf-8".to_string()))
        })
        .collect()
}

/// Recomposes the request URI of a message (RFC 7252 §6.5). Defaults come
/// from the endpoint; Uri-Host/Uri-Port options override them. An empty
/// path becomes `/`; `/` inside a segment is escaped as `%2F`.
pub fn options_to_uri(
    message: &Message,
    scheme: Scheme,
    endpoint_host: &str,
    endpoint_port: u16,
) -> String {
    let host = message
        .get_first_option(CoapOption::UriHost)
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| endpoint_host.to_string());
    let port = message
        .get_integer_option(CoapOption::UriPort)
        .and_then(|n| u16::try_from(n).ok())
        .unwrap_or(endpoint_port);

    let host = if host.contains(':') {
        format!("[{}]", host)
    } else {
        host
    };

    let mut uri = String::new();
    uri.push_str(scheme.as_str());
    uri.push_str("://");
    uri.push_str(&host);
    if port != scheme.default_port() {
        uri.push_str(&format!(":{}", port));
    }

    match message.get_option(CoapOption::UriPath) {
        Some(segments) if !segments.is_empty() => {
            for segment in segments {
                uri.push('/');
                let segment = String::from_utf8_lossy(segment);
                uri.push_str(&utf8_percent_encode(&segment, SEGMENT).to_string());
            }
        }
        _ => uri.push('/'),
    }

    if let Some(queries) = message.get_option(CoapOption::UriQuery) {
        let mut first = true;
        for query in queries {
            uri.push(if first { '?' } else { '&' });
            first = false;
            let query = String::from_utf8_lossy(query);
            // Escape '&' inside the parameter so it survives recomposition;
            // '=' separates key and value and stays literal.
            let mut encoded = String::new();
            for (i, part) in query.splitn(2, '=').enumerate() {
                if i > 0 {
                    encoded.push('=');
                }
                encoded.push_str(&utf8_percent_encode(part, SEGMENT).to_string());
            }
            uri.push_str(&encoded);
        }
    }

    uri
}

#[cfg(test)]
mod test {
    use super::super::header::RequestType;
    use super::*;

    #[test]
    fn test_scheme_table() {
        assert_eq!(Scheme::parse("coap"), Some(Scheme::Coap));
        assert_eq!(Scheme::Coap.default_port(), 5683);
        assert_eq!(Scheme::Coaps.default_port(), 5684);
        assert_eq!(Scheme::CoapTcp.default_port(), 5683);
        assert_eq!(Scheme::CoapsTcp.default_port(), 5684);
        assert_eq!(Scheme::CoapWs.default_port(), 80);
        assert_eq!(Scheme::CoapsWs.default_port(), 443);
        assert_eq!(Scheme::parse("http"), None);

        assert!(Scheme::Coaps.is_secure());
        assert!(!Scheme::CoapWs.is_secure());
        assert_eq!(Scheme::Coap.framing(), Framing::Udp);
        assert_eq!(Scheme::CoapsTcp.framing(), Framing::Tcp);
        assert_eq!(Scheme::CoapsWs.framing(), Framing::WebSocket);
    }

    #[test]
    fn test_parse_good_uris() {
        assert!(CoapUri::parse("coap://127.0.0.1").is_ok());
        assert!(CoapUri::parse("coap://127.0.0.1:5683").is_ok());
        assert!(CoapUri::parse("coap://[::1]").is_ok());
        assert!(CoapUri::parse("coap://[::1]:5683").is_ok());
        assert!(CoapUri::parse("coap://[bbbb::9329:f033:f558:7418]").is_ok());
        assert!(CoapUri::parse("coaps+tcp://example.com/sensors").is_ok());
        assert!(CoapUri::parse("coap://127.0.0.1/?hello=world").is_ok());
    }

    #[test]
    fn test_parse_bad_uris() {
        assert!(CoapUri::parse("coap://127.0.0.1:65536").is_err());
        assert!(CoapUri::parse("coap://").is_err());
        assert!(CoapUri::parse("127.0.0.1").is_err());
        assert!(CoapUri::parse("http://example.com/x").is_err());
        assert!(CoapUri::parse("coap://example.com/x#frag").is_err());
    }

    #[test]
    fn test_ipv6_brackets_stripped() {
        let uri = CoapUri::parse("coap://[::1]:5684/x").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.port, 5684);
    }

    #[test]
    fn test_default_port_from_scheme() {
        assert_eq!(CoapUri::parse("coap://h/").unwrap().port, 5683);
        assert_eq!(CoapUri::parse("coaps://h/").unwrap().port, 5684);
        assert_eq!(CoapUri::parse("coap+ws://h/").unwrap().port, 80);
    }

    #[test]
    fn test_uri_host_only_for_names() {
        let uri = CoapUri::parse("coap://127.0.0.1/a").unwrap();
        let options = uri.to_options(false).unwrap();
        assert!(!options.iter().any(|(tp, _)| *tp == CoapOption::UriHost));

        let options = uri.to_options(true).unwrap();
        assert!(options.iter().any(|(tp, _)| *tp == CoapOption::UriHost));

        let uri = CoapUri::parse("coap://example.com/a").unwrap();
        let options = uri.to_options(false).unwrap();
        assert!(options
            .iter()
            .any(|(tp, v)| *tp == CoapOption::UriHost && v == b"example.com"));
    }

    #[test]
    fn test_uri_port_only_when_non_default() {
        let uri = CoapUri::parse("coap://example.com/a").unwrap();
        let options = uri.to_options(false).unwrap();
        assert!(!options.iter().any(|(tp, _)| *tp == CoapOption::UriPort));

        let uri = CoapUri::parse("coap://example.com:9999/a").unwrap();
        let options = uri.to_options(false).unwrap();
        assert!(options
            .iter()
            .any(|(tp, v)| *tp == CoapOption::UriPort && v == &vec![0x27, 0x0F]));
    }

    #[test]
    fn test_path_segments_percent_decoded() {
        assert_eq!(
            path_segments("/a/b%20c/d").unwrap(),
            vec!["a".to_string(), "b c".to_string(), "d".to_string()]
        );
        assert_eq!(path_segments("/").unwrap(), Vec::<String>::new());
        assert_eq!(path_segments("").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_query_params_decoded() {
        let uri = CoapUri::parse("coap://h/x?a=1&b=two%26three&flag").unwrap();
        assert_eq!(
            uri.queries,
            vec![
                "a=1".to_string(),
                "b=two&three".to_string(),
                "flag".to_string()
            ]
        );
    }

    #[test]
    fn test_options_to_uri_roundtrip() {
        let uri = CoapUri::parse("coap://example.com:9999/sensors/temp?unit=c").unwrap();

        let mut message = Message::request(RequestType::Get);
        for (tp, value) in uri.to_options(false).unwrap() {
            message.add_option(tp, value);
        }

        let recomposed = options_to_uri(&message, Scheme::Coap, "example.com", 9999);
        assert_eq!(recomposed, "coap://example.com:9999/sensors/temp?unit=c");
    }

    #[test]
    fn test_options_to_uri_empty_path() {
        let message = Message::request(RequestType::Get);
        assert_eq!(
            options_to_uri(&message, Scheme::Coap, "h", 5683),
            "coap://h/"
        );
    }

    #[test]
    fn test_options_to_uri_escapes_slash_in_segment() {
        let mut message = Message::request(RequestType::Get);
        message.add_option(CoapOption::UriPath, b"a/b".to_vec());
        assert_eq!(
            options_to_uri(&message, Scheme::Coap, "h", 5683),
            "coap://h/a%2Fb"
        );
    }

    #[test]
    fn test_lossless_roundtrip_over_schemes() {
        for raw in [
            "coap://example.com/a/b?x=1",
            "coaps://example.com/a",
            "coap+tcp://example.com:7777/a/b/c",
            "coaps+tcp://example.com/deep%20path",
            "coap+ws://example.com/",
            "coaps+ws://example.com/q?k=v&k2",
        ] {
            let uri = CoapUri::parse(raw).unwrap();
            let mut message = Message::request(RequestType::Get);
            for (tp, value) in uri.to_options(false).unwrap() {
                message.add_option(tp, value);
            }
            let recomposed =
                options_to_uri(&message, uri.scheme, &uri.host, uri.port);
            let reparsed = CoapUri::parse(&recomposed).unwrap();
            assert_eq!(reparsed.scheme, uri.scheme);
            assert_eq!(reparsed.host, uri.host);
            assert_eq!(reparsed.port, uri.port);
            assert_eq!(
                path_segments(&reparsed.path).unwrap(),
                path_segments(&uri.path).unwrap()
            );
            assert_eq!(reparsed.queries, uri.queries);
        }
    }

    #[test]
    fn test_multicast_detection() {
        assert!(CoapUri::parse("coap://224.0.1.187/x").unwrap().is_multicast());
        assert!(CoapUri::parse("coap://[ff02::fd]/x").unwrap().is_multicast());
        assert!(!CoapUri::parse("coap://192.168.1.1/x").unwrap().is_multicast());
        assert!(!CoapUri::parse("coap://example.com/x").unwrap().is_multicast());
    }
}
