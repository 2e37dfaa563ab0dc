//! Typed CoAP options.
//!
//! Every recognized option number carries a declared wire format and length
//! bounds; the critical / unsafe / no-cache-key properties fall out of the
//! number's low bits (RFC 7252 §5.4.6), so they hold for unknown numbers
//! too.

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::error::FormatError;

/// A CoAP option number.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub enum CoapOption {
    IfMatch,
    UriHost,
    ETag,
    IfNoneMatch,
    Observe,
    UriPort,
    LocationPath,
    UriPath,
    ContentFormat,
    MaxAge,
    UriQuery,
    Accept,
    LocationQuery,
    Block2,
    Block1,
    Size2,
    ProxyUri,
    ProxyScheme,
    Size1,
    Unknown(u16),
}

/// Wire representation of an option value.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum OptionFormat {
    Empty,
    Opaque,
    Integer,
    String,
}

impl From<u16> for CoapOption {
    fn from(number: u16) -> CoapOption {
        match number {
            1 => CoapOption::IfMatch,
            3 => CoapOption::UriHost,
            4 => CoapOption::ETag,
            5 => CoapOption::IfNoneMatch,
            6 => CoapOption::Observe,
            7 => CoapOption::UriPort,
            8 => CoapOption::LocationPath,
            11 => CoapOption::UriPath,
            12 => CoapOption::ContentFormat,
            14 => CoapOption::MaxAge,
            15 => CoapOption::UriQuery,
            17 => CoapOption::Accept,
            20 => CoapOption::LocationQuery,
            23 => CoapOption::Block2,
            27 => CoapOption::Block1,
            28 => CoapOption::Size2,
            35 => CoapOption::ProxyUri,
            39 => CoapOption::ProxyScheme,
            60 => CoapOption::Size1,
            n => CoapOption::Unknown(n),
        }
    }
}

impl From<CoapOption> for u16 {
    fn from(option: CoapOption) -> u16 {
        option.number()
    }
}

impl CoapOption {
    pub fn number(&self) -> u16 {
        match self {
            CoapOption::IfMatch => 1,
            CoapOption::UriHost => 3,
            CoapOption::ETag => 4,
            CoapOption::IfNoneMatch => 5,
            CoapOption::Observe => 6,
            CoapOption::UriPort => 7,
            CoapOption::LocationPath => 8,
            CoapOption::UriPath => 11,
            CoapOption::ContentFormat => 12,
            CoapOption::MaxAge => 14,
            CoapOption::UriQuery => 15,
            CoapOption::Accept => 17,
            CoapOption::LocationQuery => 20,
            CoapOption::Block2 => 23,
            CoapOption::Block1 => 27,
            CoapOption::Size2 => 28,
            CoapOption::ProxyUri => 35,
            CoapOption::ProxyScheme => 39,
            CoapOption::Size1 => 60,
            CoapOption::Unknown(n) => *n,
        }
    }

    /// Whether this crate knows the option's semantics.
    pub fn is_recognized(&self) -> bool {
        !matches!(self, CoapOption::Unknown(_))
    }

    /// Critical options must be understood by the receiver (odd numbers).
    pub fn is_critical(&self) -> bool {
        self.number() & 0x01 != 0
    }

    /// Unsafe options must not be forwarded unrecognized by a proxy.
    pub fn is_unsafe(&self) -> bool {
        self.number() & 0x02 != 0
    }

    /// NoCacheKey options do not take part in the cache key.
    pub fn is_no_cache_key(&self) -> bool {
        self.number() & 0x1E == 0x1C
    }

    pub fn is_repeatable(&self) -> bool {
        matches!(
            self,
            CoapOption::IfMatch
                | CoapOption::ETag
                | CoapOption::LocationPath
                | CoapOption::UriPath
                | CoapOption::UriQuery
                | CoapOption::LocationQuery
        )
    }

    pub fn format(&self) -> OptionFormat {
        match self {
            CoapOption::IfMatch => OptionFormat::Opaque,
            CoapOption::UriHost => OptionFormat::String,
            CoapOption::ETag => OptionFormat::Opaque,
            CoapOption::IfNoneMatch => OptionFormat::Empty,
            CoapOption::Observe => OptionFormat::Integer,
            CoapOption::UriPort => OptionFormat::Integer,
            CoapOption::LocationPath => OptionFormat::String,
            CoapOption::UriPath => OptionFormat::String,
            CoapOption::ContentFormat => OptionFormat::Integer,
            CoapOption::MaxAge => OptionFormat::Integer,
            CoapOption::UriQuery => OptionFormat::String,
            CoapOption::Accept => OptionFormat::Integer,
            CoapOption::LocationQuery => OptionFormat::String,
            CoapOption::Block2 => OptionFormat::Integer,
            CoapOption::Block1 => OptionFormat::Integer,
            CoapOption::Size2 => OptionFormat::Integer,
            CoapOption::ProxyUri => OptionFormat::String,
            CoapOption::ProxyScheme => OptionFormat::String,
            CoapOption::Size1 => OptionFormat::Integer,
            CoapOption::Unknown(_) => OptionFormat::Opaque,
        }
    }

    /// Value length bounds in bytes, per the RFC 7252 §5.10 table (and the
    /// block/observe extensions).
    pub fn length_bounds(&self) -> (usize, usize) {
        match self {
            CoapOption::IfMatch => (0, 8),
            CoapOption::UriHost => (1, 255),
            CoapOption::ETag => (1, 8),
            CoapOption::IfNoneMatch => (0, 0),
            CoapOption::Observe => (0, 3),
            CoapOption::UriPort => (0, 2),
            CoapOption::LocationPath => (0, 255),
            CoapOption::UriPath => (0, 255),
            CoapOption::ContentFormat => (0, 2),
            CoapOption::MaxAge => (0, 4),
            CoapOption::UriQuery => (0, 255),
            CoapOption::Accept => (0, 2),
            CoapOption::LocationQuery => (0, 255),
            CoapOption::Block2 => (0, 3),
            CoapOption::Block1 => (0, 3),
            CoapOption::Size2 => (0, 4),
            CoapOption::ProxyUri => (1, 1034),
            CoapOption::ProxyScheme => (1, 255),
            CoapOption::Size1 => (0, 4),
            CoapOption::Unknown(_) => (0, usize::MAX),
        }
    }

    /// Default value for options that define one.
    pub fn default_value(&self) -> Option<u32> {
        match self {
            CoapOption::MaxAge => Some(60),
            CoapOption::UriPort => None, // defaulted from the scheme, not here
            _ => None,
        }
    }
}

/// Encodes an unsigned integer option value minimally: big-endian with no
/// leading zero bytes, zero as the empty value.
pub fn encode_integer(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decodes a big-endian unsigned integer option value, enforcing the
/// option's declared maximum width.
pub fn decode_integer(bytes: &[u8], option: CoapOption) -> Result<u32, FormatError> {
    let (_, max) = option.length_bounds();
    if bytes.len() > max.min(4) {
        return Err(FormatError::OptionValueTooLong {
            actual: bytes.len(),
            max: max.min(4),
        });
    }

    Ok(bytes.iter().fold(0u32, |acc, b| acc << 8 | u32::from(*b)))
}

/// Content formats from the IANA registry.
#[derive(PartialEq, Eq, Debug, Clone, Copy, FromPrimitive)]
pub enum ContentFormat {
    TextPlain = 0,
    ApplicationLinkFormat = 40,
    ApplicationXML = 41,
    ApplicationOctetStream = 42,
    ApplicationEXI = 47,
    ApplicationJSON = 50,
    ApplicationCBOR = 60,
    ApplicationSenmlJSON = 110,
    ApplicationSensmlJSON = 111,
    ApplicationSenmlCBOR = 112,
    ApplicationSensmlCBOR = 113,
    ApplicationSenmlExi = 114,
    ApplicationSensmlExi = 115,
    ApplicationSenmlXML = 310,
    ApplicationSensmlXML = 311,
}

impl ContentFormat {
    pub fn from_u16_value(value: u16) -> Option<ContentFormat> {
        FromPrimitive::from_u16(value)
    }
}

/// Observe option register/deregister flags (RFC 7641 §2).
#[derive(PartialEq, Eq, Debug, Clone, Copy, FromPrimitive)]
pub enum ObserveOption {
    Register = 0,
    Deregister = 1,
}
