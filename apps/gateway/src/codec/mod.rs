//! Wire codec
//!
//! Turns [`GatewayPayload`]s into socket messages and back, for both the
//! textual (`json`) and packed binary (`etf`) encodings. The zlib-stream
//! inflater sits in front of [`Codec::decode`] when transport compression is
//! negotiated.

pub mod etf;
mod inflate;

pub use inflate::{Inflater, ZLIB_SUFFIX};

use crate::error::GatewayError;
use crate::protocol::GatewayPayload;
use std::fmt;
use std::str::FromStr;

/// Payload encoding negotiated in the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Etf,
}

impl Encoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Etf => "etf",
        }
    }
}

impl FromStr for Encoding {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "etf" | "binary" => Ok(Self::Etf),
            other => Err(GatewayError::Config(format!("unknown encoding '{other}'"))),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport compression negotiated in the connection URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    ZlibStream,
}

impl Compression {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZlibStream => "zlib-stream",
        }
    }

    /// Parse an optional setting; `none` or empty disables compression.
    pub fn parse_optional(s: &str) -> Result<Option<Self>, GatewayError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(None),
            "zlib-stream" | "zlib" => Ok(Some(Self::ZlibStream)),
            other => Err(GatewayError::Config(format!("unknown compression '{other}'"))),
        }
    }
}

/// An encoded socket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Raw inbound data handed to the decoder.
#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    Text(&'a str),
    /// A whole frame, or a buffer the inflater already produced.
    Binary(&'a [u8]),
    /// Fragments of one frame, concatenated before decoding.
    Fragments(&'a [Vec<u8>]),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    encoding: Encoding,
}

impl Codec {
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn encode(&self, payload: &GatewayPayload) -> Result<WireMessage, GatewayError> {
        match self.encoding {
            Encoding::Json => serde_json::to_string(payload)
                .map(WireMessage::Text)
                .map_err(|e| GatewayError::Encode(e.to_string())),
            Encoding::Etf => {
                let value =
                    serde_json::to_value(payload).map_err(|e| GatewayError::Encode(e.to_string()))?;
                etf::encode(&value).map(WireMessage::Binary)
            }
        }
    }

    pub fn decode(&self, frame: Frame<'_>) -> Result<GatewayPayload, GatewayError> {
        match frame {
            Frame::Text(text) => {
                serde_json::from_str(text).map_err(|e| GatewayError::Decode(e.to_string()))
            }
            Frame::Binary(bytes) => self.decode_bytes(bytes),
            Frame::Fragments(fragments) => self.decode_bytes(&fragments.concat()),
        }
    }

    fn decode_bytes(&self, bytes: &[u8]) -> Result<GatewayPayload, GatewayError> {
        match self.encoding {
            Encoding::Json => {
                serde_json::from_slice(bytes).map_err(|e| GatewayError::Decode(e.to_string()))
            }
            Encoding::Etf => {
                let value = etf::decode(bytes)?;
                serde_json::from_value(value).map_err(|e| GatewayError::Decode(e.to_string()))
            }
        }
    }
}
