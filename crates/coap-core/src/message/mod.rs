//! CoAP message model
//!
//! This module defines the in-memory representation of CoAP messages:
//! - [`Message`]: header, token, options and payload shared by both directions
//! - [`Request`]: an inbound request plus its acknowledgement state
//! - [`Response`]: an outbound response or notification
//!
//! The binary layout lives in [`codec`].

pub mod codec;

pub use codec::{CoapCodec, Serializer};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};

use crate::error::{Error, Result};

/// Option numbers used by this server (RFC 7252, RFC 7641, RFC 7959)
pub mod option_number {
    /// Observe (RFC 7641)
    pub const OBSERVE: u16 = 6;
    /// Location-Path
    pub const LOCATION_PATH: u16 = 8;
    /// Uri-Path
    pub const URI_PATH: u16 = 11;
    /// Content-Format
    pub const CONTENT_FORMAT: u16 = 12;
    /// Uri-Query
    pub const URI_QUERY: u16 = 15;
    /// Accept
    pub const ACCEPT: u16 = 17;
    /// Block2 (RFC 7959)
    pub const BLOCK2: u16 = 23;
    /// Block1 (RFC 7959)
    pub const BLOCK1: u16 = 27;
    /// Size1 (RFC 7252 §5.10.9)
    pub const SIZE1: u16 = 60;
}

/// Largest value carried by the Observe option (24 bits on the wire)
pub const OBSERVE_MAX: u32 = 0x00FF_FFFF;

/// Content-Format for `text/plain; charset=utf-8`
pub const CONTENT_FORMAT_TEXT: u16 = 0;

/// CoAP message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Requires an acknowledgement (CON)
    Confirmable,
    /// Fire-and-forget (NON)
    NonConfirmable,
    /// Acknowledges a confirmable message (ACK)
    Acknowledgement,
    /// Rejects a message (RST)
    Reset,
}

impl MessageType {
    /// Wire value of the type field
    pub fn to_bits(self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    /// Parse the two-bit type field
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Message code (`class.detail`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);

    pub const CREATED: Code = Code::new(2, 1);
    pub const DELETED: Code = Code::new(2, 2);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const CONTINUE: Code = Code::new(2, 31);

    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const REQUEST_ENTITY_INCOMPLETE: Code = Code::new(4, 8);
    pub const REQUEST_ENTITY_TOO_LARGE: Code = Code::new(4, 13);

    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

    /// Build a code from its class and detail
    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1F))
    }

    /// Code class (0 = request, 2 = success, 4 = client error, 5 = server error)
    pub fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Code detail
    pub fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// Whether this is the empty code used by bare ACK/RST
    pub fn is_empty(self) -> bool {
        self == Code::EMPTY
    }

    /// Request method, if this is a request code
    pub fn method(self) -> Option<Method> {
        match self {
            Code::GET => Some(Method::Get),
            Code::POST => Some(Method::Post),
            Code::PUT => Some(Method::Put),
            Code::DELETE => Some(Method::Delete),
            _ => None,
        }
    }
}

impl From<Method> for Code {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => Code::GET,
            Method::Post => Code::POST,
            Method::Put => Code::PUT,
            Method::Delete => Code::DELETE,
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Message token (0 to 8 opaque bytes)
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(Vec<u8>);

impl Token {
    /// Maximum token length
    pub const MAX_LEN: usize = 8;

    /// Create a token, rejecting anything longer than 8 bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > Self::MAX_LEN {
            return Err(Error::invalid_input(format!(
                "token length {} exceeds {} bytes",
                bytes.len(),
                Self::MAX_LEN
            )));
        }
        Ok(Self(bytes))
    }

    /// The empty token
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Raw token bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Token length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the token is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<u8> for Token {
    fn from(value: u8) -> Self {
        Self(vec![value])
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("<empty>");
        }
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A single option instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// Option number
    pub number: u16,
    /// Raw option value
    pub value: Vec<u8>,
}

/// Block1/Block2 option value (RFC 7959)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    /// Block number
    pub num: u32,
    /// More blocks follow
    pub more: bool,
    /// Size exponent: block size is `2^(szx + 4)`
    pub szx: u8,
}

impl BlockOption {
    /// Create a block option value
    pub fn new(num: u32, more: bool, szx: u8) -> Self {
        Self { num, more, szx }
    }

    /// Block size in bytes
    pub fn size(&self) -> usize {
        1usize << (self.szx as usize + 4)
    }

    /// Byte offset of this block in the full payload
    pub fn offset(&self) -> usize {
        self.num as usize * self.size()
    }

    /// Size exponent for a block size, if it is a valid power of two in 16..=1024
    pub fn szx_for(size: usize) -> Option<u8> {
        if !(16..=1024).contains(&size) || !size.is_power_of_two() {
            return None;
        }
        Some((size.trailing_zeros() - 4) as u8)
    }

    fn to_uint(self) -> u32 {
        (self.num << 4) | ((self.more as u32) << 3) | (self.szx as u32 & 0x07)
    }

    fn from_uint(value: u32) -> Option<Self> {
        let szx = (value & 0x07) as u8;
        // szx 7 is reserved for BERT
        if szx == 7 {
            return None;
        }
        Some(Self {
            num: value >> 4,
            more: value & 0x08 != 0,
            szx,
        })
    }
}

/// Encode an unsigned option value with the minimal number of bytes
pub fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    bytes[skip..].to_vec()
}

/// Decode an unsigned option value (at most 4 bytes)
pub fn decode_uint(bytes: &[u8]) -> Option<u32> {
    if bytes.len() > 4 {
        return None;
    }
    Some(bytes.iter().fold(0u32, |acc, b| (acc << 8) | *b as u32))
}

/// A CoAP message, independent of direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type
    pub mtype: MessageType,
    /// Request method or response code
    pub code: Code,
    /// Message id; `None` until the matcher assigns one
    pub message_id: Option<u16>,
    /// Token correlating requests with responses
    pub token: Token,
    /// Options, kept in ascending option-number order
    options: Vec<CoapOption>,
    /// Payload bytes
    pub payload: Vec<u8>,
    /// Remote endpoint the message came from (inbound only)
    pub source: Option<SocketAddr>,
    /// Remote endpoint the message goes to (outbound only)
    pub destination: Option<SocketAddr>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            mtype: MessageType::NonConfirmable,
            code: Code::EMPTY,
            message_id: None,
            token: Token::empty(),
            options: Vec::new(),
            payload: Vec::new(),
            source: None,
            destination: None,
        }
    }
}

impl Message {
    /// All options in wire order
    pub fn options(&self) -> &[CoapOption] {
        &self.options
    }

    /// Append an option, keeping options sorted by number
    ///
    /// Repeated options of the same number keep their insertion order.
    pub fn add_option(&mut self, number: u16, value: impl Into<Vec<u8>>) {
        let pos = self
            .options
            .iter()
            .position(|o| o.number > number)
            .unwrap_or(self.options.len());
        self.options.insert(
            pos,
            CoapOption {
                number,
                value: value.into(),
            },
        );
    }

    /// Replace every instance of an option with a single value
    pub fn set_option(&mut self, number: u16, value: impl Into<Vec<u8>>) {
        self.remove_option(number);
        self.add_option(number, value);
    }

    /// Remove every instance of an option
    pub fn remove_option(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    /// First value of an option
    pub fn option(&self, number: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    /// Whether the option is present
    pub fn has_option(&self, number: u16) -> bool {
        self.option(number).is_some()
    }

    /// All values of a repeatable option
    pub fn option_values(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |o| o.number == number)
            .map(|o| o.value.as_slice())
    }

    /// Unsigned value of an option
    pub fn uint_option(&self, number: u16) -> Option<u32> {
        self.option(number).and_then(decode_uint)
    }

    /// Observe option value
    pub fn observe(&self) -> Option<u32> {
        self.uint_option(option_number::OBSERVE)
    }

    /// Set the Observe option, truncating to the 24-bit wire range
    pub fn set_observe(&mut self, value: u32) {
        self.set_option(option_number::OBSERVE, encode_uint(value & OBSERVE_MAX));
    }

    /// Content-Format option value
    pub fn content_format(&self) -> Option<u16> {
        self.uint_option(option_number::CONTENT_FORMAT)
            .map(|v| v as u16)
    }

    /// Set the Content-Format option
    pub fn set_content_format(&mut self, format: u16) {
        self.set_option(option_number::CONTENT_FORMAT, encode_uint(format as u32));
    }

    /// Block2 option, if present and well formed
    pub fn block2(&self) -> Option<BlockOption> {
        self.uint_option(option_number::BLOCK2)
            .and_then(BlockOption::from_uint)
    }

    /// Set the Block2 option
    pub fn set_block2(&mut self, block: BlockOption) {
        self.set_option(option_number::BLOCK2, encode_uint(block.to_uint()));
    }

    /// Block1 option, if present and well formed
    pub fn block1(&self) -> Option<BlockOption> {
        self.uint_option(option_number::BLOCK1)
            .and_then(BlockOption::from_uint)
    }

    /// Set the Block1 option
    pub fn set_block1(&mut self, block: BlockOption) {
        self.set_option(option_number::BLOCK1, encode_uint(block.to_uint()));
    }

    /// Path segments from the Uri-Path options
    pub fn uri_path_segments(&self) -> Vec<String> {
        self.option_values(option_number::URI_PATH)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Slash-joined Uri-Path
    pub fn uri_path(&self) -> String {
        self.uri_path_segments().join("/")
    }

    /// Set Uri-Path options from a slash-separated path
    pub fn set_uri_path(&mut self, path: &str) {
        self.remove_option(option_number::URI_PATH);
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            self.add_option(option_number::URI_PATH, segment.as_bytes());
        }
    }

    /// Uri-Query options
    pub fn uri_query(&self) -> Vec<String> {
        self.option_values(option_number::URI_QUERY)
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    /// Whether this message is an empty ACK/RST
    pub fn is_empty_message(&self) -> bool {
        self.code.is_empty()
    }
}

/// An inbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    message: Message,
    /// Set once the request has been acknowledged (piggybacked or separately)
    pub acknowledged: bool,
}

impl Request {
    /// Create a confirmable request for a method and path
    pub fn new(method: Method, path: &str) -> Self {
        let mut message = Message {
            mtype: MessageType::Confirmable,
            code: method.into(),
            ..Message::default()
        };
        message.set_uri_path(path);
        Self {
            message,
            acknowledged: false,
        }
    }

    /// Wrap a decoded message as a request
    pub fn from_message(message: Message) -> Result<Self> {
        if message.code.method().is_none() {
            return Err(Error::bad_request(format!(
                "code {} is not a request method",
                message.code
            )));
        }
        Ok(Self {
            message,
            acknowledged: false,
        })
    }

    /// Request method
    pub fn method(&self) -> Option<Method> {
        self.message.code.method()
    }

    /// Set the remote endpoint
    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.message.source = Some(source);
        self
    }

    /// Set the token
    pub fn with_token(mut self, token: Token) -> Self {
        self.message.token = token;
        self
    }

    /// Set the message id
    pub fn with_message_id(mut self, mid: u16) -> Self {
        self.message.message_id = Some(mid);
        self
    }

    /// Set the message type
    pub fn with_type(mut self, mtype: MessageType) -> Self {
        self.message.mtype = mtype;
        self
    }

    /// Set the Observe option (0 = register, 1 = deregister)
    pub fn with_observe(mut self, value: u32) -> Self {
        self.message.set_observe(value);
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.message.payload = payload.into();
        self
    }

    /// Unwrap into the underlying message
    pub fn into_message(self) -> Message {
        self.message
    }
}

impl Deref for Request {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for Request {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

/// An outbound response or notification
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    message: Message,
}

impl Response {
    /// Create an empty response
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a response addressed to the sender of `request`, echoing its token
    pub fn for_request(request: &Request) -> Self {
        let mut response = Self::new();
        response.destination = request.source;
        response.token = request.token.clone();
        response
    }

    /// Wrap a message as a response
    pub fn from_message(message: Message) -> Self {
        Self { message }
    }

    /// Set the response code
    pub fn with_code(mut self, code: Code) -> Self {
        self.message.code = code;
        self
    }

    /// Unwrap into the underlying message
    pub fn into_message(self) -> Message {
        self.message
    }
}

impl Deref for Response {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for Response {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_display() {
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::NOT_FOUND.to_string(), "4.04");
        assert_eq!(Code::CONTINUE.to_string(), "2.31");
        assert_eq!(Code::GET.method(), Some(Method::Get));
        assert_eq!(Code::CONTENT.method(), None);
    }

    #[test]
    fn test_uint_encoding_is_minimal() {
        assert!(encode_uint(0).is_empty());
        assert_eq!(encode_uint(1), vec![1]);
        assert_eq!(encode_uint(0x0100), vec![1, 0]);
        assert_eq!(decode_uint(&[]), Some(0));
        assert_eq!(decode_uint(&[1, 0]), Some(256));
        assert_eq!(decode_uint(&[1, 2, 3, 4, 5]), None);
    }

    #[test]
    fn test_options_stay_sorted() {
        let mut message = Message::default();
        message.add_option(option_number::CONTENT_FORMAT, vec![0]);
        message.set_observe(3);
        message.set_uri_path("a/b");

        let numbers: Vec<u16> = message.options().iter().map(|o| o.number).collect();
        assert_eq!(numbers, vec![6, 11, 11, 12]);
        assert_eq!(message.uri_path(), "a/b");
        assert_eq!(message.observe(), Some(3));
    }

    #[test]
    fn test_observe_is_truncated_to_24_bits() {
        let mut message = Message::default();
        message.set_observe(OBSERVE_MAX + 2);
        assert_eq!(message.observe(), Some(1));
    }

    #[test]
    fn test_block_option() {
        assert_eq!(BlockOption::szx_for(64), Some(2));
        assert_eq!(BlockOption::szx_for(100), None);
        assert_eq!(BlockOption::szx_for(2048), None);

        let mut message = Message::default();
        message.set_block2(BlockOption::new(3, true, 2));
        let block = message.block2().unwrap();
        assert_eq!(block, BlockOption::new(3, true, 2));
        assert_eq!(block.size(), 64);
        assert_eq!(block.offset(), 192);
    }

    #[test]
    fn test_token_length_limit() {
        assert!(Token::new(vec![0u8; 8]).is_ok());
        assert!(Token::new(vec![0u8; 9]).is_err());
        assert_eq!(Token::from(7).to_string(), "07");
    }

    #[test]
    fn test_response_for_request_echoes_token_and_source() {
        let peer: SocketAddr = "10.0.0.1:5683".parse().unwrap();
        let request = Request::new(Method::Get, "basic")
            .with_source(peer)
            .with_token(Token::from(7));
        let response = Response::for_request(&request);
        assert_eq!(response.destination, Some(peer));
        assert_eq!(response.token, Token::from(7));
    }
}
