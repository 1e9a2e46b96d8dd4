// # CoAP Codec
//
// Converts between [`Message`] and the RFC 7252 datagram layout.
//
// ## Layout
//
// ```text
//  0                   1                   2                   3
// |Ver| T |  TKL  |      Code     |          Message ID           |
// |   Token (if any, TKL bytes) ...
// |   Options (if any) ...
// |1 1 1 1 1 1 1 1|    Payload (if any) ...
// ```
//
// Options are delta-encoded against the previous option number. Delta and
// length nibbles 13 and 14 announce one or two extension bytes; 15 is
// reserved and only valid as the payload marker.

use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::message::{Code, Message, MessageType, Token};

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;
const HEADER_LEN: usize = 4;

/// Converts messages to and from wire bytes
///
/// Implementations must be stateless or internally synchronized; the
/// dispatcher and the retransmission scheduler share one instance.
pub trait Serializer: Send + Sync {
    /// Encode an outbound message
    ///
    /// # Returns
    ///
    /// - `Ok(Vec<u8>)`: The datagram bytes
    /// - `Err(Error::Codec)`: The message cannot be encoded (e.g. no message id)
    fn serialize(&self, message: &Message) -> Result<Vec<u8>>;

    /// Decode an inbound datagram received from `source`
    fn deserialize(&self, datagram: &[u8], source: SocketAddr) -> Result<Message>;
}

/// RFC 7252 binary codec
#[derive(Debug, Clone, Copy, Default)]
pub struct CoapCodec;

impl CoapCodec {
    /// Create a codec
    pub fn new() -> Self {
        Self
    }
}

impl Serializer for CoapCodec {
    fn serialize(&self, message: &Message) -> Result<Vec<u8>> {
        let mid = message
            .message_id
            .ok_or_else(|| Error::codec("message id has not been assigned"))?;
        let token = message.token.as_bytes();

        let mut out = Vec::with_capacity(HEADER_LEN + token.len() + message.payload.len() + 16);
        out.push((VERSION << 6) | (message.mtype.to_bits() << 4) | token.len() as u8);
        out.push(message.code.0);
        out.extend_from_slice(&mid.to_be_bytes());
        out.extend_from_slice(token);

        let mut previous = 0u16;
        for option in message.options() {
            let delta = option.number - previous;
            let len = option.value.len();
            if len > u16::MAX as usize + 269 {
                return Err(Error::codec(format!(
                    "option {} value too long ({} bytes)",
                    option.number, len
                )));
            }
            let (delta_nibble, delta_ext) = nibble(delta as usize);
            let (len_nibble, len_ext) = nibble(len);
            out.push((delta_nibble << 4) | len_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&len_ext);
            out.extend_from_slice(&option.value);
            previous = option.number;
        }

        if !message.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(&message.payload);
        }

        Ok(out)
    }

    fn deserialize(&self, datagram: &[u8], source: SocketAddr) -> Result<Message> {
        if datagram.len() < HEADER_LEN {
            return Err(Error::codec(format!(
                "datagram too short: {} bytes",
                datagram.len()
            )));
        }

        let version = datagram[0] >> 6;
        if version != VERSION {
            return Err(Error::codec(format!("unsupported version {}", version)));
        }
        let mtype = MessageType::from_bits(datagram[0] >> 4);
        let tkl = (datagram[0] & 0x0F) as usize;
        if tkl > Token::MAX_LEN {
            return Err(Error::codec(format!("token length {} is reserved", tkl)));
        }
        let code = Code(datagram[1]);
        let mid = u16::from_be_bytes([datagram[2], datagram[3]]);

        let mut cursor = Cursor::new(&datagram[HEADER_LEN..]);
        let token = Token::new(cursor.take(tkl)?)?;

        let mut message = Message {
            mtype,
            code,
            message_id: Some(mid),
            token,
            source: Some(source),
            ..Message::default()
        };

        let mut number = 0u16;
        while let Some(byte) = cursor.next_byte() {
            if byte == PAYLOAD_MARKER {
                let payload = cursor.rest();
                if payload.is_empty() {
                    return Err(Error::codec("payload marker followed by empty payload"));
                }
                message.payload = payload.to_vec();
                break;
            }
            let delta = extended(byte >> 4, &mut cursor)?;
            let len = extended(byte & 0x0F, &mut cursor)?;
            number = u16::try_from(number as usize + delta)
                .map_err(|_| Error::codec("option number overflow"))?;
            let value = cursor.take(len)?;
            message.add_option(number, value);
        }

        if code.is_empty() && (!message.token.is_empty() || !message.payload.is_empty()) {
            return Err(Error::codec("empty message carries token or payload"));
        }

        Ok(message)
    }
}

/// Split a delta/length into its nibble and extension bytes
fn nibble(value: usize) -> (u8, Vec<u8>) {
    match value {
        0..=12 => (value as u8, Vec::new()),
        13..=268 => (13, vec![(value - 13) as u8]),
        _ => (14, ((value - 269) as u16).to_be_bytes().to_vec()),
    }
}

/// Resolve a delta/length nibble against its extension bytes
fn extended(nibble: u8, cursor: &mut Cursor<'_>) -> Result<usize> {
    match nibble {
        0..=12 => Ok(nibble as usize),
        13 => Ok(cursor.take(1)?[0] as usize + 13),
        14 => {
            let ext = cursor.take(2)?;
            Ok(u16::from_be_bytes([ext[0], ext[1]]) as usize + 269)
        }
        _ => Err(Error::codec("reserved option nibble 15")),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(Error::codec("truncated datagram"));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn next_byte(&mut self) -> Option<u8> {
        let byte = self.data.get(self.pos).copied()?;
        self.pos += 1;
        Some(byte)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}
