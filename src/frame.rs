//! Framing: encoding a message into one self-delimited wire frame and decoding
//!  frames back out of a raw byte stream.
//!
//! Frame layout (all integers little-endian):
//!
//! ```ascii
//!  +0  u8   protocol id
//!  +1  u16  message type
//!  +3  u32  (frame length << 1) | has-type-table
//!  +7  [ u16 num types, num_types x varint-prefixed string ]  iff has-type-table
//!  +?  [ 16-byte IV ]                                         iff message is encrypted
//!  +?  payload bytes (zero-padded to the AES block size when encrypted)
//!  +?  [ HMAC tag ]                                           iff message is authenticated
//! ```
//!
//! The frame length covers the entire frame including the tag. On unreliable
//!  transports the payload region starts with `(message id << 1) | is-response`
//!  ahead of the application payload.

use crate::buffers::wire::{self, WireWriter};
use crate::crypto::MessageCrypto;
use crate::dynamic_types::{SerializationContext, TypeRegistry};
use crate::protocol::{Message, MessageHeader, ProtocolSet};
use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use std::sync::Arc;

pub const BASE_HEADER_LENGTH: usize = 7;

/// offset of the reserved length word within the frame
const LENGTH_WORD_OFFSET: usize = 3;

/// Per-message id as used on unreliable transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageId {
    pub id: u32,
    pub is_response: bool,
}

/// Encode `message` into a single frame in `w` (which is cleared first).
///
/// `message_id` is present exactly on the datagram path; the stream path carries
///  no per-message ids.
pub fn encode(
    message: &dyn Message,
    message_id: Option<MessageId>,
    crypto: &dyn MessageCrypto,
    types: &Arc<TypeRegistry>,
    w: &mut WireWriter,
) -> anyhow::Result<u32> {
    w.clear();
    w.put_u8(message.protocol_id());
    w.put_u16_le(message.message_type());
    w.put_u32_le(0); // patched below once the frame length is known

    if let Some(message_id) = &message_id {
        if message_id.id >= (1 << 31) {
            bail!("message id {} exceeds the 31-bit id space", message_id.id);
        }
        w.put_u32_le((message_id.id << 1) | message_id.is_response as u32);
    }

    let mut ctx = SerializationContext::new(types.clone());
    message.write_payload(&mut ctx, w)?;

    let mut header_length = BASE_HEADER_LENGTH;
    if ctx.has_types() {
        let num_types = u16::try_from(ctx.type_names().len())
            .map_err(|_| anyhow!("payload registered more dynamic types than the table can index"))?;
        let mut table = WireWriter::new();
        table.put_u16_le(num_types);
        for name in ctx.type_names() {
            wire::put_string(&mut table, name);
        }
        w.insert_bytes(BASE_HEADER_LENGTH, table.as_ref());
        header_length += table.len();
    }

    if message.encrypted() {
        crypto.encrypt(w, header_length)?;
        header_length += crypto.iv_len();
    }

    if message.authenticated() {
        let tag = crypto.sign(&w.as_ref()[header_length..])?;
        w.put_slice(&tag);
    }

    let frame_length = w.len();
    if frame_length >= (1 << 31) {
        bail!("frame length {} exceeds the 31-bit length space", frame_length);
    }
    w.patch_u32_le(
        LENGTH_WORD_OFFSET,
        ((frame_length as u32) << 1) | ctx.has_types() as u32,
    );

    Ok(frame_length as u32)
}

/// A successfully parsed frame prefix: everything up to the payload region, plus
///  an empty message instance ready to be filled by `decode_frame`.
pub struct FrameHeader {
    pub message: Box<dyn Message>,
    pub protocol_id: u8,
    pub message_type: u16,
    pub frame_length: usize,
    pub header_length: usize,
    pub type_table: Vec<String>,
    pub iv: Option<Vec<u8>>,
}

pub enum HeaderOutcome {
    /// not enough buffered bytes to make a decision - read more and retry
    NeedMore,
    /// a complete frame that produces no message (unknown protocol or message
    ///  type): consume `frame_length` bytes and continue at the next frame boundary
    Skip { frame_length: usize },
    /// the declared frame length exceeds the configured maximum
    TooLarge { declared: usize },
    Ready(FrameHeader),
}

/// Try to parse a frame prefix out of `buf`. Errors mean the byte stream is
///  corrupt beyond recovery and the connection must be dropped.
pub fn try_get_header(
    buf: &[u8],
    protocols: &ProtocolSet,
    crypto: &dyn MessageCrypto,
    max_message_length: usize,
) -> anyhow::Result<HeaderOutcome> {
    if buf.len() < BASE_HEADER_LENGTH {
        return Ok(HeaderOutcome::NeedMore);
    }

    let mut r = buf;
    let protocol_id = r.try_get_u8()?;
    let message_type = r.try_get_u16_le()?;
    let length_word = r.try_get_u32_le()?;

    let has_type_table = (length_word & 1) != 0;
    let frame_length = (length_word >> 1) as usize;

    if frame_length > max_message_length {
        return Ok(HeaderOutcome::TooLarge { declared: frame_length });
    }
    if frame_length < BASE_HEADER_LENGTH {
        bail!("declared frame length {} is shorter than the frame header", frame_length);
    }
    if buf.len() < frame_length {
        return Ok(HeaderOutcome::NeedMore);
    }

    let protocol = match protocols.find(protocol_id) {
        Some(protocol) => protocol,
        None => return Ok(HeaderOutcome::Skip { frame_length }),
    };
    let message = match protocol.create_message(message_type) {
        Some(message) => message,
        None => return Ok(HeaderOutcome::Skip { frame_length }),
    };

    let frame = &buf[..frame_length];
    let mut header_length = BASE_HEADER_LENGTH;

    let mut type_table = Vec::new();
    if has_type_table {
        let mut r = &frame[BASE_HEADER_LENGTH..];
        let before = r.len();
        let num_types = r.try_get_u16_le()?;
        for _ in 0..num_types {
            type_table.push(wire::try_get_string(&mut r)?);
        }
        header_length += before - r.len();
    }

    let iv = if message.encrypted() {
        let iv_len = crypto.iv_len();
        if header_length + iv_len > frame_length {
            bail!("frame too short to hold the declared IV");
        }
        let iv = frame[header_length..header_length + iv_len].to_vec();
        header_length += iv_len;
        Some(iv)
    } else {
        None
    };

    Ok(HeaderOutcome::Ready(FrameHeader {
        message,
        protocol_id,
        message_type,
        frame_length,
        header_length,
        type_table,
        iv,
    }))
}

#[derive(Debug)]
pub enum DecodeError {
    /// HMAC verification failed - the frame was tampered with
    AuthenticationFailed,
    Malformed(anyhow::Error),
}

impl From<anyhow::Error> for DecodeError {
    fn from(e: anyhow::Error) -> Self {
        DecodeError::Malformed(e)
    }
}

/// Decode the payload of a frame whose prefix was parsed by `try_get_header`.
///
/// `with_message_id` selects the datagram layout where the payload region starts
///  with the message-id word.
pub fn decode_frame(
    frame: &[u8],
    header: FrameHeader,
    crypto: &dyn MessageCrypto,
    types: &Arc<TypeRegistry>,
    with_message_id: bool,
) -> Result<(Box<dyn Message>, MessageHeader), DecodeError> {
    let mut message = header.message;

    let tag_length = if message.authenticated() { crypto.tag_len() } else { 0 };
    if frame.len() < header.header_length + tag_length {
        return Err(anyhow!("frame too short to hold payload and authentication tag").into());
    }
    let body = &frame[header.header_length..frame.len() - tag_length];

    if message.authenticated() {
        let tag = &frame[frame.len() - tag_length..];
        if !crypto.verify(body, tag) {
            return Err(DecodeError::AuthenticationFailed);
        }
    }

    let plaintext;
    let mut payload: &[u8] = if message.encrypted() {
        let iv = header.iv.as_deref().expect("header parsing provides an IV for encrypted messages");
        plaintext = crypto.decrypt(iv, body)?;
        &plaintext
    } else {
        body
    };

    let (message_id, is_response) = if with_message_id {
        let word = payload.try_get_u32_le().map_err(anyhow::Error::from)?;
        (word >> 1, (word & 1) != 0)
    } else {
        (0, false)
    };

    let ctx = SerializationContext::with_table(types.clone(), header.type_table);
    message.read_payload(&ctx, &mut payload)?;
    // NB: trailing bytes are legal - encryption pads the payload to the block size

    let header_length = u16::try_from(header.header_length)
        .map_err(|_| anyhow!("header length {} exceeds the u16 header field", header.header_length))?;

    Ok((
        message,
        MessageHeader {
            protocol_id: header.protocol_id,
            message_type: header.message_type,
            message_length: u32::try_from(frame.len())
                .expect("the frame length was read from the 31-bit length word"),
            header_length,
            message_id,
            is_response,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SigningHashAlgorithm;
    use crate::crypto::{AesHmacCrypto, NoCrypto, SessionKeys};
    use crate::test_util::*;
    use rstest::rstest;

    fn test_protocols() -> ProtocolSet {
        let mut protocols = ProtocolSet::new();
        protocols.register(Arc::new(TestProtocol)).unwrap();
        protocols
    }

    fn test_crypto() -> AesHmacCrypto {
        AesHmacCrypto::new(
            SessionKeys {
                aes_key: [3u8; 32],
                hmac_key: [4u8; 32],
            },
            SigningHashAlgorithm::Sha256,
        )
    }

    fn encode_to_vec(message: &dyn Message, message_id: Option<MessageId>, crypto: &dyn MessageCrypto) -> Vec<u8> {
        let mut w = WireWriter::new();
        let len = encode(message, message_id, crypto, &test_type_registry(), &mut w).unwrap();
        assert_eq!(len as usize, w.len());
        w.as_ref().to_vec()
    }

    #[test]
    fn test_plain_frame_layout() {
        let frame = encode_to_vec(&EchoMessage::new("hi"), None, &NoCrypto);
        assert_eq!(frame, vec![2, 1, 0, 20, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_length_word_encodes_length_and_table_flag() {
        let frame = encode_to_vec(&EchoMessage::new("hi"), None, &NoCrypto);
        let word = u32::from_le_bytes(frame[3..7].try_into().unwrap());
        assert_eq!(word >> 1, frame.len() as u32);
        assert_eq!(word & 1, 0);

        let frame = encode_to_vec(&TaggedMessage { point: Point { x: 3, y: 4 } }, None, &NoCrypto);
        let word = u32::from_le_bytes(frame[3..7].try_into().unwrap());
        assert_eq!(word >> 1, frame.len() as u32);
        assert_eq!(word & 1, 1);
    }

    #[test]
    fn test_type_table_frame_layout() {
        let frame = encode_to_vec(&TaggedMessage { point: Point { x: 3, y: 4 } }, None, &NoCrypto);
        #[rustfmt::skip]
        assert_eq!(frame, vec![
            2, 3, 0,                // protocol id, message type
            61, 0, 0, 0,            // (30 << 1) | 1
            1, 0,                   // one table entry
            10, b't', b'e', b's', b't', b'.', b'p', b'o', b'i', b'n', b't',
            0, 0,                   // type id of the point value
            3, 0, 0, 0, 4, 0, 0, 0, // x, y
        ]);
    }

    fn decode_one(
        frame: &[u8],
        protocols: &ProtocolSet,
        crypto: &dyn MessageCrypto,
        with_message_id: bool,
    ) -> Result<(Box<dyn Message>, MessageHeader), DecodeError> {
        let header = match try_get_header(frame, protocols, crypto, 1024 * 1024).unwrap() {
            HeaderOutcome::Ready(header) => header,
            _ => panic!("expected a complete frame"),
        };
        assert_eq!(header.frame_length, frame.len());
        decode_frame(frame, header, crypto, &test_type_registry(), with_message_id)
    }

    #[rstest]
    #[case::plain(&EchoMessage::new("hello") as &dyn Message)]
    #[case::with_type_table(&TaggedMessage { point: Point { x: 17, y: 4711 } })]
    fn test_roundtrip_plain(#[case] original: &dyn Message) {
        let protocols = test_protocols();
        let frame = encode_to_vec(original, None, &NoCrypto);

        let (decoded, header) = decode_one(&frame, &protocols, &NoCrypto, false).unwrap();
        assert_eq!(header.protocol_id, original.protocol_id());
        assert_eq!(header.message_type, original.message_type());
        assert_eq!(header.message_length as usize, frame.len());
        assert_eq!(header.message_id, 0);
        assert!(!header.is_response);

        match original.message_type() {
            1 => assert_eq!(
                decoded.as_any().downcast_ref::<EchoMessage>(),
                original.as_any().downcast_ref::<EchoMessage>()
            ),
            3 => assert_eq!(
                decoded.as_any().downcast_ref::<TaggedMessage>(),
                original.as_any().downcast_ref::<TaggedMessage>()
            ),
            _ => unreachable!(),
        }
    }

    #[rstest]
    #[case::request(MessageId { id: 5, is_response: false })]
    #[case::response(MessageId { id: 5, is_response: true })]
    #[case::large_id(MessageId { id: (1 << 31) - 1, is_response: false })]
    fn test_roundtrip_with_message_id(#[case] message_id: MessageId) {
        let protocols = test_protocols();
        let frame = encode_to_vec(&EchoMessage::new("hi"), Some(message_id), &NoCrypto);

        let (decoded, header) = decode_one(&frame, &protocols, &NoCrypto, true).unwrap();
        assert_eq!(header.message_id, message_id.id);
        assert_eq!(header.is_response, message_id.is_response);
        assert_eq!(decoded.as_any().downcast_ref::<EchoMessage>(), Some(&EchoMessage::new("hi")));
    }

    #[test]
    fn test_message_id_exceeding_id_space_is_rejected() {
        let mut w = WireWriter::new();
        let result = encode(
            &EchoMessage::new("hi"),
            Some(MessageId { id: 1 << 31, is_response: false }),
            &NoCrypto,
            &test_type_registry(),
            &mut w,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_roundtrip_encrypted_authenticated() {
        let protocols = test_protocols();
        let crypto = test_crypto();
        let original = SecretMessage { secret: "attack at dawn".to_owned() };

        let frame = encode_to_vec(&original, None, &crypto);
        // base header + IV + one padded block + tag
        assert_eq!(frame.len(), 7 + 16 + 16 + 32);

        let (decoded, header) = decode_one(&frame, &protocols, &crypto, false).unwrap();
        assert_eq!(header.header_length as usize, 7 + 16);
        assert_eq!(decoded.as_any().downcast_ref::<SecretMessage>(), Some(&original));
    }

    #[test]
    fn test_tampered_ciphertext_fails_authentication() {
        let protocols = test_protocols();
        let crypto = test_crypto();
        let mut frame = encode_to_vec(&SecretMessage { secret: "s".to_owned() }, None, &crypto);

        frame[7 + 16] ^= 0x01; // flip one ciphertext bit
        match decode_one(&frame, &protocols, &crypto, false) {
            Err(DecodeError::AuthenticationFailed) => {}
            other => panic!("expected authentication failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tampered_tag_fails_authentication() {
        let protocols = test_protocols();
        let crypto = test_crypto();
        let mut frame = encode_to_vec(&SecretMessage { secret: "s".to_owned() }, None, &crypto);

        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert!(matches!(
            decode_one(&frame, &protocols, &crypto, false),
            Err(DecodeError::AuthenticationFailed)
        ));
    }

    #[rstest]
    #[case::empty(0)]
    #[case::partial_base_header(5)]
    #[case::partial_payload(8)]
    fn test_need_more_on_partial_frame(#[case] available: usize) {
        let protocols = test_protocols();
        let frame = encode_to_vec(&EchoMessage::new("hello"), None, &NoCrypto);

        match try_get_header(&frame[..available], &protocols, &NoCrypto, 1024).unwrap() {
            HeaderOutcome::NeedMore => {}
            _ => panic!("expected NeedMore with {} bytes available", available),
        }
    }

    #[test]
    fn test_unknown_protocol_is_skipped() {
        let protocols = ProtocolSet::new(); // test protocol not registered
        let frame = encode_to_vec(&EchoMessage::new("hi"), None, &NoCrypto);

        match try_get_header(&frame, &protocols, &NoCrypto, 1024).unwrap() {
            HeaderOutcome::Skip { frame_length } => assert_eq!(frame_length, frame.len()),
            _ => panic!("expected the frame to be skipped"),
        }
    }

    #[test]
    fn test_unknown_message_type_is_skipped() {
        let protocols = test_protocols();
        let mut frame = encode_to_vec(&EchoMessage::new("hi"), None, &NoCrypto);
        frame[1] = 0xff; // not a known message type of the test protocol

        match try_get_header(&frame, &protocols, &NoCrypto, 1024).unwrap() {
            HeaderOutcome::Skip { frame_length } => assert_eq!(frame_length, frame.len()),
            _ => panic!("expected the frame to be skipped"),
        }
    }

    #[test]
    fn test_oversize_frame_is_detected() {
        let protocols = test_protocols();
        let mut frame = vec![0u8; BASE_HEADER_LENGTH];
        frame[0] = TEST_PROTOCOL_ID;
        frame[3..7].copy_from_slice(&((2_000_000u32 << 1).to_le_bytes()));

        match try_get_header(&frame, &protocols, &NoCrypto, 1024 * 1024).unwrap() {
            HeaderOutcome::TooLarge { declared } => assert_eq!(declared, 2_000_000),
            _ => panic!("expected the frame to be rejected as too large"),
        }
    }

    #[test]
    fn test_undersized_declared_length_is_malformed() {
        let protocols = test_protocols();
        let mut frame = encode_to_vec(&EchoMessage::new("hi"), None, &NoCrypto);
        frame[3..7].copy_from_slice(&((3u32) << 1).to_le_bytes());

        assert!(try_get_header(&frame, &protocols, &NoCrypto, 1024).is_err());
    }
}
