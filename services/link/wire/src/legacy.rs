//! Legacy single-message framing.
//!
//! Non-multiplexed links carry one message at a time, optionally preceded by
//! zero padding and optionally followed by a trailing bulk field whose length
//! is declared in the header. The trailer bytes are not part of the message;
//! the caller streams them separately once the header has been parsed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::message::{Message, MessageType};
use crate::presentation::Parsed;
use crate::WireError;

/// First byte of every legacy message
pub const LEGACY_MARKER: u8 = 0xA7;

/// marker + type id + body length + trailer length
pub const LEGACY_HEADER_LEN: usize = 1 + 2 + 4 + 4;

/// Encoded size of a message header + body (trailer excluded)
pub fn legacy_encoded_len(message: &Message) -> usize {
    LEGACY_HEADER_LEN + message.payload_len()
}

/// Append a legacy header + body. The trailer length is taken from the
/// message's bulk announcement; trailer bytes are appended by the caller.
pub fn encode_legacy(message: &Message, buf: &mut BytesMut) -> Result<(), WireError> {
    let body_len = message.payload_len();
    if body_len > u32::MAX as usize {
        return Err(WireError::Oversized(body_len));
    }
    let trailer_len = message.bulk_header().map_or(0, |b| b.length);

    buf.reserve(LEGACY_HEADER_LEN + body_len);
    buf.put_u8(LEGACY_MARKER);
    buf.put_u16(message.message_type() as u16);
    buf.put_u32(body_len as u32);
    buf.put_u32(trailer_len);
    message.encode_payload(buf);
    Ok(())
}

/// Parse one message from the front of `buf`.
///
/// `max_body` bounds the declared body length; anything larger is treated as
/// corruption rather than waited for.
pub fn parse_legacy(buf: &[u8], max_body: usize) -> Result<Parsed, WireError> {
    let skipped = buf.iter().take_while(|b| **b == 0).count();
    let rest = &buf[skipped..];

    if rest.is_empty() {
        return Ok(Parsed::NeedMore { skipped });
    }
    if rest[0] != LEGACY_MARKER {
        return Err(WireError::Marker(rest[0]));
    }
    if rest.len() < LEGACY_HEADER_LEN {
        return Ok(Parsed::NeedMore { skipped });
    }

    let typ = MessageType::try_from(u16::from_be_bytes([rest[1], rest[2]]))?;
    let body_len = u32::from_be_bytes([rest[3], rest[4], rest[5], rest[6]]) as usize;
    let trailer_len = u32::from_be_bytes([rest[7], rest[8], rest[9], rest[10]]) as u64;

    if body_len > max_body {
        return Err(WireError::FrameTooLarge {
            len: body_len,
            max: max_body,
        });
    }
    if rest.len() < LEGACY_HEADER_LEN + body_len {
        return Ok(Parsed::NeedMore { skipped });
    }

    let payload = Bytes::copy_from_slice(&rest[LEGACY_HEADER_LEN..LEGACY_HEADER_LEN + body_len]);
    let message = Message::decode_payload(typ, payload)?;

    let declared = message.bulk_header().map_or(0, |b| b.length as u64);
    if declared != trailer_len {
        return Err(WireError::Malformed("legacy trailer length"));
    }

    Ok(Parsed::Message {
        message,
        consumed: skipped + LEGACY_HEADER_LEN + body_len,
        trailer_len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AppMessage, BulkHeader};

    fn app_with_trailer(len: u32) -> Message {
        Message::Application(AppMessage {
            corr_id: 5,
            request: false,
            body: Bytes::from_static(b"block"),
            bulk: Some(BulkHeader {
                transfer_id: 0,
                length: len,
            }),
        })
    }

    #[test]
    fn test_parse_with_leading_padding() {
        let message = app_with_trailer(300);
        let mut buf = BytesMut::new();
        buf.put_bytes(0, 7);
        encode_legacy(&message, &mut buf).unwrap();
        buf.put_slice(&[1, 2, 3]); // start of trailer

        match parse_legacy(&buf, 4096).unwrap() {
            Parsed::Message {
                message: parsed,
                consumed,
                trailer_len,
            } => {
                assert_eq!(parsed, message);
                assert_eq!(consumed, 7 + legacy_encoded_len(&message));
                assert_eq!(trailer_len, 300);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_partial_header_needs_more() {
        let message = app_with_trailer(0);
        let mut buf = BytesMut::new();
        buf.put_bytes(0, 2);
        encode_legacy(&message, &mut buf).unwrap();

        for cut in 0..buf.len() {
            let parsed = parse_legacy(&buf[..cut], 4096).unwrap();
            assert!(matches!(parsed, Parsed::NeedMore { .. }), "cut {cut}");
        }
        assert_eq!(
            parse_legacy(&buf[..2], 4096).unwrap(),
            Parsed::NeedMore { skipped: 2 }
        );
    }

    #[test]
    fn test_garbage_fails_closed() {
        assert_eq!(parse_legacy(&[0, 0, 0x11], 4096), Err(WireError::Marker(0x11)));
    }

    #[test]
    fn test_over_length_body_fails_closed() {
        let mut buf = BytesMut::new();
        buf.put_u8(LEGACY_MARKER);
        buf.put_u16(MessageType::Application as u16);
        buf.put_u32(1 << 20);
        buf.put_u32(0);
        assert!(matches!(
            parse_legacy(&buf, 4096),
            Err(WireError::FrameTooLarge { len, .. }) if len == 1 << 20
        ));
    }
}
