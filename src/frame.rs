//! F2B frame stream codec.
//!
//! Every transport message and checkpoint file is a sequence of frames:
//! a 3-byte `F2B` magic, a one-byte type tag, and (for payload-carrying
//! types) a 4-byte network-order length followed by that many payload
//! bytes. A `GZIP` frame wraps a compressed nested frame sequence; an
//! `EOF` frame terminates a message.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{Error, Result};
use crate::record::BanRecord;

/// Frame magic bytes.
pub const FRAME_MAGIC: [u8; 3] = *b"F2B";

/// Frame header size (magic + type tag).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Frame type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Eof = 0,
    Gzip = 1,
    Record = 2,
    Subscribe = 3,
    Unsubscribe = 4,
}

impl FrameKind {
    pub fn from_u8(tag: u8) -> Option<FrameKind> {
        match tag {
            0 => Some(FrameKind::Eof),
            1 => Some(FrameKind::Gzip),
            2 => Some(FrameKind::Record),
            3 => Some(FrameKind::Subscribe),
            4 => Some(FrameKind::Unsubscribe),
            _ => None,
        }
    }
}

/// Subscribe/unsubscribe payload: requester host name plus a subscriber
/// id, which together derive the per-subscriber queue identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub requester: String,
    pub subscriber_id: String,
}

impl Registration {
    pub fn new(requester: &str, subscriber_id: &str) -> Registration {
        Registration {
            requester: requester.to_string(),
            subscriber_id: subscriber_id.to_string(),
        }
    }

    /// Transport queue name this registration maps to.
    pub fn queue_name(&self) -> String {
        format!("fw_subscriber_{}_{}", self.requester, self.subscriber_id)
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Record(BanRecord),
    Subscribe(Registration),
    Unsubscribe(Registration),
}

/// Parse one message (frame sequence) into frames.
///
/// Stops at `EOF` or the end of the buffer. An unknown type tag is
/// logged and skipped over using its declared length; a malformed record
/// payload is logged and dropped. Structural truncation fails the rest
/// of the message.
pub fn read_message(bytes: &[u8]) -> Result<Vec<Frame>> {
    let mut frames = Vec::new();
    read_into(bytes, &mut frames, 0)?;
    Ok(frames)
}

fn read_into(bytes: &[u8], frames: &mut Vec<Frame>, depth: u8) -> Result<()> {
    let mut pos = 0;

    while pos < bytes.len() {
        if bytes.len() < pos + FRAME_HEADER_SIZE {
            return Err(Error::MalformedFrame("truncated frame header".to_string()));
        }
        if bytes[pos..pos + 3] != FRAME_MAGIC {
            return Err(Error::MalformedFrame("bad frame magic".to_string()));
        }
        let tag = bytes[pos + 3];
        pos += FRAME_HEADER_SIZE;

        let kind = match FrameKind::from_u8(tag) {
            Some(FrameKind::Eof) => return Ok(()),
            Some(kind) => Some(kind),
            None => {
                log::warn!("skipping frame with unknown type {}", tag);
                None
            }
        };

        // every non-EOF frame carries a length-prefixed payload
        if bytes.len() < pos + 4 {
            return Err(Error::MalformedFrame("truncated frame length".to_string()));
        }
        let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        if bytes.len() < pos + len {
            return Err(Error::MalformedFrame(format!(
                "truncated frame payload (want {} bytes)",
                len
            )));
        }
        let payload = &bytes[pos..pos + len];
        pos += len;

        match kind {
            Some(FrameKind::Record) => match BanRecord::from_bytes(payload.to_vec()) {
                Ok(record) => frames.push(Frame::Record(record)),
                Err(e) => log::warn!("dropping malformed record frame: {}", e),
            },
            Some(FrameKind::Subscribe) => {
                frames.push(Frame::Subscribe(decode_registration(payload)?))
            }
            Some(FrameKind::Unsubscribe) => {
                frames.push(Frame::Unsubscribe(decode_registration(payload)?))
            }
            Some(FrameKind::Gzip) => {
                if depth > 0 {
                    return Err(Error::MalformedFrame(
                        "nested compressed frames".to_string(),
                    ));
                }
                let mut inner = Vec::new();
                GzDecoder::new(payload)
                    .read_to_end(&mut inner)
                    .map_err(|e| Error::MalformedFrame(format!("bad gzip payload: {}", e)))?;
                read_into(&inner, frames, depth + 1)?;
            }
            Some(FrameKind::Eof) => unreachable!(),
            None => {} // unknown kind, payload already skipped
        }
    }

    Ok(())
}

// names feed straight into queue identities, so mangled bytes would
// register a queue nobody listens on
fn decode_registration(payload: &[u8]) -> Result<Registration> {
    let (requester, rest) = take_lv(payload)?;
    let (subscriber_id, _) = take_lv(rest)?;
    Ok(Registration {
        requester: utf8_name(requester)?,
        subscriber_id: utf8_name(subscriber_id)?,
    })
}

fn utf8_name(bytes: &[u8]) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| Error::MalformedFrame("registration name is not valid UTF-8".to_string()))
}

fn take_lv(bytes: &[u8]) -> Result<(&[u8], &[u8])> {
    if bytes.len() < 4 {
        return Err(Error::MalformedFrame(
            "truncated registration payload".to_string(),
        ));
    }
    let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
    if bytes.len() < 4 + len {
        return Err(Error::MalformedFrame(
            "truncated registration payload".to_string(),
        ));
    }
    Ok((&bytes[4..4 + len], &bytes[4 + len..]))
}

fn append_header(buf: &mut Vec<u8>, kind: FrameKind) {
    buf.extend_from_slice(&FRAME_MAGIC);
    buf.push(kind as u8);
}

/// Append a `RECORD` frame for raw record bytes.
pub fn append_record_frame(buf: &mut Vec<u8>, record: &[u8]) {
    append_header(buf, FrameKind::Record);
    buf.extend_from_slice(&(record.len() as u32).to_be_bytes());
    buf.extend_from_slice(record);
}

/// Append an `EOF` frame.
pub fn append_eof(buf: &mut Vec<u8>) {
    append_header(buf, FrameKind::Eof);
}

/// Encode a complete single-record message.
pub fn encode_record_message(record: &BanRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE * 2 + 4 + record.as_bytes().len());
    append_record_frame(&mut buf, record.as_bytes());
    append_eof(&mut buf);
    buf
}

/// Encode a complete subscribe or unsubscribe message.
pub fn encode_registration_message(subscribe: bool, reg: &Registration) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&(reg.requester.len() as u32).to_be_bytes());
    payload.extend_from_slice(reg.requester.as_bytes());
    payload.extend_from_slice(&(reg.subscriber_id.len() as u32).to_be_bytes());
    payload.extend_from_slice(reg.subscriber_id.as_bytes());

    let kind = if subscribe {
        FrameKind::Subscribe
    } else {
        FrameKind::Unsubscribe
    };

    let mut buf = Vec::new();
    append_header(&mut buf, kind);
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    append_eof(&mut buf);
    buf
}

/// Pack record bytes into EOF-terminated messages, each holding at most
/// `max_aggregate` bytes of uncompressed record frames. With `compress`
/// the frame sequence of each message is wrapped in a single `GZIP`
/// frame.
pub fn batch_records<'a, I>(records: I, max_aggregate: usize, compress: bool) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut messages = Vec::new();
    let mut body: Vec<u8> = Vec::new();

    for record in records {
        let frame_len = FRAME_HEADER_SIZE + 4 + record.len();
        if !body.is_empty() && body.len() + frame_len > max_aggregate {
            messages.push(seal(std::mem::take(&mut body), compress));
        }
        append_record_frame(&mut body, record);
    }
    if !body.is_empty() {
        messages.push(seal(body, compress));
    }

    messages
}

fn seal(body: Vec<u8>, compress: bool) -> Vec<u8> {
    let mut msg = Vec::new();
    if compress {
        match gzip(&body) {
            Ok(compressed) => {
                append_header(&mut msg, FrameKind::Gzip);
                msg.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
                msg.extend_from_slice(&compressed);
            }
            // never emit a GZIP frame that does not hold gzip bytes
            Err(e) => {
                log::warn!("gzip failed, sending uncompressed: {}", e);
                msg = body;
            }
        }
    } else {
        msg = body;
    }
    append_eof(&mut msg);
    msg
}

fn gzip(body: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(body)?;
    enc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordBuilder;

    fn record(expiration: i64, port: u16) -> BanRecord {
        let mut b = RecordBuilder::new(expiration);
        b.add_addr("203.0.113.9".parse().unwrap());
        b.add_port(port);
        b.build()
    }

    #[test]
    fn test_record_message_roundtrip() {
        let rec = record(5000, 22);
        let msg = encode_record_message(&rec);
        let frames = read_message(&msg).unwrap();
        assert_eq!(frames, vec![Frame::Record(rec)]);
    }

    #[test]
    fn test_registration_roundtrip() {
        let reg = Registration::new("host1.example.org", "6f2c-id");
        let msg = encode_registration_message(true, &reg);
        assert_eq!(read_message(&msg).unwrap(), vec![Frame::Subscribe(reg.clone())]);

        let msg = encode_registration_message(false, &reg);
        assert_eq!(read_message(&msg).unwrap(), vec![Frame::Unsubscribe(reg)]);
    }

    #[test]
    fn test_registration_rejects_invalid_utf8() {
        // SUBSCRIBE payload with non-UTF-8 requester bytes
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u32.to_be_bytes());
        payload.extend_from_slice(&[0xff, 0xfe]);
        payload.extend_from_slice(&1u32.to_be_bytes());
        payload.push(b'x');

        let mut msg = Vec::new();
        append_header(&mut msg, FrameKind::Subscribe);
        msg.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        msg.extend_from_slice(&payload);
        append_eof(&mut msg);

        assert!(read_message(&msg).is_err());
    }

    #[test]
    fn test_gzip_helper_produces_readable_payload() {
        let rec = record(5000, 22);
        let mut body = Vec::new();
        append_record_frame(&mut body, rec.as_bytes());

        let compressed = gzip(&body).unwrap();
        assert!(compressed.starts_with(&[0x1f, 0x8b]));
        let mut inflated = Vec::new();
        GzDecoder::new(&compressed[..])
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, body);
    }

    #[test]
    fn test_eof_stops_parsing() {
        let rec = record(5000, 22);
        let mut msg = encode_record_message(&rec);
        // trailing garbage after EOF must be ignored
        msg.extend_from_slice(b"garbage");
        assert_eq!(read_message(&msg).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_frame_skipped() {
        let rec = record(5000, 22);
        let mut msg = Vec::new();
        msg.extend_from_slice(&FRAME_MAGIC);
        msg.push(99);
        msg.extend_from_slice(&4u32.to_be_bytes());
        msg.extend_from_slice(&[1, 2, 3, 4]);
        append_record_frame(&mut msg, rec.as_bytes());
        append_eof(&mut msg);

        let frames = read_message(&msg).unwrap();
        assert_eq!(frames, vec![Frame::Record(rec)]);
    }

    #[test]
    fn test_malformed_record_dropped_stream_continues() {
        let good = record(5000, 22);
        let mut msg = Vec::new();
        append_record_frame(&mut msg, &[200, 1, 2]); // bogus record bytes
        append_record_frame(&mut msg, good.as_bytes());
        append_eof(&mut msg);

        let frames = read_message(&msg).unwrap();
        assert_eq!(frames, vec![Frame::Record(good)]);
    }

    #[test]
    fn test_truncation_is_error() {
        let rec = record(5000, 22);
        let msg = encode_record_message(&rec);
        assert!(read_message(&msg[..msg.len() - 10]).is_err());
        assert!(read_message(&[b'F', b'2']).is_err());
        assert!(read_message(b"XYZ\x02").is_err());
    }

    #[test]
    fn test_batching_splits_on_size() {
        let records: Vec<BanRecord> = (0..10).map(|i| record(1000 + i, i as u16)).collect();
        let raw: Vec<&[u8]> = records.iter().map(|r| r.as_bytes()).collect();
        let frame_len = FRAME_HEADER_SIZE + 4 + raw[0].len();

        // room for three frames per message
        let messages = batch_records(raw.iter().copied(), frame_len * 3, false);
        assert_eq!(messages.len(), 4);

        let mut decoded = Vec::new();
        for msg in &messages {
            decoded.extend(read_message(msg).unwrap());
        }
        assert_eq!(decoded.len(), 10);
    }

    #[test]
    fn test_batching_compressed() {
        let records: Vec<BanRecord> = (0..5).map(|i| record(1000 + i, i as u16)).collect();
        let raw: Vec<&[u8]> = records.iter().map(|r| r.as_bytes()).collect();

        let messages = batch_records(raw.iter().copied(), usize::MAX, true);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0][3], FrameKind::Gzip as u8);

        let frames = read_message(&messages[0]).unwrap();
        assert_eq!(frames.len(), 5);
    }

    #[test]
    fn test_oversized_record_still_sent_alone() {
        let rec = record(1000, 1);
        let raw: Vec<&[u8]> = vec![rec.as_bytes(), rec.as_bytes()];
        // limit below a single frame: each record still ships, one per message
        let messages = batch_records(raw.into_iter(), 1, false);
        assert_eq!(messages.len(), 2);
    }
}
