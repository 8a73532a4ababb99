//! Wire format between the broker and tracker workers
//!
//! Each message is sent as:
//! - 4 bytes: body length (big-endian u32)
//! - 1 byte: message kind
//! - N bytes: kind-specific payload
//!
//! Frame payload (`Track`, `InitFrame`), 21 byte header then pixels:
//! - 8 bytes: frame index (big-endian u64)
//! - 4 bytes: width, 4 bytes: height, 4 bytes: stride (big-endian u32)
//! - 1 byte: pixel format tag
//!
//! `Hello`, `InitBox` and `Reply` carry a JSON record. `Stop` and `Ack` are
//! empty.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::capture::{BoundingBox, Frame, FrameMetadata, PixelFormat};
use crate::error::{LinkError, ProtocolError};
use crate::tracking::Color;

/// Largest message the broker sends (a raw 4K RGBA frame fits comfortably)
pub const MAX_FRAME_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Largest message a worker may send: identity, reply or ack
pub const MAX_CONTROL_MESSAGE_SIZE: usize = 64 * 1024;

pub const FRAME_HEADER_SIZE: usize = 8 + 4 + 4 + 4 + 1; // 21 bytes

pub const MAX_TRACKER_NAME_LEN: usize = 64;

const KIND_HELLO: u8 = 0x01;
const KIND_TRACK: u8 = 0x02;
const KIND_INIT_FRAME: u8 = 0x03;
const KIND_INIT_BOX: u8 = 0x04;
const KIND_STOP: u8 = 0x05;
const KIND_REPLY: u8 = 0x06;
const KIND_ACK: u8 = 0x07;

/// Identity record a worker sends once after connecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub name: String,
    pub color: Color,
}

impl Hello {
    fn validate(&self) -> Result<(), ProtocolError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(ProtocolError::InvalidIdentity("empty name".into()));
        }
        if name.chars().count() > MAX_TRACKER_NAME_LEN {
            return Err(ProtocolError::InvalidIdentity(format!(
                "name longer than {} characters",
                MAX_TRACKER_NAME_LEN
            )));
        }
        if !self.color.is_valid() {
            return Err(ProtocolError::InvalidIdentity(format!(
                "color {:?} outside [0, 1]",
                self.color.0
            )));
        }
        Ok(())
    }
}

/// A worker's answer to one `Track` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackReply {
    pub bbox: Option<BoundingBox>,
    pub fps: f64,
}

impl TrackReply {
    fn validate(&self) -> Result<(), ProtocolError> {
        if !self.fps.is_finite() || self.fps < 0.0 {
            return Err(ProtocolError::InvalidReply(format!("fps {}", self.fps)));
        }
        if let Some(bbox) = &self.bbox {
            if !bbox.is_finite() {
                return Err(ProtocolError::InvalidReply(format!("bbox {:?}", bbox)));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub enum Message {
    Hello(Hello),
    /// Frame to track; the worker answers with `Reply`
    Track(Frame),
    /// Seed frame of a tracking session; the worker answers with `Ack`
    InitFrame(Frame),
    /// Ground-truth box for the seed frame; the worker answers with `Ack`
    InitBox(BoundingBox),
    /// End of the tracking session, no answer
    Stop,
    Reply(TrackReply),
    Ack,
}

impl Message {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Track(_) => "track",
            Message::InitFrame(_) => "init-frame",
            Message::InitBox(_) => "init-box",
            Message::Stop => "stop",
            Message::Reply(_) => "reply",
            Message::Ack => "ack",
        }
    }

    fn kind(&self) -> u8 {
        match self {
            Message::Hello(_) => KIND_HELLO,
            Message::Track(_) => KIND_TRACK,
            Message::InitFrame(_) => KIND_INIT_FRAME,
            Message::InitBox(_) => KIND_INIT_BOX,
            Message::Stop => KIND_STOP,
            Message::Reply(_) => KIND_REPLY,
            Message::Ack => KIND_ACK,
        }
    }

    /// Body excluding the pixel data of frame messages
    fn head(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(1 + FRAME_HEADER_SIZE);
        buf.put_u8(self.kind());

        match self {
            Message::Hello(hello) => buf.put_slice(&serde_json::to_vec(hello)?),
            Message::Track(frame) | Message::InitFrame(frame) => {
                let meta = &frame.meta;
                buf.put_u64(meta.index);
                buf.put_u32(meta.width);
                buf.put_u32(meta.height);
                buf.put_u32(meta.stride);
                buf.put_u8(meta.format.wire_tag());
            }
            Message::InitBox(bbox) => buf.put_slice(&serde_json::to_vec(bbox)?),
            Message::Reply(reply) => buf.put_slice(&serde_json::to_vec(reply)?),
            Message::Stop | Message::Ack => {}
        }

        Ok(buf)
    }

    fn pixels(&self) -> Option<&Bytes> {
        match self {
            Message::Track(frame) | Message::InitFrame(frame) => Some(&frame.data),
            _ => None,
        }
    }
}

/// Serialize a message body (kind + payload, no length prefix)
pub fn encode(msg: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = msg.head()?;
    if let Some(pixels) = msg.pixels() {
        buf.put_slice(pixels);
    }
    Ok(buf.freeze())
}

/// Deserialize a message body
pub fn decode(mut buf: Bytes) -> Result<Message, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }

    let kind = buf.get_u8();
    let msg = match kind {
        KIND_HELLO => {
            let hello: Hello = serde_json::from_slice(&buf)?;
            hello.validate()?;
            Message::Hello(hello)
        }
        KIND_TRACK => Message::Track(decode_frame(buf)?),
        KIND_INIT_FRAME => Message::InitFrame(decode_frame(buf)?),
        KIND_INIT_BOX => Message::InitBox(serde_json::from_slice(&buf)?),
        KIND_STOP => Message::Stop,
        KIND_REPLY => {
            let reply: TrackReply = serde_json::from_slice(&buf)?;
            reply.validate()?;
            Message::Reply(reply)
        }
        KIND_ACK => Message::Ack,
        other => return Err(ProtocolError::UnknownKind(other)),
    };

    Ok(msg)
}

fn decode_frame(mut buf: Bytes) -> Result<Frame, ProtocolError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: FRAME_HEADER_SIZE,
            got: buf.len(),
        });
    }

    let index = buf.get_u64();
    let width = buf.get_u32();
    let height = buf.get_u32();
    let stride = buf.get_u32();
    let tag = buf.get_u8();
    let format = PixelFormat::from_wire_tag(tag).ok_or(ProtocolError::UnknownKind(tag))?;

    // Remaining bytes are pixels
    Ok(Frame::new(
        buf,
        FrameMetadata {
            index,
            width,
            height,
            stride,
            format,
        },
    ))
}

/// Write a message to an async writer (prepends length prefix)
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), LinkError> {
    let head = msg.head()?;
    let pixels = msg.pixels();
    let len = head.len() + pixels.map_or(0, |p| p.len());

    if len > MAX_FRAME_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            len,
            max: MAX_FRAME_MESSAGE_SIZE,
        }
        .into());
    }

    writer.write_all(&(len as u32).to_be_bytes()).await?;
    writer.write_all(&head).await?;
    // Pixels go straight from the shared frame buffer
    if let Some(pixels) = pixels {
        writer.write_all(pixels).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Read a message from an async reader (expects length prefix)
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> Result<Message, LinkError> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len == 0 {
        return Err(ProtocolError::EmptyMessage.into());
    }
    if len > max_len {
        return Err(ProtocolError::MessageTooLarge { len, max: max_len }.into());
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Ok(decode(Bytes::from(buf))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;

    fn frame(index: u64) -> Frame {
        Frame::new(
            Bytes::from(vec![7u8; 2 * 2 * 3]),
            FrameMetadata {
                index,
                width: 2,
                height: 2,
                stride: 6,
                format: PixelFormat::Rgb24,
            },
        )
    }

    #[test]
    fn frame_message_keeps_header_and_pixels() {
        let body = encode(&Message::Track(frame(41))).unwrap();
        assert_eq!(body.len(), 1 + FRAME_HEADER_SIZE + 12);

        match decode(body).unwrap() {
            Message::Track(decoded) => {
                assert_eq!(decoded.index(), 41);
                assert_eq!(decoded.meta.stride, 6);
                assert_eq!(decoded.meta.format, PixelFormat::Rgb24);
                assert_eq!(decoded.data, Bytes::from(vec![7u8; 12]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn reply_accepts_null_bbox() {
        let mut body = vec![KIND_REPLY];
        body.extend_from_slice(br#"{"bbox": null, "fps": 12.5}"#);
        match decode(Bytes::from(body)).unwrap() {
            Message::Reply(reply) => {
                assert_eq!(reply.bbox, None);
                assert_eq!(reply.fps, 12.5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_identity() {
        let mut body = vec![KIND_HELLO];
        body.extend_from_slice(br#"{"name": "  ", "color": [1, 0, 0]}"#);
        assert!(matches!(
            decode(Bytes::from(body)),
            Err(ProtocolError::InvalidIdentity(_))
        ));

        let mut body = vec![KIND_HELLO];
        body.extend_from_slice(br#"{"name": "kcf", "color": [2, 0, 0]}"#);
        assert!(matches!(
            decode(Bytes::from(body)),
            Err(ProtocolError::InvalidIdentity(_))
        ));

        let mut body = vec![KIND_HELLO];
        body.extend_from_slice(b"kcf");
        assert!(matches!(
            decode(Bytes::from(body)),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_negative_fps() {
        let mut body = vec![KIND_REPLY];
        body.extend_from_slice(br#"{"bbox": [1, 1, 2, 2], "fps": -3}"#);
        assert!(matches!(
            decode(Bytes::from(body)),
            Err(ProtocolError::InvalidReply(_))
        ));
    }

    #[test]
    fn rejects_unknown_kind_and_short_frames() {
        assert!(matches!(
            decode(Bytes::from_static(&[0x7f])),
            Err(ProtocolError::UnknownKind(0x7f))
        ));
        assert!(matches!(
            decode(Bytes::from_static(&[KIND_TRACK, 0, 0, 0])),
            Err(ProtocolError::Truncated { needed: 21, got: 3 })
        ));
        assert!(matches!(decode(Bytes::new()), Err(ProtocolError::EmptyMessage)));
    }

    #[tokio::test]
    async fn stream_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_message(&mut a, &Message::InitFrame(frame(3))).await.unwrap();
        write_message(&mut a, &Message::InitBox(BoundingBox::new(1.0, 2.0, 3.0, 4.0)))
            .await
            .unwrap();
        write_message(&mut a, &Message::Stop).await.unwrap();

        let first = read_message(&mut b, MAX_FRAME_MESSAGE_SIZE).await.unwrap();
        assert!(matches!(first, Message::InitFrame(f) if f.index() == 3));
        let second = read_message(&mut b, MAX_FRAME_MESSAGE_SIZE).await.unwrap();
        assert!(matches!(second, Message::InitBox(b) if b.width == 3.0));
        let third = read_message(&mut b, MAX_FRAME_MESSAGE_SIZE).await.unwrap();
        assert!(matches!(third, Message::Stop));
    }

    #[tokio::test]
    async fn read_enforces_limit_before_allocating() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        let err = read_message(&mut b, MAX_CONTROL_MESSAGE_SIZE).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::Protocol(ProtocolError::MessageTooLarge { len: 1_000_000, .. })
        ));
    }

    #[tokio::test]
    async fn eof_is_a_transport_error() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let err = read_message(&mut b, MAX_CONTROL_MESSAGE_SIZE).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(TransportError::Io(_))));
    }
}
