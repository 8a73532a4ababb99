//! Worker side of the tracker protocol
//!
//! Tracker processes written in Rust connect with [`WorkerConnection`] and
//! either drive the exchange by hand or hand a tracking closure to
//! [`WorkerConnection::serve`].

use std::io::ErrorKind;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::capture::{BoundingBox, Frame};
use crate::error::{LinkError, ProtocolError, TransportError};
use crate::tracking::wire::{self, Hello, Message, TrackReply, MAX_FRAME_MESSAGE_SIZE};
use crate::tracking::Color;

/// What the broker asks of a worker
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    /// Track the target in this frame and answer with [`WorkerConnection::reply`]
    Track(Frame),
    /// Seed frame; acknowledge with [`WorkerConnection::ack`]
    InitFrame(Frame),
    /// Ground-truth box for the seed frame; acknowledge with [`WorkerConnection::ack`]
    InitBox(BoundingBox),
    /// Tracking session over
    Stop,
}

pub struct WorkerConnection {
    stream: TcpStream,
}

impl WorkerConnection {
    /// Connect to a broker and introduce ourselves
    pub async fn connect(address: &str, name: &str, color: Color) -> Result<Self, LinkError> {
        let mut stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;

        wire::write_message(
            &mut stream,
            &Message::Hello(Hello {
                name: name.to_string(),
                color,
            }),
        )
        .await?;

        info!("Connected to broker at {} as {}", address, name);
        Ok(Self { stream })
    }

    /// Next request from the broker, `None` once the broker hung up
    pub async fn next_request(&mut self) -> Result<Option<WorkerRequest>, LinkError> {
        let msg = match wire::read_message(&mut self.stream, MAX_FRAME_MESSAGE_SIZE).await {
            Ok(msg) => msg,
            Err(LinkError::Transport(TransportError::Io(e)))
                if e.kind() == ErrorKind::UnexpectedEof =>
            {
                return Ok(None)
            }
            Err(e) => return Err(e),
        };

        let request = match msg {
            Message::Track(frame) => WorkerRequest::Track(frame),
            Message::InitFrame(frame) => WorkerRequest::InitFrame(frame),
            Message::InitBox(bbox) => WorkerRequest::InitBox(bbox),
            Message::Stop => WorkerRequest::Stop,
            other => {
                return Err(ProtocolError::Unexpected {
                    expected: "request",
                    found: other.kind_name(),
                }
                .into())
            }
        };
        Ok(Some(request))
    }

    pub async fn reply(&mut self, bbox: Option<BoundingBox>, fps: f64) -> Result<(), LinkError> {
        wire::write_message(&mut self.stream, &Message::Reply(TrackReply { bbox, fps })).await
    }

    pub async fn ack(&mut self) -> Result<(), LinkError> {
        wire::write_message(&mut self.stream, &Message::Ack).await
    }

    /// Answer requests until the broker hangs up. Init messages are
    /// acknowledged automatically; every `Track` is answered with `track`.
    pub async fn serve<F>(mut self, mut track: F) -> Result<(), LinkError>
    where
        F: FnMut(&Frame) -> TrackReply,
    {
        while let Some(request) = self.next_request().await? {
            match request {
                WorkerRequest::Track(frame) => {
                    let reply = track(&frame);
                    self.reply(reply.bbox, reply.fps).await?;
                }
                WorkerRequest::InitFrame(_) | WorkerRequest::InitBox(_) => self.ack().await?,
                WorkerRequest::Stop => debug!("Tracking session stopped"),
            }
        }
        Ok(())
    }
}
