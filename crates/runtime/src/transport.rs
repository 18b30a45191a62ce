//! Length-prefixed message framing over a byte stream.
//!
//! Every message on the wire is `[4-byte length][UTF-8 JSON payload]`. The
//! framing layer is agnostic to what carries the bytes - a child process
//! pipe, a unix socket, or an in-process duplex stream - and to how the
//! stream chunks them: the receiver accumulates bytes and slices out
//! complete frames, so a single read may surface zero, one, or many
//! messages.
//!
//! Decoded messages are forwarded through an unbounded channel rather than
//! handed to the consumer inline; the reader never runs consumer code, and
//! one oversized buffer cannot monopolize it.

use crate::error::{Error, Result};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Sanity cap on a single frame. A length prefix beyond this is corrupt
/// input, not a large message.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 32 * 1024;

/// Byte order of the 4-byte length prefix, fixed at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Little-endian length prefix (the default).
    #[default]
    Little,
    /// Big-endian length prefix.
    Big,
}

impl Endianness {
    fn encode(self, length: u32) -> [u8; 4] {
        match self {
            Endianness::Little => length.to_le_bytes(),
            Endianness::Big => length.to_be_bytes(),
        }
    }

    fn decode(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// Encodes one message as a complete frame.
pub fn encode_frame(message: &Value, endianness: Endianness) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(Error::Framing(format!(
            "outgoing frame of {} bytes exceeds cap",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&endianness.encode(payload.len() as u32));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Streaming frame reassembly, independent of chunk boundaries.
///
/// Feed arbitrary byte slices in; complete messages come out. The length
/// prefix is parsed exactly once per frame and remembered until enough
/// payload bytes arrive.
pub struct FrameDecoder {
    endianness: Endianness,
    buffer: Vec<u8>,
    pending_length: Option<usize>,
}

impl FrameDecoder {
    pub fn new(endianness: Endianness) -> Self {
        Self {
            endianness,
            buffer: Vec::new(),
            pending_length: None,
        }
    }

    /// Appends a chunk and decodes every complete frame it finishes.
    pub fn push(&mut self, chunk: &[u8], decoded: &mut Vec<Value>) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        loop {
            if self.pending_length.is_none() {
                if self.buffer.len() < 4 {
                    return Ok(());
                }
                let header: [u8; 4] = self.buffer[..4].try_into().expect("length checked");
                let length = self.endianness.decode(header) as usize;
                if length > MAX_FRAME_BYTES {
                    return Err(Error::Framing(format!(
                        "length prefix {length} exceeds {MAX_FRAME_BYTES} byte cap"
                    )));
                }
                self.buffer.drain(..4);
                self.pending_length = Some(length);
            }
            let length = self.pending_length.expect("set above");
            if self.buffer.len() < length {
                return Ok(());
            }
            let payload: Vec<u8> = self.buffer.drain(..length).collect();
            self.pending_length = None;
            decoded.push(serde_json::from_slice(&payload)?);
        }
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.pending_length.is_none() && self.buffer.is_empty()
    }
}

/// Sending half of a transport.
pub trait Transport: Send {
    /// Frames and writes one message to the underlying sink.
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>>;

    /// Flags the transport as draining a shutdown: once set, writes after
    /// the sink has gone away are dropped instead of failing.
    fn mark_stopping(&mut self);
}

/// Receiving half of a transport: owns the read loop.
pub trait TransportReceiver: Send {
    /// Reads until the stream closes, forwarding each decoded message.
    ///
    /// Returns `Ok(())` on clean end-of-stream, an error when the stream
    /// closes mid-frame or the framing is corrupt. The forwarding channel
    /// closing is the consumer's single "closed" notification either way.
    fn run(&mut self) -> BoxFuture<'_, Result<()>>;
}

/// The pieces a connection needs to take ownership of a transport.
pub struct TransportParts {
    pub sender: Box<dyn Transport>,
    pub receiver: Box<dyn TransportReceiver>,
    pub message_rx: mpsc::UnboundedReceiver<Value>,
}

/// Transport over a pair of byte streams (e.g. a child's stdin/stdout).
pub struct PipeTransport<W, R> {
    sender: PipeTransportSender<W>,
    receiver: PipeTransportReceiver<R>,
}

impl<W, R> PipeTransport<W, R>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
{
    /// Creates a little-endian transport over the given streams.
    pub fn new(writer: W, reader: R) -> (Self, mpsc::UnboundedReceiver<Value>) {
        Self::with_endianness(writer, reader, Endianness::default())
    }

    /// Creates a transport with an explicit length-prefix byte order.
    pub fn with_endianness(
        writer: W,
        reader: R,
        endianness: Endianness,
    ) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let transport = Self {
            sender: PipeTransportSender {
                writer,
                endianness,
                stopping: false,
                closed: false,
            },
            receiver: PipeTransportReceiver {
                reader,
                decoder: FrameDecoder::new(endianness),
                message_tx,
            },
        };
        (transport, message_rx)
    }

    /// Splits into independently owned sender and receiver halves.
    pub fn into_parts(self) -> (PipeTransportSender<W>, PipeTransportReceiver<R>) {
        (self.sender, self.receiver)
    }

    /// Boxes the halves together with the message channel for a connection.
    pub fn into_transport_parts(self, message_rx: mpsc::UnboundedReceiver<Value>) -> TransportParts {
        let (sender, receiver) = self.into_parts();
        TransportParts {
            sender: Box::new(sender),
            receiver: Box::new(receiver),
            message_rx,
        }
    }
}

/// Writing half of a [`PipeTransport`].
pub struct PipeTransportSender<W> {
    writer: W,
    endianness: Endianness,
    stopping: bool,
    closed: bool,
}

impl<W: AsyncWrite + Unpin + Send> Transport for PipeTransportSender<W> {
    fn send(&mut self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closed {
                if self.stopping {
                    tracing::debug!("dropping outgoing message during shutdown drain");
                    return Ok(());
                }
                return Err(Error::TransportClosed);
            }
            let frame = encode_frame(&message, self.endianness)?;
            let write = async {
                self.writer.write_all(&frame).await?;
                self.writer.flush().await?;
                std::io::Result::Ok(())
            };
            match write.await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.closed = true;
                    if self.stopping {
                        tracing::debug!(error = %e, "write failed during shutdown drain");
                        Ok(())
                    } else {
                        Err(Error::Io(e))
                    }
                }
            }
        })
    }

    fn mark_stopping(&mut self) {
        self.stopping = true;
    }
}

/// Reading half of a [`PipeTransport`].
pub struct PipeTransportReceiver<R> {
    reader: R,
    decoder: FrameDecoder,
    message_tx: mpsc::UnboundedSender<Value>,
}

impl<R: AsyncRead + Unpin + Send> TransportReceiver for PipeTransportReceiver<R> {
    fn run(&mut self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut chunk = vec![0u8; READ_CHUNK_BYTES];
            let mut decoded = Vec::new();
            loop {
                let n = self.reader.read(&mut chunk).await?;
                if n == 0 {
                    if self.decoder.is_idle() {
                        return Ok(());
                    }
                    return Err(Error::Framing(
                        "stream closed in the middle of a frame".to_string(),
                    ));
                }
                self.decoder.push(&chunk[..n], &mut decoded)?;
                for message in decoded.drain(..) {
                    if self.message_tx.send(message).is_err() {
                        // Consumer went away; stop reading.
                        return Ok(());
                    }
                }
            }
        })
    }
}

/// A connected pair of in-process transports, client parts first.
///
/// Stands in for a real process pipe in tests and in-process setups.
pub fn loopback(buffer: usize) -> (TransportParts, TransportParts) {
    let (client_read, server_write) = tokio::io::duplex(buffer);
    let (server_read, client_write) = tokio::io::duplex(buffer);
    let (client, client_rx) = PipeTransport::new(client_write, client_read);
    let (server, server_rx) = PipeTransport::new(server_write, server_read);
    (
        client.into_transport_parts(client_rx),
        server.into_transport_parts(server_rx),
    )
}
