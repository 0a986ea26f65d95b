//! Wire format: handshake frame, message headers, and framing.
//!
//! Every value on a connection rides in one length-delimited frame
//! (`tokio-util`'s [`LengthDelimitedCodec`]). The first frame is always the
//! JSON-encoded [`Options`] handshake, regardless of which codec it
//! negotiates; after that, each message is a [`Header`] frame followed by a
//! body frame, both in the negotiated [`CodecKind`]. An error reply still
//! carries an (empty) body frame so the reader never desynchronizes.
//!
//! ```text
//! | json(Options) | codec(Header) codec(Body) | codec(Header) codec(Body) | ...
//! ```

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::rpc::RpcError;

/// Fixed handshake marker; connections opening with anything else are not
/// speaking this protocol.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Default deadline for establishing transport plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Serialization used for headers and bodies after the handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    /// Compact binary frames via `bincode`. The default.
    #[serde(rename = "application/bincode")]
    Bincode,
    /// JSON frames, convenient when eyeballing traffic.
    #[serde(rename = "application/json")]
    Json,
}

impl CodecKind {
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, RpcError> {
        match self {
            CodecKind::Bincode => bincode::serialize(value)
                .map(Bytes::from)
                .map_err(|err| RpcError::Codec(err.to_string())),
            CodecKind::Json => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|err| RpcError::Codec(err.to_string())),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, frame: &[u8]) -> Result<T, RpcError> {
        match self {
            CodecKind::Bincode => {
                bincode::deserialize(frame).map_err(|err| RpcError::Codec(err.to_string()))
            }
            CodecKind::Json => {
                serde_json::from_slice(frame).map_err(|err| RpcError::Codec(err.to_string()))
            }
        }
    }
}

/// Per-connection handshake, negotiated once and JSON-encoded always.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use ika::rpc::{CodecKind, Options};
///
/// let options = Options {
///     codec: CodecKind::Json,
///     handle_timeout: Duration::from_secs(1),
///     ..Options::default()
/// };
/// assert_eq!(options.magic, ika::rpc::MAGIC_NUMBER);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Options {
    pub magic: u32,
    pub codec: CodecKind,
    /// Client-side deadline for transport + handshake. Zero disables it.
    #[serde(default)]
    pub connect_timeout: Duration,
    /// Server-side deadline per request. Zero disables it.
    #[serde(default)]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic: MAGIC_NUMBER,
            codec: CodecKind::Bincode,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handle_timeout: Duration::ZERO,
        }
    }
}

/// Per-message metadata preceding every body frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Dispatch target, `Service.Method`.
    pub service_method: String,
    /// Correlates a reply with its pending call; strictly monotonic per
    /// connection.
    pub seq: u64,
    /// Empty on success; otherwise the reply body frame is empty.
    pub error: String,
}

/// Anything that can carry the framed protocol.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Owned, type-erased connection stream.
pub type BoxStream = Box<dyn Stream>;

/// Reading half of a framed connection.
pub struct WireReader {
    kind: CodecKind,
    frames: FramedRead<ReadHalf<BoxStream>, LengthDelimitedCodec>,
}

impl std::fmt::Debug for WireReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireReader")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Writing half of a framed connection.
pub struct WireWriter {
    kind: CodecKind,
    frames: FramedWrite<WriteHalf<BoxStream>, LengthDelimitedCodec>,
}

impl std::fmt::Debug for WireWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireWriter")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Server-side handshake: reads and validates the Options frame, then
/// returns the framed halves speaking the negotiated codec.
pub async fn accept(stream: BoxStream) -> Result<(Options, WireReader, WireWriter), RpcError> {
    let (read, write) = tokio::io::split(stream);
    let mut frames = FramedRead::new(read, LengthDelimitedCodec::new());

    let first = match frames.next().await {
        Some(Ok(frame)) => frame,
        Some(Err(err)) => return Err(RpcError::Io(err)),
        None => return Err(RpcError::Protocol("connection closed before handshake".into())),
    };
    let options: Options = serde_json::from_slice(&first)
        .map_err(|err| RpcError::Protocol(format!("invalid options frame: {err}")))?;
    if options.magic != MAGIC_NUMBER {
        return Err(RpcError::InvalidMagic(options.magic));
    }

    let kind = options.codec;
    let reader = WireReader { kind, frames };
    let writer = WireWriter {
        kind,
        frames: FramedWrite::new(write, LengthDelimitedCodec::new()),
    };
    Ok((options, reader, writer))
}

/// Client-side handshake: writes the Options frame, then returns the framed
/// halves speaking the negotiated codec.
pub async fn connect(stream: BoxStream, options: &Options) -> Result<(WireReader, WireWriter), RpcError> {
    let (read, write) = tokio::io::split(stream);
    let reader = WireReader {
        kind: options.codec,
        frames: FramedRead::new(read, LengthDelimitedCodec::new()),
    };
    let mut writer = WireWriter {
        kind: options.codec,
        frames: FramedWrite::new(write, LengthDelimitedCodec::new()),
    };

    let handshake = serde_json::to_vec(options)
        .map_err(|err| RpcError::Codec(err.to_string()))?;
    writer.frames.send(Bytes::from(handshake)).await?;
    Ok((reader, writer))
}

impl WireReader {
    async fn next_frame(&mut self) -> Result<Option<Bytes>, RpcError> {
        match self.frames.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(err)) => Err(RpcError::Io(err)),
            None => Ok(None),
        }
    }

    /// Next message header; `None` means the peer ended the session.
    pub async fn read_header(&mut self) -> Result<Option<Header>, RpcError> {
        match self.next_frame().await? {
            Some(frame) => Ok(Some(self.kind.decode(&frame)?)),
            None => Ok(None),
        }
    }

    /// The body frame that must follow every header.
    pub async fn read_body(&mut self) -> Result<Bytes, RpcError> {
        self.next_frame().await?.ok_or(RpcError::Incomplete)
    }
}

impl WireWriter {
    /// Sends one message as a header frame plus a body frame, flushing
    /// before returning. An encode failure closes the stream, since the
    /// peer could otherwise be left waiting on half a message.
    pub async fn write(&mut self, header: &Header, body: Bytes) -> Result<(), RpcError> {
        let header = match self.kind.encode(header) {
            Ok(frame) => frame,
            Err(err) => {
                let _ = self.frames.close().await;
                return Err(err);
            }
        };
        self.frames.feed(header).await?;
        self.frames.send(body).await?;
        Ok(())
    }

    /// Flushes and shuts down the write half.
    pub async fn close(&mut self) -> Result<(), RpcError> {
        self.frames.close().await?;
        Ok(())
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }
}
