//! Frame codec for the RPC wire protocol.
//!
//! Request frame:
//! ```text
//! ┌──────────┬──────────────────────┬──────────────────────┐
//! │ len (2B) │ "Service.Method"     │ argument payload     │
//! │ u16 BE   │ len bytes, UTF-8     │ (argument's Encode)  │
//! └──────────┴──────────────────────┴──────────────────────┘
//! ```
//! Response frame:
//! ```text
//! ┌──────────┬──────────────────────┐      ┌──────────┬──────────────────┐
//! │ len (4B) │ error message        │  or  │ 0u32     │ reply payload    │
//! │ u32 BE>0 │ len bytes            │      │          │ (reply's Encode) │
//! └──────────┴──────────────────────┘      └──────────┴──────────────────┘
//! ```
//! A stream carries exactly one request and one response, so there is no
//! request id. Every length prefix is checked against [`FrameLimits`] before
//! the field is read.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use crate::transport::{BufferReader, BufferWriter};
use crate::types::{Error, FrameLimits, Result};

/// Size of the method-name length prefix.
pub const METHOD_LEN_SIZE: usize = 2;
/// Size of the error-message length prefix.
pub const ERROR_LEN_SIZE: usize = 4;

/// Sent in place of an empty handler error, which would otherwise read as a
/// successful reply.
const EMPTY_ERROR_TEXT: &str = "rpc: remote error with empty message";

/// Types that can write themselves into a request or reply payload.
pub trait Encode {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()>;
}

/// Types that can read themselves back from a payload.
#[async_trait]
pub trait Decode: Sized + Send {
    async fn decode_from(reader: &mut dyn BufferReader) -> std::io::Result<Self>;
}

// =============================================================================
// Payload impls: u64 BE length + bytes
// =============================================================================

impl Encode for () {
    fn encode_to(&self, _writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Decode for () {
    async fn decode_from(_reader: &mut dyn BufferReader) -> std::io::Result<Self> {
        Ok(())
    }
}

impl Encode for [u8] {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        put_u64(writer, self.len() as u64)?;
        writer.write_bytes(self)
    }
}

impl Encode for Bytes {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        self.as_ref().encode_to(writer)
    }
}

#[async_trait]
impl Decode for Bytes {
    async fn decode_from(reader: &mut dyn BufferReader) -> std::io::Result<Self> {
        let len = get_u64(reader).await?;
        let len = usize::try_from(len).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("payload length {} does not fit in memory", len),
            )
        })?;
        reader.read_bytes(len).await
    }
}

impl Encode for Vec<u8> {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        self.as_slice().encode_to(writer)
    }
}

#[async_trait]
impl Decode for Vec<u8> {
    async fn decode_from(reader: &mut dyn BufferReader) -> std::io::Result<Self> {
        Ok(Bytes::decode_from(reader).await?.to_vec())
    }
}

impl Encode for str {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        self.as_bytes().encode_to(writer)
    }
}

impl Encode for String {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        self.as_str().encode_to(writer)
    }
}

#[async_trait]
impl Decode for String {
    async fn decode_from(reader: &mut dyn BufferReader) -> std::io::Result<Self> {
        let raw = Vec::<u8>::decode_from(reader).await?;
        String::from_utf8(raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Payload bytes written as-is, without a length prefix.
struct RawPayload<'a>(&'a [u8]);

impl Encode for RawPayload<'_> {
    fn encode_to(&self, writer: &mut dyn BufferWriter) -> std::io::Result<()> {
        writer.write_bytes(self.0)
    }
}

// =============================================================================
// Request frames
// =============================================================================

/// Write a complete request frame into `writer`. Nothing is sent until the
/// stream is flushed.
pub fn write_request<A: Encode + ?Sized>(
    writer: &mut dyn BufferWriter,
    method: &str,
    args: &A,
    limits: &FrameLimits,
) -> Result<()> {
    let len = check_method_len(method, limits)?;
    writer
        .reserve(METHOD_LEN_SIZE)
        .map(|buf| buf.copy_from_slice(&len.to_be_bytes()))
        .map_err(|e| Error::transport("can't write service method len", e))?;
    writer
        .write_str(method)
        .map_err(|e| Error::transport("can't write service method", e))?;
    args.encode_to(writer)
        .map_err(|e| Error::transport("can't write request argument", e))?;
    Ok(())
}

/// Validate the method identifier length against the limit and the u16 prefix.
pub fn check_method_len(method: &str, limits: &FrameLimits) -> Result<u16> {
    u16::try_from(method.len())
        .ok()
        .filter(|len| *len <= limits.max_method_name_len)
        .ok_or_else(|| {
            Error::protocol(format!(
                "rpc: service method name is {} bytes, limit is {}",
                method.len(),
                limits.max_method_name_len
            ))
        })
}

/// Read the method identifier at the head of a request frame. The argument
/// payload is left unread.
pub async fn read_request_header(
    reader: &mut dyn BufferReader,
    limits: &FrameLimits,
) -> Result<String> {
    let raw = reader
        .read_bytes(METHOD_LEN_SIZE)
        .await
        .map_err(|e| Error::transport("can't read service method's len", e))?;
    let len = u16::from_be_bytes(fixed::<METHOD_LEN_SIZE>(&raw)?);
    if len > limits.max_method_name_len {
        return Err(Error::protocol(format!(
            "rpc: service method name of {} bytes exceeds limit of {}",
            len, limits.max_method_name_len
        )));
    }

    let raw = reader
        .read_bytes(usize::from(len))
        .await
        .map_err(|e| Error::transport("can't read service method", e))?;
    String::from_utf8(raw.to_vec()).map_err(|_| {
        Error::protocol("rpc: service/method request ill-formed: method name is not UTF-8")
    })
}

/// Split `Service.Method` at the last separator.
pub fn split_method(identifier: &str) -> Result<(&str, &str)> {
    identifier.rsplit_once('.').ok_or_else(|| {
        Error::protocol(format!(
            "rpc: service/method request ill-formed: {}",
            identifier
        ))
    })
}

// =============================================================================
// Response frames
// =============================================================================

/// Write an error response. Messages over the limit are cut on a UTF-8
/// boundary.
pub fn write_error(
    writer: &mut dyn BufferWriter,
    message: &str,
    limits: &FrameLimits,
) -> std::io::Result<()> {
    let text = if message.is_empty() {
        EMPTY_ERROR_TEXT
    } else {
        truncate_utf8(message, limits.error_message_limit())
    };
    put_u32(writer, text.len() as u32)?;
    writer.write_str(text)
}

/// Write a successful response: an empty error field, then the reply payload.
pub fn write_reply<R: Encode + ?Sized>(
    writer: &mut dyn BufferWriter,
    reply: &R,
) -> std::io::Result<()> {
    put_u32(writer, 0)?;
    reply.encode_to(writer)
}

/// Read the error field of a response. `Some(message)` for an error frame,
/// `None` when a reply payload follows.
pub async fn read_response_header(
    reader: &mut dyn BufferReader,
    limits: &FrameLimits,
) -> Result<Option<String>> {
    let raw = reader
        .read_bytes(ERROR_LEN_SIZE)
        .await
        .map_err(|e| Error::transport("can't read error message's len", e))?;
    let len = u32::from_be_bytes(fixed::<ERROR_LEN_SIZE>(&raw)?) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > limits.error_message_limit() {
        return Err(Error::protocol(format!(
            "rpc: error message of {} bytes exceeds limit of {}",
            len,
            limits.error_message_limit()
        )));
    }

    let raw = reader
        .read_bytes(len)
        .await
        .map_err(|e| Error::transport("can't read error message", e))?;
    Ok(Some(String::from_utf8_lossy(&raw).into_owned()))
}

// =============================================================================
// Owned frames
// =============================================================================

/// A request frame held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub method: String,
    /// Caller-encoded argument bytes.
    pub payload: Bytes,
}

impl RequestFrame {
    pub fn new(method: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            method: method.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self, limits: &FrameLimits) -> Result<Bytes> {
        let mut buf =
            BytesMut::with_capacity(METHOD_LEN_SIZE + self.method.len() + self.payload.len());
        write_request(&mut buf, &self.method, &RawPayload(&self.payload), limits)?;
        Ok(buf.freeze())
    }

    pub async fn decode(mut frame: Bytes, limits: &FrameLimits) -> Result<Self> {
        let method = read_request_header(&mut frame, limits).await?;
        Ok(Self {
            method,
            payload: frame,
        })
    }
}

/// A response frame held in memory: an error XOR a reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    Error(String),
    Reply(Bytes),
}

impl ResponseFrame {
    pub fn encode(&self, limits: &FrameLimits) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let written = match self {
            ResponseFrame::Error(message) => write_error(&mut buf, message, limits),
            ResponseFrame::Reply(payload) => write_reply(&mut buf, &RawPayload(payload)),
        };
        written.map_err(|e| Error::transport("can't write response", e))?;
        Ok(buf.freeze())
    }

    pub async fn decode(mut frame: Bytes, limits: &FrameLimits) -> Result<Self> {
        match read_response_header(&mut frame, limits).await? {
            Some(_) if !frame.is_empty() => Err(Error::protocol(
                "rpc: response frame carries both an error and a payload",
            )),
            Some(message) => Ok(ResponseFrame::Error(message)),
            None => Ok(ResponseFrame::Reply(frame)),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn put_u32(writer: &mut dyn BufferWriter, value: u32) -> std::io::Result<()> {
    writer
        .reserve(4)
        .map(|buf| buf.copy_from_slice(&value.to_be_bytes()))
}

fn put_u64(writer: &mut dyn BufferWriter, value: u64) -> std::io::Result<()> {
    writer
        .reserve(8)
        .map(|buf| buf.copy_from_slice(&value.to_be_bytes()))
}

async fn get_u64(reader: &mut dyn BufferReader) -> std::io::Result<u64> {
    let raw = reader.read_bytes(8).await?;
    let bytes: [u8; 8] = raw[..].try_into().map_err(|_| short_read(8, raw.len()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn fixed<const N: usize>(raw: &[u8]) -> Result<[u8; N]> {
    raw.try_into()
        .map_err(|_| Error::transport("short read of length prefix", short_read(N, raw.len())))
}

fn short_read(want: usize, got: usize) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        format!("transport returned {} bytes, expected {}", got, want),
    )
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
