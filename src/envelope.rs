//! Envelope wire format
//!
//! The unit of wire exchange: a fixed 20-byte header, a UTF-8 JSON meta
//! block, and an opaque binary payload.
//!
//! ```text
//! offset  size  content
//! 0       2     magic "~#"
//! 2       4     format tag "DF02"
//! 6       2     reserved (ignored on read)
//! 8       4     meta length, big-endian u32
//! 12      4     payload length, big-endian u32
//! 16      4     terminator "~#\r\n"
//! ```
//!
//! Synchronous and asynchronous codecs produce byte-identical frames.
//! Payloads above a configurable threshold are spilled to backing storage
//! instead of being held fully resident.

use std::io::{Read, Write};
use std::path::PathBuf;

use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::TaskmeshError;
use crate::meta::Meta;

pub const MAGIC: &[u8; 2] = b"~#";
pub const FORMAT_TAG: &[u8; 4] = b"DF02";
const RESERVED: &[u8; 2] = b"..";
pub const TERMINATOR: &[u8; 4] = b"~#\r\n";

/// Payloads above this many bytes are spilled to disk by default.
pub const MAX_INLINE_PAYLOAD: usize = 128 * 1024 * 1024;

/// Hard limit on the meta block. Meta is a command header, not a data
/// channel; a declared length beyond this rejects the frame before any
/// allocation happens.
pub const MAX_META_BLOCK: usize = 16 * 1024 * 1024;

/// Where and when payloads leave memory.
#[derive(Debug, Clone)]
pub struct SpillPolicy {
    pub threshold: usize,
    /// Spill directory; `None` means the system temp dir.
    pub dir: Option<PathBuf>,
}

impl Default for SpillPolicy {
    fn default() -> Self {
        Self {
            threshold: MAX_INLINE_PAYLOAD,
            dir: None,
        }
    }
}

impl SpillPolicy {
    fn spill(&self, data: &[u8]) -> Result<NamedTempFile, TaskmeshError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("taskmesh-payload-");
        let mut file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        file.write_all(data)?;
        file.flush()?;
        Ok(file)
    }
}

enum Payload {
    Inline(Vec<u8>),
    Spilled { file: NamedTempFile, len: usize },
}

impl Payload {
    fn len(&self) -> usize {
        match self {
            Payload::Inline(data) => data.len(),
            Payload::Spilled { len, .. } => *len,
        }
    }
}

/// A meta header plus an opaque binary payload.
pub struct Envelope {
    meta: Meta,
    payload: Payload,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("meta", &self.meta)
            .field("payload_len", &self.payload.len())
            .field("spilled", &matches!(self.payload, Payload::Spilled { .. }))
            .finish()
    }
}

impl Envelope {
    /// An envelope with an in-memory payload.
    pub fn new(meta: Meta, payload: Vec<u8>) -> Self {
        Self {
            meta,
            payload: Payload::Inline(payload),
        }
    }

    /// An envelope with no payload, meta only. The common case for the
    /// remote command protocol.
    pub fn from_meta(meta: Meta) -> Self {
        Self::new(meta, Vec::new())
    }

    /// Like [`Envelope::new`] but spilling the payload to backing storage
    /// when it exceeds the policy threshold.
    pub fn with_policy(
        meta: Meta,
        payload: Vec<u8>,
        policy: &SpillPolicy,
    ) -> Result<Self, TaskmeshError> {
        if payload.len() > policy.threshold {
            debug!(len = payload.len(), "spilling oversized payload");
            let file = policy.spill(&payload)?;
            return Ok(Self {
                meta,
                payload: Payload::Spilled {
                    file,
                    len: payload.len(),
                },
            });
        }
        Ok(Self::new(meta, payload))
    }

    pub fn meta(&self) -> &Meta {
        &self.meta
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.payload, Payload::Spilled { .. })
    }

    /// The payload bytes, re-read from backing storage when spilled.
    pub fn payload_bytes(&self) -> Result<Vec<u8>, TaskmeshError> {
        match &self.payload {
            Payload::Inline(data) => Ok(data.clone()),
            Payload::Spilled { file, .. } => Ok(std::fs::read(file.path())?),
        }
    }

    fn header_for(&self, meta_len: usize) -> Result<[u8; 20], TaskmeshError> {
        if meta_len > MAX_META_BLOCK {
            return Err(TaskmeshError::Protocol("meta block exceeds frame limit".into()));
        }
        if self.payload.len() > u32::MAX as usize {
            return Err(TaskmeshError::Protocol("payload exceeds frame limit".into()));
        }
        let mut header = [0u8; 20];
        header[0..2].copy_from_slice(MAGIC);
        header[2..6].copy_from_slice(FORMAT_TAG);
        header[6..8].copy_from_slice(RESERVED);
        header[8..12].copy_from_slice(&(meta_len as u32).to_be_bytes());
        header[12..16].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        header[16..20].copy_from_slice(TERMINATOR);
        Ok(header)
    }

    // ─────────────────────────────────────────────────────────────
    // Synchronous codec
    // ─────────────────────────────────────────────────────────────

    /// Stream the frame to a writer; spilled payloads are copied from
    /// backing storage without full residency.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), TaskmeshError> {
        let meta_bytes = serde_json::to_vec(&self.meta)?;
        writer.write_all(&self.header_for(meta_bytes.len())?)?;
        writer.write_all(&meta_bytes)?;
        match &self.payload {
            Payload::Inline(data) => writer.write_all(data)?,
            Payload::Spilled { file, .. } => {
                let mut source = std::fs::File::open(file.path())?;
                std::io::copy(&mut source, writer)?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    /// The whole frame as one buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, TaskmeshError> {
        let mut buffer = Vec::with_capacity(20 + self.payload.len());
        self.write_to(&mut buffer)?;
        Ok(buffer)
    }

    /// Decode one frame from a reader using the default spill policy.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Envelope, TaskmeshError> {
        Self::read_from_with(reader, &SpillPolicy::default())
    }

    pub fn read_from_with<R: Read>(
        reader: &mut R,
        policy: &SpillPolicy,
    ) -> Result<Envelope, TaskmeshError> {
        let mut header = [0u8; 20];
        read_exact_frame(reader, &mut header)?;
        let (meta_len, payload_len) = parse_header(&header)?;

        let mut meta_bytes = vec![0u8; meta_len];
        read_exact_frame(reader, &mut meta_bytes)?;
        let meta = decode_meta(&meta_bytes)?;

        if payload_len > policy.threshold {
            debug!(len = payload_len, "spilling oversized incoming payload");
            let mut builder = tempfile::Builder::new();
            builder.prefix("taskmesh-payload-");
            let mut file = match &policy.dir {
                Some(dir) => builder.tempfile_in(dir)?,
                None => builder.tempfile()?,
            };
            let copied = std::io::copy(&mut reader.take(payload_len as u64), &mut file)?;
            if copied as usize != payload_len {
                return Err(TaskmeshError::Protocol("truncated frame".into()));
            }
            file.flush()?;
            return Ok(Envelope {
                meta,
                payload: Payload::Spilled {
                    file,
                    len: payload_len,
                },
            });
        }

        let mut payload = vec![0u8; payload_len];
        read_exact_frame(reader, &mut payload)?;
        Ok(Envelope::new(meta, payload))
    }

    // ─────────────────────────────────────────────────────────────
    // Asynchronous codec
    // ─────────────────────────────────────────────────────────────

    /// Stream the frame to an async writer. Produces exactly the bytes of
    /// [`Envelope::write_to`].
    pub async fn async_write_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
    ) -> Result<(), TaskmeshError> {
        let meta_bytes = serde_json::to_vec(&self.meta)?;
        writer.write_all(&self.header_for(meta_bytes.len())?).await?;
        writer.write_all(&meta_bytes).await?;
        match &self.payload {
            Payload::Inline(data) => writer.write_all(data).await?,
            Payload::Spilled { file, .. } => {
                let mut source = tokio::fs::File::open(file.path()).await?;
                tokio::io::copy(&mut source, writer).await?;
            }
        }
        writer.flush().await?;
        Ok(())
    }

    /// Decode one frame from an async reader using the default policy.
    pub async fn async_read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> Result<Envelope, TaskmeshError> {
        Self::async_read_from_with(reader, &SpillPolicy::default()).await
    }

    pub async fn async_read_from_with<R: AsyncRead + Unpin>(
        reader: &mut R,
        policy: &SpillPolicy,
    ) -> Result<Envelope, TaskmeshError> {
        let mut header = [0u8; 20];
        async_read_exact_frame(reader, &mut header).await?;
        let (meta_len, payload_len) = parse_header(&header)?;

        let mut meta_bytes = vec![0u8; meta_len];
        async_read_exact_frame(reader, &mut meta_bytes).await?;
        let meta = decode_meta(&meta_bytes)?;

        if payload_len > policy.threshold {
            let mut builder = tempfile::Builder::new();
            builder.prefix("taskmesh-payload-");
            let mut file = match &policy.dir {
                Some(dir) => builder.tempfile_in(dir)?,
                None => builder.tempfile()?,
            };
            let mut remaining = payload_len;
            let mut chunk = vec![0u8; 64 * 1024];
            while remaining > 0 {
                let want = remaining.min(chunk.len());
                let got = reader.read(&mut chunk[..want]).await?;
                if got == 0 {
                    return Err(TaskmeshError::Protocol("truncated frame".into()));
                }
                file.write_all(&chunk[..got])?;
                remaining -= got;
            }
            file.flush()?;
            return Ok(Envelope {
                meta,
                payload: Payload::Spilled {
                    file,
                    len: payload_len,
                },
            });
        }

        let mut payload = vec![0u8; payload_len];
        async_read_exact_frame(reader, &mut payload).await?;
        Ok(Envelope::new(meta, payload))
    }
}

fn parse_header(header: &[u8; 20]) -> Result<(usize, usize), TaskmeshError> {
    if &header[0..2] != MAGIC {
        return Err(TaskmeshError::Protocol("bad magic".into()));
    }
    if &header[2..6] != FORMAT_TAG {
        return Err(TaskmeshError::Protocol("bad format tag".into()));
    }
    // header[6..8] reserved, ignored
    if &header[16..20] != TERMINATOR {
        return Err(TaskmeshError::Protocol("bad terminator".into()));
    }
    let meta_len = u32::from_be_bytes(header[8..12].try_into().expect("slice of 4")) as usize;
    let payload_len = u32::from_be_bytes(header[12..16].try_into().expect("slice of 4")) as usize;
    if meta_len > MAX_META_BLOCK {
        return Err(TaskmeshError::Protocol("meta block exceeds frame limit".into()));
    }
    Ok((meta_len, payload_len))
}

/// Parse the meta block. Strict JSON first; a retry normalizes single
/// quotes to double quotes for tolerance toward hand-written headers.
fn decode_meta(bytes: &[u8]) -> Result<Meta, TaskmeshError> {
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return Meta::from_value(value)
            .ok_or_else(|| TaskmeshError::Protocol("meta block is not an object".into()));
    }
    let normalized: Vec<u8> = bytes
        .iter()
        .map(|&b| if b == b'\'' { b'"' } else { b })
        .collect();
    let value = serde_json::from_slice::<Value>(&normalized)
        .map_err(|e| TaskmeshError::Protocol(format!("unreadable meta block: {e}")))?;
    Meta::from_value(value)
        .ok_or_else(|| TaskmeshError::Protocol("meta block is not an object".into()))
}

fn read_exact_frame<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), TaskmeshError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => TaskmeshError::Protocol("truncated frame".into()),
        _ => TaskmeshError::Io(e),
    })
}

async fn async_read_exact_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), TaskmeshError> {
    reader.read_exact(buf).await.map(|_| ()).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => TaskmeshError::Protocol("truncated frame".into()),
        _ => TaskmeshError::Io(e),
    })
}
