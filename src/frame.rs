//! The two wire framings used on the agent's sockets:
//!
//! - Control frame: `code: u32 BE`, `length: u32 BE` (header-inclusive),
//!   then `length - 8` bytes of body.
//! - TTY frame: `session: u64 BE`, `length: u32 BE` (header-inclusive), then
//!   `length - 12` bytes of body.
//!
//! Both are also used verbatim on a client's stdio socket: a session's tty
//! stream and the agent's I/O channel speak the identical framing, so the
//! demuxer can forward bytes between them without re-parsing.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::VmError;

pub const CTL_HEADER_LEN: usize = 8;
pub const TTY_HEADER_LEN: usize = 12;

/// Hard cap matching hyperstart's receive buffer (`src/init.c`, `rbuf_size`).
pub const MAX_FRAME_LEN: usize = 10240;

/// A decoded control-channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlFrame {
    pub code: u32,
    pub body: Vec<u8>,
}

/// A decoded tty-channel message, identified by session sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtyFrame {
    pub session: u64,
    pub body: Vec<u8>,
}

impl TtyFrame {
    /// Encodes this frame back to its wire form (header + body).
    pub fn encode(&self) -> Vec<u8> {
        encode_tty_frame(self.session, &self.body)
    }
}

/// Reads one control frame, or `None` on a clean EOF before any bytes arrive.
///
/// Handles short reads transparently: `AsyncReadExt::read_exact` keeps
/// reading until the requested length is assembled or the stream ends.
pub async fn read_ctl_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<CtlFrame>> {
    let mut first = [0u8; 1];
    match reader.read(&mut first).await? {
        0 => return Ok(None),
        _ => {}
    }

    let mut header = [0u8; CTL_HEADER_LEN];
    header[0] = first[0];
    reader.read_exact(&mut header[1..]).await?;

    let code = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let length = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;
    let body_len = length.saturating_sub(CTL_HEADER_LEN);

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    Ok(Some(CtlFrame { code, body }))
}

/// Writes one control frame. Fails with [`VmError::MessageTooLong`] if the
/// encoded length would exceed [`MAX_FRAME_LEN`].
pub async fn write_ctl_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    code: u32,
    body: &[u8],
) -> Result<(), VmError> {
    let length = CTL_HEADER_LEN + body.len();
    if length > MAX_FRAME_LEN {
        return Err(VmError::MessageTooLong(length));
    }

    let mut frame = Vec::with_capacity(length);
    frame.extend_from_slice(&code.to_be_bytes());
    frame.extend_from_slice(&(length as u32).to_be_bytes());
    frame.extend_from_slice(body);

    writer.write_all(&frame).await?;
    Ok(())
}

/// Reads one tty frame, or `None` on a clean EOF before any bytes arrive.
pub async fn read_tty_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<TtyFrame>> {
    let mut first = [0u8; 1];
    match reader.read(&mut first).await? {
        0 => return Ok(None),
        _ => {}
    }

    let mut header = [0u8; TTY_HEADER_LEN];
    header[0] = first[0];
    reader.read_exact(&mut header[1..]).await?;

    let session = u64::from_be_bytes(header[0..8].try_into().unwrap());
    let length = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
    let body_len = length.saturating_sub(TTY_HEADER_LEN);

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body).await?;

    Ok(Some(TtyFrame { session, body }))
}

pub fn encode_tty_frame(session: u64, body: &[u8]) -> Vec<u8> {
    let length = TTY_HEADER_LEN + body.len();
    let mut frame = Vec::with_capacity(length);
    frame.extend_from_slice(&session.to_be_bytes());
    frame.extend_from_slice(&(length as u32).to_be_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Writes one tty frame in a single `write_all` call, relying on the
/// underlying stream's per-call write atomicity.
pub async fn write_tty_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    session: u64,
    body: &[u8],
) -> Result<(), VmError> {
    let length = TTY_HEADER_LEN + body.len();
    if length > MAX_FRAME_LEN {
        return Err(VmError::MessageTooLong(length));
    }
    writer.write_all(&encode_tty_frame(session, body)).await?;
    Ok(())
}
