// Copyright (C) 2025 The bosun authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Line framing for agent messages.
//!
//! Each frame is one [`AgentMessage`] serialized as a single line of JSON,
//! terminated by `\n`. Blank lines are skipped.

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::AgentMessage;

/// Maximum frame size (8 MB)
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame exceeds [`MAX_FRAME_SIZE`].
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    /// Underlying stream failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Line is not a valid message.
    #[error("JSON decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Read the next message. Returns `Ok(None)` at end of stream.
///
/// An oversized line is consumed up to its terminator and reported as
/// [`FrameError::FrameTooLarge`], leaving the reader at the next frame.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<AgentMessage>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = read_bounded_line(reader, &mut line).await?;
        if read == 0 {
            return Ok(None);
        }
        if read > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(read));
        }
        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(Some(serde_json::from_slice(trimmed)?));
    }
}

/// Read one line into `line`, keeping at most `MAX_FRAME_SIZE + 1` bytes.
///
/// Returns the full length of the line including its terminator. Bytes past
/// the limit are consumed and dropped. Zero means end of stream.
async fn read_bounded_line<R>(reader: &mut R, line: &mut Vec<u8>) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut total = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(total);
        }
        let (used, done) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        let room = (MAX_FRAME_SIZE + 1).saturating_sub(line.len());
        line.extend_from_slice(&available[..used.min(room)]);
        reader.consume(used);
        total += used;
        if done {
            return Ok(total);
        }
    }
}

/// Write one message and flush.
pub async fn write_message<W>(writer: &mut W, message: &AgentMessage) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(message)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(bytes.len()));
    }
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
