//! Length-prefixed framing over the server's stdio stream.
//!
//! Each frame is an ASCII header block terminated by a blank line and
//! containing a `Content-Length` field, followed by exactly that many
//! bytes of UTF-8 JSON. [`FrameReader`] tolerates arbitrary chunk
//! boundaries: the buffered reader retains partial headers and partial
//! payloads between calls and yields a message only once a full frame is
//! available.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::CodecError;

/// Upper bound on a single frame's payload (4 MiB).
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Decodes frames from an async byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read the next frame. Returns `Ok(None)` on EOF at a frame boundary.
    ///
    /// Any header or payload error poisons the connection: the decoder has
    /// no way to find the next frame boundary, so the caller must restart
    /// the session.
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>, CodecError> {
        let Some(len) = self.read_header_block().await? else {
            return Ok(None);
        };

        if len > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge {
                len,
                max: MAX_FRAME_BYTES,
            });
        }

        let mut payload = vec![0u8; len];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => CodecError::MalformedFrame(format!(
                    "stream ended inside a {len}-byte payload"
                )),
                _ => CodecError::Io(e),
            })?;

        let value = serde_json::from_slice(&payload)
            .map_err(|e| CodecError::MalformedFrame(format!("payload is not valid JSON: {e}")))?;
        Ok(Some(value))
    }

    /// Parse header lines until the blank separator, returning the payload
    /// length. `Ok(None)` only when EOF arrives before any header byte.
    async fn read_header_block(&mut self) -> Result<Option<usize>, CodecError> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut in_frame = false;

        loop {
            line.clear();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                if in_frame {
                    return Err(CodecError::MalformedFrame(
                        "stream ended inside a header block".to_string(),
                    ));
                }
                return Ok(None);
            }
            in_frame = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            // Header keys are matched case-insensitively; unknown headers
            // (Content-Type and friends) are skipped.
            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("content-length")
            {
                let parsed = value.trim().parse().map_err(|_| {
                    CodecError::MalformedFrame(format!(
                        "non-numeric Content-Length {:?}",
                        value.trim()
                    ))
                })?;
                content_length = Some(parsed);
            }
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => Err(CodecError::MalformedFrame(
                "header block has no Content-Length".to_string(),
            )),
        }
    }
}

/// Encodes frames onto an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one frame. Encoding never fails for a well-formed `Value`;
    /// errors here are I/O on the connection.
    pub async fn write_frame(&mut self, message: &serde_json::Value) -> Result<(), CodecError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
