//! Content-Length framing over async byte streams.
//!
//! LSP frames JSON-RPC as `Content-Length: N\r\n\r\n{json}` on the child's
//! standard streams. [`FrameReader`] buffers until a complete frame is
//! available, so messages split across I/O chunks are reassembled; partial
//! writes are absorbed by `write_all`. Framing failures are
//! [`BridgeError::MalformedFrame`] and terminate the session.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{BridgeError, Result};

/// Frames above this size (4 MiB) are rejected rather than buffered.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Decodes length-prefixed JSON-RPC frames from an async reader.
pub struct FrameReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// Any header/length mismatch, truncation, or undecodable body is a
    /// [`BridgeError::MalformedFrame`].
    pub async fn read_frame(&mut self) -> Result<Option<serde_json::Value>> {
        let content_length = match self.read_headers().await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if content_length > MAX_FRAME_BYTES {
            return Err(BridgeError::malformed(format!(
                "Content-Length {content_length} exceeds maximum {MAX_FRAME_BYTES}"
            )));
        }

        let mut body = vec![0u8; content_length];
        self.reader.read_exact(&mut body).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                BridgeError::malformed("EOF before declared Content-Length was read")
            } else {
                BridgeError::Io(e)
            }
        })?;

        let value = serde_json::from_slice(&body)
            .map_err(|e| BridgeError::malformed(format!("frame body is not valid JSON: {e}")))?;
        Ok(Some(value))
    }

    /// Parse headers up to the empty separator line.
    ///
    /// Returns the Content-Length value, or `None` on EOF before any header
    /// byte was seen.
    async fn read_headers(&mut self) -> Result<Option<usize>> {
        let mut content_length: Option<usize> = None;
        let mut line = String::new();
        let mut saw_any_header_bytes = false;

        loop {
            line.clear();
            let bytes_read = self.reader.read_line(&mut line).await?;

            if bytes_read == 0 {
                // EOF mid-headers is truncation, not a clean shutdown.
                if !saw_any_header_bytes {
                    return Ok(None);
                }
                return Err(BridgeError::malformed("EOF while reading frame headers"));
            }
            saw_any_header_bytes = true;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                break;
            }

            // Parsed case-insensitively; servers vary in header casing.
            if let Some(colon_pos) = trimmed.find(':') {
                let key = &trimmed[..colon_pos];
                if key.eq_ignore_ascii_case("Content-Length") {
                    let len: usize = trimmed[colon_pos + 1..].trim().parse().map_err(|_| {
                        BridgeError::malformed(format!("invalid Content-Length: {trimmed}"))
                    })?;
                    content_length = Some(len);
                }
            }
            // Other headers (e.g. Content-Type) are ignored.
        }

        match content_length {
            Some(len) => Ok(Some(len)),
            None => Err(BridgeError::malformed("missing Content-Length header")),
        }
    }
}

/// Encodes JSON-RPC frames with a Content-Length prefix.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Serialize `msg` and write one complete frame, flushing afterwards.
    /// The header declares the body's byte length, not its character count.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_string(msg)?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());

        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(body.as_bytes()).await?;
        self.writer.flush().await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let msg = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": { "uri": "file:///notes.md" }
        });

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result, msg);
    }

    #[tokio::test]
    async fn test_header_declares_exact_body_length() {
        let msg = serde_json::json!({"k": "é"});
        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg).await.unwrap();

        let body = serde_json::to_string(&msg).unwrap();
        let output = String::from_utf8(buf).unwrap();
        // Byte count, not character count: "é" is two bytes.
        assert!(output.starts_with(&format!("Content-Length: {}\r\n\r\n", body.len())));
        assert!(output.ends_with(&body));
    }

    #[tokio::test]
    async fn test_multiple_frames() {
        let msg1 = serde_json::json!({"jsonrpc": "2.0", "id": 1});
        let msg2 = serde_json::json!({"jsonrpc": "2.0", "id": 2});

        let mut buf = Vec::new();
        let mut writer = FrameWriter::new(&mut buf);
        writer.write_frame(&msg1).await.unwrap();
        writer.write_frame(&msg2).await.unwrap();

        let mut reader = FrameReader::new(buf.as_slice());
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg1);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), msg2);
    }

    #[tokio::test]
    async fn test_frame_split_across_chunks() {
        // tokio's duplex stream has a tiny internal buffer, so a frame
        // larger than it must arrive split across reads.
        let msg = serde_json::json!({"payload": "x".repeat(4096)});
        let (client, server) = tokio::io::duplex(64);

        let writer_task = tokio::spawn(async move {
            let mut writer = FrameWriter::new(client);
            writer.write_frame(&msg).await.unwrap();
            msg
        });

        let mut reader = FrameReader::new(server);
        let received = reader.read_frame().await.unwrap().unwrap();
        let sent = writer_task.await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn test_eof_returns_none() {
        let buf: &[u8] = b"";
        let mut reader = FrameReader::new(buf);
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_content_length_is_malformed() {
        let buf: &[u8] = b"Content-Type: application/json\r\n\r\n{}";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await.unwrap_err(),
            BridgeError::MalformedFrame { .. }
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_headers_is_malformed() {
        let buf: &[u8] = b"Content-Length: 10\r\n";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await.unwrap_err(),
            BridgeError::MalformedFrame { .. }
        ));
    }

    #[tokio::test]
    async fn test_eof_mid_body_is_malformed() {
        // Header declares 100 bytes but only 5 follow.
        let buf: &[u8] = b"Content-Length: 100\r\n\r\nhello";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await.unwrap_err(),
            BridgeError::MalformedFrame { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_content_length_value() {
        let buf: &[u8] = b"Content-Length: not_a_number\r\n\r\n";
        let mut reader = FrameReader::new(buf);
        assert!(matches!(
            reader.read_frame().await.unwrap_err(),
            BridgeError::MalformedFrame { .. }
        ));
    }

    #[tokio::test]
    async fn test_invalid_json_body_is_malformed() {
        let body = b"not valid json!!!";
        let mut buf = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
        buf.extend_from_slice(body);

        let mut reader = FrameReader::new(buf.as_slice());
        assert!(matches!(
            reader.read_frame().await.unwrap_err(),
            BridgeError::MalformedFrame { .. }
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        let mut reader = FrameReader::new(header.as_bytes());
        assert!(matches!(
            reader.read_frame().await.unwrap_err(),
            BridgeError::MalformedFrame { .. }
        ));
    }

    #[tokio::test]
    async fn test_case_insensitive_content_length() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!("content-length: {}\r\n\r\n{body}", body.len());

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["id"], 1);
    }

    #[tokio::test]
    async fn test_ignores_extra_headers() {
        let body = r#"{"jsonrpc":"2.0","id":1}"#;
        let frame = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n{body}",
            body.len(),
        );

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["id"], 1);
    }

    #[tokio::test]
    async fn test_multibyte_utf8_body() {
        let body = r#"{"k":"é"}"#;
        assert_eq!(body.len(), 10);
        let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());

        let mut reader = FrameReader::new(frame.as_bytes());
        let result = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(result["k"], "é");
    }
}
