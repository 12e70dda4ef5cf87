//! Line framing over async byte streams.
//!
//! Frames are newline-delimited. The reader enforces the configured size
//! bound while it accumulates, so a peer cannot balloon memory by omitting
//! the newline; an over-long line is drained to its terminator and reported
//! as [`ReadOutcome::Oversized`] without desynchronizing the stream.

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::envelope::Frame;
use crate::error::ProtoError;

/// Result of one read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete line, newline stripped.
    Line(String),
    /// The line exceeded the frame bound and was discarded.
    Oversized,
    /// The peer closed the stream.
    Eof,
}

pub struct FrameReader<R> {
    inner: BufReader<R>,
    max_frame: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            max_frame,
            buf: Vec::new(),
        }
    }

    /// Read the next newline-terminated line, bounded by `max_frame` bytes.
    pub async fn next(&mut self) -> std::io::Result<ReadOutcome> {
        self.buf.clear();
        let mut discarding = false;
        loop {
            let chunk = self.inner.fill_buf().await?;
            if chunk.is_empty() {
                // EOF. A dangling partial line is dropped; frames are only
                // complete at their newline.
                return Ok(ReadOutcome::Eof);
            }
            match chunk.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    if !discarding {
                        self.buf.extend_from_slice(&chunk[..pos]);
                    }
                    self.inner.consume(pos + 1);
                    if discarding || self.buf.len() > self.max_frame {
                        return Ok(ReadOutcome::Oversized);
                    }
                    let line = String::from_utf8_lossy(&self.buf).trim().to_string();
                    return Ok(ReadOutcome::Line(line));
                }
                None => {
                    let len = chunk.len();
                    if !discarding {
                        self.buf.extend_from_slice(chunk);
                        if self.buf.len() > self.max_frame {
                            discarding = true;
                            self.buf.clear();
                        }
                    }
                    self.inner.consume(len);
                }
            }
        }
    }
}

/// Write one frame followed by a newline and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ProtoError> {
    let line = frame.to_json()?;
    write_line(writer, &line).await
}

/// Write a pre-serialized line (used for verbatim forwarding and queued
/// envelope replay).
pub async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: &str,
) -> Result<(), ProtoError> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(io_to_proto)?;
    writer.write_all(b"\n").await.map_err(io_to_proto)?;
    writer.flush().await.map_err(io_to_proto)?;
    Ok(())
}

fn io_to_proto(e: std::io::Error) -> ProtoError {
    ProtoError::Malformed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_lines_in_order() {
        let data: &[u8] = b"one\ntwo\nthree\n";
        let mut reader = FrameReader::new(data, 1024);
        for expected in ["one", "two", "three"] {
            match reader.next().await.unwrap() {
                ReadOutcome::Line(line) => assert_eq!(line, expected),
                other => panic!("expected line, got {other:?}"),
            }
        }
        assert!(matches!(reader.next().await.unwrap(), ReadOutcome::Eof));
    }

    #[tokio::test]
    async fn oversized_line_is_drained_not_fatal() {
        let mut data = vec![b'x'; 300];
        data.push(b'\n');
        data.extend_from_slice(b"ok\n");
        let mut reader = FrameReader::new(data.as_slice(), 128);
        assert!(matches!(
            reader.next().await.unwrap(),
            ReadOutcome::Oversized
        ));
        match reader.next().await.unwrap() {
            ReadOutcome::Line(line) => assert_eq!(line, "ok"),
            other => panic!("expected line, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_dropped() {
        let data: &[u8] = b"complete\nincomplete";
        let mut reader = FrameReader::new(data, 1024);
        assert!(matches!(
            reader.next().await.unwrap(),
            ReadOutcome::Line(l) if l == "complete"
        ));
        assert!(matches!(reader.next().await.unwrap(), ReadOutcome::Eof));
    }

    #[tokio::test]
    async fn write_then_parse_roundtrip() {
        let mut out = Vec::new();
        let frame = Frame::error("nope");
        write_frame(&mut out, &frame).await.unwrap();
        assert_eq!(out.last(), Some(&b'\n'));
        let line = String::from_utf8(out).unwrap();
        let parsed = Frame::parse(line.trim()).unwrap();
        assert_eq!(parsed.payload.tag(), "error");
    }
}
