//! Binary frame codec.
//!
//! Frames are an 11-byte header followed by the JSON payload:
//!
//! ```text
//! +--------+---------+--------+----------+-------------+-----------------+
//! | "pb"   | 1, 0    | status | 0, 0     | len (4 LE)  |  JSON payload   |
//! +--------+---------+--------+----------+-------------+-----------------+
//! ```
//!
//! The length field always counts the serialized UTF-8 bytes of the payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{Frame, StatusCode};
use crate::{HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE, VERSION};

fn check_magic(magic: [u8; 2]) -> ProtocolResult<()> {
    if magic != MAGIC {
        return Err(ProtocolError::malformed(format!(
            "bad magic {:#04x} {:#04x}",
            magic[0], magic[1]
        )));
    }
    Ok(())
}

fn check_version(version: [u8; 2]) -> ProtocolResult<()> {
    if version != VERSION {
        return Err(ProtocolError::IncompatibleVersion {
            major: version[0],
            minor: version[1],
        });
    }
    Ok(())
}

fn check_length(len: u32) -> ProtocolResult<usize> {
    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(len as usize)
}

/// Encodes a frame to bytes.
///
/// Returns the complete frame ready for transmission.
///
/// # Example
///
/// ```rust
/// use procbridge_protocol::{encode_frame, Frame, RequestPayload};
///
/// let frame = Frame::request(&RequestPayload::new("gettime", 1));
/// let bytes = encode_frame(&frame).unwrap();
/// assert_eq!(&bytes[0..2], b"pb");
/// ```
pub fn encode_frame(frame: &Frame) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(&frame.payload)?;
    let len = u32::try_from(json.len()).unwrap_or(u32::MAX);

    if len > MAX_PAYLOAD_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_PAYLOAD_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(HEADER_SIZE + json.len());
    buffer.extend_from_slice(&MAGIC);
    buffer.extend_from_slice(&VERSION);
    buffer.push(frame.status.as_byte());
    buffer.extend_from_slice(&[0, 0]);
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(&json);
    Ok(buffer)
}

/// Decodes one complete frame from a byte buffer.
///
/// Trailing bytes after the frame are ignored.
pub fn decode_frame(data: &[u8]) -> ProtocolResult<Frame> {
    if data.len() < HEADER_SIZE {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_SIZE,
            received: data.len(),
        });
    }

    check_magic([data[0], data[1]])?;
    check_version([data[2], data[3]])?;
    let status = StatusCode::try_from(data[4])?;
    let len = check_length(u32::from_le_bytes([data[7], data[8], data[9], data[10]]))?;

    if data.len() < HEADER_SIZE + len {
        return Err(ProtocolError::IncompleteFrame {
            expected: HEADER_SIZE + len,
            received: data.len(),
        });
    }

    let payload = serde_json::from_slice(&data[HEADER_SIZE..HEADER_SIZE + len])?;
    Ok(Frame::new(status, payload))
}

/// Reads frames from an async byte stream.
///
/// Each header field is validated as soon as it has been read, so a peer
/// sending garbage is rejected without waiting for a full header.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a new FrameReader wrapping the given reader.
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Reads a single frame.
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] if the stream ends before
    /// the first byte and [`ProtocolError::IncompleteFrame`] if it ends
    /// inside a frame.
    pub async fn read_frame(&mut self) -> ProtocolResult<Frame> {
        let mut received = 0;

        let mut magic = [0u8; 2];
        self.fill(&mut magic, &mut received, HEADER_SIZE).await?;
        check_magic(magic)?;

        let mut version = [0u8; 2];
        self.fill(&mut version, &mut received, HEADER_SIZE).await?;
        check_version(version)?;

        let mut status = [0u8; 1];
        self.fill(&mut status, &mut received, HEADER_SIZE).await?;
        let status = StatusCode::try_from(status[0])?;

        let mut reserved = [0u8; 2];
        self.fill(&mut reserved, &mut received, HEADER_SIZE).await?;

        let mut len_buf = [0u8; 4];
        self.fill(&mut len_buf, &mut received, HEADER_SIZE).await?;
        let len = check_length(u32::from_le_bytes(len_buf))?;

        let mut payload = vec![0u8; len];
        self.fill(&mut payload, &mut received, HEADER_SIZE + len)
            .await?;

        trace!(status = ?status, len, "frame read");
        let payload = serde_json::from_slice(&payload)?;
        Ok(Frame::new(status, payload))
    }

    /// Fills `buf` completely, accumulating partial reads.
    async fn fill(
        &mut self,
        buf: &mut [u8],
        received: &mut usize,
        expected: usize,
    ) -> ProtocolResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(if *received == 0 {
                    ProtocolError::ConnectionClosed
                } else {
                    ProtocolError::IncompleteFrame {
                        expected,
                        received: *received,
                    }
                });
            }
            filled += n;
            *received += n;
        }
        Ok(())
    }

    /// Returns a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.reader
    }
}

/// Writes frames to an async byte stream.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a new FrameWriter wrapping the given writer.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes a single frame and flushes it.
    ///
    /// The frame is encoded up front and handed to the stream in one
    /// `write_all`, so the caller only has to serialize whole calls.
    pub async fn write_frame(&mut self, frame: &Frame) -> ProtocolResult<()> {
        let data = encode_frame(frame)?;
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        trace!(status = ?frame.status, len = data.len() - HEADER_SIZE, "frame written");
        Ok(())
    }

    /// Shuts down the write side of the stream.
    pub async fn shutdown(&mut self) -> ProtocolResult<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    /// Unwraps this FrameWriter, returning the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RequestPayload, ResponsePayload, into_body};
    use serde_json::json;

    fn echo_request() -> Frame {
        Frame::request(&RequestPayload::new("echo", 1).with_arg("echo", "X"))
    }

    #[test]
    fn encode_header_layout() {
        let frame = Frame::new(StatusCode::ErrorResponse, json!({}));
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(bytes, vec![b'p', b'b', 1, 0, 3, 0, 0, 2, 0, 0, 0, b'{', b'}']);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let frames = vec![
            echo_request(),
            ResponsePayload::good(1, into_body(json!("Hello:X"))).to_frame(),
            ResponsePayload::push(into_body(json!({ "element": 1 }))).to_frame(),
            ResponsePayload::bad(-1, "malformed data").to_frame(),
            ResponsePayload::error(4, "shit happened").to_frame(),
        ];

        for frame in frames {
            let bytes = encode_frame(&frame).unwrap();
            assert_eq!(decode_frame(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn length_counts_bytes_not_chars() {
        let frame = Frame::request(&RequestPayload::new("echo", 1).with_arg("echo", "héllo wörld ✓"));
        let bytes = encode_frame(&frame).unwrap();

        let len = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;
        let json = serde_json::to_string(&frame.payload).unwrap();
        assert_eq!(len, bytes.len() - HEADER_SIZE);
        assert_eq!(len, json.len());
        assert!(len > json.chars().count());

        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn decode_incomplete_header() {
        let result = decode_frame(b"pb\x01");
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteFrame {
                expected: HEADER_SIZE,
                received: 3
            })
        ));
    }

    #[test]
    fn decode_incomplete_payload() {
        let mut bytes = encode_frame(&echo_request()).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::IncompleteFrame { .. })
        ));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut bytes = encode_frame(&echo_request()).unwrap();
        bytes[0] = b'x';
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_bad_version() {
        let mut bytes = encode_frame(&echo_request()).unwrap();
        bytes[2] = 2;
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::IncompatibleVersion { major: 2, minor: 0 })
        ));
    }

    #[test]
    fn decode_rejects_bad_status() {
        let mut bytes = encode_frame(&echo_request()).unwrap();
        bytes[4] = 7;
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::InvalidStatusCode(7))
        ));
    }

    #[test]
    fn decode_ignores_reserved_bytes() {
        let mut bytes = encode_frame(&echo_request()).unwrap();
        bytes[5] = 0xff;
        bytes[6] = 0x01;
        assert_eq!(decode_frame(&bytes).unwrap(), echo_request());
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let mut bytes = encode_frame(&echo_request()).unwrap();
        bytes[7..11].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_le_bytes());
        assert!(matches!(
            decode_frame(&bytes),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn reader_multiple_frames() {
        let first = echo_request();
        let second = ResponsePayload::push(into_body(json!({ "element": 2 }))).to_frame();

        let mut bytes = encode_frame(&first).unwrap();
        bytes.extend(encode_frame(&second).unwrap());

        let mut reader = FrameReader::new(bytes.as_slice());
        assert_eq!(reader.read_frame().await.unwrap(), first);
        assert_eq!(reader.read_frame().await.unwrap(), second);
        assert!(matches!(
            reader.read_frame().await,
            Err(ProtocolError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn reader_empty_stream_is_disconnect() {
        let mut reader = FrameReader::new(&b""[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn reader_truncated_stream_is_incomplete() {
        let bytes = encode_frame(&echo_request()).unwrap();
        let total = bytes.len();
        let mut reader = FrameReader::new(&bytes[..total - 1]);
        match reader.read_frame().await {
            Err(ProtocolError::IncompleteFrame { expected, received }) => {
                assert_eq!(expected, total);
                assert_eq!(received, total - 1);
            }
            other => panic!("expected IncompleteFrame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reader_accumulates_partial_reads() {
        let frame = echo_request();
        let bytes = encode_frame(&frame).unwrap();

        // A one-byte pipe forces every field to arrive in pieces.
        let (client, server) = tokio::io::duplex(1);
        let writer = tokio::spawn(async move {
            let mut client = client;
            client.write_all(&bytes).await.unwrap();
        });

        let mut reader = FrameReader::new(server);
        assert_eq!(reader.read_frame().await.unwrap(), frame);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn reader_rejects_bad_magic_without_waiting() {
        let (mut client, server) = tokio::io::duplex(64);
        // Only two bytes are sent and the stream stays open.
        client.write_all(b"xx").await.unwrap();

        let mut reader = FrameReader::new(server);
        let err = reader.read_frame().await.unwrap_err();
        assert!(err.is_framing());
        drop(client);
    }

    #[tokio::test]
    async fn writer_reader_roundtrip() {
        let frames = vec![
            echo_request(),
            ResponsePayload::good(1, into_body(json!({ "result": 6 }))).to_frame(),
        ];

        let mut writer = FrameWriter::new(Vec::new());
        for frame in &frames {
            writer.write_frame(frame).await.unwrap();
        }
        let buffer = writer.into_inner();

        let mut reader = FrameReader::new(buffer.as_slice());
        for expected in &frames {
            assert_eq!(&reader.read_frame().await.unwrap(), expected);
        }
    }
}
